//! Control records carried in the packet control region
//!
//! When a packet's `has_control` flag is set, a sequence of typed control
//! records follows the data portion of the payload. Each record is
//! tag-prefixed with a one-byte length, so decoders skip unknown tags by
//! length instead of failing.
//!
//! ## Example
//!
//! ```rust
//! use wren_core::control::ControlMsg;
//! use wren_core::types::Seq;
//!
//! let mut region = Vec::new();
//! ControlMsg::Nak { seq: Seq(7) }.encode(&mut region);
//! ControlMsg::SelectiveAck { begin: Seq(9), end: Seq(12) }.encode(&mut region);
//!
//! let msgs: Vec<_> = ControlMsg::iter(&region).collect();
//! assert_eq!(msgs.len(), 2);
//! ```

use crate::clock::MonoTime;
use crate::types::{NodeId, Seq};

const TAG_HELLO: u8 = 0x01;
const TAG_TIMESTAMP: u8 = 0x02;
const TAG_TIMESTAMP_ECHO: u8 = 0x03;
const TAG_RECEIVER_STATS: u8 = 0x04;
const TAG_NAK: u8 = 0x05;
const TAG_SELECTIVE_ACK: u8 = 0x06;
const TAG_SET_UNACK: u8 = 0x07;

/// A typed control record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlMsg {
    /// Neighbor announcement.
    Hello { is_gateway: bool },
    /// Transmission time of this packet at the transmitter.
    Timestamp { t_sent: MonoTime },
    /// Echo of a timestamp previously received from `node`.
    TimestampEcho {
        node: NodeId,
        t_sent: MonoTime,
        t_recv: MonoTime,
    },
    /// Long-term link quality at the receiver.
    ReceiverStats { long_evm: f64, long_rssi: f64 },
    /// Explicit negative acknowledgement of one sequence number.
    Nak { seq: Seq },
    /// A contiguous received run `[begin, end)` above the cumulative ACK.
    SelectiveAck { begin: Seq, end: Seq },
    /// Sender's first un-ACKed sequence after a local window advance.
    SetUnack { unack: Seq },
}

fn put_time(out: &mut Vec<u8>, t: MonoTime) {
    out.extend_from_slice(&t.full_secs().to_le_bytes());
    out.extend_from_slice(&t.frac_secs().to_le_bytes());
}

fn get_time(bytes: &[u8]) -> MonoTime {
    let secs = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let frac = f64::from_le_bytes(bytes[8..16].try_into().unwrap());
    MonoTime::from_parts(secs, frac)
}

impl ControlMsg {
    /// Encoded size of this record, including the tag and length prefix.
    pub fn encoded_len(&self) -> usize {
        2 + self.body_len()
    }

    fn body_len(&self) -> usize {
        match self {
            ControlMsg::Hello { .. } => 1,
            ControlMsg::Timestamp { .. } => 16,
            ControlMsg::TimestampEcho { .. } => 33,
            ControlMsg::ReceiverStats { .. } => 16,
            ControlMsg::Nak { .. } => 2,
            ControlMsg::SelectiveAck { .. } => 4,
            ControlMsg::SetUnack { .. } => 2,
        }
    }

    /// Append the wire encoding of this record to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            ControlMsg::Hello { is_gateway } => {
                out.extend_from_slice(&[TAG_HELLO, 1, is_gateway as u8]);
            }
            ControlMsg::Timestamp { t_sent } => {
                out.extend_from_slice(&[TAG_TIMESTAMP, 16]);
                put_time(out, t_sent);
            }
            ControlMsg::TimestampEcho {
                node,
                t_sent,
                t_recv,
            } => {
                out.extend_from_slice(&[TAG_TIMESTAMP_ECHO, 33, node]);
                put_time(out, t_sent);
                put_time(out, t_recv);
            }
            ControlMsg::ReceiverStats {
                long_evm,
                long_rssi,
            } => {
                out.extend_from_slice(&[TAG_RECEIVER_STATS, 16]);
                out.extend_from_slice(&long_evm.to_le_bytes());
                out.extend_from_slice(&long_rssi.to_le_bytes());
            }
            ControlMsg::Nak { seq } => {
                out.extend_from_slice(&[TAG_NAK, 2]);
                out.extend_from_slice(&seq.0.to_le_bytes());
            }
            ControlMsg::SelectiveAck { begin, end } => {
                out.extend_from_slice(&[TAG_SELECTIVE_ACK, 4]);
                out.extend_from_slice(&begin.0.to_le_bytes());
                out.extend_from_slice(&end.0.to_le_bytes());
            }
            ControlMsg::SetUnack { unack } => {
                out.extend_from_slice(&[TAG_SET_UNACK, 2]);
                out.extend_from_slice(&unack.0.to_le_bytes());
            }
        }
    }

    fn decode_body(tag: u8, body: &[u8]) -> Option<ControlMsg> {
        match (tag, body.len()) {
            (TAG_HELLO, 1) => Some(ControlMsg::Hello {
                is_gateway: body[0] != 0,
            }),
            (TAG_TIMESTAMP, 16) => Some(ControlMsg::Timestamp {
                t_sent: get_time(body),
            }),
            (TAG_TIMESTAMP_ECHO, 33) => Some(ControlMsg::TimestampEcho {
                node: body[0],
                t_sent: get_time(&body[1..17]),
                t_recv: get_time(&body[17..33]),
            }),
            (TAG_RECEIVER_STATS, 16) => Some(ControlMsg::ReceiverStats {
                long_evm: f64::from_le_bytes(body[0..8].try_into().unwrap()),
                long_rssi: f64::from_le_bytes(body[8..16].try_into().unwrap()),
            }),
            (TAG_NAK, 2) => Some(ControlMsg::Nak {
                seq: Seq(u16::from_le_bytes([body[0], body[1]])),
            }),
            (TAG_SELECTIVE_ACK, 4) => Some(ControlMsg::SelectiveAck {
                begin: Seq(u16::from_le_bytes([body[0], body[1]])),
                end: Seq(u16::from_le_bytes([body[2], body[3]])),
            }),
            (TAG_SET_UNACK, 2) => Some(ControlMsg::SetUnack {
                unack: Seq(u16::from_le_bytes([body[0], body[1]])),
            }),
            _ => None,
        }
    }

    /// Iterate over the control records in a control region.
    ///
    /// Unknown tags and truncated trailing bytes are skipped silently.
    pub fn iter(region: &[u8]) -> ControlIter<'_> {
        ControlIter { region, pos: 0 }
    }
}

/// Iterator over control records in a control region.
pub struct ControlIter<'a> {
    region: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for ControlIter<'a> {
    type Item = ControlMsg;

    fn next(&mut self) -> Option<ControlMsg> {
        loop {
            if self.pos + 2 > self.region.len() {
                return None;
            }

            let tag = self.region[self.pos];
            let len = self.region[self.pos + 1] as usize;
            let body_start = self.pos + 2;

            if body_start + len > self.region.len() {
                // Truncated record; stop iterating.
                self.pos = self.region.len();
                return None;
            }

            self.pos = body_start + len;

            if let Some(msg) = ControlMsg::decode_body(tag, &self.region[body_start..body_start + len])
            {
                return Some(msg);
            }
            // Unknown tag: skip by length and continue.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: ControlMsg) {
        let mut buf = Vec::new();
        msg.encode(&mut buf);
        assert_eq!(buf.len(), msg.encoded_len());
        let decoded: Vec<_> = ControlMsg::iter(&buf).collect();
        assert_eq!(decoded, vec![msg]);
    }

    #[test]
    fn test_round_trip_all_kinds() {
        round_trip(ControlMsg::Hello { is_gateway: true });
        round_trip(ControlMsg::Timestamp {
            t_sent: MonoTime(12.625),
        });
        round_trip(ControlMsg::TimestampEcho {
            node: 3,
            t_sent: MonoTime(1.5),
            t_recv: MonoTime(2.25),
        });
        round_trip(ControlMsg::ReceiverStats {
            long_evm: -22.5,
            long_rssi: -48.0,
        });
        round_trip(ControlMsg::Nak { seq: Seq(99) });
        round_trip(ControlMsg::SelectiveAck {
            begin: Seq(10),
            end: Seq(14),
        });
        round_trip(ControlMsg::SetUnack { unack: Seq(1000) });
    }

    #[test]
    fn test_unknown_tag_skipped() {
        let mut buf = Vec::new();
        ControlMsg::Nak { seq: Seq(1) }.encode(&mut buf);
        // An unknown record: tag 0x7f, 3-byte body.
        buf.extend_from_slice(&[0x7f, 3, 0xaa, 0xbb, 0xcc]);
        ControlMsg::SetUnack { unack: Seq(2) }.encode(&mut buf);

        let msgs: Vec<_> = ControlMsg::iter(&buf).collect();
        assert_eq!(
            msgs,
            vec![
                ControlMsg::Nak { seq: Seq(1) },
                ControlMsg::SetUnack { unack: Seq(2) },
            ]
        );
    }

    #[test]
    fn test_truncated_record_stops_iteration() {
        let mut buf = Vec::new();
        ControlMsg::Hello { is_gateway: false }.encode(&mut buf);
        buf.extend_from_slice(&[TAG_TIMESTAMP, 16, 0, 0]); // truncated body

        let msgs: Vec<_> = ControlMsg::iter(&buf).collect();
        assert_eq!(msgs, vec![ControlMsg::Hello { is_gateway: false }]);
    }

    #[test]
    fn test_multiple_records_in_order() {
        let mut buf = Vec::new();
        let msgs = vec![
            ControlMsg::SelectiveAck {
                begin: Seq(2),
                end: Seq(3),
            },
            ControlMsg::SelectiveAck {
                begin: Seq(3),
                end: Seq(3),
            },
            ControlMsg::ReceiverStats {
                long_evm: -20.0,
                long_rssi: -40.0,
            },
        ];
        for m in &msgs {
            m.encode(&mut buf);
        }
        let decoded: Vec<_> = ControlMsg::iter(&buf).collect();
        assert_eq!(decoded, msgs);
    }
}
