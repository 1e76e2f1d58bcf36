//! Wire-exact packet headers
//!
//! The on-air header is 5 bytes: current hop, next hop, a little-endian
//! 16-bit sequence number, and a flag octet. The extended header occupies the
//! first 6 bytes of the payload body: source, destination, the cumulative ACK
//! sequence, and the length of the data portion of the payload.
//!
//! ## Example
//!
//! ```rust
//! use wren_core::header::{Header, HeaderFlags};
//! use wren_core::types::Seq;
//!
//! let hdr = Header {
//!     curhop: 1,
//!     nexthop: 2,
//!     seq: Seq(0x1234),
//!     flags: HeaderFlags { syn: true, has_data: true, ..Default::default() },
//! };
//! let bytes = hdr.to_bytes();
//! assert_eq!(Header::from_bytes(&bytes).unwrap(), hdr);
//! ```

use crate::types::{NodeId, RadioError, RadioResult, Seq};

/// Size of the wire header in bytes.
pub const HEADER_LEN: usize = 5;

/// Size of the extended header in bytes.
pub const EXT_HEADER_LEN: usize = 6;

const FLAG_SYN: u8 = 1 << 0;
const FLAG_ACK: u8 = 1 << 1;
const FLAG_BROADCAST: u8 = 1 << 2;
const FLAG_HAS_DATA: u8 = 1 << 3;
const FLAG_HAS_CONTROL: u8 = 1 << 4;

/// One-bit header flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderFlags {
    /// First packet of a new per-peer connection.
    pub syn: bool,
    /// The extended header carries a valid ACK.
    pub ack: bool,
    /// Broadcast packet.
    pub broadcast: bool,
    /// The payload carries data.
    pub has_data: bool,
    /// The payload carries control records.
    pub has_control: bool,
}

impl HeaderFlags {
    /// Pack into the wire flag octet.
    pub fn to_byte(self) -> u8 {
        let mut b = 0;
        if self.syn {
            b |= FLAG_SYN;
        }
        if self.ack {
            b |= FLAG_ACK;
        }
        if self.broadcast {
            b |= FLAG_BROADCAST;
        }
        if self.has_data {
            b |= FLAG_HAS_DATA;
        }
        if self.has_control {
            b |= FLAG_HAS_CONTROL;
        }
        b
    }

    /// Unpack from the wire flag octet. Unknown bits are ignored.
    pub fn from_byte(b: u8) -> HeaderFlags {
        HeaderFlags {
            syn: b & FLAG_SYN != 0,
            ack: b & FLAG_ACK != 0,
            broadcast: b & FLAG_BROADCAST != 0,
            has_data: b & FLAG_HAS_DATA != 0,
            has_control: b & FLAG_HAS_CONTROL != 0,
        }
    }
}

/// The PHY packet header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    /// Current hop.
    pub curhop: NodeId,
    /// Next hop.
    pub nexthop: NodeId,
    /// Packet sequence number.
    pub seq: Seq,
    /// Packet flags.
    pub flags: HeaderFlags,
}

impl Header {
    /// Serialize to the wire representation.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let seq = self.seq.0.to_le_bytes();
        [self.curhop, self.nexthop, seq[0], seq[1], self.flags.to_byte()]
    }

    /// Parse from the wire representation.
    pub fn from_bytes(bytes: &[u8]) -> RadioResult<Header> {
        if bytes.len() < HEADER_LEN {
            return Err(RadioError::PacketTooShort {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }

        Ok(Header {
            curhop: bytes[0],
            nexthop: bytes[1],
            seq: Seq(u16::from_le_bytes([bytes[2], bytes[3]])),
            flags: HeaderFlags::from_byte(bytes[4]),
        })
    }
}

/// The extended header at the start of the payload body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendedHeader {
    /// Source node.
    pub src: NodeId,
    /// Destination node.
    pub dest: NodeId,
    /// Sequence number we are ACKing.
    pub ack: Seq,
    /// Length of the data portion of the payload.
    pub data_len: u16,
}

impl ExtendedHeader {
    /// Serialize to the wire representation.
    pub fn to_bytes(&self) -> [u8; EXT_HEADER_LEN] {
        let ack = self.ack.0.to_le_bytes();
        let len = self.data_len.to_le_bytes();
        [self.src, self.dest, ack[0], ack[1], len[0], len[1]]
    }

    /// Parse from the wire representation.
    pub fn from_bytes(bytes: &[u8]) -> RadioResult<ExtendedHeader> {
        if bytes.len() < EXT_HEADER_LEN {
            return Err(RadioError::PacketTooShort {
                expected: EXT_HEADER_LEN,
                actual: bytes.len(),
            });
        }

        Ok(ExtendedHeader {
            src: bytes[0],
            dest: bytes[1],
            ack: Seq(u16::from_le_bytes([bytes[2], bytes[3]])),
            data_len: u16::from_le_bytes([bytes[4], bytes[5]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let hdr = Header {
            curhop: 7,
            nexthop: 42,
            seq: Seq(0xbeef),
            flags: HeaderFlags {
                syn: true,
                ack: true,
                broadcast: false,
                has_data: true,
                has_control: false,
            },
        };
        assert_eq!(Header::from_bytes(&hdr.to_bytes()).unwrap(), hdr);
    }

    #[test]
    fn test_flag_octet_layout() {
        let flags = HeaderFlags {
            syn: true,
            has_control: true,
            ..Default::default()
        };
        assert_eq!(flags.to_byte(), 0b1_0001);
    }

    #[test]
    fn test_unknown_flag_bits_ignored() {
        let flags = HeaderFlags::from_byte(0xff);
        assert!(flags.syn && flags.ack && flags.broadcast && flags.has_data && flags.has_control);
        assert_eq!(flags.to_byte(), 0b1_1111);
    }

    #[test]
    fn test_ext_header_round_trip() {
        let ehdr = ExtendedHeader {
            src: 1,
            dest: 2,
            ack: Seq(300),
            data_len: 1400,
        };
        assert_eq!(ExtendedHeader::from_bytes(&ehdr.to_bytes()).unwrap(), ehdr);
    }

    #[test]
    fn test_short_buffer_rejected() {
        assert!(Header::from_bytes(&[0, 1, 2]).is_err());
        assert!(ExtendedHeader::from_bytes(&[0; 4]).is_err());
    }
}
