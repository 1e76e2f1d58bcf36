//! Packet carrier records
//!
//! A [`Packet`] owns the payload-body byte buffer (extended header, data,
//! optional control region) together with the wire header and the internal
//! bookkeeping flags that never go on the air. [`NetPacket`] is a packet
//! headed to the radio and carries modulation parameters; [`RadioPacket`] is
//! a packet received from the radio and carries signal metrics. Both deref to
//! the shared [`Packet`] core.
//!
//! Packets travel by unique ownership end-to-end; the ARQ controller clones a
//! packet only once, when pinning it inside a send-window slot.

use crate::clock::MonoTime;
use crate::control::ControlMsg;
use crate::header::{ExtendedHeader, Header, EXT_HEADER_LEN};
use crate::types::{Channel, FlowUid, NodeId, Seq};

/// Internal (never on-air) packet flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InternalFlags {
    /// The header failed its integrity check.
    pub invalid_header: bool,
    /// The payload failed its integrity check.
    pub invalid_payload: bool,
    /// This packet is a retransmission.
    pub retransmission: bool,
    /// A sequence number has been assigned.
    pub has_seq: bool,
    /// The control region carries a selective ACK.
    pub has_selective_ack: bool,
    /// This packet must be timestamped sample-exact on egress.
    pub timestamp: bool,
}

/// The packet core shared by both directions.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Wire header.
    pub hdr: Header,
    /// Payload body: extended header, data, optional control region.
    buf: Vec<u8>,
    /// Opaque end-to-end flow tag.
    pub flow_uid: Option<FlowUid>,
    /// Internal bookkeeping flags.
    pub internal_flags: InternalFlags,
}

impl Default for Packet {
    fn default() -> Packet {
        Packet {
            hdr: Header::default(),
            buf: vec![0; EXT_HEADER_LEN],
            flow_uid: None,
            internal_flags: InternalFlags::default(),
        }
    }
}

impl Packet {
    /// Create a packet with an empty payload body (extended header only).
    pub fn new() -> Packet {
        Packet::default()
    }

    /// Create a packet whose data region holds `data`.
    pub fn with_data(data: &[u8]) -> Packet {
        let mut pkt = Packet::new();
        pkt.buf.extend_from_slice(data);
        let mut ehdr = pkt.ehdr();
        ehdr.data_len = data.len() as u16;
        pkt.set_ehdr(ehdr);
        pkt.hdr.flags.has_data = !data.is_empty();
        pkt
    }

    /// Rebuild a packet from a received payload body.
    pub fn from_body(hdr: Header, body: Vec<u8>) -> Packet {
        let mut body = body;
        if body.len() < EXT_HEADER_LEN {
            body.resize(EXT_HEADER_LEN, 0);
        }
        Packet {
            hdr,
            buf: body,
            flow_uid: None,
            internal_flags: InternalFlags::default(),
        }
    }

    /// Total payload body size in bytes.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// The raw payload body.
    pub fn body(&self) -> &[u8] {
        &self.buf
    }

    /// Read the extended header.
    pub fn ehdr(&self) -> ExtendedHeader {
        ExtendedHeader::from_bytes(&self.buf).unwrap_or_default()
    }

    /// Write the extended header.
    pub fn set_ehdr(&mut self, ehdr: ExtendedHeader) {
        self.buf[..EXT_HEADER_LEN].copy_from_slice(&ehdr.to_bytes());
    }

    /// Length of the data portion of the payload.
    pub fn data_len(&self) -> usize {
        self.ehdr().data_len as usize
    }

    /// The data portion of the payload.
    pub fn data(&self) -> &[u8] {
        let end = (EXT_HEADER_LEN + self.data_len()).min(self.buf.len());
        &self.buf[EXT_HEADER_LEN..end]
    }

    /// The control region, if any.
    pub fn control_region(&self) -> &[u8] {
        if !self.hdr.flags.has_control {
            return &[];
        }
        let start = (EXT_HEADER_LEN + self.data_len()).min(self.buf.len());
        &self.buf[start..]
    }

    /// Iterate the control records attached to this packet.
    pub fn control(&self) -> impl Iterator<Item = ControlMsg> + '_ {
        ControlMsg::iter(self.control_region())
    }

    /// Append a control record.
    pub fn append_control(&mut self, msg: ControlMsg) {
        msg.encode(&mut self.buf);
        self.hdr.flags.has_control = true;
    }

    /// Strip all control records.
    pub fn clear_control(&mut self) {
        let keep = EXT_HEADER_LEN + self.data_len();
        self.buf.truncate(keep.min(self.buf.len()));
        self.hdr.flags.has_control = false;
    }

    /// Truncate the body to the extended header plus data, dropping padding
    /// and control bytes.
    pub fn truncate_to_data(&mut self) {
        self.clear_control();
    }

    /// The packet's sequence number.
    pub fn seq(&self) -> Seq {
        self.hdr.seq
    }

    /// Payload integrity: the body must be large enough for the claimed data
    /// length.
    pub fn integrity_intact(&self) -> bool {
        self.buf.len() >= EXT_HEADER_LEN + self.data_len()
    }

    /// Ethernet header bytes of the data region, if present.
    fn ether_frame(&self) -> Option<&[u8]> {
        let data = self.data();
        if data.len() >= 14 {
            Some(data)
        } else {
            None
        }
    }

    /// Return true if the data region is an IPv4 frame.
    pub fn is_ip(&self) -> bool {
        self.ether_frame()
            .map(|f| u16::from_be_bytes([f[12], f[13]]) == 0x0800 && f.len() >= 14 + 20)
            .unwrap_or(false)
    }

    /// Return true if the data region is an IPv4 frame of the given protocol.
    pub fn is_ip_proto(&self, proto: u8) -> bool {
        self.is_ip()
            && self
                .ether_frame()
                .map(|f| f[14 + 9] == proto)
                .unwrap_or(false)
    }

    /// Return true if the data region is a TCP frame.
    pub fn is_tcp(&self) -> bool {
        self.is_ip_proto(6)
    }

    /// Return true if the data region is a UDP frame.
    pub fn is_udp(&self) -> bool {
        self.is_ip_proto(17)
    }
}

/// Which network segment a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetSegment {
    /// Internal network.
    IntNet,
    /// External network.
    ExtNet,
}

/// A packet headed from the network to the radio.
#[derive(Debug, Clone, Default)]
pub struct NetPacket {
    /// The packet core.
    pub pkt: Packet,
    /// MCS to use, an index into the PHY's MCS table.
    pub mcsidx: usize,
    /// Multiplicative (linear) TX gain.
    pub g: f64,
    /// Optional delivery deadline.
    pub deadline: Option<MonoTime>,
    /// Number of retransmissions so far.
    pub nretrans: usize,
    /// Segment classification from the packet filter.
    pub segment: Option<NetSegment>,
}

impl NetPacket {
    /// Create an empty NetPacket (extended header only).
    pub fn new() -> NetPacket {
        NetPacket {
            pkt: Packet::new(),
            g: 1.0,
            ..Default::default()
        }
    }

    /// Create a data-bearing NetPacket.
    pub fn with_data(data: &[u8]) -> NetPacket {
        NetPacket {
            pkt: Packet::with_data(data),
            g: 1.0,
            ..Default::default()
        }
    }

    /// Create a payload-free control opportunity packet from `curhop` to
    /// `nexthop`. The ACK field is filled when the packet flows back through
    /// the controller on its way out the radio.
    pub fn control_opportunity(curhop: NodeId, nexthop: NodeId) -> NetPacket {
        let mut pkt = NetPacket::new();
        pkt.pkt.hdr.curhop = curhop;
        pkt.pkt.hdr.nexthop = nexthop;
        let mut ehdr = pkt.pkt.ehdr();
        ehdr.src = curhop;
        ehdr.dest = nexthop;
        pkt.pkt.set_ehdr(ehdr);
        pkt
    }

    /// Return true if the packet's deadline has passed.
    pub fn deadline_passed(&self, now: MonoTime) -> bool {
        matches!(self.deadline, Some(d) if d < now)
    }

    /// Return true if this packet should be dropped on pop. SYN packets are
    /// needed to initiate a connection and are never dropped here.
    pub fn should_drop(&self, now: MonoTime) -> bool {
        !self.pkt.hdr.flags.syn && self.deadline_passed(now)
    }
}

impl std::ops::Deref for NetPacket {
    type Target = Packet;

    fn deref(&self) -> &Packet {
        &self.pkt
    }
}

impl std::ops::DerefMut for NetPacket {
    fn deref_mut(&mut self) -> &mut Packet {
        &mut self.pkt
    }
}

/// A packet received from the radio.
#[derive(Debug, Clone, Default)]
pub struct RadioPacket {
    /// The packet core.
    pub pkt: Packet,
    /// Error vector magnitude [dB].
    pub evm: f64,
    /// Received signal strength indicator [dB].
    pub rssi: f64,
    /// Carrier frequency offset (f/Fs).
    pub cfo: f64,
    /// Arrival time of the frame's first sample.
    pub timestamp: MonoTime,
    /// Channel the packet was received on.
    pub channel: Channel,
}

impl RadioPacket {
    /// Create a RadioPacket wrapping a decoded packet core.
    pub fn new(pkt: Packet) -> RadioPacket {
        RadioPacket {
            pkt,
            ..Default::default()
        }
    }
}

impl std::ops::Deref for RadioPacket {
    type Target = Packet;

    fn deref(&self) -> &Packet {
        &self.pkt
    }
}

impl std::ops::DerefMut for RadioPacket {
    fn deref_mut(&mut self) -> &mut Packet {
        &mut self.pkt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_packet_layout() {
        let pkt = Packet::with_data(b"hello");
        assert_eq!(pkt.data_len(), 5);
        assert_eq!(pkt.data(), b"hello");
        assert!(pkt.hdr.flags.has_data);
        assert!(pkt.integrity_intact());
    }

    #[test]
    fn test_control_append_and_clear() {
        let mut pkt = Packet::with_data(b"xyz");
        pkt.append_control(ControlMsg::Nak { seq: Seq(4) });
        pkt.append_control(ControlMsg::SetUnack { unack: Seq(9) });

        assert!(pkt.hdr.flags.has_control);
        let msgs: Vec<_> = pkt.control().collect();
        assert_eq!(msgs.len(), 2);
        // Data region is unaffected by control.
        assert_eq!(pkt.data(), b"xyz");

        pkt.clear_control();
        assert!(!pkt.hdr.flags.has_control);
        assert_eq!(pkt.control().count(), 0);
        assert_eq!(pkt.size(), EXT_HEADER_LEN + 3);
    }

    #[test]
    fn test_ehdr_round_trip() {
        let mut pkt = Packet::new();
        let ehdr = ExtendedHeader {
            src: 1,
            dest: 2,
            ack: Seq(77),
            data_len: 0,
        };
        pkt.set_ehdr(ehdr);
        assert_eq!(pkt.ehdr(), ehdr);
    }

    #[test]
    fn test_should_drop_honors_syn() {
        let now = MonoTime(100.0);
        let mut pkt = NetPacket::with_data(b"d");
        pkt.deadline = Some(MonoTime(50.0));
        assert!(pkt.should_drop(now));

        pkt.pkt.hdr.flags.syn = true;
        assert!(!pkt.should_drop(now));
    }

    #[test]
    fn test_tcp_detection() {
        // 14-byte ethernet header with IPv4 ethertype, then a minimal IPv4
        // header with protocol = 6 (TCP) at offset 9.
        let mut frame = vec![0u8; 14 + 20];
        frame[12] = 0x08;
        frame[13] = 0x00;
        frame[14] = 0x45;
        frame[14 + 9] = 6;

        let pkt = Packet::with_data(&frame);
        assert!(pkt.is_ip());
        assert!(pkt.is_tcp());
        assert!(!pkt.is_udp());
    }

    #[test]
    fn test_from_body_pads_short_body() {
        let pkt = Packet::from_body(Header::default(), vec![1, 2]);
        assert_eq!(pkt.size(), EXT_HEADER_LEN);
    }
}
