//! Tap packet filter
//!
//! Converts raw ethernet frames from the tap device into NetPackets. By
//! convention, node numbers are the last octet of the ethernet MAC and IP
//! addresses. Only IPv4 frames sourced by the local node pass; the IP source
//! and destination classify the packet into the internal or external network
//! segment.

use std::sync::Arc;

use crate::config::NetConfig;
use crate::packet::{NetPacket, NetSegment};
use crate::radionet::RadioNet;

/// The ethernet-frame filter in front of the net queue.
pub struct NetFilter {
    net: Arc<RadioNet>,
    config: NetConfig,
}

impl NetFilter {
    pub fn new(net: Arc<RadioNet>, config: NetConfig) -> NetFilter {
        NetFilter { net, config }
    }

    /// Process one raw ethernet frame. Returns the NetPacket to queue, or
    /// `None` if the frame is dropped.
    pub fn process(&self, frame: &[u8]) -> Option<NetPacket> {
        if frame.len() < 14 + 20 {
            return None;
        }

        // Node numbers are the last octet of the MAC addresses.
        let nexthop = frame[5];
        let curhop = frame[11];

        // Only IPv4 frames where we are the source.
        let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
        if ethertype != 0x0800 || curhop != self.net.this_node_id() {
            return None;
        }

        let ip = &frame[14..];
        let ip_src = u32::from_be_bytes([ip[12], ip[13], ip[14], ip[15]]);
        let ip_dst = u32::from_be_bytes([ip[16], ip[17], ip[18], ip[19]]);

        let segment = if ip_dst & self.config.int_netmask == self.config.int_net {
            Some(NetSegment::IntNet)
        } else if ip_dst & self.config.ext_netmask == self.config.ext_net {
            Some(NetSegment::ExtNet)
        } else {
            None
        };

        let mut pkt = NetPacket::with_data(frame);
        pkt.pkt.hdr.curhop = curhop;
        pkt.pkt.hdr.nexthop = nexthop;
        pkt.segment = segment;

        let mut ehdr = pkt.pkt.ehdr();
        ehdr.src = (ip_src & 0xff) as u8;
        ehdr.dest = (ip_dst & 0xff) as u8;
        pkt.pkt.set_ehdr(ehdr);

        Some(pkt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::NetSegment;

    fn frame(src_mac_last: u8, dst_mac_last: u8, ip_src: u32, ip_dst: u32) -> Vec<u8> {
        let mut f = vec![0u8; 14 + 20 + 8];
        f[5] = dst_mac_last;
        f[11] = src_mac_last;
        f[12] = 0x08;
        f[13] = 0x00;
        f[14] = 0x45;
        f[14 + 12..14 + 16].copy_from_slice(&ip_src.to_be_bytes());
        f[14 + 16..14 + 20].copy_from_slice(&ip_dst.to_be_bytes());
        f
    }

    fn filter() -> NetFilter {
        NetFilter::new(Arc::new(RadioNet::new(1)), NetConfig::default())
    }

    #[test]
    fn test_local_ipv4_frame_passes() {
        let f = frame(1, 2, 0x0a0a_0a01, 0x0a0a_0a02);
        let pkt = filter().process(&f).expect("frame dropped");
        assert_eq!(pkt.pkt.hdr.curhop, 1);
        assert_eq!(pkt.pkt.hdr.nexthop, 2);
        assert_eq!(pkt.pkt.ehdr().src, 1);
        assert_eq!(pkt.pkt.ehdr().dest, 2);
        assert_eq!(pkt.segment, Some(NetSegment::IntNet));
        assert_eq!(pkt.data_len(), f.len());
    }

    #[test]
    fn test_external_segment_classified() {
        let f = frame(1, 3, 0x0a0a_0a01, 0xc0a8_0103);
        let pkt = filter().process(&f).unwrap();
        assert_eq!(pkt.segment, Some(NetSegment::ExtNet));
    }

    #[test]
    fn test_non_ip_dropped() {
        let mut f = frame(1, 2, 0x0a0a_0a01, 0x0a0a_0a02);
        f[12] = 0x08;
        f[13] = 0x06; // ARP
        assert!(filter().process(&f).is_none());
    }

    #[test]
    fn test_non_local_source_dropped() {
        let f = frame(7, 2, 0x0a0a_0a07, 0x0a0a_0a02);
        assert!(filter().process(&f).is_none());
    }

    #[test]
    fn test_short_frame_dropped() {
        assert!(filter().process(&[0u8; 10]).is_none());
    }
}
