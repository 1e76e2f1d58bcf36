//! MAC controllers
//!
//! A controller sits between the network queue and the PHY pipeline. On the
//! way out, synthesizer workers `pull` packets from it; on the way in, the
//! channelizer hands it every demodulated packet via `received`. The MAC
//! reports completed transmissions (`transmitted`) and packets staged for a
//! slot that missed its deadline (`missed`).

pub mod smart;
pub mod window;

use std::sync::Arc;

use crate::netqueue::NetQueue;
use crate::packet::{NetPacket, RadioPacket};

/// The controller interface joining the net queue, the PHY, and the tap.
pub trait Controller: Send + Sync {
    /// Pull the next packet to modulate, blocking until one is available.
    /// Returns `None` once the underlying queue is stopped.
    fn pull(&self) -> Option<NetPacket>;

    /// Handle a packet demodulated from the radio.
    fn received(&self, pkt: RadioPacket);

    /// Notification that a packet went out over the air.
    fn transmitted(&self, pkt: &NetPacket);

    /// A packet staged for a slot whose deadline passed; it never aired.
    fn missed(&self, pkt: NetPacket);

    /// Stop any controller-owned machinery.
    fn stop(&self) {}
}

/// Sink for packets delivered up toward the tap interface.
pub trait PacketSink: Send + Sync {
    fn deliver(&self, pkt: RadioPacket);
}

impl<F: Fn(RadioPacket) + Send + Sync> PacketSink for F {
    fn deliver(&self, pkt: RadioPacket) {
        self(pkt)
    }
}

/// A pass-through controller with no ARQ: packets flow straight between the
/// net queue and the tap. Useful for MAC/PHY bring-up.
pub struct DummyController {
    netq: Arc<NetQueue>,
    sink: Arc<dyn PacketSink>,
}

impl DummyController {
    pub fn new(netq: Arc<NetQueue>, sink: Arc<dyn PacketSink>) -> DummyController {
        DummyController { netq, sink }
    }
}

impl Controller for DummyController {
    fn pull(&self) -> Option<NetPacket> {
        self.netq.pop()
    }

    fn received(&self, mut pkt: RadioPacket) {
        if pkt.internal_flags.invalid_header || pkt.internal_flags.invalid_payload {
            return;
        }
        pkt.truncate_to_data();
        if pkt.data_len() != 0 {
            self.sink.deliver(pkt);
        }
    }

    fn transmitted(&self, _pkt: &NetPacket) {}

    fn missed(&self, pkt: NetPacket) {
        self.netq.repush(pkt);
    }
}
