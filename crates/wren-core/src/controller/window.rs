//! ARQ send and receive windows
//!
//! Per-peer sliding-window state for the smart controller. A send window is
//! a bounded ring of `maxwin` entries indexed by `seq mod maxwin`; a receive
//! window is a ring of `win` entries tracking receipt and delivery.
//!
//! Invariants, checked by `debug_assert` and by tests:
//! * send: `unack <= seq_next <= unack + win`, `win <= maxwin`,
//!   `per_end >= unack`;
//! * recv: `ack <= max + 1 < ack + win + 1`; the entry at `ack - 1` has been
//!   delivered or discarded.
//!
//! Windows live in owning tables inside the controller keyed by node ID.
//! Retransmission timers hold only `{peer, seq}` handles; their callbacks
//! resolve the entry under the window lock and treat a missing packet as
//! "no work", which makes cancellation race-free.

use std::sync::{Arc, Mutex};

use crate::clock::MonoTime;
use crate::estimator::{Ewma, WindowedMean};
use crate::packet::{NetPacket, RadioPacket};
use crate::radionet::Node;
use crate::timer_queue::TimerHandle;
use crate::types::Seq;

/// One in-flight packet slot in a send window.
#[derive(Debug)]
pub struct SendEntry {
    /// The packet, present until ACKed or dropped.
    pub pkt: Option<NetPacket>,
    /// When the packet was last handed to the PHY path.
    pub timestamp: MonoTime,
    /// MCS the packet was sent at.
    pub mcsidx: usize,
    /// Retransmissions so far.
    pub nretrans: usize,
    /// This entry's retransmission timer.
    pub timer: TimerHandle,
}

/// Mutable send-window state, guarded by the window lock.
#[derive(Debug)]
pub struct SendWindowState {
    /// Maximum window size.
    pub maxwin: u16,
    /// Current window size; 1 until the SYN is ACKed.
    pub win: u16,
    /// First un-ACKed sequence number.
    pub unack: Seq,
    /// Highest sequence number sent.
    pub max: Seq,
    /// Sequence before which PER feedback has been accounted.
    pub per_end: Seq,
    /// True until the first packet (the SYN) is assigned.
    pub new_window: bool,
    /// `unack` moved because of local drops; attach `SetUnack` on the next
    /// outbound packet.
    pub locally_updated: bool,
    /// Current MCS index for this peer.
    pub mcsidx: usize,
    /// Per-MCS transition probabilities.
    pub mcsidx_prob: Vec<f64>,
    /// Short-term packet error rate.
    pub short_per: WindowedMean,
    /// Long-term packet error rate.
    pub long_per: WindowedMean,
    /// ACK delay estimate.
    pub ack_delay: Ewma,
    /// Current retransmission timer duration (seconds).
    pub retransmission_delay: f64,
    /// Long-term EVM reported by the receiver, if any.
    pub long_evm: Option<f64>,
    /// Long-term RSSI reported by the receiver, if any.
    pub long_rssi: Option<f64>,
    /// The ring of in-flight entries.
    entries: Vec<SendEntry>,
}

impl SendWindowState {
    /// Ring entry for `seq`.
    pub fn entry(&self, seq: Seq) -> &SendEntry {
        &self.entries[seq.0 as usize % self.maxwin as usize]
    }

    /// Mutable ring entry for `seq`.
    pub fn entry_mut(&mut self, seq: Seq) -> &mut SendEntry {
        let idx = seq.0 as usize % self.maxwin as usize;
        &mut self.entries[idx]
    }

    /// True if `seq` lies inside the current window.
    pub fn in_window(&self, seq: Seq) -> bool {
        seq >= self.unack && seq < self.unack + self.win
    }

    #[cfg(debug_assertions)]
    pub fn check_invariants(&self, seq_next: Seq) {
        debug_assert!(self.win <= self.maxwin);
        debug_assert!(self.unack <= seq_next);
        debug_assert!(seq_next <= self.unack + self.win);
        debug_assert!(self.per_end >= self.unack);
    }
}

/// A per-destination send window.
pub struct SendWindow {
    /// The destination node.
    pub node: Arc<Node>,
    /// Guarded state.
    pub state: Mutex<SendWindowState>,
}

impl SendWindow {
    pub fn new(
        node: Arc<Node>,
        maxwin: u16,
        mcsidx: usize,
        nmcs: usize,
        mk_timer: impl Fn() -> TimerHandle,
    ) -> SendWindow {
        let start = node.seq();
        let entries = (0..maxwin)
            .map(|_| SendEntry {
                pkt: None,
                timestamp: MonoTime::default(),
                mcsidx,
                nretrans: 0,
                timer: mk_timer(),
            })
            .collect();

        SendWindow {
            node,
            state: Mutex::new(SendWindowState {
                maxwin,
                win: 1,
                unack: start,
                max: start - 1,
                per_end: start,
                new_window: true,
                locally_updated: false,
                mcsidx,
                mcsidx_prob: vec![1.0; nmcs],
                short_per: WindowedMean::new(1),
                long_per: WindowedMean::new(1),
                ack_delay: Ewma::with_warmup(2.0 / 11.0, 0.0, 10),
                retransmission_delay: 0.0,
                long_evm: None,
                long_rssi: None,
                entries,
            }),
        }
    }
}

/// One slot in a receive window.
#[derive(Debug, Default)]
pub struct RecvEntry {
    /// The packet has been received.
    pub received: bool,
    /// The packet has been delivered to the tap.
    pub delivered: bool,
    /// The packet itself, parked awaiting in-order delivery.
    pub pkt: Option<RadioPacket>,
}

impl RecvEntry {
    /// Record an out-of-order delivery: received and already passed up.
    pub fn already_delivered(&mut self) {
        self.received = true;
        self.delivered = true;
        self.pkt = None;
    }

    /// Park a packet awaiting delivery.
    pub fn set(&mut self, pkt: RadioPacket) {
        self.received = true;
        self.delivered = false;
        self.pkt = Some(pkt);
    }

    /// Release the slot.
    pub fn reset(&mut self) {
        self.received = false;
        self.delivered = false;
        self.pkt = None;
    }
}

/// Mutable receive-window state, guarded by the window lock.
#[derive(Debug)]
pub struct RecvWindowState {
    /// Window size.
    pub win: u16,
    /// Next sequence number to cumulatively ACK.
    pub ack: Seq,
    /// Highest sequence number received.
    pub max: Seq,
    /// Timestamp of the packet that set `max`.
    pub max_timestamp: MonoTime,
    /// A selective ACK should be attached to the next outbound packet.
    pub need_selective_ack: bool,
    /// The combined ACK/SACK timer's next fire emits a standalone ACK.
    pub timer_for_ack: bool,
    /// Send times of recent explicit NAKs, for rate limiting.
    pub explicit_nak_win: Vec<MonoTime>,
    /// Ring index into `explicit_nak_win`; advanced only when a NAK is sent.
    pub explicit_nak_idx: usize,
    /// Long-term EVM of traffic from this peer.
    pub long_evm: Ewma,
    /// Long-term RSSI of traffic from this peer.
    pub long_rssi: Ewma,
    /// The ring of receive slots.
    entries: Vec<RecvEntry>,
}

impl RecvWindowState {
    /// Ring entry for `seq`.
    pub fn entry(&self, seq: Seq) -> &RecvEntry {
        &self.entries[seq.0 as usize % self.win as usize]
    }

    /// Mutable ring entry for `seq`.
    pub fn entry_mut(&mut self, seq: Seq) -> &mut RecvEntry {
        let idx = seq.0 as usize % self.win as usize;
        &mut self.entries[idx]
    }

    #[cfg(debug_assertions)]
    pub fn check_invariants(&self) {
        debug_assert!(self.ack <= self.max + 1);
        debug_assert!(self.max < self.ack + self.win);
    }
}

/// A per-source receive window.
pub struct RecvWindow {
    /// The source node.
    pub node: Arc<Node>,
    /// The combined ACK/SACK timer.
    pub timer: TimerHandle,
    /// Guarded state.
    pub state: Mutex<RecvWindowState>,
}

impl RecvWindow {
    pub fn new(
        node: Arc<Node>,
        seq: Seq,
        win: u16,
        explicit_nak_win: usize,
        timer: TimerHandle,
    ) -> RecvWindow {
        let entries = (0..win).map(|_| RecvEntry::default()).collect();

        RecvWindow {
            node,
            timer,
            state: Mutex::new(RecvWindowState {
                win,
                ack: seq,
                max: seq,
                max_timestamp: MonoTime::default(),
                need_selective_ack: false,
                timer_for_ack: false,
                explicit_nak_win: vec![MonoTime(-1.0e9); explicit_nak_win],
                explicit_nak_idx: 0,
                long_evm: Ewma::with_warmup(2.0 / 11.0, 0.0, 10),
                long_rssi: Ewma::with_warmup(2.0 / 11.0, 0.0, 10),
                entries,
            }),
        }
    }
}
