//! The packet queue feeding the MAC
//!
//! Multi-producer, multi-consumer queue composing several disciplines:
//!
//! * a main band of outgoing packets, FIFO or LIFO;
//! * a high-priority band for ACK/NAK/HELLO injection;
//! * per-destination gating, so a closed send window stalls only packets
//!   that would need a new sequence number for that destination;
//! * a splice front, letting retransmissions rejoin at the head of the main
//!   band without losing reader progress;
//! * drop-on-expiry on pop for packets that never acquired a sequence number
//!   (the controller owns dropping sequenced packets so the send window stays
//!   consistent).
//!
//! `pop` blocks until an eligible packet appears or the queue is stopped.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};

use crate::clock::MonoClock;
use crate::packet::NetPacket;
use crate::types::NodeId;

/// Main-band ordering discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum QueueOrder {
    Fifo,
    Lifo,
}

struct Inner {
    hiq: VecDeque<NetPacket>,
    q: VecDeque<NetPacket>,
    window_open: HashMap<NodeId, bool>,
    order: QueueOrder,
    done: bool,
}

impl Inner {
    /// A packet is gated only if it carries data but has not yet been
    /// assigned a sequence number; everything else (control-only packets,
    /// retransmissions already holding a sequence) always flows.
    fn eligible(&self, pkt: &NetPacket) -> bool {
        if pkt.pkt.hdr.flags.broadcast {
            return true;
        }
        if pkt.data_len() == 0 || pkt.internal_flags.has_seq {
            return true;
        }
        *self.window_open.get(&pkt.pkt.hdr.nexthop).unwrap_or(&true)
    }
}

/// The network-side packet queue.
pub struct NetQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl NetQueue {
    pub fn new(order: QueueOrder) -> NetQueue {
        NetQueue {
            inner: Mutex::new(Inner {
                hiq: VecDeque::new(),
                q: VecDeque::new(),
                window_open: HashMap::new(),
                order,
                done: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Enqueue a packet on the main band.
    pub fn push(&self, pkt: NetPacket) {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.order {
                QueueOrder::Fifo => inner.q.push_back(pkt),
                QueueOrder::Lifo => inner.q.push_front(pkt),
            }
        }
        self.cond.notify_one();
    }

    /// Enqueue a packet at the back of the high-priority band.
    pub fn push_hi(&self, pkt: NetPacket) {
        self.inner.lock().unwrap().hiq.push_back(pkt);
        self.cond.notify_one();
    }

    /// Enqueue a packet at the front of the high-priority band.
    pub fn push_hi_front(&self, pkt: NetPacket) {
        self.inner.lock().unwrap().hiq.push_front(pkt);
        self.cond.notify_one();
    }

    /// Return a packet to the head of the main band.
    pub fn repush(&self, pkt: NetPacket) {
        self.inner.lock().unwrap().q.push_front(pkt);
        self.cond.notify_one();
    }

    /// Insert a run of packets at the head of the main band, atomically with
    /// respect to consumers and preserving the run's order.
    pub fn splice_front(&self, pkts: Vec<NetPacket>) {
        {
            let mut inner = self.inner.lock().unwrap();
            for pkt in pkts.into_iter().rev() {
                inner.q.push_front(pkt);
            }
        }
        self.cond.notify_all();
    }

    /// Open or close emission toward `dest`.
    pub fn set_send_window_status(&self, dest: NodeId, open: bool) {
        self.inner.lock().unwrap().window_open.insert(dest, open);
        if open {
            self.cond.notify_all();
        }
    }

    /// Pop the next eligible packet, blocking until one is available or the
    /// queue is stopped.
    pub fn pop(&self) -> Option<NetPacket> {
        let mut inner = self.inner.lock().unwrap();

        loop {
            if inner.done {
                return None;
            }

            if let Some(pkt) = Self::take_eligible(&mut inner) {
                return Some(pkt);
            }

            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Pop the next eligible packet without blocking.
    pub fn try_pop(&self) -> Option<NetPacket> {
        let mut inner = self.inner.lock().unwrap();
        if inner.done {
            return None;
        }
        Self::take_eligible(&mut inner)
    }

    fn take_eligible(inner: &mut Inner) -> Option<NetPacket> {
        // High-priority band first.
        let mut idx = 0;
        while idx < inner.hiq.len() {
            if inner.eligible(&inner.hiq[idx]) {
                return inner.hiq.remove(idx);
            }
            idx += 1;
        }

        // Main band: first packet whose destination is open and whose
        // deadline has not expired. Unsequenced expired packets are dropped
        // silently.
        let now = MonoClock::now();
        let mut idx = 0;
        while idx < inner.q.len() {
            if inner.q[idx].should_drop(now) && !inner.q[idx].internal_flags.has_seq {
                inner.q.remove(idx);
                continue;
            }
            if inner.eligible(&inner.q[idx]) {
                return inner.q.remove(idx);
            }
            idx += 1;
        }

        None
    }

    /// Number of queued packets across both bands.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.hiq.len() + inner.q.len()
    }

    /// True if both bands are empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake all consumers and make subsequent pops return `None`.
    pub fn stop(&self) {
        self.inner.lock().unwrap().done = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonoClock;

    fn data_pkt(nexthop: NodeId) -> NetPacket {
        let mut pkt = NetPacket::with_data(b"payload");
        pkt.pkt.hdr.nexthop = nexthop;
        pkt
    }

    #[test]
    fn test_fifo_order() {
        let q = NetQueue::new(QueueOrder::Fifo);
        let mut a = data_pkt(1);
        a.pkt.hdr.seq = crate::types::Seq(1);
        let mut b = data_pkt(1);
        b.pkt.hdr.seq = crate::types::Seq(2);
        q.push(a);
        q.push(b);
        assert_eq!(q.try_pop().unwrap().pkt.hdr.seq.0, 1);
        assert_eq!(q.try_pop().unwrap().pkt.hdr.seq.0, 2);
    }

    #[test]
    fn test_lifo_order() {
        let q = NetQueue::new(QueueOrder::Lifo);
        let mut a = data_pkt(1);
        a.pkt.hdr.seq = crate::types::Seq(1);
        let mut b = data_pkt(1);
        b.pkt.hdr.seq = crate::types::Seq(2);
        q.push(a);
        q.push(b);
        assert_eq!(q.try_pop().unwrap().pkt.hdr.seq.0, 2);
    }

    #[test]
    fn test_hi_band_wins() {
        let q = NetQueue::new(QueueOrder::Fifo);
        q.push(data_pkt(1));
        let mut ack = NetPacket::control_opportunity(1, 2);
        ack.pkt.hdr.seq = crate::types::Seq(99);
        q.push_hi_front(ack);
        assert_eq!(q.try_pop().unwrap().pkt.hdr.seq.0, 99);
    }

    #[test]
    fn test_gating_stalls_only_closed_destination() {
        let q = NetQueue::new(QueueOrder::Fifo);
        q.set_send_window_status(1, false);
        q.push(data_pkt(1));
        q.push(data_pkt(2));

        // Node 1 is gated, node 2's packet flows.
        let got = q.try_pop().unwrap();
        assert_eq!(got.pkt.hdr.nexthop, 2);
        assert!(q.try_pop().is_none());

        q.set_send_window_status(1, true);
        assert_eq!(q.try_pop().unwrap().pkt.hdr.nexthop, 1);
    }

    #[test]
    fn test_sequenced_packets_bypass_gating() {
        let q = NetQueue::new(QueueOrder::Fifo);
        q.set_send_window_status(1, false);
        let mut retrans = data_pkt(1);
        retrans.internal_flags.has_seq = true;
        q.push(retrans);
        assert!(q.try_pop().is_some());
    }

    #[test]
    fn test_expired_unsequenced_dropped_silently() {
        let q = NetQueue::new(QueueOrder::Fifo);
        let mut pkt = data_pkt(1);
        pkt.deadline = Some(MonoClock::now() - 1.0);
        q.push(pkt);
        q.push(data_pkt(2));

        assert_eq!(q.try_pop().unwrap().pkt.hdr.nexthop, 2);
        assert!(q.is_empty());
    }

    #[test]
    fn test_splice_front_preserves_order() {
        let q = NetQueue::new(QueueOrder::Fifo);
        q.push(data_pkt(9));

        let mut run = Vec::new();
        for i in 0..3u16 {
            let mut pkt = data_pkt(1);
            pkt.pkt.hdr.seq = crate::types::Seq(i);
            pkt.internal_flags.has_seq = true;
            run.push(pkt);
        }
        q.splice_front(run);

        assert_eq!(q.try_pop().unwrap().pkt.hdr.seq.0, 0);
        assert_eq!(q.try_pop().unwrap().pkt.hdr.seq.0, 1);
        assert_eq!(q.try_pop().unwrap().pkt.hdr.seq.0, 2);
        assert_eq!(q.try_pop().unwrap().pkt.hdr.nexthop, 9);
    }

    #[test]
    fn test_stop_wakes_blocked_pop() {
        let q = std::sync::Arc::new(NetQueue::new(QueueOrder::Fifo));
        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.pop());
        std::thread::sleep(std::time::Duration::from_millis(20));
        q.stop();
        assert!(handle.join().unwrap().is_none());
    }
}
