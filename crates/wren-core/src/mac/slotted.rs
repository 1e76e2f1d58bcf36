//! Shared machinery for slotted MACs
//!
//! [`SlottedMac`] owns everything TDMA and slotted ALOHA have in common: the
//! RX worker receiving whole slots into the channelizer, slot
//! finalize/transmit against the device, the TX notifier informing the
//! controller of completed transmissions, and the missed-deadline policy.
//!
//! Lock and thread discipline: a slot is closed under its own mutex by
//! `finalize`, establishing the happens-before edge between the last
//! synthesizer write and the burst transmission. The TX notifier drains a
//! bounded channel of transmitted slots so retransmission timers start off
//! the slot thread's critical path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};

use crate::clock::{MonoClock, MonoTime};
use crate::config::MacConfig;
use crate::controller::Controller;
use crate::device::RadioDevice;
use crate::iqbuf::IQBuf;
use crate::logger::{log_event, LoggerRef, RadioEvent};
use crate::mac::Load;
use crate::phy::channelizer::Channelizer;
use crate::phy::synthesizer::{Slot, SlotSynthesizer};
use crate::types::Channel;

/// Slot deadlines closer than this are the same slot.
const DEADLINE_EPS: f64 = 1e-6;

/// The shared slotted-MAC core.
pub struct SlottedMac {
    pub(crate) device: Arc<dyn RadioDevice>,
    pub(crate) controller: Arc<dyn Controller>,
    pub(crate) channelizer: Arc<Channelizer>,
    pub(crate) synthesizer: Arc<SlotSynthesizer>,
    pub(crate) logger: LoggerRef,
    pub(crate) config: MacConfig,
    channels: Vec<Channel>,

    pub(crate) done: AtomicBool,
    pub(crate) can_transmit: AtomicBool,
    rx_slot_samps: AtomicUsize,
    tx_slot_samps: AtomicUsize,
    in_burst: AtomicBool,
    load: Mutex<Load>,

    txed_tx: Mutex<Option<Sender<Arc<Slot>>>>,
    txed_rx: Mutex<Option<Receiver<Arc<Slot>>>>,
}

impl SlottedMac {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Arc<dyn RadioDevice>,
        controller: Arc<dyn Controller>,
        channelizer: Arc<Channelizer>,
        synthesizer: Arc<SlotSynthesizer>,
        channels: Vec<Channel>,
        config: MacConfig,
        logger: LoggerRef,
    ) -> Arc<SlottedMac> {
        let (tx, rx) = crossbeam_channel::bounded(16);

        let mac = Arc::new(SlottedMac {
            device,
            controller,
            channelizer,
            synthesizer,
            logger,
            config,
            channels,
            done: AtomicBool::new(false),
            can_transmit: AtomicBool::new(false),
            rx_slot_samps: AtomicUsize::new(0),
            tx_slot_samps: AtomicUsize::new(0),
            in_burst: AtomicBool::new(false),
            load: Mutex::new(Load::new()),
            txed_tx: Mutex::new(Some(tx)),
            txed_rx: Mutex::new(Some(rx)),
        });
        mac.reconfigure();
        mac
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Number of RX samples in a full slot.
    pub fn rx_slot_samps(&self) -> usize {
        self.rx_slot_samps.load(Ordering::Relaxed)
    }

    /// Number of TX samples in the non-guard portion of a slot.
    pub fn tx_slot_samps(&self) -> usize {
        self.tx_slot_samps.load(Ordering::Relaxed)
    }

    /// Recompute rate-derived parameters.
    pub fn reconfigure(&self) {
        let rx_rate = self.device.rx_rate();
        let tx_rate = self.device.tx_rate();
        let slot = self.config.slot_size;
        let guard = self.config.guard_size;

        self.rx_slot_samps
            .store((rx_rate * slot).round() as usize, Ordering::Relaxed);
        self.tx_slot_samps
            .store((tx_rate * (slot - guard)).round() as usize, Ordering::Relaxed);

        self.synthesizer.set_tx_rate(tx_rate);
        self.synthesizer.set_max_packet_size(self.tx_slot_samps());
        self.channelizer.reconfigure(
            rx_rate,
            self.channels.clone(),
            guard + self.config.demod_overlap_size,
            slot - guard,
        );
    }

    /// Take the TX-notification receiver; the notifier thread owns it.
    pub(crate) fn take_txed_receiver(&self) -> Option<Receiver<Arc<Slot>>> {
        self.txed_rx.lock().unwrap().take()
    }

    /// The first slot boundary after `t`.
    pub fn next_slot_boundary(&self, t: MonoTime) -> MonoTime {
        let slot = self.config.slot_size;
        MonoTime(((t.secs() / slot).floor() + 1.0) * slot)
    }

    /// Create a slot scheduled at `deadline`.
    pub(crate) fn new_slot(
        &self,
        deadline: MonoTime,
        prev_overfill: usize,
        owns_next_slot: bool,
    ) -> Arc<Slot> {
        Arc::new(Slot::new(
            deadline,
            prev_overfill,
            self.tx_slot_samps(),
            owns_next_slot,
        ))
    }

    /// The RX worker: timed receive of one slot at a time, into the
    /// channelizer. Discontinuities bump the buffer sequence so in-flight
    /// demodulators are invalidated.
    pub(crate) fn rx_worker(&self) {
        let mut seq: u64 = 1;
        let slot = self.config.slot_size;

        let mut t_next = self.next_slot_boundary(MonoClock::now());
        if let Err(err) = self.device.start_rx_stream(t_next) {
            tracing::warn!(%err, "could not start RX stream");
            return;
        }

        while !self.is_done() {
            let nsamples = self.rx_slot_samps();
            if nsamples == 0 {
                MonoClock::sleep_until(t_next);
                t_next = t_next + slot;
                continue;
            }

            // If we fell badly behind, resynchronize to the clock and
            // invalidate the demodulation pipeline.
            if t_next + slot < MonoClock::now() {
                tracing::warn!("RX fell behind; resynchronizing");
                seq += 2;
                t_next = self.next_slot_boundary(MonoClock::now());
            }

            let mut buf = IQBuf::new(nsamples);
            buf.timestamp = t_next;
            buf.seq = seq;
            let buf = Arc::new(buf);

            if self.device.burst_rx(t_next, nsamples, &buf) {
                self.channelizer.push(buf);
                seq += 1;
                t_next = t_next + slot;
            } else {
                // RX overflow or a late request; restart the stream and
                // invalidate the demodulation pipeline.
                tracing::warn!("RX error; restarting stream");
                seq += 2;
                let _ = self.device.stop_rx_stream();
                t_next = self.next_slot_boundary(MonoClock::now());
                if self.device.start_rx_stream(t_next).is_err() {
                    break;
                }
            }
        }

        let _ = self.device.stop_rx_stream();
    }

    /// The TX notifier: informs the controller of each transmitted packet,
    /// which starts retransmission timers and clears selective-ACK timers.
    pub(crate) fn tx_notifier(&self, rx: Receiver<Arc<Slot>>) {
        while let Ok(slot) = rx.recv() {
            let mpkts = slot.with_inner(|inner| std::mem::take(&mut inner.mpkts));
            for mpkt in &mpkts {
                self.controller.transmitted(&mpkt.pkt);
            }
        }
    }

    /// Finalize the slot scheduled at `deadline` from the pending queue.
    ///
    /// Stale slots (deadline already behind `deadline`) are treated as
    /// missed. Returns `None` when there is nothing to send or the slot's
    /// own deadline has already passed.
    pub(crate) fn finalize_with_deadline(
        &self,
        q: &mut VecDeque<Arc<Slot>>,
        deadline: MonoTime,
    ) -> Option<Arc<Slot>> {
        while let Some(front) = q.front() {
            if front.deadline < deadline - DEADLINE_EPS {
                let slot = q.pop_front().unwrap();
                self.missed_slot(&slot);
                continue;
            }

            if (front.deadline - deadline).abs() <= DEADLINE_EPS {
                let slot = q.pop_front().unwrap();
                self.synthesizer.finalize_slot(&slot);

                if MonoClock::now() >= slot.deadline {
                    // Too late to make the deadline: abandon the burst and
                    // requeue the slot's packets.
                    self.in_burst.store(false, Ordering::Relaxed);
                    self.missed_slot(&slot);
                    return None;
                }
                return Some(slot);
            }

            // The queue's head is for a later slot.
            break;
        }
        None
    }

    /// Hand a missed slot's packets back to the controller. Timestamped
    /// packets are dropped; they are regenerated at the next HELLO.
    pub(crate) fn missed_slot(&self, slot: &Arc<Slot>) {
        self.synthesizer.finalize_slot(slot);
        let mpkts = slot.with_inner(|inner| std::mem::take(&mut inner.mpkts));
        if !mpkts.is_empty() {
            log_event(
                &self.logger,
                RadioEvent::Event {
                    msg: format!(
                        "MAC: missed slot deadline={} npackets={}",
                        slot.deadline,
                        mpkts.len()
                    ),
                },
            );
        }
        for mpkt in mpkts {
            if mpkt.pkt.internal_flags.timestamp {
                continue;
            }
            self.controller.missed(mpkt.pkt);
        }
    }

    /// Hand back every slot still pending; used at shutdown and TX-error
    /// recovery.
    pub(crate) fn missed_remaining(&self, q: &mut VecDeque<Arc<Slot>>) {
        for slot in q.drain(..) {
            self.missed_slot(&slot);
        }
    }

    /// Transmit a finalized slot's samples as a timed burst.
    pub(crate) fn tx_slot(&self, slot: Arc<Slot>) {
        let (iqbufs, nsamples, npackets) =
            slot.with_inner(|inner| (inner.iqbufs.clone(), inner.nsamples, inner.mpkts.len()));

        if npackets == 0 {
            self.in_burst.store(false, Ordering::Relaxed);
            return;
        }

        let tx_rate = self.device.tx_rate();
        let when = slot.deadline + slot.delay as f64 / tx_rate.max(1.0);
        let overfill = slot.overfill();
        let start_of_burst = !self.in_burst.load(Ordering::Relaxed);
        let end_of_burst = overfill == 0;

        if let Err(err) = self
            .device
            .burst_tx(when, start_of_burst, end_of_burst, &iqbufs)
        {
            tracing::warn!(%err, "burst TX failed");
        }
        self.in_burst.store(overfill > 0, Ordering::Relaxed);

        {
            let mut load = self.load.lock().unwrap();
            load.nsamples += nsamples;
            load.end = MonoClock::now();
        }
        log_event(
            &self.logger,
            RadioEvent::SlotTx {
                deadline: slot.deadline,
                nsamples,
                npackets,
            },
        );

        // Hand the slot to the notifier.
        let tx = self.txed_tx.lock().unwrap();
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(slot);
        }
    }

    /// Current load, resetting the counters.
    pub fn pop_load(&self) -> Load {
        let mut load = self.load.lock().unwrap();
        let mut out = load.clone();
        out.end = MonoClock::now();
        *load = Load::new();
        out
    }

    /// Signal shutdown: stops the RX stream and closes the TX-notification
    /// channel. Callers join their own threads afterwards.
    pub(crate) fn shutdown(&self) {
        self.done.store(true, Ordering::Release);
        self.txed_tx.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_slot_boundary() {
        // Build a core-free check of the boundary arithmetic by mimicking
        // the computation directly.
        let slot: f64 = 0.05;
        let t: f64 = 1.236;
        let next = ((t / slot).floor() + 1.0) * slot;
        assert!((next - 1.25).abs() < 1e-9);
        assert!(next > t);
    }
}
