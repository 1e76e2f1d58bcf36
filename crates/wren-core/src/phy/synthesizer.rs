//! Parallel slot synthesizer
//!
//! A pool of modulation workers fills [`Slot`]s on demand. The MAC publishes
//! a slot; workers pull packets from the controller, modulate and upconvert
//! them, and append the result under the slot's mutex until the sample
//! budget is met or the queue runs dry. A packet whose tail would exceed the
//! budget may still be placed when the node also owns the next slot; the
//! overshoot is reported back to the MAC, which passes it to the next
//! `modulate_slot` call as `prev_overfill`.
//!
//! A slot becomes immutable once the MAC observes `closed == true` under the
//! slot mutex; a worker that modulated a packet too late parks it for the
//! next slot, and packets still parked at shutdown are handed back to the
//! controller as missed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::clock::MonoTime;
use crate::control::ControlMsg;
use crate::controller::Controller;
use crate::dsp::{MixingResampler, ResamplerParams};
use crate::iqbuf::IQBuf;
use crate::phy::{ModPacket, Phy};
use crate::types::Channel;

/// A scheduled transmission window.
#[derive(Debug)]
pub struct Slot {
    /// Time the slot's first sample must hit the air.
    pub deadline: MonoTime,
    /// Samples of the previous slot's burst occupying the head of this slot.
    pub prev_overfill: usize,
    /// Sample budget for this slot.
    pub max_samples: usize,
    /// True if the local node also owns the following slot.
    pub owns_next_slot: bool,
    /// Samples of delay before this slot's first own sample.
    pub delay: usize,
    inner: Mutex<SlotInner>,
}

#[derive(Debug, Default)]
pub struct SlotInner {
    /// Set once by the MAC; no writes may follow.
    pub closed: bool,
    /// Modulated sample buffers, in transmission order.
    pub iqbufs: Vec<Arc<IQBuf>>,
    /// The packets those buffers came from.
    pub mpkts: Vec<ModPacket>,
    /// Total samples across `mpkts`.
    pub nsamples: usize,
}

impl Slot {
    pub fn new(
        deadline: MonoTime,
        prev_overfill: usize,
        max_samples: usize,
        owns_next_slot: bool,
    ) -> Slot {
        Slot {
            deadline,
            prev_overfill,
            max_samples,
            owns_next_slot,
            delay: prev_overfill,
            inner: Mutex::new(SlotInner::default()),
        }
    }

    /// Run `f` with the slot contents locked.
    pub fn with_inner<R>(&self, f: impl FnOnce(&mut SlotInner) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Samples this slot occupies, including its head delay.
    pub fn length(&self) -> usize {
        self.delay + self.inner.lock().unwrap().nsamples
    }

    /// Samples written past the slot budget.
    pub fn overfill(&self) -> usize {
        self.length().saturating_sub(self.max_samples)
    }
}

struct SynthState {
    curslot: Option<Arc<Slot>>,
    done: bool,
}

struct Shared {
    state: Mutex<SynthState>,
    cond: Condvar,
    max_packet_size: AtomicUsize,
    config: Mutex<SynthConfig>,
}

#[derive(Clone)]
struct SynthConfig {
    tx_rate: f64,
    channel: Channel,
    resampler: ResamplerParams,
}

/// The parallel synthesizer.
pub struct SlotSynthesizer {
    phy: Arc<Phy>,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SlotSynthesizer {
    pub fn new(
        phy: Arc<Phy>,
        controller: Arc<dyn Controller>,
        tx_rate: f64,
        channel: Channel,
        resampler: ResamplerParams,
        nthreads: usize,
    ) -> SlotSynthesizer {
        let shared = Arc::new(Shared {
            state: Mutex::new(SynthState {
                curslot: None,
                done: false,
            }),
            cond: Condvar::new(),
            max_packet_size: AtomicUsize::new(0),
            config: Mutex::new(SynthConfig {
                tx_rate,
                channel,
                resampler,
            }),
        });

        let workers = (0..nthreads.max(1))
            .map(|i| {
                let phy = phy.clone();
                let controller = controller.clone();
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("synth-{i}"))
                    .spawn(move || mod_worker(phy, controller, shared))
                    .expect("failed to spawn synthesizer worker")
            })
            .collect();

        SlotSynthesizer {
            phy,
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Maximum upsample ratio applied during modulation.
    pub fn max_tx_upsample_rate(&self) -> f64 {
        let config = self.shared.config.lock().unwrap();
        tx_upsample_rate(&config, &self.phy)
    }

    /// Set the largest modulated packet the synthesizer will accept, in
    /// TX-rate samples.
    pub fn set_max_packet_size(&self, max: usize) {
        self.shared.max_packet_size.store(max, Ordering::Relaxed);
    }

    pub fn max_packet_size(&self) -> usize {
        self.shared.max_packet_size.load(Ordering::Relaxed)
    }

    /// Reconfigure the TX rate.
    pub fn set_tx_rate(&self, tx_rate: f64) {
        self.shared.config.lock().unwrap().tx_rate = tx_rate;
    }

    /// Reconfigure the TX channel.
    pub fn set_channel(&self, channel: Channel) {
        self.shared.config.lock().unwrap().channel = channel;
    }

    /// Publish a slot for the workers to fill.
    pub fn modulate_slot(&self, slot: Arc<Slot>) {
        let mut state = self.shared.state.lock().unwrap();
        state.curslot = Some(slot);
        drop(state);
        self.shared.cond.notify_all();
    }

    /// Close a slot and take exclusive ownership of its contents.
    ///
    /// After this returns, no worker will write to the slot.
    pub fn finalize_slot(&self, slot: &Arc<Slot>) {
        slot.with_inner(|inner| inner.closed = true);

        let mut state = self.shared.state.lock().unwrap();
        if let Some(cur) = &state.curslot {
            if Arc::ptr_eq(cur, slot) {
                state.curslot = None;
            }
        }
        drop(state);
        self.shared.cond.notify_all();
    }

    /// Stop the workers, handing parked packets back to the controller.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.done = true;
        }
        self.shared.cond.notify_all();

        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn tx_upsample_rate(config: &SynthConfig, phy: &Phy) -> f64 {
    if config.channel.bw <= 0.0 {
        1.0
    } else {
        config.tx_rate / (config.channel.bw * phy.min_tx_rate_oversample() as f64)
    }
}

/// Try to place a modulated packet in `slot`. Returns false if the slot is
/// closed or cannot take the packet.
fn try_append(slot: &Slot, mut mpkt: ModPacket) -> Result<(), ModPacket> {
    let mut inner = slot.inner.lock().unwrap();

    if inner.closed {
        return Err(mpkt);
    }
    if slot.delay + inner.nsamples >= slot.max_samples {
        return Err(mpkt);
    }

    let fits = slot.delay + inner.nsamples + mpkt.nsamples <= slot.max_samples;
    if !fits && !slot.owns_next_slot {
        return Err(mpkt);
    }

    mpkt.complete = true;
    inner.nsamples += mpkt.nsamples;
    inner.iqbufs.push(mpkt.samples.clone());
    inner.mpkts.push(mpkt);
    Ok(())
}

fn mod_worker(phy: Arc<Phy>, controller: Arc<dyn Controller>, shared: Arc<Shared>) {
    let mut modulator = Phy::mk_modulator(&phy);
    let mut resamp: Option<MixingResampler> = None;
    let mut cached: Option<(f64, f64)> = None;
    let mut parked: Option<ModPacket> = None;

    'outer: loop {
        // Wait for an open slot.
        let slot = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.done {
                    break 'outer;
                }
                if let Some(slot) = &state.curslot {
                    if !slot.is_closed() {
                        break slot.clone();
                    }
                }
                state = shared.cond.wait(state).unwrap();
            }
        };

        // Place a previously parked packet first.
        if let Some(mpkt) = parked.take() {
            match try_append(&slot, mpkt) {
                Ok(()) => {}
                Err(mpkt) => {
                    parked = Some(mpkt);
                    wait_for_other_slot(&shared, &slot);
                    continue;
                }
            }
        }

        // Pull and modulate the next packet.
        let mut pkt = match controller.pull() {
            Some(pkt) => pkt,
            None => {
                // Queue stopped; wait for shutdown.
                let mut state = shared.state.lock().unwrap();
                while !state.done {
                    state = shared.cond.wait(state).unwrap();
                }
                break;
            }
        };

        let config = shared.config.lock().unwrap().clone();
        let rate = tx_upsample_rate(&config, &phy);
        let rad = if config.tx_rate > 0.0 {
            2.0 * std::f64::consts::PI * config.channel.fc / config.tx_rate
        } else {
            0.0
        };

        if cached != Some((rate, rad)) {
            resamp = if rate != 1.0 || rad != 0.0 {
                Some(MixingResampler::new(rate, rad, &config.resampler))
            } else {
                None
            };
            cached = Some((rate, rad));
        }

        // Packets that must be timestamped sample-exact get their timestamp
        // stamped with the slot deadline right before modulation.
        if pkt.internal_flags.timestamp {
            pkt.append_control(ControlMsg::Timestamp {
                t_sent: slot.deadline,
            });
        }

        let gain = pkt.g
            * phy
                .mcs(pkt.mcsidx)
                .map(|entry| entry.autogain.soft_tx_gain())
                .unwrap_or(1.0);

        let mut mpkt = match modulator.modulate(pkt, gain) {
            Ok(mpkt) => mpkt,
            Err(err) => {
                tracing::warn!(%err, "dropping unmodulatable packet");
                continue;
            }
        };
        mpkt.channel = config.channel;

        // Upconvert to the TX rate.
        if let Some(resamp) = resamp.as_mut() {
            resamp.reset();
            let mut padded = mpkt.samples.samples().to_vec();
            padded.extend(std::iter::repeat(num_complex::Complex::default()).take(resamp.delay().ceil() as usize));
            let up = resamp.resample_mix_up(&padded);
            let delay = (resamp.rate() * resamp.delay()).floor() as usize;

            let mut iqbuf = IQBuf::from_samples(up);
            iqbuf.delay = delay;
            mpkt.offset = delay;
            mpkt.nsamples = iqbuf.len() - delay;
            mpkt.samples = Arc::new(iqbuf);
        }

        let max = shared.max_packet_size.load(Ordering::Relaxed);
        if max != 0 && mpkt.nsamples > max {
            tracing::warn!(
                nsamples = mpkt.nsamples,
                max,
                "dropping modulated packet too long for a slot"
            );
            continue;
        }

        match try_append(&slot, mpkt) {
            Ok(()) => {}
            Err(mpkt) => {
                parked = Some(mpkt);
                wait_for_other_slot(&shared, &slot);
            }
        }
    }

    if let Some(mpkt) = parked.take() {
        controller.missed(mpkt.pkt);
    }
}

/// Block until the published slot is no longer `slot`, or shutdown.
fn wait_for_other_slot(shared: &Shared, slot: &Arc<Slot>) {
    let mut state = shared.state.lock().unwrap();
    while !state.done {
        match &state.curslot {
            Some(cur) if Arc::ptr_eq(cur, slot) && !slot.is_closed() => {}
            _ => break,
        }
        state = shared.cond.wait(state).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::DummyController;
    use crate::mcs::default_mcs_table;
    use crate::netqueue::{NetQueue, QueueOrder};
    use crate::packet::{NetPacket, RadioPacket};

    fn mk_synth(netq: Arc<NetQueue>, nthreads: usize) -> SlotSynthesizer {
        let phy = Arc::new(Phy::new(1, default_mcs_table(), None, 2048).unwrap());
        let sink: Arc<dyn crate::controller::PacketSink> = Arc::new(|_pkt: RadioPacket| {});
        let controller = Arc::new(DummyController::new(netq, sink));
        SlotSynthesizer::new(
            phy,
            controller,
            0.0,
            Channel::default(),
            ResamplerParams::default(),
            nthreads,
        )
    }

    fn data_pkt(n: usize) -> NetPacket {
        let mut pkt = NetPacket::with_data(&vec![0xa5; n]);
        pkt.pkt.hdr.curhop = 1;
        pkt.pkt.hdr.nexthop = 2;
        pkt
    }

    fn wait_filled(slot: &Arc<Slot>, want: usize) {
        for _ in 0..400 {
            if slot.with_inner(|inner| inner.mpkts.len()) >= want {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    #[test]
    fn test_slot_fills_and_respects_budget() {
        let netq = Arc::new(NetQueue::new(QueueOrder::Fifo));
        let synth = mk_synth(netq.clone(), 2);

        for _ in 0..3 {
            netq.push(data_pkt(64));
        }

        // Budget for two packets, no overfill allowed.
        let per_pkt = crate::phy::framing::frame_syms(&default_mcs_table()[0], 64 + 6);
        let slot = Arc::new(Slot::new(MonoTime(1.0), 0, 2 * per_pkt, false));
        synth.modulate_slot(slot.clone());
        wait_filled(&slot, 2);
        synth.finalize_slot(&slot);

        slot.with_inner(|inner| {
            assert!(inner.closed);
            assert_eq!(inner.mpkts.len(), 2);
            assert!(inner.nsamples + slot.delay <= slot.max_samples);
            assert!(inner.mpkts.iter().all(|m| m.complete));
        });
        assert_eq!(slot.overfill(), 0);

        netq.stop();
        synth.stop();
    }

    #[test]
    fn test_overfill_only_when_next_slot_owned() {
        let netq = Arc::new(NetQueue::new(QueueOrder::Fifo));
        let synth = mk_synth(netq.clone(), 1);

        netq.push(data_pkt(64));
        netq.push(data_pkt(64));

        // Budget of 1.5 packets with the next slot owned: the second packet
        // overfills.
        let per_pkt = crate::phy::framing::frame_syms(&default_mcs_table()[0], 64 + 6);
        let budget = per_pkt + per_pkt / 2;
        let slot = Arc::new(Slot::new(MonoTime(1.0), 0, budget, true));
        synth.modulate_slot(slot.clone());
        wait_filled(&slot, 2);
        synth.finalize_slot(&slot);

        assert_eq!(slot.with_inner(|inner| inner.mpkts.len()), 2);
        assert_eq!(slot.overfill(), 2 * per_pkt - budget);

        netq.stop();
        synth.stop();
    }

    #[test]
    fn test_no_writes_after_finalize() {
        let netq = Arc::new(NetQueue::new(QueueOrder::Fifo));
        let synth = mk_synth(netq.clone(), 2);

        let slot = Arc::new(Slot::new(MonoTime(1.0), 0, 1 << 20, false));
        synth.modulate_slot(slot.clone());
        synth.finalize_slot(&slot);

        // Packets arriving after finalize must not land in the closed slot.
        netq.push(data_pkt(32));
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(slot.with_inner(|inner| inner.mpkts.len()), 0);

        netq.stop();
        synth.stop();
    }
}
