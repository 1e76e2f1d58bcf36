//! Slotted ALOHA MAC
//!
//! Every slot is a transmission candidate; the node modulates a slot with
//! probability `p` and otherwise stays quiet. There is no schedule and no
//! overfill: a burst never extends into a slot we may not win.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use rand::Rng;

use crate::clock::MonoClock;
use crate::mac::slotted::SlottedMac;
use crate::mac::{Load, Mac};
use crate::rt::{spawn_rt_thread, RtPriority};

/// A slotted-ALOHA MAC.
pub struct SlottedAloha {
    core: Arc<SlottedMac>,
    p: f64,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SlottedAloha {
    /// Create a slotted-ALOHA MAC transmitting with probability `p` and
    /// start its threads.
    pub fn new(core: Arc<SlottedMac>, p: f64) -> SlottedAloha {
        let mut threads = Vec::new();

        let rx_core = core.clone();
        threads.push(spawn_rt_thread("mac-rx", RtPriority::High, move || {
            rx_core.rx_worker();
        }));

        let notifier_core = core.clone();
        if let Some(rx) = core.take_txed_receiver() {
            threads.push(spawn_rt_thread("mac-tx-notify", RtPriority::Normal, move || {
                notifier_core.tx_notifier(rx);
            }));
        }

        let tx_core = core.clone();
        threads.push(spawn_rt_thread("mac-tx-slot", RtPriority::High, move || {
            tx_slot_worker(tx_core, p);
        }));

        core.can_transmit.store(true, Ordering::Relaxed);

        SlottedAloha {
            core,
            p,
            threads: Mutex::new(threads),
        }
    }

    /// The per-slot transmission probability.
    pub fn tx_prob(&self) -> f64 {
        self.p
    }
}

impl Mac for SlottedAloha {
    fn can_transmit(&self) -> bool {
        self.core.can_transmit.load(Ordering::Relaxed)
    }

    fn reconfigure(&self) {
        self.core.reconfigure();
    }

    fn pop_load(&self) -> Load {
        self.core.pop_load()
    }

    fn stop(&self) {
        self.core.shutdown();
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for SlottedAloha {
    fn drop(&mut self) {
        self.stop();
    }
}

fn tx_slot_worker(core: Arc<SlottedMac>, p: f64) {
    let mut rng = rand::thread_rng();
    let mut q: VecDeque<Arc<crate::phy::synthesizer::Slot>> = VecDeque::new();

    while !core.is_done() {
        let t_now = MonoClock::now();
        let t_next = core.next_slot_boundary(t_now);
        let t_following = t_next + core.config.slot_size;

        // Claim the modulated samples for the upcoming slot.
        let slot = core.finalize_with_deadline(&mut q, t_next);
        if let Some(slot) = slot {
            core.tx_slot(slot);
        }

        // Modulate the following slot with probability p. No overfill: we
        // may not win the slot after it.
        if rng.gen::<f64>() < p {
            let new_slot = core.new_slot(t_following, 0, false);
            core.synthesizer.modulate_slot(new_slot.clone());
            q.push_back(new_slot);
        }

        let delta = (t_following - MonoClock::now()) - core.config.slot_send_lead_time;
        if delta > 0.0 {
            MonoClock::sleep(delta);
        }
    }

    core.missed_remaining(&mut q);
}
