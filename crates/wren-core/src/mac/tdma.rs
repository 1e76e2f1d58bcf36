//! TDMA MAC
//!
//! Divides time into frames of `nslots` slots; the schedule bitmap says
//! which slot indices the local node owns. The TX slot thread finalizes the
//! upcoming owned slot at `slot_send_lead_time` before its deadline and
//! starts synthesis of the following owned slot `slot_modulate_lead_time`
//! ahead of its own deadline.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::clock::{MonoClock, MonoTime};
use crate::mac::schedule::Schedule;
use crate::mac::slotted::SlottedMac;
use crate::mac::{Load, Mac};
use crate::rt::{spawn_rt_thread, RtPriority};

/// A TDMA MAC.
pub struct Tdma {
    core: Arc<SlottedMac>,
    nslots: usize,
    schedule: Arc<Mutex<Schedule>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Tdma {
    /// Create a TDMA MAC over `nslots` slots and start its threads.
    pub fn new(core: Arc<SlottedMac>, nslots: usize) -> Tdma {
        let schedule = Arc::new(Mutex::new(Schedule::new(nslots)));

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
        let tx_schedule = schedule.clone();
        threads.push(spawn_rt_thread("mac-tx-slot", RtPriority::High, move || {
            tx_slot_worker(tx_core, tx_schedule, nslots);
        }));

        Tdma {
            core,
            nslots,
            schedule,
            threads: Mutex::new(threads),
        }
    }

    /// Number of slots in a TDMA frame.
    pub fn nslots(&self) -> usize {
        self.nslots
    }

    /// Install a new slot schedule.
    pub fn set_schedule(&self, schedule: Schedule) {
        *self.schedule.lock().unwrap() = schedule;
        self.reconfigure();
    }

    /// Frame length in seconds.
    pub fn frame_size(&self) -> f64 {
        self.nslots as f64 * self.core.config.slot_size
    }
}

impl Mac for Tdma {
    fn can_transmit(&self) -> bool {
        self.core.can_transmit.load(Ordering::Relaxed)
    }

    fn reconfigure(&self) {
        self.core.reconfigure();
        let any = self.schedule.lock().unwrap().any();
        self.core.can_transmit.store(any, Ordering::Relaxed);
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

impl Drop for Tdma {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Find the next and following owned slots after `t`.
///
/// Returns `(t_next, next_slotidx, t_following, following_slotidx)`.
fn find_next_slot(
    t: MonoTime,
    slot_size: f64,
    nslots: usize,
    schedule: &Schedule,
) -> Option<(MonoTime, usize, MonoTime, usize)> {
    let frame_size = nslots as f64 * slot_size;
    let t_slot_pos = t.secs() % slot_size;
    let cur_slot = ((t.secs() % frame_size) / slot_size) as usize % nslots;

    let mut next = None;
    for tx_slot in 1..=nslots {
        let idx = (cur_slot + tx_slot) % nslots;
        if schedule.can_transmit(idx) {
            let t_next = t + (tx_slot as f64 * slot_size - t_slot_pos);
            next = Some((t_next, idx));
            break;
        }
    }
    let (t_next, next_idx) = next?;

    for tx_slot in 1..=nslots {
        let idx = (next_idx + tx_slot) % nslots;
        if schedule.can_transmit(idx) {
            let t_following = t_next + tx_slot as f64 * slot_size;
            return Some((t_next, next_idx, t_following, idx));
        }
    }

    None
}

fn tx_slot_worker(core: Arc<SlottedMac>, schedule: Arc<Mutex<Schedule>>, nslots: usize) {
    let slot_size = core.config.slot_size;
    let mut q: VecDeque<Arc<crate::phy::synthesizer::Slot>> = VecDeque::new();

    'restart: while !core.is_done() {
        let mut t_prev = MonoTime(0.0);

        while !core.is_done() {
            let t_now = MonoClock::now();

            let sched = schedule.lock().unwrap().clone();
            let found = find_next_slot(t_now, slot_size, nslots, &sched);
            let (t_next, _next_idx, t_following, following_idx) = match found {
                Some(v) => v,
                None => {
                    core.can_transmit.store(false, Ordering::Relaxed);
                    MonoClock::sleep(0.1);
                    continue;
                }
            };
            core.can_transmit.store(true, Ordering::Relaxed);

            // Claim the modulated samples for the upcoming slot.
            let slot = core.finalize_with_deadline(&mut q, t_next);
            let noverfill = slot.as_ref().map(|s| s.overfill()).unwrap_or(0);

            if let Some(slot) = slot {
                core.tx_slot(slot);
            }

            if core.device.tx_late_count() != 0 {
                break;
            }

            // Begin synthesis of the following slot ahead of its deadline.
            if (t_following - t_prev).abs() > 1e-9 {
                let t_modulate = t_following - core.config.slot_modulate_lead_time;
                if t_modulate > MonoClock::now() {
                    MonoClock::sleep_until(t_modulate);
                }
                if core.is_done() {
                    break 'restart;
                }

                let owns_after = sched.can_transmit((following_idx + 1) % nslots);
                let new_slot = core.new_slot(t_following, noverfill, owns_after);
                core.synthesizer.modulate_slot(new_slot.clone());
                q.push_back(new_slot);
                t_prev = t_following;
            }

            let delta =
                (t_following - MonoClock::now()) - core.config.slot_send_lead_time;
            if delta > 0.0 {
                MonoClock::sleep(delta);
            }
        }

        if core.is_done() {
            break;
        }

        // TX errors: reset the burst state and try again.
        tracing::warn!("MAC: attempting to reset TX loop");
        core.missed_remaining(&mut q);
        MonoClock::sleep(slot_size / 2.0);
    }

    core.missed_remaining(&mut q);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_next_slot_basic() {
        let mut sched = Schedule::new(2);
        sched.set(0, true);

        // At t = 0.01 in slot 0 of a 2-slot frame of 0.1 s slots, the next
        // owned slot is slot 0 of the next frame at t = 0.2, and the
        // following one is a full frame later.
        let got = find_next_slot(MonoTime(0.01), 0.1, 2, &sched).unwrap();
        let (t_next, next_idx, t_following, following_idx) = got;
        assert_eq!(next_idx, 0);
        assert!((t_next.secs() - 0.2).abs() < 1e-9);
        assert_eq!(following_idx, 0);
        assert!((t_following.secs() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_find_next_slot_mid_frame() {
        let mut sched = Schedule::new(2);
        sched.set(1, true);

        // At t = 0.01 (slot 0), the next owned slot is slot 1 at t = 0.1.
        let (t_next, next_idx, t_following, _) =
            find_next_slot(MonoTime(0.01), 0.1, 2, &sched).unwrap();
        assert_eq!(next_idx, 1);
        assert!((t_next.secs() - 0.1).abs() < 1e-9);
        assert!((t_following.secs() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_find_next_slot_no_schedule() {
        let sched = Schedule::new(4);
        assert!(find_next_slot(MonoTime(0.0), 0.1, 4, &sched).is_none());
    }

    #[test]
    fn test_adjacent_slots_owned() {
        let sched = Schedule::from_slots(vec![true, true]);
        let (t_next, next_idx, t_following, following_idx) =
            find_next_slot(MonoTime(0.05), 0.1, 2, &sched).unwrap();
        assert_eq!(next_idx, 1);
        assert!((t_next.secs() - 0.1).abs() < 1e-9);
        assert_eq!(following_idx, 0);
        assert!((t_following.secs() - 0.2).abs() < 1e-9);
    }
}
