//! Monotonic one-shot timer queue
//!
//! A priority queue of timers keyed by [`MonoTime`] deadline, driven by a
//! single thread that sleeps until the nearest deadline and dispatches due
//! events to a registered handler *outside* the queue lock, so handlers may
//! reschedule their own timer without deadlocking.
//!
//! Each timer is identified by a [`TimerHandle`] holding a state machine
//! {inactive, queued, firing} and a generation counter. `cancel` transitions
//! queued → inactive; a timer whose event is already being dispatched is
//! allowed to complete, and its handler must re-check its own invariants
//! under its own locks. Stale heap entries (cancelled or rescheduled) are
//! discarded lazily by generation mismatch.
//!
//! ## Example
//!
//! ```rust,no_run
//! use wren_core::timer_queue::TimerQueue;
//!
//! let tq: TimerQueue<u32> = TimerQueue::new();
//! tq.start(|ev| println!("timer fired: {ev}"));
//!
//! let t = tq.new_timer();
//! tq.run_in(&t, 42, 0.010);
//! ```

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::clock::{MonoClock, MonoTime};

/// Timer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Not scheduled.
    Inactive,
    /// Waiting in the queue.
    Queued,
    /// Popped from the queue; its handler is running.
    Firing,
}

#[derive(Debug)]
struct TimerCtl {
    state: Mutex<(TimerState, u64)>,
}

/// A handle identifying one timer across schedule/cancel/fire.
#[derive(Debug, Clone)]
pub struct TimerHandle(Arc<TimerCtl>);

impl TimerHandle {
    fn new() -> TimerHandle {
        TimerHandle(Arc::new(TimerCtl {
            state: Mutex::new((TimerState::Inactive, 0)),
        }))
    }

    /// Current state of the timer.
    pub fn state(&self) -> TimerState {
        self.0.state.lock().unwrap().0
    }
}

struct Entry<E> {
    deadline: MonoTime,
    generation: u64,
    ctl: Arc<TimerCtl>,
    event: E,
}

impl<E> PartialEq for Entry<E> {
    fn eq(&self, other: &Entry<E>) -> bool {
        self.deadline == other.deadline
    }
}

impl<E> Eq for Entry<E> {}

impl<E> PartialOrd for Entry<E> {
    fn partial_cmp(&self, other: &Entry<E>) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Entry<E> {
    fn cmp(&self, other: &Entry<E>) -> CmpOrdering {
        // Reverse order: BinaryHeap is a max-heap, we want the earliest
        // deadline on top.
        other
            .deadline
            .partial_cmp(&self.deadline)
            .unwrap_or(CmpOrdering::Equal)
    }
}

struct QueueState<E> {
    heap: BinaryHeap<Entry<E>>,
    done: bool,
}

struct Inner<E> {
    state: Mutex<QueueState<E>>,
    cond: Condvar,
}

/// The timer queue.
pub struct TimerQueue<E: Send + 'static> {
    inner: Arc<Inner<E>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Send + 'static> Default for TimerQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Send + 'static> TimerQueue<E> {
    pub fn new() -> TimerQueue<E> {
        TimerQueue {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    heap: BinaryHeap::new(),
                    done: false,
                }),
                cond: Condvar::new(),
            }),
            driver: Mutex::new(None),
        }
    }

    /// Create a timer usable with this queue.
    pub fn new_timer(&self) -> TimerHandle {
        TimerHandle::new()
    }

    /// Schedule `timer` to fire with `event` after `delta` seconds.
    ///
    /// Rescheduling an already-queued timer replaces its deadline.
    pub fn run_in(&self, timer: &TimerHandle, event: E, delta: f64) {
        self.run_at(timer, event, MonoClock::now() + delta);
    }

    /// Schedule `timer` to fire with `event` at `when`.
    pub fn run_at(&self, timer: &TimerHandle, event: E, when: MonoTime) {
        let generation;
        {
            let mut st = timer.0.state.lock().unwrap();
            st.1 += 1;
            st.0 = TimerState::Queued;
            generation = st.1;
        }

        let mut qs = self.inner.state.lock().unwrap();
        qs.heap.push(Entry {
            deadline: when,
            generation,
            ctl: timer.0.clone(),
            event,
        });
        self.inner.cond.notify_all();
    }

    /// Return true if the timer is queued.
    pub fn running(&self, timer: &TimerHandle) -> bool {
        timer.state() == TimerState::Queued
    }

    /// Cancel a queued timer. A firing timer is allowed to complete.
    pub fn cancel(&self, timer: &TimerHandle) {
        let mut st = timer.0.state.lock().unwrap();
        if st.0 == TimerState::Queued {
            st.0 = TimerState::Inactive;
            st.1 += 1; // Invalidate the pending heap entry.
        }
    }

    /// Start the driver thread dispatching due timers to `handler`.
    pub fn start<F>(&self, handler: F)
    where
        F: Fn(E) + Send + 'static,
    {
        let inner = self.inner.clone();
        {
            let mut qs = inner.state.lock().unwrap();
            qs.done = false;
        }

        let handle = std::thread::Builder::new()
            .name("timer-queue".into())
            .spawn(move || Self::drive(inner, handler))
            .expect("failed to spawn timer thread");

        *self.driver.lock().unwrap() = Some(handle);
    }

    /// Stop the driver thread and drain the queue.
    pub fn stop(&self) {
        {
            let mut qs = self.inner.state.lock().unwrap();
            qs.done = true;
            qs.heap.clear();
        }
        self.inner.cond.notify_all();

        if let Some(handle) = self.driver.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn drive<F>(inner: Arc<Inner<E>>, handler: F)
    where
        F: Fn(E) + Send + 'static,
    {
        let mut qs = inner.state.lock().unwrap();

        loop {
            if qs.done {
                return;
            }

            let now = MonoClock::now();

            // Pop and dispatch all due timers.
            while let Some(top) = qs.heap.peek() {
                if top.deadline > now {
                    break;
                }

                let entry = qs.heap.pop().unwrap();

                // Check the timer's state before firing; cancelled or
                // rescheduled entries have a stale generation.
                let fire = {
                    let mut st = entry.ctl.state.lock().unwrap();
                    if st.0 == TimerState::Queued && st.1 == entry.generation {
                        st.0 = TimerState::Firing;
                        true
                    } else {
                        false
                    }
                };

                if fire {
                    drop(qs);
                    handler(entry.event);

                    // The handler may have rescheduled the timer; only
                    // transition to inactive if it is still our firing.
                    {
                        let mut st = entry.ctl.state.lock().unwrap();
                        if st.0 == TimerState::Firing && st.1 == entry.generation {
                            st.0 = TimerState::Inactive;
                        }
                    }

                    qs = inner.state.lock().unwrap();
                    if qs.done {
                        return;
                    }
                }
            }

            // Sleep until the nearest deadline or a new insertion.
            let next_deadline = qs.heap.peek().map(|top| top.deadline);
            match next_deadline {
                None => {
                    qs = inner.cond.wait(qs).unwrap();
                }
                Some(deadline) => {
                    let delta = deadline - MonoClock::now();
                    if delta > 0.0 {
                        let (guard, _) = inner
                            .cond
                            .wait_timeout(qs, std::time::Duration::from_secs_f64(delta))
                            .unwrap();
                        qs = guard;
                    }
                }
            }
        }
    }
}

impl<E: Send + 'static> Drop for TimerQueue<E> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_timer_fires_in_order() {
        let tq: TimerQueue<u32> = TimerQueue::new();
        let (tx, rx) = mpsc::channel();
        tq.start(move |ev| {
            let _ = tx.send(ev);
        });

        let a = tq.new_timer();
        let b = tq.new_timer();
        tq.run_in(&b, 2, 0.040);
        tq.run_in(&a, 1, 0.010);

        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap(), 2);
        tq.stop();
    }

    #[test]
    fn test_cancel_prevents_fire() {
        let tq: TimerQueue<u32> = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        tq.start(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        let t = tq.new_timer();
        tq.run_in(&t, 0, 0.050);
        assert!(tq.running(&t));
        tq.cancel(&t);
        assert!(!tq.running(&t));

        std::thread::sleep(std::time::Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tq.stop();
    }

    #[test]
    fn test_reschedule_replaces_deadline() {
        let tq: TimerQueue<u32> = TimerQueue::new();
        let (tx, rx) = mpsc::channel();
        tq.start(move |ev| {
            let _ = tx.send(ev);
        });

        let t = tq.new_timer();
        tq.run_in(&t, 1, 10.0);
        tq.run_in(&t, 2, 0.010);

        // Only the rescheduled event fires.
        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap(), 2);
        assert!(rx
            .recv_timeout(std::time::Duration::from_millis(100))
            .is_err());
        tq.stop();
    }

    #[test]
    fn test_timer_state_transitions() {
        let tq: TimerQueue<u32> = TimerQueue::new();
        let t = tq.new_timer();
        assert_eq!(t.state(), TimerState::Inactive);
        tq.run_in(&t, 0, 60.0);
        assert_eq!(t.state(), TimerState::Queued);
        tq.cancel(&t);
        assert_eq!(t.state(), TimerState::Inactive);
    }

    #[test]
    fn test_stop_drains_queue() {
        let tq: TimerQueue<u32> = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        tq.start(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        let t = tq.new_timer();
        tq.run_in(&t, 0, 5.0);
        tq.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
