//! Background work queue
//!
//! A small pool of worker threads draining a task queue. The PHY uses one to
//! run soft-gain estimation off the modulation fast path.
//!
//! ## Example
//!
//! ```rust
//! use wren_core::workqueue::WorkQueue;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let count = Arc::new(AtomicUsize::new(0));
//! let count2 = count.clone();
//! let wq = WorkQueue::new(2, move |n: usize| {
//!     count2.fetch_add(n, Ordering::SeqCst);
//! });
//! wq.submit(3);
//! wq.submit(4);
//! wq.stop();
//! assert_eq!(count.load(Ordering::SeqCst), 7);
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

struct Inner<T> {
    queue: Mutex<(VecDeque<T>, bool)>,
    cond: Condvar,
}

/// A work queue running `f` on submitted items from worker threads.
pub struct WorkQueue<T: Send + 'static> {
    inner: Arc<Inner<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Spawn `nthreads` workers applying `f` to each submitted item.
    pub fn new<F>(nthreads: usize, f: F) -> WorkQueue<T>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let inner = Arc::new(Inner {
            queue: Mutex::new((VecDeque::new(), false)),
            cond: Condvar::new(),
        });
        let f = Arc::new(f);

        let workers = (0..nthreads.max(1))
            .map(|i| {
                let inner = inner.clone();
                let f = f.clone();
                std::thread::Builder::new()
                    .name(format!("work-queue-{i}"))
                    .spawn(move || loop {
                        let item = {
                            let mut q = inner.queue.lock().unwrap();
                            loop {
                                if let Some(item) = q.0.pop_front() {
                                    break item;
                                }
                                if q.1 {
                                    return;
                                }
                                q = inner.cond.wait(q).unwrap();
                            }
                        };
                        f(item);
                    })
                    .expect("failed to spawn work queue thread")
            })
            .collect();

        WorkQueue {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Submit an item for processing.
    pub fn submit(&self, item: T) {
        let mut q = self.inner.queue.lock().unwrap();
        if q.1 {
            return;
        }
        q.0.push_back(item);
        drop(q);
        self.inner.cond.notify_one();
    }

    /// Drain outstanding work and join the workers.
    pub fn stop(&self) {
        self.inner.queue.lock().unwrap().1 = true;
        self.inner.cond.notify_all();

        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<T: Send + 'static> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        self.stop();
    }
}
