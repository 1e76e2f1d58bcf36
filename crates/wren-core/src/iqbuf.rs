//! Shared I/Q sample buffers
//!
//! An [`IQBuf`] is the unit of sample exchange between the RF device, the
//! channelizer, and the synthesizer. Receive buffers are filled
//! incrementally: the producer appends through a shared reference and
//! publishes progress through the atomic `nsamples` counter, so
//! demodulation workers can chase the DMA without extra locking. Readers
//! may only observe the published prefix; `samples()` enforces that.
//! Consumers share buffers by reference count (`Arc<IQBuf>`).

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::clock::MonoTime;
use crate::types::IQSample;

/// A buffer of I/Q samples with producer progress.
#[derive(Debug)]
pub struct IQBuf {
    /// Sample storage, sized at creation. Writes go through `extend`; reads
    /// stay below the published `nsamples`.
    data: UnsafeCell<Vec<IQSample>>,
    /// Capacity in samples.
    capacity: usize,
    /// Timestamp of the first sample.
    pub timestamp: MonoTime,
    /// Buffer sequence number; discontinuities invalidate in-flight
    /// demodulators.
    pub seq: u64,
    /// Signal delay in samples (filter transients at the head).
    pub delay: usize,
    /// Number of published samples.
    nsamples: AtomicUsize,
    /// True when the producer has finished writing.
    complete: AtomicBool,
}

// A single producer appends strictly past `nsamples` and publishes with a
// release store; readers stay below an acquire load of `nsamples`.
unsafe impl Sync for IQBuf {}
unsafe impl Send for IQBuf {}

impl IQBuf {
    /// Create a zero-filled buffer of `n` samples, not yet complete.
    pub fn new(n: usize) -> IQBuf {
        IQBuf {
            data: UnsafeCell::new(vec![IQSample::new(0.0, 0.0); n]),
            capacity: n,
            timestamp: MonoTime::default(),
            seq: 0,
            delay: 0,
            nsamples: AtomicUsize::new(0),
            complete: AtomicBool::new(false),
        }
    }

    /// Create a complete buffer from existing samples.
    pub fn from_samples(samples: Vec<IQSample>) -> IQBuf {
        let n = samples.len();
        IQBuf {
            data: UnsafeCell::new(samples),
            capacity: n,
            timestamp: MonoTime::default(),
            seq: 0,
            delay: 0,
            nsamples: AtomicUsize::new(n),
            complete: AtomicBool::new(true),
        }
    }

    /// Total capacity of the buffer in samples.
    pub fn len(&self) -> usize {
        self.capacity
    }

    /// True if the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.capacity == 0
    }

    /// The published samples.
    pub fn samples(&self) -> &[IQSample] {
        let n = self.nsamples();
        unsafe { &(&*self.data.get())[..n] }
    }

    /// Append samples past the published prefix.
    ///
    /// Only the producer may call this, and only before `set_complete`.
    /// Samples beyond capacity are ignored.
    pub fn extend(&self, samples: &[IQSample]) {
        let n = self.nsamples.load(Ordering::Relaxed);
        let room = self.capacity - n;
        let take = samples.len().min(room);
        unsafe {
            let data = &mut *self.data.get();
            data[n..n + take].copy_from_slice(&samples[..take]);
        }
        self.nsamples.store(n + take, Ordering::Release);
    }

    /// Number of samples published so far.
    pub fn nsamples(&self) -> usize {
        self.nsamples.load(Ordering::Acquire)
    }

    /// True once the producer has finished.
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Mark the buffer complete, publishing all samples.
    pub fn set_complete(&self) {
        self.nsamples.store(self.capacity, Ordering::Release);
        self.complete.store(true, Ordering::Release);
    }
}

impl Clone for IQBuf {
    fn clone(&self) -> IQBuf {
        let mut copy = IQBuf::from_samples(self.samples().to_vec());
        copy.timestamp = self.timestamp;
        copy.seq = self.seq;
        copy.delay = self.delay;
        copy
    }
}
