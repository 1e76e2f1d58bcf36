//! Statistical estimators for link metrics
//!
//! The ARQ controller estimates packet error rate over bounded sample
//! windows, ACK delay as an exponential moving average, and long-term
//! EVM/RSSI as EMAs seeded by a plain mean. As a guideline, choosing
//! `alpha = 2/(n+1)` means the first `n` data points represent about 86% of
//! the total weight.
//!
//! ## Example
//!
//! ```rust
//! use wren_core::estimator::WindowedMean;
//!
//! let mut per = WindowedMean::new(4);
//! for x in [1.0, 0.0, 0.0, 0.0] {
//!     per.update(x);
//! }
//! assert!(per.is_full());
//! assert_eq!(per.value(), 0.25);
//! ```

/// Estimate a value by a running mean.
#[derive(Debug, Clone, Default)]
pub struct Mean {
    value: f64,
    nsamples: usize,
}

impl Mean {
    pub fn new() -> Mean {
        Mean::default()
    }

    /// Current estimate.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Number of samples in the estimate.
    pub fn nsamples(&self) -> usize {
        self.nsamples
    }

    /// Reset to an initial value with no samples.
    pub fn reset(&mut self, x: f64) {
        self.value = x;
        self.nsamples = 0;
    }

    /// Update with a new sample.
    pub fn update(&mut self, x: f64) {
        if self.nsamples == 0 {
            self.value = x;
            self.nsamples = 1;
        } else {
            self.value = (self.value * self.nsamples as f64 + x) / (self.nsamples as f64 + 1.0);
            self.nsamples += 1;
        }
    }
}

/// Exponential moving average with an optional mean warmup.
///
/// Until `mean_until` samples have been seen, the estimate is a plain mean;
/// after that it becomes `v + alpha*(x - v)`.
#[derive(Debug, Clone)]
pub struct Ewma {
    value: f64,
    nsamples: usize,
    mean_until: usize,
    alpha: f64,
}

impl Ewma {
    /// Create an EMA with weight `alpha`.
    pub fn new(alpha: f64) -> Ewma {
        Ewma {
            value: 0.0,
            nsamples: 0,
            mean_until: 0,
            alpha,
        }
    }

    /// Create an EMA that behaves as a mean for the first `mean_until`
    /// samples.
    pub fn with_warmup(alpha: f64, initial_value: f64, mean_until: usize) -> Ewma {
        Ewma {
            value: initial_value,
            nsamples: 0,
            mean_until,
            alpha,
        }
    }

    /// Current estimate.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Number of samples in the estimate.
    pub fn nsamples(&self) -> usize {
        self.nsamples
    }

    /// Reset to an initial value with no samples.
    pub fn reset(&mut self, x: f64) {
        self.value = x;
        self.nsamples = 0;
    }

    /// Update with a new sample.
    pub fn update(&mut self, x: f64) {
        if self.nsamples == 0 {
            self.value = x;
        } else if self.nsamples < self.mean_until {
            self.value =
                (self.value * self.nsamples as f64 + x) / (self.nsamples as f64 + 1.0);
        } else {
            self.value += self.alpha * (x - self.value);
        }
        self.nsamples += 1;
    }
}

/// Mean over a sliding window of the last `window_size` samples.
///
/// The window is "full" once `window_size` samples have been collected since
/// the last reset or resize; the PER logic gates MCS decisions on fullness.
#[derive(Debug, Clone)]
pub struct WindowedMean {
    window: Vec<f64>,
    window_size: usize,
    next: usize,
    nsamples: usize,
    sum: f64,
}

impl WindowedMean {
    /// Create a windowed mean over `window_size` samples.
    pub fn new(window_size: usize) -> WindowedMean {
        WindowedMean {
            window: vec![0.0; window_size.max(1)],
            window_size: window_size.max(1),
            next: 0,
            nsamples: 0,
            sum: 0.0,
        }
    }

    /// Current estimate over the samples in the window.
    pub fn value(&self) -> f64 {
        let n = self.nsamples.min(self.window_size);
        if n == 0 {
            0.0
        } else {
            self.sum / n as f64
        }
    }

    /// Number of samples seen since the last reset, saturating at the window
    /// size.
    pub fn nsamples(&self) -> usize {
        self.nsamples.min(self.window_size)
    }

    /// The configured window size.
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// True when the window holds `window_size` samples.
    pub fn is_full(&self) -> bool {
        self.nsamples >= self.window_size
    }

    /// Resize the window, discarding history.
    pub fn set_window_size(&mut self, window_size: usize) {
        self.window_size = window_size.max(1);
        self.window = vec![0.0; self.window_size];
        self.next = 0;
        self.nsamples = 0;
        self.sum = 0.0;
    }

    /// Reset the estimator, filling history with `x` weightlessly.
    pub fn reset(&mut self, x: f64) {
        self.window.fill(x);
        self.next = 0;
        self.nsamples = 0;
        self.sum = 0.0;
    }

    /// Update with a new sample.
    pub fn update(&mut self, x: f64) {
        if self.nsamples >= self.window_size {
            self.sum -= self.window[self.next];
        }
        self.sum += x;
        self.window[self.next] = x;
        self.next = (self.next + 1) % self.window_size;
        self.nsamples = (self.nsamples + 1).min(self.window_size * 2);
    }
}
