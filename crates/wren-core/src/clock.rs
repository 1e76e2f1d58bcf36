//! Monotonic clock shared by the MAC, the timers, and packet timestamps
//!
//! All deadlines in the radio are expressed as [`MonoTime`]: seconds since a
//! process-wide monotonic epoch, stored as `f64` so that slot arithmetic
//! (`fmod` against the slot size, fractional sample offsets) stays exact
//! enough at radio time scales. The epoch is pinned the first time the clock
//! is read.
//!
//! ## Example
//!
//! ```rust
//! use wren_core::clock::MonoClock;
//!
//! let t0 = MonoClock::now();
//! let t1 = t0 + 0.5;
//! assert!((t1 - t0 - 0.5).abs() < 1e-12);
//! ```

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// A point on the process-monotonic timeline, in seconds since the epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
pub struct MonoTime(pub f64);

impl MonoTime {
    /// Seconds since the clock epoch.
    #[inline]
    pub fn secs(self) -> f64 {
        self.0
    }

    /// Whole seconds of this time point.
    #[inline]
    pub fn full_secs(self) -> u64 {
        self.0.max(0.0) as u64
    }

    /// Fractional seconds of this time point.
    #[inline]
    pub fn frac_secs(self) -> f64 {
        self.0 - self.full_secs() as f64
    }

    /// Rebuild a time point from whole + fractional seconds.
    #[inline]
    pub fn from_parts(secs: u64, frac: f64) -> MonoTime {
        MonoTime(secs as f64 + frac)
    }
}

impl std::ops::Add<f64> for MonoTime {
    type Output = MonoTime;

    #[inline]
    fn add(self, rhs: f64) -> MonoTime {
        MonoTime(self.0 + rhs)
    }
}

impl std::ops::Sub<f64> for MonoTime {
    type Output = MonoTime;

    #[inline]
    fn sub(self, rhs: f64) -> MonoTime {
        MonoTime(self.0 - rhs)
    }
}

impl std::ops::Sub<MonoTime> for MonoTime {
    type Output = f64;

    #[inline]
    fn sub(self, rhs: MonoTime) -> f64 {
        self.0 - rhs.0
    }
}

impl std::fmt::Display for MonoTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.9}", self.0)
    }
}

/// The process-wide monotonic clock.
pub struct MonoClock;

impl MonoClock {
    /// Current monotonic time.
    pub fn now() -> MonoTime {
        let epoch = EPOCH.get_or_init(Instant::now);
        MonoTime(epoch.elapsed().as_secs_f64())
    }

    /// Sleep until the given time point, returning immediately if it has
    /// already passed.
    pub fn sleep_until(t: MonoTime) {
        let delta = t - MonoClock::now();
        if delta > 0.0 {
            std::thread::sleep(std::time::Duration::from_secs_f64(delta));
        }
    }

    /// Sleep for `delta` seconds.
    pub fn sleep(delta: f64) {
        if delta > 0.0 {
            std::thread::sleep(std::time::Duration::from_secs_f64(delta));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        let a = MonoClock::now();
        let b = MonoClock::now();
        assert!(b >= a);
    }

    #[test]
    fn test_time_arithmetic() {
        let t = MonoTime(1.25);
        assert_eq!((t + 0.5).secs(), 1.75);
        assert_eq!((t - 0.25).secs(), 1.0);
        assert_eq!(t - MonoTime(0.25), 1.0);
    }

    #[test]
    fn test_parts_round_trip() {
        let t = MonoTime(123.456);
        let u = MonoTime::from_parts(t.full_secs(), t.frac_secs());
        assert!((t - u).abs() < 1e-12);
    }

    #[test]
    fn test_sleep_until_past_returns() {
        let t = MonoClock::now() - 1.0;
        MonoClock::sleep_until(t); // must not block
    }
}
