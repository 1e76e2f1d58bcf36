//! Medium access control
//!
//! The slotted MAC divides the monotonic clock into fixed slots and drives
//! the synthesizer, the channelizer, and the RF device against
//! sample-accurate slot deadlines. [`Tdma`] owns specific slot indices of a
//! repeating frame; [`SlottedAloha`] treats every slot as a candidate and
//! transmits with a configured probability.

pub mod aloha;
pub mod schedule;
pub mod slotted;
pub mod tdma;

use crate::clock::{MonoClock, MonoTime};

/// MAC load, measured as samples transmitted over a period.
#[derive(Debug, Clone)]
pub struct Load {
    /// Start of the measurement period.
    pub start: MonoTime,
    /// End of the measurement period.
    pub end: MonoTime,
    /// Samples transmitted in the period.
    pub nsamples: usize,
}

impl Load {
    pub fn new() -> Load {
        Load {
            start: MonoClock::now(),
            end: MonoClock::now(),
            nsamples: 0,
        }
    }
}

impl Default for Load {
    fn default() -> Load {
        Load::new()
    }
}

/// A MAC protocol.
pub trait Mac: Send + Sync {
    /// True if this MAC currently has permission to transmit at all.
    fn can_transmit(&self) -> bool;

    /// Recompute rate-derived parameters after a rate or schedule change.
    fn reconfigure(&self);

    /// Current transmit load, resetting the counters.
    fn pop_load(&self) -> Load;

    /// Stop all MAC threads.
    fn stop(&self);
}
