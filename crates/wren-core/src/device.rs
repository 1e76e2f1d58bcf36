//! RF device abstraction
//!
//! The MAC drives the radio hardware through this trait: timed burst
//! transmit and timed burst receive against the monotonic clock, plus rate,
//! frequency, and gain control. `wren-sim` provides an in-memory
//! implementation; a hardware driver wraps the vendor API.

use std::sync::Arc;

use crate::clock::MonoTime;
use crate::iqbuf::IQBuf;
use crate::types::RadioResult;

/// A full-duplex RF front end with sample-accurate timed streaming.
pub trait RadioDevice: Send + Sync {
    fn set_tx_rate(&self, rate: f64) -> RadioResult<()>;
    fn set_rx_rate(&self, rate: f64) -> RadioResult<()>;
    fn tx_rate(&self) -> f64;
    fn rx_rate(&self) -> f64;

    fn set_tx_freq(&self, freq: f64) -> RadioResult<()>;
    fn set_rx_freq(&self, freq: f64) -> RadioResult<()>;

    /// TX gain in dB.
    fn set_tx_gain(&self, gain_db: f64) -> RadioResult<()>;
    /// RX gain in dB.
    fn set_rx_gain(&self, gain_db: f64) -> RadioResult<()>;

    /// Start the RX stream at `when`.
    fn start_rx_stream(&self, when: MonoTime) -> RadioResult<()>;

    /// Stop the RX stream.
    fn stop_rx_stream(&self) -> RadioResult<()>;

    /// Receive `nsamples` samples starting at `when` into `buf`.
    ///
    /// The device publishes progress through the buffer's atomic sample
    /// counter and marks it complete when done. Returns false on overflow or
    /// a late request; the caller restarts the stream.
    fn burst_rx(&self, when: MonoTime, nsamples: usize, buf: &Arc<IQBuf>) -> bool;

    /// Transmit the given buffers back-to-back starting at `when`.
    ///
    /// `start_of_burst`/`end_of_burst` bracket multi-slot bursts so the
    /// device keeps phase across slot boundaries. Late transmissions are
    /// reported asynchronously through `tx_late_count`.
    fn burst_tx(
        &self,
        when: MonoTime,
        start_of_burst: bool,
        end_of_burst: bool,
        bufs: &[Arc<IQBuf>],
    ) -> RadioResult<()>;

    /// Device-preferred receive chunk for a burst of `nsamples`.
    fn recommended_burst_rx_size(&self, nsamples: usize) -> usize {
        nsamples
    }

    /// Largest receive request the device accepts per call.
    fn max_recv_samps_per_packet(&self) -> usize;

    /// Number of late TX events since the last call (clears the counter).
    fn tx_late_count(&self) -> u64;
}
