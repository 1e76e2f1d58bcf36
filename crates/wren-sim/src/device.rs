//! Simulated RF device
//!
//! Implements the core's [`RadioDevice`] trait over a [`SimMedium`]. Timed
//! burst receive sleeps until the requested window has fully elapsed, then
//! reconstructs it from the medium; timed burst transmit places samples on
//! the medium at their deadline. Submissions that arrive after their
//! deadline bump the late counter, which the MAC polls to restart its TX
//! loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use wren_core::clock::{MonoClock, MonoTime};
use wren_core::device::RadioDevice;
use wren_core::iqbuf::IQBuf;
use wren_core::types::{RadioError, RadioResult};

use crate::medium::SimMedium;

/// Scheduling slack allowed before a receive window is considered served.
const RX_MARGIN: f64 = 0.002;

/// A simulated full-duplex radio attached to a shared medium.
pub struct SimRadioDevice {
    medium: Arc<SimMedium>,
    tx_rate: Mutex<f64>,
    rx_rate: Mutex<f64>,
    tx_freq: Mutex<f64>,
    rx_freq: Mutex<f64>,
    tx_gain_db: Mutex<f64>,
    rx_gain_db: Mutex<f64>,
    rx_running: AtomicBool,
    tx_late: AtomicU64,
}

impl SimRadioDevice {
    pub fn new(medium: Arc<SimMedium>) -> SimRadioDevice {
        let rate = medium.rate();
        SimRadioDevice {
            medium,
            tx_rate: Mutex::new(rate),
            rx_rate: Mutex::new(rate),
            tx_freq: Mutex::new(0.0),
            rx_freq: Mutex::new(0.0),
            tx_gain_db: Mutex::new(0.0),
            rx_gain_db: Mutex::new(0.0),
            rx_running: AtomicBool::new(false),
            tx_late: AtomicU64::new(0),
        }
    }
}

impl RadioDevice for SimRadioDevice {
    fn set_tx_rate(&self, rate: f64) -> RadioResult<()> {
        if (rate - self.medium.rate()).abs() > 1e-6 {
            return Err(RadioError::Device(format!(
                "simulated medium runs at {} Hz, not {} Hz",
                self.medium.rate(),
                rate
            )));
        }
        *self.tx_rate.lock().unwrap() = rate;
        Ok(())
    }

    fn set_rx_rate(&self, rate: f64) -> RadioResult<()> {
        if (rate - self.medium.rate()).abs() > 1e-6 {
            return Err(RadioError::Device(format!(
                "simulated medium runs at {} Hz, not {} Hz",
                self.medium.rate(),
                rate
            )));
        }
        *self.rx_rate.lock().unwrap() = rate;
        Ok(())
    }

    fn tx_rate(&self) -> f64 {
        *self.tx_rate.lock().unwrap()
    }

    fn rx_rate(&self) -> f64 {
        *self.rx_rate.lock().unwrap()
    }

    fn set_tx_freq(&self, freq: f64) -> RadioResult<()> {
        *self.tx_freq.lock().unwrap() = freq;
        Ok(())
    }

    fn set_rx_freq(&self, freq: f64) -> RadioResult<()> {
        *self.rx_freq.lock().unwrap() = freq;
        Ok(())
    }

    fn set_tx_gain(&self, gain_db: f64) -> RadioResult<()> {
        *self.tx_gain_db.lock().unwrap() = gain_db;
        Ok(())
    }

    fn set_rx_gain(&self, gain_db: f64) -> RadioResult<()> {
        *self.rx_gain_db.lock().unwrap() = gain_db;
        Ok(())
    }

    fn start_rx_stream(&self, _when: MonoTime) -> RadioResult<()> {
        self.rx_running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop_rx_stream(&self) -> RadioResult<()> {
        self.rx_running.store(false, Ordering::Release);
        Ok(())
    }

    fn burst_rx(&self, when: MonoTime, nsamples: usize, buf: &Arc<IQBuf>) -> bool {
        let rate = self.rx_rate();
        let end = when + nsamples as f64 / rate + RX_MARGIN;
        MonoClock::sleep_until(end);

        if !self.rx_running.load(Ordering::Acquire) {
            return false;
        }

        // A request too deep in the past would have fallen out of the
        // device's buffers; the MAC restarts the stream.
        if MonoClock::now() - end > 1.0 {
            return false;
        }

        let samples = self.medium.receive(when, nsamples);
        buf.extend(&samples);
        buf.set_complete();
        true
    }

    fn burst_tx(
        &self,
        when: MonoTime,
        _start_of_burst: bool,
        _end_of_burst: bool,
        bufs: &[Arc<IQBuf>],
    ) -> RadioResult<()> {
        if when < MonoClock::now() {
            self.tx_late.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(when = when.secs(), "late burst TX");
        }

        let total: usize = bufs.iter().map(|b| b.nsamples()).sum();
        let mut samples = Vec::with_capacity(total);
        for buf in bufs {
            samples.extend_from_slice(buf.samples());
        }

        self.medium.transmit(when, samples);
        Ok(())
    }

    fn max_recv_samps_per_packet(&self) -> usize {
        1 << 20
    }

    fn tx_late_count(&self) -> u64 {
        self.tx_late.swap(0, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex64;

    #[test]
    fn test_timed_rx_sees_timed_tx() {
        let medium = Arc::new(SimMedium::new(10_000.0));
        let tx = SimRadioDevice::new(medium.clone());
        let rx = SimRadioDevice::new(medium);
        rx.start_rx_stream(MonoClock::now()).unwrap();

        let t0 = MonoClock::now() + 0.02;
        let burst = Arc::new(IQBuf::from_samples(vec![Complex64::new(1.0, 0.0); 100]));
        tx.burst_tx(t0, true, true, &[burst]).unwrap();

        let buf = Arc::new(IQBuf::new(200));
        assert!(rx.burst_rx(t0 - 0.005, 200, &buf));
        assert!(buf.is_complete());

        // The burst lands 50 samples into the window.
        let energy: f64 = buf.samples().iter().map(|x| x.norm_sqr()).sum();
        assert_eq!(energy, 100.0);
        assert_eq!(buf.samples()[49].norm_sqr(), 0.0);
        assert_eq!(buf.samples()[50].norm_sqr(), 1.0);
    }

    #[test]
    fn test_late_tx_counted() {
        let medium = Arc::new(SimMedium::new(10_000.0));
        let dev = SimRadioDevice::new(medium);
        let past = MonoClock::now() - 1.0;
        dev.burst_tx(past, true, true, &[]).unwrap();
        assert_eq!(dev.tx_late_count(), 1);
        assert_eq!(dev.tx_late_count(), 0);
    }

    #[test]
    fn test_rate_mismatch_rejected() {
        let medium = Arc::new(SimMedium::new(10_000.0));
        let dev = SimRadioDevice::new(medium);
        assert!(dev.set_tx_rate(44_100.0).is_err());
        assert!(dev.set_tx_rate(10_000.0).is_ok());
    }
}
