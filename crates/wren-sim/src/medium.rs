//! The shared RF medium
//!
//! A time-indexed superposition of everything transmitted. Receivers sum
//! all transmissions overlapping their window, sample-aligned against the
//! shared rate. The medium can drop whole bursts with a configured
//! probability and add white gaussian noise, which is enough to exercise
//! the ARQ's loss recovery and the PHY's error flags.

use std::f64::consts::PI;
use std::sync::Mutex;

use num_complex::Complex64;
use rand::Rng;

use wren_core::types::IQSample;
use wren_core::MonoTime;

/// How much history the medium retains, in seconds.
const HISTORY_SECS: f64 = 2.0;

struct Transmission {
    start: MonoTime,
    samples: Vec<IQSample>,
}

struct State {
    transmissions: Vec<Transmission>,
    loss_prob: f64,
    noise_std: f64,
}

/// The shared medium connecting simulated devices.
pub struct SimMedium {
    /// Sample rate every attached device runs at.
    rate: f64,
    state: Mutex<State>,
}

impl SimMedium {
    pub fn new(rate: f64) -> SimMedium {
        SimMedium {
            rate,
            state: Mutex::new(State {
                transmissions: Vec::new(),
                loss_prob: 0.0,
                noise_std: 0.0,
            }),
        }
    }

    /// The medium's sample rate.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Probability that a whole burst is dropped.
    pub fn set_loss_prob(&self, p: f64) {
        self.state.lock().unwrap().loss_prob = p.clamp(0.0, 1.0);
    }

    /// Standard deviation of added white gaussian noise.
    pub fn set_noise_std(&self, std: f64) {
        self.state.lock().unwrap().noise_std = std.max(0.0);
    }

    /// Put a burst on the air at `start`.
    pub fn transmit(&self, start: MonoTime, samples: Vec<IQSample>) {
        let mut state = self.state.lock().unwrap();

        if state.loss_prob > 0.0 && rand::thread_rng().gen::<f64>() < state.loss_prob {
            tracing::debug!(t = start.secs(), n = samples.len(), "burst lost on the air");
            return;
        }

        state.transmissions.push(Transmission { start, samples });

        // Trim ancient history.
        let horizon = start - HISTORY_SECS;
        state
            .transmissions
            .retain(|tx| tx.start + tx.samples.len() as f64 / self.rate > horizon);
    }

    /// Reconstruct the window of `n` samples starting at `start`.
    pub fn receive(&self, start: MonoTime, n: usize) -> Vec<IQSample> {
        let state = self.state.lock().unwrap();
        let mut out = vec![Complex64::new(0.0, 0.0); n];

        for tx in &state.transmissions {
            // Sample-aligned offset of the transmission within the window.
            let offset = ((tx.start - start) * self.rate).round() as i64;

            let src_begin = (-offset).max(0) as usize;
            let dst_begin = offset.max(0) as usize;
            if src_begin >= tx.samples.len() || dst_begin >= n {
                continue;
            }
            let len = (tx.samples.len() - src_begin).min(n - dst_begin);

            for i in 0..len {
                out[dst_begin + i] += tx.samples[src_begin + i];
            }
        }

        if state.noise_std > 0.0 {
            let std = state.noise_std;
            let mut rng = rand::thread_rng();
            for x in out.iter_mut() {
                // Box-Muller.
                let u1: f64 = rng.gen::<f64>().max(1e-12);
                let u2: f64 = rng.gen();
                let mag = std * (-2.0 * u1.ln()).sqrt();
                *x += Complex64::new(mag * (2.0 * PI * u2).cos(), mag * (2.0 * PI * u2).sin());
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_reconstructs_aligned_window() {
        let medium = SimMedium::new(1000.0);
        let burst: Vec<IQSample> = (0..10).map(|i| Complex64::new(i as f64, 0.0)).collect();
        medium.transmit(MonoTime(1.0), burst);

        // A window starting 5 samples before the burst.
        let win = medium.receive(MonoTime(0.995), 20);
        assert_eq!(win[4], Complex64::new(0.0, 0.0));
        assert_eq!(win[5], Complex64::new(0.0, 0.0)); // burst sample 0
        assert_eq!(win[6], Complex64::new(1.0, 0.0));
        assert_eq!(win[14], Complex64::new(9.0, 0.0));
        assert_eq!(win[15], Complex64::new(0.0, 0.0));
    }

    #[test]
    fn test_receive_partial_overlap() {
        let medium = SimMedium::new(1000.0);
        medium.transmit(MonoTime(1.0), vec![Complex64::new(1.0, 0.0); 10]);

        // Window covering only the tail.
        let win = medium.receive(MonoTime(1.005), 10);
        let energy: f64 = win.iter().map(|x| x.norm_sqr()).sum();
        assert_eq!(energy, 5.0);
    }

    #[test]
    fn test_full_loss_drops_everything() {
        let medium = SimMedium::new(1000.0);
        medium.set_loss_prob(1.0);
        medium.transmit(MonoTime(1.0), vec![Complex64::new(1.0, 0.0); 10]);
        let win = medium.receive(MonoTime(1.0), 10);
        assert!(win.iter().all(|x| x.norm_sqr() == 0.0));
    }

    #[test]
    fn test_bursts_superpose() {
        let medium = SimMedium::new(1000.0);
        medium.transmit(MonoTime(1.0), vec![Complex64::new(1.0, 0.0); 4]);
        medium.transmit(MonoTime(1.0), vec![Complex64::new(0.0, 2.0); 4]);
        let win = medium.receive(MonoTime(1.0), 4);
        assert_eq!(win[0], Complex64::new(1.0, 2.0));
    }
}
