//! Automatic soft TX gain
//!
//! Estimates the multiplicative gain that puts a modulated signal at 0 dBFS
//! while keeping a configured fraction of samples unclipped. For example, a
//! clip fraction of 0.999 guarantees that 99.9% of sample magnitudes fall at
//! or below full scale after scaling. Estimates accumulate in a mean so the
//! gain settles as buffers are observed; estimation runs on the PHY's work
//! queue, off the modulation path.

use std::sync::Mutex;

use crate::estimator::Mean;
use crate::iqbuf::IQBuf;

/// Soft TX gain state for one MCS.
#[derive(Debug)]
pub struct AutoGain {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    g_0dbfs: f64,
    estimate: Mean,
    clip_frac: f64,
    /// Number of buffers still wanted for estimation.
    nestimates: usize,
}

impl Default for AutoGain {
    fn default() -> AutoGain {
        AutoGain::new()
    }
}

impl AutoGain {
    pub fn new() -> AutoGain {
        AutoGain {
            state: Mutex::new(State {
                g_0dbfs: 1.0,
                estimate: Mean::new(),
                clip_frac: 0.999,
                nestimates: 0,
            }),
        }
    }

    /// The fraction of samples guaranteed unclipped.
    pub fn clip_frac(&self) -> f64 {
        self.state.lock().unwrap().clip_frac
    }

    pub fn set_clip_frac(&self, frac: f64) {
        self.state.lock().unwrap().clip_frac = frac.clamp(0.0, 1.0);
    }

    /// The current soft gain (multiplicative).
    pub fn soft_tx_gain(&self) -> f64 {
        self.state.lock().unwrap().g_0dbfs
    }

    /// Set the soft gain directly (dBFS), resetting the estimate.
    pub fn set_soft_tx_gain_db(&self, db: f64) {
        let mut st = self.state.lock().unwrap();
        st.estimate.reset(10.0_f64.powf(db / 20.0));
        st.g_0dbfs = st.estimate.value();
        st.nestimates = 0;
    }

    /// Request re-estimation over the next `nsamples` modulated buffers.
    pub fn recalc(&self, nsamples: usize) {
        let mut st = self.state.lock().unwrap();
        let g = st.estimate.value();
        st.estimate.reset(g);
        st.nestimates = nsamples;
    }

    /// True if estimation is still wanted.
    pub fn needs_estimate(&self) -> bool {
        self.state.lock().unwrap().nestimates > 0
    }

    /// Fold one modulated buffer (already scaled by `g`) into the estimate.
    pub fn estimate(&self, g: f64, buf: &IQBuf) {
        let n = buf.nsamples();
        if n == 0 || g == 0.0 {
            return;
        }

        let mut mags: Vec<f64> = buf.samples()[..n].iter().map(|x| x.norm()).collect();
        mags.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let clip_frac = self.clip_frac();
        let idx = ((mags.len() as f64 - 1.0) * clip_frac).floor() as usize;
        let quantile = mags[idx.min(mags.len() - 1)];
        if quantile <= 0.0 {
            return;
        }

        // The buffer was scaled by g; a gain of g/quantile puts the
        // clip-fraction quantile at full scale.
        let mut st = self.state.lock().unwrap();
        if st.nestimates == 0 {
            return;
        }
        st.nestimates -= 1;
        let g_est = g / quantile;
        st.estimate.update(g_est);
        st.g_0dbfs = st.estimate.value();
    }
}
