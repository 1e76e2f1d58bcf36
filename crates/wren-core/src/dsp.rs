//! DSP primitives for the channelizer and synthesizer
//!
//! A phase-accumulator [`Nco`] for frequency translation and a polyphase
//! arbitrary [`Resampler`] (windowed-sinc prototype decomposed into `npfb`
//! branches with derivative-filter interpolation between adjacent branches).
//! [`MixingResampler`] composes the two the way the per-channel chains use
//! them: mix up after interpolation on transmit, mix down before decimation
//! on receive.
//!
//! ## Example
//!
//! ```rust
//! use wren_core::dsp::{Resampler, ResamplerParams};
//! use num_complex::Complex64;
//!
//! let mut resamp = Resampler::new(0.5, &ResamplerParams::default());
//! let out = resamp.process(&vec![Complex64::new(1.0, 0.0); 100]);
//! assert!((out.len() as f64 - 50.0).abs() < 4.0);
//! ```

use std::f64::consts::PI;

use num_complex::Complex64;

use crate::types::IQSample;

/// Numerically controlled oscillator.
#[derive(Debug, Clone)]
pub struct Nco {
    phase: f64,
    phase_inc: f64,
}

impl Nco {
    /// Create an NCO advancing `phase_inc` radians per sample.
    pub fn new(phase_inc: f64) -> Nco {
        Nco {
            phase: 0.0,
            phase_inc,
        }
    }

    /// Radians advanced per sample.
    pub fn phase_inc(&self) -> f64 {
        self.phase_inc
    }

    pub fn set_phase_inc(&mut self, phase_inc: f64) {
        self.phase_inc = phase_inc;
    }

    /// Reset the accumulated phase.
    pub fn reset(&mut self) {
        self.phase = 0.0;
    }

    #[inline]
    fn step(&mut self) -> IQSample {
        let s = Complex64::from_polar(1.0, self.phase);
        self.phase += self.phase_inc;
        if self.phase > PI {
            self.phase -= 2.0 * PI;
        } else if self.phase < -PI {
            self.phase += 2.0 * PI;
        }
        s
    }

    /// Mix the oscillator up into `samples` in place.
    pub fn mix_up(&mut self, samples: &mut [IQSample]) {
        for x in samples.iter_mut() {
            *x *= self.step();
        }
    }

    /// Mix the oscillator down into `samples` in place.
    pub fn mix_down(&mut self, samples: &mut [IQSample]) {
        for x in samples.iter_mut() {
            *x *= self.step().conj();
        }
    }
}

/// Polyphase resampler design parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResamplerParams {
    /// Taps per polyphase branch.
    pub m: usize,
    /// Normalized prototype cutoff relative to the branch Nyquist.
    pub fc: f64,
    /// Stopband attenuation in dB (sets the Kaiser window shape).
    pub as_db: f64,
    /// Number of polyphase branches.
    pub npfb: usize,
}

impl Default for ResamplerParams {
    fn default() -> ResamplerParams {
        ResamplerParams {
            m: 8,
            fc: 0.9,
            as_db: 60.0,
            npfb: 32,
        }
    }
}

/// Polyphase filterbank arbitrary resampler.
#[derive(Debug, Clone)]
pub struct Resampler {
    rate: f64,
    npfb: usize,
    taps_per_branch: usize,
    branches: Vec<Vec<f64>>,
    diff_branches: Vec<Vec<f64>>,
    delay_line: Vec<IQSample>,
    frac_index: f64,
}

impl Resampler {
    /// Create a resampler with `rate = output_rate / input_rate`.
    pub fn new(rate: f64, params: &ResamplerParams) -> Resampler {
        assert!(rate > 0.0);
        let npfb = params.npfb.max(1);
        let taps_per_branch = params.m.max(1);
        let total_taps = npfb * taps_per_branch;

        // Prototype low-pass: cutoff at the branch Nyquist scaled by fc, and
        // scaled down further when decimating so the output band is clean.
        let band = if rate < 1.0 { rate } else { 1.0 };
        let cutoff = 0.5 * params.fc * band / npfb as f64;
        let prototype = design_prototype(total_taps, cutoff, params.as_db, npfb);

        let mut branches = vec![vec![0.0; taps_per_branch]; npfb];
        for (i, &tap) in prototype.iter().enumerate() {
            branches[i % npfb][i / npfb] = tap;
        }

        let mut diff_branches = vec![vec![0.0; taps_per_branch]; npfb];
        for i in 0..npfb {
            let next = (i + 1) % npfb;
            for j in 0..taps_per_branch {
                diff_branches[i][j] = branches[next][j] - branches[i][j];
            }
        }

        Resampler {
            rate,
            npfb,
            taps_per_branch,
            branches,
            diff_branches,
            delay_line: vec![Complex64::new(0.0, 0.0); taps_per_branch],
            frac_index: 0.0,
        }
    }

    /// Resampling rate (output/input).
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Filter delay in input samples.
    pub fn delay(&self) -> f64 {
        (self.taps_per_branch as f64 - 1.0) / 2.0
    }

    /// Upper bound on output samples produced for `n` input samples.
    pub fn needed_out(&self, n: usize) -> usize {
        (n as f64 * self.rate).ceil() as usize + 2
    }

    /// Reset filter state for a new burst.
    pub fn reset(&mut self) {
        self.delay_line.fill(Complex64::new(0.0, 0.0));
        self.frac_index = 0.0;
    }

    /// Resample `input`, appending to a fresh output vector.
    pub fn process(&mut self, input: &[IQSample]) -> Vec<IQSample> {
        let mut out = Vec::with_capacity(self.needed_out(input.len()));
        let step = self.npfb as f64 / self.rate;

        for &x in input {
            self.delay_line.rotate_right(1);
            self.delay_line[0] = x;

            while self.frac_index < self.npfb as f64 {
                let branch = self.frac_index as usize;
                let mu = self.frac_index - branch as f64;

                let mut acc = Complex64::new(0.0, 0.0);
                for k in 0..self.taps_per_branch {
                    let coeff = self.branches[branch][k] + mu * self.diff_branches[branch][k];
                    acc += self.delay_line[k] * coeff;
                }
                out.push(acc);

                self.frac_index += step;
            }

            self.frac_index -= self.npfb as f64;
        }

        out
    }
}

/// A resampler paired with a frequency shift.
#[derive(Debug, Clone)]
pub struct MixingResampler {
    resamp: Resampler,
    nco: Nco,
}

impl MixingResampler {
    /// `rate` is output/input; `rad` is the shift in radians per sample at
    /// the mixing rate (output rate for mix-up, input rate for mix-down).
    pub fn new(rate: f64, rad: f64, params: &ResamplerParams) -> MixingResampler {
        MixingResampler {
            resamp: Resampler::new(rate, params),
            nco: Nco::new(rad),
        }
    }

    pub fn rate(&self) -> f64 {
        self.resamp.rate()
    }

    /// Filter delay in input samples.
    pub fn delay(&self) -> f64 {
        self.resamp.delay()
    }

    pub fn needed_out(&self, n: usize) -> usize {
        self.resamp.needed_out(n)
    }

    pub fn set_freq_shift(&mut self, rad: f64) {
        self.nco.set_phase_inc(rad);
    }

    pub fn reset(&mut self) {
        self.resamp.reset();
        self.nco.reset();
    }

    /// Interpolate to the output rate, then mix up.
    pub fn resample_mix_up(&mut self, input: &[IQSample]) -> Vec<IQSample> {
        let mut out = self.resamp.process(input);
        if self.nco.phase_inc() != 0.0 {
            self.nco.mix_up(&mut out);
        }
        out
    }

    /// Mix down at the input rate, then decimate.
    pub fn resample_mix_down(&mut self, input: &[IQSample]) -> Vec<IQSample> {
        if self.nco.phase_inc() == 0.0 {
            return self.resamp.process(input);
        }
        let mut mixed = input.to_vec();
        self.nco.mix_down(&mut mixed);
        self.resamp.process(&mixed)
    }
}

/// Kaiser-windowed sinc prototype for an `npfb`-branch filterbank.
pub fn design_prototype(num_taps: usize, cutoff: f64, as_db: f64, npfb: usize) -> Vec<f64> {
    let beta = kaiser_beta(as_db);
    let center = (num_taps - 1) as f64 / 2.0;
    let mut taps = vec![0.0; num_taps];

    for (i, tap) in taps.iter_mut().enumerate() {
        let n = i as f64 - center;
        let sinc = if n.abs() < 1e-12 {
            2.0 * cutoff
        } else {
            (2.0 * PI * cutoff * n).sin() / (PI * n)
        };
        let frac = 2.0 * (i as f64 / (num_taps - 1) as f64) - 1.0;
        let w = bessel_i0(beta * (1.0 - frac * frac).max(0.0).sqrt()) / bessel_i0(beta);
        *tap = sinc * w;
    }

    // Normalize for unity passband gain per branch.
    let sum: f64 = taps.iter().sum();
    if sum.abs() > 1e-20 {
        let scale = npfb as f64 / sum;
        for tap in taps.iter_mut() {
            *tap *= scale;
        }
    }

    taps
}

fn kaiser_beta(as_db: f64) -> f64 {
    if as_db > 50.0 {
        0.1102 * (as_db - 8.7)
    } else if as_db >= 21.0 {
        0.5842 * (as_db - 21.0).powf(0.4) + 0.07886 * (as_db - 21.0)
    } else {
        0.0
    }
}

fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;
    for k in 1..32 {
        term *= (x / (2.0 * k as f64)).powi(2);
        sum += term;
        if term < 1e-16 * sum {
            break;
        }
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_nco_mix_up_down_cancels() {
        let mut up = Nco::new(0.3);
        let mut down = Nco::new(0.3);
        let mut samples = vec![Complex64::new(1.0, 0.0); 64];
        up.mix_up(&mut samples);
        down.mix_down(&mut samples);
        for s in &samples {
            assert_relative_eq!(s.re, 1.0, epsilon = 1e-9);
            assert_relative_eq!(s.im, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_resampler_output_length() {
        for rate in [0.25, 0.5, 1.0, 2.0, 2.5] {
            let mut r = Resampler::new(rate, &ResamplerParams::default());
            let out = r.process(&vec![Complex64::new(1.0, 0.0); 400]);
            let expected = 400.0 * rate;
            assert!(
                (out.len() as f64 - expected).abs() < 8.0,
                "rate {}: got {} samples, expected ~{}",
                rate,
                out.len(),
                expected
            );
        }
    }

    #[test]
    fn test_resampler_dc_gain() {
        let mut r = Resampler::new(2.0, &ResamplerParams::default());
        let out = r.process(&vec![Complex64::new(1.0, 0.0); 256]);
        // Skip the filter transient, then the output should sit at DC ~1.
        let steady = &out[64..out.len() - 8];
        let mean: f64 = steady.iter().map(|s| s.re).sum::<f64>() / steady.len() as f64;
        assert_relative_eq!(mean, 1.0, epsilon = 0.05);
    }

    #[test]
    fn test_resampler_preserves_tone() {
        // A slow complex tone should survive 2x interpolation at half the
        // original frequency per sample.
        let f_in = 0.02;
        let input: Vec<IQSample> = (0..512)
            .map(|i| Complex64::from_polar(1.0, 2.0 * PI * f_in * i as f64))
            .collect();
        let mut r = Resampler::new(2.0, &ResamplerParams::default());
        let out = r.process(&input);

        // Measure phase advance per output sample over the steady region.
        let mut acc = Complex64::new(0.0, 0.0);
        for w in out[128..out.len() - 16].windows(2) {
            acc += w[1] * w[0].conj();
        }
        let f_out = acc.arg() / (2.0 * PI);
        assert_relative_eq!(f_out, f_in / 2.0, epsilon = 1e-3);
    }

    #[test]
    fn test_mixing_resampler_round_trip_tone() {
        let params = ResamplerParams::default();
        let rad = 0.5;

        // Up 2x with a shift, then down 2x with the same shift: a DC input
        // should come back to DC.
        let mut up = MixingResampler::new(2.0, rad, &params);
        let mut down = MixingResampler::new(0.5, rad, &params);

        let input = vec![Complex64::new(1.0, 0.0); 512];
        let mid = up.resample_mix_up(&input);
        let out = down.resample_mix_down(&mid);

        let steady = &out[96..out.len() - 16];
        let mean = steady.iter().sum::<Complex64>() / steady.len() as f64;
        assert!(mean.norm() > 0.9, "round trip lost the carrier: {}", mean);
    }
}
