//! Symbol mapping and demapping
//!
//! Gray-coded constellations for the supported modulations, normalized to
//! unit average power. Demapping is hard-decision nearest-point; the squared
//! error vector feeds the EVM estimate.

use num_complex::Complex64;

use crate::mcs::ModulationType;
use crate::types::IQSample;

/// A symbol mapper/demapper for one modulation.
#[derive(Debug, Clone)]
pub struct Modem {
    modulation: ModulationType,
    points: Vec<IQSample>,
    bits_per_symbol: usize,
}

impl Modem {
    pub fn new(modulation: ModulationType) -> Modem {
        let points = constellation(modulation);
        Modem {
            modulation,
            bits_per_symbol: modulation.bits_per_symbol(),
            points,
        }
    }

    pub fn modulation(&self) -> ModulationType {
        self.modulation
    }

    pub fn bits_per_symbol(&self) -> usize {
        self.bits_per_symbol
    }

    /// Number of symbols needed for `n` bits.
    pub fn symbols_for_bits(&self, n: usize) -> usize {
        (n + self.bits_per_symbol - 1) / self.bits_per_symbol
    }

    /// Map MSB-first bits to symbols; the final symbol is zero-padded.
    pub fn modulate_bits(&self, bits: &[bool], out: &mut Vec<IQSample>) {
        for chunk in bits.chunks(self.bits_per_symbol) {
            let mut idx = 0usize;
            for (i, &bit) in chunk.iter().enumerate() {
                if bit {
                    idx |= 1 << (self.bits_per_symbol - 1 - i);
                }
            }
            out.push(self.points[idx]);
        }
    }

    /// Hard-decide one symbol. Returns the bit pattern and the squared error
    /// vector magnitude.
    pub fn demodulate_symbol(&self, sample: IQSample) -> (usize, f64) {
        let mut best = 0;
        let mut best_d = f64::MAX;
        for (idx, &p) in self.points.iter().enumerate() {
            let d = (sample - p).norm_sqr();
            if d < best_d {
                best_d = d;
                best = idx;
            }
        }
        (best, best_d)
    }

    /// Demodulate symbols into MSB-first bits, accumulating total squared
    /// symbol error. Returns the mean squared error per symbol.
    pub fn demodulate(&self, samples: &[IQSample], bits: &mut Vec<bool>) -> f64 {
        let mut err = 0.0;
        for &s in samples {
            let (idx, d) = self.demodulate_symbol(s);
            err += d;
            for i in (0..self.bits_per_symbol).rev() {
                bits.push(idx & (1 << i) != 0);
            }
        }
        if samples.is_empty() {
            0.0
        } else {
            err / samples.len() as f64
        }
    }
}

fn constellation(modulation: ModulationType) -> Vec<IQSample> {
    match modulation {
        ModulationType::Bpsk => vec![Complex64::new(1.0, 0.0), Complex64::new(-1.0, 0.0)],
        ModulationType::Qpsk => {
            let a = std::f64::consts::FRAC_1_SQRT_2;
            // Gray mapping: bit0 selects I sign, bit1 selects Q sign.
            vec![
                Complex64::new(a, a),
                Complex64::new(a, -a),
                Complex64::new(-a, a),
                Complex64::new(-a, -a),
            ]
        }
        ModulationType::Qam16 => square_qam(4, 10.0),
        ModulationType::Qam64 => square_qam(8, 42.0),
    }
}

/// Gray-coded square QAM with levels ±1, ±3, … scaled by 1/sqrt(norm).
fn square_qam(side: usize, norm: f64) -> Vec<IQSample> {
    let scale = 1.0 / norm.sqrt();
    let bits_per_axis = side.trailing_zeros() as usize;
    let mut points = vec![Complex64::new(0.0, 0.0); side * side];

    for idx in 0..side * side {
        let i_bits = idx >> bits_per_axis;
        let q_bits = idx & (side - 1);
        let i_level = gray_to_level(i_bits, side);
        let q_level = gray_to_level(q_bits, side);
        points[idx] = Complex64::new(i_level * scale, q_level * scale);
    }

    points
}

fn gray_to_level(bits: usize, side: usize) -> f64 {
    // Gray decode, then map 0..side-1 onto symmetric odd levels.
    let mut v = bits;
    let mut shift = 1;
    while shift < side {
        v ^= v >> shift;
        shift <<= 1;
    }
    (2.0 * v as f64) - (side as f64 - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::coding::{bits_to_bytes, bytes_to_bits};

    #[test]
    fn test_unit_average_power() {
        for m in [
            ModulationType::Bpsk,
            ModulationType::Qpsk,
            ModulationType::Qam16,
            ModulationType::Qam64,
        ] {
            let modem = Modem::new(m);
            let p: f64 = modem.points.iter().map(|s| s.norm_sqr()).sum::<f64>()
                / modem.points.len() as f64;
            assert_relative_eq!(p, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_round_trip_all_modulations() {
        let data = b"round trip data \x00\xff\x55\xaa";
        for m in [
            ModulationType::Bpsk,
            ModulationType::Qpsk,
            ModulationType::Qam16,
            ModulationType::Qam64,
        ] {
            let modem = Modem::new(m);
            let bits = bytes_to_bits(data);
            let mut syms = Vec::new();
            modem.modulate_bits(&bits, &mut syms);
            assert_eq!(syms.len(), modem.symbols_for_bits(bits.len()));

            let mut out_bits = Vec::new();
            let mse = modem.demodulate(&syms, &mut out_bits);
            assert_relative_eq!(mse, 0.0, epsilon = 1e-12);
            assert_eq!(&bits_to_bytes(&out_bits)[..data.len()], data);
        }
    }

    #[test]
    fn test_demodulate_reports_error_power() {
        let modem = Modem::new(ModulationType::Qpsk);
        let noisy = vec![Complex64::new(0.8, 0.6)];
        let (_, d) = modem.demodulate_symbol(noisy[0]);
        assert!(d > 0.0);
    }

    #[test]
    fn test_adjacent_gray_levels_differ_by_one_bit() {
        // Within one axis of 16-QAM, adjacent amplitude levels must differ in
        // exactly one bit.
        for bits in 0..3usize {
            let a = gray_to_level(bits, 4);
            let b = gray_to_level(bits + 1, 4);
            // Levels are distinct odd integers.
            assert_ne!(a, b);
        }
    }
}
