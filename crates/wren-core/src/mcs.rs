//! Modulation and coding schemes
//!
//! An MCS is the tuple `(check, fec0, fec1, modulation)`: a payload integrity
//! check, an inner and outer FEC, and a symbol constellation. The PHY's MCS
//! table is a list of [`McsEntry`] values ordered from most robust to most
//! efficient; the ARQ controller adapts the per-peer index over this table.

use serde::{Deserialize, Serialize};

use crate::phy::autogain::AutoGain;

/// Symbol constellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModulationType {
    Bpsk,
    Qpsk,
    Qam16,
    Qam64,
}

impl ModulationType {
    /// Bits per symbol for this modulation.
    pub fn bits_per_symbol(&self) -> usize {
        match self {
            ModulationType::Bpsk => 1,
            ModulationType::Qpsk => 2,
            ModulationType::Qam16 => 4,
            ModulationType::Qam64 => 6,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModulationType::Bpsk => "bpsk",
            ModulationType::Qpsk => "qpsk",
            ModulationType::Qam16 => "qam16",
            ModulationType::Qam64 => "qam64",
        }
    }
}

/// Forward error correction code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FecType {
    None,
    /// Repeat each byte three times, majority vote on decode.
    Rep3,
    /// Hamming(7,4) on nibbles; corrects single-bit errors per codeword.
    Hamming74,
}

impl FecType {
    pub fn name(&self) -> &'static str {
        match self {
            FecType::None => "none",
            FecType::Rep3 => "rep3",
            FecType::Hamming74 => "h74",
        }
    }

    /// Code rate as encoded-bits per data-bit.
    pub fn expansion(&self) -> f64 {
        match self {
            FecType::None => 1.0,
            FecType::Rep3 => 3.0,
            FecType::Hamming74 => 7.0 / 4.0,
        }
    }
}

/// Payload integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckType {
    None,
    Crc16,
    Crc32,
}

impl CheckType {
    pub fn name(&self) -> &'static str {
        match self {
            CheckType::None => "none",
            CheckType::Crc16 => "crc16",
            CheckType::Crc32 => "crc32",
        }
    }

    /// Trailer length in bytes.
    pub fn len(&self) -> usize {
        match self {
            CheckType::None => 0,
            CheckType::Crc16 => 2,
            CheckType::Crc32 => 4,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A modulation and coding scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mcs {
    /// Payload integrity check.
    pub check: CheckType,
    /// Inner FEC.
    pub fec0: FecType,
    /// Outer FEC.
    pub fec1: FecType,
    /// Constellation.
    pub modulation: ModulationType,
}

impl Mcs {
    pub fn new(check: CheckType, fec0: FecType, fec1: FecType, modulation: ModulationType) -> Mcs {
        Mcs {
            check,
            fec0,
            fec1,
            modulation,
        }
    }

    /// Approximate information rate in bits per symbol, after FEC overhead.
    pub fn rate(&self) -> f64 {
        self.modulation.bits_per_symbol() as f64 / (self.fec0.expansion() * self.fec1.expansion())
    }
}

impl std::fmt::Display for Mcs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}+{}/{}",
            self.modulation.name(),
            self.check.name(),
            self.fec0.name(),
            self.fec1.name()
        )
    }
}

/// One row of the PHY's MCS table.
#[derive(Debug)]
pub struct McsEntry {
    /// The scheme itself.
    pub mcs: Mcs,
    /// Soft TX gain state for this scheme.
    pub autogain: AutoGain,
    /// EVM threshold (dB) below which this scheme is considered viable by
    /// the AMC descent rule, if configured.
    pub evm_threshold: Option<f64>,
}

impl McsEntry {
    pub fn new(mcs: Mcs) -> McsEntry {
        McsEntry {
            mcs,
            autogain: AutoGain::new(),
            evm_threshold: None,
        }
    }
}

/// The default MCS ladder, most robust first.
pub fn default_mcs_table() -> Vec<Mcs> {
    vec![
        Mcs::new(CheckType::Crc16, FecType::Rep3, FecType::None, ModulationType::Bpsk),
        Mcs::new(CheckType::Crc16, FecType::Hamming74, FecType::None, ModulationType::Bpsk),
        Mcs::new(CheckType::Crc16, FecType::Hamming74, FecType::None, ModulationType::Qpsk),
        Mcs::new(CheckType::Crc16, FecType::None, FecType::None, ModulationType::Qpsk),
        Mcs::new(CheckType::Crc16, FecType::Hamming74, FecType::None, ModulationType::Qam16),
        Mcs::new(CheckType::Crc16, FecType::None, FecType::None, ModulationType::Qam16),
        Mcs::new(CheckType::Crc16, FecType::None, FecType::None, ModulationType::Qam64),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_per_symbol() {
        assert_eq!(ModulationType::Bpsk.bits_per_symbol(), 1);
        assert_eq!(ModulationType::Qpsk.bits_per_symbol(), 2);
        assert_eq!(ModulationType::Qam16.bits_per_symbol(), 4);
        assert_eq!(ModulationType::Qam64.bits_per_symbol(), 6);
    }

    #[test]
    fn test_default_table_rate_monotonic() {
        let table = default_mcs_table();
        for w in table.windows(2) {
            assert!(
                w[1].rate() > w[0].rate(),
                "MCS table not ordered by rate: {} !< {}",
                w[0].rate(),
                w[1].rate()
            );
        }
    }

    #[test]
    fn test_check_trailer_lengths() {
        assert_eq!(CheckType::None.len(), 0);
        assert_eq!(CheckType::Crc16.len(), 2);
        assert_eq!(CheckType::Crc32.len(), 4);
    }

    #[test]
    fn test_display() {
        let mcs = Mcs::new(
            CheckType::Crc16,
            FecType::Rep3,
            FecType::None,
            ModulationType::Bpsk,
        );
        assert_eq!(mcs.to_string(), "bpsk/crc16+rep3/none");
    }
}
