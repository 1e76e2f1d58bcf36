//! Radio configuration
//!
//! One explicit configuration record threaded through constructors. Every
//! knob has a workable default; serde derives let deployments load the whole
//! record from a config file.

use serde::{Deserialize, Serialize};

use crate::dsp::ResamplerParams;
use crate::mcs::Mcs;
use crate::netqueue::QueueOrder;
use crate::types::Channel;

/// ARQ parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArqConfig {
    /// Maximum send window per peer.
    pub max_sendwin: u16,
    /// Receive window per peer.
    pub recvwin: u16,
    /// Delay before arming a selective ACK (seconds).
    pub sack_delay: f64,
    /// Total delay before a standalone ACK goes out (seconds).
    pub ack_delay: f64,
    /// Samples in the ACK-delay estimator's warmup mean.
    pub ack_delay_estimation_window: usize,
    /// Floor on the retransmission timer (seconds).
    pub min_retransmission_delay: f64,
    /// Multiplier over the ACK-delay estimate for the retransmission timer.
    pub retransmission_delay_slop: f64,
    /// Explicit-NAK rate limit: ring size.
    pub explicit_nak_win: usize,
    /// Explicit-NAK rate limit: ring duration (seconds).
    pub explicit_nak_win_duration: f64,
    /// Send selective ACKs.
    pub selective_ack: bool,
    /// Ignore selective-ACK feedback younger than this (seconds).
    pub selective_ack_feedback_delay: f64,
    /// Give up after this many retransmissions, if set.
    pub max_retransmissions: Option<usize>,
    /// Deliver packets to the tap strictly in order.
    pub enforce_ordering: bool,
    /// Extra control bytes allowed beyond the MTU.
    pub mcu: usize,
}

impl Default for ArqConfig {
    fn default() -> ArqConfig {
        ArqConfig {
            max_sendwin: 1024,
            recvwin: 1024,
            sack_delay: 0.050,
            ack_delay: 0.100,
            ack_delay_estimation_window: 10,
            min_retransmission_delay: 0.200,
            retransmission_delay_slop: 1.1,
            explicit_nak_win: 10,
            explicit_nak_win_duration: 0.1,
            selective_ack: true,
            selective_ack_feedback_delay: 0.300,
            max_retransmissions: None,
            enforce_ordering: false,
            mcu: 100,
        }
    }
}

/// Adaptive modulation-and-coding parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmcConfig {
    /// Initial MCS index for new peers.
    pub mcsidx_init: usize,
    /// Lowest MCS index the AMC may select.
    pub mcsidx_min: usize,
    /// Highest MCS index the AMC may select.
    pub mcsidx_max: usize,
    /// Long-term PER below which we consider moving up.
    pub mcsidx_up_per_threshold: f64,
    /// Short-term PER above which we move down.
    pub mcsidx_down_per_threshold: f64,
    /// Multiplier applied to an MCS's transition probability on failure.
    pub mcsidx_alpha: f64,
    /// Floor on MCS transition probabilities.
    pub mcsidx_prob_floor: f64,
    /// Short PER window (seconds of airtime).
    pub short_per_window: f64,
    /// Long PER window (seconds of airtime).
    pub long_per_window: f64,
    /// Drop a deadline-bearing retransmission one MCS level.
    pub decrease_retrans_mcsidx: bool,
    /// MCS index for broadcast traffic.
    pub broadcast_mcsidx: usize,
    /// Soft gain for broadcast packets (dB).
    pub broadcast_gain_db: f64,
    /// Soft gain for ACK-only packets (dB).
    pub ack_gain_db: f64,
}

impl Default for AmcConfig {
    fn default() -> AmcConfig {
        AmcConfig {
            mcsidx_init: 0,
            mcsidx_min: 0,
            mcsidx_max: usize::MAX,
            mcsidx_up_per_threshold: 0.04,
            mcsidx_down_per_threshold: 0.10,
            mcsidx_alpha: 0.5,
            mcsidx_prob_floor: 0.1,
            short_per_window: 0.1,
            long_per_window: 0.4,
            decrease_retrans_mcsidx: true,
            broadcast_mcsidx: 0,
            broadcast_gain_db: 0.0,
            ack_gain_db: 0.0,
        }
    }
}

/// Slotted MAC parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacConfig {
    /// Slot length, including the guard interval (seconds).
    pub slot_size: f64,
    /// Inter-slot guard interval (seconds).
    pub guard_size: f64,
    /// How far before a slot we begin modulating for it (seconds).
    pub slot_modulate_lead_time: f64,
    /// How far before a slot we submit its samples to the device (seconds).
    pub slot_send_lead_time: f64,
    /// Overlap demodulated from the end of the previous slot (seconds).
    pub demod_overlap_size: f64,
    /// Slotted-ALOHA transmission probability.
    pub aloha_prob: f64,
    /// Synthesizer worker threads.
    pub num_synthesizer_threads: usize,
    /// Channelizer worker threads.
    pub num_channelizer_threads: usize,
}

impl Default for MacConfig {
    fn default() -> MacConfig {
        MacConfig {
            slot_size: 0.050,
            guard_size: 0.005,
            slot_modulate_lead_time: 0.025,
            slot_send_lead_time: 0.005,
            demod_overlap_size: 0.005,
            aloha_prob: 0.1,
            num_synthesizer_threads: 2,
            num_channelizer_threads: 2,
        }
    }
}

/// PHY parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhyConfig {
    /// The MCS ladder, most robust first.
    pub mcs_table: Vec<Mcs>,
    /// Per-MCS EVM thresholds for AMC descent; must match the table length.
    pub evm_thresholds: Option<Vec<Option<f64>>>,
    /// Channels, relative to the device center frequency.
    pub channels: Vec<Channel>,
    /// Channelizer/synthesizer resampler design.
    pub resampler: ResamplerParams,
}

impl Default for PhyConfig {
    fn default() -> PhyConfig {
        PhyConfig {
            mcs_table: crate::mcs::default_mcs_table(),
            evm_thresholds: None,
            channels: vec![Channel::new(0.0, 1e6)],
            resampler: ResamplerParams::default(),
        }
    }
}

/// Tap packet-filter parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Internal network address.
    pub int_net: u32,
    /// Internal network mask.
    pub int_netmask: u32,
    /// External network address.
    pub ext_net: u32,
    /// External network mask.
    pub ext_netmask: u32,
}

impl Default for NetConfig {
    fn default() -> NetConfig {
        NetConfig {
            // 10.10.10.0/24 internal, 192.168.0.0/16 external.
            int_net: 0x0a0a_0a00,
            int_netmask: 0xffff_ff00,
            ext_net: 0xc0a8_0000,
            ext_netmask: 0xffff_0000,
        }
    }
}

/// The complete radio configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Network-layer MTU in bytes.
    pub mtu: usize,
    /// Net queue discipline.
    pub queue_order: QueueOrder,
    /// HELLO broadcast interval (seconds); 0 disables.
    pub hello_interval: f64,
    /// Lead applied to timestamped packets (seconds).
    pub timestamp_delay: f64,
    pub arq: ArqConfig,
    pub amc: AmcConfig,
    pub mac: MacConfig,
    pub phy: PhyConfig,
    pub net: NetConfig,
}

impl Default for RadioConfig {
    fn default() -> RadioConfig {
        RadioConfig::new()
    }
}

impl RadioConfig {
    pub fn new() -> RadioConfig {
        RadioConfig {
            mtu: 1500,
            queue_order: QueueOrder::Fifo,
            hello_interval: 1.0,
            timestamp_delay: 0.1,
            arq: ArqConfig::default(),
            amc: AmcConfig::default(),
            mac: MacConfig::default(),
            phy: PhyConfig::default(),
            net: NetConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let rc = RadioConfig::new();
        assert!(rc.arq.sack_delay < rc.arq.ack_delay);
        assert!(rc.mac.guard_size < rc.mac.slot_size);
        assert!(!rc.phy.mcs_table.is_empty());
        assert!(rc.amc.mcsidx_down_per_threshold > rc.amc.mcsidx_up_per_threshold);
    }

    #[test]
    fn test_default_matches_new() {
        let rc = RadioConfig::default();
        assert_eq!(rc.mtu, 1500);
        assert_eq!(rc.arq.max_sendwin, 1024);
    }
}
