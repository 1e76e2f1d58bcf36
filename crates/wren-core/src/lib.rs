//! # wren-core
//!
//! A slotted-MAC software radio core. wren turns a wideband RF front end
//! into a packet-switched wireless node: a TDMA or slotted-ALOHA MAC
//! schedules sample-accurate transmissions, parallel synthesizer and
//! channelizer worker pools keep the radio fed and drained at line rate,
//! and a per-peer ARQ controller provides reliable, ordered delivery with
//! selective acknowledgement and adaptive modulation-and-coding.
//!
//! ## Architecture
//!
//! ```text
//! tap frames → NetFilter → NetQueue → SmartController.pull → SlotSynthesizer
//!                                                                 ↓ slots
//!                                                           RadioDevice
//!                                                                 ↓ slots
//!            tap ← SmartController.received ← Channelizer ← timed receive
//! ```
//!
//! The RF device and the kernel tap are consumed through traits
//! ([`device::RadioDevice`], the [`netfilter::NetFilter`] frame input);
//! everything in between lives here.
//!
//! ## Example
//!
//! ```rust
//! use wren_core::config::RadioConfig;
//! use wren_core::mcs::default_mcs_table;
//! use wren_core::phy::Phy;
//!
//! let rc = RadioConfig::new();
//! let phy = Phy::new(1, default_mcs_table(), None, rc.mtu + 128).unwrap();
//! // Samples needed to modulate a 100-byte body at the most robust MCS:
//! let n = phy.modulated_size(0, 100).unwrap();
//! assert!(n > 0);
//! ```

pub mod clock;
pub mod coding;
pub mod config;
pub mod control;
pub mod controller;
pub mod device;
pub mod dsp;
pub mod estimator;
pub mod header;
pub mod iqbuf;
pub mod logger;
pub mod mac;
pub mod mcs;
pub mod netfilter;
pub mod netqueue;
pub mod packet;
pub mod phy;
pub mod radionet;
pub mod rt;
pub mod timer_queue;
pub mod types;
pub mod workqueue;

pub use clock::{MonoClock, MonoTime};
pub use config::RadioConfig;
pub use controller::smart::SmartController;
pub use controller::Controller;
pub use packet::{NetPacket, Packet, RadioPacket};
pub use types::{NodeId, Seq, BROADCAST_NODE_ID};
