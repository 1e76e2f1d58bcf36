//! # wren-sim
//!
//! An in-memory RF medium and a full-stack node harness for exercising the
//! wren radio core without hardware. The medium keeps a short history of
//! timed transmissions; simulated devices reconstruct any receive window
//! from it, so timed burst receive works exactly like a hardware stream.
//!
//! [`RadioNode`] assembles the whole pipeline for one node: packet queue,
//! smart controller, slot synthesizer, channelizer, and a TDMA MAC over a
//! [`SimRadioDevice`].

pub mod device;
pub mod medium;
pub mod node;

pub use device::SimRadioDevice;
pub use medium::SimMedium;
pub use node::{MacKind, RadioNode};
