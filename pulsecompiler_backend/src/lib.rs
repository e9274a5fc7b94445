//! Compiler for TTL and DDS pulse sequences of an FPGA pulser.
//!
//! Sequences are authored in physical units against named parameters ([`sequence`]), compiled
//! against a [`HardwareConfig`] onto the pulser's integer time grid ([`compiler`]) and emitted as
//! the byte programs the pulser and its DDS boards consume ([`program`]).

pub mod channel;
pub mod compiler;
pub mod config;
pub mod conversion;
pub mod dds;
pub mod error;
pub mod params;
pub mod program;
pub mod pulse;
pub mod sequence;
pub mod units;
pub mod utils;

#[cfg(feature = "python")]
mod python;

pub use compiler::*;
pub use config::*;
pub use conversion::*;
pub use error::*;
pub use params::*;
pub use program::*;
pub use pulse::*;
pub use sequence::*;
pub use units::*;
pub use utils::*;
