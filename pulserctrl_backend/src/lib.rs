//! Control backend of the pulser: programs compiled sequences on the board and runs them.
//!
//! [`PulserServer`] owns a [`PulserBoard`] and hands out [`PulserClient`]s, which accept
//! sequences built with `pulsecompiler_backend` and drive their execution. [`SimulatedBoard`]
//! stands in for the hardware.

pub mod board;
pub mod counting;
pub mod error;
pub mod pulser;
pub mod worker_cmd_chan;

pub use board::{
    wire_words, BoardCall, BoardLog, PhotonSource, PulserBoard, SimulatedBoard, REPUMP_OFF_BIT,
};
pub use counting::*;
pub use error::PulserError;
pub use pulser::*;
