//! Error type shared by every stage of sequence construction and compilation.
//!
//! Every failure is synchronous and fatal to the sequence it concerns: nothing is downgraded to a
//! warning and allowed to reach hardware. Callers that need to react differently to authoring bugs
//! and to configuration problems can branch on [`Error::kind`].

use std::fmt;

use crate::params::ParameterKey;
use crate::units::{Dimension, Time, Unit, WithUnit};

/// Coarse classification of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing parameters, unknown channels, undeclared subsequences or overrides, invalid units
    /// and malformed hardware descriptions.
    Configuration,
    /// DDS values outside the allowed or board range of a channel.
    Range,
    /// Overlapping pulses on one channel.
    Conflict,
    /// Switching-event budget of the pulser exceeded.
    Capacity,
    /// A sequence declares the same parameter twice.
    DuplicateDeclaration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Ttl,
    Dds,
}
impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChannelKind::Ttl => write!(f, "TTL"),
            ChannelKind::Dds => write!(f, "DDS"),
        }
    }
}

/// Which range of a DDS channel a value violated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RangeKind {
    /// Experiment-level limits, e.g. what an amplifier downstream of the board tolerates.
    Allowed,
    /// What the board can physically represent.
    Board,
}
impl fmt::Display for RangeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RangeKind::Allowed => write!(f, "allowed"),
            RangeKind::Board => write!(f, "board"),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Sequence {sequence} requires parameter {collection}.{name}, which was not supplied")]
    MissingParameter {
        collection: String,
        name: String,
        sequence: String,
    },
    #[error("Sequence {sequence} declares parameter {key} more than once")]
    DuplicateParameter { key: ParameterKey, sequence: String },
    #[error("Sequence {sequence} reads parameter {key} without declaring it")]
    UndeclaredParameter { key: ParameterKey, sequence: String },
    #[error("Sequence {sequence} does not list {subsequence} among its required subsequences")]
    UndeclaredSubsequence { subsequence: String, sequence: String },
    #[error("Sequence {sequence} may not replace parameter {key} of subsequence {subsequence}")]
    UndeclaredReplacement {
        key: ParameterKey,
        subsequence: String,
        sequence: String,
    },
    #[error("Unknown {kind} channel {name}")]
    UnknownChannel { name: String, kind: ChannelKind },
    #[error("Unknown unit {0}")]
    InvalidUnit(String),
    #[error("Expected a {expected} quantity, got a value in {found}")]
    UnitMismatch { expected: Dimension, found: Unit },
    #[error("Invalid parameter key {0}, expected the form collection.name")]
    InvalidParameterKey(String),
    #[error("Invalid hardware configuration: {0}")]
    InvalidConfig(String),
    #[error("Could not load hardware configuration: {0}")]
    ConfigLoad(String),
    #[error("Invalid pulse on channel {channel}: {reason}")]
    InvalidPulse { channel: String, reason: String },
    #[error("Time {0} does not fit in 64-bit picoseconds")]
    TimeOverflow(WithUnit),
    #[error("Time {time} on channel {channel} is outside of the sequence range {min}..{max}")]
    TimeOutOfRange {
        channel: String,
        time: Time,
        min: Time,
        max: Time,
    },
    #[error("{quantity} {value} on channel {channel} is outside of the {kind} range {min}..{max}")]
    OutOfRange {
        channel: String,
        quantity: &'static str,
        value: f64,
        min: f64,
        max: f64,
        kind: RangeKind,
    },
    #[error("Conflicting pulses on channel {channel}: {new} overlaps {existing}")]
    PulseConflict {
        channel: String,
        existing: String,
        new: String,
    },
    #[error("Channel {channel} is switched off at step {step} while not on")]
    InvalidSwitchState { channel: String, step: u64 },
    #[error("Exceeded maximum number of switches: {count} requested, {max} available")]
    SwitchCapacity { count: usize, max: usize },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DuplicateParameter { .. } => ErrorKind::DuplicateDeclaration,
            Error::OutOfRange { .. } => ErrorKind::Range,
            Error::PulseConflict { .. } | Error::InvalidSwitchState { .. } => ErrorKind::Conflict,
            Error::SwitchCapacity { .. } => ErrorKind::Capacity,
            Error::MissingParameter { .. }
            | Error::UndeclaredParameter { .. }
            | Error::UndeclaredSubsequence { .. }
            | Error::UndeclaredReplacement { .. }
            | Error::UnknownChannel { .. }
            | Error::InvalidUnit(_)
            | Error::UnitMismatch { .. }
            | Error::InvalidParameterKey(_)
            | Error::InvalidConfig(_)
            | Error::ConfigLoad(_)
            | Error::InvalidPulse { .. }
            | Error::TimeOverflow(_)
            | Error::TimeOutOfRange { .. } => ErrorKind::Configuration,
        }
    }
}
