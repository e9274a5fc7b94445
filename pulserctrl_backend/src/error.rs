use pulsecompiler_backend::{Error as CompileError, Time};

#[derive(thiserror::Error, Debug)]
pub enum PulserError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("Access locked: {0}")]
    AccessLocked(String),
    #[error("Please create new sequence first")]
    NoSequence,
    #[error("No programmed sequence")]
    NotProgrammed,
    #[error("Not running infinite sequence")]
    NotInfinite,
    #[error("Incorrect number of repetitions {0}, expected 1..=65535")]
    InvalidRepetitions(u32),
    #[error("Collection time {value} s outside of {min}..{max} s")]
    InvalidCollectionTime { value: f64, min: f64, max: f64 },
    #[error("Line trigger delay {value} outside of {min}..{max}")]
    InvalidLineTriggerDelay { value: Time, min: Time, max: Time },
    #[error("Pulser board: {0}")]
    Board(String),
}

pub type Result<T, E = PulserError> = std::result::Result<T, E>;
