//! Pulse events as authored by sequences, in continuous physical time.

use std::fmt;

use crate::error::{Error, Result};
use crate::units::{Decibel, Frequency, Phase, Power, Time};

fn check_timing(channel: &str, start: Time, duration: Time) -> Result<()> {
    if start.is_negative() {
        return Err(Error::InvalidPulse {
            channel: channel.to_string(),
            reason: format!("negative start {}", start),
        });
    }
    if duration <= Time::ZERO {
        return Err(Error::InvalidPulse {
            channel: channel.to_string(),
            reason: format!("non-positive duration {}", duration),
        });
    }
    Ok(())
}

/// Channel held high over `[start, start + duration)`.
#[derive(Clone, Debug, PartialEq)]
pub struct TtlPulse {
    pub channel: String,
    pub start: Time,
    pub duration: Time,
}

impl TtlPulse {
    pub fn new(channel: &str, start: Time, duration: Time) -> Self {
        Self {
            channel: channel.to_string(),
            start,
            duration,
        }
    }

    pub fn end(&self) -> Time {
        self.start + self.duration
    }

    /// Rejects negative starts and empty or negative durations.
    pub fn validate(&self) -> Result<()> {
        check_timing(&self.channel, self.start, self.duration)
    }
}

impl fmt::Display for TtlPulse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "TTL {} at {} for {}",
            self.channel, self.start, self.duration
        )
    }
}

/// DDS output set over `[start, start + duration)`. Phase and ramp rates default to zero, a zero
/// ramp rate meaning "jump".
#[derive(Clone, Debug, PartialEq)]
pub struct DdsPulse {
    pub channel: String,
    pub start: Time,
    pub duration: Time,
    pub frequency: Frequency,
    pub amplitude: Power,
    pub phase: Phase,
    /// MHz per ms.
    pub ramp_rate: Frequency,
    /// dB per ms.
    pub amp_ramp_rate: Decibel,
}

impl DdsPulse {
    pub fn new(
        channel: &str,
        start: Time,
        duration: Time,
        frequency: Frequency,
        amplitude: Power,
    ) -> Self {
        Self {
            channel: channel.to_string(),
            start,
            duration,
            frequency,
            amplitude,
            phase: Phase::new(0.),
            ramp_rate: Frequency::new(0.),
            amp_ramp_rate: Decibel::new(0.),
        }
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_ramp_rate(mut self, ramp_rate: Frequency) -> Self {
        self.ramp_rate = ramp_rate;
        self
    }

    pub fn with_amp_ramp_rate(mut self, amp_ramp_rate: Decibel) -> Self {
        self.amp_ramp_rate = amp_ramp_rate;
        self
    }

    pub fn end(&self) -> Time {
        self.start + self.duration
    }

    pub fn validate(&self) -> Result<()> {
        check_timing(&self.channel, self.start, self.duration)
    }
}

impl fmt::Display for DdsPulse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "DDS {} at {} for {} ({}, {}, {})",
            self.channel, self.start, self.duration, self.frequency, self.amplitude, self.phase
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn validate_timing() {
        assert!(TtlPulse::new("ch1", Time::ZERO, Time::from_us(1.)).validate().is_ok());
        for (start, duration) in [
            (Time::from_us(-1.), Time::from_us(1.)),
            (Time::from_us(1.), Time::ZERO),
            (Time::from_us(1.), Time::from_us(-1.)),
        ] {
            let err = TtlPulse::new("ch1", start, duration).validate().unwrap_err();
            assert!(matches!(err, Error::InvalidPulse { .. }));
        }
        let dds = DdsPulse::new(
            "DDS_0",
            Time::from_us(1.),
            Time::ZERO,
            Frequency::new(100.),
            Power::new(-10.),
        );
        assert!(dds.validate().is_err());
    }
}
