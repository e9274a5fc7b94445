//! Board-native representation of DDS settings.
//!
//! A setting is packed into one 128-bit word, each field scaled linearly over the board range of
//! its quantity:
//!
//! | bits    | field                                   | precision |
//! |---------|-----------------------------------------|-----------|
//! | 0..64   | frequency                               | 64 bit    |
//! | 64..80  | amplitude                               | 16 bit    |
//! | 80..96  | phase                                   | 16 bit    |
//! | 96..112 | frequency ramp rate (0 = no ramp)       | 16 bit    |
//! | 112..128| amplitude ramp rate, as inverse slope   | 16 bit    |
//!
//! The word travels to the board as 16 bytes: phase, amplitude, amplitude ramp and ramp as
//! little-endian `u16`, followed by the frequency as a little-endian `u64`.

use crate::config::{DdsChannelConfig, Range};
use crate::units::{Decibel, Frequency, Phase, Power};

/// Terminates the word list of one DDS channel.
pub const DDS_TERMINATOR: [u8; 2] = [0, 0];

/// One complete output setting of a DDS channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DdsSetting {
    pub frequency: Frequency,
    pub amplitude: Power,
    pub phase: Phase,
    pub ramp_rate: Frequency,
    pub amp_ramp_rate: Decibel,
}

impl DdsSetting {
    pub fn new(frequency: Frequency, amplitude: Power) -> Self {
        Self {
            frequency,
            amplitude,
            phase: Phase::new(0.),
            ramp_rate: Frequency::new(0.),
            amp_ramp_rate: Decibel::new(0.),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DdsWord(pub u128);

// Truncating linear map of `value` onto `0..=2^precision - 1` over `range`.
fn scale(value: f64, range: &Range, precision: u32) -> u128 {
    let steps = (2f64).powi(precision as i32) - 1.;
    let resolution = (range.max - range.min) / steps;
    let seq = ((value - range.min) / resolution).max(0.);
    if precision == 64 {
        seq as u64 as u128
    } else {
        (seq as u64).min((1u64 << precision) - 1) as u128
    }
}

fn ramp_word(ramp_rate: f64, range: &Range) -> u128 {
    if ramp_rate < range.min {
        0
    } else if ramp_rate > range.max {
        0xFFFF
    } else {
        scale(ramp_rate, range, 16)
    }
}

// Amplitude ramps are encoded by their inverse slope, rounded up.
fn amp_ramp_word(amp_ramp_rate: f64, range: &Range) -> u128 {
    if amp_ramp_rate < range.min {
        0
    } else if amp_ramp_rate > range.max {
        1
    } else {
        let min_slope = 1. / range.max;
        let max_slope = 1. / range.min;
        let resolution = (max_slope - min_slope) / 65535.;
        let seq = ((1. / amp_ramp_rate - min_slope) / resolution).ceil();
        (seq.max(0.) as u64).min(0xFFFF) as u128
    }
}

impl DdsWord {
    /// Encodes `setting` over the board ranges of `channel`. Values must already be validated
    /// against those ranges.
    pub fn encode(channel: &DdsChannelConfig, setting: &DdsSetting) -> Self {
        let freq = scale(setting.frequency.value(), &channel.board_freq_range, 64);
        let ampl = scale(setting.amplitude.value(), &channel.board_ampl_range, 16);
        let phase = scale(setting.phase.value(), &channel.board_phase_range, 16);
        let ramp = ramp_word(setting.ramp_rate.value(), &channel.board_ramp_range);
        let amp_ramp = amp_ramp_word(setting.amp_ramp_rate.value(), &channel.board_amp_ramp_range);
        DdsWord(freq | ampl << 64 | phase << 80 | ramp << 96 | amp_ramp << 112)
    }

    fn field(&self, shift: u32) -> u16 {
        (self.0 >> shift) as u16
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0..2].copy_from_slice(&self.field(80).to_le_bytes());
        buf[2..4].copy_from_slice(&self.field(64).to_le_bytes());
        buf[4..6].copy_from_slice(&self.field(112).to_le_bytes());
        buf[6..8].copy_from_slice(&self.field(96).to_le_bytes());
        buf[8..16].copy_from_slice(&(self.0 as u64).to_le_bytes());
        buf
    }

    pub fn frequency(&self, channel: &DdsChannelConfig) -> Frequency {
        let range = &channel.board_freq_range;
        let num = self.0 as u64 as f64;
        Frequency::new(range.min + num * (range.max - range.min) / (2f64.powi(64) - 1.))
    }

    pub fn amplitude(&self, channel: &DdsChannelConfig) -> Power {
        let range = &channel.board_ampl_range;
        let num = self.field(64) as f64;
        Power::new(range.min + num * (range.max - range.min) / 65535.)
    }

    pub fn phase(&self, channel: &DdsChannelConfig) -> Phase {
        let range = &channel.board_phase_range;
        let num = self.field(80) as f64;
        Phase::new(range.min + num * (range.max - range.min) / 65535.)
    }
}
