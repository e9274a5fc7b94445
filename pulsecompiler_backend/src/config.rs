//! Hardware description of a pulser: its TTL channels, DDS boards and time grid.
//!
//! A [`HardwareConfig`] is built once at process start, either programmatically through
//! [`HardwareConfigBuilder`] or from a JSON description ([`HardwareConfig::from_json_str`]), and is
//! immutable afterwards. The compiler and the pulser server receive it by reference.
//!
//! ## JSON description
//! Every field except the channel tables has a default matching the reference pulser
//! (32 channels, 40 ns steps, 1022 switches):
//! ```
//! use pulsecompiler_backend::config::*;
//!
//! let config = HardwareConfig::from_json_str(r#"{
//!     "time_resolution": "40.0e-9",
//!     "ttl_channels": {
//!         "866DP": { "channel_number": 3, "auto_inversion": true },
//!         "AdvanceDDS": { "channel_number": 18 },
//!         "ResetDDS": { "channel_number": 19 }
//!     },
//!     "dds_channels": {
//!         "729DP": {
//!             "address": 0,
//!             "allowed_freq_range": [150.0, 250.0],
//!             "allowed_ampl_range": [-48.0, -5.0],
//!             "frequency": 220.0,
//!             "amplitude": -48.0
//!         }
//!     }
//! }"#).unwrap();
//! assert_eq!(config.get_ttl_channel("866DP").unwrap().channel_number, 3);
//! assert_eq!(config.get_dds_channel("729DP").unwrap().name, "729DP");
//! ```

use std::collections::HashSet;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{ChannelKind, Error, Result};
use crate::units::{Frequency, Power, Time};
use crate::utils::TimeResolution;

/// TTL channel strobed by the compiler whenever the DDS boards must latch their next word.
pub const ADVANCE_DDS: &str = "AdvanceDDS";
/// TTL channel strobed once at the end of a sequence to rewind the DDS boards.
pub const RESET_DDS: &str = "ResetDDS";

/// Closed interval of allowed values, written `[min, max]` in JSON.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64)", into = "(f64, f64)")]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }
    pub fn within(&self, outer: &Range) -> bool {
        outer.min <= self.min && self.max <= outer.max
    }
}
impl From<(f64, f64)> for Range {
    fn from((min, max): (f64, f64)) -> Self {
        Self { min, max }
    }
}
impl From<Range> for (f64, f64) {
    fn from(r: Range) -> Self {
        (r.min, r.max)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TtlChannelConfig {
    pub channel_number: usize,
    #[serde(default)]
    pub is_manual: bool,
    #[serde(default)]
    pub manual_state: bool,
    #[serde(default)]
    pub manual_inversion: bool,
    #[serde(default)]
    pub auto_inversion: bool,
    #[serde(skip)]
    pub name: String,
}

impl TtlChannelConfig {
    /// An automatic, non-inverted channel.
    pub fn new(channel_number: usize) -> Self {
        Self {
            channel_number,
            is_manual: false,
            manual_state: false,
            manual_inversion: false,
            auto_inversion: false,
            name: String::new(),
        }
    }
}

/// Frequency and amplitude a DDS channel outputs while switched off.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OffParameters {
    pub frequency: Frequency,
    pub amplitude: Power,
}

impl Default for OffParameters {
    fn default() -> Self {
        Self {
            frequency: Frequency::new(0.),
            amplitude: Power::new(-48.),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_board_freq_range() -> Range {
    Range::new(0., 2000.)
}
fn default_board_ampl_range() -> Range {
    Range::new(-48., 6.)
}
fn default_board_phase_range() -> Range {
    Range::new(0., 360.)
}
fn default_board_ramp_range() -> Range {
    Range::new(0.000113687, 7.4505806)
}
fn default_board_amp_ramp_range() -> Range {
    Range::new(0.00174623, 22.8896)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DdsChannelConfig {
    pub address: u8,
    /// Experiment-level frequency limits in MHz.
    pub allowed_freq_range: Range,
    /// Experiment-level amplitude limits in dBm.
    pub allowed_ampl_range: Range,
    /// Frequency output at start-up and between sequences.
    pub frequency: Frequency,
    pub amplitude: Power,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_board_freq_range")]
    pub board_freq_range: Range,
    #[serde(default = "default_board_ampl_range")]
    pub board_ampl_range: Range,
    #[serde(default = "default_board_phase_range")]
    pub board_phase_range: Range,
    /// Frequency ramp rates in MHz/ms the board can represent.
    #[serde(default = "default_board_ramp_range")]
    pub board_ramp_range: Range,
    /// Amplitude ramp rates in dB/ms the board can represent.
    #[serde(default = "default_board_amp_ramp_range")]
    pub board_amp_ramp_range: Range,
    #[serde(default)]
    pub off_parameters: OffParameters,
    /// Phase-coherent boards keep frequency and phase when switched off and only drop the
    /// amplitude.
    #[serde(default = "default_true")]
    pub phase_coherent: bool,
    /// Key into [`HardwareConfig::remote_channels`] for boards programmed through another server.
    #[serde(default)]
    pub remote: Option<String>,
    #[serde(skip)]
    pub name: String,
}

impl DdsChannelConfig {
    /// A local, phase-coherent board with the default board ranges.
    pub fn new(
        address: u8,
        allowed_freq_range: Range,
        allowed_ampl_range: Range,
        frequency: Frequency,
        amplitude: Power,
    ) -> Self {
        Self {
            address,
            allowed_freq_range,
            allowed_ampl_range,
            frequency,
            amplitude,
            enabled: true,
            board_freq_range: default_board_freq_range(),
            board_ampl_range: default_board_ampl_range(),
            board_phase_range: default_board_phase_range(),
            board_ramp_range: default_board_ramp_range(),
            board_amp_ramp_range: default_board_amp_ramp_range(),
            off_parameters: OffParameters::default(),
            phase_coherent: true,
            remote: None,
            name: String::new(),
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        let ranges = [
            ("allowed frequency", &self.allowed_freq_range, Some(&self.board_freq_range)),
            ("allowed amplitude", &self.allowed_ampl_range, Some(&self.board_ampl_range)),
            ("board frequency", &self.board_freq_range, None),
            ("board amplitude", &self.board_ampl_range, None),
            ("board phase", &self.board_phase_range, None),
            ("board ramp", &self.board_ramp_range, None),
            ("board amplitude ramp", &self.board_amp_ramp_range, None),
        ];
        for (what, range, outer) in ranges {
            if !(range.min <= range.max) {
                return Err(Error::InvalidConfig(format!(
                    "DDS channel {}: {} range {}..{} is empty",
                    name, what, range.min, range.max
                )));
            }
            if let Some(outer) = outer {
                if !range.within(outer) {
                    return Err(Error::InvalidConfig(format!(
                        "DDS channel {}: {} range {}..{} exceeds the board range {}..{}",
                        name, what, range.min, range.max, outer.min, outer.max
                    )));
                }
            }
        }
        if self.board_ramp_range.min <= 0. || self.board_amp_ramp_range.min <= 0. {
            return Err(Error::InvalidConfig(format!(
                "DDS channel {}: ramp ranges must be strictly positive",
                name
            )));
        }
        Ok(())
    }
}

/// A DDS board programmed through another networked server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteChannel {
    pub ip: String,
    pub server: String,
    #[serde(default = "default_reset_setting")]
    pub reset_setting: String,
    #[serde(default = "default_program_setting")]
    pub program_setting: String,
}

fn default_reset_setting() -> String {
    "reset_dds".to_string()
}
fn default_program_setting() -> String {
    "program_dds".to_string()
}

impl RemoteChannel {
    pub fn new(ip: &str, server: &str) -> Self {
        Self {
            ip: ip.to_string(),
            server: server.to_string(),
            reset_setting: default_reset_setting(),
            program_setting: default_program_setting(),
        }
    }
}

/// Photon-counting mode of the PMT input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionMode {
    /// The board publishes counts every collection time on its own.
    Normal,
    /// Counts are gated by the pulse sequence and tagged with the repump state.
    Differential,
}

/// Photon counting and line trigger settings of the pulser.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CountingConfig {
    pub collection_mode: CollectionMode,
    /// Seconds per normal-mode reading.
    pub normal_collection_time: f64,
    /// Seconds per differential-mode reading.
    pub differential_collection_time: f64,
    /// In seconds.
    pub collection_time_range: Range,
    /// Seconds per time-tag tick.
    pub time_tag_resolution: f64,
    /// Delays after the line trigger, in microseconds.
    pub line_trigger_limits: Range,
}

impl Default for CountingConfig {
    fn default() -> Self {
        Self {
            collection_mode: CollectionMode::Normal,
            normal_collection_time: 0.1,
            differential_collection_time: 0.1,
            collection_time_range: Range::new(0.01, 5.),
            time_tag_resolution: 10e-9,
            line_trigger_limits: Range::new(0., 15_000.),
        }
    }
}

impl CountingConfig {
    pub fn collection_time(&self, mode: CollectionMode) -> f64 {
        match mode {
            CollectionMode::Normal => self.normal_collection_time,
            CollectionMode::Differential => self.differential_collection_time,
        }
    }

    fn validate(&self) -> Result<()> {
        let range = &self.collection_time_range;
        if !(range.min > 0. && range.min <= range.max) {
            return Err(Error::InvalidConfig(format!(
                "collection time range {}..{} s must be positive and non-empty",
                range.min, range.max
            )));
        }
        for mode in [CollectionMode::Normal, CollectionMode::Differential] {
            if !range.contains(self.collection_time(mode)) {
                return Err(Error::InvalidConfig(format!(
                    "{:?} collection time {} s outside of {}..{} s",
                    mode,
                    self.collection_time(mode),
                    range.min,
                    range.max
                )));
            }
        }
        if !(self.time_tag_resolution > 0.) {
            return Err(Error::InvalidConfig(format!(
                "time tag resolution must be positive, got {} s",
                self.time_tag_resolution
            )));
        }
        let limits = &self.line_trigger_limits;
        if !(limits.min >= 0. && limits.min <= limits.max && limits.max <= u32::MAX as f64) {
            return Err(Error::InvalidConfig(format!(
                "invalid line trigger limits {}..{} us",
                limits.min, limits.max
            )));
        }
        Ok(())
    }
}

/// Validated, immutable description of one pulser.
#[derive(Clone, Debug, PartialEq)]
pub struct HardwareConfig {
    channel_total: usize,
    time_resolution: TimeResolution,
    max_switches: usize,
    reset_step_duration: i64,
    sequence_time_range: (Time, Time),
    ttl_channels: IndexMap<String, TtlChannelConfig>,
    dds_channels: IndexMap<String, DdsChannelConfig>,
    remote_channels: IndexMap<String, RemoteChannel>,
    counting: CountingConfig,
}

impl HardwareConfig {
    pub fn builder() -> HardwareConfigBuilder {
        HardwareConfigBuilder::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let builder: HardwareConfigBuilder =
            serde_json::from_str(json).map_err(|e| Error::ConfigLoad(e.to_string()))?;
        builder.build()
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_json_str(&json)
    }

    /// The reference pulser: a camera trigger on channel 0, the DDS strobes on 18 and 19 and
    /// four local DDS boards.
    pub fn default_pulser() -> Result<Self> {
        let dds = |address, freq_max, ampl_max| {
            DdsChannelConfig::new(
                address,
                Range::new(0., freq_max),
                Range::new(-48., ampl_max),
                Frequency::new(125.),
                Power::new(-48.),
            )
        };
        HardwareConfig::builder()
            .ttl_channel("chan1", TtlChannelConfig::new(0))
            .ttl_channel(ADVANCE_DDS, TtlChannelConfig::new(18))
            .ttl_channel(RESET_DDS, TtlChannelConfig::new(19))
            .dds_channel("DDS_0", dds(0, 800., 6.))
            .dds_channel("DDS_1", dds(1, 155., -20.))
            .dds_channel("DDS_2", dds(2, 220., -20.))
            .dds_channel("DDS_3", dds(3, 155., -20.))
            .build()
    }

    pub fn channel_total(&self) -> usize {
        self.channel_total
    }
    pub fn time_resolution(&self) -> TimeResolution {
        self.time_resolution
    }
    pub fn max_switches(&self) -> usize {
        self.max_switches
    }
    /// Length of the advance and reset strobes, in steps.
    pub fn reset_step_duration(&self) -> i64 {
        self.reset_step_duration
    }
    pub fn sequence_time_range(&self) -> (Time, Time) {
        self.sequence_time_range
    }
    pub fn ttl_channels(&self) -> &IndexMap<String, TtlChannelConfig> {
        &self.ttl_channels
    }
    pub fn dds_channels(&self) -> &IndexMap<String, DdsChannelConfig> {
        &self.dds_channels
    }
    pub fn remote_channels(&self) -> &IndexMap<String, RemoteChannel> {
        &self.remote_channels
    }
    pub fn counting(&self) -> &CountingConfig {
        &self.counting
    }

    pub fn get_ttl_channel(&self, name: &str) -> Result<&TtlChannelConfig> {
        self.ttl_channels
            .get(name)
            .ok_or_else(|| Error::UnknownChannel {
                name: name.to_string(),
                kind: ChannelKind::Ttl,
            })
    }

    pub fn get_dds_channel(&self, name: &str) -> Result<&DdsChannelConfig> {
        self.dds_channels
            .get(name)
            .ok_or_else(|| Error::UnknownChannel {
                name: name.to_string(),
                kind: ChannelKind::Dds,
            })
    }

    pub fn get_remote_channel(&self, name: &str) -> Option<&RemoteChannel> {
        self.remote_channels.get(name)
    }
}

fn default_channel_total() -> usize {
    32
}
fn default_time_resolution() -> TimeResolution {
    TimeResolution::FORTY_NS
}
fn default_max_switches() -> usize {
    1022
}
fn default_reset_step_duration() -> i64 {
    3
}
fn default_sequence_time_range() -> Range {
    Range::new(0., 85.)
}

/// Unvalidated hardware description; [`build`](HardwareConfigBuilder::build) checks it and
/// produces a [`HardwareConfig`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HardwareConfigBuilder {
    #[serde(default = "default_channel_total")]
    channel_total: usize,
    #[serde(default = "default_time_resolution")]
    time_resolution: TimeResolution,
    #[serde(default = "default_max_switches")]
    max_switches: usize,
    #[serde(default = "default_reset_step_duration")]
    reset_step_duration: i64,
    /// In seconds.
    #[serde(default = "default_sequence_time_range")]
    sequence_time_range: Range,
    #[serde(default)]
    ttl_channels: IndexMap<String, TtlChannelConfig>,
    #[serde(default)]
    dds_channels: IndexMap<String, DdsChannelConfig>,
    #[serde(default)]
    remote_channels: IndexMap<String, RemoteChannel>,
    #[serde(default)]
    counting: CountingConfig,
}

impl Default for HardwareConfigBuilder {
    fn default() -> Self {
        Self {
            channel_total: default_channel_total(),
            time_resolution: default_time_resolution(),
            max_switches: default_max_switches(),
            reset_step_duration: default_reset_step_duration(),
            sequence_time_range: default_sequence_time_range(),
            ttl_channels: IndexMap::new(),
            dds_channels: IndexMap::new(),
            remote_channels: IndexMap::new(),
            counting: CountingConfig::default(),
        }
    }
}

impl HardwareConfigBuilder {
    pub fn channel_total(mut self, channel_total: usize) -> Self {
        self.channel_total = channel_total;
        self
    }
    pub fn time_resolution(mut self, time_resolution: TimeResolution) -> Self {
        self.time_resolution = time_resolution;
        self
    }
    pub fn max_switches(mut self, max_switches: usize) -> Self {
        self.max_switches = max_switches;
        self
    }
    pub fn reset_step_duration(mut self, steps: i64) -> Self {
        self.reset_step_duration = steps;
        self
    }
    /// Bounds, in seconds, on every pulse start and end.
    pub fn sequence_time_range(mut self, min_secs: f64, max_secs: f64) -> Self {
        self.sequence_time_range = Range::new(min_secs, max_secs);
        self
    }
    pub fn ttl_channel(mut self, name: &str, channel: TtlChannelConfig) -> Self {
        self.ttl_channels.insert(name.to_string(), channel);
        self
    }
    pub fn dds_channel(mut self, name: &str, channel: DdsChannelConfig) -> Self {
        self.dds_channels.insert(name.to_string(), channel);
        self
    }
    pub fn remote_channel(mut self, name: &str, channel: RemoteChannel) -> Self {
        self.remote_channels.insert(name.to_string(), channel);
        self
    }
    pub fn counting(mut self, counting: CountingConfig) -> Self {
        self.counting = counting;
        self
    }

    pub fn build(self) -> Result<HardwareConfig> {
        if self.channel_total == 0 || self.channel_total > 32 {
            return Err(Error::InvalidConfig(format!(
                "channel total {} outside of 1..=32",
                self.channel_total
            )));
        }
        if self.reset_step_duration < 1 {
            return Err(Error::InvalidConfig(format!(
                "reset step duration must be at least one step, got {}",
                self.reset_step_duration
            )));
        }
        let range = self.sequence_time_range;
        if !(range.min >= 0. && range.max > range.min) {
            return Err(Error::InvalidConfig(format!(
                "invalid sequence time range {}..{} s",
                range.min, range.max
            )));
        }
        self.counting.validate()?;
        let (min, max) = (Time::from_secs(range.min), Time::from_secs(range.max));
        let last_step = self
            .time_resolution
            .to_steps(max)
            .saturating_add(self.reset_step_duration);
        if last_step > u32::MAX as i64 {
            return Err(Error::InvalidConfig(format!(
                "sequence range up to {} s needs {} steps of {}, too many to address",
                range.max, last_step, self.time_resolution
            )));
        }

        let mut ttl_channels = self.ttl_channels;
        let mut used_numbers = HashSet::new();
        for (name, channel) in ttl_channels.iter_mut() {
            if channel.channel_number >= self.channel_total {
                return Err(Error::InvalidConfig(format!(
                    "TTL channel {} has number {}, but the pulser only has {} channels",
                    name, channel.channel_number, self.channel_total
                )));
            }
            if !used_numbers.insert(channel.channel_number) {
                return Err(Error::InvalidConfig(format!(
                    "TTL channel number {} is assigned twice (last to {})",
                    channel.channel_number, name
                )));
            }
            channel.name = name.clone();
        }

        let mut dds_channels = self.dds_channels;
        let mut used_addresses = HashSet::new();
        for (name, channel) in dds_channels.iter_mut() {
            channel.validate(name)?;
            if let Some(remote) = &channel.remote {
                if !self.remote_channels.contains_key(remote) {
                    return Err(Error::InvalidConfig(format!(
                        "DDS channel {} refers to unknown remote channel {}",
                        name, remote
                    )));
                }
            }
            if !used_addresses.insert((channel.remote.clone(), channel.address)) {
                return Err(Error::InvalidConfig(format!(
                    "DDS address {} is assigned twice (last to {})",
                    channel.address, name
                )));
            }
            channel.name = name.clone();
        }
        if !dds_channels.is_empty() {
            for strobe in [ADVANCE_DDS, RESET_DDS] {
                if !ttl_channels.contains_key(strobe) {
                    return Err(Error::InvalidConfig(format!(
                        "DDS channels require a TTL channel named {}",
                        strobe
                    )));
                }
            }
        }

        Ok(HardwareConfig {
            channel_total: self.channel_total,
            time_resolution: self.time_resolution,
            max_switches: self.max_switches,
            reset_step_duration: self.reset_step_duration,
            sequence_time_range: (min, max),
            ttl_channels,
            dds_channels,
            remote_channels: self.remote_channels,
            counting: self.counting,
        })
    }
}

/// Runtime output of one DDS channel outside of sequences.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DdsChannelState {
    pub frequency: Frequency,
    pub amplitude: Power,
    pub enabled: bool,
}

/// Runtime output of every DDS channel. Compiled sequences start from, and return to, this state.
#[derive(Clone, Debug, PartialEq)]
pub struct DdsState {
    channels: IndexMap<String, DdsChannelState>,
}

impl DdsState {
    pub fn from_config(config: &HardwareConfig) -> Self {
        let channels = config
            .dds_channels()
            .iter()
            .map(|(name, channel)| {
                let state = DdsChannelState {
                    frequency: channel.frequency,
                    amplitude: channel.amplitude,
                    enabled: channel.enabled,
                };
                (name.clone(), state)
            })
            .collect();
        Self { channels }
    }

    pub fn get(&self, name: &str) -> Result<&DdsChannelState> {
        self.channels.get(name).ok_or_else(|| Error::UnknownChannel {
            name: name.to_string(),
            kind: ChannelKind::Dds,
        })
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut DdsChannelState> {
        self.channels
            .get_mut(name)
            .ok_or_else(|| Error::UnknownChannel {
                name: name.to_string(),
                kind: ChannelKind::Dds,
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DdsChannelState)> {
        self.channels.iter()
    }
}
