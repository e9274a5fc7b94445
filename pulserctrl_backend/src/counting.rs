//! Photon counting on the pulser: PMT collection modes, count and time-tag readout, and the
//! line trigger.
//!
//! Counting runs alongside sequences and is never locked by them. After a change of collection
//! mode or time the first [`SETTLING_READINGS`] normal-mode readings still belong to the old
//! setting and are dropped.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pulsecompiler_backend::{CollectionMode, CountingConfig, Range, Time};

use crate::board::{wire_words, PulserBoard, REPUMP_OFF_BIT};
use crate::error::{PulserError, Result};
use crate::pulser::PulserClient;

/// Normal-mode readings dropped after a collection setting changes.
pub const SETTLING_READINGS: usize = 3;

/// Repump light state during a reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepumpState {
    On,
    Off,
}

/// One normal-mode PMT reading.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PmtReading {
    /// Count rate in kcounts/s.
    pub rate: f64,
    pub repump: RepumpState,
    /// Estimated acquisition time in seconds since the Unix epoch.
    pub time: f64,
}

pub(crate) struct CountingState {
    config: CountingConfig,
    mode: CollectionMode,
    settling: usize,
    line_trigger_enabled: bool,
    line_trigger_delay: Time,
}

impl CountingState {
    pub(crate) fn new(config: &CountingConfig) -> Self {
        Self {
            config: config.clone(),
            mode: config.collection_mode,
            settling: 0,
            line_trigger_enabled: false,
            line_trigger_delay: Time::ZERO,
        }
    }

    fn collection_time(&self) -> f64 {
        self.config.collection_time(self.mode)
    }

    fn line_trigger_limits(&self) -> (Time, Time) {
        let limits = &self.config.line_trigger_limits;
        (Time::from_us(limits.min), Time::from_us(limits.max))
    }

    /// Readings of a drained normal FIFO, the last one taken at `now`.
    fn readings(&mut self, buf: &[u8], now: f64) -> Vec<PmtReading> {
        let collection_time = self.collection_time();
        let words: Vec<u32> = wire_words(buf).collect();
        let last = words.len().saturating_sub(1);
        let dropped = self.settling.min(words.len());
        self.settling -= dropped;
        words
            .iter()
            .enumerate()
            .skip(dropped)
            .map(|(i, &word)| PmtReading {
                rate: (word & !REPUMP_OFF_BIT) as f64 / collection_time / 1000.,
                repump: if word & REPUMP_OFF_BIT != 0 {
                    RepumpState::Off
                } else {
                    RepumpState::On
                },
                time: now - (last - i) as f64 * collection_time,
            })
            .collect()
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0., |since| since.as_secs_f64())
}

fn delay_us(delay: Time) -> u32 {
    (delay.as_ps() / 1_000_000) as u32
}

impl<B: PulserBoard> PulserClient<B> {
    pub fn get_mode(&self) -> CollectionMode {
        self.server.state.lock().counting.mode
    }

    pub fn set_mode(&mut self, mode: CollectionMode) -> Result<()> {
        let mut state = self.server.state.lock();
        match mode {
            CollectionMode::Normal => {
                let rate = state.counting.config.normal_collection_time;
                state.board.set_mode_normal()?;
                state.board.set_pmt_count_rate(Duration::from_secs_f64(rate))?;
            }
            CollectionMode::Differential => state.board.set_mode_differential()?,
        }
        state.counting.mode = mode;
        state.counting.settling = SETTLING_READINGS;
        log::info!("PMT collection mode set to {:?}", mode);
        Ok(())
    }

    /// Collection time of `mode` in seconds.
    pub fn get_collect_time(&self, mode: CollectionMode) -> f64 {
        self.server.state.lock().counting.config.collection_time(mode)
    }

    pub fn get_collect_time_range(&self) -> Range {
        self.server.config.counting().collection_time_range
    }

    /// Sets the collection time of `mode` to `seconds`. The board is only told the normal-mode
    /// time, differential readings are gated by the sequence.
    pub fn set_collect_time(&mut self, seconds: f64, mode: CollectionMode) -> Result<()> {
        let range = self.get_collect_time_range();
        if !range.contains(seconds) {
            return Err(PulserError::InvalidCollectionTime {
                value: seconds,
                min: range.min,
                max: range.max,
            });
        }
        let mut state = self.server.state.lock();
        match mode {
            CollectionMode::Normal => {
                state.board.set_pmt_count_rate(Duration::from_secs_f64(seconds))?;
                state.counting.config.normal_collection_time = seconds;
            }
            CollectionMode::Differential => {
                state.counting.config.differential_collection_time = seconds;
            }
        }
        state.counting.settling = SETTLING_READINGS;
        Ok(())
    }

    /// Deletes every queued normal-mode reading.
    pub fn reset_fifo_normal(&mut self) -> Result<()> {
        self.server.state.lock().board.reset_fifo_normal()
    }

    /// Drains the normal-mode readings queued on the board.
    pub fn get_all_counts(&mut self) -> Result<Vec<PmtReading>> {
        let mut state = self.server.state.lock();
        let buf = state.board.get_normal_counts()?;
        Ok(state.counting.readings(&buf, unix_now()))
    }

    /// Drains the raw counts of the readout windows of the sequence.
    pub fn get_readout_counts(&mut self) -> Result<Vec<u32>> {
        let buf = self.server.state.lock().board.get_readout_counts()?;
        Ok(wire_words(&buf).collect())
    }

    pub fn reset_readout_counts(&mut self) -> Result<()> {
        self.server.state.lock().board.reset_fifo_readout()
    }

    pub fn reset_timetags(&mut self) -> Result<()> {
        self.server.state.lock().board.reset_fifo_resolved()
    }

    /// Drains the photon arrival times, in seconds from the start of the sequence.
    pub fn get_timetags(&mut self) -> Result<Vec<f64>> {
        let resolution = self.get_time_tag_resolution();
        let buf = self.server.state.lock().board.get_resolved_counts()?;
        Ok(wire_words(&buf)
            .map(|ticks| ticks as f64 * resolution)
            .collect())
    }

    /// Seconds per time-tag tick.
    pub fn get_time_tag_resolution(&self) -> f64 {
        self.server.config.counting().time_tag_resolution
    }

    pub fn get_line_trigger_limits(&self) -> (Time, Time) {
        self.server.state.lock().counting.line_trigger_limits()
    }

    /// Returns whether sequences wait for the line trigger, first switching it if `enable` is
    /// given.
    pub fn line_trigger_state(&mut self, enable: Option<bool>) -> Result<bool> {
        let mut state = self.server.state.lock();
        if let Some(enable) = enable {
            if enable {
                let delay = delay_us(state.counting.line_trigger_delay);
                state.board.enable_line_trigger(delay)?;
            } else {
                state.board.disable_line_trigger()?;
            }
            state.counting.line_trigger_enabled = enable;
            log::info!("Line trigger {}", if enable { "enabled" } else { "disabled" });
        }
        Ok(state.counting.line_trigger_enabled)
    }

    /// Returns the delay after the line trigger, first setting it if `delay` is given.
    pub fn line_trigger_duration(&mut self, delay: Option<Time>) -> Result<Time> {
        let mut state = self.server.state.lock();
        if let Some(delay) = delay {
            let (min, max) = state.counting.line_trigger_limits();
            if delay < min || delay > max {
                return Err(PulserError::InvalidLineTriggerDelay {
                    value: delay,
                    min,
                    max,
                });
            }
            if state.counting.line_trigger_enabled {
                state.board.enable_line_trigger(delay_us(delay))?;
            }
            state.counting.line_trigger_delay = delay;
        }
        Ok(state.counting.line_trigger_delay)
    }
}
