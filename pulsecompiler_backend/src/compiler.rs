//! Compilation of pulses into a [`CompiledSequence`].
//!
//! ## Overview
//! A [`SequenceCompiler`] borrows the [`HardwareConfig`] and accumulates pulses channel by
//! channel. Each pulse is validated when it is added:
//! - the channel must exist in the configuration;
//! - start and end must lie in the sequence time range (strictly after its start for DDS pulses,
//!   whose first word must be programmed before the sequence runs);
//! - after rounding to time steps the pulse must last at least one step;
//! - DDS values must lie in the allowed range of the channel and all of them in the board range;
//! - the pulse must not overlap another pulse on the same channel.
//!
//! [`SequenceCompiler::compile`] then
//! 1. builds the word list of every DDS channel and strobes `AdvanceDDS` at every step where a
//!    DDS channel switches;
//! 2. strobes `ResetDDS` at the last switching step when DDS pulses were added;
//! 3. checks the number of switches against the pulser capacity;
//! 4. folds the TTL timelines into the switching table.
//!
//! ## Discretization
//! Start and duration are converted to steps separately, each rounded to the nearest step with
//! ties going to the even step. A pulse of 5 us at a 40 ns resolution lasts 125 steps.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use indexmap::IndexMap;
use ndarray::{Array2, Axis};

use crate::channel::{BaseTimeline, DdsSwitch, DdsTimeline, TtlTimeline};
use crate::config::{DdsChannelConfig, DdsState, HardwareConfig, Range, ADVANCE_DDS, RESET_DDS};
use crate::dds::{DdsSetting, DdsWord};
use crate::error::{Error, RangeKind, Result};
use crate::program::{CompiledSequence, DdsProgram};
use crate::pulse::{DdsPulse, TtlPulse};
use crate::sequence::Sequence;
use crate::units::Time;
use crate::utils::TickTimer;

fn check_range(
    channel: &str,
    quantity: &'static str,
    value: f64,
    range: &Range,
    kind: RangeKind,
) -> Result<()> {
    if range.contains(value) {
        Ok(())
    } else {
        Err(Error::OutOfRange {
            channel: channel.to_string(),
            quantity,
            value,
            min: range.min,
            max: range.max,
            kind,
        })
    }
}

/// Validates the values of `pulse` and returns the words programmed at its start and end.
///
/// A zero frequency or a zero amplitude requests the channel's off parameters. Phase-coherent
/// channels keep frequency, phase and ramps at the end of the pulse and only drop the amplitude.
fn dds_switch(channel: &DdsChannelConfig, pulse: &DdsPulse) -> Result<DdsSwitch> {
    let name = &pulse.channel;
    let off = &channel.off_parameters;
    let is_off = pulse.frequency.value() == 0. || pulse.amplitude.value() == 0.;
    let (frequency, amplitude) = if is_off {
        (off.frequency, off.amplitude)
    } else {
        let allowed = RangeKind::Allowed;
        let (freq, ampl) = (pulse.frequency.value(), pulse.amplitude.value());
        check_range(name, "Frequency", freq, &channel.allowed_freq_range, allowed)?;
        check_range(name, "Amplitude", ampl, &channel.allowed_ampl_range, allowed)?;
        (pulse.frequency, pulse.amplitude)
    };

    let board = RangeKind::Board;
    check_range(name, "Frequency", frequency.value(), &channel.board_freq_range, board)?;
    check_range(name, "Amplitude", amplitude.value(), &channel.board_ampl_range, board)?;
    check_range(name, "Phase", pulse.phase.value(), &channel.board_phase_range, board)?;
    if pulse.ramp_rate.value() != 0. {
        let rate = pulse.ramp_rate.value();
        check_range(name, "Ramp rate", rate, &channel.board_ramp_range, board)?;
    }
    if pulse.amp_ramp_rate.value() != 0. {
        let rate = pulse.amp_ramp_rate.value();
        check_range(name, "Amplitude ramp rate", rate, &channel.board_amp_ramp_range, board)?;
    }

    let on = DdsSetting {
        frequency,
        amplitude,
        phase: pulse.phase,
        ramp_rate: pulse.ramp_rate,
        amp_ramp_rate: pulse.amp_ramp_rate,
    };
    let off = if channel.phase_coherent {
        DdsSetting {
            amplitude: off.amplitude,
            ..on
        }
    } else {
        DdsSetting::new(off.frequency, off.amplitude)
    };
    Ok(DdsSwitch {
        on: DdsWord::encode(channel, &on),
        off: DdsWord::encode(channel, &off),
    })
}

pub struct SequenceCompiler<'a> {
    config: &'a HardwareConfig,
    dds_state: DdsState,
    ttl: IndexMap<String, TtlTimeline>,
    dds: IndexMap<String, DdsTimeline>,
    // Steps added by `extend_sequence_length`
    markers: BTreeSet<i64>,
}

impl<'a> SequenceCompiler<'a> {
    /// A compiler whose DDS channels start from the configured default outputs.
    pub fn new(config: &'a HardwareConfig) -> Self {
        Self {
            config,
            dds_state: DdsState::from_config(config),
            ttl: IndexMap::new(),
            dds: IndexMap::new(),
            markers: BTreeSet::new(),
        }
    }

    /// Uses `state`, the current outputs of the DDS channels, as the state before the first
    /// DDS pulse.
    pub fn with_dds_state(mut self, state: DdsState) -> Self {
        self.dds_state = state;
        self
    }

    pub fn config(&self) -> &HardwareConfig {
        self.config
    }

    pub fn is_edited(&self) -> bool {
        self.ttl.values().any(|tl| tl.is_edited())
            || self.dds.values().any(|tl| tl.is_edited())
            || !self.markers.is_empty()
    }

    fn check_time(&self, channel: &str, t: Time, strict_min: bool) -> Result<()> {
        let (min, max) = self.config.sequence_time_range();
        let above_min = if strict_min { t > min } else { t >= min };
        if above_min && t <= max {
            Ok(())
        } else {
            Err(Error::TimeOutOfRange {
                channel: channel.to_string(),
                time: t,
                min,
                max,
            })
        }
    }

    fn to_positions(&self, channel: &str, start: Time, duration: Time) -> Result<(i64, i64)> {
        let resolution = self.config.time_resolution();
        let start_pos = resolution.to_steps(start);
        let end_pos = start_pos + resolution.to_steps(duration);
        if end_pos <= start_pos {
            return Err(Error::InvalidPulse {
                channel: channel.to_string(),
                reason: format!(
                    "duration {} is shorter than one time step of {}",
                    duration,
                    resolution.step()
                ),
            });
        }
        Ok((start_pos, end_pos))
    }

    pub fn add_ttl_pulse(&mut self, pulse: &TtlPulse) -> Result<()> {
        pulse.validate()?;
        let config = self.config;
        let channel = config.get_ttl_channel(&pulse.channel)?;
        self.check_time(&pulse.channel, pulse.start, false)?;
        self.check_time(&pulse.channel, pulse.end(), false)?;
        let (start_pos, end_pos) = self.to_positions(&pulse.channel, pulse.start, pulse.duration)?;

        self.ttl
            .entry(pulse.channel.clone())
            .or_insert_with(|| TtlTimeline::new(&pulse.channel, channel.channel_number))
            .add_pulse(start_pos, end_pos, pulse.to_string())
    }

    pub fn add_ttl_pulses(&mut self, pulses: &[TtlPulse]) -> Result<()> {
        pulses.iter().try_for_each(|pulse| self.add_ttl_pulse(pulse))
    }

    pub fn add_dds_pulse(&mut self, pulse: &DdsPulse) -> Result<()> {
        pulse.validate()?;
        let config = self.config;
        let channel = config.get_dds_channel(&pulse.channel)?;
        self.check_time(&pulse.channel, pulse.start, true)?;
        self.check_time(&pulse.channel, pulse.end(), true)?;
        let switch = dds_switch(channel, pulse)?;
        let (start_pos, end_pos) = self.to_positions(&pulse.channel, pulse.start, pulse.duration)?;

        self.dds
            .entry(pulse.channel.clone())
            .or_insert_with(|| DdsTimeline::new(&pulse.channel))
            .add_pulse(start_pos, end_pos, pulse.to_string(), switch)
    }

    pub fn add_dds_pulses(&mut self, pulses: &[DdsPulse]) -> Result<()> {
        pulses.iter().try_for_each(|pulse| self.add_dds_pulse(pulse))
    }

    /// Makes the sequence last at least until `length` without switching any channel there.
    pub fn extend_sequence_length(&mut self, length: Time) -> Result<()> {
        self.check_time("sequence length", length, false)?;
        let pos = self.config.time_resolution().to_steps(length);
        self.markers.insert(pos);
        Ok(())
    }

    pub fn add_sequence(&mut self, sequence: &Sequence) -> Result<()> {
        self.add_ttl_pulses(sequence.ttl_pulses())?;
        self.add_dds_pulses(sequence.dds_pulses())
    }

    // Strobes are inserted through the same timelines as user pulses, so a user pulse on a
    // strobe channel is reported as a conflict.
    fn add_strobe(&mut self, name: &str, start_pos: i64) -> Result<()> {
        let config = self.config;
        let channel = config.get_ttl_channel(name)?;
        self.ttl
            .entry(name.to_string())
            .or_insert_with(|| TtlTimeline::new(name, channel.channel_number))
            .add_pulse(
                start_pos,
                start_pos + config.reset_step_duration(),
                format!("{} strobe", name),
            )
    }

    fn initial_dds_word(&self, channel: &DdsChannelConfig) -> Result<DdsWord> {
        let state = self.dds_state.get(&channel.name)?;
        let setting = if state.enabled {
            DdsSetting::new(state.frequency, state.amplitude)
        } else {
            DdsSetting::new(channel.off_parameters.frequency, channel.off_parameters.amplitude)
        };
        Ok(DdsWord::encode(channel, &setting))
    }

    /// Word lists of every configured DDS channel, empty when no DDS pulse was added.
    fn compile_dds(&mut self) -> Result<IndexMap<String, DdsProgram>> {
        if !self.dds.values().any(|tl| tl.is_edited()) {
            return Ok(IndexMap::new());
        }

        // Word changes per step. A pulse starting where another ends on the same channel wins.
        let mut changes: BTreeMap<i64, HashMap<String, DdsWord>> = BTreeMap::new();
        for (name, timeline) in &self.dds {
            for book in timeline.books() {
                changes
                    .entry(book.end_pos)
                    .or_default()
                    .insert(name.clone(), book.payload.off);
            }
        }
        for (name, timeline) in &self.dds {
            for book in timeline.books() {
                changes
                    .entry(book.start_pos)
                    .or_default()
                    .insert(name.clone(), book.payload.on);
            }
        }

        let config = self.config;
        let mut programs = IndexMap::new();
        for (name, channel) in config.dds_channels() {
            let mut word = self.initial_dds_word(channel)?;
            let mut words = Vec::with_capacity(changes.len() + 1);
            words.push(word);
            for change in changes.values() {
                if let Some(&new_word) = change.get(name) {
                    word = new_word;
                }
                words.push(word);
            }
            programs.insert(name.clone(), DdsProgram::new(channel.clone(), words));
        }

        let steps: Vec<i64> = changes.keys().copied().collect();
        for pos in steps {
            self.add_strobe(ADVANCE_DDS, pos)?;
        }
        Ok(programs)
    }

    fn last_switch(&self) -> i64 {
        let ttl_end = self.ttl.values().map(|tl| tl.last_end()).max().unwrap_or(0);
        let marker = self.markers.last().copied().unwrap_or(0);
        ttl_end.max(marker)
    }

    fn switch_count(&self) -> usize {
        self.ttl.values().map(|tl| tl.switch_count()).sum::<usize>() + self.markers.len()
    }

    /// Distinct switching steps and the state of every channel from each of them on.
    fn switching_table(&self) -> Result<(Vec<i64>, Array2<u8>, Vec<String>)> {
        let mut steps = self.markers.clone();
        steps.insert(0);
        for timeline in self.ttl.values() {
            for book in timeline.books() {
                steps.insert(book.start_pos);
                steps.insert(book.end_pos);
            }
        }
        let steps: Vec<i64> = steps.into_iter().collect();
        let row_of: HashMap<i64, usize> = steps.iter().enumerate().map(|(i, &s)| (s, i)).collect();

        let channel_total = self.config.channel_total();
        let mut channel_names = vec![String::new(); channel_total];
        for (name, channel) in self.config.ttl_channels() {
            channel_names[channel.channel_number] = name.clone();
        }

        let mut states = Array2::<i8>::zeros((steps.len(), channel_total));
        for timeline in self.ttl.values() {
            let col = timeline.channel_number();
            for book in timeline.books() {
                states[[row_of[&book.start_pos], col]] += 1;
                states[[row_of[&book.end_pos], col]] -= 1;
            }
        }
        states.accumulate_axis_inplace(Axis(0), |&prev, curr| *curr += prev);

        if let Some(((row, col), _)) = states
            .indexed_iter()
            .find(|(_, state)| !(0..=1).contains(*state))
        {
            return Err(Error::InvalidSwitchState {
                channel: channel_names[col].clone(),
                step: steps[row] as u64,
            });
        }
        Ok((steps, states.mapv(|state| state as u8), channel_names))
    }

    /// Consumes the compiler and produces the programs to write to the pulser.
    pub fn compile(mut self) -> Result<CompiledSequence> {
        let mut timer = TickTimer::new();

        let dds_programs = self.compile_dds()?;
        if !dds_programs.is_empty() {
            let last = self.last_switch();
            self.add_strobe(RESET_DDS, last)?;
        }
        timer.tick_log("DDS programs");

        let switch_count = self.switch_count();
        let max = self.config.max_switches();
        if switch_count > max {
            return Err(Error::SwitchCapacity {
                count: switch_count,
                max,
            });
        }

        let (steps, states, channel_names) = self.switching_table()?;
        timer.tick_log("Switching table");
        log::debug!(
            "Compiled {} switching steps ({} switches) and {} DDS programs",
            steps.len(),
            switch_count,
            dds_programs.len()
        );

        Ok(CompiledSequence::new(
            self.config.time_resolution(),
            channel_names,
            steps,
            states,
            dds_programs,
            switch_count,
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::TtlChannelConfig;
    use crate::units::{Decibel, Frequency, Phase, Power};

    fn us(t: f64) -> Time {
        Time::from_us(t)
    }

    fn dds_pulse(start: f64, duration: f64, freq: f64, ampl: f64) -> DdsPulse {
        DdsPulse::new(
            "DDS_0",
            us(start),
            us(duration),
            Frequency::new(freq),
            Power::new(ampl),
        )
    }

    mod ttl {
        use super::*;

        #[test]
        fn single_pulse() {
            let config = HardwareConfig::default_pulser().unwrap();
            let mut compiler = SequenceCompiler::new(&config);
            compiler
                .add_ttl_pulse(&TtlPulse::new("chan1", us(1.), us(5.)))
                .unwrap();
            let compiled = compiler.compile().unwrap();
            assert_eq!(compiled.steps(), &[0, 25, 150]);
            assert_eq!(compiled.channel_states("chan1"), Some(vec![0, 1, 0]));
            assert_eq!(compiled.switch_count(), 2);
            assert!(!compiled.has_dds());
        }

        #[test]
        fn pulse_at_zero_shares_first_row() {
            let config = HardwareConfig::default_pulser().unwrap();
            let mut compiler = SequenceCompiler::new(&config);
            compiler
                .add_ttl_pulse(&TtlPulse::new("chan1", Time::ZERO, us(1.)))
                .unwrap();
            let compiled = compiler.compile().unwrap();
            assert_eq!(compiled.steps(), &[0, 25]);
            assert_eq!(compiled.ttl_program(), vec![(0, 1), (25, 0)]);
        }

        #[test]
        fn rejects_invalid_pulses() {
            let config = HardwareConfig::default_pulser().unwrap();
            let mut compiler = SequenceCompiler::new(&config);
            let unknown = compiler.add_ttl_pulse(&TtlPulse::new("nope", us(1.), us(1.)));
            assert!(matches!(unknown, Err(Error::UnknownChannel { .. })));
            let late = TtlPulse::new("chan1", Time::from_secs(84.), Time::from_secs(2.));
            let late = compiler.add_ttl_pulse(&late);
            assert!(matches!(late, Err(Error::TimeOutOfRange { .. })));
            // 10 ns rounds to zero steps
            let short = TtlPulse::new("chan1", us(1.), Time::from_ns(10));
            let short = compiler.add_ttl_pulse(&short);
            assert!(matches!(short, Err(Error::InvalidPulse { .. })));
            assert!(!compiler.is_edited());
        }

        #[test]
        fn extend_sequence_length() {
            let config = HardwareConfig::default_pulser().unwrap();
            let mut compiler = SequenceCompiler::new(&config);
            compiler
                .add_ttl_pulse(&TtlPulse::new("chan1", us(1.), us(1.)))
                .unwrap();
            compiler.extend_sequence_length(us(10.)).unwrap();
            let compiled = compiler.compile().unwrap();
            assert_eq!(compiled.steps(), &[0, 25, 50, 250]);
            assert_eq!(compiled.duration(), us(10.));
            assert_eq!(compiled.switch_count(), 3);
        }

        #[test]
        fn switch_capacity() {
            let config = HardwareConfig::builder()
                .max_switches(4)
                .ttl_channel("a", TtlChannelConfig::new(0))
                .build()
                .unwrap();
            let pulses: Vec<_> = (0..3)
                .map(|i| TtlPulse::new("a", us(2. * i as f64), us(1.)))
                .collect();

            let mut compiler = SequenceCompiler::new(&config);
            compiler.add_ttl_pulses(&pulses[..2]).unwrap();
            assert_eq!(compiler.compile().unwrap().switch_count(), 4);

            let mut compiler = SequenceCompiler::new(&config);
            compiler.add_ttl_pulses(&pulses).unwrap();
            assert_eq!(
                compiler.compile().unwrap_err(),
                Error::SwitchCapacity { count: 6, max: 4 }
            );
        }
    }

    mod dds {
        use super::*;

        fn state_word(config: &HardwareConfig, freq: f64, ampl: f64) -> DdsWord {
            let channel = config.get_dds_channel("DDS_0").unwrap();
            DdsWord::encode(channel, &DdsSetting::new(Frequency::new(freq), Power::new(ampl)))
        }

        /// One word for the initial state and one per DDS switching step, strobed by AdvanceDDS.
        #[test]
        fn word_list_and_strobes() {
            let config = HardwareConfig::default_pulser().unwrap();
            let mut compiler = SequenceCompiler::new(&config);
            compiler.add_dds_pulse(&dds_pulse(1., 2., 100., -10.)).unwrap();
            compiler.add_dds_pulse(&dds_pulse(3., 1., 200., -20.)).unwrap();
            let compiled = compiler.compile().unwrap();

            let program = compiled.dds_program("DDS_0").unwrap();
            let words = program.words();
            assert_eq!(words.len(), 4);
            assert_eq!(words[0], state_word(&config, 125., -48.));
            assert_eq!(words[1], state_word(&config, 100., -10.));
            assert_eq!(words[2], state_word(&config, 200., -20.));
            // phase coherent: frequency kept, amplitude dropped
            assert_eq!(words[3], state_word(&config, 200., -48.));
            assert_eq!(program.to_bytes().len(), 4 * 16 + 2);

            // untouched channels repeat their initial state
            let other = compiled.dds_program("DDS_1").unwrap().words();
            assert_eq!(other.len(), 4);
            assert!(other.iter().all(|w| *w == other[0]));

            // strobes at 25, 75, 100 and the reset after the last advance strobe
            assert_eq!(
                compiled.channel_states(ADVANCE_DDS).unwrap(),
                vec![0, 1, 0, 1, 0, 1, 0, 0]
            );
            assert_eq!(compiled.steps(), &[0, 25, 28, 75, 78, 100, 103, 106]);
            assert_eq!(compiled.channel_states(RESET_DDS).unwrap()[6], 1);
            assert_eq!(compiled.switch_count(), 8);
        }

        #[test]
        fn runtime_state_and_off_pulses() {
            let config = HardwareConfig::default_pulser().unwrap();
            let mut state = DdsState::from_config(&config);
            state.get_mut("DDS_0").unwrap().enabled = false;
            let mut compiler = SequenceCompiler::new(&config).with_dds_state(state);
            compiler.add_dds_pulse(&dds_pulse(1., 1., 0., -10.)).unwrap();
            let compiled = compiler.compile().unwrap();
            let words = compiled.dds_program("DDS_0").unwrap().words();
            let off = state_word(&config, 0., -48.);
            assert_eq!(words, &[off, off, off]);
        }

        #[test]
        fn range_checks() {
            let config = HardwareConfig::default_pulser().unwrap();
            let mut compiler = SequenceCompiler::new(&config);
            let err = compiler
                .add_dds_pulse(&dds_pulse(1., 1., 900., -10.))
                .unwrap_err();
            assert!(matches!(
                err,
                Error::OutOfRange {
                    kind: RangeKind::Allowed,
                    ..
                }
            ));
            let phase = dds_pulse(1., 1., 100., -10.).with_phase(Phase::new(400.));
            assert!(matches!(
                compiler.add_dds_pulse(&phase),
                Err(Error::OutOfRange {
                    kind: RangeKind::Board,
                    ..
                })
            ));
            let ramp = dds_pulse(1., 1., 100., -10.).with_amp_ramp_rate(Decibel::new(100.));
            assert!(compiler.add_dds_pulse(&ramp).is_err());
            // DDS pulses may not start at the very beginning of the sequence
            let first = dds_pulse(0., 1., 100., -10.);
            assert!(matches!(
                compiler.add_dds_pulse(&first),
                Err(Error::TimeOutOfRange { .. })
            ));
        }

        #[test]
        fn adjacent_pulses() {
            let config = HardwareConfig::default_pulser().unwrap();
            let mut compiler = SequenceCompiler::new(&config);
            compiler.add_dds_pulse(&dds_pulse(1., 1., 100., -10.)).unwrap();
            compiler.add_dds_pulse(&dds_pulse(2., 1., 150., -10.)).unwrap();
            let overlap = compiler.add_dds_pulse(&dds_pulse(2.5, 1., 150., -10.));
            assert!(matches!(overlap, Err(Error::PulseConflict { .. })));
            let words = compiler.compile().unwrap().dds_program("DDS_0").unwrap().words().to_vec();
            assert_eq!(words.len(), 4);
            assert_eq!(words[2], state_word(&config, 150., -10.));
        }
    }
}
