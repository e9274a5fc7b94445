//! Pulser server: programs compiled sequences on a [`PulserBoard`] and runs them.
//!
//! ## Overview
//! A [`PulserServer`] owns the board together with the runtime state of the pulser: TTL modes
//! (manual or automatic, with inversions), the current DDS outputs and the last programmed
//! sequence. All of it sits behind one mutex, so every board operation is serialized.
//!
//! Callers work through a [`PulserClient`], one per caller context. A client accumulates its own
//! pending sequence and implements [`PulserHandle`], so a [`Sequence`] can be handed to it
//! directly:
//!
//! ```
//! use maplit::hashmap;
//! use pulsecompiler_backend::*;
//! use pulserctrl_backend::*;
//!
//! struct Flash;
//! impl PulseSequence for Flash {
//!     fn sequence(seq: &mut SequenceBuilder) -> Result<()> {
//!         seq.add_ttl("chan1", seq.start(), Time::from_us(10.))
//!     }
//! }
//!
//! let config = HardwareConfig::default_pulser().unwrap();
//! let board = SimulatedBoard::new(config.time_resolution());
//! let server = PulserServer::new(board, config).unwrap();
//! let mut client = server.client();
//!
//! let seq = Sequence::build::<Flash>(&hashmap! {}).unwrap();
//! seq.program_sequence(&mut client).unwrap();
//! client.start_single().unwrap();
//! assert!(client.wait_sequence_done(None).unwrap());
//! client.stop_sequence().unwrap();
//! ```
//!
//! ## Exclusivity
//! At most one run is in flight. Programming or starting while a run is in flight fails with
//! [`PulserError::AccessLocked`]. Programming a sequence with DDS pulses also takes the DDS lock,
//! which rejects manual DDS writes until [`PulserClient::stop_sequence`] or
//! [`PulserClient::clear_dds_lock`].
//!
//! [`Sequence`]: pulsecompiler_backend::Sequence

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;

use pulsecompiler_backend::dds::{DdsSetting, DdsWord};
use pulsecompiler_backend::{
    ChannelKind, CompiledSequence, DdsChannelConfig, DdsPulse, DdsState, Error as CompileError,
    Frequency, HardwareConfig, Power, PulserHandle, Range, RangeKind, RemoteChannel,
    SequenceCompiler, Time, TtlChannelConfig, TtlPulse,
};

use crate::board::PulserBoard;
use crate::counting::CountingState;
use crate::error::{PulserError, Result};

/// Link to a server programming DDS boards that are not attached to the pulser.
pub trait RemoteDds: Send {
    fn reset(&mut self, remote: &RemoteChannel) -> Result<()>;
    fn program(&mut self, remote: &RemoteChannel, address: u8, program: &[u8]) -> Result<()>;
}

/// Mode of the run started last.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceType {
    Single,
    Infinite,
    Number,
}

/// Largest repetition count the board accepts.
pub const MAX_REPETITIONS: u32 = (1 << 16) - 1;

fn check_allowed(
    channel: &DdsChannelConfig,
    quantity: &'static str,
    value: f64,
    range: &Range,
) -> Result<()> {
    if range.contains(value) {
        Ok(())
    } else {
        Err(CompileError::OutOfRange {
            channel: channel.name.clone(),
            quantity,
            value,
            min: range.min,
            max: range.max,
            kind: RangeKind::Allowed,
        }
        .into())
    }
}

pub(crate) struct ServerState<B> {
    pub(crate) board: B,
    ttl_channels: IndexMap<String, TtlChannelConfig>,
    dds_state: DdsState,
    remotes: HashMap<String, Box<dyn RemoteDds>>,
    programmed: Option<Arc<CompiledSequence>>,
    sequence_type: Option<SequenceType>,
    dds_lock: bool,
    pub(crate) counting: CountingState,
}

impl<B: PulserBoard> ServerState<B> {
    fn ttl_channel_mut(&mut self, name: &str) -> Result<&mut TtlChannelConfig> {
        self.ttl_channels.get_mut(name).ok_or_else(|| {
            CompileError::UnknownChannel {
                name: name.to_string(),
                kind: ChannelKind::Ttl,
            }
            .into()
        })
    }

    fn initialize_ttl(&mut self) -> Result<()> {
        for channel in self.ttl_channels.values() {
            if channel.is_manual {
                let state = channel.manual_state ^ channel.manual_inversion;
                self.board.set_manual(channel.channel_number, state)?;
            } else {
                self.board.set_auto(channel.channel_number, channel.auto_inversion)?;
            }
        }
        Ok(())
    }

    fn initialize_dds(&mut self, config: &HardwareConfig) -> Result<()> {
        self.board.initialize_dds()?;
        for channel in config.dds_channels().values() {
            let (frequency, amplitude) = (channel.frequency.value(), channel.amplitude.value());
            check_allowed(channel, "Frequency", frequency, &channel.allowed_freq_range)?;
            check_allowed(channel, "Amplitude", amplitude, &channel.allowed_ampl_range)?;
            let state = *self.dds_state.get(&channel.name)?;
            if state.enabled {
                self.set_parameters(config, channel, state.frequency, state.amplitude)?;
            } else {
                let off = channel.off_parameters;
                self.set_parameters(config, channel, off.frequency, off.amplitude)?;
            }
        }
        Ok(())
    }

    fn program_dds_channel(
        &mut self,
        config: &HardwareConfig,
        channel: &DdsChannelConfig,
        program: &[u8],
    ) -> Result<()> {
        let Some(remote_name) = &channel.remote else {
            self.board.reset_all_dds()?;
            self.board.set_dds_channel(channel.address)?;
            return self.board.program_dds(program);
        };
        match (
            self.remotes.get_mut(remote_name),
            config.get_remote_channel(remote_name),
        ) {
            (Some(link), Some(remote)) => {
                link.reset(remote)?;
                link.program(remote, channel.address, program)
            }
            _ => {
                log::warn!(
                    "Not programming DDS channel {}: no link to remote {}",
                    channel.name,
                    remote_name
                );
                Ok(())
            }
        }
    }

    fn set_parameters(
        &mut self,
        config: &HardwareConfig,
        channel: &DdsChannelConfig,
        frequency: Frequency,
        amplitude: Power,
    ) -> Result<()> {
        let word = DdsWord::encode(channel, &DdsSetting::new(frequency, amplitude));
        self.program_dds_channel(config, channel, &word.to_bytes())
    }

    fn is_running(&mut self) -> Result<bool> {
        Ok(self.sequence_type.is_some() && !self.board.is_seq_done()?)
    }

    fn check_idle(&mut self) -> Result<()> {
        if self.is_running()? {
            return Err(PulserError::AccessLocked(
                "a sequence is running, stop it first".to_string(),
            ));
        }
        Ok(())
    }

    fn check_dds_unlocked(&self) -> Result<()> {
        if self.dds_lock {
            return Err(PulserError::AccessLocked(
                "DDS channels are locked by the programmed sequence".to_string(),
            ));
        }
        Ok(())
    }
}

/// Shared handle to the pulser. Cloning it clones the handle, not the pulser.
pub struct PulserServer<B: PulserBoard> {
    pub(crate) config: Arc<HardwareConfig>,
    pub(crate) state: Arc<Mutex<ServerState<B>>>,
}

impl<B: PulserBoard> Clone for PulserServer<B> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            state: self.state.clone(),
        }
    }
}

impl<B: PulserBoard> PulserServer<B> {
    pub fn new(board: B, config: HardwareConfig) -> Result<Self> {
        Self::with_remotes(board, config, HashMap::new())
    }

    /// Takes over `board`, bringing TTL modes and DDS outputs to their configured state.
    ///
    /// # Arguments
    ///
    /// * `remotes`: links to the servers of remote DDS channels, keyed like
    ///   [`HardwareConfig::remote_channels`]. Channels without a link are skipped with a warning.
    pub fn with_remotes(
        board: B,
        config: HardwareConfig,
        remotes: HashMap<String, Box<dyn RemoteDds>>,
    ) -> Result<Self> {
        let mut state = ServerState {
            board,
            ttl_channels: config.ttl_channels().clone(),
            dds_state: DdsState::from_config(&config),
            remotes,
            programmed: None,
            sequence_type: None,
            dds_lock: false,
            counting: CountingState::new(config.counting()),
        };
        state.initialize_ttl()?;
        state.initialize_dds(&config)?;
        log::info!(
            "Pulser ready with {} TTL and {} DDS channels",
            config.ttl_channels().len(),
            config.dds_channels().len()
        );
        Ok(Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(state)),
        })
    }

    pub fn config(&self) -> &HardwareConfig {
        &self.config
    }

    pub fn client(&self) -> PulserClient<B> {
        PulserClient {
            server: self.clone(),
            sequence: None,
        }
    }

    /// Current outputs of the DDS channels outside of sequences.
    pub fn dds_state(&self) -> DdsState {
        self.state.lock().dds_state.clone()
    }

    pub fn sequence_type(&self) -> Option<SequenceType> {
        self.state.lock().sequence_type
    }

    pub fn programmed_sequence(&self) -> Option<Arc<CompiledSequence>> {
        self.state.lock().programmed.clone()
    }
}

#[derive(Default)]
struct PendingSequence {
    ttl_pulses: Vec<TtlPulse>,
    dds_pulses: Vec<DdsPulse>,
    lengths: Vec<Time>,
}

/// One caller context of a [`PulserServer`].
pub struct PulserClient<B: PulserBoard> {
    pub(crate) server: PulserServer<B>,
    sequence: Option<PendingSequence>,
}

impl<B: PulserBoard> PulserClient<B> {
    fn config(&self) -> &HardwareConfig {
        &self.server.config
    }

    fn pending(&mut self) -> Result<&mut PendingSequence> {
        self.sequence.as_mut().ok_or(PulserError::NoSequence)
    }

    fn compile_pending(&self, dds_state: DdsState) -> Result<CompiledSequence> {
        let pending = self.sequence.as_ref().ok_or(PulserError::NoSequence)?;
        let mut compiler = SequenceCompiler::new(self.config()).with_dds_state(dds_state);
        compiler.add_ttl_pulses(&pending.ttl_pulses)?;
        compiler.add_dds_pulses(&pending.dds_pulses)?;
        for length in &pending.lengths {
            compiler.extend_sequence_length(*length)?;
        }
        Ok(compiler.compile()?)
    }

    /// The pending sequence compiled, or the programmed one if `get_programmed`.
    fn sequence_view(&self, get_programmed: bool) -> Result<Arc<CompiledSequence>> {
        if get_programmed {
            self.server
                .programmed_sequence()
                .ok_or(PulserError::NotProgrammed)
        } else {
            let dds_state = self.server.dds_state();
            Ok(Arc::new(self.compile_pending(dds_state)?))
        }
    }

    pub fn add_ttl_pulse(&mut self, channel: &str, start: Time, duration: Time) -> Result<()> {
        self.add_ttl_pulses(&[TtlPulse::new(channel, start, duration)])
    }

    /// Makes the pending sequence last at least until `length`.
    pub fn extend_sequence_length(&mut self, length: Time) -> Result<()> {
        let (min, max) = self.config().sequence_time_range();
        if length < min || length > max {
            return Err(CompileError::TimeOutOfRange {
                channel: "sequence length".to_string(),
                time: length,
                min,
                max,
            }
            .into());
        }
        self.pending()?.lengths.push(length);
        Ok(())
    }

    pub fn start_single(&mut self) -> Result<()> {
        let mut state = self.server.state.lock();
        if state.programmed.is_none() {
            return Err(PulserError::NotProgrammed);
        }
        state.check_idle()?;
        state.board.reset_seq_counter()?;
        state.board.start_single()?;
        state.sequence_type = Some(SequenceType::Single);
        Ok(())
    }

    /// Repeats the programmed sequence until [`PulserClient::complete_infinite`].
    pub fn start_infinite(&mut self) -> Result<()> {
        let mut state = self.server.state.lock();
        if state.programmed.is_none() {
            return Err(PulserError::NotProgrammed);
        }
        state.check_idle()?;
        state.board.set_number_repetitions(0)?;
        state.board.reset_seq_counter()?;
        state.board.start_looped()?;
        state.sequence_type = Some(SequenceType::Infinite);
        Ok(())
    }

    /// Lets the current iteration of an infinite run finish and ends the run.
    pub fn complete_infinite(&mut self) -> Result<()> {
        let mut state = self.server.state.lock();
        if state.sequence_type != Some(SequenceType::Infinite) {
            return Err(PulserError::NotInfinite);
        }
        state.board.start_single()
    }

    pub fn start_number(&mut self, repetitions: u32) -> Result<()> {
        let mut state = self.server.state.lock();
        if state.programmed.is_none() {
            return Err(PulserError::NotProgrammed);
        }
        if !(1..=MAX_REPETITIONS).contains(&repetitions) {
            return Err(PulserError::InvalidRepetitions(repetitions));
        }
        state.check_idle()?;
        state.board.set_number_repetitions(repetitions)?;
        state.board.reset_seq_counter()?;
        state.board.start_looped()?;
        state.sequence_type = Some(SequenceType::Number);
        Ok(())
    }

    /// Stops any run and releases the DDS lock.
    pub fn stop_sequence(&mut self) -> Result<()> {
        let mut state = self.server.state.lock();
        state.board.reset_ram()?;
        match state.sequence_type {
            Some(SequenceType::Infinite | SequenceType::Number) => state.board.stop_looped()?,
            Some(SequenceType::Single) => state.board.stop_single()?,
            None => {}
        }
        state.sequence_type = None;
        state.dds_lock = false;
        Ok(())
    }

    /// Polls the board every millisecond until the run completes. Returns false on timeout,
    /// which defaults to the longest sequence the pulser can hold.
    pub fn wait_sequence_done(&self, timeout: Option<Duration>) -> Result<bool> {
        let timeout = timeout.unwrap_or_else(|| {
            Duration::from_secs_f64(self.config().sequence_time_range().1.as_secs())
        });
        let deadline = Instant::now() + timeout;
        loop {
            if self.server.state.lock().board.is_seq_done()? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Completed iterations of the current looped run.
    pub fn repetitions_completed(&self) -> Result<u32> {
        self.server.state.lock().board.how_many_sequences_done()
    }

    pub fn human_readable_ttl(&self, get_programmed: bool) -> Result<Vec<(Time, String)>> {
        Ok(self.sequence_view(get_programmed)?.human_readable_ttl())
    }

    pub fn human_readable_dds(
        &self,
        get_programmed: bool,
    ) -> Result<Vec<(String, Frequency, Power)>> {
        Ok(self.sequence_view(get_programmed)?.human_readable_dds())
    }

    /// TTL channel names with their channel numbers.
    pub fn get_channels(&self) -> Vec<(String, usize)> {
        self.config()
            .ttl_channels()
            .iter()
            .map(|(name, channel)| (name.clone(), channel.channel_number))
            .collect()
    }

    /// Puts `name` in manual mode, in `state` or in its last manual state if `None`.
    pub fn switch_manual(&mut self, name: &str, state: Option<bool>) -> Result<()> {
        let mut guard = self.server.state.lock();
        let server = &mut *guard;
        let channel = server.ttl_channel_mut(name)?;
        channel.is_manual = true;
        if let Some(state) = state {
            channel.manual_state = state;
        }
        let (number, level) = (
            channel.channel_number,
            channel.manual_state ^ channel.manual_inversion,
        );
        server.board.set_manual(number, level)?;
        log::info!("TTL {} switched to manual {}", name, if level { "on" } else { "off" });
        Ok(())
    }

    /// Puts `name` under sequence control, inverted if `invert`, or with its last inversion if
    /// `None`.
    pub fn switch_auto(&mut self, name: &str, invert: Option<bool>) -> Result<()> {
        let mut guard = self.server.state.lock();
        let server = &mut *guard;
        let channel = server.ttl_channel_mut(name)?;
        channel.is_manual = false;
        if let Some(invert) = invert {
            channel.auto_inversion = invert;
        }
        let (number, inversion) = (channel.channel_number, channel.auto_inversion);
        server.board.set_auto(number, inversion)?;
        log::info!("TTL {} switched to auto", name);
        Ok(())
    }

    /// `(manual, manual state, manual inversion, auto inversion)` of `name`.
    pub fn get_state(&self, name: &str) -> Result<(bool, bool, bool, bool)> {
        let mut state = self.server.state.lock();
        let channel = state.ttl_channel_mut(name)?;
        Ok((
            channel.is_manual,
            channel.manual_state,
            channel.manual_inversion,
            channel.auto_inversion,
        ))
    }

    pub fn get_dds_channels(&self) -> Vec<String> {
        self.config().dds_channels().keys().cloned().collect()
    }

    pub fn get_dds_frequency_range(&self, name: &str) -> Result<Range> {
        Ok(self.config().get_dds_channel(name)?.allowed_freq_range)
    }

    pub fn get_dds_amplitude_range(&self, name: &str) -> Result<Range> {
        Ok(self.config().get_dds_channel(name)?.allowed_ampl_range)
    }

    /// Returns the amplitude of `name`, first setting it to `amplitude` if given. The board is
    /// only written while the channel output is on.
    pub fn amplitude(&mut self, name: &str, amplitude: Option<Power>) -> Result<Power> {
        let config = self.server.config.clone();
        let mut state = self.server.state.lock();
        let channel = config.get_dds_channel(name)?;
        if let Some(amplitude) = amplitude {
            state.check_dds_unlocked()?;
            check_allowed(channel, "Amplitude", amplitude.value(), &channel.allowed_ampl_range)?;
            let current = *state.dds_state.get(name)?;
            if current.enabled {
                state.set_parameters(&config, channel, current.frequency, amplitude)?;
            }
            state.dds_state.get_mut(name)?.amplitude = amplitude;
        }
        Ok(state.dds_state.get(name)?.amplitude)
    }

    /// Returns the frequency of `name`, first setting it to `frequency` if given. The board is
    /// only written while the channel output is on.
    pub fn frequency(&mut self, name: &str, frequency: Option<Frequency>) -> Result<Frequency> {
        let config = self.server.config.clone();
        let mut state = self.server.state.lock();
        let channel = config.get_dds_channel(name)?;
        if let Some(frequency) = frequency {
            state.check_dds_unlocked()?;
            check_allowed(channel, "Frequency", frequency.value(), &channel.allowed_freq_range)?;
            let current = *state.dds_state.get(name)?;
            if current.enabled {
                state.set_parameters(&config, channel, frequency, current.amplitude)?;
            }
            state.dds_state.get_mut(name)?.frequency = frequency;
        }
        Ok(state.dds_state.get(name)?.frequency)
    }

    /// Returns whether `name` outputs, first switching it if `enabled` is given. A switched-off
    /// channel outputs its off parameters.
    pub fn output(&mut self, name: &str, enabled: Option<bool>) -> Result<bool> {
        let config = self.server.config.clone();
        let mut state = self.server.state.lock();
        let channel = config.get_dds_channel(name)?;
        if let Some(enabled) = enabled {
            state.check_dds_unlocked()?;
            let current = *state.dds_state.get(name)?;
            if enabled && !current.enabled {
                state.set_parameters(&config, channel, current.frequency, current.amplitude)?;
            } else if !enabled && current.enabled {
                let off = channel.off_parameters;
                state.set_parameters(&config, channel, off.frequency, off.amplitude)?;
            }
            state.dds_state.get_mut(name)?.enabled = enabled;
        }
        Ok(state.dds_state.get(name)?.enabled)
    }

    pub fn clear_dds_lock(&mut self) {
        self.server.state.lock().dds_lock = false;
    }

    pub fn internal_reset_dds(&mut self) -> Result<()> {
        self.server.state.lock().board.reset_all_dds()
    }

    pub fn internal_advance_dds(&mut self) -> Result<()> {
        self.server.state.lock().board.advance_all_dds()
    }

    /// Reprograms the DDS boards to their initial state.
    pub fn reinitialize_dds(&mut self) -> Result<()> {
        self.server.state.lock().board.initialize_dds()
    }
}

impl<B: PulserBoard> PulserHandle for PulserClient<B> {
    type Error = PulserError;

    fn new_sequence(&mut self) -> Result<()> {
        self.sequence = Some(PendingSequence::default());
        Ok(())
    }

    fn add_ttl_pulses(&mut self, pulses: &[TtlPulse]) -> Result<()> {
        for pulse in pulses {
            self.config().get_ttl_channel(&pulse.channel)?;
            pulse.validate()?;
        }
        self.pending()?.ttl_pulses.extend_from_slice(pulses);
        Ok(())
    }

    fn add_dds_pulses(&mut self, pulses: &[DdsPulse]) -> Result<()> {
        for pulse in pulses {
            self.config().get_dds_channel(&pulse.channel)?;
            pulse.validate()?;
        }
        self.pending()?.dds_pulses.extend_from_slice(pulses);
        Ok(())
    }

    /// Compiles the pending sequence against the current DDS outputs and writes it to the
    /// board. The DDS lock is taken when the sequence has DDS pulses.
    fn program_sequence(&mut self) -> Result<()> {
        let config = self.server.config.clone();
        let mut state = self.server.state.lock();
        state.check_idle()?;
        let compiled = self.compile_pending(state.dds_state.clone())?;

        state.board.program_board(&compiled.ttl_program_bytes())?;
        if compiled.has_dds() {
            state.dds_lock = true;
            for program in compiled.dds_programs().values() {
                let channel = config.get_dds_channel(program.name())?;
                state.program_dds_channel(&config, channel, &program.to_bytes())?;
            }
        }
        log::info!(
            "Programmed {} switches over {}",
            compiled.switch_count(),
            compiled.duration()
        );
        state.programmed = Some(Arc::new(compiled));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::board::SimulatedBoard;

    #[test]
    fn allowed_range_is_inclusive() {
        let config = HardwareConfig::default_pulser().unwrap();
        let channel = config.get_dds_channel("DDS_1").unwrap();
        let range = channel.allowed_ampl_range;
        assert!(check_allowed(channel, "Amplitude", -20., &range).is_ok());
        assert!(check_allowed(channel, "Amplitude", -48., &range).is_ok());
        assert!(matches!(
            check_allowed(channel, "Amplitude", -19.9, &range),
            Err(PulserError::Compile(CompileError::OutOfRange { quantity: "Amplitude", .. }))
        ));
    }

    #[test]
    fn idle_until_started() {
        let config = HardwareConfig::default_pulser().unwrap();
        let board = SimulatedBoard::new(config.time_resolution());
        let server = PulserServer::new(board, config).unwrap();
        let mut state = server.state.lock();
        assert!(!state.is_running().unwrap());
        assert!(state.check_dds_unlocked().is_ok());
        state.dds_lock = true;
        assert!(matches!(state.check_dds_unlocked(), Err(PulserError::AccessLocked(_))));
    }
}
