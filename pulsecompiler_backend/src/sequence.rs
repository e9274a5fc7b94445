//! Declarative pulse sequences.
//!
//! ## Overview
//!
//! An experiment sequence is a type implementing [`PulseSequence`]. The type declares which
//! parameters it reads, which subsequences it may insert and which of their parameters it is
//! allowed to override; its [`PulseSequence::sequence`] function then emits pulses through a
//! [`SequenceBuilder`]:
//!
//! ```
//! use maplit::hashmap;
//! use pulsecompiler_backend::*;
//!
//! struct Doppler;
//! impl PulseSequence for Doppler {
//!     fn required_parameters() -> Vec<ParameterKey> {
//!         vec![ParameterKey::new("Cooling", "duration")]
//!     }
//!     fn sequence(seq: &mut SequenceBuilder) -> Result<()> {
//!         let duration = seq.time("Cooling", "duration")?;
//!         seq.add_ttl("chan1", seq.start(), duration)?;
//!         seq.set_end(seq.start() + duration);
//!         Ok(())
//!     }
//! }
//!
//! let params =
//!     parameter_map(hashmap! { "Cooling.duration" => WithUnit::new(5., Unit::Us) }).unwrap();
//! let seq = Sequence::build::<Doppler>(&params).unwrap();
//! assert_eq!(seq.end(), Time::from_us(6.));
//!
//! let compiled = seq.compile(&HardwareConfig::default_pulser().unwrap()).unwrap();
//! assert_eq!(compiled.switch_count(), 2);
//! ```
//!
//! ## Lifecycle
//!
//! Construction runs `sequence()` to completion on a [`SequenceBuilder`] and yields an immutable
//! [`Sequence`], the event log. Compiling it against a [`HardwareConfig`] produces a
//! [`CompiledSequence`] or fails; a failed sequence is never patched, the caller builds a new one.
//! Neither the builder nor a half-built event log is ever exposed outside of `sequence()`.
//!
//! ## Composition
//!
//! [`SequenceBuilder::add_sequence`] builds a declared subsequence at a given position (by default
//! at the current `end`) with the parent's parameters, optionally overriding declared keys, and
//! copies its events. The parent's `end` becomes the later of both ends.
//!
//! [`CompiledSequence`]: crate::program::CompiledSequence

use std::any::TypeId;
use std::collections::{BTreeSet, HashSet};
use std::fmt;

use crate::compiler::SequenceCompiler;
use crate::config::HardwareConfig;
use crate::conversion::DdsAliases;
use crate::error::{Error, Result};
use crate::params::{ParameterKey, ParameterMap};
use crate::program::CompiledSequence;
use crate::pulse::{DdsPulse, TtlPulse};
use crate::units::{Frequency, Phase, Power, Time, WithUnit};

/// Start of a top-level sequence. The pulser does not accept a pulse table starting at 0.
pub const DEFAULT_START: Time = Time::from_ns(1_000);

/// A sequence definition. All declarations are associated functions so that they can be
/// inspected without running the sequence.
pub trait PulseSequence: 'static {
    /// Name used in error messages.
    fn name() -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    fn required_parameters() -> Vec<ParameterKey> {
        Vec::new()
    }

    fn required_subsequences() -> Vec<SequenceClass> {
        Vec::new()
    }

    /// For each subsequence, the keys this sequence may override when inserting it.
    fn replaced_parameters() -> Vec<(SequenceClass, Vec<ParameterKey>)> {
        Vec::new()
    }

    fn sequence(seq: &mut SequenceBuilder) -> Result<()>;

    fn all_required_parameters() -> BTreeSet<ParameterKey>
    where
        Self: Sized,
    {
        SequenceClass::of::<Self>().all_required_parameters()
    }
}

/// Type-erased handle on a [`PulseSequence`] implementation, used in declarations.
#[derive(Clone, Copy)]
pub struct SequenceClass {
    type_id: TypeId,
    name: fn() -> &'static str,
    required_parameters: fn() -> Vec<ParameterKey>,
    required_subsequences: fn() -> Vec<SequenceClass>,
    replaced_parameters: fn() -> Vec<(SequenceClass, Vec<ParameterKey>)>,
}

impl SequenceClass {
    pub fn of<T: PulseSequence>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: T::name,
            required_parameters: T::required_parameters,
            required_subsequences: T::required_subsequences,
            replaced_parameters: T::replaced_parameters,
        }
    }

    pub fn name(&self) -> &'static str {
        (self.name)()
    }

    pub fn required_parameters(&self) -> Vec<ParameterKey> {
        (self.required_parameters)()
    }

    pub fn required_subsequences(&self) -> Vec<SequenceClass> {
        (self.required_subsequences)()
    }

    /// Keys this class may override on `subsequence`.
    pub fn replaced_for(&self, subsequence: &SequenceClass) -> Vec<ParameterKey> {
        (self.replaced_parameters)()
            .into_iter()
            .filter(|(class, _)| class == subsequence)
            .flat_map(|(_, keys)| keys)
            .collect()
    }

    /// Own parameters plus those of every subsequence that are not declared replaceable.
    pub fn all_required_parameters(&self) -> BTreeSet<ParameterKey> {
        let mut required: BTreeSet<ParameterKey> = self.required_parameters().into_iter().collect();
        for subsequence in self.required_subsequences() {
            let replaced: HashSet<ParameterKey> =
                self.replaced_for(&subsequence).into_iter().collect();
            required.extend(
                subsequence
                    .all_required_parameters()
                    .into_iter()
                    .filter(|key| !replaced.contains(key)),
            );
        }
        required
    }

    /// The declared subset of `supplied`, rejecting duplicate declarations and missing keys.
    fn fill_parameters(&self, supplied: &ParameterMap) -> Result<ParameterMap> {
        let declared = self.required_parameters();
        let mut seen = HashSet::new();
        for key in &declared {
            if !seen.insert(key) {
                return Err(Error::DuplicateParameter {
                    key: key.clone(),
                    sequence: self.name().to_string(),
                });
            }
        }
        let mut filled = ParameterMap::new();
        for key in declared {
            let value = supplied
                .get(&key)
                .ok_or_else(|| Error::MissingParameter {
                    collection: key.collection.clone(),
                    name: key.name.clone(),
                    sequence: self.name().to_string(),
                })?;
            filled.insert(key, *value);
        }
        Ok(filled)
    }
}

impl PartialEq for SequenceClass {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}
impl Eq for SequenceClass {}

impl fmt::Debug for SequenceClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SequenceClass({})", self.name())
    }
}

/// Accumulating state handed to [`PulseSequence::sequence`].
pub struct SequenceBuilder<'a> {
    class: SequenceClass,
    aliases: &'a DdsAliases,
    replace: ParameterMap,
    parameters: ParameterMap,
    start: Time,
    end: Time,
    ttl_pulses: Vec<TtlPulse>,
    dds_pulses: Vec<DdsPulse>,
}

impl<'a> SequenceBuilder<'a> {
    pub fn start(&self) -> Time {
        self.start
    }

    pub fn end(&self) -> Time {
        self.end
    }

    pub fn set_end(&mut self, end: Time) {
        self.end = end;
    }

    /// Moves `end` to `t` unless it already lies later.
    pub fn advance_end(&mut self, t: Time) {
        self.end = self.end.max(t);
    }

    /// Value of a declared parameter.
    pub fn param(&self, key: &ParameterKey) -> Result<WithUnit> {
        self.parameters
            .get(key)
            .copied()
            .ok_or_else(|| Error::UndeclaredParameter {
                key: key.clone(),
                sequence: self.class.name().to_string(),
            })
    }

    pub fn get(&self, collection: &str, name: &str) -> Result<WithUnit> {
        self.param(&ParameterKey::new(collection, name))
    }

    pub fn time(&self, collection: &str, name: &str) -> Result<Time> {
        Time::try_from(self.get(collection, name)?)
    }

    pub fn frequency(&self, collection: &str, name: &str) -> Result<Frequency> {
        Frequency::try_from(self.get(collection, name)?)
    }

    pub fn power(&self, collection: &str, name: &str) -> Result<Power> {
        Power::try_from(self.get(collection, name)?)
    }

    pub fn phase(&self, collection: &str, name: &str) -> Result<Phase> {
        Phase::try_from(self.get(collection, name)?)
    }

    /// Appends a TTL pulse. Whether the channel exists is only known to the compiler.
    pub fn add_ttl(&mut self, channel: &str, start: Time, duration: Time) -> Result<()> {
        let pulse = TtlPulse::new(channel, start, duration);
        pulse.validate()?;
        self.ttl_pulses.push(pulse);
        Ok(())
    }

    /// Appends a DDS pulse, translating aliased channel names and values first.
    pub fn add_dds(&mut self, pulse: DdsPulse) -> Result<()> {
        pulse.validate()?;
        let pulse = match self.aliases.get(&pulse.channel) {
            Some(alias) => {
                let conv = &alias.conversion;
                DdsPulse {
                    channel: alias.channel.clone(),
                    start: pulse.start,
                    duration: pulse.duration,
                    frequency: conv.frequency(pulse.frequency),
                    amplitude: conv.amplitude(pulse.amplitude),
                    phase: conv.phase(pulse.phase),
                    ramp_rate: conv.ramp_rate(pulse.ramp_rate),
                    amp_ramp_rate: conv.amp_ramp_rate(pulse.amp_ramp_rate),
                }
            }
            None => pulse,
        };
        self.dds_pulses.push(pulse);
        Ok(())
    }

    /// Inserts subsequence `S` at `position`, or at the current end if `None`.
    ///
    /// # Arguments
    ///
    /// * `replacements`: parameter overrides for the subsequence; every key must be declared for
    ///   `S` in [`PulseSequence::replaced_parameters`].
    /// * `position`: start of the subsequence.
    pub fn add_sequence<S: PulseSequence>(
        &mut self,
        replacements: Option<ParameterMap>,
        position: Option<Time>,
    ) -> Result<()> {
        let sub_class = SequenceClass::of::<S>();
        if !self.class.required_subsequences().contains(&sub_class) {
            return Err(Error::UndeclaredSubsequence {
                subsequence: sub_class.name().to_string(),
                sequence: self.class.name().to_string(),
            });
        }
        let replacements = replacements.unwrap_or_default();
        let allowed = self.class.replaced_for(&sub_class);
        if let Some(key) = replacements.keys().find(|key| !allowed.contains(key)) {
            return Err(Error::UndeclaredReplacement {
                key: key.clone(),
                subsequence: sub_class.name().to_string(),
                sequence: self.class.name().to_string(),
            });
        }

        let position = position.unwrap_or(self.end);
        let mut merged = self.replace.clone();
        merged.extend(replacements);
        let sub = Sequence::build_with::<S>(&merged, position, self.aliases)?;

        self.ttl_pulses.extend_from_slice(sub.ttl_pulses());
        self.dds_pulses.extend_from_slice(sub.dds_pulses());
        self.end = self.end.max(sub.end());
        Ok(())
    }
}

/// Receiver of a finished sequence, typically the pulser server.
pub trait PulserHandle {
    type Error;

    /// Discards any pending, unprogrammed sequence.
    fn new_sequence(&mut self) -> Result<(), Self::Error>;
    fn add_ttl_pulses(&mut self, pulses: &[TtlPulse]) -> Result<(), Self::Error>;
    fn add_dds_pulses(&mut self, pulses: &[DdsPulse]) -> Result<(), Self::Error>;
    /// Compiles the pending sequence and writes it to the hardware.
    fn program_sequence(&mut self) -> Result<(), Self::Error>;
}

/// Immutable event log of a constructed sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct Sequence {
    name: &'static str,
    start: Time,
    end: Time,
    ttl_pulses: Vec<TtlPulse>,
    dds_pulses: Vec<DdsPulse>,
}

impl Sequence {
    /// Builds `T` at [`DEFAULT_START`] without DDS aliases.
    pub fn build<T: PulseSequence>(params: &ParameterMap) -> Result<Self> {
        Self::build_with::<T>(params, DEFAULT_START, &DdsAliases::default())
    }

    pub fn build_at<T: PulseSequence>(params: &ParameterMap, start: Time) -> Result<Self> {
        Self::build_with::<T>(params, start, &DdsAliases::default())
    }

    pub fn build_with<T: PulseSequence>(
        params: &ParameterMap,
        start: Time,
        aliases: &DdsAliases,
    ) -> Result<Self> {
        let class = SequenceClass::of::<T>();
        let parameters = class.fill_parameters(params)?;
        let mut builder = SequenceBuilder {
            class,
            aliases,
            replace: params.clone(),
            parameters,
            start,
            end: start,
            ttl_pulses: Vec::new(),
            dds_pulses: Vec::new(),
        };
        T::sequence(&mut builder)?;
        log::debug!(
            "Built sequence {}: {} TTL and {} DDS pulses, {}..{}",
            class.name(),
            builder.ttl_pulses.len(),
            builder.dds_pulses.len(),
            builder.start,
            builder.end
        );
        Ok(Self {
            name: class.name(),
            start: builder.start,
            end: builder.end,
            ttl_pulses: builder.ttl_pulses,
            dds_pulses: builder.dds_pulses,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn start(&self) -> Time {
        self.start
    }
    pub fn end(&self) -> Time {
        self.end
    }
    pub fn ttl_pulses(&self) -> &[TtlPulse] {
        &self.ttl_pulses
    }
    pub fn dds_pulses(&self) -> &[DdsPulse] {
        &self.dds_pulses
    }

    pub fn compile(&self, config: &HardwareConfig) -> Result<CompiledSequence> {
        let mut compiler = SequenceCompiler::new(config);
        compiler.add_sequence(self)?;
        compiler.compile()
    }

    /// Hands the events to `pulser`: a fresh pending sequence, the TTL pulses, the DDS pulses,
    /// then programming.
    pub fn program_sequence<P: PulserHandle>(&self, pulser: &mut P) -> Result<(), P::Error> {
        pulser.new_sequence()?;
        pulser.add_ttl_pulses(&self.ttl_pulses)?;
        pulser.add_dds_pulses(&self.dds_pulses)?;
        pulser.program_sequence()
    }
}
