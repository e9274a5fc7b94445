//! Per-channel translation of requested DDS values into what the board must output.
//!
//! A sequence names DDS channels by role (`"cooling"`, `"729"`); [`DdsAliases`] maps each role to
//! a hardware channel and a [`DdsConversion`]. A double-pass AOM, for instance, shifts the light
//! by twice the RF frequency around a center, so [`DoublePass`] turns the optical detuning a
//! sequence asks for into the RF frequency the board has to generate.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::units::{Decibel, Frequency, Phase, Power};

/// One method per quantity. Every method defaults to the identity.
pub trait DdsConversion: Send + Sync {
    fn frequency(&self, frequency: Frequency) -> Frequency {
        frequency
    }
    fn amplitude(&self, amplitude: Power) -> Power {
        amplitude
    }
    fn phase(&self, phase: Phase) -> Phase {
        phase
    }
    fn ramp_rate(&self, ramp_rate: Frequency) -> Frequency {
        ramp_rate
    }
    fn amp_ramp_rate(&self, amp_ramp_rate: Decibel) -> Decibel {
        amp_ramp_rate
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityConversion;
impl DdsConversion for IdentityConversion {}

/// Double-pass AOM around `center`: `f_rf = center - f / 2` and `phi_rf = (-phi / 2) mod 360`.
#[derive(Clone, Copy, Debug)]
pub struct DoublePass {
    pub center: Frequency,
}

impl Default for DoublePass {
    fn default() -> Self {
        Self {
            center: Frequency::new(220.),
        }
    }
}

impl DdsConversion for DoublePass {
    fn frequency(&self, frequency: Frequency) -> Frequency {
        self.center - frequency * 0.5
    }
    fn phase(&self, phase: Phase) -> Phase {
        Phase::new((-phase.value() / 2.).rem_euclid(360.))
    }
}

#[derive(Clone)]
pub struct DdsAlias {
    pub channel: String,
    pub conversion: Arc<dyn DdsConversion>,
}

impl fmt::Debug for DdsAlias {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DdsAlias({})", self.channel)
    }
}

/// Role name to hardware channel table. Several roles may share one channel.
#[derive(Clone, Debug, Default)]
pub struct DdsAliases {
    aliases: IndexMap<String, DdsAlias>,
}

impl DdsAliases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alias<C: DdsConversion + 'static>(
        mut self,
        alias: &str,
        channel: &str,
        conversion: C,
    ) -> Self {
        self.insert(alias, channel, conversion);
        self
    }

    pub fn insert<C: DdsConversion + 'static>(
        &mut self,
        alias: &str,
        channel: &str,
        conversion: C,
    ) {
        self.aliases.insert(
            alias.to_string(),
            DdsAlias {
                channel: channel.to_string(),
                conversion: Arc::new(conversion),
            },
        );
    }

    pub fn get(&self, alias: &str) -> Option<&DdsAlias> {
        self.aliases.get(alias)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn double_pass() {
        let dp = DoublePass::default();
        assert_eq!(dp.frequency(Frequency::new(0.)), Frequency::new(220.));
        assert_eq!(dp.frequency(Frequency::new(10.)), Frequency::new(215.));
        assert_eq!(dp.frequency(Frequency::new(-20.)), Frequency::new(230.));
        assert_eq!(dp.phase(Phase::new(90.)), Phase::new(315.));
        assert_eq!(dp.phase(Phase::new(0.)), Phase::new(0.));
        assert_eq!(dp.amplitude(Power::new(-10.)), Power::new(-10.));
    }

    #[test]
    fn aliases() {
        let aliases = DdsAliases::new()
            .with_alias("cooling", "DDS_0", IdentityConversion)
            .with_alias("729", "DDS_1", DoublePass::default());
        let alias = aliases.get("729").unwrap();
        assert_eq!(alias.channel, "DDS_1");
        assert_eq!(
            alias.conversion.frequency(Frequency::new(2.)),
            Frequency::new(219.)
        );
        assert!(aliases.get("DDS_0").is_none());
    }
}
