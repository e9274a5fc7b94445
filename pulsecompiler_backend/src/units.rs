//! Physical quantities carried through sequence definitions.
//!
//! Parameters arrive from the parameter store as [`WithUnit`] values, a number tagged with a
//! [`Unit`]. Before they touch the compiler they are converted into one of the typed quantities
//! below, each of which stores its value in a fixed canonical unit:
//!
//! | type          | canonical unit | storage              |
//! |---------------|----------------|----------------------|
//! | [`Time`]      | picosecond     | `i64`, exact         |
//! | [`Frequency`] | MHz            | `f64`                |
//! | [`Power`]     | dBm            | `f64`                |
//! | [`Decibel`]   | dB             | `f64`                |
//! | [`Phase`]     | degree         | `f64`                |
//!
//! Converting between dimensions (e.g. reading a duration from a value in MHz) fails with
//! [`Error::UnitMismatch`]. Times are integers so that sums of many durations never drift, and
//! discretization onto the pulser grid (see [`TimeResolution`]) stays exact.
//!
//! [`TimeResolution`]: crate::utils::TimeResolution

use std::f64::consts::PI;
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Neg, Sub};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dimension {
    Time,
    Frequency,
    Power,
    Ratio,
    Angle,
}
impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Dimension::Time => "time",
            Dimension::Frequency => "frequency",
            Dimension::Power => "power",
            Dimension::Ratio => "ratio",
            Dimension::Angle => "angle",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Unit {
    S,
    Ms,
    Us,
    Ns,
    Ps,
    Hz,
    KHz,
    MHz,
    GHz,
    DBm,
    DB,
    Deg,
    Rad,
}

impl Unit {
    pub fn dimension(self) -> Dimension {
        match self {
            Unit::S | Unit::Ms | Unit::Us | Unit::Ns | Unit::Ps => Dimension::Time,
            Unit::Hz | Unit::KHz | Unit::MHz | Unit::GHz => Dimension::Frequency,
            Unit::DBm => Dimension::Power,
            Unit::DB => Dimension::Ratio,
            Unit::Deg | Unit::Rad => Dimension::Angle,
        }
    }

    /// Factor converting a value in `self` into the canonical unit of its dimension.
    fn scale(self) -> f64 {
        match self {
            Unit::S => 1e12,
            Unit::Ms => 1e9,
            Unit::Us => 1e6,
            Unit::Ns => 1e3,
            Unit::Ps => 1.,
            Unit::Hz => 1e-6,
            Unit::KHz => 1e-3,
            Unit::MHz => 1.,
            Unit::GHz => 1e3,
            Unit::DBm | Unit::DB | Unit::Deg => 1.,
            Unit::Rad => 180. / PI,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Unit::S => "s",
            Unit::Ms => "ms",
            Unit::Us => "us",
            Unit::Ns => "ns",
            Unit::Ps => "ps",
            Unit::Hz => "Hz",
            Unit::KHz => "kHz",
            Unit::MHz => "MHz",
            Unit::GHz => "GHz",
            Unit::DBm => "dBm",
            Unit::DB => "dB",
            Unit::Deg => "deg",
            Unit::Rad => "rad",
        }
    }
}

impl FromStr for Unit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let unit = match s.trim() {
            "s" => Unit::S,
            "ms" => Unit::Ms,
            "us" | "µs" | "μs" => Unit::Us,
            "ns" => Unit::Ns,
            "ps" => Unit::Ps,
            "Hz" => Unit::Hz,
            "kHz" => Unit::KHz,
            "MHz" => Unit::MHz,
            "GHz" => Unit::GHz,
            "dBm" => Unit::DBm,
            "dB" => Unit::DB,
            "deg" => Unit::Deg,
            "rad" => Unit::Rad,
            other => return Err(Error::InvalidUnit(other.to_string())),
        };
        Ok(unit)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// A value tagged with its unit, as stored in the parameter vault.
///
/// # Example
/// ```
/// use pulsecompiler_backend::units::*;
///
/// let duration = WithUnit::parse(5.0, "us").unwrap();
/// assert_eq!(duration.value_in(Unit::Ns).unwrap(), 5000.);
/// assert!(duration.value_in(Unit::MHz).is_err());
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WithUnit {
    pub value: f64,
    pub unit: Unit,
}

impl WithUnit {
    pub fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }

    pub fn parse(value: f64, unit: &str) -> Result<Self> {
        Ok(Self::new(value, unit.parse()?))
    }

    pub fn dimension(&self) -> Dimension {
        self.unit.dimension()
    }

    pub fn value_in(&self, unit: Unit) -> Result<f64> {
        if self.unit.dimension() != unit.dimension() {
            return Err(Error::UnitMismatch {
                expected: unit.dimension(),
                found: self.unit,
            });
        }
        if self.unit == unit {
            return Ok(self.value);
        }
        Ok(self.value * self.unit.scale() / unit.scale())
    }
}

impl fmt::Display for WithUnit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

/// A point in time or a duration, stored as an exact number of picoseconds.
///
/// Arithmetic saturates, so a sum past the end of any sequence range stays past it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time {
    ps: i64,
}

impl Time {
    pub const ZERO: Time = Time { ps: 0 };

    pub const fn from_ps(ps: i64) -> Self {
        Self { ps }
    }
    pub const fn from_ns(ns: i64) -> Self {
        Self { ps: ns * 1_000 }
    }
    pub fn from_secs(secs: f64) -> Self {
        Self::from_float(secs, Unit::S)
    }
    pub fn from_ms(ms: f64) -> Self {
        Self::from_float(ms, Unit::Ms)
    }
    pub fn from_us(us: f64) -> Self {
        Self::from_float(us, Unit::Us)
    }

    // Rounded to the picosecond in the source unit: 0.1 us is exactly 100_000 ps.
    fn from_float(value: f64, unit: Unit) -> Self {
        Self {
            ps: (value * unit.scale()).round() as i64,
        }
    }

    pub fn as_ps(self) -> i64 {
        self.ps
    }
    pub fn as_secs(self) -> f64 {
        self.ps as f64 / 1e12
    }
    pub fn as_us(self) -> f64 {
        self.ps as f64 / 1e6
    }
    pub fn is_negative(self) -> bool {
        self.ps < 0
    }
    pub fn checked_add(self, rhs: Time) -> Option<Time> {
        self.ps.checked_add(rhs.ps).map(Time::from_ps)
    }
}

impl TryFrom<WithUnit> for Time {
    type Error = Error;

    fn try_from(value: WithUnit) -> Result<Self> {
        if value.dimension() != Dimension::Time {
            return Err(Error::UnitMismatch {
                expected: Dimension::Time,
                found: value.unit,
            });
        }
        let ps = (value.value * value.unit.scale()).round();
        // i64::MAX as f64 rounds up to 2^63, which no longer fits
        if !ps.is_finite() || ps.abs() >= i64::MAX as f64 {
            return Err(Error::TimeOverflow(value));
        }
        Ok(Self { ps: ps as i64 })
    }
}
impl From<Time> for WithUnit {
    fn from(t: Time) -> Self {
        WithUnit::new(t.ps as f64, Unit::Ps)
    }
}
impl Add for Time {
    type Output = Time;
    fn add(self, rhs: Time) -> Time {
        Time::from_ps(self.ps.saturating_add(rhs.ps))
    }
}
impl AddAssign for Time {
    fn add_assign(&mut self, rhs: Time) {
        *self = *self + rhs;
    }
}
impl Sub for Time {
    type Output = Time;
    fn sub(self, rhs: Time) -> Time {
        Time::from_ps(self.ps.saturating_sub(rhs.ps))
    }
}
impl Mul<i64> for Time {
    type Output = Time;
    fn mul(self, rhs: i64) -> Time {
        Time::from_ps(self.ps.saturating_mul(rhs))
    }
}
impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.ps % 1_000 == 0 {
            write!(f, "{} us", self.as_us())
        } else {
            write!(f, "{} ps", self.ps)
        }
    }
}

macro_rules! float_quantity {
    ($(#[$meta:meta])* $name:ident, $unit:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(f64);

        impl $name {
            pub const fn new(value: f64) -> Self {
                Self(value)
            }
            pub fn value(self) -> f64 {
                self.0
            }
        }
        impl TryFrom<WithUnit> for $name {
            type Error = Error;
            fn try_from(value: WithUnit) -> Result<Self> {
                value.value_in($unit).map(Self)
            }
        }
        impl From<$name> for WithUnit {
            fn from(q: $name) -> Self {
                WithUnit::new(q.0, $unit)
            }
        }
        impl Add for $name {
            type Output = $name;
            fn add(self, rhs: $name) -> $name {
                $name(self.0 + rhs.0)
            }
        }
        impl Sub for $name {
            type Output = $name;
            fn sub(self, rhs: $name) -> $name {
                $name(self.0 - rhs.0)
            }
        }
        impl Neg for $name {
            type Output = $name;
            fn neg(self) -> $name {
                $name(-self.0)
            }
        }
        impl Mul<f64> for $name {
            type Output = $name;
            fn mul(self, rhs: f64) -> $name {
                $name(self.0 * rhs)
            }
        }
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{} {}", self.0, $unit)
            }
        }
    };
}

float_quantity!(
    /// Frequency in MHz. Also used for DDS frequency ramp rates (MHz per ms).
    Frequency,
    Unit::MHz
);
float_quantity!(
    /// Absolute RF power in dBm.
    Power,
    Unit::DBm
);
float_quantity!(
    /// Relative level in dB, used for DDS amplitude ramp rates (dB per ms).
    Decibel,
    Unit::DB
);
float_quantity!(
    /// Phase in degrees.
    Phase,
    Unit::Deg
);
