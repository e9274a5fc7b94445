//! Time grid of the pulser and small helpers shared by the compiler.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Instant;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::units::Time;

/// Length of one pulser time step.
///
/// Resolutions are written as decimal seconds (`"40.0e-9"`) and parsed exactly into integer
/// picoseconds, so that converting a time to steps and back never drifts:
///
/// ```
/// use pulsecompiler_backend::utils::TimeResolution;
/// use pulsecompiler_backend::units::Time;
///
/// let res: TimeResolution = "40.0e-9".parse().unwrap();
/// let t = Time::from_us(5.);
/// assert_eq!(res.to_steps(t), 125);
/// assert_eq!(res.to_time(125), t);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeResolution {
    ps: i64,
}

impl TimeResolution {
    /// Step length of the reference pulser.
    pub const FORTY_NS: TimeResolution = TimeResolution { ps: 40_000 };

    pub fn from_time(step: Time) -> Result<Self> {
        if step.as_ps() <= 0 {
            return Err(Error::InvalidConfig(format!(
                "time resolution must be positive, got {}",
                step
            )));
        }
        Ok(Self { ps: step.as_ps() })
    }

    pub fn step(&self) -> Time {
        Time::from_ps(self.ps)
    }

    /// Number of steps closest to `t`. Exact ties go to the even step, matching decimal
    /// `to_integral_value` rounding.
    pub fn to_steps(&self, t: Time) -> i64 {
        let q = t.as_ps().div_euclid(self.ps);
        let twice_rem = 2 * t.as_ps().rem_euclid(self.ps);
        if twice_rem > self.ps || (twice_rem == self.ps && q % 2 != 0) {
            q + 1
        } else {
            q
        }
    }

    pub fn to_time(&self, steps: i64) -> Time {
        Time::from_ps(steps * self.ps)
    }

    pub fn as_secs(&self) -> f64 {
        self.step().as_secs()
    }
}

fn decimal_regex() -> &'static Regex {
    static DECIMAL_RE: OnceLock<Regex> = OnceLock::new();
    DECIMAL_RE.get_or_init(|| {
        Regex::new(r"^\s*\+?(\d*)(?:\.(\d*))?(?:[eE]([+-]?\d+))?\s*$").unwrap()
    })
}

impl FromStr for TimeResolution {
    type Err = Error;

    /// Parses a decimal number of seconds.
    fn from_str(s: &str) -> Result<Self> {
        let invalid =
            |reason: &str| Error::InvalidConfig(format!("time resolution {}: {}", s, reason));
        let caps = decimal_regex()
            .captures(s)
            .ok_or_else(|| invalid("not a decimal number"))?;
        let int_digits = caps.get(1).map_or("", |m| m.as_str());
        let frac_digits = caps.get(2).map_or("", |m| m.as_str());
        if int_digits.is_empty() && frac_digits.is_empty() {
            return Err(invalid("not a decimal number"));
        }
        let exponent: i32 = caps
            .get(3)
            .map_or(Ok(0), |m| m.as_str().parse())
            .map_err(|_| invalid("exponent out of range"))?;
        let mantissa: i64 = format!("{}{}", int_digits, frac_digits)
            .parse()
            .map_err(|_| invalid("too many digits"))?;

        // seconds -> picoseconds
        let shift = exponent - frac_digits.len() as i32 + 12;
        let ps = if shift >= 0 {
            10i64
                .checked_pow(shift as u32)
                .and_then(|scale| mantissa.checked_mul(scale))
                .ok_or_else(|| invalid("too large"))?
        } else {
            let divisor = 10i64
                .checked_pow((-shift) as u32)
                .ok_or_else(|| invalid("finer than a picosecond"))?;
            if mantissa % divisor != 0 {
                return Err(invalid("finer than a picosecond"));
            }
            mantissa / divisor
        };
        Self::from_time(Time::from_ps(ps))
    }
}

impl TryFrom<String> for TimeResolution {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}
impl From<TimeResolution> for String {
    fn from(res: TimeResolution) -> String {
        res.to_string()
    }
}
impl fmt::Display for TimeResolution {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}e-12", self.ps)
    }
}

/// Measures elapsed wall time between successive ticks, for compile-phase statistics.
pub struct TickTimer {
    last: Instant,
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Milliseconds since the previous tick.
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    pub fn tick_log(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        log::debug!("{}: {:.3} ms", msg, diff);
        diff
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}
