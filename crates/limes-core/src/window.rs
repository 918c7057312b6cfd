//! Rate-limit windows.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

const NANOS_PER_MILLI: u64 = 1_000_000;

const WINDOW_UNITS: [(&str, u64); 4] = [
    ("ms", NANOS_PER_MILLI),
    ("s", 1_000 * NANOS_PER_MILLI),
    ("m", 60 * 1_000 * NANOS_PER_MILLI),
    ("h", 60 * 60 * 1_000 * NANOS_PER_MILLI),
];

/// Size of the time window over which a rate limit is enforced, in
/// nanoseconds. "10 per second" has limit 10 and a window of `1s`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Window(pub u64);

/// Error from [`Window::from_str`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error("invalid value {0:?}: does not match expected format \"<number><unit>\"")]
    Malformed(String),
    #[error("invalid value {input:?}: unknown time unit {unit:?}")]
    UnknownUnit { input: String, unit: String },
    #[error("invalid value {0:?}: out of range")]
    Overflow(String),
}

impl Window {
    #[must_use]
    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    #[must_use]
    pub fn as_nanos(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl FromStr for Window {
    type Err = WindowError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Self(0));
        }
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| WindowError::Malformed(input.to_owned()))?;
        let (number, unit) = trimmed.split_at(split);
        let unit = unit.trim_start();
        if number.is_empty() || !unit.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(WindowError::Malformed(input.to_owned()));
        }
        let number: u64 = number
            .parse()
            .map_err(|_| WindowError::Overflow(input.to_owned()))?;
        let multiplier = WINDOW_UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, m)| *m)
            .ok_or_else(|| WindowError::UnknownUnit {
                input: input.to_owned(),
                unit: unit.to_owned(),
            })?;
        number
            .checked_mul(multiplier)
            .map(Self)
            .ok_or_else(|| WindowError::Overflow(input.to_owned()))
    }
}

/// Renders the shortest exact representation, e.g. `1m` rather than `60s`.
/// A zero window renders as the empty string.
impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return Ok(());
        }
        let shortest = WINDOW_UNITS
            .iter()
            .filter(|(_, m)| self.0 % m == 0)
            .map(|(unit, m)| format!("{}{unit}", self.0 / m))
            .min_by_key(String::len);
        match shortest {
            Some(repr) => f.write_str(&repr),
            None => write!(f, "{}ns", self.0),
        }
    }
}

impl Serialize for Window {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Window {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
