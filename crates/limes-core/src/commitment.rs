//! Commitment durations and per-resource commitment configuration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

const SECONDS_PER_MINUTE: u64 = 60;
const SECONDS_PER_HOUR: u64 = 3600;

/// Length of a commitment, e.g. `1 year` or `1 year, 6 months`.
///
/// Calendar-based parts are kept separate from the fixed-length part since
/// months and years do not have a fixed number of seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommitmentDuration {
    pub years: u32,
    pub months: u32,
    pub days: u32,
    /// Hours, minutes and seconds, in seconds.
    pub short_seconds: u64,
}

/// Error from [`CommitmentDuration::from_str`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommitmentDurationError {
    #[error("could not parse CommitmentDuration {input:?}: malformed field {field:?}")]
    MalformedField { input: String, field: String },
    #[error("could not parse CommitmentDuration {0:?}: empty duration")]
    Empty(String),
}

impl CommitmentDuration {
    #[must_use]
    pub fn from_seconds(seconds: u64) -> Self {
        Self {
            short_seconds: seconds,
            ..Self::default()
        }
    }
}

impl FromStr for CommitmentDuration {
    type Err = CommitmentDurationError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut result = Self::default();
        for field in input.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            let malformed = || CommitmentDurationError::MalformedField {
                input: input.to_owned(),
                field: field.to_owned(),
            };
            let (amount, unit) = field.split_once(char::is_whitespace).ok_or_else(malformed)?;
            let amount: u32 = amount.parse().map_err(|_| malformed())?;
            let unit = unit.trim();
            let unit = unit.strip_suffix('s').unwrap_or(unit);
            match unit {
                "second" => result.short_seconds += u64::from(amount),
                "minute" => result.short_seconds += u64::from(amount) * SECONDS_PER_MINUTE,
                "hour" => result.short_seconds += u64::from(amount) * SECONDS_PER_HOUR,
                "day" => result.days += amount,
                "month" => result.months += amount,
                "year" => result.years += amount,
                _ => return Err(malformed()),
            }
        }
        if result == Self::default() {
            return Err(CommitmentDurationError::Empty(input.to_owned()));
        }
        Ok(result)
    }
}

impl fmt::Display for CommitmentDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hours = self.short_seconds / SECONDS_PER_HOUR;
        let minutes = (self.short_seconds % SECONDS_PER_HOUR) / SECONDS_PER_MINUTE;
        let seconds = self.short_seconds % SECONDS_PER_MINUTE;
        let parts = [
            (u64::from(self.years), "year"),
            (u64::from(self.months), "month"),
            (u64::from(self.days), "day"),
            (hours, "hour"),
            (minutes, "minute"),
            (seconds, "second"),
        ];
        let fields: Vec<String> = parts
            .iter()
            .filter(|(amount, _)| *amount > 0)
            .map(|(amount, unit)| match amount {
                1 => format!("1 {unit}"),
                n => format!("{n} {unit}s"),
            })
            .collect();
        f.write_str(&fields.join(", "))
    }
}

impl Serialize for CommitmentDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CommitmentDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Commitment policy of a resource, as shown in reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentConfiguration {
    pub durations: Vec<CommitmentDuration>,
    /// Unix timestamp before which new commitments cannot be confirmed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_confirm_by: Option<i64>,
}

/// Status of a stored commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitmentState {
    /// Confirmed and counting against usage.
    Active,
    /// Waiting for capacity to be confirmed.
    Pending,
    /// Scheduled for confirmation at a later date.
    Planned,
    /// Past its expiry date.
    Expired,
    /// Replaced by another commitment.
    Superseded,
}

impl CommitmentState {
    /// Parses the value of the `state` column. Unknown states yield `None`.
    #[must_use]
    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "pending" => Some(Self::Pending),
            "planned" => Some(Self::Planned),
            "expired" => Some(Self::Expired),
            "superseded" => Some(Self::Superseded),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format_roundtrip_canonically() {
        let d: CommitmentDuration = "1 year, 6 months".parse().unwrap();
        assert_eq!(d.years, 1);
        assert_eq!(d.months, 6);
        assert_eq!(d.to_string(), "1 year, 6 months");

        let d: CommitmentDuration = "90 minutes".parse().unwrap();
        assert_eq!(d.to_string(), "1 hour, 30 minutes");
    }

    #[test]
    fn parse_rejects_empty_and_malformed() {
        assert!(matches!(
            "".parse::<CommitmentDuration>(),
            Err(CommitmentDurationError::Empty(_))
        ));
        assert!(matches!(
            "3 fortnights".parse::<CommitmentDuration>(),
            Err(CommitmentDurationError::MalformedField { .. })
        ));
        assert!(matches!(
            "year".parse::<CommitmentDuration>(),
            Err(CommitmentDurationError::MalformedField { .. })
        ));
    }

    #[test]
    fn serializes_as_string() {
        let d: CommitmentDuration = "3 years".parse().unwrap();
        assert_eq!(serde_json::to_string(&d).unwrap(), r#""3 years""#);
    }
}
