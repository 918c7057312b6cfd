//! Units of measurement for resource quantities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::UnitError;

/// Unit of a resource quantity. Resources measured in plain counts use
/// [`Unit::None`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Unit {
    #[default]
    None,
    Bytes,
    Kibibytes,
    Mebibytes,
    Gibibytes,
    Tebibytes,
    Pebibytes,
    Exbibytes,
}

const BYTE_UNITS: [Unit; 7] = [
    Unit::Bytes,
    Unit::Kibibytes,
    Unit::Mebibytes,
    Unit::Gibibytes,
    Unit::Tebibytes,
    Unit::Pebibytes,
    Unit::Exbibytes,
];

impl Unit {
    /// Marker used in requests for "the resource's own unit".
    pub const UNSPECIFIED: &'static str = "UNSPECIFIED";

    /// Whether this is the unit of plain counts.
    #[must_use]
    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn is_none(&self) -> bool {
        *self == Self::None
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Bytes => "B",
            Self::Kibibytes => "KiB",
            Self::Mebibytes => "MiB",
            Self::Gibibytes => "GiB",
            Self::Tebibytes => "TiB",
            Self::Pebibytes => "PiB",
            Self::Exbibytes => "EiB",
        }
    }

    /// The base unit and the multiple of it that this unit represents.
    #[must_use]
    pub fn base(self) -> (Self, u64) {
        match self {
            Self::None => (Self::None, 1),
            Self::Bytes => (Self::Bytes, 1),
            Self::Kibibytes => (Self::Bytes, 1 << 10),
            Self::Mebibytes => (Self::Bytes, 1 << 20),
            Self::Gibibytes => (Self::Bytes, 1 << 30),
            Self::Tebibytes => (Self::Bytes, 1 << 40),
            Self::Pebibytes => (Self::Bytes, 1 << 50),
            Self::Exbibytes => (Self::Bytes, 1 << 60),
        }
    }

    /// Name used in error messages; plain counts have no visible unit.
    fn display_name(self) -> &'static str {
        match self {
            Self::None => "<count>",
            other => other.as_str(),
        }
    }

    /// Parses a human-readable value like `"10 GiB"` into a number of this
    /// unit. Plain counts are written without unit.
    ///
    /// # Errors
    ///
    /// Returns [`UnitError`] if the input is malformed, uses an unknown or
    /// incompatible unit, or does not convert to a whole number.
    pub fn parse(self, input: &str) -> Result<u64, UnitError> {
        let input = input.trim();
        if self == Self::None {
            return parse_number(input);
        }
        let fields: Vec<&str> = input.split_whitespace().collect();
        let [number, unit] = fields.as_slice() else {
            return Err(UnitError::Malformed {
                input: input.to_owned(),
            });
        };
        let value = ValueWithUnit {
            value: parse_number(number)?,
            unit: unit.parse()?,
        };
        value.convert_to(self)
    }

    /// Renders `value` in this unit, e.g. `"10 GiB"` or `"42"`.
    #[must_use]
    pub fn format(self, value: u64) -> String {
        ValueWithUnit { value, unit: self }.to_string()
    }
}

fn parse_number(input: &str) -> Result<u64, UnitError> {
    input.parse().map_err(|e: std::num::ParseIntError| UnitError::InvalidNumber {
        input: input.to_owned(),
        reason: e.to_string(),
    })
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Unit {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::None);
        }
        BYTE_UNITS
            .into_iter()
            .find(|u| u.as_str() == s)
            .ok_or_else(|| UnitError::UnknownUnit(s.to_owned()))
    }
}

impl Serialize for Unit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Unit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A number together with its unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueWithUnit {
    pub value: u64,
    pub unit: Unit,
}

impl ValueWithUnit {
    /// Converts into `target`, which must share the same base unit.
    ///
    /// # Errors
    ///
    /// Returns [`UnitError::Incompatible`] for mismatched base units and
    /// [`UnitError::Fractional`] if the result is not a whole number.
    pub fn convert_to(self, target: Unit) -> Result<u64, UnitError> {
        if self.unit == target {
            return Ok(self.value);
        }
        let (own_base, own_multiple) = self.unit.base();
        let (target_base, target_multiple) = target.base();
        if own_base != target_base {
            return Err(UnitError::Incompatible {
                from_unit: self.unit.display_name().to_owned(),
                to_unit: target.display_name().to_owned(),
            });
        }
        let base_value = self
            .value
            .checked_mul(own_multiple)
            .ok_or_else(|| UnitError::Overflow {
                value: self.to_string(),
                to_unit: target.display_name().to_owned(),
            })?;
        if base_value % target_multiple != 0 {
            return Err(UnitError::Fractional {
                value: self.to_string(),
                to_unit: target.display_name().to_owned(),
            });
        }
        Ok(base_value / target_multiple)
    }
}

impl fmt::Display for ValueWithUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            Unit::None => write!(f, "{}", self.value),
            unit => write!(f, "{} {}", self.value, unit),
        }
    }
}
