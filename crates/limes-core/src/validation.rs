//! Per-resource validation outcomes.
//!
//! These are not errors in the `std::error::Error` sense: they are collected
//! for every requested change and shown to the user together.

use serde::{Serialize, Serializer};

use crate::unit::Unit;

/// HTTP-equivalent status of a rejected change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValidationStatus {
    Forbidden,
    Conflict,
    UnprocessableEntity,
    InternalServerError,
}

impl ValidationStatus {
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Forbidden => 403,
            Self::Conflict => 409,
            Self::UnprocessableEntity => 422,
            Self::InternalServerError => 500,
        }
    }
}

impl Serialize for ValidationStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.code())
    }
}

/// Why a requested quota or rate-limit change was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub status: ValidationStatus,
    pub message: String,
    #[serde(rename = "min_acceptable_quota", skip_serializing_if = "Option::is_none")]
    pub min_acceptable: Option<u64>,
    #[serde(rename = "max_acceptable_quota", skip_serializing_if = "Option::is_none")]
    pub max_acceptable: Option<u64>,
    #[serde(skip_serializing_if = "Unit::is_none")]
    pub unit: Unit,
}

impl ValidationError {
    #[must_use]
    pub fn new(status: ValidationStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            min_acceptable: None,
            max_acceptable: None,
            unit: Unit::None,
        }
    }

    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ValidationStatus::Forbidden, message)
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ValidationStatus::Conflict, message)
    }

    #[must_use]
    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(ValidationStatus::UnprocessableEntity, message)
    }

    #[must_use]
    pub fn with_min(mut self, min: u64, unit: Unit) -> Self {
        self.min_acceptable = Some(min);
        self.unit = unit;
        self
    }

    #[must_use]
    pub fn with_max(mut self, max: u64, unit: Unit) -> Self {
        self.max_acceptable = Some(max);
        self.unit = unit;
        self
    }

    /// Appends text to the message.
    #[must_use]
    pub fn with_suffix(mut self, suffix: &str) -> Self {
        self.message.push_str(suffix);
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_numeric_status_and_optional_bounds() {
        let err = ValidationError::conflict("domain quota exceeded").with_max(10, Unit::Mebibytes);
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"status":409,"message":"domain quota exceeded","max_acceptable_quota":10,"unit":"MiB"}"#
        );

        let err = ValidationError::forbidden("no");
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"status":403,"message":"no"}"#
        );
    }
}
