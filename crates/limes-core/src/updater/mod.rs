//! Validation and audit of quota and rate-limit change requests.
//!
//! Both updaters collect one outcome per requested resource or rate instead
//! of stopping at the first problem, so that a single response can explain
//! everything that is wrong with a request. A request is committed only if
//! every outcome is acceptable.

pub mod quota;
pub mod rates;

use std::collections::BTreeSet;

use serde::Serialize;

use crate::validation::{ValidationError, ValidationStatus};

/// Reject reason recorded for acceptable values in a rejected batch.
pub const BATCH_REJECTED_REASON: &str =
    "cannot commit this because other values in this request are unacceptable";

/// Response to a rejected PUT request: a plain-text body with one line per
/// problem, and the status all problems agree on (or 422 if they disagree).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutErrorResponse {
    pub status: u16,
    pub body: String,
}

impl PutErrorResponse {
    fn from_lines(mut lines: Vec<String>, statuses: &BTreeSet<ValidationStatus>) -> Self {
        lines.sort();
        let status = match statuses.iter().collect::<Vec<_>>().as_slice() {
            [single] => single.code(),
            _ => ValidationStatus::UnprocessableEntity.code(),
        };
        Self {
            status,
            body: lines.join("\n"),
        }
    }
}

/// Status for the audit trail of a request.
#[must_use]
pub fn audit_status(is_valid: bool) -> u16 {
    if is_valid { 200 } else { 422 }
}

/// Reject reason for the audit trail of one value.
#[must_use]
pub fn reject_reason(is_valid: bool, error: Option<&ValidationError>) -> String {
    match error {
        Some(err) => err.message.clone(),
        None if !is_valid => BATCH_REJECTED_REASON.to_owned(),
        None => String::new(),
    }
}

/// Body of a simulate-put response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulationReport<T> {
    pub success: bool,
    #[serde(flatten)]
    pub unacceptable: T,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn shared_status_is_kept_and_mixed_statuses_become_422() {
        let one = BTreeSet::from([ValidationStatus::Forbidden]);
        let response = PutErrorResponse::from_lines(vec!["b".to_owned(), "a".to_owned()], &one);
        assert_eq!(response.status, 403);
        assert_eq!(response.body, "a\nb");

        let mixed = BTreeSet::from([ValidationStatus::Forbidden, ValidationStatus::Conflict]);
        let response = PutErrorResponse::from_lines(vec!["x".to_owned()], &mixed);
        assert_eq!(response.status, 422);
    }

    #[test]
    fn reject_reasons() {
        let err = ValidationError::conflict("domain quota exceeded");
        assert_eq!(reject_reason(false, Some(&err)), "domain quota exceeded");
        assert_eq!(reject_reason(false, None), BATCH_REJECTED_REASON);
        assert_eq!(reject_reason(true, None), "");
        assert_eq!(audit_status(false), 422);
    }
}
