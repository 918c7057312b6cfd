//! Effective per-resource and per-rate behavior, merged from all matching
//! behavior entries of the cluster configuration.

use chrono::{DateTime, Utc};

use crate::commitment::{CommitmentConfiguration, CommitmentDuration};
use crate::names::{QuotaDistributionModel, RateName, ResourceName, ServiceType};
use crate::translation::TranslationRule;

/// Factor by which raw capacity is multiplied before being reported.
/// A factor of zero means "not configured" and leaves capacity unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OvercommitFactor(pub f64);

impl OvercommitFactor {
    #[must_use]
    pub fn is_unset(self) -> bool {
        self.0 <= 0.0
    }

    /// Effective capacity for `raw_capacity`, rounded to the nearest integer.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn apply_to(self, raw_capacity: u64) -> u64 {
        if self.is_unset() {
            return raw_capacity;
        }
        (raw_capacity as f64 * self.0).round() as u64
    }
}

/// Multiplier for the part of quota a project may use on top of its quota.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
#[serde(transparent)]
pub struct BurstingMultiplier(pub f64);

impl BurstingMultiplier {
    /// Usable quota under this multiplier, rounded down. Centralized
    /// resources never burst.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn apply_to(self, quota: u64, model: QuotaDistributionModel) -> u64 {
        match model {
            QuotaDistributionModel::Centralized => quota,
            QuotaDistributionModel::Hierarchical => ((1.0 + self.0) * quota as f64).floor() as u64,
        }
    }
}

/// Effective behavior of a single resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceBehavior {
    pub overcommit_factor: OvercommitFactor,
    pub max_burst_multiplier: BurstingMultiplier,
    pub commitment_durations: Vec<CommitmentDuration>,
    pub commitment_min_confirm_date: Option<DateTime<Utc>>,
    pub min_nonzero_project_quota: u64,
    pub identity_in_v1_api: Option<(ServiceType, ResourceName)>,
    pub category: String,
    pub translation_rule: TranslationRule,
}

impl ResourceBehavior {
    /// Commitment policy for reports, or `None` if the resource does not
    /// accept commitments. The minimum confirmation date is only shown while
    /// it lies in the future.
    #[must_use]
    pub fn commitment_config(&self, now: DateTime<Utc>) -> Option<CommitmentConfiguration> {
        if self.commitment_durations.is_empty() {
            return None;
        }
        Some(CommitmentConfiguration {
            durations: self.commitment_durations.clone(),
            min_confirm_by: self
                .commitment_min_confirm_date
                .filter(|date| *date > now)
                .map(|date| date.timestamp()),
        })
    }
}

/// Effective behavior of a single rate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateBehavior {
    pub identity_in_v1_api: Option<(ServiceType, RateName)>,
}

/// Splits an identity of the form `service_type/name`.
#[must_use]
pub fn split_identity(input: &str) -> Option<(&str, &str)> {
    let (service_type, name) = input.split_once('/')?;
    if service_type.is_empty() || name.is_empty() {
        return None;
    }
    Some((service_type, name))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn overcommit_rounds_to_nearest() {
        assert_eq!(OvercommitFactor(0.0).apply_to(42), 42);
        assert_eq!(OvercommitFactor(1.5).apply_to(3), 5);
        assert_eq!(OvercommitFactor(1.2).apply_to(10), 12);
        assert_eq!(OvercommitFactor(1.1).apply_to(4), 4);
    }

    #[test]
    fn bursting_rounds_down_and_ignores_centralized() {
        let m = BurstingMultiplier(0.2);
        assert_eq!(m.apply_to(11, QuotaDistributionModel::Hierarchical), 13);
        assert_eq!(m.apply_to(11, QuotaDistributionModel::Centralized), 11);
    }

    #[test]
    fn commitment_config_hides_past_confirm_date() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let mut behavior = ResourceBehavior {
            commitment_durations: vec!["1 year".parse().unwrap()],
            commitment_min_confirm_date: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            ..ResourceBehavior::default()
        };
        assert_eq!(behavior.commitment_config(now).unwrap().min_confirm_by, None);

        let future = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        behavior.commitment_min_confirm_date = Some(future);
        assert_eq!(
            behavior.commitment_config(now).unwrap().min_confirm_by,
            Some(future.timestamp())
        );

        behavior.commitment_durations.clear();
        assert!(behavior.commitment_config(now).is_none());
    }

    #[test]
    fn identities_need_both_parts() {
        assert_eq!(split_identity("compute/cores"), Some(("compute", "cores")));
        assert_eq!(split_identity("compute/"), None);
        assert_eq!(split_identity("compute"), None);
    }
}
