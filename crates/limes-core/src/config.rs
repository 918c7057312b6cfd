//! Cluster configuration document.
//!
//! The configuration is a YAML file listing the configured services with the
//! resources and rates their backends declare, plus operator-defined
//! behaviors (overcommit, commitments, renames, quota distribution,
//! low-privilege raise limits, bursting). Parsing is done here; semantic
//! validation happens when the document is compiled into a
//! [`crate::cluster::Cluster`], which reports all problems at once.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::commitment::CommitmentDuration;
use crate::error::ConfigError;
use crate::names::{DbServiceType, LiquidRateName, LiquidResourceName, QuotaDistributionModel, Topology};
use crate::unit::Unit;
use crate::window::Window;

/// Top-level cluster configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default, rename = "resource_behavior")]
    pub resource_behaviors: Vec<ResourceBehaviorConfig>,
    #[serde(default, rename = "rate_behavior")]
    pub rate_behaviors: Vec<RateBehaviorConfig>,
    #[serde(default)]
    pub quota_distribution_configs: Vec<QuotaDistributionConfig>,
    #[serde(default)]
    pub lowpriv_raise: LowPrivilegeRaiseConfig,
    #[serde(default)]
    pub bursting: BurstingConfig,
}

/// One configured service and what its backend declares.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub service_type: DbServiceType,
    #[serde(default)]
    pub area: String,
    #[serde(default)]
    pub resources: BTreeMap<LiquidResourceName, ResourceInfo>,
    #[serde(default)]
    pub rates: BTreeMap<LiquidRateName, RateInfo>,
    #[serde(default)]
    pub rate_limits: ServiceRateLimits,
}

/// Backend-declared metadata for a resource.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceInfo {
    #[serde(default)]
    pub unit: Unit,
    #[serde(default)]
    pub topology: Topology,
    #[serde(default)]
    pub has_capacity: bool,
    #[serde(default)]
    pub has_quota: bool,
    /// Quota is derived from elsewhere and cannot be set through the API.
    #[serde(default)]
    pub externally_managed: bool,
    /// Opaque attributes, consumed by some translation rules.
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl ResourceInfo {
    /// Whether this resource is usage-only.
    #[must_use]
    pub fn no_quota(&self) -> bool {
        !self.has_quota
    }
}

/// Backend-declared metadata for a rate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateInfo {
    #[serde(default)]
    pub unit: Unit,
    #[serde(default)]
    pub has_usage: bool,
}

/// Rate limits configured for a service.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceRateLimits {
    #[serde(default)]
    pub global: Vec<RateLimitConfig>,
    #[serde(default)]
    pub project_default: Vec<RateLimitConfig>,
}

impl ServiceRateLimits {
    #[must_use]
    pub fn project_default_for(&self, name: &LiquidRateName) -> Option<&RateLimitConfig> {
        self.project_default.iter().find(|cfg| &cfg.name == name)
    }
}

/// A single configured rate limit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    pub name: LiquidRateName,
    #[serde(default)]
    pub unit: Unit,
    pub limit: u64,
    pub window: Window,
}

/// Operator-defined behavior for all resources matching a pattern.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceBehaviorConfig {
    /// Regex matched against `service_type/resource_name`.
    pub resource: String,
    /// Regex matched against the scope name (`domain` or `domain/project`).
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub overcommit_factor: Option<f64>,
    #[serde(default)]
    pub max_burst_multiplier: Option<f64>,
    #[serde(default)]
    pub commitment_durations: Vec<CommitmentDuration>,
    #[serde(default)]
    pub commitment_min_confirm_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub min_nonzero_project_quota: u64,
    /// `service_type/resource_name` under which the resource is shown in
    /// the API.
    #[serde(default)]
    pub identity_in_v1_api: Option<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub translation_rule: String,
}

/// Operator-defined behavior for all rates matching a pattern.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateBehaviorConfig {
    /// Regex matched against `service_type/rate_name`.
    pub rate: String,
    #[serde(default)]
    pub identity_in_v1_api: Option<String>,
}

/// Quota distribution model for resources matching a pattern.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaDistributionConfig {
    pub resource: String,
    #[serde(default)]
    pub model: QuotaDistributionModel,
    #[serde(default)]
    pub default_project_quota: u64,
    #[serde(default)]
    pub strict_domain_quota_limit: bool,
    /// How far back historical usage reaches, shown in per-AZ reports.
    #[serde(default)]
    pub usage_data_retention_period: Option<CommitmentDuration>,
}

/// Low-privilege raise limits, as written in the configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LowPrivilegeRaiseConfig {
    #[serde(default)]
    pub limits: LowPrivilegeRaiseLimitsConfig,
    #[serde(default)]
    pub except_projects_in_domains: Option<String>,
    #[serde(default)]
    pub only_projects_in_domains: Option<String>,
}

/// Raw limit strings per service type and resource name.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LowPrivilegeRaiseLimitsConfig {
    #[serde(default)]
    pub domains: BTreeMap<DbServiceType, BTreeMap<LiquidResourceName, String>>,
    #[serde(default)]
    pub projects: BTreeMap<DbServiceType, BTreeMap<LiquidResourceName, String>>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BurstingConfig {
    /// Zero disables bursting.
    #[serde(default)]
    pub max_multiplier: f64,
}

impl ClusterConfig {
    /// Parses a configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the YAML is malformed or does not
    /// match the expected shape.
    pub fn from_yaml(source_name: &str, yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
            path: source_name.to_owned(),
            reason: e.to_string(),
        })
    }

    /// Reads and parses a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let yaml = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Self::from_yaml(&path.display().to_string(), &yaml)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
cluster_id: west
services:
  - service_type: shared
    area: testing
    resources:
      capacity:
        unit: B
        topology: az-aware
        has_capacity: true
        has_quota: true
      things:
        has_quota: true
    rates:
      service/shared/objects:create:
        has_usage: true
    rate_limits:
      global:
        - name: service/shared/objects:create
          limit: 5000
          window: 1s
      project_default:
        - name: service/shared/objects:create
          limit: 5
          window: 1m
resource_behavior:
  - resource: shared/capacity
    overcommit_factor: 1.5
    commitment_durations: ["1 hour", "2 hours"]
quota_distribution_configs:
  - resource: shared/things
    model: centralized
    default_project_quota: 10
lowpriv_raise:
  limits:
    projects:
      shared:
        things: "20"
bursting:
  max_multiplier: 0.2
"#;

    #[test]
    fn parse_example_document() {
        let cfg = ClusterConfig::from_yaml("example", EXAMPLE).unwrap();
        assert_eq!(cfg.cluster_id, "west");
        let svc = &cfg.services[0];
        let capacity = &svc.resources[&LiquidResourceName::new("capacity")];
        assert_eq!(capacity.unit, Unit::Bytes);
        assert_eq!(capacity.topology, Topology::AzAware);
        assert!(!svc.resources[&LiquidResourceName::new("things")].no_quota());
        assert_eq!(svc.rate_limits.project_default[0].window.to_string(), "1m");
        assert_eq!(cfg.resource_behaviors[0].commitment_durations.len(), 2);
        assert_eq!(
            cfg.quota_distribution_configs[0].model,
            QuotaDistributionModel::Centralized
        );
        assert!((cfg.bursting.max_multiplier - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = ClusterConfig::from_yaml("bad", "cluster_id: x\nfoo: bar\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
