//! The cluster registry: the compiled form of [`ClusterConfig`], built once
//! at startup and shared by reference with everything that needs to know
//! which services, resources and rates exist and how they behave.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use regex::Regex;

use crate::behavior::{split_identity, BurstingMultiplier, OvercommitFactor, RateBehavior, ResourceBehavior};
use crate::config::{
    ClusterConfig, QuotaDistributionConfig, RateInfo, RateLimitConfig, ResourceInfo, ServiceConfig,
};
use crate::error::ConfigError;
use crate::lowpriv_raise::LowPrivilegeRaise;
use crate::names::{
    DbServiceType, LiquidRateName, LiquidResourceName, QuotaDistributionModel, RateName, ResourceName,
    ServiceType,
};
use crate::translation::TranslationRule;

#[derive(Debug, Clone)]
struct CompiledResourceBehavior {
    resource_rx: Regex,
    scope_rx: Option<Regex>,
    overcommit_factor: Option<f64>,
    max_burst_multiplier: Option<f64>,
    commitment_durations: Vec<crate::commitment::CommitmentDuration>,
    commitment_min_confirm_date: Option<chrono::DateTime<chrono::Utc>>,
    min_nonzero_project_quota: u64,
    identity_in_v1_api: Option<(ServiceType, ResourceName)>,
    category: String,
    translation_rule: TranslationRule,
}

#[derive(Debug, Clone)]
struct CompiledRateBehavior {
    rate_rx: Regex,
    identity_in_v1_api: Option<(ServiceType, RateName)>,
}

#[derive(Debug, Clone)]
struct CompiledQuotaDistribution {
    resource_rx: Regex,
    config: QuotaDistributionConfig,
}

/// Compiled cluster configuration.
#[derive(Debug, Clone)]
pub struct Cluster {
    id: String,
    services: BTreeMap<DbServiceType, ServiceConfig>,
    resource_behaviors: Vec<CompiledResourceBehavior>,
    rate_behaviors: Vec<CompiledRateBehavior>,
    quota_distributions: Vec<CompiledQuotaDistribution>,
    lowpriv_raise: LowPrivilegeRaise,
    bursting: BurstingMultiplier,
}

/// Regexes in behavior entries must match the whole name.
fn compile_bounded(field: &str, pattern: &str, errors: &mut Vec<String>) -> Option<Regex> {
    match Regex::new(&format!("^(?:{pattern})$")) {
        Ok(rx) => Some(rx),
        Err(e) => {
            errors.push(format!("{field}: {e}"));
            None
        }
    }
}

impl Cluster {
    /// Validates and compiles a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] listing every problem found.
    pub fn new(config: ClusterConfig) -> Result<Self, ConfigError> {
        let mut errors = Vec::new();

        if config.cluster_id.is_empty() {
            errors.push("missing cluster_id configuration value".to_owned());
        }
        if config.services.is_empty() {
            errors.push("missing services[] configuration value".to_owned());
        }

        let mut services = BTreeMap::new();
        for (idx, svc) in config.services.iter().enumerate() {
            if svc.service_type.as_str().is_empty() {
                errors.push(format!("missing services[{idx}].service_type configuration value"));
                continue;
            }
            check_rate_limits(idx, "global", &svc.rate_limits.global, &mut errors);
            check_rate_limits(idx, "project_default", &svc.rate_limits.project_default, &mut errors);
            if services.insert(svc.service_type.clone(), svc.clone()).is_some() {
                errors.push(format!("duplicate service type: {}", svc.service_type));
            }
        }

        let resource_behaviors = config
            .resource_behaviors
            .iter()
            .enumerate()
            .filter_map(|(idx, cfg)| compile_resource_behavior(idx, cfg, &mut errors))
            .collect();

        let mut rate_behaviors = Vec::new();
        for (idx, cfg) in config.rate_behaviors.iter().enumerate() {
            let field = format!("rate_behavior[{idx}]");
            let Some(rate_rx) = compile_bounded(&format!("{field}.rate"), &cfg.rate, &mut errors) else {
                continue;
            };
            let identity_in_v1_api = match cfg.identity_in_v1_api.as_deref().map(split_identity) {
                None => None,
                Some(Some((svc, rate))) => Some((ServiceType::new(svc), RateName::new(rate))),
                Some(None) => {
                    errors.push(format!(
                        "{field}.identity_in_v1_api must have the format \"service_type/rate_name\""
                    ));
                    None
                }
            };
            rate_behaviors.push(CompiledRateBehavior {
                rate_rx,
                identity_in_v1_api,
            });
        }

        let mut quota_distributions = Vec::new();
        for (idx, cfg) in config.quota_distribution_configs.iter().enumerate() {
            let field = format!("quota_distribution_configs[{idx}]");
            match cfg.model {
                QuotaDistributionModel::Hierarchical if cfg.default_project_quota != 0 => {
                    errors.push(format!(
                        "{field}.default_project_quota is invalid: not allowed for hierarchical distribution"
                    ));
                }
                QuotaDistributionModel::Centralized if cfg.default_project_quota == 0 => {
                    errors.push(format!("missing {field}.default_project_quota configuration value"));
                }
                QuotaDistributionModel::Centralized if cfg.strict_domain_quota_limit => {
                    errors.push(format!(
                        "{field}.strict_domain_quota_limit is invalid: not allowed for centralized distribution"
                    ));
                }
                _ => {}
            }
            if let Some(resource_rx) = compile_bounded(&format!("{field}.resource"), &cfg.resource, &mut errors) {
                quota_distributions.push(CompiledQuotaDistribution {
                    resource_rx,
                    config: cfg.clone(),
                });
            }
        }

        if config.bursting.max_multiplier < 0.0 {
            errors.push("bursting.max_multiplier may not be negative".to_owned());
        }

        let lowpriv_raise = LowPrivilegeRaise::compile(
            &config.lowpriv_raise,
            |svc, res| services.get(svc)?.resources.get(res).map(|info| info.unit),
            &mut errors,
        );

        if !errors.is_empty() {
            return Err(ConfigError::Invalid { errors });
        }

        let cluster = Self {
            id: config.cluster_id,
            services,
            resource_behaviors,
            rate_behaviors,
            quota_distributions,
            lowpriv_raise,
            bursting: BurstingMultiplier(config.bursting.max_multiplier),
        };
        cluster.check_api_identities()?;
        Ok(cluster)
    }

    /// Two backend resources must never end up under the same API identity.
    fn check_api_identities(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let mut seen = BTreeSet::new();
        for (service_type, svc) in &self.services {
            for resource_name in svc.resources.keys() {
                let behavior = self.behavior_for_resource(service_type, resource_name, "");
                let identity = behavior.identity_in_v1_api.unwrap_or_else(|| {
                    (
                        ServiceType::new(service_type.as_str()),
                        ResourceName::new(resource_name.as_str()),
                    )
                });
                if !seen.insert(identity.clone()) {
                    errors.push(format!(
                        "multiple resources map to {}/{} in the API",
                        identity.0, identity.1
                    ));
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { errors })
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn has_service(&self, service_type: &DbServiceType) -> bool {
        self.services.contains_key(service_type)
    }

    #[must_use]
    pub fn has_resource(&self, service_type: &DbServiceType, resource_name: &LiquidResourceName) -> bool {
        self.info_for_resource(service_type, resource_name).is_some()
    }

    #[must_use]
    pub fn service(&self, service_type: &DbServiceType) -> Option<&ServiceConfig> {
        self.services.get(service_type)
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceConfig> {
        self.services.values()
    }

    #[must_use]
    pub fn info_for_resource(
        &self,
        service_type: &DbServiceType,
        resource_name: &LiquidResourceName,
    ) -> Option<&ResourceInfo> {
        self.services.get(service_type)?.resources.get(resource_name)
    }

    #[must_use]
    pub fn info_for_rate(&self, service_type: &DbServiceType, rate_name: &LiquidRateName) -> Option<&RateInfo> {
        self.services.get(service_type)?.rates.get(rate_name)
    }

    /// Whether the backend reports usage for this rate.
    #[must_use]
    pub fn has_usage_for_rate(&self, service_type: &DbServiceType, rate_name: &LiquidRateName) -> bool {
        self.info_for_rate(service_type, rate_name)
            .is_some_and(|info| info.has_usage)
    }

    #[must_use]
    pub fn global_rate_limits(&self, service_type: &DbServiceType) -> &[RateLimitConfig] {
        self.services
            .get(service_type)
            .map_or(&[], |svc| svc.rate_limits.global.as_slice())
    }

    #[must_use]
    pub fn project_default_rate_limits(&self, service_type: &DbServiceType) -> &[RateLimitConfig] {
        self.services
            .get(service_type)
            .map_or(&[], |svc| svc.rate_limits.project_default.as_slice())
    }

    /// Merges all behavior entries matching the resource. `scope_name` is
    /// empty at cluster level, the domain name at domain level, and
    /// `domain/project` at project level; scoped entries only apply when the
    /// scope name matches.
    #[must_use]
    pub fn behavior_for_resource(
        &self,
        service_type: &DbServiceType,
        resource_name: &LiquidResourceName,
        scope_name: &str,
    ) -> ResourceBehavior {
        let mut result = ResourceBehavior {
            max_burst_multiplier: self.bursting,
            ..ResourceBehavior::default()
        };
        let full_name = format!("{service_type}/{resource_name}");
        for behavior in &self.resource_behaviors {
            if !behavior.resource_rx.is_match(&full_name) {
                continue;
            }
            if let Some(scope_rx) = &behavior.scope_rx {
                if scope_name.is_empty() || !scope_rx.is_match(scope_name) {
                    continue;
                }
            }
            if let Some(factor) = behavior.overcommit_factor {
                result.overcommit_factor = OvercommitFactor(factor);
            }
            if let Some(multiplier) = behavior.max_burst_multiplier {
                if multiplier < result.max_burst_multiplier.0 {
                    result.max_burst_multiplier = BurstingMultiplier(multiplier);
                }
            }
            result
                .commitment_durations
                .extend(behavior.commitment_durations.iter().copied());
            if let Some(date) = behavior.commitment_min_confirm_date {
                if result.commitment_min_confirm_date.is_none_or(|current| current < date) {
                    result.commitment_min_confirm_date = Some(date);
                }
            }
            result.min_nonzero_project_quota = result
                .min_nonzero_project_quota
                .max(behavior.min_nonzero_project_quota);
            if behavior.identity_in_v1_api.is_some() {
                result.identity_in_v1_api.clone_from(&behavior.identity_in_v1_api);
            }
            if !behavior.category.is_empty() {
                result.category.clone_from(&behavior.category);
            }
            if !behavior.translation_rule.is_empty() {
                result.translation_rule = behavior.translation_rule;
            }
        }
        result
    }

    #[must_use]
    pub fn behavior_for_rate(&self, service_type: &DbServiceType, rate_name: &LiquidRateName) -> RateBehavior {
        let full_name = format!("{service_type}/{rate_name}");
        let mut result = RateBehavior::default();
        for behavior in &self.rate_behaviors {
            if behavior.rate_rx.is_match(&full_name) && behavior.identity_in_v1_api.is_some() {
                result.identity_in_v1_api.clone_from(&behavior.identity_in_v1_api);
            }
        }
        result
    }

    /// The first matching distribution config, or hierarchical distribution
    /// if none matches.
    #[must_use]
    pub fn quota_distribution_for_resource(
        &self,
        service_type: &DbServiceType,
        resource_name: &LiquidResourceName,
    ) -> QuotaDistributionConfig {
        let full_name = format!("{service_type}/{resource_name}");
        self.quota_distributions
            .iter()
            .find(|qd| qd.resource_rx.is_match(&full_name))
            .map_or_else(
                || QuotaDistributionConfig {
                    model: QuotaDistributionModel::Hierarchical,
                    ..QuotaDistributionConfig::default()
                },
                |qd| qd.config.clone(),
            )
    }

    #[must_use]
    pub fn lowpriv_raise(&self) -> &LowPrivilegeRaise {
        &self.lowpriv_raise
    }

    /// The cluster-wide bursting multiplier; zero if bursting is disabled.
    #[must_use]
    pub fn bursting_multiplier(&self) -> BurstingMultiplier {
        self.bursting
    }
}

fn check_rate_limits(idx: usize, kind: &str, limits: &[RateLimitConfig], errors: &mut Vec<String>) {
    let mut seen = BTreeSet::new();
    for (ldx, limit) in limits.iter().enumerate() {
        let field = format!("services[{idx}].rate_limits.{kind}[{ldx}]");
        if limit.name.as_str().is_empty() {
            errors.push(format!("missing {field}.name configuration value"));
        }
        if limit.window.is_zero() {
            errors.push(format!("missing {field}.window configuration value"));
        }
        if !seen.insert(limit.name.clone()) {
            errors.push(format!("{field}: duplicate rate limit for {}", limit.name));
        }
    }
}

fn compile_resource_behavior(
    idx: usize,
    cfg: &crate::config::ResourceBehaviorConfig,
    errors: &mut Vec<String>,
) -> Option<CompiledResourceBehavior> {
    let field = format!("resource_behavior[{idx}]");
    if cfg.resource.is_empty() {
        errors.push(format!("missing {field}.resource configuration value"));
        return None;
    }
    let resource_rx = compile_bounded(&format!("{field}.resource"), &cfg.resource, errors);
    let scope_rx = cfg
        .scope
        .as_deref()
        .and_then(|scope| compile_bounded(&format!("{field}.scope"), scope, errors));

    if cfg.overcommit_factor.is_some_and(|f| f < 0.0) {
        errors.push(format!("{field}.overcommit_factor may not be negative"));
    }
    if cfg.max_burst_multiplier.is_some_and(|m| m < 0.0) {
        errors.push(format!("{field}.max_burst_multiplier may not be negative"));
    }
    let identity_in_v1_api = match cfg.identity_in_v1_api.as_deref().map(split_identity) {
        None => None,
        Some(Some((svc, res))) => Some((ServiceType::new(svc), ResourceName::new(res))),
        Some(None) => {
            errors.push(format!(
                "{field}.identity_in_v1_api must have the format \"service_type/resource_name\""
            ));
            None
        }
    };
    let translation_rule = TranslationRule::from_name(&cfg.translation_rule).unwrap_or_else(|| {
        errors.push(format!(
            "{field}.translation_rule: no such translation rule: {:?}",
            cfg.translation_rule
        ));
        TranslationRule::None
    });

    Some(CompiledResourceBehavior {
        resource_rx: resource_rx?,
        scope_rx,
        overcommit_factor: cfg.overcommit_factor,
        max_burst_multiplier: cfg.max_burst_multiplier,
        commitment_durations: cfg.commitment_durations.clone(),
        commitment_min_confirm_date: cfg.commitment_min_confirm_date,
        min_nonzero_project_quota: cfg.min_nonzero_project_quota,
        identity_in_v1_api,
        category: cfg.category.clone(),
        translation_rule,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixture for tests across the crate.

    use super::*;

    pub const TEST_CONFIG: &str = r#"
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
        has_capacity: true
        has_quota: true
      external_things:
        has_quota: true
        externally_managed: true
      usage_only:
        has_quota: false
    rates:
      objects:create:
        has_usage: true
      objects:delete:
        has_usage: true
    rate_limits:
      global:
        - name: objects:create
          limit: 5000
          window: 1s
      project_default:
        - name: objects:create
          limit: 5
          window: 1m
        - name: objects:update
          limit: 10
          window: 1h
  - service_type: unshared
    area: testing
    resources:
      capacity:
        unit: B
        has_capacity: true
        has_quota: true
      things:
        has_quota: true
resource_behavior:
  - resource: shared/capacity
    overcommit_factor: 2.5
    commitment_durations: ["1 hour", "2 hours"]
  - resource: unshared/things
    identity_in_v1_api: unshared/renamed_things
    min_nonzero_project_quota: 10
  - resource: shared/things
    scope: germany/.*
    max_burst_multiplier: 0.1
quota_distribution_configs:
  - resource: shared/.*
    model: hierarchical
    strict_domain_quota_limit: true
lowpriv_raise:
  limits:
    domains:
      shared:
        things: "until 80% of cluster capacity is assigned"
    projects:
      shared:
        things: "10"
        capacity: "20% of cluster capacity"
  except_projects_in_domains: "^france$"
bursting:
  max_multiplier: 0.2
"#;

    #[allow(clippy::unwrap_used)]
    pub fn test_cluster() -> Cluster {
        Cluster::new(ClusterConfig::from_yaml("test", TEST_CONFIG).unwrap()).unwrap()
    }
}
