//! Low-privilege quota raises.
//!
//! Users without full raise permission may still be allowed to raise quota
//! up to a configured ceiling. The ceiling is either an absolute value, a
//! percentage of cluster capacity, or (for domains only) "until X% of
//! cluster capacity is assigned".

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::config::LowPrivilegeRaiseConfig;
use crate::names::{DbServiceType, LiquidResourceName};
use crate::unit::Unit;

#[allow(clippy::expect_used)]
static PERCENT_OF_CLUSTER_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9.]+)\s*% of cluster capacity$").expect("valid limit regex"));
#[allow(clippy::expect_used)]
static UNTIL_PERCENT_ASSIGNED_RX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^until ([0-9.]+)\s*% of cluster capacity is assigned$").expect("valid limit regex")
});

/// Which scope a limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    Domain,
    Project,
}

impl LimitScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Project => "project",
        }
    }
}

/// A parsed low-privilege raise limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LowPrivilegeRaiseLimit {
    Absolute(u64),
    PercentOfClusterCapacity(f64),
    UntilPercentOfClusterCapacityAssigned(f64),
}

impl LowPrivilegeRaiseLimit {
    /// Parses a limit string. Values without percentage are read in `unit`.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the input is not a valid
    /// limit for this scope.
    pub fn parse(input: &str, unit: Unit, scope: LimitScope) -> Result<Self, String> {
        if let Some(percent) = capture(&PERCENT_OF_CLUSTER_RX, input) {
            return parse_percentage(percent).map(Self::PercentOfClusterCapacity);
        }
        if scope == LimitScope::Domain {
            if let Some(percent) = capture(&UNTIL_PERCENT_ASSIGNED_RX, input) {
                return parse_percentage(percent).map(Self::UntilPercentOfClusterCapacityAssigned);
            }
        }
        unit.parse(input).map(Self::Absolute).map_err(|e| e.to_string())
    }

    /// The ceiling for a raise given the cluster-level capacity and domain
    /// quota sum of the resource, and the scope's current quota.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn evaluate(self, capacity: Option<u64>, domains_quota: Option<u64>, old_quota: u64) -> u64 {
        let Some(domains_quota) = domains_quota else {
            return 0;
        };
        match self {
            Self::Absolute(value) => value,
            Self::PercentOfClusterCapacity(percent) => capacity
                .map_or(0, |cap| (percent / 100.0 * cap as f64).floor() as u64),
            Self::UntilPercentOfClusterCapacityAssigned(percent) => {
                let Some(cap) = capacity else {
                    return 0;
                };
                let other_quota = domains_quota.saturating_sub(old_quota) as f64;
                let max_quota = percent / 100.0 * cap as f64 - other_quota;
                if max_quota < 0.0 {
                    0
                } else {
                    max_quota.floor() as u64
                }
            }
        }
    }

    /// Whether a user who raised quota up to this limit may also lower it
    /// again. "Until X% is assigned" limits depend on other domains, so a
    /// lowering could not be undone.
    #[must_use]
    pub fn is_reversible(self) -> bool {
        !matches!(self, Self::UntilPercentOfClusterCapacityAssigned(_))
    }
}

fn capture<'a>(rx: &Regex, input: &'a str) -> Option<&'a str> {
    rx.captures(input)?.get(1).map(|m| m.as_str())
}

fn parse_percentage(input: &str) -> Result<f64, String> {
    let percent: f64 = input.parse().map_err(|e| format!("invalid percentage {input:?}: {e}"))?;
    if !(0.0..=100.0).contains(&percent) {
        return Err(format!("value out of range: {input}%"));
    }
    Ok(percent)
}

type LimitTable = BTreeMap<(DbServiceType, LiquidResourceName), LowPrivilegeRaiseLimit>;

/// Compiled low-privilege raise configuration.
#[derive(Debug, Clone, Default)]
pub struct LowPrivilegeRaise {
    for_domains: LimitTable,
    for_projects: LimitTable,
    except_projects_in_domains: Option<Regex>,
    only_projects_in_domains: Option<Regex>,
}

impl LowPrivilegeRaise {
    /// Compiles the configuration. `unit_of` yields the unit of a known
    /// resource and `None` for unknown ones. Problems are appended to
    /// `errors`.
    pub fn compile(
        cfg: &LowPrivilegeRaiseConfig,
        unit_of: impl Fn(&DbServiceType, &LiquidResourceName) -> Option<Unit>,
        errors: &mut Vec<String>,
    ) -> Self {
        let mut compile_table = |input: &BTreeMap<DbServiceType, BTreeMap<LiquidResourceName, String>>, scope: LimitScope| {
            let mut table = LimitTable::new();
            for (service_type, resources) in input {
                for (resource_name, raw) in resources {
                    let Some(unit) = unit_of(service_type, resource_name) else {
                        errors.push(format!(
                            "lowpriv_raise.limits.{}s: no such resource: {service_type}/{resource_name}",
                            scope.as_str()
                        ));
                        continue;
                    };
                    match LowPrivilegeRaiseLimit::parse(raw, unit, scope) {
                        Ok(limit) => {
                            table.insert((service_type.clone(), resource_name.clone()), limit);
                        }
                        Err(reason) => errors.push(format!(
                            "while parsing {} low-privilege raise limit for {service_type}/{resource_name}: {reason}",
                            scope.as_str()
                        )),
                    }
                }
            }
            table
        };
        let for_domains = compile_table(&cfg.limits.domains, LimitScope::Domain);
        let for_projects = compile_table(&cfg.limits.projects, LimitScope::Project);

        let mut compile_rx = |field: &str, pattern: Option<&String>| {
            let pattern = pattern?;
            match Regex::new(pattern) {
                Ok(rx) => Some(rx),
                Err(e) => {
                    errors.push(format!("lowpriv_raise.{field}: {e}"));
                    None
                }
            }
        };
        let except_projects_in_domains = compile_rx(
            "except_projects_in_domains",
            cfg.except_projects_in_domains.as_ref(),
        );
        let only_projects_in_domains =
            compile_rx("only_projects_in_domains", cfg.only_projects_in_domains.as_ref());

        Self {
            for_domains,
            for_projects,
            except_projects_in_domains,
            only_projects_in_domains,
        }
    }

    /// The limit for `scope`, if one is configured.
    #[must_use]
    pub fn limit_for(
        &self,
        scope: LimitScope,
        service_type: &DbServiceType,
        resource_name: &LiquidResourceName,
    ) -> Option<LowPrivilegeRaiseLimit> {
        let table = match scope {
            LimitScope::Domain => &self.for_domains,
            LimitScope::Project => &self.for_projects,
        };
        table
            .get(&(service_type.clone(), resource_name.clone()))
            .copied()
    }

    /// Whether project-level low-privilege raises are allowed for projects
    /// in the named domain.
    #[must_use]
    pub fn is_allowed_for_projects_in(&self, domain_name: &str) -> bool {
        if self
            .except_projects_in_domains
            .as_ref()
            .is_some_and(|rx| rx.is_match(domain_name))
        {
            return false;
        }
        self.only_projects_in_domains
            .as_ref()
            .is_none_or(|rx| rx.is_match(domain_name))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_limit_forms() {
        assert_eq!(
            LowPrivilegeRaiseLimit::parse("20 GiB", Unit::Mebibytes, LimitScope::Project).unwrap(),
            LowPrivilegeRaiseLimit::Absolute(20480)
        );
        assert_eq!(
            LowPrivilegeRaiseLimit::parse("12.5% of cluster capacity", Unit::None, LimitScope::Project)
                .unwrap(),
            LowPrivilegeRaiseLimit::PercentOfClusterCapacity(12.5)
        );
        assert_eq!(
            LowPrivilegeRaiseLimit::parse(
                "until 80% of cluster capacity is assigned",
                Unit::None,
                LimitScope::Domain
            )
            .unwrap(),
            LowPrivilegeRaiseLimit::UntilPercentOfClusterCapacityAssigned(80.0)
        );
    }

    #[test]
    fn until_form_is_domain_only_and_percent_is_bounded() {
        assert!(
            LowPrivilegeRaiseLimit::parse(
                "until 80% of cluster capacity is assigned",
                Unit::None,
                LimitScope::Project
            )
            .is_err()
        );
        assert!(
            LowPrivilegeRaiseLimit::parse("120% of cluster capacity", Unit::None, LimitScope::Domain)
                .is_err()
        );
    }

    #[test]
    fn evaluate_limits() {
        let abs = LowPrivilegeRaiseLimit::Absolute(10);
        assert_eq!(abs.evaluate(Some(100), Some(50), 0), 10);
        assert_eq!(abs.evaluate(Some(100), None, 0), 0);

        let pct = LowPrivilegeRaiseLimit::PercentOfClusterCapacity(25.0);
        assert_eq!(pct.evaluate(Some(1001), Some(0), 0), 250);
        assert_eq!(pct.evaluate(None, Some(0), 0), 0);

        let until = LowPrivilegeRaiseLimit::UntilPercentOfClusterCapacityAssigned(60.0);
        // 60% of 1000 is 600; other domains hold 500 - 100 = 400
        assert_eq!(until.evaluate(Some(1000), Some(500), 100), 200);
        assert_eq!(until.evaluate(Some(1000), Some(900), 100), 0);
        assert!(!until.is_reversible());
        assert!(pct.is_reversible());
    }

    #[test]
    fn domain_patterns_gate_project_raises() {
        let cfg = LowPrivilegeRaiseConfig {
            except_projects_in_domains: Some("^bad".to_owned()),
            only_projects_in_domains: Some("^(good|bad)".to_owned()),
            ..LowPrivilegeRaiseConfig::default()
        };
        let mut errors = Vec::new();
        let lpr = LowPrivilegeRaise::compile(&cfg, |_, _| Some(Unit::None), &mut errors);
        assert!(errors.is_empty());
        assert!(lpr.is_allowed_for_projects_in("good-domain"));
        assert!(!lpr.is_allowed_for_projects_in("bad-domain"));
        assert!(!lpr.is_allowed_for_projects_in("other"));
    }

    #[test]
    fn compile_reports_unknown_resources() {
        let mut cfg = LowPrivilegeRaiseConfig::default();
        cfg.limits.projects.insert(
            DbServiceType::new("shared"),
            BTreeMap::from([(LiquidResourceName::new("nope"), "5".to_owned())]),
        );
        let mut errors = Vec::new();
        let _ = LowPrivilegeRaise::compile(&cfg, |_, _| None, &mut errors);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("shared/nope"));
    }
}
