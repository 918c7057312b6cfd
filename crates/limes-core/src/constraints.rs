//! Static quota constraints.
//!
//! Operators may pin quotas of selected domains and projects with clauses
//! like `at least 10 GiB`, `at most 100` or `exactly 5`. The constraint file
//! is keyed by domain name (and `domain/project` for projects), then by
//! service type and resource name:
//!
//! ```yaml
//! domains:
//!   germany:
//!     shared:
//!       capacity: "at least 10 GiB, at most 1 TiB"
//! projects:
//!   germany/berlin:
//!     shared:
//!       things: "exactly 5"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::cluster::Cluster;
use crate::error::{ConfigError, ConstraintError};
use crate::names::{DbServiceType, LiquidResourceName, QuotaDistributionModel};
use crate::unit::{Unit, ValueWithUnit};
use crate::validation::ValidationError;

#[allow(clippy::expect_used)]
static AT_LEAST_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^at\s+least\s+(.+)$").expect("valid constraint regex"));
#[allow(clippy::expect_used)]
static AT_MOST_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^at\s+most\s+(.+)$").expect("valid constraint regex"));
#[allow(clippy::expect_used)]
static EXACTLY_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^exactly\s+(.+)$").expect("valid constraint regex"));
#[allow(clippy::expect_used)]
static AT_LEAST_MORE_RX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^at\s+least\s+(.+)\s+more\s+than\s+project\s+constraints$").expect("valid constraint regex")
});

fn capture<'a>(rx: &Regex, input: &'a str) -> Option<&'a str> {
    rx.captures(input)?.get(1).map(|m| m.as_str())
}

/// Lower and/or upper bound for a quota value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaConstraint {
    pub minimum: Option<u64>,
    pub maximum: Option<u64>,
    pub unit: Unit,
}

impl QuotaConstraint {
    /// Parses a comma-separated list of clauses. `project_minimums_sum` is
    /// given for domain constraints and enables the "at least X more than
    /// project constraints" form. Returns `None` if the clauses impose no
    /// bound at all.
    ///
    /// # Errors
    ///
    /// Returns [`ConstraintError`] for unknown clauses, unparseable values or
    /// contradicting bounds.
    pub fn parse(
        input: &str,
        unit: Unit,
        project_minimums_sum: Option<u64>,
    ) -> Result<Option<Self>, ConstraintError> {
        let mut minimum: Option<u64> = None;
        let mut maximum: Option<u64> = None;
        let mut raise_min = |v: u64| minimum = Some(minimum.map_or(v, |m| m.max(v)));
        let mut lower_max = |v: u64| maximum = Some(maximum.map_or(v, |m| m.min(v)));

        for clause in input.split(',').map(str::trim) {
            if let Some(value) = capture(&AT_LEAST_MORE_RX, clause) {
                let Some(sum) = project_minimums_sum else {
                    return Err(ConstraintError::ProjectRelativeNotAllowed(clause.to_owned()));
                };
                raise_min(unit.parse(value)?.saturating_add(sum));
            } else if let Some(value) = capture(&AT_LEAST_RX, clause) {
                raise_min(unit.parse(value)?);
            } else if let Some(value) = capture(&AT_MOST_RX, clause) {
                lower_max(unit.parse(value)?);
            } else if let Some(value) = capture(&EXACTLY_RX, clause) {
                let value = unit.parse(value)?;
                raise_min(value);
                lower_max(value);
            } else {
                return Err(ConstraintError::UnknownClause(clause.to_owned()));
            }
        }

        if let (Some(min), Some(max)) = (minimum, maximum) {
            if max < min {
                return Err(ConstraintError::Unsatisfiable {
                    min: unit.format(min),
                    max: unit.format(max),
                });
            }
        }
        let minimum = minimum.filter(|m| *m != 0);
        if minimum.is_none() && maximum.is_none() {
            return Ok(None);
        }
        Ok(Some(Self {
            minimum,
            maximum,
            unit,
        }))
    }

    /// Checks `value` against this constraint.
    #[must_use]
    pub fn validate(&self, value: u64) -> Option<ValidationError> {
        let above_min = self.minimum.is_none_or(|m| m <= value);
        let below_max = self.maximum.is_none_or(|m| m >= value);
        if above_min && below_max {
            return None;
        }
        let requested = ValueWithUnit {
            value,
            unit: self.unit,
        };
        let mut err = ValidationError::conflict(format!(
            "requested value {:?} contradicts constraint {:?}",
            requested.to_string(),
            self.to_string()
        ));
        err.min_acceptable = self.minimum;
        err.max_acceptable = self.maximum;
        err.unit = self.unit;
        Some(err)
    }

    /// Clamps `value` into the allowed range.
    #[must_use]
    pub fn apply_to(&self, value: u64) -> u64 {
        match (self.minimum, self.maximum) {
            (Some(min), _) if value < min => min,
            (_, Some(max)) if value > max => max,
            _ => value,
        }
    }
}

impl fmt::Display for QuotaConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        match (self.minimum, self.maximum) {
            (Some(min), Some(max)) if min == max => {
                parts.push(format!("exactly {}", self.unit.format(min)));
            }
            (min, max) => {
                if let Some(min) = min {
                    parts.push(format!("at least {}", self.unit.format(min)));
                }
                if let Some(max) = max {
                    parts.push(format!("at most {}", self.unit.format(max)));
                }
            }
        }
        f.write_str(&parts.join(", "))
    }
}

/// Constraints of one domain or project.
pub type QuotaConstraints = BTreeMap<(DbServiceType, LiquidResourceName), QuotaConstraint>;

type RawConstraints = BTreeMap<DbServiceType, BTreeMap<LiquidResourceName, String>>;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConstraintFile {
    #[serde(default)]
    domains: BTreeMap<String, RawConstraints>,
    #[serde(default)]
    projects: BTreeMap<String, RawConstraints>,
}

/// All configured constraints, by domain name and project name.
#[derive(Debug, Clone, Default)]
pub struct QuotaConstraintSet {
    domains: BTreeMap<String, QuotaConstraints>,
    projects: BTreeMap<String, BTreeMap<String, QuotaConstraints>>,
}

impl QuotaConstraintSet {
    /// Parses and validates a constraint document against the cluster.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] listing all problems found.
    pub fn from_yaml(cluster: &Cluster, source_name: &str, yaml: &str) -> Result<Self, ConfigError> {
        let file: ConstraintFile = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
            path: source_name.to_owned(),
            reason: e.to_string(),
        })?;
        let mut errors = Vec::new();
        let mut result = Self::default();

        for (full_name, raw) in &file.projects {
            let Some((domain_name, project_name)) = full_name.split_once('/') else {
                errors.push(format!("invalid constraints: missing domain name for project {full_name}"));
                continue;
            };
            let mut suberrors = Vec::new();
            let values = compile(cluster, raw, None, &mut suberrors);
            errors.extend(
                suberrors
                    .into_iter()
                    .map(|e| format!("invalid constraints for project {full_name}: {e}")),
            );
            result
                .projects
                .entry(domain_name.to_owned())
                .or_default()
                .insert(project_name.to_owned(), values);
        }

        for (domain_name, raw) in &file.domains {
            let projects = result.projects.get(domain_name);
            let mut suberrors = Vec::new();
            let values = compile(cluster, raw, Some(projects), &mut suberrors);
            errors.extend(
                suberrors
                    .into_iter()
                    .map(|e| format!("invalid constraints for domain {domain_name}: {e}")),
            );
            result.domains.insert(domain_name.clone(), values);
        }

        if errors.is_empty() {
            let domain_names: BTreeSet<&String> =
                result.domains.keys().chain(result.projects.keys()).collect();
            for domain_name in domain_names {
                for e in result.check_domain_consistency(cluster, domain_name) {
                    errors.push(format!("inconsistent constraints for domain {domain_name}: {e}"));
                }
            }
        }

        if errors.is_empty() {
            Ok(result)
        } else {
            Err(ConfigError::Invalid { errors })
        }
    }

    /// Reads and parses a constraint file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed or
    /// validated.
    pub async fn load(cluster: &Cluster, path: &Path) -> Result<Self, ConfigError> {
        let yaml = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Self::from_yaml(cluster, &path.display().to_string(), &yaml)
    }

    #[must_use]
    pub fn for_domain(&self, domain_name: &str) -> Option<&QuotaConstraints> {
        self.domains.get(domain_name)
    }

    #[must_use]
    pub fn for_project(&self, domain_name: &str, project_name: &str) -> Option<&QuotaConstraints> {
        self.projects.get(domain_name)?.get(project_name)
    }

    /// The sum of project minimums may not exceed the domain minimum.
    fn check_domain_consistency(&self, cluster: &Cluster, domain_name: &str) -> Vec<String> {
        let mut sums: BTreeMap<&(DbServiceType, LiquidResourceName), u64> = BTreeMap::new();
        for project in self.projects.get(domain_name).into_iter().flat_map(BTreeMap::values) {
            for (key, constraint) in project {
                *sums.entry(key).or_default() += constraint.minimum.unwrap_or(0);
            }
        }

        let domain = self.domains.get(domain_name);
        let mut errors = Vec::new();
        for ((service_type, resource_name), projects_min) in sums {
            let qd = cluster.quota_distribution_for_resource(service_type, resource_name);
            if qd.model != QuotaDistributionModel::Hierarchical {
                continue;
            }
            let domain_min = domain
                .and_then(|d| d.get(&(service_type.clone(), resource_name.clone())))
                .and_then(|c| c.minimum)
                .unwrap_or(0);
            if projects_min > domain_min {
                let unit = cluster
                    .info_for_resource(service_type, resource_name)
                    .map(|info| info.unit)
                    .unwrap_or_default();
                errors.push(format!(
                    "sum of \"at least/exactly\" project quotas ({}) for {service_type}/{resource_name} exceeds \"at least/exactly\" domain quota ({})",
                    unit.format(projects_min),
                    unit.format(domain_min),
                ));
            }
        }
        errors
    }
}

/// `projects` is `Some` for domain constraints (holding the constraints of
/// the domain's projects, if any) and `None` for project constraints.
fn compile(
    cluster: &Cluster,
    raw: &RawConstraints,
    projects: Option<Option<&BTreeMap<String, QuotaConstraints>>>,
    errors: &mut Vec<String>,
) -> QuotaConstraints {
    let mut values = QuotaConstraints::new();
    for (service_type, resources) in raw {
        if !cluster.has_service(service_type) {
            continue;
        }
        for (resource_name, input) in resources {
            if input.is_empty() {
                continue;
            }
            let Some(info) = cluster.info_for_resource(service_type, resource_name) else {
                continue;
            };
            if info.no_quota() {
                errors.push(format!("resource {service_type}/{resource_name} does not track quota"));
                continue;
            }
            let qd = cluster.quota_distribution_for_resource(service_type, resource_name);
            if projects.is_some() && qd.model != QuotaDistributionModel::Hierarchical {
                errors.push(format!(
                    "resource {service_type}/{resource_name} does not accept domain quota constraints because domain quota is computed automatically according to the {} quota distribution model",
                    qd.model.as_str()
                ));
                continue;
            }
            let key = (service_type.clone(), resource_name.clone());
            let project_minimums_sum = projects.map(|projects| {
                projects
                    .into_iter()
                    .flat_map(BTreeMap::values)
                    .filter_map(|p| p.get(&key).and_then(|c| c.minimum))
                    .sum()
            });
            match QuotaConstraint::parse(input, info.unit, project_minimums_sum) {
                Ok(Some(constraint)) => {
                    values.insert(key, constraint);
                }
                Ok(None) => {}
                Err(e) => errors.push(format!(
                    "invalid constraint {input:?} for {service_type}/{resource_name}: {e}"
                )),
            }
        }
    }
    values
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cluster::testing::test_cluster;
    use crate::validation::ValidationStatus;

    #[test]
    fn parse_combines_bounds() {
        let c = QuotaConstraint::parse("at least 2, at least 4, at most 10, at most 8", Unit::None, None)
            .unwrap()
            .unwrap();
        assert_eq!(c.minimum, Some(4));
        assert_eq!(c.maximum, Some(8));
        assert_eq!(c.to_string(), "at least 4, at most 8");

        let c = QuotaConstraint::parse("exactly 1 GiB", Unit::Mebibytes, None)
            .unwrap()
            .unwrap();
        assert_eq!(c.to_string(), "exactly 1024 MiB");
    }

    #[test]
    fn parse_drops_zero_minimum() {
        assert_eq!(QuotaConstraint::parse("at least 0", Unit::None, None).unwrap(), None);
        let c = QuotaConstraint::parse("at least 0, at most 3", Unit::None, None)
            .unwrap()
            .unwrap();
        assert_eq!(c.minimum, None);
        assert_eq!(c.maximum, Some(3));
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            QuotaConstraint::parse("more or less 5", Unit::None, None),
            Err(ConstraintError::UnknownClause(_))
        ));
        let err = QuotaConstraint::parse("at least 10, at most 5", Unit::None, None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "constraint clauses cannot simultaneously be satisfied (at least 10, but at most 5)"
        );
        assert!(matches!(
            QuotaConstraint::parse("at least 5 more than project constraints", Unit::None, None),
            Err(ConstraintError::ProjectRelativeNotAllowed(_))
        ));
    }

    #[test]
    fn project_relative_minimum_for_domains() {
        let c = QuotaConstraint::parse("at least 5 more than project constraints", Unit::None, Some(7))
            .unwrap()
            .unwrap();
        assert_eq!(c.minimum, Some(12));
    }

    #[test]
    fn validate_reports_bounds() {
        let c = QuotaConstraint {
            minimum: Some(10),
            maximum: None,
            unit: Unit::Gibibytes,
        };
        assert!(c.validate(10).is_none());
        let err = c.validate(5).unwrap();
        assert_eq!(err.status, ValidationStatus::Conflict);
        assert_eq!(
            err.message,
            r#"requested value "5 GiB" contradicts constraint "at least 10 GiB""#
        );
        assert_eq!(err.min_acceptable, Some(10));
        assert_eq!(c.apply_to(3), 10);
    }

    #[test]
    fn load_constraint_set() {
        let cluster = test_cluster();
        let yaml = r#"
domains:
  germany:
    shared:
      things: "at least 5 more than project constraints"
projects:
  germany/berlin:
    shared:
      things: "at least 10"
      capacity: "at most 1 KiB"
    unknown_service:
      whatever: "at least 1"
"#;
        let set = QuotaConstraintSet::from_yaml(&cluster, "constraints", yaml).unwrap();
        let key = (DbServiceType::new("shared"), LiquidResourceName::new("things"));
        assert_eq!(set.for_domain("germany").unwrap()[&key].minimum, Some(15));
        let berlin = set.for_project("germany", "berlin").unwrap();
        assert_eq!(berlin[&key].minimum, Some(10));
        let cap_key = (DbServiceType::new("shared"), LiquidResourceName::new("capacity"));
        assert_eq!(berlin[&cap_key].maximum, Some(1024));
        assert!(set.for_project("germany", "dresden").is_none());
    }

    #[test]
    fn inconsistent_constraints_are_rejected() {
        let cluster = test_cluster();
        let yaml = r#"
domains:
  germany:
    shared:
      things: "at least 5"
projects:
  germany/berlin:
    shared:
      things: "at least 10"
  france:
    shared:
      usage_only: "at least 1"
"#;
        let err = QuotaConstraintSet::from_yaml(&cluster, "constraints", yaml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("missing domain name for project france"));
    }

    #[test]
    fn project_minimums_may_not_exceed_domain_minimum() {
        let cluster = test_cluster();
        let yaml = r#"
domains:
  germany:
    shared:
      things: "at least 5"
projects:
  germany/berlin:
    shared:
      things: "at least 10"
"#;
        let err = QuotaConstraintSet::from_yaml(&cluster, "constraints", yaml).unwrap_err();
        assert!(err.to_string().contains("exceeds \"at least/exactly\" domain quota (5)"));
    }
}
