//! Counters for quota changes made with low-privilege-raise permission,
//! rendered in the Prometheus text format.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Mutex, PoisonError};

use crate::lowpriv_raise::LimitScope;
use crate::names::{ResourceName, ServiceType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Outcome {
    Success,
    Failure,
}

type CounterKey = (u8, Outcome, ServiceType, ResourceName);

/// Success/failure counters keyed by scope, service and resource.
#[derive(Debug)]
pub struct LowPrivilegeRaiseMetrics {
    cluster_id: String,
    counters: Mutex<BTreeMap<CounterKey, u64>>,
}

fn scope_index(scope: LimitScope) -> u8 {
    match scope {
        LimitScope::Domain => 0,
        LimitScope::Project => 1,
    }
}

impl LowPrivilegeRaiseMetrics {
    #[must_use]
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            counters: Mutex::new(BTreeMap::new()),
        }
    }

    /// Counts one change attempt.
    pub fn record(&self, scope: LimitScope, service_type: &ServiceType, resource_name: &ResourceName, success: bool) {
        let outcome = if success { Outcome::Success } else { Outcome::Failure };
        let key = (scope_index(scope), outcome, service_type.clone(), resource_name.clone());
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        *counters.entry(key).or_insert(0) += 1;
    }

    /// The current value of one counter.
    #[must_use]
    pub fn get(&self, scope: LimitScope, service_type: &ServiceType, resource_name: &ResourceName, success: bool) -> u64 {
        let outcome = if success { Outcome::Success } else { Outcome::Failure };
        let key = (scope_index(scope), outcome, service_type.clone(), resource_name.clone());
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.get(&key).copied().unwrap_or(0)
    }

    /// Renders all counters. Every metric family gets its `HELP` and `TYPE`
    /// header even while it has no samples.
    #[must_use]
    pub fn render(&self) -> String {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::new();
        for scope in [LimitScope::Domain, LimitScope::Project] {
            for outcome in [Outcome::Success, Outcome::Failure] {
                let (name, adjective) = match outcome {
                    Outcome::Success => ("success", "successful"),
                    Outcome::Failure => ("failure", "failed"),
                };
                let metric = format!("limes_lowpriv_raise_{}_{name}_total", scope.as_str());
                let _ = writeln!(
                    out,
                    "# HELP {metric} Counter for {adjective} {} quota changes with low-privilege-raise permission.",
                    scope.as_str()
                );
                let _ = writeln!(out, "# TYPE {metric} counter");
                for ((s, o, service, resource), value) in counters.iter() {
                    if *s != scope_index(scope) || *o != outcome {
                        continue;
                    }
                    let _ = writeln!(
                        out,
                        "{metric}{{os_cluster=\"{}\",service=\"{service}\",resource=\"{resource}\"}} {value}",
                        self.cluster_id
                    );
                }
            }
        }
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_scope_and_outcome() {
        let metrics = LowPrivilegeRaiseMetrics::new("west");
        let svc = ServiceType::new("shared");
        let res = ResourceName::new("things");
        metrics.record(LimitScope::Project, &svc, &res, true);
        metrics.record(LimitScope::Project, &svc, &res, true);
        metrics.record(LimitScope::Domain, &svc, &res, false);

        assert_eq!(metrics.get(LimitScope::Project, &svc, &res, true), 2);
        assert_eq!(metrics.get(LimitScope::Project, &svc, &res, false), 0);
        assert_eq!(metrics.get(LimitScope::Domain, &svc, &res, false), 1);

        let text = metrics.render();
        assert!(text.contains(
            "limes_lowpriv_raise_project_success_total{os_cluster=\"west\",service=\"shared\",resource=\"things\"} 2"
        ));
        assert!(text.contains("# TYPE limes_lowpriv_raise_domain_success_total counter"));
        assert!(text.contains(
            "limes_lowpriv_raise_domain_failure_total{os_cluster=\"west\",service=\"shared\",resource=\"things\"} 1"
        ));
    }
}
