//! Validation of rate-limit change requests for one project.
//!
//! Only rates with a configured project default may be overridden, and the
//! user needs rate-limit permission for the service.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PutErrorResponse, SimulationReport, audit_status, reject_reason};
use crate::audit::{AuditFact, AuditTarget, Initiator, RateLimitChangeTarget, ScopeRef};
use crate::cluster::Cluster;
use crate::name_mapping::NameMapping;
use crate::names::{DbServiceType, Domain, LiquidRateName, Project, RateName, ServiceType};
use crate::report::rates::ProjectRatesReport;
use crate::unit::Unit;
use crate::validation::{ValidationError, ValidationStatus};
use crate::window::Window;

/// A requested rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RequestedRateLimit {
    pub limit: u64,
    pub window: Window,
}

/// Requested limits by API service type and rate name.
pub type RateLimitRequest = BTreeMap<ServiceType, BTreeMap<RateName, RequestedRateLimit>>;

/// One service in a request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceRateLimitRequest {
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    #[serde(default)]
    pub rates: Vec<RateLimitRequestEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitRequestEntry {
    pub name: RateName,
    #[serde(flatten)]
    pub requested: RequestedRateLimit,
}

#[must_use]
pub fn rate_limit_request_from_services(services: Vec<ServiceRateLimitRequest>) -> RateLimitRequest {
    let mut result = RateLimitRequest::new();
    for service in services {
        let entry = result.entry(service.service_type).or_default();
        for rate in service.rates {
            entry.insert(rate.name, rate.requested);
        }
    }
    result
}

/// Whether the user may set rate limits for a service.
pub trait RateLimitPermissions: Send + Sync {
    fn can_set_rate_limit(&self, service_type: &ServiceType) -> bool;
}

impl RateLimitPermissions for bool {
    fn can_set_rate_limit(&self, _: &ServiceType) -> bool {
        *self
    }
}

/// Validation outcome for one requested rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitChange {
    pub target: Option<(DbServiceType, LiquidRateName)>,
    pub unit: Unit,
    pub old_limit: u64,
    pub new_limit: u64,
    pub old_window: Option<Window>,
    pub new_window: Window,
    pub error: Option<ValidationError>,
}

/// A validated rate limit that can be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedRateLimit {
    pub service_type: DbServiceType,
    pub rate_name: LiquidRateName,
    pub limit: u64,
    pub window: Window,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnacceptableRate {
    pub service_type: ServiceType,
    pub name: RateName,
    pub status: ValidationStatus,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnacceptableRates {
    #[serde(rename = "unacceptable_rates", skip_serializing_if = "Vec::is_empty")]
    pub rates: Vec<UnacceptableRate>,
}

pub struct RateLimitUpdater<'a> {
    cluster: &'a Cluster,
    nm: &'a NameMapping,
    domain: &'a Domain,
    project: &'a Project,
    permissions: &'a dyn RateLimitPermissions,
    requests: BTreeMap<ServiceType, BTreeMap<RateName, RateLimitChange>>,
}

impl<'a> RateLimitUpdater<'a> {
    #[must_use]
    pub fn new(
        cluster: &'a Cluster,
        nm: &'a NameMapping,
        domain: &'a Domain,
        project: &'a Project,
        permissions: &'a dyn RateLimitPermissions,
    ) -> Self {
        Self {
            cluster,
            nm,
            domain,
            project,
            permissions,
            requests: BTreeMap::new(),
        }
    }

    /// Validates `input` against the project's current rate report.
    /// Requests for services that are not configured are ignored.
    pub fn validate(&mut self, report: &ProjectRatesReport, input: &RateLimitRequest) {
        self.requests.clear();
        let (cluster, nm) = (self.cluster, self.nm);
        for (api_service, rates) in input {
            for (api_rate, requested) in rates {
                let target = nm.map_rate_from_api(api_service, api_rate).or_else(|| {
                    // unknown rates of known services are attempts to create new limits
                    let service_type = DbServiceType::new(api_service.as_str());
                    cluster
                        .has_service(&service_type)
                        .then(|| (service_type, LiquidRateName::new(api_rate.as_str())))
                });
                let Some((service_type, rate_name)) = target else {
                    continue;
                };

                let mut change = RateLimitChange {
                    target: Some((service_type.clone(), rate_name.clone())),
                    unit: Unit::None,
                    old_limit: 0,
                    new_limit: requested.limit,
                    old_window: None,
                    new_window: requested.window,
                    error: None,
                };
                let default = cluster
                    .project_default_rate_limits(&service_type)
                    .iter()
                    .find(|cfg| cfg.name == rate_name);
                let Some(default) = default else {
                    change.error = Some(ValidationError::forbidden("user is not allowed to create new rate limits"));
                    self.insert(api_service, api_rate, change);
                    continue;
                };
                change.unit = default.unit;

                let current = report
                    .services
                    .get(api_service)
                    .and_then(|s| s.rates.get(api_rate))
                    .and_then(|r| r.window.filter(|_| r.limit != 0).map(|w| (r.limit, w)));
                let (old_limit, old_window) = current.unwrap_or((default.limit, default.window));
                change.old_limit = old_limit;
                change.old_window = Some(old_window);
                if old_limit == requested.limit && old_window == requested.window {
                    continue;
                }

                if !self.permissions.can_set_rate_limit(api_service) {
                    change.error = Some(ValidationError::forbidden(format!(
                        "user is not allowed to set {:?} rate limits",
                        api_service.as_str()
                    )));
                }
                self.insert(api_service, api_rate, change);
            }
        }
    }

    fn insert(&mut self, service: &ServiceType, rate: &RateName, change: RateLimitChange) {
        self.requests
            .entry(service.clone())
            .or_default()
            .insert(rate.clone(), change);
    }

    #[must_use]
    pub fn requests(&self) -> &BTreeMap<ServiceType, BTreeMap<RateName, RateLimitChange>> {
        &self.requests
    }

    fn changes(&self) -> impl Iterator<Item = (&ServiceType, &RateName, &RateLimitChange)> {
        self.requests
            .iter()
            .flat_map(|(svc, changes)| changes.iter().map(move |(rate, change)| (svc, rate, change)))
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.changes().all(|(_, _, change)| change.error.is_none())
    }

    /// The limits to write. Empty unless the whole request is valid.
    #[must_use]
    pub fn accepted_changes(&self) -> Vec<AcceptedRateLimit> {
        if !self.is_valid() {
            return Vec::new();
        }
        self.changes()
            .filter_map(|(_, _, change)| {
                let (service_type, rate_name) = change.target.clone()?;
                Some(AcceptedRateLimit {
                    service_type,
                    rate_name,
                    limit: change.new_limit,
                    window: change.new_window,
                })
            })
            .collect()
    }

    #[must_use]
    pub fn simulation_report(&self) -> SimulationReport<UnacceptableRates> {
        let rates: Vec<UnacceptableRate> = self
            .changes()
            .filter_map(|(svc, rate, change)| {
                let err = change.error.as_ref()?;
                Some(UnacceptableRate {
                    service_type: svc.clone(),
                    name: rate.clone(),
                    status: err.status,
                    message: err.message.clone(),
                })
            })
            .collect();
        SimulationReport {
            success: rates.is_empty(),
            unacceptable: UnacceptableRates { rates },
        }
    }

    #[must_use]
    pub fn put_error(&self) -> Option<PutErrorResponse> {
        let mut lines = Vec::new();
        let mut statuses = BTreeSet::new();
        for (svc, rate, change) in self.changes() {
            if let Some(err) = &change.error {
                statuses.insert(err.status);
                lines.push(format!("cannot change {svc}/{rate} rate limits: {}", err.message));
            }
        }
        if lines.is_empty() {
            return None;
        }
        Some(PutErrorResponse::from_lines(lines, &statuses))
    }

    #[must_use]
    pub fn audit_facts(&self, request_time: DateTime<Utc>, initiator: &Initiator) -> Vec<AuditFact> {
        let is_valid = self.is_valid();
        let scope = ScopeRef {
            domain_id: self.domain.uuid.clone(),
            domain_name: self.domain.name.clone(),
            project_id: self.project.uuid.clone(),
            project_name: self.project.name.clone(),
        };
        self.changes()
            .map(|(svc, rate, change)| AuditFact {
                observed_at: request_time,
                initiator: initiator.clone(),
                action: "update",
                status_code: audit_status(is_valid),
                target: AuditTarget::RateLimit(RateLimitChangeTarget {
                    scope: scope.clone(),
                    service_type: svc.clone(),
                    name: rate.clone(),
                    old_limit: change.old_limit,
                    new_limit: change.new_limit,
                    old_window: change.old_window,
                    new_window: change.new_window,
                    unit: change.unit,
                    reject_reason: reject_reason(is_valid, change.error.as_ref()),
                }),
            })
            .collect()
    }
}
