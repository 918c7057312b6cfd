//! Validation of quota change requests for one domain or one project.
//!
//! A request is checked against the current cluster, domain and (for project
//! scope) project reports. Each requested resource passes through these
//! stages, stopping at the first problem:
//!
//! 1. the resource must track quota and must not be managed externally
//! 2. the value is converted into the resource's unit
//! 3. unchanged values are skipped
//! 4. static quota constraints
//! 5. the minimum nonzero quota
//! 6. authorization, including low-privilege raises up to a computed limit
//! 7. domain quotas must cover project quotas; project quotas must cover
//!    usage and fit into the domain quota
//!
//! For project scope, the backend may finally reject all values of one
//! service through a [`QuotaAcceptanceHook`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PutErrorResponse, SimulationReport, audit_status, reject_reason};
use crate::audit::{AuditFact, AuditTarget, Initiator, QuotaChangeTarget, ScopeRef};
use crate::cluster::Cluster;
use crate::constraints::{QuotaConstraintSet, QuotaConstraints};
use crate::error::UpdateError;
use crate::lowpriv_raise::LimitScope;
use crate::metrics::LowPrivilegeRaiseMetrics;
use crate::name_mapping::NameMapping;
use crate::names::{
    DbServiceType, Domain, LiquidResourceName, Project, QuotaDistributionModel, ResourceName, ServiceType,
};
use crate::report::cluster::{ClusterReport, ClusterResourceReport};
use crate::report::domain::{DomainReport, DomainResourceReport};
use crate::report::project::{ProjectReport, ProjectResourceReport};
use crate::unit::{Unit, ValueWithUnit};
use crate::validation::{ValidationError, ValidationStatus};

const MISSING_INPUT_DATA: &str = "missing input data for quota validation (please report this problem!)";

/// A requested quota value. Without a unit, the value is read in the
/// resource's own unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RequestedQuota {
    #[serde(rename = "quota")]
    pub value: u64,
    #[serde(default)]
    pub unit: Option<Unit>,
}

/// Requested quotas by API service type and resource name.
pub type QuotaRequest = BTreeMap<ServiceType, BTreeMap<ResourceName, RequestedQuota>>;

/// One service in a request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceQuotaRequest {
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    #[serde(default)]
    pub resources: Vec<ResourceQuotaRequest>,
}

/// One resource in a request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceQuotaRequest {
    pub name: ResourceName,
    #[serde(flatten)]
    pub quota: RequestedQuota,
}

/// Converts the list form of a request body into a [`QuotaRequest`]. Later
/// entries for the same resource win.
#[must_use]
pub fn quota_request_from_services(services: Vec<ServiceQuotaRequest>) -> QuotaRequest {
    let mut result = QuotaRequest::new();
    for service in services {
        let entry = result.entry(service.service_type).or_default();
        for resource in service.resources {
            entry.insert(resource.name, resource.quota);
        }
    }
    result
}

/// What the requesting user may do with quotas of a resource.
pub trait QuotaPermissions: Send + Sync {
    fn can_raise(&self, service_type: &ServiceType, resource_name: &ResourceName) -> bool;
    fn can_raise_lowpriv(&self, service_type: &ServiceType, resource_name: &ResourceName) -> bool;
    fn can_lower(&self, service_type: &ServiceType, resource_name: &ResourceName) -> bool;
    fn can_lower_lowpriv(&self, service_type: &ServiceType, resource_name: &ResourceName) -> bool;
}

/// The same permissions for every resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaticPermissions {
    pub raise: bool,
    pub raise_lowpriv: bool,
    pub lower: bool,
    pub lower_lowpriv: bool,
}

impl StaticPermissions {
    #[must_use]
    pub fn all() -> Self {
        Self {
            raise: true,
            raise_lowpriv: true,
            lower: true,
            lower_lowpriv: true,
        }
    }
}

impl QuotaPermissions for StaticPermissions {
    fn can_raise(&self, _: &ServiceType, _: &ResourceName) -> bool {
        self.raise
    }
    fn can_raise_lowpriv(&self, _: &ServiceType, _: &ResourceName) -> bool {
        self.raise_lowpriv
    }
    fn can_lower(&self, _: &ServiceType, _: &ResourceName) -> bool {
        self.lower
    }
    fn can_lower_lowpriv(&self, _: &ServiceType, _: &ResourceName) -> bool {
        self.lower_lowpriv
    }
}

/// The full set of quotas a project would have after the change, by
/// backend identity.
pub type ProjectQuotaValues = BTreeMap<DbServiceType, BTreeMap<LiquidResourceName, u64>>;

/// Backend-specific acceptance check for project quotas.
#[async_trait::async_trait]
pub trait QuotaAcceptanceHook: Send + Sync {
    /// Decides whether `quotas` are acceptable for the backend of
    /// `service_type`. The error text is shown to the user.
    async fn check_project_quotas(
        &self,
        domain: &Domain,
        project: &Project,
        service_type: &DbServiceType,
        quotas: &ProjectQuotaValues,
    ) -> Result<(), String>;
}

/// Accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait::async_trait]
impl QuotaAcceptanceHook for AcceptAll {
    async fn check_project_quotas(
        &self,
        _domain: &Domain,
        _project: &Project,
        _service_type: &DbServiceType,
        _quotas: &ProjectQuotaValues,
    ) -> Result<(), String> {
        Ok(())
    }
}

/// The reports a request is validated against.
#[derive(Debug, Clone, Copy)]
pub struct QuotaReports<'r> {
    pub cluster: &'r ClusterReport,
    pub domain: &'r DomainReport,
    /// Required for project scope.
    pub project: Option<&'r ProjectReport>,
}

/// Validation outcome for one requested resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaChange {
    /// `None` for resources that do not exist.
    pub target: Option<(DbServiceType, LiquidResourceName)>,
    pub old_value: u64,
    pub new_value: u64,
    pub unit: Unit,
    pub error: Option<ValidationError>,
}

/// A validated change that can be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedQuotaChange {
    pub service_type: DbServiceType,
    pub resource_name: LiquidResourceName,
    pub new_value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnacceptableResource {
    pub service_type: ServiceType,
    pub resource_name: ResourceName,
    #[serde(flatten)]
    pub error: ValidationError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnacceptableResources {
    #[serde(rename = "unacceptable_resources", skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<UnacceptableResource>,
}

/// Validates quota changes in one domain, or in one project of it.
pub struct QuotaUpdater<'a> {
    cluster: &'a Cluster,
    nm: &'a NameMapping,
    domain: &'a Domain,
    project: Option<&'a Project>,
    permissions: &'a dyn QuotaPermissions,
    constraints: Option<&'a QuotaConstraints>,
    requests: BTreeMap<ServiceType, BTreeMap<ResourceName, QuotaChange>>,
}

/// Report data of one resource at all levels in scope.
struct ResourceReports<'r> {
    cluster: &'r ClusterResourceReport,
    domain: &'r DomainResourceReport,
    project: Option<&'r ProjectResourceReport>,
}

impl<'a> QuotaUpdater<'a> {
    #[must_use]
    pub fn new(
        cluster: &'a Cluster,
        nm: &'a NameMapping,
        domain: &'a Domain,
        project: Option<&'a Project>,
        permissions: &'a dyn QuotaPermissions,
    ) -> Self {
        Self {
            cluster,
            nm,
            domain,
            project,
            permissions,
            constraints: None,
            requests: BTreeMap::new(),
        }
    }

    /// Applies the constraints of this updater's scope from `set`.
    #[must_use]
    pub fn with_constraints(mut self, set: Option<&'a QuotaConstraintSet>) -> Self {
        self.constraints = set.and_then(|set| match self.project {
            None => set.for_domain(&self.domain.name),
            Some(project) => set.for_project(&self.domain.name, &project.name),
        });
        self
    }

    fn scope(&self) -> LimitScope {
        if self.project.is_some() {
            LimitScope::Project
        } else {
            LimitScope::Domain
        }
    }

    /// The name that scoped resource behaviors are matched against.
    fn scope_name(&self) -> String {
        match self.project {
            None => self.domain.name.clone(),
            Some(project) => format!("{}/{}", self.domain.name, project.name),
        }
    }

    /// Validates `input`. Per-resource problems are recorded, not returned.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::MissingReport`] if the reports lack a
    /// configured resource, and [`UpdateError::MissingProjectReport`] if the
    /// project has not been scraped yet.
    pub async fn validate(
        &mut self,
        reports: QuotaReports<'_>,
        input: &QuotaRequest,
        hook: &dyn QuotaAcceptanceHook,
    ) -> Result<(), UpdateError> {
        self.requests.clear();
        let scope_name = self.scope_name();
        let (cluster, nm) = (self.cluster, self.nm);

        for service in cluster.services() {
            for (resource_name, info) in &service.resources {
                let service_type = &service.service_type;
                let Some((api_service, api_resource)) = nm.map_resource_to_api(service_type, resource_name)
                else {
                    continue;
                };
                let resource_reports = self.find_reports(reports, &api_service, &api_resource)?;

                let Some(requested) = input.get(&api_service).and_then(|s| s.get(&api_resource)) else {
                    continue;
                };

                let mut change = QuotaChange {
                    target: Some((service_type.clone(), resource_name.clone())),
                    old_value: 0,
                    new_value: 0,
                    unit: info.unit,
                    error: None,
                };
                let old_value = match resource_reports.project {
                    None => resource_reports.domain.quota,
                    Some(project) => project.quota,
                };
                let old_value = match old_value {
                    Some(value) if !resource_reports.domain.info.no_quota => value,
                    _ => {
                        change.error = Some(ValidationError::forbidden("resource does not track quota"));
                        self.insert(api_service, api_resource, change);
                        continue;
                    }
                };
                change.old_value = old_value;
                if info.externally_managed {
                    change.error = Some(ValidationError::forbidden("resource is managed externally"));
                    self.insert(api_service, api_resource, change);
                    continue;
                }

                let given = ValueWithUnit {
                    value: requested.value,
                    unit: requested.unit.unwrap_or(info.unit),
                };
                match given.convert_to(info.unit) {
                    Err(e) => change.error = Some(ValidationError::unprocessable(e.to_string())),
                    Ok(new_value) if new_value == old_value => continue,
                    Ok(new_value) => {
                        change.new_value = new_value;
                        change.error = self.validate_quota(
                            service_type,
                            resource_name,
                            &api_service,
                            &api_resource,
                            info.unit,
                            &scope_name,
                            &resource_reports,
                            old_value,
                            new_value,
                        );
                    }
                }
                self.insert(api_service, api_resource, change);
            }
        }

        self.reject_unknown_resources(input);

        if let (Some(project), Some(project_report)) = (self.project, reports.project) {
            self.run_acceptance_hook(project, project_report, input, hook).await;
        }
        Ok(())
    }

    fn insert(&mut self, service: ServiceType, resource: ResourceName, change: QuotaChange) {
        self.requests.entry(service).or_default().insert(resource, change);
    }

    fn find_reports<'r>(
        &self,
        reports: QuotaReports<'r>,
        api_service: &ServiceType,
        api_resource: &ResourceName,
    ) -> Result<ResourceReports<'r>, UpdateError> {
        let missing = |level: &'static str| UpdateError::MissingReport {
            level,
            service_type: api_service.to_string(),
            resource_name: api_resource.to_string(),
        };
        let cluster = reports
            .cluster
            .services
            .get(api_service)
            .and_then(|s| s.resources.get(api_resource))
            .ok_or_else(|| missing("cluster"))?;
        let domain = reports
            .domain
            .services
            .get(api_service)
            .and_then(|s| s.resources.get(api_resource))
            .ok_or_else(|| missing("domain"))?;
        let project = match self.project {
            None => None,
            Some(_) => Some(
                reports
                    .project
                    .and_then(|r| r.services.get(api_service))
                    .and_then(|s| s.resources.get(api_resource))
                    .ok_or_else(|| UpdateError::MissingProjectReport {
                        service_type: api_service.to_string(),
                        resource_name: api_resource.to_string(),
                    })?,
            ),
        };
        Ok(ResourceReports {
            cluster,
            domain,
            project,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn validate_quota(
        &self,
        service_type: &DbServiceType,
        resource_name: &LiquidResourceName,
        api_service: &ServiceType,
        api_resource: &ResourceName,
        unit: Unit,
        scope_name: &str,
        reports: &ResourceReports<'_>,
        old_value: u64,
        new_value: u64,
    ) -> Option<ValidationError> {
        let scope = self.scope().as_str();

        let constraint = self
            .constraints
            .and_then(|c| c.get(&(service_type.clone(), resource_name.clone())));
        if let Some(err) = constraint.and_then(|c| c.validate(new_value)) {
            return Some(err.with_suffix(&format!(" for this {scope} and resource")));
        }

        let behavior = self.cluster.behavior_for_resource(service_type, resource_name, scope_name);
        let min_nonzero = behavior.min_nonzero_project_quota;
        if min_nonzero > 0 && new_value > 0 && new_value < min_nonzero {
            let min = ValueWithUnit {
                value: min_nonzero,
                unit,
            };
            return Some(
                ValidationError::unprocessable(format!("must allocate at least {min} quota"))
                    .with_min(min_nonzero, unit),
            );
        }

        let lowpriv = self.cluster.lowpriv_raise();
        let limit = match self.project {
            None => lowpriv.limit_for(LimitScope::Domain, service_type, resource_name),
            Some(_) if lowpriv.is_allowed_for_projects_in(&self.domain.name) => {
                lowpriv.limit_for(LimitScope::Project, service_type, resource_name)
            }
            Some(_) => None,
        };
        let (lpr_limit, lpr_reversible) = limit.map_or((0, false), |limit| {
            (
                limit.evaluate(reports.cluster.capacity, reports.cluster.domains_quota, old_value),
                limit.is_reversible(),
            )
        });

        let model = self
            .cluster
            .quota_distribution_for_resource(service_type, resource_name)
            .model;
        if let Some(err) = self.validate_authorization(
            api_service,
            api_resource,
            model,
            unit,
            old_value,
            new_value,
            lpr_limit,
            lpr_reversible,
        ) {
            return Some(err.with_suffix(&format!(" in this {scope}")));
        }

        match reports.project {
            None => self.validate_domain_quota(service_type, resource_name, unit, reports, new_value),
            Some(project) => validate_project_quota(reports.domain, project, unit, new_value),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn validate_authorization(
        &self,
        api_service: &ServiceType,
        api_resource: &ResourceName,
        model: QuotaDistributionModel,
        unit: Unit,
        old_value: u64,
        new_value: u64,
        lpr_limit: u64,
        lpr_reversible: bool,
    ) -> Option<ValidationError> {
        let perms = self.permissions;
        let hierarchical = model == QuotaDistributionModel::Hierarchical;

        if old_value >= new_value {
            if hierarchical {
                if perms.can_lower(api_service, api_resource) {
                    return None;
                }
                // a reversible raise limit also permits the reverse lowering
                if perms.can_lower_lowpriv(api_service, api_resource) && lpr_limit > 0 && lpr_reversible {
                    if old_value <= lpr_limit {
                        return None;
                    }
                    return Some(ValidationError::forbidden(format!(
                        "user is not allowed to lower {:?} quotas that high",
                        api_service.as_str()
                    )));
                }
            }
            return Some(ValidationError::forbidden(format!(
                "user is not allowed to lower {:?} quotas",
                api_service.as_str()
            )));
        }

        if hierarchical {
            if perms.can_raise(api_service, api_resource) {
                return None;
            }
            if perms.can_raise_lowpriv(api_service, api_resource) && lpr_limit > 0 {
                if new_value <= lpr_limit {
                    return None;
                }
                return Some(
                    ValidationError::forbidden(format!(
                        "user is not allowed to raise {:?} quotas that high",
                        api_service.as_str()
                    ))
                    .with_max(lpr_limit, unit),
                );
            }
        }
        Some(ValidationError::forbidden(format!(
            "user is not allowed to raise {:?} quotas",
            api_service.as_str()
        )))
    }

    fn validate_domain_quota(
        &self,
        service_type: &DbServiceType,
        resource_name: &LiquidResourceName,
        unit: Unit,
        reports: &ResourceReports<'_>,
        new_value: u64,
    ) -> Option<ValidationError> {
        let (Some(old_value), Some(projects_quota)) = (reports.domain.quota, reports.domain.projects_quota) else {
            return Some(ValidationError::new(ValidationStatus::InternalServerError, MISSING_INPUT_DATA));
        };

        if new_value < old_value && new_value < projects_quota {
            return Some(
                ValidationError::conflict("domain quota may not be smaller than sum of project quotas in that domain")
                    .with_min(projects_quota, unit),
            );
        }

        let strict = self
            .cluster
            .quota_distribution_for_resource(service_type, resource_name)
            .strict_domain_quota_limit;
        if new_value > old_value && strict {
            let (Some(capacity), Some(domains_quota)) = (reports.cluster.capacity, reports.cluster.domains_quota)
            else {
                return Some(ValidationError::new(ValidationStatus::InternalServerError, MISSING_INPUT_DATA));
            };
            let other_domains_quota = domains_quota.saturating_sub(old_value);
            if other_domains_quota.saturating_add(new_value) > capacity {
                return Some(
                    ValidationError::conflict("cluster capacity may not be exceeded for this resource")
                        .with_max(capacity.saturating_sub(other_domains_quota), unit),
                );
            }
        }
        None
    }

    fn reject_unknown_resources(&mut self, input: &QuotaRequest) {
        for (api_service, resources) in input {
            let unknown_service = self.nm.db_service_types_for(std::slice::from_ref(api_service)).is_empty();
            for api_resource in resources.keys() {
                if self.nm.map_resource_from_api(api_service, api_resource).is_some() {
                    continue;
                }
                let message = if unknown_service {
                    "no such service"
                } else {
                    "no such resource"
                };
                self.insert(
                    api_service.clone(),
                    api_resource.clone(),
                    QuotaChange {
                        target: None,
                        old_value: 0,
                        new_value: 0,
                        unit: Unit::None,
                        error: Some(ValidationError::unprocessable(message)),
                    },
                );
            }
        }
    }

    async fn run_acceptance_hook(
        &mut self,
        project: &Project,
        project_report: &ProjectReport,
        input: &QuotaRequest,
        hook: &dyn QuotaAcceptanceHook,
    ) {
        let mut quotas = ProjectQuotaValues::new();
        for (api_service, service) in &project_report.services {
            for (api_resource, resource) in &service.resources {
                let (Some(quota), false) = (resource.quota, resource.info.no_quota) else {
                    continue;
                };
                if let Some((svc, res)) = self.nm.map_resource_from_api(api_service, api_resource) {
                    quotas.entry(svc).or_default().insert(res, quota);
                }
            }
        }
        for changes in self.requests.values() {
            for change in changes.values() {
                if let Some((svc, res)) = &change.target {
                    if change.error.is_none() {
                        quotas.entry(svc.clone()).or_default().insert(res.clone(), change.new_value);
                    }
                }
            }
        }

        // the hook is asked per backend service, about all requested
        // resources that belong to it
        let mut batches: BTreeMap<DbServiceType, Vec<(ServiceType, ResourceName, LiquidResourceName)>> =
            BTreeMap::new();
        for (api_service, resources) in input {
            for api_resource in resources.keys() {
                if let Some((svc, res)) = self.nm.map_resource_from_api(api_service, api_resource) {
                    batches
                        .entry(svc)
                        .or_default()
                        .push((api_service.clone(), api_resource.clone(), res));
                }
            }
        }

        for (service_type, batch) in batches {
            let has_previous_errors = batch.iter().any(|(api_service, api_resource, _)| {
                self.requests
                    .get(api_service)
                    .and_then(|s| s.get(api_resource))
                    .is_some_and(|c| c.error.is_some())
            });
            if has_previous_errors {
                continue;
            }
            let Err(reason) = hook
                .check_project_quotas(self.domain, project, &service_type, &quotas)
                .await
            else {
                continue;
            };
            let message = format!("not acceptable for this project: {reason}");
            for (api_service, api_resource, resource_name) in batch {
                let unit = self
                    .cluster
                    .info_for_resource(&service_type, &resource_name)
                    .map(|info| info.unit)
                    .unwrap_or_default();
                let current = quotas
                    .get(&service_type)
                    .and_then(|q| q.get(&resource_name))
                    .copied()
                    .unwrap_or(0);
                let change = self
                    .requests
                    .entry(api_service)
                    .or_default()
                    .entry(api_resource)
                    .or_insert_with(|| QuotaChange {
                        target: Some((service_type.clone(), resource_name.clone())),
                        old_value: current,
                        new_value: current,
                        unit,
                        error: None,
                    });
                change.error = Some(ValidationError::unprocessable(message.clone()));
            }
        }
    }

    /// All recorded outcomes, by API service type and resource name.
    #[must_use]
    pub fn requests(&self) -> &BTreeMap<ServiceType, BTreeMap<ResourceName, QuotaChange>> {
        &self.requests
    }

    fn changes(&self) -> impl Iterator<Item = (&ServiceType, &ResourceName, &QuotaChange)> {
        self.requests
            .iter()
            .flat_map(|(svc, changes)| changes.iter().map(move |(res, change)| (svc, res, change)))
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.changes().all(|(_, _, change)| change.error.is_none())
    }

    /// The changes to write. Empty unless the whole request is valid.
    #[must_use]
    pub fn accepted_changes(&self) -> Vec<AcceptedQuotaChange> {
        if !self.is_valid() {
            return Vec::new();
        }
        self.changes()
            .filter_map(|(_, _, change)| {
                let (service_type, resource_name) = change.target.clone()?;
                Some(AcceptedQuotaChange {
                    service_type,
                    resource_name,
                    new_value: change.new_value,
                })
            })
            .collect()
    }

    /// Body of a simulate-put response, ordered by service and resource.
    #[must_use]
    pub fn simulation_report(&self) -> SimulationReport<UnacceptableResources> {
        let resources: Vec<UnacceptableResource> = self
            .changes()
            .filter_map(|(svc, res, change)| {
                Some(UnacceptableResource {
                    service_type: svc.clone(),
                    resource_name: res.clone(),
                    error: change.error.clone()?,
                })
            })
            .collect();
        SimulationReport {
            success: resources.is_empty(),
            unacceptable: UnacceptableResources { resources },
        }
    }

    /// Plain-text error response for a rejected PUT, or `None` if the
    /// request is valid.
    #[must_use]
    pub fn put_error(&self) -> Option<PutErrorResponse> {
        let scope = self.scope().as_str();
        let mut lines = Vec::new();
        let mut statuses = BTreeSet::new();
        for (svc, res, change) in self.changes() {
            let Some(err) = &change.error else {
                continue;
            };
            statuses.insert(err.status);
            let mut line = format!("cannot change {svc}/{res} quota: {}", err.message);
            let mut notes = Vec::new();
            if let Some(min) = err.min_acceptable {
                let min = ValueWithUnit { value: min, unit: err.unit };
                notes.push(format!("minimum acceptable {scope} quota is {min}"));
            }
            if let Some(max) = err.max_acceptable {
                let max = ValueWithUnit { value: max, unit: err.unit };
                notes.push(format!("maximum acceptable {scope} quota is {max}"));
            }
            if !notes.is_empty() {
                line.push_str(&format!(" ({})", notes.join(", ")));
            }
            lines.push(line);
        }
        if lines.is_empty() {
            return None;
        }
        Some(PutErrorResponse::from_lines(lines, &statuses))
    }

    /// One audit fact per recorded outcome.
    #[must_use]
    pub fn audit_facts(&self, request_time: DateTime<Utc>, initiator: &Initiator) -> Vec<AuditFact> {
        let is_valid = self.is_valid();
        let scope = ScopeRef {
            domain_id: self.domain.uuid.clone(),
            domain_name: self.domain.name.clone(),
            project_id: self.project.map(|p| p.uuid.clone()).unwrap_or_default(),
            project_name: self.project.map(|p| p.name.clone()).unwrap_or_default(),
        };
        self.changes()
            .map(|(svc, res, change)| AuditFact {
                observed_at: request_time,
                initiator: initiator.clone(),
                action: "update",
                status_code: audit_status(is_valid),
                target: AuditTarget::Quota(QuotaChangeTarget {
                    scope: scope.clone(),
                    service_type: svc.clone(),
                    resource_name: res.clone(),
                    old_quota: change.old_value,
                    new_quota: change.new_value,
                    unit: change.unit,
                    reject_reason: reject_reason(is_valid, change.error.as_ref()),
                }),
            })
            .collect()
    }

    /// Counts outcomes for users who can only raise within the
    /// low-privilege limits.
    pub fn record_lowpriv_metrics(&self, metrics: &LowPrivilegeRaiseMetrics) {
        let is_valid = self.is_valid();
        for (svc, res, change) in self.changes() {
            let Some((service_type, resource_name)) = &change.target else {
                continue;
            };
            let model = self
                .cluster
                .quota_distribution_for_resource(service_type, resource_name)
                .model;
            if model == QuotaDistributionModel::Hierarchical
                && self.permissions.can_raise_lowpriv(svc, res)
                && !self.permissions.can_raise(svc, res)
            {
                metrics.record(self.scope(), svc, res, is_valid);
            }
        }
    }
}

fn validate_project_quota(
    domain: &DomainResourceReport,
    project: &ProjectResourceReport,
    unit: Unit,
    new_value: u64,
) -> Option<ValidationError> {
    let (Some(old_value), Some(projects_quota), Some(domain_quota)) =
        (project.quota, domain.projects_quota, domain.quota)
    else {
        return Some(ValidationError::new(ValidationStatus::InternalServerError, MISSING_INPUT_DATA));
    };

    if new_value < old_value && new_value < project.usage {
        return Some(
            ValidationError::conflict("quota may not be lower than current usage").with_min(project.usage, unit),
        );
    }

    // with centralized distribution, domain quota follows the project quotas
    if project.quota_distribution_model == Some(QuotaDistributionModel::Hierarchical) {
        let other_projects_quota = projects_quota.saturating_sub(old_value);
        if other_projects_quota.saturating_add(new_value) > domain_quota {
            return Some(
                ValidationError::conflict("domain quota exceeded")
                    .with_max(domain_quota.saturating_sub(other_projects_quota), unit),
            );
        }
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::cluster::testing::test_cluster;
    use crate::filter::Filter;
    use crate::names::{AvailabilityZone, DomainId, ProjectId};
    use crate::report::ReportContext;
    use crate::report::cluster::ClusterReportAssembler;
    use crate::report::domain::DomainReportAssembler;
    use crate::report::project::ProjectReportAssembler;
    use crate::report::rows::{ClusterCapacityRow, ClusterQuotaRow, DomainResourceRow, ProjectResourceRow};

    /// Per resource: capacity, domains quota, domain quota, projects quota,
    /// project quota and project usage.
    struct Setup {
        resources: Vec<(&'static str, &'static str, [u64; 6])>,
        domain_name: &'static str,
    }

    struct Fixture {
        cluster: Cluster,
        nm: NameMapping,
        domain: Domain,
        project: Project,
        cluster_report: ClusterReport,
        domain_report: DomainReport,
        project_report: ProjectReport,
    }

    fn fixture(setup: &Setup) -> Fixture {
        let cluster = test_cluster();
        let nm = NameMapping::new(&cluster);
        let filter = Filter::default();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let ctx = ReportContext::new(&cluster, &nm, &filter, now);
        let domain = Domain {
            id: DomainId(1),
            uuid: "uuid-d".to_owned(),
            name: setup.domain_name.to_owned(),
        };
        let project = Project {
            id: ProjectId(1),
            domain_id: DomainId(1),
            uuid: "uuid-berlin".to_owned(),
            name: "berlin".to_owned(),
            parent_uuid: "uuid-d".to_owned(),
            has_bursting: false,
        };

        let mut clusters = ClusterReportAssembler::new(ctx);
        let mut domains = DomainReportAssembler::new(ctx);
        domains.add_domain(domain.clone());
        let mut projects = ProjectReportAssembler::new(ctx, &domain, vec![project.clone()]);
        for (svc, res, [capacity, domains_quota, domain_quota, projects_quota, quota, usage]) in &setup.resources {
            let service_type = DbServiceType::new(*svc);
            let resource_name = LiquidResourceName::new(*res);
            clusters.add_quota_row(&ClusterQuotaRow {
                service_type: service_type.clone(),
                resource_name: resource_name.clone(),
                quota: Some(*domains_quota),
            });
            clusters
                .add_capacity_row(&ClusterCapacityRow {
                    service_type: service_type.clone(),
                    resource_name: resource_name.clone(),
                    az: Some(AvailabilityZone::any()),
                    raw_capacity: Some(*capacity),
                    ..ClusterCapacityRow::default()
                })
                .unwrap();
            domains.add_resource_row(&DomainResourceRow {
                domain_id: DomainId(1),
                service_type: service_type.clone(),
                resource_name: resource_name.clone(),
                domain_quota: Some(*domain_quota),
                projects_quota: Some(*projects_quota),
                ..DomainResourceRow::default()
            });
            let pushed = projects
                .push_row(&ProjectResourceRow {
                    project_id: ProjectId(1),
                    service_type,
                    resource_name,
                    quota: Some(*quota),
                    az: Some(AvailabilityZone::any()),
                    az_usage: Some(*usage),
                    ..ProjectResourceRow::default()
                })
                .unwrap();
            assert!(pushed.is_none());
        }
        let (draft, _) = projects.finish();
        let project_report = draft.unwrap().finalize();
        let cluster_report = clusters.finish();
        let domain_report = domains.finish().remove(0);
        Fixture {
            cluster,
            nm,
            domain,
            project,
            cluster_report,
            domain_report,
            project_report,
        }
    }

    fn default_setup() -> Setup {
        Setup {
            domain_name: "germany",
            resources: vec![
                ("shared", "things", [1000, 300, 100, 90, 0, 0]),
                ("shared", "capacity", [400, 100, 100, 50, 20, 15]),
                ("shared", "external_things", [10, 0, 5, 5, 5, 0]),
                ("shared", "usage_only", [0, 0, 0, 0, 0, 3]),
                ("unshared", "capacity", [100, 0, 0, 0, 0, 0]),
                ("unshared", "things", [100, 20, 20, 20, 20, 0]),
            ],
        }
    }

    impl Fixture {
        fn reports(&self, with_project: bool) -> QuotaReports<'_> {
            QuotaReports {
                cluster: &self.cluster_report,
                domain: &self.domain_report,
                project: with_project.then_some(&self.project_report),
            }
        }

        fn project_updater<'a>(&'a self, perms: &'a StaticPermissions) -> QuotaUpdater<'a> {
            QuotaUpdater::new(&self.cluster, &self.nm, &self.domain, Some(&self.project), perms)
        }

        fn domain_updater<'a>(&'a self, perms: &'a StaticPermissions) -> QuotaUpdater<'a> {
            QuotaUpdater::new(&self.cluster, &self.nm, &self.domain, None, perms)
        }
    }

    fn request(entries: &[(&str, &str, u64, Option<Unit>)]) -> QuotaRequest {
        let mut result = QuotaRequest::new();
        for (svc, res, value, unit) in entries {
            result
                .entry(ServiceType::new(*svc))
                .or_default()
                .insert(ResourceName::new(*res), RequestedQuota { value: *value, unit: *unit });
        }
        result
    }

    fn error_of<'u>(updater: &'u QuotaUpdater<'_>, svc: &str, res: &str) -> Option<&'u ValidationError> {
        updater.requests()[svc][res].error.as_ref()
    }

    #[tokio::test]
    async fn project_quota_must_fit_into_domain_quota() {
        let fx = fixture(&default_setup());
        let perms = StaticPermissions::all();

        let mut updater = fx.project_updater(&perms);
        updater
            .validate(fx.reports(true), &request(&[("shared", "things", 11, None)]), &AcceptAll)
            .await
            .unwrap();
        let err = error_of(&updater, "shared", "things").unwrap();
        assert_eq!(err.status, ValidationStatus::Conflict);
        assert_eq!(err.message, "domain quota exceeded");
        assert_eq!(err.max_acceptable, Some(10));

        let mut updater = fx.project_updater(&perms);
        updater
            .validate(fx.reports(true), &request(&[("shared", "things", 10, None)]), &AcceptAll)
            .await
            .unwrap();
        assert!(updater.is_valid());
        let accepted = updater.accepted_changes();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].new_value, 10);
    }

    #[tokio::test]
    async fn unchanged_values_are_skipped() {
        let fx = fixture(&default_setup());
        let perms = StaticPermissions::all();
        let mut updater = fx.project_updater(&perms);
        updater
            .validate(
                fx.reports(true),
                &request(&[("shared", "capacity", 20, None), ("shared", "things", 0, None)]),
                &AcceptAll,
            )
            .await
            .unwrap();
        assert!(updater.is_valid());
        assert!(updater.accepted_changes().is_empty());
        assert!(updater.audit_facts(Utc::now(), &Initiator::default()).is_empty());
        assert!(updater.put_error().is_none());
    }

    #[tokio::test]
    async fn lowering_below_usage_is_rejected() {
        let fx = fixture(&default_setup());
        let perms = StaticPermissions::all();
        let mut updater = fx.project_updater(&perms);
        updater
            .validate(fx.reports(true), &request(&[("shared", "capacity", 10, None)]), &AcceptAll)
            .await
            .unwrap();
        let err = error_of(&updater, "shared", "capacity").unwrap();
        assert_eq!(err.message, "quota may not be lower than current usage");
        assert_eq!(err.min_acceptable, Some(15));
        assert_eq!(err.unit, Unit::Bytes);
    }

    #[tokio::test]
    async fn values_are_converted_into_the_resource_unit() {
        let fx = fixture(&default_setup());
        let perms = StaticPermissions::all();
        let mut updater = fx.domain_updater(&perms);
        updater
            .validate(
                fx.reports(false),
                &request(&[
                    ("shared", "capacity", 1, Some(Unit::Kibibytes)),
                    ("shared", "things", 5, Some(Unit::Bytes)),
                ]),
                &AcceptAll,
            )
            .await
            .unwrap();
        let capacity = &updater.requests()["shared"]["capacity"];
        assert_eq!(capacity.new_value, 1024);
        let err = error_of(&updater, "shared", "things").unwrap();
        assert_eq!(err.status, ValidationStatus::UnprocessableEntity);
        assert!(err.message.contains("incompatible"));
    }

    #[tokio::test]
    async fn quota_must_be_settable() {
        let fx = fixture(&default_setup());
        let perms = StaticPermissions::all();
        let mut updater = fx.project_updater(&perms);
        updater
            .validate(
                fx.reports(true),
                &request(&[
                    ("shared", "usage_only", 1, None),
                    ("shared", "external_things", 6, None),
                    ("shared", "missing", 1, None),
                    ("nonexistent", "things", 1, None),
                ]),
                &AcceptAll,
            )
            .await
            .unwrap();
        assert_eq!(
            error_of(&updater, "shared", "usage_only").unwrap().message,
            "resource does not track quota"
        );
        assert_eq!(
            error_of(&updater, "shared", "external_things").unwrap().message,
            "resource is managed externally"
        );
        assert_eq!(error_of(&updater, "shared", "missing").unwrap().message, "no such resource");
        assert_eq!(error_of(&updater, "nonexistent", "things").unwrap().message, "no such service");

        let put = updater.put_error().unwrap();
        assert_eq!(put.status, 422);
        assert_eq!(put.body.lines().count(), 4);
    }

    #[tokio::test]
    async fn lowpriv_raise_is_capped_by_the_configured_limit() {
        let fx = fixture(&default_setup());
        let perms = StaticPermissions {
            raise_lowpriv: true,
            ..StaticPermissions::default()
        };

        let mut updater = fx.project_updater(&perms);
        updater
            .validate(fx.reports(true), &request(&[("shared", "things", 10, None)]), &AcceptAll)
            .await
            .unwrap();
        assert!(updater.is_valid());

        let mut updater = fx.project_updater(&perms);
        updater
            .validate(fx.reports(true), &request(&[("shared", "capacity", 250, None)]), &AcceptAll)
            .await
            .unwrap();
        // 20% of the overcommitted capacity of 1000
        let err = error_of(&updater, "shared", "capacity").unwrap();
        assert_eq!(err.status, ValidationStatus::Forbidden);
        assert_eq!(err.message, "user is not allowed to raise \"shared\" quotas that high in this project");
        assert_eq!(err.max_acceptable, Some(200));

        let put = updater.put_error().unwrap();
        assert_eq!(put.status, 403);
        assert_eq!(
            put.body,
            "cannot change shared/capacity quota: user is not allowed to raise \"shared\" quotas that high in this project (maximum acceptable project quota is 200 B)"
        );

        let metrics = LowPrivilegeRaiseMetrics::new("west");
        updater.record_lowpriv_metrics(&metrics);
        let (svc, res) = (ServiceType::new("shared"), ResourceName::new("capacity"));
        assert_eq!(metrics.get(LimitScope::Project, &svc, &res, false), 1);
    }

    #[tokio::test]
    async fn lowpriv_raise_is_not_available_in_excluded_domains() {
        let fx = fixture(&Setup {
            domain_name: "france",
            ..default_setup()
        });
        let perms = StaticPermissions {
            raise_lowpriv: true,
            ..StaticPermissions::default()
        };
        let mut updater = fx.project_updater(&perms);
        updater
            .validate(fx.reports(true), &request(&[("shared", "things", 5, None)]), &AcceptAll)
            .await
            .unwrap();
        assert_eq!(
            error_of(&updater, "shared", "things").unwrap().message,
            "user is not allowed to raise \"shared\" quotas in this project"
        );
    }

    #[tokio::test]
    async fn lowering_requires_permission() {
        let fx = fixture(&default_setup());
        let perms = StaticPermissions {
            raise: true,
            ..StaticPermissions::default()
        };
        let mut updater = fx.domain_updater(&perms);
        updater
            .validate(fx.reports(false), &request(&[("shared", "capacity", 95, None)]), &AcceptAll)
            .await
            .unwrap();
        assert_eq!(
            error_of(&updater, "shared", "capacity").unwrap().message,
            "user is not allowed to lower \"shared\" quotas in this domain"
        );
    }

    #[tokio::test]
    async fn domain_quota_checks() {
        let fx = fixture(&default_setup());
        let perms = StaticPermissions::all();
        let mut updater = fx.domain_updater(&perms);
        updater
            .validate(
                fx.reports(false),
                &request(&[("shared", "capacity", 40, None), ("shared", "things", 950, None)]),
                &AcceptAll,
            )
            .await
            .unwrap();
        let err = error_of(&updater, "shared", "capacity").unwrap();
        assert_eq!(
            err.message,
            "domain quota may not be smaller than sum of project quotas in that domain"
        );
        assert_eq!(err.min_acceptable, Some(50));

        // other domains hold 200 of the capacity of 1000
        let err = error_of(&updater, "shared", "things").unwrap();
        assert_eq!(err.message, "cluster capacity may not be exceeded for this resource");
        assert_eq!(err.max_acceptable, Some(800));

        let put = updater.put_error().unwrap();
        assert_eq!(put.status, 409);
        assert!(put.body.starts_with("cannot change shared/capacity quota:"));
        assert!(put.body.contains("(minimum acceptable domain quota is 50 B)"));
    }

    #[tokio::test]
    async fn minimum_nonzero_quota_is_enforced() {
        let fx = fixture(&default_setup());
        let perms = StaticPermissions::all();
        let mut updater = fx.domain_updater(&perms);
        updater
            .validate(
                fx.reports(false),
                &request(&[("unshared", "renamed_things", 25, None)]),
                &AcceptAll,
            )
            .await
            .unwrap();
        assert!(updater.is_valid());

        let mut updater = fx.project_updater(&perms);
        updater
            .validate(fx.reports(true), &request(&[("unshared", "renamed_things", 5, None)]), &AcceptAll)
            .await
            .unwrap();
        let err = error_of(&updater, "unshared", "renamed_things").unwrap();
        assert_eq!(err.message, "must allocate at least 10 quota");
        assert_eq!(err.min_acceptable, Some(10));
    }

    #[tokio::test]
    async fn constraints_are_checked_first() {
        let fx = fixture(&default_setup());
        let yaml = "projects:\n  germany/berlin:\n    shared:\n      things: \"at most 5\"\n";
        let constraints = QuotaConstraintSet::from_yaml(&fx.cluster, "test", yaml).unwrap();
        let perms = StaticPermissions::all();
        let mut updater = fx.project_updater(&perms).with_constraints(Some(&constraints));
        updater
            .validate(fx.reports(true), &request(&[("shared", "things", 8, None)]), &AcceptAll)
            .await
            .unwrap();
        let err = error_of(&updater, "shared", "things").unwrap();
        assert_eq!(err.status, ValidationStatus::Conflict);
        assert!(err.message.ends_with(" for this project and resource"));
        assert_eq!(err.max_acceptable, Some(5));
    }

    struct RejectShared;

    #[async_trait::async_trait]
    impl QuotaAcceptanceHook for RejectShared {
        async fn check_project_quotas(
            &self,
            _domain: &Domain,
            _project: &Project,
            service_type: &DbServiceType,
            quotas: &ProjectQuotaValues,
        ) -> Result<(), String> {
            if service_type.as_str() == "shared" && quotas["shared"]["things"] > 3 {
                return Err("too many things".to_owned());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn acceptance_hook_rejects_the_whole_service() {
        let fx = fixture(&default_setup());
        let perms = StaticPermissions::all();
        let mut updater = fx.project_updater(&perms);
        updater
            .validate(
                fx.reports(true),
                &request(&[
                    ("shared", "things", 4, None),
                    ("shared", "capacity", 20, None),
                    ("unshared", "renamed_things", 15, None),
                ]),
                &RejectShared,
            )
            .await
            .unwrap();
        let message = "not acceptable for this project: too many things";
        assert_eq!(error_of(&updater, "shared", "things").unwrap().message, message);
        // unchanged in the request, but still part of the rejected batch
        assert_eq!(error_of(&updater, "shared", "capacity").unwrap().message, message);
        assert!(error_of(&updater, "unshared", "renamed_things").is_none());
        assert!(updater.accepted_changes().is_empty());

        let facts = updater.audit_facts(Utc::now(), &Initiator::default());
        assert_eq!(facts.len(), 3);
        assert!(facts.iter().all(|f| f.status_code == 422));
        let reasons: Vec<&str> = facts.iter().map(|f| f.target.reject_reason()).collect();
        assert!(reasons.contains(&crate::updater::BATCH_REJECTED_REASON));
    }

    #[tokio::test]
    async fn hook_is_skipped_after_earlier_errors() {
        let fx = fixture(&default_setup());
        let perms = StaticPermissions::all();
        let mut updater = fx.project_updater(&perms);
        updater
            .validate(fx.reports(true), &request(&[("shared", "things", 11, None)]), &RejectShared)
            .await
            .unwrap();
        assert_eq!(error_of(&updater, "shared", "things").unwrap().message, "domain quota exceeded");
    }

    #[tokio::test]
    async fn missing_project_report_is_an_error() {
        let fx = fixture(&default_setup());
        let perms = StaticPermissions::all();
        let mut updater = fx.project_updater(&perms);
        let result = updater
            .validate(fx.reports(false), &request(&[("shared", "things", 1, None)]), &AcceptAll)
            .await;
        assert!(matches!(result, Err(UpdateError::MissingProjectReport { .. })));
    }

    #[tokio::test]
    async fn every_configured_resource_needs_a_report() {
        let mut setup = default_setup();
        setup.resources.retain(|(svc, res, _)| (*svc, *res) != ("unshared", "capacity"));
        let fx = fixture(&setup);
        let perms = StaticPermissions::all();
        let mut updater = fx.domain_updater(&perms);
        let result = updater
            .validate(fx.reports(false), &request(&[("shared", "things", 1, None)]), &AcceptAll)
            .await;
        assert!(matches!(
            result,
            Err(UpdateError::MissingReport { level: "cluster", ref service_type, ref resource_name })
                if service_type == "unshared" && resource_name == "capacity"
        ));
    }

    #[tokio::test]
    async fn simulation_report_lists_problems_in_order() {
        let fx = fixture(&default_setup());
        let perms = StaticPermissions::default();
        let mut updater = fx.project_updater(&perms);
        updater
            .validate(
                fx.reports(true),
                &request(&[("unshared", "renamed_things", 30, None), ("shared", "things", 1, None)]),
                &AcceptAll,
            )
            .await
            .unwrap();
        let json = serde_json::to_value(updater.simulation_report()).unwrap();
        assert_eq!(json["success"], false);
        let list = json["unacceptable_resources"].as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["service_type"], "shared");
        assert_eq!(list[0]["status"], 403);
        assert_eq!(list[1]["resource_name"], "renamed_things");

        let mut updater = fx.project_updater(&perms);
        updater
            .validate(fx.reports(true), &QuotaRequest::new(), &AcceptAll)
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_string(&updater.simulation_report()).unwrap(),
            r#"{"success":true}"#
        );
    }

    #[test]
    fn request_body_list_form() {
        let body = r#"[{"type":"shared","resources":[{"name":"capacity","quota":1,"unit":"GiB"},{"name":"things","quota":5}]}]"#;
        let services: Vec<ServiceQuotaRequest> = serde_json::from_str(body).unwrap();
        let request = quota_request_from_services(services);
        let shared = &request["shared"];
        assert_eq!(shared["capacity"].unit, Some(Unit::Gibibytes));
        assert_eq!(shared["things"].value, 5);
        assert_eq!(shared["things"].unit, None);
    }
}
