//! Project-level resource reports, assembled one project at a time.
//!
//! A domain can contain thousands of projects, so reports are not collected
//! in one tree. The caller feeds rows ordered by project UUID into a
//! [`ProjectReportAssembler`], which hands back a [`ProjectReportDraft`]
//! whenever the project changes. The draft may receive the commitment rows
//! of its project before being finalized and sent to the client.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use super::rows::{CommitmentBreakdownRow, ProjectResourceRow};
use super::{
    commitment_balance, is_zero, merge_json_list_into, prune_placeholder_azs, serialize_raw_json,
    serialize_values, AzEntry, CommitmentsByDuration, ReportContext, ResourceInfo, ServiceInfo,
};
use crate::behavior::BurstingMultiplier;
use crate::commitment::{CommitmentConfiguration, CommitmentDuration};
use crate::error::ReportError;
use crate::names::{
    AvailabilityZone, DbServiceType, Domain, LiquidResourceName, Project, ProjectId, QuotaDistributionModel,
    ResourceName, ServiceType,
};
use crate::timeseries::TimeSeries;
use crate::translation::TranslationContext;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectReport {
    #[serde(flatten)]
    pub project: Project,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bursting: Option<ProjectBurstingInfo>,
    #[serde(serialize_with = "serialize_values")]
    pub services: BTreeMap<ServiceType, ProjectServiceReport>,
}

/// Omitted when bursting is not configured for the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProjectBurstingInfo {
    pub enabled: bool,
    pub multiplier: BurstingMultiplier,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectServiceReport {
    #[serde(flatten)]
    pub info: ServiceInfo,
    #[serde(serialize_with = "serialize_values")]
    pub resources: BTreeMap<ResourceName, ProjectResourceReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scraped_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectResourceReport {
    #[serde(flatten)]
    pub info: ResourceInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_distribution_model: Option<QuotaDistributionModel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commitment_config: Option<CommitmentConfiguration>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub per_az: BTreeMap<AvailabilityZone, ProjectAzResourceReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usable_quota: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_quota: Option<u64>,
    pub usage: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub burst_usage: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_usage: Option<u64>,
    /// Negative values mean "infinite".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_quota: Option<i64>,
    #[serde(skip_serializing_if = "String::is_empty", serialize_with = "serialize_raw_json")]
    pub subresources: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectAzResourceReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<u64>,
    #[serde(flatten)]
    pub commitments: CommitmentsByDuration,
    #[serde(skip_serializing_if = "is_zero")]
    pub unused_commitments: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub uncommitted_usage: u64,
    pub usage: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_usage: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub historical_usage: Option<HistoricalUsageReport>,
    #[serde(skip_serializing_if = "String::is_empty", serialize_with = "serialize_raw_json")]
    pub subresources: String,
}

impl AzEntry for ProjectAzResourceReport {
    fn is_empty(&self) -> bool {
        self.quota.unwrap_or(0) == 0
            && self.usage == 0
            && self.physical_usage.unwrap_or(0) == 0
            && self.commitments.is_empty()
            && (self.subresources.is_empty() || self.subresources == "[]")
    }
}

/// Usage extremes over the retention period of the resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoricalUsageReport {
    pub min_usage: u64,
    pub max_usage: u64,
    pub duration: CommitmentDuration,
}

/// A project report whose rows are complete, but which may still receive
/// commitment rows.
#[derive(Debug)]
pub struct ProjectReportDraft<'a> {
    ctx: ReportContext<'a>,
    project_id: ProjectId,
    report: ProjectReport,
}

impl ProjectReportDraft<'_> {
    #[must_use]
    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    /// Whether commitment rows should be queried for this project. They are
    /// only shown in the AZ breakdown.
    #[must_use]
    pub fn needs_commitments(&self) -> bool {
        self.ctx.filter.with_az_breakdown
    }

    pub fn add_commitment_row(&mut self, row: &CommitmentBreakdownRow) {
        let Some((api_service, api_resource)) = self.ctx.nm.map_resource_to_api(&row.service_type, &row.resource_name)
        else {
            return;
        };
        let entry = self
            .report
            .services
            .get_mut(&api_service)
            .and_then(|svc| svc.resources.get_mut(&api_resource))
            .and_then(|res| res.per_az.get_mut(&row.az));
        match entry {
            Some(entry) => entry.commitments.add(row),
            None => debug!(
                project = self.project_id.0,
                service_type = %row.service_type,
                resource = %row.resource_name,
                az = %row.az,
                "dropping commitment row without matching AZ report"
            ),
        }
    }

    /// Computes derived values and prunes placeholder AZs.
    #[must_use]
    pub fn finalize(mut self) -> ProjectReport {
        let has_bursting = self.report.project.has_bursting;
        for service in self.report.services.values_mut() {
            for resource in service.resources.values_mut() {
                if has_bursting {
                    if let Some(quota) = resource.quota {
                        resource.burst_usage = resource.usage.saturating_sub(quota);
                    }
                }
                for az in resource.per_az.values_mut() {
                    let (unused, uncommitted) = commitment_balance(az.commitments.total_committed(), az.usage);
                    az.unused_commitments = unused;
                    az.uncommitted_usage = uncommitted;
                }
                prune_placeholder_azs(&mut resource.per_az);
            }
        }
        self.report
    }
}

/// Folds rows ordered by project UUID into one report per project.
pub struct ProjectReportAssembler<'a> {
    ctx: ReportContext<'a>,
    domain_name: String,
    shells: BTreeMap<ProjectId, Project>,
    current: Option<ProjectReportDraft<'a>>,
    emitted: BTreeSet<ProjectId>,
}

impl<'a> ProjectReportAssembler<'a> {
    /// `projects` are all projects in scope; each one yields exactly one
    /// report, even if no rows arrive for it.
    #[must_use]
    pub fn new(ctx: ReportContext<'a>, domain: &Domain, projects: Vec<Project>) -> Self {
        Self {
            ctx,
            domain_name: domain.name.clone(),
            shells: projects.into_iter().map(|p| (p.id, p)).collect(),
            current: None,
            emitted: BTreeSet::new(),
        }
    }

    /// Folds one row. Returns the previous project's draft when this row
    /// starts a new project.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError`] if a payload cannot be decoded or translated,
    /// or if rows of an already finished project show up again.
    pub fn push_row(&mut self, row: &ProjectResourceRow) -> Result<Option<ProjectReportDraft<'a>>, ReportError> {
        let mut finished = None;
        if self.current.as_ref().is_some_and(|d| d.project_id != row.project_id) {
            finished = self.current.take();
            if let Some(draft) = &finished {
                self.emitted.insert(draft.project_id);
            }
        }

        if self.current.is_none() {
            if self.emitted.contains(&row.project_id) {
                return Err(ReportError::ProjectOutOfOrder {
                    project_id: row.project_id.0,
                });
            }
            let Some(project) = self.shells.remove(&row.project_id) else {
                // created after the project list was read; no complete data
                debug!(project = row.project_id.0, "skipping row of unknown project");
                return Ok(finished);
            };
            self.current = Some(ProjectReportDraft {
                ctx: self.ctx,
                project_id: row.project_id,
                report: empty_report(&self.ctx, project),
            });
        }

        if let Some(draft) = &mut self.current {
            fold_row(&self.ctx, &self.domain_name, &mut draft.report, row)?;
        }
        Ok(finished)
    }

    /// Ends the row stream. Returns the draft of the last project that
    /// received rows, and the reports of all projects that received none,
    /// ordered by UUID.
    #[must_use]
    pub fn finish(self) -> (Option<ProjectReportDraft<'a>>, Vec<ProjectReport>) {
        let mut empty: Vec<ProjectReport> = self
            .shells
            .into_values()
            .map(|project| empty_report(&self.ctx, project))
            .collect();
        empty.sort_by(|a, b| a.project.uuid.cmp(&b.project.uuid));
        (self.current, empty)
    }
}

fn empty_report(ctx: &ReportContext<'_>, project: Project) -> ProjectReport {
    let multiplier = ctx.cluster.bursting_multiplier();
    ProjectReport {
        bursting: (multiplier.0 > 0.0).then_some(ProjectBurstingInfo {
            enabled: project.has_bursting,
            multiplier,
        }),
        project,
        services: BTreeMap::new(),
    }
}

fn fold_row(
    ctx: &ReportContext<'_>,
    domain_name: &str,
    report: &mut ProjectReport,
    row: &ProjectResourceRow,
) -> Result<(), ReportError> {
    let Some((api_service, api_resource)) = ctx.resolve(&row.service_type, &row.resource_name) else {
        return Ok(());
    };
    let scope_name = format!("{domain_name}/{}", report.project.name);
    let has_bursting = report.project.has_bursting;
    let project_id = report.project.id;

    let service = report
        .services
        .entry(api_service.clone())
        .or_insert_with(|| ProjectServiceReport {
            info: ctx.service_info(&row.service_type, &api_service),
            resources: BTreeMap::new(),
            scraped_at: row.scraped_at.map(|t| t.timestamp()),
        });
    let resource = service
        .resources
        .entry(api_resource.clone())
        .or_insert_with(|| new_resource_report(ctx, &scope_name, has_bursting, &api_resource, row));

    let Some(az) = &row.az else {
        // no AZ resources yet
        return Ok(());
    };
    let az_usage = row.az_usage.unwrap_or(0);
    resource.usage += az_usage;
    if let Some(physical_usage) = row.az_physical_usage {
        resource.physical_usage = Some(resource.physical_usage.unwrap_or(0) + physical_usage);
    }

    let mut subresources = String::new();
    if ctx.filter.with_subresources {
        if let Some(input) = &row.az_subresources {
            subresources = translate_subresources(ctx, row, az, input, project_id)?;
            merge_json_list_into(&mut resource.subresources, &subresources);
        }
    }

    if ctx.filter.with_az_breakdown {
        let historical_usage = match row.az_historical_usage.as_deref() {
            None | Some("") => None,
            Some(input) => Some(historical_usage_report(ctx, row, az, input, az_usage)?),
        };
        resource.per_az.insert(
            az.clone(),
            ProjectAzResourceReport {
                quota: if resource.info.no_quota { None } else { row.az_quota },
                usage: az_usage,
                physical_usage: row.az_physical_usage,
                historical_usage,
                subresources,
                ..ProjectAzResourceReport::default()
            },
        );
    }
    Ok(())
}

fn new_resource_report(
    ctx: &ReportContext<'_>,
    scope_name: &str,
    has_bursting: bool,
    api_resource: &ResourceName,
    row: &ProjectResourceRow,
) -> ProjectResourceReport {
    let behavior = ctx
        .cluster
        .behavior_for_resource(&row.service_type, &row.resource_name, scope_name);
    let info = ctx.resource_info(&row.service_type, &row.resource_name, api_resource, &behavior.category);
    let mut report = ProjectResourceReport {
        quota_distribution_model: None,
        commitment_config: behavior.commitment_config(ctx.now),
        per_az: BTreeMap::new(),
        quota: None,
        usable_quota: None,
        max_quota: None,
        usage: 0,
        burst_usage: 0,
        physical_usage: None,
        backend_quota: None,
        subresources: String::new(),
        info,
    };
    if report.info.no_quota {
        return report;
    }

    let qd = ctx
        .cluster
        .quota_distribution_for_resource(&row.service_type, &row.resource_name);
    report.quota_distribution_model = Some(qd.model);
    let Some(quota) = row.quota else {
        return report;
    };
    report.quota = Some(quota);
    report.usable_quota = Some(if has_bursting {
        behavior.max_burst_multiplier.apply_to(quota, qd.model)
    } else {
        quota
    });
    report.max_quota = match (row.max_quota_from_outside_admin, row.max_quota_from_local_admin) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    report.backend_quota = row
        .backend_quota
        .filter(|bq| !u64::try_from(*bq).is_ok_and(|bq| bq == quota));
    report
}

fn translate_subresources(
    ctx: &ReportContext<'_>,
    row: &ProjectResourceRow,
    az: &AvailabilityZone,
    input: &str,
    project_id: ProjectId,
) -> Result<String, ReportError> {
    let rule = ctx.nm.translation_rule(&row.service_type, &row.resource_name);
    let attributes = resource_attributes(ctx, &row.service_type, &row.resource_name);
    rule.translate_subresources(
        input,
        TranslationContext {
            az,
            resource_name: &row.resource_name,
            resource_attributes: &attributes,
        },
    )
    .map_err(|e| ReportError::Translation {
        kind: "subresources",
        service_type: row.service_type.to_string(),
        resource_name: row.resource_name.to_string(),
        az: az.to_string(),
        project: Some(project_id.0),
        reason: e.to_string(),
    })
}

fn resource_attributes(
    ctx: &ReportContext<'_>,
    service_type: &DbServiceType,
    resource_name: &LiquidResourceName,
) -> serde_json::Value {
    ctx.cluster
        .info_for_resource(service_type, resource_name)
        .map(|info| info.attributes.clone())
        .unwrap_or_default()
}

fn historical_usage_report(
    ctx: &ReportContext<'_>,
    row: &ProjectResourceRow,
    az: &AvailabilityZone,
    input: &str,
    fallback: u64,
) -> Result<HistoricalUsageReport, ReportError> {
    let series = TimeSeries::parse(input).map_err(|e| ReportError::HistoricalUsage {
        service_type: row.service_type.to_string(),
        resource_name: row.resource_name.to_string(),
        az: az.to_string(),
        reason: e.to_string(),
    })?;
    let duration = ctx
        .cluster
        .quota_distribution_for_resource(&row.service_type, &row.resource_name)
        .usage_data_retention_period
        .unwrap_or_default();
    Ok(HistoricalUsageReport {
        min_usage: series.min_or(fallback),
        max_usage: series.max_or(fallback),
        duration,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::cluster::testing::test_cluster;
    use crate::filter::Filter;
    use crate::name_mapping::NameMapping;
    use crate::names::DomainId;

    fn domain() -> Domain {
        Domain {
            id: DomainId(1),
            uuid: "uuid-germany".to_owned(),
            name: "germany".to_owned(),
        }
    }

    fn project(id: i64, uuid: &str, has_bursting: bool) -> Project {
        Project {
            id: ProjectId(id),
            domain_id: DomainId(1),
            uuid: uuid.to_owned(),
            name: format!("project-{id}"),
            parent_uuid: "uuid-germany".to_owned(),
            has_bursting,
        }
    }

    fn row(project_id: i64, svc: &str, res: &str, az: &str, quota: u64, usage: u64) -> ProjectResourceRow {
        ProjectResourceRow {
            project_id: ProjectId(project_id),
            service_type: DbServiceType::new(svc),
            resource_name: LiquidResourceName::new(res),
            quota: Some(quota),
            az: Some(AvailabilityZone::new(az)),
            az_quota: Some(quota),
            az_usage: Some(usage),
            az_historical_usage: Some(String::new()),
            backend_quota: i64::try_from(quota).ok(),
            ..ProjectResourceRow::default()
        }
    }

    fn collect(
        asm: &mut ProjectReportAssembler<'_>,
        rows: &[ProjectResourceRow],
        out: &mut Vec<ProjectReport>,
    ) {
        for r in rows {
            if let Some(draft) = asm.push_row(r).unwrap() {
                out.push(draft.finalize());
            }
        }
    }

    #[test]
    fn streams_one_report_per_project_with_empty_shells_last() {
        let cluster = test_cluster();
        let nm = NameMapping::new(&cluster);
        let filter = Filter::default();
        let ctx = ReportContext::new(&cluster, &nm, &filter, Utc::now());
        let projects = vec![
            project(1, "uuid-d", false),
            project(2, "uuid-a", false),
            project(3, "uuid-c", false),
            project(4, "uuid-b", false),
        ];
        let mut asm = ProjectReportAssembler::new(ctx, &domain(), projects);
        let mut out = Vec::new();
        collect(
            &mut asm,
            &[
                row(2, "shared", "things", "any", 10, 2),
                row(2, "shared", "capacity", "az-one", 10, 2),
                row(99, "shared", "things", "any", 10, 2),
                row(1, "shared", "things", "any", 5, 1),
            ],
            &mut out,
        );
        let (last, empty) = asm.finish();
        out.push(last.unwrap().finalize());
        out.extend(empty);

        let uuids: Vec<&str> = out.iter().map(|r| r.project.uuid.as_str()).collect();
        assert_eq!(uuids, ["uuid-a", "uuid-d", "uuid-b", "uuid-c"]);
        assert_eq!(out[0].services["shared"].resources.len(), 2);
        assert!(out[2].services.is_empty());
        assert!(out[0].bursting.is_some_and(|b| !b.enabled));
    }

    #[test]
    fn rows_of_finished_projects_are_rejected() {
        let cluster = test_cluster();
        let nm = NameMapping::new(&cluster);
        let filter = Filter::default();
        let ctx = ReportContext::new(&cluster, &nm, &filter, Utc::now());
        let mut asm =
            ProjectReportAssembler::new(ctx, &domain(), vec![project(1, "uuid-a", false), project(2, "uuid-b", false)]);
        assert!(asm.push_row(&row(1, "shared", "things", "any", 1, 1)).unwrap().is_none());
        assert!(asm.push_row(&row(2, "shared", "things", "any", 1, 1)).unwrap().is_some());
        let err = asm.push_row(&row(1, "shared", "capacity", "any", 1, 1)).unwrap_err();
        assert!(matches!(err, ReportError::ProjectOutOfOrder { project_id: 1 }));
    }

    #[test]
    fn quota_fields_and_bursting() {
        let cluster = test_cluster();
        let nm = NameMapping::new(&cluster);
        let filter = Filter::default();
        let ctx = ReportContext::new(&cluster, &nm, &filter, Utc::now());
        let mut asm = ProjectReportAssembler::new(ctx, &domain(), vec![project(1, "uuid-a", true)]);
        let mut first = row(1, "shared", "things", "az-one", 100, 80);
        first.max_quota_from_outside_admin = Some(300);
        first.max_quota_from_local_admin = Some(200);
        first.backend_quota = Some(-1);
        let mut second = row(1, "shared", "things", "az-two", 100, 30);
        second.az_physical_usage = Some(7);
        let mut out = Vec::new();
        collect(
            &mut asm,
            &[first, second, row(1, "unshared", "capacity", "any", 50, 10)],
            &mut out,
        );
        let (last, _) = asm.finish();
        let report = last.unwrap().finalize();

        // scoped behavior for germany/.* lowers the multiplier to 0.1
        let things = &report.services["shared"].resources["things"];
        assert_eq!(things.quota, Some(100));
        assert_eq!(things.usable_quota, Some(110));
        assert_eq!(things.usage, 110);
        assert_eq!(things.burst_usage, 10);
        assert_eq!(things.max_quota, Some(200));
        assert_eq!(things.backend_quota, Some(-1));
        assert_eq!(things.physical_usage, Some(7));
        assert!(things.per_az.is_empty());

        let capacity = &report.services["unshared"].resources["capacity"];
        assert_eq!(capacity.usable_quota, Some(60));
        assert_eq!(capacity.backend_quota, None);
        assert_eq!(capacity.burst_usage, 0);

        let bursting = report.bursting.unwrap();
        assert!(bursting.enabled);
        assert!((bursting.multiplier.0 - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn az_breakdown_with_history_and_commitments() {
        let cluster = test_cluster();
        let nm = NameMapping::new(&cluster);
        let filter = Filter {
            with_az_breakdown: true,
            ..Filter::default()
        };
        let ctx = ReportContext::new(&cluster, &nm, &filter, Utc::now());
        let mut asm = ProjectReportAssembler::new(ctx, &domain(), vec![project(1, "uuid-a", false)]);
        let mut in_any = row(1, "shared", "capacity", "any", 0, 0);
        in_any.az_quota = Some(0);
        let mut in_one = row(1, "shared", "capacity", "az-one", 10, 6);
        in_one.az_historical_usage = Some(r#"{"t":[1,2,3],"v":[4,9,6]}"#.to_owned());
        let mut in_two = row(1, "shared", "capacity", "az-two", 10, 5);
        in_two.az_historical_usage = Some(r#"{"t":[],"v":[]}"#.to_owned());
        let mut out = Vec::new();
        collect(&mut asm, &[in_any, in_one, in_two], &mut out);
        let (last, _) = asm.finish();
        let mut draft = last.unwrap();
        assert!(draft.needs_commitments());
        draft.add_commitment_row(&CommitmentBreakdownRow {
            service_type: DbServiceType::new("shared"),
            resource_name: LiquidResourceName::new("capacity"),
            az: AvailabilityZone::new("az-one"),
            duration: "1 hour".parse().unwrap(),
            active: 8,
            pending: 0,
            planned: 0,
        });
        let report = draft.finalize();

        let res = &report.services["shared"].resources["capacity"];
        assert_eq!(res.per_az.len(), 2);
        let one = &res.per_az["az-one"];
        assert_eq!(one.commitments.committed["1 hour"], 8);
        assert_eq!(one.unused_commitments, 2);
        assert_eq!(one.uncommitted_usage, 0);
        let history = one.historical_usage.as_ref().unwrap();
        assert_eq!((history.min_usage, history.max_usage), (4, 9));
        let two = &res.per_az["az-two"];
        assert_eq!(two.uncommitted_usage, 5);
        let history = two.historical_usage.as_ref().unwrap();
        assert_eq!((history.min_usage, history.max_usage), (5, 5));
    }

    #[test]
    fn broken_history_aborts_the_report() {
        let cluster = test_cluster();
        let nm = NameMapping::new(&cluster);
        let filter = Filter {
            with_az_breakdown: true,
            ..Filter::default()
        };
        let ctx = ReportContext::new(&cluster, &nm, &filter, Utc::now());
        let mut asm = ProjectReportAssembler::new(ctx, &domain(), vec![project(1, "uuid-a", false)]);
        let mut broken = row(1, "shared", "things", "any", 1, 1);
        broken.az_historical_usage = Some(r#"{"t":[2,1],"v":[1,1]}"#.to_owned());
        let err = asm.push_row(&broken).unwrap_err();
        assert!(matches!(err, ReportError::HistoricalUsage { ref az, .. } if az == "any"));
    }

    #[test]
    fn subresources_are_merged_across_azs() {
        let cluster = test_cluster();
        let nm = NameMapping::new(&cluster);
        let filter = Filter {
            with_subresources: true,
            ..Filter::default()
        };
        let ctx = ReportContext::new(&cluster, &nm, &filter, Utc::now());
        let mut asm = ProjectReportAssembler::new(ctx, &domain(), vec![project(1, "uuid-a", false)]);
        let mut first = row(1, "shared", "things", "az-one", 1, 1);
        first.az_subresources = Some(r#"[{"id":"a"}]"#.to_owned());
        let mut second = row(1, "shared", "things", "az-two", 1, 1);
        second.az_subresources = Some(r#"[{"id":"b"}]"#.to_owned());
        let mut out = Vec::new();
        collect(&mut asm, &[first, second], &mut out);
        let report = asm.finish().0.unwrap().finalize();
        let json = serde_json::to_value(&report).unwrap();
        let subresources = &json["services"][0]["resources"][0]["subresources"];
        assert_eq!(subresources, &serde_json::json!([{"id":"a"},{"id":"b"}]));
        assert_eq!(json["id"], "uuid-a");
        assert_eq!(json["parent_id"], "uuid-germany");
    }

    #[test]
    fn placeholder_with_physical_usage_or_subresources_is_kept() {
        let cluster = test_cluster();
        let nm = NameMapping::new(&cluster);
        let filter = Filter {
            with_az_breakdown: true,
            with_subresources: true,
            ..Filter::default()
        };
        let ctx = ReportContext::new(&cluster, &nm, &filter, Utc::now());
        let mut asm = ProjectReportAssembler::new(ctx, &domain(), vec![project(1, "uuid-a", false)]);
        let mut in_any = row(1, "shared", "things", "any", 0, 0);
        in_any.az_physical_usage = Some(7);
        in_any.az_subresources = Some(r#"[{"id":1}]"#.to_owned());
        let mut in_unknown = row(1, "shared", "things", "unknown", 0, 0);
        in_unknown.az_subresources = Some("[]".to_owned());
        let in_one = row(1, "shared", "things", "west-1", 0, 3);
        let mut out = Vec::new();
        collect(&mut asm, &[in_any, in_unknown, in_one], &mut out);
        let report = asm.finish().0.unwrap().finalize();

        let things = &report.services["shared"].resources["things"];
        assert!(things.per_az.contains_key("any"));
        assert!(!things.per_az.contains_key("unknown"));
        let any = &things.per_az["any"];
        assert_eq!(any.physical_usage, Some(7));
        assert_eq!(any.subresources, r#"[{"id":1}]"#);
    }
}
