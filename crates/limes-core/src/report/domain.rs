//! Domain-level resource reports.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use super::rows::{CommitmentBreakdownRow, DomainAzRow, DomainResourceRow};
use super::{
    is_zero, merge_max_time, merge_min_time, prune_placeholder_azs, serialize_values, AzEntry,
    CommitmentsByDuration, ReportContext, ResourceInfo, ServiceInfo,
};
use crate::commitment::CommitmentConfiguration;
use crate::names::{
    AvailabilityZone, DbServiceType, Domain, DomainId, LiquidResourceName, QuotaDistributionModel, ResourceName,
    ServiceType,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainReport {
    #[serde(flatten)]
    pub domain: Domain,
    #[serde(serialize_with = "serialize_values")]
    pub services: BTreeMap<ServiceType, DomainServiceReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainServiceReport {
    #[serde(flatten)]
    pub info: ServiceInfo,
    #[serde(serialize_with = "serialize_values")]
    pub resources: BTreeMap<ResourceName, DomainResourceReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_scraped_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_scraped_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainResourceReport {
    #[serde(flatten)]
    pub info: ResourceInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_distribution_model: Option<QuotaDistributionModel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commitment_config: Option<CommitmentConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projects_quota: Option<u64>,
    pub usage: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_usage: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_quota: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub infinite_backend_quota: Option<bool>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub per_az: BTreeMap<AvailabilityZone, DomainAzResourceReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DomainAzResourceReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<u64>,
    pub usage: u64,
    #[serde(flatten)]
    pub commitments: CommitmentsByDuration,
    #[serde(skip_serializing_if = "is_zero")]
    pub unused_commitments: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub uncommitted_usage: u64,
}

impl AzEntry for DomainAzResourceReport {
    fn is_empty(&self) -> bool {
        self.quota.unwrap_or(0) == 0
            && self.usage == 0
            && self.unused_commitments == 0
            && self.commitments.is_empty()
    }
}

/// Builds [`DomainReport`]s for a set of domains. Domains must be announced
/// with [`Self::add_domain`] before their rows arrive; rows for other
/// domains are ignored.
pub struct DomainReportAssembler<'a> {
    ctx: ReportContext<'a>,
    reports: BTreeMap<DomainId, DomainReport>,
}

impl<'a> DomainReportAssembler<'a> {
    #[must_use]
    pub fn new(ctx: ReportContext<'a>) -> Self {
        Self {
            ctx,
            reports: BTreeMap::new(),
        }
    }

    pub fn add_domain(&mut self, domain: Domain) {
        self.reports.insert(
            domain.id,
            DomainReport {
                domain,
                services: BTreeMap::new(),
            },
        );
    }

    pub fn add_resource_row(&mut self, row: &DomainResourceRow) {
        let ctx = self.ctx;
        let Some(report) = self.reports.get_mut(&row.domain_id) else {
            return;
        };
        let Some(service) = find_service(report, &ctx, &row.service_type, &row.resource_name) else {
            return;
        };
        service.max_scraped_at = merge_max_time(service.max_scraped_at, row.max_scraped_at);
        service.min_scraped_at = merge_min_time(service.min_scraped_at, row.min_scraped_at);
        let domain_name = report.domain.name.clone();
        let Some(resource) = find_resource(report, &ctx, &domain_name, &row.service_type, &row.resource_name)
        else {
            return;
        };

        resource.usage = row.usage.unwrap_or(0);
        if row.show_physical_usage.unwrap_or(false) {
            resource.physical_usage = Some(row.physical_usage.unwrap_or(0));
        }
        if resource.info.no_quota {
            return;
        }
        let projects_quota = row.projects_quota.unwrap_or(0);
        resource.projects_quota = Some(projects_quota);
        resource.quota = Some(row.domain_quota.unwrap_or(projects_quota));
        if let Some(backend_quota) = row.backend_quota.filter(|q| *q != projects_quota) {
            resource.backend_quota = Some(backend_quota);
        }
        if row.infinite_backend_quota.unwrap_or(false) {
            resource.infinite_backend_quota = Some(true);
        }
    }

    /// Only used with AZ breakdown.
    pub fn add_az_row(&mut self, row: &DomainAzRow) {
        let ctx = self.ctx;
        if !ctx.filter.with_az_breakdown {
            return;
        }
        let Some(report) = self.reports.get_mut(&row.domain_id) else {
            return;
        };
        let domain_name = report.domain.name.clone();
        if find_service(report, &ctx, &row.service_type, &row.resource_name).is_none() {
            return;
        }
        let Some(resource) = find_resource(report, &ctx, &domain_name, &row.service_type, &row.resource_name)
        else {
            return;
        };
        resource.per_az.insert(
            row.az.clone(),
            DomainAzResourceReport {
                quota: if resource.info.no_quota { None } else { row.quota },
                usage: row.usage,
                commitments: CommitmentsByDuration::default(),
                unused_commitments: row.unused_commitments,
                uncommitted_usage: row.uncommitted_usage,
            },
        );
    }

    pub fn add_commitment_row(&mut self, domain_id: DomainId, row: &CommitmentBreakdownRow) {
        let ctx = self.ctx;
        let Some(report) = self.reports.get_mut(&domain_id) else {
            return;
        };
        let Some((api_service, api_resource)) = ctx.resolve(&row.service_type, &row.resource_name) else {
            return;
        };
        let entry = report
            .services
            .get_mut(&api_service)
            .and_then(|svc| svc.resources.get_mut(&api_resource))
            .and_then(|res| res.per_az.get_mut(&row.az));
        match entry {
            Some(entry) => entry.commitments.add(row),
            None => debug!(
                domain = domain_id.0,
                service_type = %row.service_type,
                resource = %row.resource_name,
                az = %row.az,
                "dropping commitment row without matching AZ report"
            ),
        }
    }

    /// Returns the reports ordered by domain UUID.
    #[must_use]
    pub fn finish(self) -> Vec<DomainReport> {
        let mut reports: Vec<DomainReport> = self.reports.into_values().collect();
        for report in &mut reports {
            for service in report.services.values_mut() {
                for resource in service.resources.values_mut() {
                    prune_placeholder_azs(&mut resource.per_az);
                }
            }
        }
        reports.sort_by(|a, b| a.domain.uuid.cmp(&b.domain.uuid));
        reports
    }
}

fn find_service<'r>(
    report: &'r mut DomainReport,
    ctx: &ReportContext<'_>,
    service_type: &DbServiceType,
    resource_name: &LiquidResourceName,
) -> Option<&'r mut DomainServiceReport> {
    let (api_service, _) = ctx.resolve(service_type, resource_name)?;
    Some(
        report
            .services
            .entry(api_service.clone())
            .or_insert_with(|| DomainServiceReport {
                info: ctx.service_info(service_type, &api_service),
                resources: BTreeMap::new(),
                max_scraped_at: None,
                min_scraped_at: None,
            }),
    )
}

fn find_resource<'r>(
    report: &'r mut DomainReport,
    ctx: &ReportContext<'_>,
    domain_name: &str,
    service_type: &DbServiceType,
    resource_name: &LiquidResourceName,
) -> Option<&'r mut DomainResourceReport> {
    let (api_service, api_resource) = ctx.resolve(service_type, resource_name)?;
    let service = report.services.get_mut(&api_service)?;
    Some(service.resources.entry(api_resource.clone()).or_insert_with(|| {
        let behavior = ctx.cluster.behavior_for_resource(service_type, resource_name, domain_name);
        let info = ctx.resource_info(service_type, resource_name, &api_resource, &behavior.category);
        let (quota_distribution_model, quota) = if info.no_quota {
            (None, None)
        } else {
            let qd = ctx.cluster.quota_distribution_for_resource(service_type, resource_name);
            (Some(qd.model), Some(0))
        };
        DomainResourceReport {
            info,
            quota_distribution_model,
            commitment_config: behavior.commitment_config(ctx.now),
            quota,
            projects_quota: None,
            usage: 0,
            physical_usage: None,
            backend_quota: None,
            infinite_backend_quota: None,
            per_az: BTreeMap::new(),
        }
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::cluster::testing::test_cluster;
    use crate::filter::Filter;
    use crate::name_mapping::NameMapping;

    fn domain(id: i64, uuid: &str, name: &str) -> Domain {
        Domain {
            id: DomainId(id),
            uuid: uuid.to_owned(),
            name: name.to_owned(),
        }
    }

    fn resource_row(domain_id: i64, svc: &str, res: &str) -> DomainResourceRow {
        DomainResourceRow {
            domain_id: DomainId(domain_id),
            service_type: DbServiceType::new(svc),
            resource_name: LiquidResourceName::new(res),
            ..DomainResourceRow::default()
        }
    }

    fn az_row(svc: &str, res: &str, az: &str, quota: Option<u64>, usage: u64) -> DomainAzRow {
        DomainAzRow {
            domain_id: DomainId(1),
            service_type: DbServiceType::new(svc),
            resource_name: LiquidResourceName::new(res),
            az: AvailabilityZone::new(az),
            quota,
            usage,
            unused_commitments: 0,
            uncommitted_usage: usage,
        }
    }

    #[test]
    fn quota_falls_back_to_projects_quota() {
        let cluster = test_cluster();
        let nm = NameMapping::new(&cluster);
        let filter = Filter::default();
        let mut asm = DomainReportAssembler::new(ReportContext::new(&cluster, &nm, &filter, Utc::now()));
        asm.add_domain(domain(2, "uuid-b", "germany"));
        asm.add_domain(domain(1, "uuid-a", "france"));
        asm.add_resource_row(&DomainResourceRow {
            domain_quota: Some(100),
            projects_quota: Some(90),
            usage: Some(12),
            backend_quota: Some(90),
            ..resource_row(1, "shared", "things")
        });
        asm.add_resource_row(&DomainResourceRow {
            projects_quota: Some(30),
            usage: Some(5),
            backend_quota: Some(25),
            infinite_backend_quota: Some(true),
            physical_usage: Some(3),
            show_physical_usage: Some(true),
            ..resource_row(2, "shared", "things")
        });
        asm.add_resource_row(&resource_row(3, "shared", "things"));
        let reports = asm.finish();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].domain.uuid, "uuid-a");
        let a = &reports[0].services["shared"].resources["things"];
        assert_eq!(a.quota, Some(100));
        assert_eq!(a.projects_quota, Some(90));
        assert_eq!(a.usage, 12);
        assert_eq!(a.backend_quota, None);
        assert_eq!(a.physical_usage, None);

        let b = &reports[1].services["shared"].resources["things"];
        assert_eq!(b.quota, Some(30));
        assert_eq!(b.backend_quota, Some(25));
        assert_eq!(b.infinite_backend_quota, Some(true));
        assert_eq!(b.physical_usage, Some(3));
    }

    #[test]
    fn usage_only_resources_carry_no_quota() {
        let cluster = test_cluster();
        let nm = NameMapping::new(&cluster);
        let filter = Filter::default();
        let mut asm = DomainReportAssembler::new(ReportContext::new(&cluster, &nm, &filter, Utc::now()));
        asm.add_domain(domain(1, "uuid-a", "france"));
        asm.add_resource_row(&DomainResourceRow {
            projects_quota: Some(30),
            usage: Some(7),
            ..resource_row(1, "shared", "usage_only")
        });
        let reports = asm.finish();
        let res = &reports[0].services["shared"].resources["usage_only"];
        assert_eq!(res.quota, None);
        assert_eq!(res.projects_quota, None);
        assert_eq!(res.usage, 7);

        let json = serde_json::to_value(&reports[0]).unwrap();
        assert_eq!(json["id"], "uuid-a");
        assert_eq!(json["name"], "france");
        assert!(json["services"][0]["resources"][0].get("quota").is_none());
    }

    #[test]
    fn az_breakdown_prunes_placeholders_and_attaches_commitments() {
        let cluster = test_cluster();
        let nm = NameMapping::new(&cluster);
        let filter = Filter {
            with_az_breakdown: true,
            ..Filter::default()
        };
        let mut asm = DomainReportAssembler::new(ReportContext::new(&cluster, &nm, &filter, Utc::now()));
        asm.add_domain(domain(1, "uuid-a", "france"));
        asm.add_resource_row(&DomainResourceRow {
            projects_quota: Some(10),
            usage: Some(4),
            ..resource_row(1, "shared", "capacity")
        });
        asm.add_az_row(&az_row("shared", "capacity", "any", Some(0), 0));
        asm.add_az_row(&az_row("shared", "capacity", "unknown", None, 0));
        asm.add_az_row(&az_row("shared", "capacity", "az-one", Some(10), 4));
        asm.add_commitment_row(
            DomainId(1),
            &CommitmentBreakdownRow {
                service_type: DbServiceType::new("shared"),
                resource_name: LiquidResourceName::new("capacity"),
                az: AvailabilityZone::new("az-one"),
                duration: "1 hour".parse().unwrap(),
                active: 0,
                pending: 2,
                planned: 0,
            },
        );
        let reports = asm.finish();
        let res = &reports[0].services["shared"].resources["capacity"];
        assert_eq!(res.per_az.len(), 1);
        let az = &res.per_az["az-one"];
        assert_eq!(az.quota, Some(10));
        assert_eq!(az.uncommitted_usage, 4);
        assert_eq!(az.commitments.pending_commitments["1 hour"], 2);
    }

    #[test]
    fn placeholder_with_commitments_is_kept() {
        let cluster = test_cluster();
        let nm = NameMapping::new(&cluster);
        let filter = Filter {
            with_az_breakdown: true,
            ..Filter::default()
        };
        let mut asm = DomainReportAssembler::new(ReportContext::new(&cluster, &nm, &filter, Utc::now()));
        asm.add_domain(domain(1, "uuid-a", "germany"));
        asm.add_resource_row(&resource_row(1, "shared", "capacity"));
        asm.add_az_row(&az_row("shared", "capacity", "any", Some(0), 0));
        asm.add_az_row(&az_row("shared", "capacity", "az-one", Some(5), 2));
        asm.add_commitment_row(
            DomainId(1),
            &CommitmentBreakdownRow {
                service_type: DbServiceType::new("shared"),
                resource_name: LiquidResourceName::new("capacity"),
                az: AvailabilityZone::any(),
                duration: "1 hour".parse().unwrap(),
                active: 0,
                pending: 0,
                planned: 3,
            },
        );
        let reports = asm.finish();
        let res = &reports[0].services["shared"].resources["capacity"];
        assert_eq!(res.per_az.len(), 2);
        assert_eq!(res.per_az["any"].commitments.planned_commitments["1 hour"], 3);
    }
}
