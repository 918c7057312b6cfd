//! Cluster-level resource report.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use super::rows::{ClusterCapacityRow, ClusterQuotaRow, ClusterUsageRow, CommitmentBreakdownRow};
use super::{
    is_zero, merge_json_list_into, merge_max_time, merge_min_time, prune_placeholder_azs,
    serialize_raw_json, serialize_values, AzEntry, CommitmentsByDuration, ReportContext, ResourceInfo,
    ServiceInfo,
};
use crate::commitment::CommitmentConfiguration;
use crate::error::ReportError;
use crate::names::{AvailabilityZone, DbServiceType, LiquidResourceName, QuotaDistributionModel, ResourceName, ServiceType};
use crate::translation::TranslationContext;

/// Kept for API compatibility; there is only one cluster.
pub const CLUSTER_ID: &str = "current";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterReport {
    pub id: String,
    #[serde(serialize_with = "serialize_values")]
    pub services: BTreeMap<ServiceType, ClusterServiceReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_scraped_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_scraped_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterServiceReport {
    #[serde(flatten)]
    pub info: ServiceInfo,
    #[serde(serialize_with = "serialize_values")]
    pub resources: BTreeMap<ResourceName, ClusterResourceReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_scraped_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_scraped_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterResourceReport {
    #[serde(flatten)]
    pub info: ResourceInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_distribution_model: Option<QuotaDistributionModel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commitment_config: Option<CommitmentConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_capacity: Option<u64>,
    #[serde(
        rename = "per_availability_zone",
        skip_serializing_if = "BTreeMap::is_empty",
        serialize_with = "serialize_values"
    )]
    pub capacity_per_az: BTreeMap<AvailabilityZone, ClusterAvailabilityZoneReport>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub per_az: BTreeMap<AvailabilityZone, ClusterAzResourceReport>,
    /// Sum of all project quotas. The name predates project-only quotas.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domains_quota: Option<u64>,
    pub usage: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_usage: Option<u64>,
    #[serde(skip_serializing_if = "String::is_empty", serialize_with = "serialize_raw_json")]
    pub subcapacities: String,
}

/// Legacy per-AZ capacity entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterAvailabilityZoneReport {
    pub name: AvailabilityZone,
    pub capacity: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub raw_capacity: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub usage: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterAzResourceReport {
    pub capacity: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub raw_capacity: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<u64>,
    #[serde(skip_serializing_if = "is_zero")]
    pub projects_usage: u64,
    #[serde(flatten)]
    pub commitments: CommitmentsByDuration,
    #[serde(skip_serializing_if = "is_zero")]
    pub unused_commitments: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub uncommitted_usage: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_usage: Option<u64>,
    #[serde(skip_serializing_if = "String::is_empty", serialize_with = "serialize_raw_json")]
    pub subcapacities: String,
}

impl AzEntry for ClusterAzResourceReport {
    fn is_empty(&self) -> bool {
        self.capacity == 0
            && self.usage.unwrap_or(0) == 0
            && self.projects_usage == 0
            && self.physical_usage.unwrap_or(0) == 0
            && (self.subcapacities.is_empty() || self.subcapacities == "[]")
    }
}

/// Builds a [`ClusterReport`] from the four cluster queries: usage, quota
/// sums, capacity and (with AZ breakdown only) commitments by duration.
pub struct ClusterReportAssembler<'a> {
    ctx: ReportContext<'a>,
    report: ClusterReport,
}

impl<'a> ClusterReportAssembler<'a> {
    #[must_use]
    pub fn new(ctx: ReportContext<'a>) -> Self {
        Self {
            ctx,
            report: ClusterReport {
                id: CLUSTER_ID.to_owned(),
                services: BTreeMap::new(),
                max_scraped_at: None,
                min_scraped_at: None,
            },
        }
    }

    pub fn add_usage_row(&mut self, row: &ClusterUsageRow) {
        let ctx = self.ctx;
        let Some(service) = find_service(&mut self.report, &ctx, &row.service_type, &row.resource_name) else {
            return;
        };
        service.max_scraped_at = merge_max_time(service.max_scraped_at, row.max_scraped_at);
        service.min_scraped_at = merge_min_time(service.min_scraped_at, row.min_scraped_at);
        let Some(resource) = find_resource(service, &ctx, &row.service_type, &row.resource_name) else {
            return;
        };

        let Some(az) = &row.az else {
            return;
        };
        let usage = row.usage.unwrap_or(0);
        let show_physical_usage = row.show_physical_usage.unwrap_or(false);
        resource.usage += usage;
        if show_physical_usage {
            let physical_usage = row.physical_usage.unwrap_or(0);
            resource.physical_usage = Some(resource.physical_usage.unwrap_or(0) + physical_usage);
        }

        if ctx.filter.with_az_breakdown {
            let entry = resource.per_az.entry(az.clone()).or_default();
            entry.projects_usage += usage;
            entry.unused_commitments += row.unused_commitments.unwrap_or(0);
            entry.uncommitted_usage += row.uncommitted_usage.unwrap_or(0);
            if show_physical_usage {
                entry.physical_usage = Some(entry.physical_usage.unwrap_or(0) + row.physical_usage.unwrap_or(0));
            }
        }
    }

    pub fn add_quota_row(&mut self, row: &ClusterQuotaRow) {
        let ctx = self.ctx;
        let Some(service) = find_service(&mut self.report, &ctx, &row.service_type, &row.resource_name) else {
            return;
        };
        let Some(resource) = find_resource(service, &ctx, &row.service_type, &row.resource_name) else {
            return;
        };
        if let Some(quota) = row.quota.filter(|_| !resource.info.no_quota) {
            resource.domains_quota = Some(quota);
        }
    }

    /// # Errors
    ///
    /// Returns [`ReportError::Translation`] if the subcapacities cannot be
    /// translated into their API format.
    pub fn add_capacity_row(&mut self, row: &ClusterCapacityRow) -> Result<(), ReportError> {
        let ctx = self.ctx;
        self.report.max_scraped_at = merge_max_time(self.report.max_scraped_at, row.scraped_at);
        self.report.min_scraped_at = merge_min_time(self.report.min_scraped_at, row.scraped_at);

        let Some(service) = find_service(&mut self.report, &ctx, &row.service_type, &row.resource_name) else {
            return Ok(());
        };
        let Some(resource) = find_resource(service, &ctx, &row.service_type, &row.resource_name) else {
            return Ok(());
        };

        // capacity is computed from the raw sum in finish()
        if let Some(raw) = row.raw_capacity {
            resource.raw_capacity = Some(resource.raw_capacity.unwrap_or(0) + raw);
        }

        let api_service = resource_api_service(&ctx, &row.service_type, &row.resource_name);
        let subcapacities = match (&row.subcapacities, &row.az) {
            (Some(input), Some(az))
                if !input.is_empty()
                    && ctx.filter.is_subcapacity_allowed(&api_service, &resource.info.name) =>
            {
                let translated = translate_subcapacities(&ctx, &row.service_type, &row.resource_name, az, input)?;
                merge_json_list_into(&mut resource.subcapacities, &translated);
                translated
            }
            _ => String::new(),
        };

        let (Some(az), Some(raw_capacity)) = (&row.az, row.raw_capacity) else {
            return Ok(());
        };
        let factor = ctx
            .cluster
            .behavior_for_resource(&row.service_type, &row.resource_name, "")
            .overcommit_factor;
        let capacity = factor.apply_to(raw_capacity);
        let shown_raw_capacity = if capacity == raw_capacity { 0 } else { raw_capacity };
        resource.capacity_per_az.insert(
            az.clone(),
            ClusterAvailabilityZoneReport {
                name: az.clone(),
                capacity,
                raw_capacity: shown_raw_capacity,
                usage: row.usage.unwrap_or(0),
            },
        );

        if ctx.filter.with_az_breakdown {
            let entry = resource.per_az.entry(az.clone()).or_default();
            entry.capacity = capacity;
            entry.raw_capacity = shown_raw_capacity;
            entry.usage = row.usage;
            entry.subcapacities = subcapacities;
        }
        Ok(())
    }

    /// Attaches commitment amounts to AZ entries created by earlier rows.
    /// Rows for unknown AZs are dropped.
    pub fn add_commitment_row(&mut self, row: &CommitmentBreakdownRow) {
        let ctx = self.ctx;
        let Some(service) = find_service(&mut self.report, &ctx, &row.service_type, &row.resource_name) else {
            return;
        };
        let Some(resource) = find_resource(service, &ctx, &row.service_type, &row.resource_name) else {
            return;
        };
        match resource.per_az.get_mut(&row.az) {
            Some(entry) => entry.commitments.add(row),
            None => debug!(
                service_type = %row.service_type,
                resource = %row.resource_name,
                az = %row.az,
                "dropping commitment row without matching AZ report"
            ),
        }
    }

    /// Applies overcommit to the capacity sums and prunes placeholder AZs.
    #[must_use]
    pub fn finish(mut self) -> ClusterReport {
        for (api_service, service) in &mut self.report.services {
            for (api_resource, resource) in &mut service.resources {
                let Some((service_type, resource_name)) =
                    self.ctx.nm.map_resource_from_api(api_service, api_resource)
                else {
                    continue;
                };
                let factor = self
                    .ctx
                    .cluster
                    .behavior_for_resource(&service_type, &resource_name, "")
                    .overcommit_factor;
                resource.capacity = resource.raw_capacity.map(|raw| factor.apply_to(raw));
                if resource.capacity == resource.raw_capacity {
                    resource.raw_capacity = None;
                }

                if resource.capacity_per_az.keys().all(AvailabilityZone::is_any) {
                    resource.capacity_per_az.clear();
                }
                prune_placeholder_azs(&mut resource.per_az);
            }
        }
        self.report
    }
}

fn resource_api_service(
    ctx: &ReportContext<'_>,
    service_type: &DbServiceType,
    resource_name: &LiquidResourceName,
) -> ServiceType {
    ctx.nm
        .map_resource_to_api(service_type, resource_name)
        .map_or_else(|| ServiceType::new(service_type.as_str()), |(svc, _)| svc)
}

fn translate_subcapacities(
    ctx: &ReportContext<'_>,
    service_type: &DbServiceType,
    resource_name: &LiquidResourceName,
    az: &AvailabilityZone,
    input: &str,
) -> Result<String, ReportError> {
    let rule = ctx.nm.translation_rule(service_type, resource_name);
    let attributes = ctx
        .cluster
        .info_for_resource(service_type, resource_name)
        .map(|info| info.attributes.clone())
        .unwrap_or_default();
    rule.translate_subcapacities(
        input,
        TranslationContext {
            az,
            resource_name,
            resource_attributes: &attributes,
        },
    )
    .map_err(|e| ReportError::Translation {
        kind: "subcapacities",
        service_type: service_type.to_string(),
        resource_name: resource_name.to_string(),
        az: az.to_string(),
        project: None,
        reason: e.to_string(),
    })
}

fn find_service<'r>(
    report: &'r mut ClusterReport,
    ctx: &ReportContext<'_>,
    service_type: &DbServiceType,
    resource_name: &LiquidResourceName,
) -> Option<&'r mut ClusterServiceReport> {
    let (api_service, _) = ctx.resolve(service_type, resource_name)?;
    Some(
        report
            .services
            .entry(api_service.clone())
            .or_insert_with(|| ClusterServiceReport {
                info: ctx.service_info(service_type, &api_service),
                resources: BTreeMap::new(),
                max_scraped_at: None,
                min_scraped_at: None,
            }),
    )
}

fn find_resource<'r>(
    service: &'r mut ClusterServiceReport,
    ctx: &ReportContext<'_>,
    service_type: &DbServiceType,
    resource_name: &LiquidResourceName,
) -> Option<&'r mut ClusterResourceReport> {
    let (_, api_resource) = ctx.resolve(service_type, resource_name)?;
    Some(
        service
            .resources
            .entry(api_resource.clone())
            .or_insert_with(|| {
                let behavior = ctx.cluster.behavior_for_resource(service_type, resource_name, "");
                let info = ctx.resource_info(service_type, resource_name, &api_resource, &behavior.category);
                let (quota_distribution_model, domains_quota) = if info.no_quota {
                    (None, None)
                } else {
                    let qd = ctx.cluster.quota_distribution_for_resource(service_type, resource_name);
                    // reported as zero when no project has quota yet
                    (Some(qd.model), Some(0))
                };
                ClusterResourceReport {
                    info,
                    quota_distribution_model,
                    commitment_config: behavior.commitment_config(ctx.now),
                    capacity: None,
                    raw_capacity: None,
                    capacity_per_az: BTreeMap::new(),
                    per_az: BTreeMap::new(),
                    domains_quota,
                    usage: 0,
                    physical_usage: None,
                    subcapacities: String::new(),
                }
            }),
    )
}
