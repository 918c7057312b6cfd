//! Rate reports for the cluster and for projects.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use super::cluster::CLUSTER_ID;
use super::rows::{ClusterRateRow, ProjectRateRow};
use super::{is_zero, merge_max_time, merge_min_time, serialize_values, ReportContext, ServiceInfo};
use crate::config::RateLimitConfig;
use crate::error::ReportError;
use crate::names::{DbServiceType, LiquidRateName, Project, ProjectId, RateName, ServiceType};
use crate::unit::Unit;
use crate::window::Window;

/// Name and unit of a rate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateInfo {
    pub name: RateName,
    #[serde(skip_serializing_if = "Unit::is_none")]
    pub unit: Unit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterRatesReport {
    pub id: String,
    #[serde(serialize_with = "serialize_values")]
    pub services: BTreeMap<ServiceType, ClusterRateServiceReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterRateServiceReport {
    #[serde(flatten)]
    pub info: ServiceInfo,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", serialize_with = "serialize_values")]
    pub rates: BTreeMap<RateName, ClusterRateReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_scraped_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_scraped_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterRateReport {
    #[serde(flatten)]
    pub info: RateInfo,
    #[serde(skip_serializing_if = "is_zero")]
    pub limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<Window>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectRatesReport {
    #[serde(flatten)]
    pub project: Project,
    #[serde(serialize_with = "serialize_values")]
    pub services: BTreeMap<ServiceType, ProjectRateServiceReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectRateServiceReport {
    #[serde(flatten)]
    pub info: ServiceInfo,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", serialize_with = "serialize_values")]
    pub rates: BTreeMap<RateName, ProjectRateReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scraped_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectRateReport {
    #[serde(flatten)]
    pub info: RateInfo,
    #[serde(skip_serializing_if = "is_zero")]
    pub limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<Window>,
    #[serde(skip_serializing_if = "is_zero")]
    pub default_limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_window: Option<Window>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub usage_as_bigint: String,
}

fn rate_info(ctx: &ReportContext<'_>, service_type: &DbServiceType, rate_name: &LiquidRateName, api_name: &RateName) -> RateInfo {
    RateInfo {
        name: api_name.clone(),
        unit: ctx
            .cluster
            .info_for_rate(service_type, rate_name)
            .map(|info| info.unit)
            .unwrap_or_default(),
    }
}

/// Builds the cluster rate report from per-service scrape timestamps plus
/// the configured global limits.
pub struct ClusterRatesAssembler<'a> {
    ctx: ReportContext<'a>,
    report: ClusterRatesReport,
}

impl<'a> ClusterRatesAssembler<'a> {
    #[must_use]
    pub fn new(ctx: ReportContext<'a>) -> Self {
        Self {
            ctx,
            report: ClusterRatesReport {
                id: CLUSTER_ID.to_owned(),
                services: BTreeMap::new(),
            },
        }
    }

    pub fn add_row(&mut self, row: &ClusterRateRow) {
        if !self.ctx.cluster.has_service(&row.service_type) {
            return;
        }
        let Some((api_service, _)) = self.ctx.nm.map_rate_to_api(&row.service_type, &row.rate_name) else {
            return;
        };
        if !self.ctx.filter.includes_rate_service(&api_service) {
            return;
        }
        let service = self.service_entry(&row.service_type, api_service);
        service.max_scraped_at = merge_max_time(service.max_scraped_at, row.max_scraped_at);
        service.min_scraped_at = merge_min_time(service.min_scraped_at, row.min_scraped_at);
    }

    #[must_use]
    pub fn finish(mut self) -> ClusterRatesReport {
        let ctx = self.ctx;
        for service in ctx.cluster.services() {
            for limit in &service.rate_limits.global {
                let Some((api_service, api_rate)) = ctx.nm.map_rate_to_api(&service.service_type, &limit.name) else {
                    continue;
                };
                if !ctx.filter.includes_rate_service(&api_service) {
                    continue;
                }
                let entry = self.service_entry(&service.service_type, api_service);
                entry.rates.insert(
                    api_rate.clone(),
                    ClusterRateReport {
                        info: RateInfo {
                            name: api_rate,
                            unit: limit.unit,
                        },
                        limit: limit.limit,
                        window: Some(limit.window),
                    },
                );
            }
        }
        self.report
    }

    fn service_entry(&mut self, service_type: &DbServiceType, api_service: ServiceType) -> &mut ClusterRateServiceReport {
        let ctx = self.ctx;
        self.report
            .services
            .entry(api_service.clone())
            .or_insert_with(|| ClusterRateServiceReport {
                info: ctx.service_info(service_type, &api_service),
                rates: BTreeMap::new(),
                max_scraped_at: None,
                min_scraped_at: None,
            })
    }
}

/// Folds rate rows ordered by project UUID into one report per project.
/// Every report starts out with the project default limits.
pub struct ProjectRatesAssembler<'a> {
    ctx: ReportContext<'a>,
    shells: BTreeMap<ProjectId, Project>,
    current: Option<(ProjectId, ProjectRatesReport)>,
    emitted: BTreeSet<ProjectId>,
}

impl<'a> ProjectRatesAssembler<'a> {
    #[must_use]
    pub fn new(ctx: ReportContext<'a>, projects: Vec<Project>) -> Self {
        Self {
            ctx,
            shells: projects.into_iter().map(|p| (p.id, p)).collect(),
            current: None,
            emitted: BTreeSet::new(),
        }
    }

    /// Folds one row. Returns the previous project's report when this row
    /// starts a new project.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError::ProjectOutOfOrder`] if rows of an already
    /// finished project show up again.
    pub fn push_row(&mut self, row: &ProjectRateRow) -> Result<Option<ProjectRatesReport>, ReportError> {
        let mut finished = None;
        if self.current.as_ref().is_some_and(|(id, _)| *id != row.project_id) {
            if let Some((id, report)) = self.current.take() {
                self.emitted.insert(id);
                finished = Some(report);
            }
        }

        if self.current.is_none() {
            if self.emitted.contains(&row.project_id) {
                return Err(ReportError::ProjectOutOfOrder {
                    project_id: row.project_id.0,
                });
            }
            let Some(project) = self.shells.remove(&row.project_id) else {
                debug!(project = row.project_id.0, "skipping rate row of unknown project");
                return Ok(finished);
            };
            self.current = Some((row.project_id, seeded_report(&self.ctx, project)));
        }

        if let Some((_, report)) = &mut self.current {
            fold_rate_row(&self.ctx, report, row);
        }
        Ok(finished)
    }

    /// Ends the row stream. Returns the last project that received rows,
    /// followed by all projects that received none, ordered by UUID.
    #[must_use]
    pub fn finish(self) -> Vec<ProjectRatesReport> {
        let mut empty: Vec<ProjectRatesReport> = self
            .shells
            .into_values()
            .map(|project| seeded_report(&self.ctx, project))
            .collect();
        empty.sort_by(|a, b| a.project.uuid.cmp(&b.project.uuid));
        self.current.map(|(_, report)| report).into_iter().chain(empty).collect()
    }
}

fn seeded_report(ctx: &ReportContext<'_>, project: Project) -> ProjectRatesReport {
    let mut report = ProjectRatesReport {
        project,
        services: BTreeMap::new(),
    };
    for service in ctx.cluster.services() {
        for limit in &service.rate_limits.project_default {
            seed_default_limit(ctx, &mut report, &service.service_type, limit);
        }
    }
    report
}

fn seed_default_limit(
    ctx: &ReportContext<'_>,
    report: &mut ProjectRatesReport,
    service_type: &DbServiceType,
    limit: &RateLimitConfig,
) {
    let Some((api_service, api_rate)) = ctx.nm.map_rate_to_api(service_type, &limit.name) else {
        return;
    };
    if !ctx.filter.includes_rate_service(&api_service) {
        return;
    }
    let info = rate_info(ctx, service_type, &limit.name, &api_rate);
    project_service_entry(ctx, report, service_type, api_service)
        .rates
        .insert(
            api_rate,
            ProjectRateReport {
                info,
                limit: limit.limit,
                window: Some(limit.window),
                default_limit: 0,
                default_window: None,
                usage_as_bigint: String::new(),
            },
        );
}

fn project_service_entry<'r>(
    ctx: &ReportContext<'_>,
    report: &'r mut ProjectRatesReport,
    service_type: &DbServiceType,
    api_service: ServiceType,
) -> &'r mut ProjectRateServiceReport {
    report
        .services
        .entry(api_service.clone())
        .or_insert_with(|| ProjectRateServiceReport {
            info: ctx.service_info(service_type, &api_service),
            rates: BTreeMap::new(),
            scraped_at: None,
        })
}

fn fold_rate_row(ctx: &ReportContext<'_>, report: &mut ProjectRatesReport, row: &ProjectRateRow) {
    if !ctx.cluster.has_service(&row.service_type) {
        return;
    }
    let Some((api_service, api_rate)) = ctx.nm.map_rate_to_api(&row.service_type, &row.rate_name) else {
        return;
    };
    if !ctx.filter.includes_rate_service(&api_service) {
        return;
    }

    let service = project_service_entry(ctx, report, &row.service_type, api_service);
    if let Some(scraped_at) = row.rates_scraped_at {
        service.scraped_at = Some(scraped_at.timestamp());
    }

    let usage = row.usage_as_bigint.as_deref().unwrap_or_default();
    if !service.rates.contains_key(&api_rate)
        && !usage.is_empty()
        && ctx.cluster.has_usage_for_rate(&row.service_type, &row.rate_name)
    {
        let info = rate_info(ctx, &row.service_type, &row.rate_name, &api_rate);
        service.rates.insert(
            api_rate.clone(),
            ProjectRateReport {
                info,
                limit: 0,
                window: None,
                default_limit: 0,
                default_window: None,
                usage_as_bigint: String::new(),
            },
        );
    }
    let Some(rate) = service.rates.get_mut(&api_rate) else {
        return;
    };

    usage.clone_into(&mut rate.usage_as_bigint);
    // custom limits only override existing defaults
    if let (Some(limit), Some(window)) = (row.limit, row.window) {
        if rate.limit != 0 && (rate.limit != limit || rate.window != Some(window)) {
            rate.default_limit = rate.limit;
            rate.default_window = rate.window;
            rate.limit = limit;
            rate.window = Some(window);
        }
    }
}
