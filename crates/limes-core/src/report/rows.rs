//! Typed result rows of the report queries.
//!
//! Column types mirror the queries: aggregates over outer joins are
//! nullable, hence the many `Option`s.

use chrono::{DateTime, Utc};

use crate::commitment::CommitmentDuration;
use crate::names::{AvailabilityZone, DbServiceType, DomainId, LiquidRateName, LiquidResourceName, ProjectId};
use crate::window::Window;

/// Usage and commitment sums of one resource in one AZ, across all projects.
#[derive(Debug, Clone, Default)]
pub struct ClusterUsageRow {
    pub service_type: DbServiceType,
    pub resource_name: LiquidResourceName,
    pub az: Option<AvailabilityZone>,
    pub usage: Option<u64>,
    pub physical_usage: Option<u64>,
    pub show_physical_usage: Option<bool>,
    pub unused_commitments: Option<u64>,
    pub uncommitted_usage: Option<u64>,
    pub min_scraped_at: Option<DateTime<Utc>>,
    pub max_scraped_at: Option<DateTime<Utc>>,
}

/// Sum of project quotas of one resource.
#[derive(Debug, Clone, Default)]
pub struct ClusterQuotaRow {
    pub service_type: DbServiceType,
    pub resource_name: LiquidResourceName,
    pub quota: Option<u64>,
}

/// Capacity of one resource in one AZ.
#[derive(Debug, Clone, Default)]
pub struct ClusterCapacityRow {
    pub service_type: DbServiceType,
    pub resource_name: LiquidResourceName,
    pub az: Option<AvailabilityZone>,
    pub raw_capacity: Option<u64>,
    pub usage: Option<u64>,
    pub subcapacities: Option<String>,
    pub scraped_at: Option<DateTime<Utc>>,
}

/// Commitment sums of one resource in one AZ for one duration.
#[derive(Debug, Clone)]
pub struct CommitmentBreakdownRow {
    pub service_type: DbServiceType,
    pub resource_name: LiquidResourceName,
    pub az: AvailabilityZone,
    pub duration: CommitmentDuration,
    pub active: u64,
    pub pending: u64,
    pub planned: u64,
}

/// Resource totals of one domain.
#[derive(Debug, Clone, Default)]
pub struct DomainResourceRow {
    pub domain_id: DomainId,
    pub service_type: DbServiceType,
    pub resource_name: LiquidResourceName,
    /// Stored domain quota, if any.
    pub domain_quota: Option<u64>,
    pub projects_quota: Option<u64>,
    pub usage: Option<u64>,
    pub backend_quota: Option<u64>,
    pub infinite_backend_quota: Option<bool>,
    pub physical_usage: Option<u64>,
    pub show_physical_usage: Option<bool>,
    pub min_scraped_at: Option<DateTime<Utc>>,
    pub max_scraped_at: Option<DateTime<Utc>>,
}

/// Per-AZ sums of one domain.
#[derive(Debug, Clone, Default)]
pub struct DomainAzRow {
    pub domain_id: DomainId,
    pub service_type: DbServiceType,
    pub resource_name: LiquidResourceName,
    pub az: AvailabilityZone,
    pub quota: Option<u64>,
    pub usage: u64,
    pub unused_commitments: u64,
    pub uncommitted_usage: u64,
}

/// One project resource in one AZ. Rows come ordered by project UUID.
#[derive(Debug, Clone, Default)]
pub struct ProjectResourceRow {
    pub project_id: ProjectId,
    pub service_type: DbServiceType,
    pub scraped_at: Option<DateTime<Utc>>,
    pub resource_name: LiquidResourceName,
    pub quota: Option<u64>,
    pub max_quota_from_outside_admin: Option<u64>,
    pub max_quota_from_local_admin: Option<u64>,
    pub az: Option<AvailabilityZone>,
    pub az_quota: Option<u64>,
    pub az_usage: Option<u64>,
    pub az_physical_usage: Option<u64>,
    pub az_historical_usage: Option<String>,
    pub backend_quota: Option<i64>,
    pub az_subresources: Option<String>,
}

/// Scrape timestamps of one rate across all projects.
#[derive(Debug, Clone, Default)]
pub struct ClusterRateRow {
    pub service_type: DbServiceType,
    pub rate_name: LiquidRateName,
    pub min_scraped_at: Option<DateTime<Utc>>,
    pub max_scraped_at: Option<DateTime<Utc>>,
}

/// One project rate. Rows come ordered by project UUID.
#[derive(Debug, Clone, Default)]
pub struct ProjectRateRow {
    pub project_id: ProjectId,
    pub service_type: DbServiceType,
    pub rates_scraped_at: Option<DateTime<Utc>>,
    pub rate_name: LiquidRateName,
    pub limit: Option<u64>,
    pub window: Option<Window>,
    pub usage_as_bigint: Option<String>,
}

/// A domain whose stored quota is below the sum of its project quotas.
#[derive(Debug, Clone, Default)]
pub struct OvercommittedDomainRow {
    pub domain_uuid: String,
    pub domain_name: String,
    pub service_type: DbServiceType,
    pub resource_name: LiquidResourceName,
    /// `None` if no domain quota is stored; such domains are never
    /// overcommitted.
    pub domain_quota: Option<u64>,
    pub projects_quota: u64,
}

/// A project resource whose usage exceeds its quota.
#[derive(Debug, Clone, Default)]
pub struct OverspentProjectRow {
    pub domain_uuid: String,
    pub domain_name: String,
    pub project_uuid: String,
    pub project_name: String,
    pub service_type: DbServiceType,
    pub resource_name: LiquidResourceName,
    pub quota: u64,
    pub usage: u64,
}

/// A project resource whose backend quota differs from its quota.
#[derive(Debug, Clone, Default)]
pub struct MismatchProjectRow {
    pub domain_uuid: String,
    pub domain_name: String,
    pub project_uuid: String,
    pub project_name: String,
    pub service_type: DbServiceType,
    pub resource_name: LiquidResourceName,
    pub quota: u64,
    pub backend_quota: i64,
}

/// The last failed scrape of one project service.
#[derive(Debug, Clone, Default)]
pub struct ScrapeErrorRow {
    pub domain_uuid: String,
    pub domain_name: String,
    pub project_uuid: String,
    pub project_name: String,
    pub service_type: DbServiceType,
    pub checked_at: Option<DateTime<Utc>>,
    pub message: String,
}
