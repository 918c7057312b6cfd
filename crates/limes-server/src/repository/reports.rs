//! Report queries.
//!
//! Each query is written with filter placeholders (see
//! [`limes_core::filter::Filter::prepare_query`]) and an optional
//! `{{WHERE}}` token for scope conditions. Result rows are decoded into the
//! typed rows of `limes_core::report::rows` and folded by the matching
//! assembler, which also applies the exact filter checks.

use std::collections::BTreeMap;
use std::future::Future;

use futures::TryStreamExt;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use tokio::sync::mpsc;

use limes_core::commitment::CommitmentDuration;
use limes_core::error::ReportError;
use limes_core::filter::PreparedQuery;
use limes_core::names::{DbServiceType, Domain, DomainId, LiquidRateName, Project, ProjectId};
use limes_core::report::ReportContext;
use limes_core::report::cluster::{ClusterReport, ClusterReportAssembler};
use limes_core::report::domain::{DomainReport, DomainReportAssembler};
use limes_core::report::inconsistency::{Inconsistencies, InconsistencyCollector};
use limes_core::report::project::{ProjectReport, ProjectReportAssembler, ProjectReportDraft};
use limes_core::report::rates::{ClusterRatesAssembler, ClusterRatesReport, ProjectRatesAssembler, ProjectRatesReport};
use limes_core::report::rows::{
    ClusterCapacityRow, ClusterQuotaRow, ClusterRateRow, ClusterUsageRow, CommitmentBreakdownRow, DomainAzRow,
    DomainResourceRow, MismatchProjectRow, OvercommittedDomainRow, OverspentProjectRow, ProjectRateRow,
    ProjectResourceRow, ScrapeErrorRow,
};
use limes_core::report::scrape_errors::{ScrapeError, group_scrape_errors};
use limes_core::window::Window;

use super::{bind_text_args, get_u64};
use crate::error::ApiError;

const CLUSTER_USAGE_QUERY: &str = r"
    WITH project_commitment_sums AS (
      SELECT az_resource_id, SUM(amount) AS amount
        FROM project_commitments
       WHERE state = 'active'
       GROUP BY az_resource_id
    )
    SELECT ps.type, pr.name, par.az,
           SUM(par.usage)::BIGINT, SUM(COALESCE(par.physical_usage, par.usage))::BIGINT, COUNT(par.physical_usage) > 0,
           SUM(GREATEST(0, COALESCE(pcs.amount, 0) - par.usage))::BIGINT,
           SUM(GREATEST(0, par.usage - COALESCE(pcs.amount, 0)))::BIGINT,
           MIN(ps.scraped_at), MAX(ps.scraped_at)
      FROM project_services ps
      JOIN project_resources pr ON pr.service_id = ps.id {{AND pr.name = $resource_name}}
      LEFT OUTER JOIN project_az_resources par ON par.resource_id = pr.id
      LEFT OUTER JOIN project_commitment_sums pcs ON pcs.az_resource_id = par.id
     WHERE TRUE {{AND ps.type = $service_type}}
     GROUP BY ps.type, pr.name, par.az
";

const CLUSTER_QUOTA_QUERY: &str = r"
    SELECT ps.type, pr.name, SUM(pr.quota)::BIGINT
      FROM project_services ps
      JOIN project_resources pr ON pr.service_id = ps.id {{AND pr.name = $resource_name}}
     WHERE TRUE {{AND ps.type = $service_type}}
     GROUP BY ps.type, pr.name
";

const CLUSTER_CAPACITY_QUERY: &str = r"
    SELECT cs.type, cr.name, car.az, car.raw_capacity, car.usage, car.subcapacities, cc.scraped_at
      FROM cluster_services cs
      JOIN cluster_resources cr ON cr.service_id = cs.id {{AND cr.name = $resource_name}}
      LEFT OUTER JOIN cluster_az_resources car ON car.resource_id = cr.id
      LEFT OUTER JOIN cluster_capacitors cc ON cc.capacitor_id = cr.capacitor_id
     WHERE TRUE {{AND cs.type = $service_type}}
     ORDER BY car.az
";

const CLUSTER_COMMITMENTS_QUERY: &str = r"
    WITH project_commitment_sums AS (
      SELECT az_resource_id, duration,
             COALESCE(SUM(amount) FILTER (WHERE state = 'active'), 0) AS active,
             COALESCE(SUM(amount) FILTER (WHERE state = 'pending'), 0) AS pending,
             COALESCE(SUM(amount) FILTER (WHERE state = 'planned'), 0) AS planned
        FROM project_commitments
       GROUP BY az_resource_id, duration
    )
    SELECT ps.type, pr.name, par.az,
           pcs.duration, SUM(pcs.active)::BIGINT, SUM(pcs.pending)::BIGINT, SUM(pcs.planned)::BIGINT
      FROM project_services ps
      JOIN project_resources pr ON pr.service_id = ps.id {{AND pr.name = $resource_name}}
      JOIN project_az_resources par ON par.resource_id = pr.id
      JOIN project_commitment_sums pcs ON pcs.az_resource_id = par.id
     WHERE TRUE {{AND ps.type = $service_type}}
     GROUP BY ps.type, pr.name, par.az, pcs.duration
";

const CLUSTER_RATES_QUERY: &str = r"
    SELECT ps.type, pra.name, MIN(ps.rates_scraped_at), MAX(ps.rates_scraped_at)
      FROM project_services ps
      JOIN project_rates pra ON pra.service_id = ps.id
     WHERE TRUE {{AND ps.type = $service_type}}
     GROUP BY ps.type, pra.name
";

const DOMAINS_QUERY: &str = "SELECT id, uuid, name FROM domains d WHERE {{WHERE}} ORDER BY d.name";

const DOMAIN_RESOURCES_QUERY: &str = r"
    WITH project_az_sums AS (
      SELECT resource_id,
             SUM(usage) AS usage,
             SUM(COALESCE(physical_usage, usage)) AS physical_usage,
             COUNT(physical_usage) > 0 AS has_physical_usage
        FROM project_az_resources
       GROUP BY resource_id
    )
    SELECT p.domain_id, ps.type, pr.name, MAX(dr.quota), SUM(pr.quota)::BIGINT, SUM(pas.usage)::BIGINT,
           SUM(GREATEST(pr.backend_quota, 0))::BIGINT, MIN(pr.backend_quota) < 0,
           SUM(pas.physical_usage)::BIGINT, BOOL_OR(pas.has_physical_usage),
           MIN(ps.scraped_at), MAX(ps.scraped_at)
      FROM projects p
      JOIN project_services ps ON ps.project_id = p.id {{AND ps.type = $service_type}}
      JOIN project_resources pr ON pr.service_id = ps.id {{AND pr.name = $resource_name}}
      LEFT OUTER JOIN project_az_sums pas ON pas.resource_id = pr.id
      LEFT OUTER JOIN domain_services ds ON ds.domain_id = p.domain_id AND ds.type = ps.type
      LEFT OUTER JOIN domain_resources dr ON dr.service_id = ds.id AND dr.name = pr.name
     WHERE {{WHERE}}
     GROUP BY p.domain_id, ps.type, pr.name
";

const DOMAIN_AZ_QUERY: &str = r"
    WITH project_commitment_sums AS (
      SELECT az_resource_id, SUM(amount) AS amount
        FROM project_commitments
       WHERE state = 'active'
       GROUP BY az_resource_id
    )
    SELECT p.domain_id, ps.type, pr.name, par.az,
           SUM(par.quota)::BIGINT, SUM(par.usage)::BIGINT,
           SUM(GREATEST(0, COALESCE(pcs.amount, 0) - par.usage))::BIGINT,
           SUM(GREATEST(0, par.usage - COALESCE(pcs.amount, 0)))::BIGINT
      FROM projects p
      JOIN project_services ps ON ps.project_id = p.id {{AND ps.type = $service_type}}
      JOIN project_resources pr ON pr.service_id = ps.id {{AND pr.name = $resource_name}}
      JOIN project_az_resources par ON par.resource_id = pr.id
      LEFT OUTER JOIN project_commitment_sums pcs ON pcs.az_resource_id = par.id
     WHERE {{WHERE}}
     GROUP BY p.domain_id, ps.type, pr.name, par.az
";

const DOMAIN_COMMITMENTS_QUERY: &str = r"
    WITH project_commitment_sums AS (
      SELECT az_resource_id, duration,
             COALESCE(SUM(amount) FILTER (WHERE state = 'active'), 0) AS active,
             COALESCE(SUM(amount) FILTER (WHERE state = 'pending'), 0) AS pending,
             COALESCE(SUM(amount) FILTER (WHERE state = 'planned'), 0) AS planned
        FROM project_commitments
       GROUP BY az_resource_id, duration
    )
    SELECT p.domain_id, ps.type, pr.name, par.az,
           pcs.duration, SUM(pcs.active)::BIGINT, SUM(pcs.pending)::BIGINT, SUM(pcs.planned)::BIGINT
      FROM projects p
      JOIN project_services ps ON ps.project_id = p.id {{AND ps.type = $service_type}}
      JOIN project_resources pr ON pr.service_id = ps.id {{AND pr.name = $resource_name}}
      JOIN project_az_resources par ON par.resource_id = pr.id
      JOIN project_commitment_sums pcs ON pcs.az_resource_id = par.id
     WHERE {{WHERE}}
     GROUP BY p.domain_id, ps.type, pr.name, par.az, pcs.duration
";

const PROJECTS_QUERY: &str = r"
    SELECT id, domain_id, uuid, name, parent_uuid, has_bursting
      FROM projects p
     WHERE {{WHERE}}
     ORDER BY p.uuid
";

const PROJECT_RESOURCES_QUERY: &str = r"
    SELECT p.id, ps.type, ps.scraped_at, pr.name, pr.quota, pr.max_quota_from_outside_admin,
           pr.max_quota_from_local_admin, par.az, par.quota, par.usage, par.physical_usage,
           par.historical_usage, pr.backend_quota, par.subresources
      FROM projects p
      JOIN project_services ps ON ps.project_id = p.id {{AND ps.type = $service_type}}
      JOIN project_resources pr ON pr.service_id = ps.id {{AND pr.name = $resource_name}}
      LEFT OUTER JOIN project_az_resources par ON par.resource_id = pr.id
     WHERE {{WHERE}}
     ORDER BY p.uuid, par.az
";

const PROJECT_COMMITMENTS_QUERY: &str = r"
    SELECT p.id, ps.type, pr.name, par.az, pc.duration,
           COALESCE(SUM(pc.amount) FILTER (WHERE pc.state = 'active'), 0)::BIGINT,
           COALESCE(SUM(pc.amount) FILTER (WHERE pc.state = 'pending'), 0)::BIGINT,
           COALESCE(SUM(pc.amount) FILTER (WHERE pc.state = 'planned'), 0)::BIGINT
      FROM projects p
      JOIN project_services ps ON ps.project_id = p.id
      JOIN project_resources pr ON pr.service_id = ps.id
      JOIN project_az_resources par ON par.resource_id = pr.id
      JOIN project_commitments pc ON pc.az_resource_id = par.id
     WHERE {{WHERE}}
     GROUP BY p.id, ps.type, pr.name, par.az, pc.duration
     ORDER BY p.id
";

const PROJECT_RATES_QUERY: &str = r"
    SELECT p.id, ps.type, ps.rates_scraped_at, pra.name, pra.rate_limit, pra.window_ns, pra.usage_as_bigint
      FROM projects p
      JOIN project_services ps ON ps.project_id = p.id {{AND ps.type = $service_type}}
      JOIN project_rates pra ON pra.service_id = ps.id
     WHERE {{WHERE}}
     ORDER BY p.uuid
";

const OVERCOMMITTED_DOMAINS_QUERY: &str = r"
    SELECT d.uuid, d.name, ps.type, pr.name, MAX(dr.quota), SUM(pr.quota)::BIGINT
      FROM domains d
      JOIN projects p ON p.domain_id = d.id
      JOIN project_services ps ON ps.project_id = p.id {{AND ps.type = $service_type}}
      JOIN project_resources pr ON pr.service_id = ps.id {{AND pr.name = $resource_name}}
      JOIN domain_services ds ON ds.domain_id = d.id AND ds.type = ps.type
      JOIN domain_resources dr ON dr.service_id = ds.id AND dr.name = pr.name
     GROUP BY d.uuid, d.name, ps.type, pr.name
    HAVING MAX(dr.quota) < SUM(pr.quota)
     ORDER BY d.name, ps.type, pr.name
";

const OVERSPENT_PROJECTS_QUERY: &str = r"
    SELECT d.uuid, d.name, p.uuid, p.name, ps.type, pr.name, pr.quota, SUM(par.usage)::BIGINT
      FROM projects p
      JOIN domains d ON d.id = p.domain_id
      JOIN project_services ps ON ps.project_id = p.id {{AND ps.type = $service_type}}
      JOIN project_resources pr ON pr.service_id = ps.id {{AND pr.name = $resource_name}}
      JOIN project_az_resources par ON pr.id = par.resource_id
     WHERE pr.quota IS NOT NULL
     GROUP BY d.uuid, d.name, p.uuid, p.name, ps.type, pr.name, pr.quota
    HAVING SUM(par.usage) > pr.quota
     ORDER BY d.name, p.name, ps.type, pr.name
";

const MISMATCH_PROJECTS_QUERY: &str = r"
    SELECT d.uuid, d.name, p.uuid, p.name, ps.type, pr.name, pr.quota, pr.backend_quota
      FROM projects p
      JOIN domains d ON d.id = p.domain_id
      JOIN project_services ps ON ps.project_id = p.id {{AND ps.type = $service_type}}
      JOIN project_resources pr ON pr.service_id = ps.id {{AND pr.name = $resource_name}}
     WHERE pr.quota IS NOT NULL AND pr.backend_quota IS NOT NULL AND pr.backend_quota != pr.quota
     ORDER BY d.name, p.name, ps.type, pr.name
";

const SCRAPE_ERRORS_QUERY: &str = r"
    SELECT d.uuid, d.name, p.uuid, p.name, ps.type, ps.checked_at, ps.scrape_error_message
      FROM projects p
      JOIN domains d ON d.id = p.domain_id
      JOIN project_services ps ON ps.project_id = p.id
     WHERE ps.scrape_error_message != ''
     ORDER BY d.name, p.name, ps.type, ps.scrape_error_message
";

const RATE_SCRAPE_ERRORS_QUERY: &str = r"
    SELECT d.uuid, d.name, p.uuid, p.name, ps.type, ps.rates_checked_at, ps.rates_scrape_error_message
      FROM projects p
      JOIN domains d ON d.id = p.domain_id
      JOIN project_services ps ON ps.project_id = p.id
     WHERE ps.rates_scrape_error_message != ''
     ORDER BY d.name, p.name, ps.type, ps.rates_scrape_error_message
";

/// Where finished project reports go.
pub trait ReportSink<T>: Send {
    /// Accepts one report.
    fn emit(&mut self, report: T) -> impl Future<Output = Result<(), ApiError>> + Send;
}

impl<T: Send> ReportSink<T> for Vec<T> {
    fn emit(&mut self, report: T) -> impl Future<Output = Result<(), ApiError>> + Send {
        self.push(report);
        std::future::ready(Ok(()))
    }
}

impl<T: Send> ReportSink<T> for mpsc::Sender<T> {
    fn emit(&mut self, report: T) -> impl Future<Output = Result<(), ApiError>> + Send {
        async move {
            self.send(report)
                .await
                .map_err(|_| ApiError::Internal("report receiver went away".to_owned()))
        }
    }
}

// ── Row decoding ─────────────────────────────────────────────────────

fn commitment_duration(row: &PgRow, idx: usize) -> Result<CommitmentDuration, ApiError> {
    let text: String = row.try_get(idx)?;
    text.parse()
        .map_err(|e| ApiError::Internal(format!("invalid commitment duration {text:?} in database: {e}")))
}

fn commitment_row(row: &PgRow, offset: usize) -> Result<CommitmentBreakdownRow, ApiError> {
    Ok(CommitmentBreakdownRow {
        service_type: row.try_get(offset)?,
        resource_name: row.try_get(offset + 1)?,
        az: row.try_get(offset + 2)?,
        duration: commitment_duration(row, offset + 3)?,
        active: get_u64(row, offset + 4)?.unwrap_or(0),
        pending: get_u64(row, offset + 5)?.unwrap_or(0),
        planned: get_u64(row, offset + 6)?.unwrap_or(0),
    })
}

fn project_resource_row(row: &PgRow) -> Result<ProjectResourceRow, sqlx::Error> {
    Ok(ProjectResourceRow {
        project_id: row.try_get(0)?,
        service_type: row.try_get(1)?,
        scraped_at: row.try_get(2)?,
        resource_name: row.try_get(3)?,
        quota: get_u64(row, 4)?,
        max_quota_from_outside_admin: get_u64(row, 5)?,
        max_quota_from_local_admin: get_u64(row, 6)?,
        az: row.try_get(7)?,
        az_quota: get_u64(row, 8)?,
        az_usage: get_u64(row, 9)?,
        az_physical_usage: get_u64(row, 10)?,
        az_historical_usage: row.try_get(11)?,
        backend_quota: row.try_get(12)?,
        az_subresources: row.try_get(13)?,
    })
}

fn project_rate_row(row: &PgRow) -> Result<ProjectRateRow, ApiError> {
    let service_type: DbServiceType = row.try_get(1)?;
    let rate_name: LiquidRateName = row.try_get(3)?;
    let window = match row.try_get::<Option<i64>, _>(5)? {
        None => None,
        Some(nanos) => Some(Window::from_nanos(u64::try_from(nanos).map_err(|_| {
            ReportError::InvalidWindow {
                service_type: service_type.to_string(),
                rate_name: rate_name.to_string(),
                reason: format!("negative duration of {nanos} ns"),
            }
        })?)),
    };
    Ok(ProjectRateRow {
        project_id: row.try_get(0)?,
        service_type,
        rates_scraped_at: row.try_get(2)?,
        rate_name,
        limit: get_u64(row, 4)?,
        window,
        usage_as_bigint: row.try_get(6)?,
    })
}

fn scrape_error_row(row: &PgRow) -> Result<ScrapeErrorRow, sqlx::Error> {
    Ok(ScrapeErrorRow {
        domain_uuid: row.try_get(0)?,
        domain_name: row.try_get(1)?,
        project_uuid: row.try_get(2)?,
        project_name: row.try_get(3)?,
        service_type: row.try_get(4)?,
        checked_at: row.try_get(5)?,
        message: row.try_get(6)?,
    })
}

// ── Domains and projects ─────────────────────────────────────────────

/// All domains, by name.
///
/// # Errors
///
/// Returns [`ApiError::Internal`] on database failure.
pub async fn list_domains(conn: &mut PgConnection) -> Result<Vec<Domain>, ApiError> {
    let sql = DOMAINS_QUERY.replace("{{WHERE}}", "TRUE");
    Ok(sqlx::query_as::<_, Domain>(&sql).fetch_all(&mut *conn).await?)
}

/// Looks up a domain by UUID.
///
/// # Errors
///
/// Returns [`ApiError::NotFound`] if there is no such domain.
pub async fn find_domain(conn: &mut PgConnection, uuid: &str) -> Result<Domain, ApiError> {
    sqlx::query_as::<_, Domain>("SELECT id, uuid, name FROM domains WHERE uuid = $1")
        .bind(uuid)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| ApiError::NotFound("no such domain".to_owned()))
}

/// Looks up a project by UUID within a domain.
///
/// # Errors
///
/// Returns [`ApiError::NotFound`] if the domain has no such project.
pub async fn find_project(conn: &mut PgConnection, domain: &Domain, uuid: &str) -> Result<Project, ApiError> {
    sqlx::query_as::<_, Project>(
        "SELECT id, domain_id, uuid, name, parent_uuid, has_bursting FROM projects WHERE domain_id = $1 AND uuid = $2",
    )
    .bind(domain.id)
    .bind(uuid)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| ApiError::NotFound("no such project".to_owned()))
}

async fn list_projects(conn: &mut PgConnection, domain_id: DomainId, project_id: Option<ProjectId>) -> Result<Vec<Project>, ApiError> {
    let condition = if project_id.is_some() { "p.domain_id = $1 AND p.id = $2" } else { "p.domain_id = $1" };
    let sql = PROJECTS_QUERY.replace("{{WHERE}}", condition);
    let mut query = sqlx::query_as::<_, Project>(&sql).bind(domain_id);
    if let Some(id) = project_id {
        query = query.bind(id);
    }
    Ok(query.fetch_all(&mut *conn).await?)
}

// ── Cluster ──────────────────────────────────────────────────────────

/// Resource report for the whole cluster.
///
/// # Errors
///
/// Returns [`ApiError`] on database failure or corrupt stored data.
pub async fn cluster_report(conn: &mut PgConnection, ctx: ReportContext<'_>) -> Result<ClusterReport, ApiError> {
    let mut assembler = ClusterReportAssembler::new(ctx);

    let prepared = ctx.filter.prepare_query(CLUSTER_USAGE_QUERY, ctx.nm);
    for row in bind_text_args(&prepared.sql, &prepared.args).fetch_all(&mut *conn).await? {
        assembler.add_usage_row(&ClusterUsageRow {
            service_type: row.try_get(0)?,
            resource_name: row.try_get(1)?,
            az: row.try_get(2)?,
            usage: get_u64(&row, 3)?,
            physical_usage: get_u64(&row, 4)?,
            show_physical_usage: row.try_get(5)?,
            unused_commitments: get_u64(&row, 6)?,
            uncommitted_usage: get_u64(&row, 7)?,
            min_scraped_at: row.try_get(8)?,
            max_scraped_at: row.try_get(9)?,
        });
    }

    let prepared = ctx.filter.prepare_query(CLUSTER_QUOTA_QUERY, ctx.nm);
    for row in bind_text_args(&prepared.sql, &prepared.args).fetch_all(&mut *conn).await? {
        assembler.add_quota_row(&ClusterQuotaRow {
            service_type: row.try_get(0)?,
            resource_name: row.try_get(1)?,
            quota: get_u64(&row, 2)?,
        });
    }

    let prepared = ctx.filter.prepare_query(CLUSTER_CAPACITY_QUERY, ctx.nm);
    for row in bind_text_args(&prepared.sql, &prepared.args).fetch_all(&mut *conn).await? {
        assembler.add_capacity_row(&ClusterCapacityRow {
            service_type: row.try_get(0)?,
            resource_name: row.try_get(1)?,
            az: row.try_get(2)?,
            raw_capacity: get_u64(&row, 3)?,
            usage: get_u64(&row, 4)?,
            subcapacities: row.try_get(5)?,
            scraped_at: row.try_get(6)?,
        })?;
    }

    if ctx.filter.with_az_breakdown {
        let prepared = ctx.filter.prepare_query(CLUSTER_COMMITMENTS_QUERY, ctx.nm);
        for row in bind_text_args(&prepared.sql, &prepared.args).fetch_all(&mut *conn).await? {
            assembler.add_commitment_row(&commitment_row(&row, 0)?);
        }
    }

    Ok(assembler.finish())
}

/// Rate report for the whole cluster.
///
/// # Errors
///
/// Returns [`ApiError::Internal`] on database failure.
pub async fn cluster_rates_report(conn: &mut PgConnection, ctx: ReportContext<'_>) -> Result<ClusterRatesReport, ApiError> {
    let mut assembler = ClusterRatesAssembler::new(ctx);
    let prepared = ctx.filter.prepare_query(CLUSTER_RATES_QUERY, ctx.nm);
    for row in bind_text_args(&prepared.sql, &prepared.args).fetch_all(&mut *conn).await? {
        assembler.add_row(&ClusterRateRow {
            service_type: row.try_get(0)?,
            rate_name: row.try_get(1)?,
            min_scraped_at: row.try_get(2)?,
            max_scraped_at: row.try_get(3)?,
        });
    }
    Ok(assembler.finish())
}

// ── Domains ──────────────────────────────────────────────────────────

/// Resource reports for all domains, or for the given one.
///
/// # Errors
///
/// Returns [`ApiError`] on database failure or corrupt stored data.
pub async fn domain_reports(
    conn: &mut PgConnection,
    ctx: ReportContext<'_>,
    domain: Option<&Domain>,
) -> Result<Vec<DomainReport>, ApiError> {
    let mut assembler = DomainReportAssembler::new(ctx);
    let conditions: &[&str] = if domain.is_some() { &["p.domain_id"] } else { &[] };

    match domain {
        Some(domain) => assembler.add_domain(domain.clone()),
        None => {
            for domain in list_domains(&mut *conn).await? {
                assembler.add_domain(domain);
            }
        }
    }

    let prepared = ctx
        .filter
        .prepare_query(DOMAIN_RESOURCES_QUERY, ctx.nm)
        .with_conditions(conditions);
    let mut query = bind_text_args(&prepared.sql, &prepared.args);
    if let Some(domain) = domain {
        query = query.bind(domain.id);
    }
    for row in query.fetch_all(&mut *conn).await? {
        assembler.add_resource_row(&DomainResourceRow {
            domain_id: row.try_get(0)?,
            service_type: row.try_get(1)?,
            resource_name: row.try_get(2)?,
            domain_quota: get_u64(&row, 3)?,
            projects_quota: get_u64(&row, 4)?,
            usage: get_u64(&row, 5)?,
            backend_quota: get_u64(&row, 6)?,
            infinite_backend_quota: row.try_get(7)?,
            physical_usage: get_u64(&row, 8)?,
            show_physical_usage: row.try_get(9)?,
            min_scraped_at: row.try_get(10)?,
            max_scraped_at: row.try_get(11)?,
        });
    }

    if ctx.filter.with_az_breakdown {
        let prepared = ctx.filter.prepare_query(DOMAIN_AZ_QUERY, ctx.nm).with_conditions(conditions);
        let mut query = bind_text_args(&prepared.sql, &prepared.args);
        if let Some(domain) = domain {
            query = query.bind(domain.id);
        }
        for row in query.fetch_all(&mut *conn).await? {
            assembler.add_az_row(&DomainAzRow {
                domain_id: row.try_get(0)?,
                service_type: row.try_get(1)?,
                resource_name: row.try_get(2)?,
                az: row.try_get(3)?,
                quota: get_u64(&row, 4)?,
                usage: get_u64(&row, 5)?.unwrap_or(0),
                unused_commitments: get_u64(&row, 6)?.unwrap_or(0),
                uncommitted_usage: get_u64(&row, 7)?.unwrap_or(0),
            });
        }

        let prepared = ctx
            .filter
            .prepare_query(DOMAIN_COMMITMENTS_QUERY, ctx.nm)
            .with_conditions(conditions);
        let mut query = bind_text_args(&prepared.sql, &prepared.args);
        if let Some(domain) = domain {
            query = query.bind(domain.id);
        }
        for row in query.fetch_all(&mut *conn).await? {
            let domain_id: DomainId = row.try_get(0)?;
            assembler.add_commitment_row(domain_id, &commitment_row(&row, 1)?);
        }
    }

    Ok(assembler.finish())
}

/// Resource report for one domain.
///
/// # Errors
///
/// Returns [`ApiError`] on database failure or corrupt stored data.
pub async fn domain_report(conn: &mut PgConnection, ctx: ReportContext<'_>, domain: &Domain) -> Result<DomainReport, ApiError> {
    domain_reports(conn, ctx, Some(domain))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::NotFound("no such domain".to_owned()))
}

// ── Projects ─────────────────────────────────────────────────────────

/// Commitment rows of all projects in scope, by project. Loaded before the
/// row stream starts, so that the stream owns the connection.
type CommitmentsByProject = BTreeMap<ProjectId, Vec<CommitmentBreakdownRow>>;

async fn project_commitments(
    conn: &mut PgConnection,
    domain: &Domain,
    project_id: Option<ProjectId>,
) -> Result<CommitmentsByProject, ApiError> {
    let prepared = PreparedQuery {
        sql: PROJECT_COMMITMENTS_QUERY.to_owned(),
        args: Vec::new(),
    }
    .with_conditions(scope_conditions(project_id));
    let mut query = sqlx::query(&prepared.sql).bind(domain.id);
    if let Some(id) = project_id {
        query = query.bind(id);
    }
    let mut result = CommitmentsByProject::new();
    for row in query.fetch_all(&mut *conn).await? {
        let project_id: ProjectId = row.try_get(0)?;
        result.entry(project_id).or_default().push(commitment_row(&row, 1)?);
    }
    Ok(result)
}

fn scope_conditions(project_id: Option<ProjectId>) -> &'static [&'static str] {
    if project_id.is_some() { &["p.domain_id", "p.id"] } else { &["p.domain_id"] }
}

fn finalize_project_report(mut draft: ProjectReportDraft<'_>, commitments: &mut CommitmentsByProject) -> ProjectReport {
    if draft.needs_commitments() {
        for row in commitments.remove(&draft.project_id()).unwrap_or_default() {
            draft.add_commitment_row(&row);
        }
    }
    draft.finalize()
}

/// Emits one resource report per project of `domain` (or only for
/// `project`) into `sink`, each as soon as it is complete. Projects that
/// have no resource data left after filtering are emitted last.
///
/// # Errors
///
/// Returns [`ApiError`] on database failure, corrupt stored data, or if
/// the sink rejects a report.
pub async fn project_reports(
    conn: &mut PgConnection,
    ctx: ReportContext<'_>,
    domain: &Domain,
    project: Option<&Project>,
    sink: &mut impl ReportSink<ProjectReport>,
) -> Result<(), ApiError> {
    let project_id = project.map(|p| p.id);
    let projects = list_projects(&mut *conn, domain.id, project_id).await?;
    let mut assembler = ProjectReportAssembler::new(ctx, domain, projects);
    let mut commitments = if ctx.filter.with_az_breakdown {
        project_commitments(&mut *conn, domain, project_id).await?
    } else {
        CommitmentsByProject::new()
    };

    // subresources can be large; skip them unless needed
    let base = if ctx.filter.with_subresources {
        PROJECT_RESOURCES_QUERY.to_owned()
    } else {
        PROJECT_RESOURCES_QUERY.replacen("par.subresources", "''", 1)
    };
    let prepared = ctx
        .filter
        .prepare_query(&base, ctx.nm)
        .with_conditions(scope_conditions(project_id));
    let mut query = bind_text_args(&prepared.sql, &prepared.args).bind(domain.id);
    if let Some(id) = project_id {
        query = query.bind(id);
    }

    let mut rows = query.fetch(&mut *conn);
    while let Some(row) = rows.try_next().await? {
        if let Some(draft) = assembler.push_row(&project_resource_row(&row)?)? {
            sink.emit(finalize_project_report(draft, &mut commitments)).await?;
        }
    }

    let (last, empty) = assembler.finish();
    if let Some(draft) = last {
        sink.emit(finalize_project_report(draft, &mut commitments)).await?;
    }
    for report in empty {
        sink.emit(report).await?;
    }
    Ok(())
}

/// Resource report for a single project.
///
/// # Errors
///
/// Returns [`ApiError`] on database failure or corrupt stored data.
pub async fn project_report(
    conn: &mut PgConnection,
    ctx: ReportContext<'_>,
    domain: &Domain,
    project: &Project,
) -> Result<ProjectReport, ApiError> {
    let mut reports = Vec::with_capacity(1);
    project_reports(conn, ctx, domain, Some(project), &mut reports).await?;
    reports
        .pop()
        .ok_or_else(|| ApiError::NotFound("no such project".to_owned()))
}

/// Like [`project_reports`], but for rate data.
///
/// # Errors
///
/// Returns [`ApiError`] on database failure, corrupt stored data, or if
/// the sink rejects a report.
pub async fn project_rates_reports(
    conn: &mut PgConnection,
    ctx: ReportContext<'_>,
    domain: &Domain,
    project: Option<&Project>,
    sink: &mut impl ReportSink<ProjectRatesReport>,
) -> Result<(), ApiError> {
    let project_id = project.map(|p| p.id);
    let projects = list_projects(&mut *conn, domain.id, project_id).await?;
    let mut assembler = ProjectRatesAssembler::new(ctx, projects);

    let prepared = ctx
        .filter
        .prepare_query(PROJECT_RATES_QUERY, ctx.nm)
        .with_conditions(scope_conditions(project_id));
    let mut query = bind_text_args(&prepared.sql, &prepared.args).bind(domain.id);
    if let Some(id) = project_id {
        query = query.bind(id);
    }

    let mut rows = query.fetch(&mut *conn);
    while let Some(row) = rows.try_next().await? {
        if let Some(report) = assembler.push_row(&project_rate_row(&row)?)? {
            sink.emit(report).await?;
        }
    }
    for report in assembler.finish() {
        sink.emit(report).await?;
    }
    Ok(())
}

/// Rate report for a single project.
///
/// # Errors
///
/// Returns [`ApiError`] on database failure or corrupt stored data.
pub async fn project_rates_report(
    conn: &mut PgConnection,
    ctx: ReportContext<'_>,
    domain: &Domain,
    project: &Project,
) -> Result<ProjectRatesReport, ApiError> {
    let mut reports = Vec::with_capacity(1);
    project_rates_reports(conn, ctx, domain, Some(project), &mut reports).await?;
    reports
        .pop()
        .ok_or_else(|| ApiError::NotFound("no such project".to_owned()))
}

// ── Inconsistencies and scrape errors ────────────────────────────────

/// Quota inconsistencies across the whole cluster.
///
/// # Errors
///
/// Returns [`ApiError::Internal`] on database failure.
pub async fn inconsistencies(conn: &mut PgConnection, ctx: ReportContext<'_>) -> Result<Inconsistencies, ApiError> {
    let mut collector = InconsistencyCollector::new(ctx.cluster, ctx.nm);

    let prepared = ctx.filter.prepare_query(OVERCOMMITTED_DOMAINS_QUERY, ctx.nm);
    for row in bind_text_args(&prepared.sql, &prepared.args).fetch_all(&mut *conn).await? {
        collector.add_overcommitted_domain(OvercommittedDomainRow {
            domain_uuid: row.try_get(0)?,
            domain_name: row.try_get(1)?,
            service_type: row.try_get(2)?,
            resource_name: row.try_get(3)?,
            domain_quota: get_u64(&row, 4)?,
            projects_quota: get_u64(&row, 5)?.unwrap_or(0),
        });
    }

    let prepared = ctx.filter.prepare_query(OVERSPENT_PROJECTS_QUERY, ctx.nm);
    for row in bind_text_args(&prepared.sql, &prepared.args).fetch_all(&mut *conn).await? {
        collector.add_overspent_project(OverspentProjectRow {
            domain_uuid: row.try_get(0)?,
            domain_name: row.try_get(1)?,
            project_uuid: row.try_get(2)?,
            project_name: row.try_get(3)?,
            service_type: row.try_get(4)?,
            resource_name: row.try_get(5)?,
            quota: get_u64(&row, 6)?.unwrap_or(0),
            usage: get_u64(&row, 7)?.unwrap_or(0),
        });
    }

    let prepared = ctx.filter.prepare_query(MISMATCH_PROJECTS_QUERY, ctx.nm);
    for row in bind_text_args(&prepared.sql, &prepared.args).fetch_all(&mut *conn).await? {
        collector.add_mismatch_project(MismatchProjectRow {
            domain_uuid: row.try_get(0)?,
            domain_name: row.try_get(1)?,
            project_uuid: row.try_get(2)?,
            project_name: row.try_get(3)?,
            service_type: row.try_get(4)?,
            resource_name: row.try_get(5)?,
            quota: get_u64(&row, 6)?.unwrap_or(0),
            backend_quota: row.try_get(7)?,
        });
    }

    Ok(collector.finish())
}

/// Which scrape a scrape error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeKind {
    Resources,
    Rates,
}

/// Failed scrapes, grouped by service and message.
///
/// # Errors
///
/// Returns [`ApiError::Internal`] on database failure.
pub async fn scrape_errors(
    conn: &mut PgConnection,
    ctx: ReportContext<'_>,
    kind: ScrapeKind,
) -> Result<Vec<ScrapeError>, ApiError> {
    let sql = match kind {
        ScrapeKind::Resources => SCRAPE_ERRORS_QUERY,
        ScrapeKind::Rates => RATE_SCRAPE_ERRORS_QUERY,
    };
    let rows = sqlx::query(sql)
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(scrape_error_row)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(group_scrape_errors(ctx.cluster, rows))
}
