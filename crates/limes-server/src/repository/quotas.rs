//! Writes for accepted quota and rate-limit changes.
//!
//! All functions take a connection so that callers can group them in one
//! transaction with the rest of a request.

use sqlx::PgConnection;
use tracing::debug;

use limes_core::names::{Domain, Project};
use limes_core::updater::quota::AcceptedQuotaChange;
use limes_core::updater::rates::AcceptedRateLimit;

use super::to_db_value;
use crate::error::ApiError;

/// Fails if a write for an accepted change touched no row. That happens
/// only if the project service record is missing, i.e. the project has
/// not been discovered by the scrape yet.
fn ensure_written(rows_affected: u64, project: &Project, service_type: &str) -> Result<(), ApiError> {
    if rows_affected == 0 {
        return Err(ApiError::Locked(format!(
            "no {service_type} service record for project {} (please retry in a few seconds after initial scraping is done)",
            project.uuid
        )));
    }
    Ok(())
}

/// Takes a row lock on the domain for the rest of the transaction, so
/// that concurrent quota writes within one domain are validated one after
/// another.
///
/// # Errors
///
/// Returns [`ApiError::NotFound`] if the domain was deleted meanwhile.
pub async fn lock_domain(conn: &mut PgConnection, domain: &Domain) -> Result<(), ApiError> {
    sqlx::query("SELECT id FROM domains WHERE id = $1 FOR UPDATE")
        .bind(domain.id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(())
}

/// Stores new domain quotas, creating service and resource records as
/// needed.
///
/// # Errors
///
/// Returns [`sqlx::Error`] if a statement fails.
pub async fn update_domain_quotas(
    conn: &mut PgConnection,
    domain: &Domain,
    changes: &[AcceptedQuotaChange],
) -> Result<(), sqlx::Error> {
    for change in changes {
        let service_id: i64 = sqlx::query_scalar(
            "INSERT INTO domain_services (domain_id, type) VALUES ($1, $2)
             ON CONFLICT (domain_id, type) DO UPDATE SET type = EXCLUDED.type
             RETURNING id",
        )
        .bind(domain.id)
        .bind(&change.service_type)
        .fetch_one(&mut *conn)
        .await?;

        sqlx::query(
            "INSERT INTO domain_resources (service_id, name, quota) VALUES ($1, $2, $3)
             ON CONFLICT (service_id, name) DO UPDATE SET quota = EXCLUDED.quota",
        )
        .bind(service_id)
        .bind(&change.resource_name)
        .bind(to_db_value(change.new_value))
        .execute(&mut *conn)
        .await?;
    }
    debug!(domain = %domain.uuid, changes = changes.len(), "domain quotas updated");
    Ok(())
}

/// Stores new project quotas, creating resource records as needed.
///
/// # Errors
///
/// Returns [`ApiError::Locked`] if the project service record does not
/// exist yet, or [`ApiError::Internal`] if a statement fails.
pub async fn update_project_quotas(
    conn: &mut PgConnection,
    project: &Project,
    changes: &[AcceptedQuotaChange],
) -> Result<(), ApiError> {
    for change in changes {
        let affected = sqlx::query(
            "INSERT INTO project_resources (service_id, name, quota)
             SELECT ps.id, $4, $3 FROM project_services ps WHERE ps.project_id = $1 AND ps.type = $2
             ON CONFLICT (service_id, name) DO UPDATE SET quota = EXCLUDED.quota",
        )
        .bind(project.id)
        .bind(&change.service_type)
        .bind(to_db_value(change.new_value))
        .bind(&change.resource_name)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        ensure_written(affected, project, change.service_type.as_str())?;
    }
    debug!(project = %project.uuid, changes = changes.len(), "project quotas updated");
    Ok(())
}

/// Stores new project rate limits.
///
/// # Errors
///
/// Returns [`ApiError::Locked`] if the project service record does not
/// exist yet, or [`ApiError::Internal`] if a statement fails.
pub async fn update_project_rate_limits(
    conn: &mut PgConnection,
    project: &Project,
    changes: &[AcceptedRateLimit],
) -> Result<(), ApiError> {
    for change in changes {
        let affected = sqlx::query(
            "INSERT INTO project_rates (service_id, name, rate_limit, window_ns)
             SELECT ps.id, $3, $4, $5 FROM project_services ps WHERE ps.project_id = $1 AND ps.type = $2
             ON CONFLICT (service_id, name) DO UPDATE
               SET rate_limit = EXCLUDED.rate_limit, window_ns = EXCLUDED.window_ns",
        )
        .bind(project.id)
        .bind(&change.service_type)
        .bind(&change.rate_name)
        .bind(to_db_value(change.limit))
        .bind(to_db_value(change.window.as_nanos()))
        .execute(&mut *conn)
        .await?
        .rows_affected();
        ensure_written(affected, project, change.service_type.as_str())?;
    }
    debug!(project = %project.uuid, changes = changes.len(), "project rate limits updated");
    Ok(())
}
