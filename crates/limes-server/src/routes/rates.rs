//! Project rate report and rate-limit routes.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::info;

use limes_core::filter::Filter;
use limes_core::report::ReportContext;
use limes_core::report::rates::ProjectRatesReport;
use limes_core::updater::rates::{RateLimitUpdater, ServiceRateLimitRequest, rate_limit_request_from_services};

use super::{PutMode, SharedState, dispatch_audit, report_filter, stream_list, wrapped};
use crate::error::ApiError;
use crate::middleware::Identity;
use crate::policy::Target;
use crate::repository::{quotas, reports};
use crate::state::AppState;

/// Request body for rate-limit changes.
#[derive(Debug, Deserialize)]
pub struct ProjectRatesBody {
    pub project: ServiceRateList,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServiceRateList {
    #[serde(default)]
    pub services: Vec<ServiceRateLimitRequest>,
}

/// Build the rates router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/rates/v1/domains/{domain_id}/projects", get(list_project_rates))
        .route(
            "/rates/v1/domains/{domain_id}/projects/{project_id}",
            get(get_project_rates).put(put_project_rates),
        )
        .route(
            "/rates/v1/domains/{domain_id}/projects/{project_id}/simulate-put",
            post(simulate_put_project_rates),
        )
}

/// `GET /rates/v1/domains/{domain_id}/projects`: streamed rate reports.
async fn list_project_rates(
    State(state): State<SharedState>,
    Extension(identity): Extension<Identity>,
    Path(domain_uuid): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state.policy.require("project:list", &identity, Target::domain(&domain_uuid))?;
    let domain = {
        let mut conn = state.pool.acquire().await?;
        reports::find_domain(&mut conn, &domain_uuid).await?
    };
    let filter = report_filter(&state, &identity, &query, &headers);

    stream_list("projects", move |mut sink: mpsc::Sender<ProjectRatesReport>| async move {
        let mut conn = state.pool.acquire().await?;
        let ctx = ReportContext::new(&state.cluster, &state.nm, &filter, Utc::now());
        reports::project_rates_reports(&mut conn, ctx, &domain, None, &mut sink).await
    })
    .await
}

/// `GET /rates/v1/domains/{domain_id}/projects/{project_id}`
async fn get_project_rates(
    State(state): State<SharedState>,
    Extension(identity): Extension<Identity>,
    Path((domain_uuid, project_uuid)): Path<(String, String)>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state
        .policy
        .require("project:show", &identity, Target::project(&domain_uuid, &project_uuid))?;
    let mut conn = state.pool.acquire().await?;
    let domain = reports::find_domain(&mut conn, &domain_uuid).await?;
    let project = reports::find_project(&mut conn, &domain, &project_uuid).await?;
    let filter = report_filter(&state, &identity, &query, &headers);
    let ctx = ReportContext::new(&state.cluster, &state.nm, &filter, Utc::now());
    let report = reports::project_rates_report(&mut conn, ctx, &domain, &project).await?;
    Ok(wrapped("project", report))
}

/// `PUT /rates/v1/domains/{domain_id}/projects/{project_id}`: set rate
/// limits.
async fn put_project_rates(
    State(state): State<SharedState>,
    Extension(identity): Extension<Identity>,
    Path((domain_uuid, project_uuid)): Path<(String, String)>,
    Json(body): Json<ProjectRatesBody>,
) -> Result<Response, ApiError> {
    put_or_simulate(&state, &identity, (&domain_uuid, &project_uuid), body, PutMode::Apply).await
}

/// `POST /rates/v1/domains/{domain_id}/projects/{project_id}/simulate-put`
async fn simulate_put_project_rates(
    State(state): State<SharedState>,
    Extension(identity): Extension<Identity>,
    Path((domain_uuid, project_uuid)): Path<(String, String)>,
    Json(body): Json<ProjectRatesBody>,
) -> Result<Response, ApiError> {
    put_or_simulate(&state, &identity, (&domain_uuid, &project_uuid), body, PutMode::Simulate).await
}

async fn put_or_simulate(
    state: &AppState,
    identity: &Identity,
    (domain_uuid, project_uuid): (&str, &str),
    body: ProjectRatesBody,
    mode: PutMode,
) -> Result<Response, ApiError> {
    state
        .policy
        .require("project:show", identity, Target::project(domain_uuid, project_uuid))?;
    let mut tx = state.pool.begin().await?;
    let domain = reports::find_domain(&mut tx, domain_uuid).await?;
    quotas::lock_domain(&mut tx, &domain).await?;
    let project = reports::find_project(&mut tx, &domain, project_uuid).await?;
    let request = rate_limit_request_from_services(body.project.services);

    let now = Utc::now();
    let filter = Filter::default();
    let ctx = ReportContext::new(&state.cluster, &state.nm, &filter, now);
    let report = reports::project_rates_report(&mut tx, ctx, &domain, &project).await?;

    let permissions = state
        .policy
        .quota_permissions(identity, "project", Target::project(&domain.uuid, &project.uuid));
    let mut updater = RateLimitUpdater::new(&state.cluster, &state.nm, &domain, &project, &permissions);
    updater.validate(&report, &request);

    if mode == PutMode::Simulate {
        tx.rollback().await?;
        return Ok(Json(updater.simulation_report()).into_response());
    }

    let facts = updater.audit_facts(now, &identity.initiator());
    if let Some(rejection) = updater.put_error() {
        tx.rollback().await?;
        dispatch_audit(state, &facts).await;
        return Err(ApiError::PutRejected(rejection));
    }

    let changes = updater.accepted_changes();
    quotas::update_project_rate_limits(&mut tx, &project, &changes).await?;
    tx.commit().await?;

    dispatch_audit(state, &facts).await;
    info!(
        domain = %domain.uuid,
        project = %project.uuid,
        user = %identity.user_id,
        changes = changes.len(),
        "project rate limits updated"
    );
    Ok(StatusCode::ACCEPTED.into_response())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn request_body_parses_rate_limits() {
        let body: ProjectRatesBody = serde_json::from_str(
            r#"{"project":{"services":[{"type":"shared","rates":[{"name":"objects:create","limit":10,"window":"1m"}]}]}}"#,
        )
        .unwrap();
        let request = rate_limit_request_from_services(body.project.services);
        let limit = request.values().next().unwrap().values().next().unwrap();
        assert_eq!(limit.limit, 10);
        assert_eq!(limit.window.as_nanos(), 60_000_000_000);
    }
}
