//! Project report and project quota routes.

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
use limes_core::report::project::ProjectReport;
use limes_core::updater::quota::{QuotaReports, QuotaUpdater, quota_request_from_services};

use super::domains::ServiceQuotaList;
use super::{PutMode, SharedState, dispatch_audit, report_filter, stream_list, wrapped};
use crate::error::ApiError;
use crate::middleware::Identity;
use crate::policy::Target;
use crate::repository::{quotas, reports};
use crate::state::AppState;

/// Request body for project quota changes.
#[derive(Debug, Deserialize)]
pub struct ProjectQuotaBody {
    pub project: ServiceQuotaList,
}

/// Build the projects router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/v1/domains/{domain_id}/projects", get(list_projects))
        .route(
            "/v1/domains/{domain_id}/projects/{project_id}",
            get(get_project).put(put_project),
        )
        .route(
            "/v1/domains/{domain_id}/projects/{project_id}/simulate-put",
            post(simulate_put_project),
        )
}

/// `GET /v1/domains/{domain_id}/projects`: resource reports for all
/// projects in a domain, streamed as they are assembled.
async fn list_projects(
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

    stream_list("projects", move |mut sink: mpsc::Sender<ProjectReport>| async move {
        let mut conn = state.pool.acquire().await?;
        let ctx = ReportContext::new(&state.cluster, &state.nm, &filter, Utc::now());
        reports::project_reports(&mut conn, ctx, &domain, None, &mut sink).await
    })
    .await
}

/// `GET /v1/domains/{domain_id}/projects/{project_id}`: resource report
/// for one project.
async fn get_project(
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
    let report = reports::project_report(&mut conn, ctx, &domain, &project).await?;
    Ok(wrapped("project", report))
}

/// `PUT /v1/domains/{domain_id}/projects/{project_id}`: set project quotas.
async fn put_project(
    State(state): State<SharedState>,
    Extension(identity): Extension<Identity>,
    Path((domain_uuid, project_uuid)): Path<(String, String)>,
    Json(body): Json<ProjectQuotaBody>,
) -> Result<Response, ApiError> {
    put_or_simulate(&state, &identity, (&domain_uuid, &project_uuid), body, PutMode::Apply).await
}

/// `POST /v1/domains/{domain_id}/projects/{project_id}/simulate-put`
async fn simulate_put_project(
    State(state): State<SharedState>,
    Extension(identity): Extension<Identity>,
    Path((domain_uuid, project_uuid)): Path<(String, String)>,
    Json(body): Json<ProjectQuotaBody>,
) -> Result<Response, ApiError> {
    put_or_simulate(&state, &identity, (&domain_uuid, &project_uuid), body, PutMode::Simulate).await
}

async fn put_or_simulate(
    state: &AppState,
    identity: &Identity,
    (domain_uuid, project_uuid): (&str, &str),
    body: ProjectQuotaBody,
    mode: PutMode,
) -> Result<Response, ApiError> {
    state
        .policy
        .require("project:show", identity, Target::project(domain_uuid, project_uuid))?;
    // validation and write see the same state; concurrent writers to
    // this domain wait on the row lock
    let mut tx = state.pool.begin().await?;
    let domain = reports::find_domain(&mut tx, domain_uuid).await?;
    quotas::lock_domain(&mut tx, &domain).await?;
    let project = reports::find_project(&mut tx, &domain, project_uuid).await?;
    let request = quota_request_from_services(body.project.services);

    let now = Utc::now();
    let filter = Filter::default();
    let ctx = ReportContext::new(&state.cluster, &state.nm, &filter, now);
    let cluster_report = reports::cluster_report(&mut tx, ctx).await?;
    let domain_report = reports::domain_report(&mut tx, ctx, &domain).await?;
    let project_report = reports::project_report(&mut tx, ctx, &domain, &project).await?;

    let permissions = state
        .policy
        .quota_permissions(identity, "project", Target::project(&domain.uuid, &project.uuid));
    let mut updater = QuotaUpdater::new(&state.cluster, &state.nm, &domain, Some(&project), &permissions)
        .with_constraints(state.constraints.as_deref());
    let reports = QuotaReports {
        cluster: &cluster_report,
        domain: &domain_report,
        project: Some(&project_report),
    };
    updater
        .validate(reports, &request, state.acceptance_hook.as_ref())
        .await?;

    if mode == PutMode::Simulate {
        tx.rollback().await?;
        return Ok(Json(updater.simulation_report()).into_response());
    }

    let facts = updater.audit_facts(now, &identity.initiator());
    if let Some(rejection) = updater.put_error() {
        tx.rollback().await?;
        dispatch_audit(state, &facts).await;
        updater.record_lowpriv_metrics(&state.lowpriv_metrics);
        return Err(ApiError::PutRejected(rejection));
    }

    let changes = updater.accepted_changes();
    quotas::update_project_quotas(&mut tx, &project, &changes).await?;
    tx.commit().await?;

    dispatch_audit(state, &facts).await;
    updater.record_lowpriv_metrics(&state.lowpriv_metrics);
    info!(
        domain = %domain.uuid,
        project = %project.uuid,
        user = %identity.user_id,
        changes = changes.len(),
        "project quotas updated"
    );
    Ok(StatusCode::ACCEPTED.into_response())
}
