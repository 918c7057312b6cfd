//! Domain report and domain quota routes.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use limes_core::filter::Filter;
use limes_core::report::ReportContext;
use limes_core::updater::quota::{QuotaReports, QuotaUpdater, ServiceQuotaRequest, quota_request_from_services};

use super::{PutMode, SharedState, dispatch_audit, report_filter, wrapped};
use crate::error::ApiError;
use crate::middleware::Identity;
use crate::policy::Target;
use crate::repository::{quotas, reports};
use crate::state::AppState;

/// Request body for domain quota changes.
#[derive(Debug, Deserialize)]
pub struct DomainQuotaBody {
    pub domain: ServiceQuotaList,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServiceQuotaList {
    #[serde(default)]
    pub services: Vec<ServiceQuotaRequest>,
}

/// Build the domains router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/v1/domains", get(list_domains))
        .route("/v1/domains/{domain_id}", get(get_domain).put(put_domain))
        .route("/v1/domains/{domain_id}/simulate-put", post(simulate_put_domain))
}

/// `GET /v1/domains`: resource reports for all domains.
async fn list_domains(
    State(state): State<SharedState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state.policy.require("domain:list", &identity, Target::cluster())?;
    let filter = report_filter(&state, &identity, &query, &headers);
    let ctx = ReportContext::new(&state.cluster, &state.nm, &filter, Utc::now());
    let mut conn = state.pool.acquire().await?;
    let domains = reports::domain_reports(&mut conn, ctx, None).await?;
    Ok(wrapped("domains", domains))
}

/// `GET /v1/domains/{domain_id}`: resource report for one domain.
async fn get_domain(
    State(state): State<SharedState>,
    Extension(identity): Extension<Identity>,
    Path(domain_uuid): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state.policy.require("domain:show", &identity, Target::domain(&domain_uuid))?;
    let mut conn = state.pool.acquire().await?;
    let domain = reports::find_domain(&mut conn, &domain_uuid).await?;
    let filter = report_filter(&state, &identity, &query, &headers);
    let ctx = ReportContext::new(&state.cluster, &state.nm, &filter, Utc::now());
    let report = reports::domain_report(&mut conn, ctx, &domain).await?;
    Ok(wrapped("domain", report))
}

/// `PUT /v1/domains/{domain_id}`: set domain quotas.
async fn put_domain(
    State(state): State<SharedState>,
    Extension(identity): Extension<Identity>,
    Path(domain_uuid): Path<String>,
    Json(body): Json<DomainQuotaBody>,
) -> Result<Response, ApiError> {
    put_or_simulate(&state, &identity, &domain_uuid, body, PutMode::Apply).await
}

/// `POST /v1/domains/{domain_id}/simulate-put`: check domain quotas
/// without applying them.
async fn simulate_put_domain(
    State(state): State<SharedState>,
    Extension(identity): Extension<Identity>,
    Path(domain_uuid): Path<String>,
    Json(body): Json<DomainQuotaBody>,
) -> Result<Response, ApiError> {
    put_or_simulate(&state, &identity, &domain_uuid, body, PutMode::Simulate).await
}

async fn put_or_simulate(
    state: &AppState,
    identity: &Identity,
    domain_uuid: &str,
    body: DomainQuotaBody,
    mode: PutMode,
) -> Result<Response, ApiError> {
    state.policy.require("domain:show", identity, Target::domain(domain_uuid))?;
    // validation and write see the same state; concurrent writers to
    // this domain wait on the row lock
    let mut tx = state.pool.begin().await?;
    let domain = reports::find_domain(&mut tx, domain_uuid).await?;
    quotas::lock_domain(&mut tx, &domain).await?;
    let request = quota_request_from_services(body.domain.services);

    let now = Utc::now();
    let filter = Filter::default();
    let ctx = ReportContext::new(&state.cluster, &state.nm, &filter, now);
    let cluster_report = reports::cluster_report(&mut tx, ctx).await?;
    let domain_report = reports::domain_report(&mut tx, ctx, &domain).await?;

    let permissions = state
        .policy
        .quota_permissions(identity, "domain", Target::domain(&domain.uuid));
    let mut updater = QuotaUpdater::new(&state.cluster, &state.nm, &domain, None, &permissions)
        .with_constraints(state.constraints.as_deref());
    let reports = QuotaReports {
        cluster: &cluster_report,
        domain: &domain_report,
        project: None,
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
    quotas::update_domain_quotas(&mut tx, &domain, &changes).await?;
    tx.commit().await?;

    dispatch_audit(state, &facts).await;
    updater.record_lowpriv_metrics(&state.lowpriv_metrics);
    info!(domain = %domain.uuid, user = %identity.user_id, changes = changes.len(), "domain quotas updated");
    Ok(StatusCode::ACCEPTED.into_response())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn request_body_parses_services_and_units() {
        let body: DomainQuotaBody = serde_json::from_str(
            r#"{"domain":{"services":[{"type":"shared","resources":[{"name":"capacity","quota":10,"unit":"GiB"},{"name":"things","quota":5}]}]}}"#,
        )
        .unwrap();
        let request = quota_request_from_services(body.domain.services);
        let shared = request.values().next().unwrap();
        assert_eq!(shared.len(), 2);
        assert!(shared.values().any(|q| q.value == 10 && q.unit.is_some()));
        assert!(shared.values().any(|q| q.value == 5 && q.unit.is_none()));
    }

    #[test]
    fn services_may_be_omitted() {
        let body: DomainQuotaBody = serde_json::from_str(r#"{"domain":{}}"#).unwrap();
        assert!(body.domain.services.is_empty());
    }
}
