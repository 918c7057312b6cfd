//! Cluster report routes.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Extension, Router};
use chrono::Utc;

use limes_core::report::ReportContext;

use super::{SharedState, report_filter, wrapped};
use crate::error::ApiError;
use crate::middleware::Identity;
use crate::policy::Target;
use crate::repository::reports;

/// Build the cluster router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/v1/clusters/current", get(get_cluster))
        .route("/rates/v1/clusters/current", get(get_cluster_rates))
}

/// `GET /v1/clusters/current`: resource report for the whole cluster.
async fn get_cluster(
    State(state): State<SharedState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state.policy.require("cluster:show", &identity, Target::cluster())?;
    let filter = report_filter(&state, &identity, &query, &headers);
    let ctx = ReportContext::new(&state.cluster, &state.nm, &filter, Utc::now());
    let mut conn = state.pool.acquire().await?;
    let report = reports::cluster_report(&mut conn, ctx).await?;
    Ok(wrapped("cluster", report))
}

/// `GET /rates/v1/clusters/current`: rate report for the whole cluster.
async fn get_cluster_rates(
    State(state): State<SharedState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state.policy.require("cluster:show", &identity, Target::cluster())?;
    let filter = report_filter(&state, &identity, &query, &headers);
    let ctx = ReportContext::new(&state.cluster, &state.nm, &filter, Utc::now());
    let mut conn = state.pool.acquire().await?;
    let report = reports::cluster_rates_report(&mut conn, ctx).await?;
    Ok(wrapped("cluster", report))
}
