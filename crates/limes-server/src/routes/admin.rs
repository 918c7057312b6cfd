//! Operator routes: inconsistencies and scrape errors.

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
use crate::repository::reports::{self, ScrapeKind};

/// Build the admin router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/v1/inconsistencies", get(get_inconsistencies))
        .route("/v1/admin/scrape-errors", get(get_scrape_errors))
        .route("/rates/v1/admin/scrape-errors", get(get_rate_scrape_errors))
}

/// `GET /v1/inconsistencies`: quota values that violate the hierarchy.
async fn get_inconsistencies(
    State(state): State<SharedState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state.policy.require("cluster:show", &identity, Target::cluster())?;
    let filter = report_filter(&state, &identity, &query, &headers);
    let ctx = ReportContext::new(&state.cluster, &state.nm, &filter, Utc::now());
    let mut conn = state.pool.acquire().await?;
    let report = reports::inconsistencies(&mut conn, ctx).await?;
    Ok(wrapped("inconsistencies", report))
}

/// `GET /v1/admin/scrape-errors`
async fn get_scrape_errors(
    State(state): State<SharedState>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    state.policy.require("cluster:show_errors", &identity, Target::cluster())?;
    let filter = report_filter(&state, &identity, &[], &HeaderMap::new());
    let ctx = ReportContext::new(&state.cluster, &state.nm, &filter, Utc::now());
    let mut conn = state.pool.acquire().await?;
    let errors = reports::scrape_errors(&mut conn, ctx, ScrapeKind::Resources).await?;
    Ok(wrapped("scrape_errors", errors))
}

/// `GET /rates/v1/admin/scrape-errors`
async fn get_rate_scrape_errors(
    State(state): State<SharedState>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    state.policy.require("cluster:show_errors", &identity, Target::cluster())?;
    let filter = report_filter(&state, &identity, &[], &HeaderMap::new());
    let ctx = ReportContext::new(&state.cluster, &state.nm, &filter, Utc::now());
    let mut conn = state.pool.acquire().await?;
    let errors = reports::scrape_errors(&mut conn, ctx, ScrapeKind::Rates).await?;
    Ok(wrapped("rate_scrape_errors", errors))
}
