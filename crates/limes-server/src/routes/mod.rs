//! HTTP route handlers.
//!
//! Resource reports live under `/v1/`, rate reports under `/rates/v1/`.
//! Every route except `/metrics` requires an identity (see
//! [`crate::middleware`]); authorization is decided per handler by the
//! policy.

pub mod admin;
pub mod clusters;
pub mod domains;
pub mod metrics;
pub mod projects;
pub mod rates;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, header};
use axum::middleware as axum_mw;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use limes_core::audit::AuditFact;
use limes_core::filter::{Filter, FilterParams};
use limes_core::names::{ResourceName, ServiceType};

use crate::error::ApiError;
use crate::middleware::{Identity, identity_middleware};
use crate::policy::Target;
use crate::state::AppState;

/// Shared handler state.
pub type SharedState = Arc<AppState>;

/// Header that opts into the per-AZ breakdown.
pub const API_PREVIEW_HEADER: &str = "x-limes-v2-api-preview";

/// Reports buffered between the query task and the response body.
const STREAM_BUFFER: usize = 16;

/// Build the complete API router.
pub fn router(state: SharedState) -> Router {
    let authenticated = Router::new()
        .merge(clusters::router())
        .merge(domains::router())
        .merge(projects::router())
        .merge(rates::router())
        .merge(admin::router())
        .route_layer(axum_mw::from_fn(identity_middleware));

    Router::new()
        .merge(authenticated)
        .merge(metrics::router())
        .with_state(state)
}

/// Reads the report parameters of a request. `service`, `resource` and
/// `area` may repeat; `detail` is a flag whose value is ignored.
pub fn filter_params(query: &[(String, String)], headers: &HeaderMap) -> FilterParams {
    let mut params = FilterParams::default();
    for (key, value) in query {
        match key.as_str() {
            "service" => params.services.push(value.clone()),
            "resource" => params.resources.push(value.clone()),
            "area" => params.areas.get_or_insert_with(Vec::new).push(value.clone()),
            "detail" => params.detail = true,
            _ => {}
        }
    }
    params.az_breakdown = headers
        .get_all(API_PREVIEW_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim() == "per-az");
    params
}

/// Builds the report filter for a request. Subcapacities are only shown
/// for services where the caller passes `cluster:show_subcapacity`.
pub fn report_filter(state: &AppState, identity: &Identity, query: &[(String, String)], headers: &HeaderMap) -> Filter {
    let policy = Arc::clone(&state.policy);
    let identity = identity.clone();
    Filter::from_params(&filter_params(query, headers), &state.nm).with_subcapacity_authorization(Arc::new(
        move |service_type: &ServiceType, _: &ResourceName| {
            policy.check(
                "cluster:show_subcapacity",
                &identity,
                Target::cluster().with_service(service_type),
            )
        },
    ))
}

/// Whether a quota or rate-limit request is applied or only checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    Apply,
    Simulate,
}

/// Sends audit facts to all sinks. Sink failures do not fail the request,
/// since the change is already committed.
pub async fn dispatch_audit(state: &AppState, facts: &[AuditFact]) {
    if let Err(err) = state.audit.log_all(facts).await {
        warn!(error = %err, facts = facts.len(), "could not deliver audit facts");
    }
}

/// A value in a single-key JSON object such as `{"cluster": ...}`.
#[derive(Debug, Serialize)]
pub struct Wrapped<T>(BTreeMap<&'static str, T>);

/// Response body `{"<key>": value}`.
pub fn wrapped<T: Serialize>(key: &'static str, value: T) -> Json<Wrapped<T>> {
    Json(Wrapped(BTreeMap::from([(key, value)])))
}

async fn join_producer(producer: JoinHandle<Result<(), ApiError>>) -> Result<(), ApiError> {
    producer
        .await
        .map_err(|e| ApiError::Internal(format!("report task failed: {e}")))?
}

/// Streams the reports produced by `produce` as `{"<key>": [...]}`.
///
/// Failures before the first report become a regular error response.
/// Later failures can no longer change the status; they are logged and
/// the body is cut off.
pub async fn stream_list<T, F, Fut>(key: &'static str, produce: F) -> Result<Response, ApiError>
where
    T: Serialize + Send + 'static,
    F: FnOnce(mpsc::Sender<T>) -> Fut,
    Fut: Future<Output = Result<(), ApiError>> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<T>(STREAM_BUFFER);
    let producer = tokio::spawn(produce(tx));

    let Some(first) = rx.recv().await else {
        join_producer(producer).await?;
        return Ok(wrapped(key, Vec::<T>::new()).into_response());
    };
    let mut head = format!("{{\"{key}\":[").into_bytes();
    serde_json::to_writer(&mut head, &first).map_err(|e| ApiError::Internal(e.to_string()))?;

    let rest = futures::stream::unfold(Some((rx, producer)), move |state| async move {
        let (mut rx, producer) = state?;
        match rx.recv().await {
            Some(report) => {
                let mut chunk = b",".to_vec();
                match serde_json::to_writer(&mut chunk, &report) {
                    Ok(()) => Some((Ok(Bytes::from(chunk)), Some((rx, producer)))),
                    Err(err) => {
                        error!(key, error = %err, "could not serialize report after the response started");
                        producer.abort();
                        Some((Err(std::io::Error::other(err)), None))
                    }
                }
            }
            None => match join_producer(producer).await {
                Ok(()) => Some((Ok(Bytes::from_static(b"]}")), None)),
                Err(err) => {
                    error!(key, error = %err, "report stream failed after the response started");
                    Some((Err(std::io::Error::other(err.to_string())), None))
                }
            },
        }
    });
    let body = futures::stream::once(async move { Ok::<_, std::io::Error>(Bytes::from(head)) }).chain(rest);

    Ok(([(header::CONTENT_TYPE, "application/json")], Body::from_stream(body)).into_response())
}
