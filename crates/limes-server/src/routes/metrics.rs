//! Prometheus metrics.

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use super::SharedState;

/// Build the metrics router. Metrics are public.
pub fn router() -> Router<SharedState> {
    Router::new().route("/metrics", get(get_metrics))
}

/// `GET /metrics`: low-privilege-raise counters in text exposition format.
async fn get_metrics(State(state): State<SharedState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.lowpriv_metrics.render(),
    )
}
