//! HTTP error types for the Limes server.
//!
//! Maps errors from `limes-core` and the database into HTTP responses.
//! Every variant except [`ApiError::PutRejected`] produces a JSON body with a
//! machine-readable `error` field and a human-readable `message`.

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use limes_core::error::{ReportError, UpdateError};
use limes_core::updater::PutErrorResponse;

/// Application-level error returned from HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request carries no usable identity.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Policy denied the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Requested domain or project not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Client sent invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The project has not been scraped yet, so there is nothing to
    /// validate a change against.
    #[error("locked: {0}")]
    Locked(String),

    /// A quota or rate-limit PUT was rejected. Rendered as plain text.
    #[error("request rejected: {}", .0.body)]
    PutRejected(PutErrorResponse),

    /// Internal error (database, corrupt stored data, etc.).
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Locked(msg) => (StatusCode::LOCKED, "locked", msg),
            Self::PutRejected(response) => {
                let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::UNPROCESSABLE_ENTITY);
                return (
                    status,
                    [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                    response.body,
                )
                    .into_response();
            }
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
            }
        };

        let body = ErrorBody {
            error: error_type,
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("no such object".to_owned()),
            _ => Self::Internal(format!("database error: {err}")),
        }
    }
}

impl From<ReportError> for ApiError {
    fn from(err: ReportError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<UpdateError> for ApiError {
    fn from(err: UpdateError) -> Self {
        match err {
            UpdateError::MissingProjectReport { .. } => Self::Locked(format!(
                "{err} (please retry in a few seconds after initial scraping is done)"
            )),
            UpdateError::MissingReport { .. } => Self::Internal(err.to_string()),
        }
    }
}
