//! Request identity.
//!
//! Limes sits behind an authenticating proxy that validates the user's
//! credentials and forwards the result in trusted headers. This middleware
//! turns those headers into an [`Identity`] and stores it in the request
//! extensions. Requests without a user ID are rejected with 401.

use std::collections::BTreeSet;

use axum::extract::Request;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use limes_core::audit::Initiator;

use crate::error::ApiError;

pub const USER_ID_HEADER: &str = "x-limes-user-id";
pub const USER_NAME_HEADER: &str = "x-limes-user-name";
pub const USER_DOMAIN_NAME_HEADER: &str = "x-limes-user-domain-name";
pub const ROLES_HEADER: &str = "x-limes-roles";
pub const DOMAIN_ID_HEADER: &str = "x-limes-domain-id";
pub const PROJECT_ID_HEADER: &str = "x-limes-project-id";

/// The authenticated caller and the scope of their credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub user_name: String,
    pub user_domain_name: String,
    pub roles: BTreeSet<String>,
    /// UUID of the domain the credentials are scoped to.
    pub domain_id: Option<String>,
    /// UUID of the project the credentials are scoped to.
    pub project_id: Option<String>,
    pub remote_addr: String,
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl Identity {
    /// Reads the identity headers.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Unauthorized`] if the user ID header is missing.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let user_id = header_str(headers, USER_ID_HEADER)
            .ok_or_else(|| ApiError::Unauthorized(format!("missing {USER_ID_HEADER} header")))?
            .to_owned();
        let roles = header_str(headers, ROLES_HEADER)
            .map(|roles| {
                roles
                    .split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        let remote_addr = header_str(headers, "x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .unwrap_or_default()
            .to_owned();

        Ok(Self {
            user_name: header_str(headers, USER_NAME_HEADER).unwrap_or(&user_id).to_owned(),
            user_id,
            user_domain_name: header_str(headers, USER_DOMAIN_NAME_HEADER).unwrap_or_default().to_owned(),
            roles,
            domain_id: header_str(headers, DOMAIN_ID_HEADER).map(str::to_owned),
            project_id: header_str(headers, PROJECT_ID_HEADER).map(str::to_owned),
            remote_addr,
        })
    }

    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// The user as recorded in audit facts.
    #[must_use]
    pub fn initiator(&self) -> Initiator {
        Initiator {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            user_domain_name: self.user_domain_name.clone(),
            remote_addr: self.remote_addr.clone(),
        }
    }
}

/// Axum middleware that reads the identity headers.
///
/// Injects [`Identity`] into request extensions on success.
///
/// # Errors
///
/// Returns [`ApiError::Unauthorized`] if the identity headers are missing.
pub async fn identity_middleware(mut req: Request, next: Next) -> Result<Response, ApiError> {
    let identity = Identity::from_headers(req.headers())?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn reads_all_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("uid-1"));
        headers.insert(USER_NAME_HEADER, HeaderValue::from_static("alice"));
        headers.insert(ROLES_HEADER, HeaderValue::from_static("admin, member,,"));
        headers.insert(PROJECT_ID_HEADER, HeaderValue::from_static("uuid-berlin"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.7, 10.0.0.1"));

        let identity = Identity::from_headers(&headers).unwrap();
        assert_eq!(identity.user_name, "alice");
        assert!(identity.has_role("admin"));
        assert!(identity.has_role("member"));
        assert_eq!(identity.roles.len(), 2);
        assert_eq!(identity.project_id.as_deref(), Some("uuid-berlin"));
        assert!(identity.domain_id.is_none());
        assert_eq!(identity.initiator().remote_addr, "10.0.0.7");
    }

    #[test]
    fn user_id_is_required() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_NAME_HEADER, HeaderValue::from_static("alice"));
        assert!(matches!(Identity::from_headers(&headers), Err(ApiError::Unauthorized(_))));
    }

    #[test]
    fn user_name_falls_back_to_id() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("uid-1"));
        let identity = Identity::from_headers(&headers).unwrap();
        assert_eq!(identity.user_name, "uid-1");
        assert!(identity.roles.is_empty());
    }
}
