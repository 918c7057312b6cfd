//! Limes server binary.

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::http::HeaderValue;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use limes_core::audit::TracingSink;
use limes_core::audit_file::FileAuditSink;
use limes_core::cluster::Cluster;
use limes_core::config::ClusterConfig;
use limes_core::constraints::QuotaConstraintSet;
use limes_server::config::ServerConfig;
use limes_server::middleware::{
    DOMAIN_ID_HEADER, PROJECT_ID_HEADER, ROLES_HEADER, USER_DOMAIN_NAME_HEADER, USER_ID_HEADER, USER_NAME_HEADER,
};
use limes_server::policy::Policy;
use limes_server::repository;
use limes_server::routes::{self, API_PREVIEW_HEADER};
use limes_server::state::AppState;

/// Requests served at the same time; report queries are expensive.
const MAX_CONCURRENT_REQUESTS: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(config = %config.config_path.display(), "Limes starting");

    let state = build_app_state(&config).await?;
    let app = build_router(Arc::new(state));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "Limes server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Limes server stopped");
    Ok(())
}

async fn build_app_state(config: &ServerConfig) -> anyhow::Result<AppState> {
    let cluster_config = ClusterConfig::load(&config.config_path)
        .await
        .context("failed to load cluster configuration")?;
    let cluster = Cluster::new(cluster_config).context("invalid cluster configuration")?;
    info!(cluster_id = %cluster.id(), services = cluster.services().count(), "cluster configuration loaded");

    let constraints = match &config.constraints_path {
        Some(path) => Some(
            QuotaConstraintSet::load(&cluster, path)
                .await
                .context("failed to load quota constraints")?,
        ),
        None => None,
    };

    let policy = match &config.policy_path {
        Some(path) => Policy::load(path).await.context("failed to load policy")?,
        None => Policy::builtin().context("built-in policy is invalid")?,
    };

    let pool = repository::connect(&config.database_url, config.db_max_connections)
        .await
        .context("failed to connect to PostgreSQL")?;

    let mut state = AppState::new(pool, cluster, policy);
    if let Some(constraints) = constraints {
        state = state.with_constraints(constraints);
    }

    state.audit.add_sink(Arc::new(TracingSink)).await;
    if let Some(path) = &config.audit_file_path {
        state.audit.add_sink(Arc::new(FileAuditSink::new(path))).await;
        info!(path = %path.display(), "audit trail is written to file");
    }

    Ok(state)
}

fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderName::from_static(API_PREVIEW_HEADER),
            axum::http::HeaderName::from_static(USER_ID_HEADER),
            axum::http::HeaderName::from_static(USER_NAME_HEADER),
            axum::http::HeaderName::from_static(USER_DOMAIN_NAME_HEADER),
            axum::http::HeaderName::from_static(ROLES_HEADER),
            axum::http::HeaderName::from_static(DOMAIN_ID_HEADER),
            axum::http::HeaderName::from_static(PROJECT_ID_HEADER),
        ]);

    routes::router(state)
        .layer(tower::limit::ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
}
