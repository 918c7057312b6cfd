//! Shared application state for the Limes server.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`.

use std::sync::Arc;

use sqlx::PgPool;

use limes_core::audit::AuditDispatcher;
use limes_core::cluster::Cluster;
use limes_core::constraints::QuotaConstraintSet;
use limes_core::metrics::LowPrivilegeRaiseMetrics;
use limes_core::name_mapping::NameMapping;
use limes_core::updater::quota::{AcceptAll, QuotaAcceptanceHook};

use crate::policy::Policy;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// Connection pool for the Limes database.
    pub pool: PgPool,
    /// The validated cluster configuration.
    pub cluster: Arc<Cluster>,
    /// Backend/API identity mapping, built once from `cluster`.
    pub nm: Arc<NameMapping>,
    /// Static quota constraints, if configured.
    pub constraints: Option<Arc<QuotaConstraintSet>>,
    /// Access rules.
    pub policy: Arc<Policy>,
    /// Acceptance check for new project quotas.
    pub acceptance_hook: Arc<dyn QuotaAcceptanceHook>,
    /// Audit fact dispatcher.
    pub audit: Arc<AuditDispatcher>,
    /// Low-privilege-raise counters.
    pub lowpriv_metrics: Arc<LowPrivilegeRaiseMetrics>,
}

impl AppState {
    #[must_use]
    pub fn new(pool: PgPool, cluster: Cluster, policy: Policy) -> Self {
        let nm = NameMapping::new(&cluster);
        let lowpriv_metrics = LowPrivilegeRaiseMetrics::new(cluster.id());
        Self {
            pool,
            cluster: Arc::new(cluster),
            nm: Arc::new(nm),
            constraints: None,
            policy: Arc::new(policy),
            acceptance_hook: Arc::new(AcceptAll),
            audit: Arc::new(AuditDispatcher::new()),
            lowpriv_metrics: Arc::new(lowpriv_metrics),
        }
    }

    #[must_use]
    pub fn with_constraints(mut self, constraints: QuotaConstraintSet) -> Self {
        self.constraints = Some(Arc::new(constraints));
        self
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("cluster_id", &self.cluster.id())
            .field("has_constraints", &self.constraints.is_some())
            .field("audit", &self.audit)
            .finish_non_exhaustive()
    }
}
