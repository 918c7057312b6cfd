//! Audit trail for quota and rate-limit changes.
//!
//! Every change attempt produces one [`AuditFact`] per resource or rate,
//! whether it was accepted or rejected. Facts are handed to an
//! [`AuditDispatcher`], which forwards them to all registered sinks.
//! Delivery succeeds if at least one sink accepts the fact.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::AuditError;
use crate::names::{RateName, ResourceName, ServiceType};
use crate::unit::Unit;
use crate::window::Window;

/// The user who made a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Initiator {
    pub user_id: String,
    pub user_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_domain_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub remote_addr: String,
}

/// The scope in which a change was attempted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScopeRef {
    pub domain_id: String,
    pub domain_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub project_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub project_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaChangeTarget {
    #[serde(flatten)]
    pub scope: ScopeRef,
    pub service_type: ServiceType,
    pub resource_name: ResourceName,
    pub old_quota: u64,
    pub new_quota: u64,
    #[serde(skip_serializing_if = "Unit::is_none")]
    pub unit: Unit,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reject_reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitChangeTarget {
    #[serde(flatten)]
    pub scope: ScopeRef,
    pub service_type: ServiceType,
    pub name: RateName,
    pub old_limit: u64,
    pub new_limit: u64,
    pub old_window: Option<Window>,
    pub new_window: Window,
    #[serde(skip_serializing_if = "Unit::is_none")]
    pub unit: Unit,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reject_reason: String,
}

/// What was changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditTarget {
    Quota(QuotaChangeTarget),
    RateLimit(RateLimitChangeTarget),
}

impl AuditTarget {
    #[must_use]
    pub fn reject_reason(&self) -> &str {
        match self {
            Self::Quota(t) => &t.reject_reason,
            Self::RateLimit(t) => &t.reject_reason,
        }
    }
}

/// One audited change attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditFact {
    pub observed_at: DateTime<Utc>,
    pub initiator: Initiator,
    pub action: &'static str,
    /// 200 for committed changes, 422 for rejected ones.
    pub status_code: u16,
    pub target: AuditTarget,
}

/// A destination for audit facts.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    /// The sink's name, for error reporting.
    fn name(&self) -> &str;

    /// Persists or forwards one fact.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::SinkFailure`] if the fact could not be delivered.
    async fn log(&self, fact: &AuditFact) -> Result<(), AuditError>;
}

/// Writes facts to the structured log.
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait::async_trait]
impl AuditSink for TracingSink {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "tracing"
    }

    async fn log(&self, fact: &AuditFact) -> Result<(), AuditError> {
        let payload = serde_json::to_string(&fact.target)?;
        info!(
            target: "limes::audit",
            user = %fact.initiator.user_name,
            status = fact.status_code,
            action = fact.action,
            target = %payload,
            "audit event"
        );
        Ok(())
    }
}

/// Fans facts out to all registered sinks.
pub struct AuditDispatcher {
    sinks: RwLock<Vec<Arc<dyn AuditSink>>>,
}

impl AuditDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sinks: RwLock::new(Vec::new()),
        }
    }

    pub async fn add_sink(&self, sink: Arc<dyn AuditSink>) {
        self.sinks.write().await.push(sink);
    }

    /// Delivers `fact` to every sink.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::AllSinksFailed`] if sinks are registered and
    /// none of them accepted the fact.
    pub async fn log(&self, fact: &AuditFact) -> Result<(), AuditError> {
        let sinks = self.sinks.read().await;
        if sinks.is_empty() {
            return Ok(());
        }

        let mut any_success = false;
        for sink in sinks.iter() {
            match sink.log(fact).await {
                Ok(()) => any_success = true,
                Err(e) => warn!(sink = sink.name(), error = %e, "audit sink failed"),
            }
        }
        if any_success {
            Ok(())
        } else {
            Err(AuditError::AllSinksFailed)
        }
    }

    /// Delivers a batch of facts in order. A failing fact does not stop the
    /// remaining ones; the first error is returned at the end.
    ///
    /// # Errors
    ///
    /// Returns the first [`AuditError`] encountered.
    pub async fn log_all(&self, facts: &[AuditFact]) -> Result<(), AuditError> {
        let mut first_error = None;
        for fact in facts {
            if let Err(e) = self.log(fact).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn has_sinks(&self) -> bool {
        !self.sinks.read().await.is_empty()
    }
}

impl Default for AuditDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AuditDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditDispatcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Records every fact it receives, or fails every time.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub facts: Mutex<Vec<AuditFact>>,
        pub failing: bool,
    }

    #[async_trait::async_trait]
    impl AuditSink for RecordingSink {
        #[allow(clippy::unnecessary_literal_bound)]
        fn name(&self) -> &str {
            "recording"
        }

        async fn log(&self, fact: &AuditFact) -> Result<(), AuditError> {
            if self.failing {
                return Err(AuditError::SinkFailure {
                    name: "recording".to_owned(),
                    reason: "disk full".to_owned(),
                });
            }
            self.facts.lock().unwrap().push(fact.clone());
            Ok(())
        }
    }

    pub(crate) fn sample_fact() -> AuditFact {
        AuditFact {
            observed_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            initiator: Initiator {
                user_id: "uid".to_owned(),
                user_name: "alice".to_owned(),
                ..Initiator::default()
            },
            action: "update",
            status_code: 200,
            target: AuditTarget::Quota(QuotaChangeTarget {
                scope: ScopeRef {
                    domain_id: "uuid-germany".to_owned(),
                    domain_name: "germany".to_owned(),
                    ..ScopeRef::default()
                },
                service_type: ServiceType::new("shared"),
                resource_name: ResourceName::new("things"),
                old_quota: 10,
                new_quota: 20,
                unit: Unit::None,
                reject_reason: String::new(),
            }),
        }
    }

    #[tokio::test]
    async fn no_sinks_is_ok() {
        let dispatcher = AuditDispatcher::new();
        assert!(!dispatcher.has_sinks().await);
        assert!(dispatcher.log(&sample_fact()).await.is_ok());
    }

    #[tokio::test]
    async fn one_working_sink_is_enough() {
        let dispatcher = AuditDispatcher::new();
        let good = Arc::new(RecordingSink::default());
        dispatcher
            .add_sink(Arc::new(RecordingSink {
                failing: true,
                ..RecordingSink::default()
            }))
            .await;
        dispatcher.add_sink(good.clone()).await;
        assert!(dispatcher.log(&sample_fact()).await.is_ok());
        assert_eq!(good.facts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn all_sinks_failing_is_an_error() {
        let dispatcher = AuditDispatcher::new();
        dispatcher
            .add_sink(Arc::new(RecordingSink {
                failing: true,
                ..RecordingSink::default()
            }))
            .await;
        let result = dispatcher.log_all(&[sample_fact(), sample_fact()]).await;
        assert!(matches!(result, Err(AuditError::AllSinksFailed)));
    }

    #[test]
    fn fact_serializes_with_tagged_target() {
        let json = serde_json::to_value(sample_fact()).unwrap();
        assert_eq!(json["target"]["type"], "quota");
        assert_eq!(json["target"]["domain_name"], "germany");
        assert!(json["target"].get("project_id").is_none());
        assert!(json["target"].get("reject_reason").is_none());
        assert_eq!(json["status_code"], 200);
    }
}
