use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod cycle;
pub mod quality;
pub mod settings;

pub use cycle::*;
pub use quality::*;
pub use settings::*;

/// SDK version constant for consistent version reporting across crates
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identifier for cycles, alerts and patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VirtuousId(Uuid);

impl std::fmt::Display for VirtuousId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for VirtuousId {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtuousId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id derived from a name (used for learning pattern keys).
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }
}

/// Engine error taxonomy; serialized as `{"type", "detail"}`.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail")]
pub enum VirtuousError {
    /// Malformed proposal or request; the cycle is discarded, nothing deployed.
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Optimizer timed out after {0}s")]
    OptimizerTimeout(u64),
    #[error("Optimizer failure: {0}")]
    OptimizerFailure(String),
    /// A change failed to apply; the cycle's changes were reverted.
    #[error("Deployment failure: {0}")]
    DeploymentFailure(String),
    /// The inverse change set could not be applied.
    #[error("Rollback failure: {0}")]
    RollbackFailure(String),
    #[error("Persistence failure: {0}")]
    Persistence(String),
    #[error("Not found: {0}")]
    NotFound(String),
    /// The request conflicts with the engine state (cooldown, cap, in-flight cycle).
    #[error("Conflict: {0}")]
    Conflict(String),
}

pub type VirtuousResult<T> = std::result::Result<T, VirtuousError>;

// ══════════════════════════════════════════════════════════════
// Collaborator Interfaces
// ══════════════════════════════════════════════════════════════

/// Durable storage for learning patterns, the change ledger and the live
/// configuration. Each store is single-writer; callers serialize writes.
#[async_trait]
pub trait QualityDataStore: Send + Sync {
    /// Upserts patterns keyed by (context, strategy_tag) in one transaction.
    async fn upsert_patterns(&self, patterns: &[LearningPattern]) -> anyhow::Result<()>;
    async fn load_patterns(&self) -> anyhow::Result<Vec<LearningPattern>>;
    /// Appends an entry and evicts the oldest rows beyond `capacity`.
    async fn append_ledger_entry(
        &self,
        entry: &ChangeLedgerEntry,
        capacity: usize,
    ) -> anyhow::Result<()>;
    /// Most recent entries, oldest first.
    async fn load_ledger(&self, limit: usize) -> anyhow::Result<Vec<ChangeLedgerEntry>>;
    async fn clear_ledger(&self) -> anyhow::Result<u64>;
    async fn save_live_config(&self, config: &LiveConfiguration) -> anyhow::Result<()>;
    async fn load_live_config(&self) -> anyhow::Result<Option<LiveConfiguration>>;
}

/// Supplier of quality measurements (tracing backend).
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    fn name(&self) -> &str;
    /// Measurements observed strictly after `since`, in arrival order.
    async fn fetch(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<Vec<QualityMeasurement>>;
}

/// External capability that proposes a configuration rewrite.
#[async_trait]
pub trait Optimizer: Send + Sync {
    fn name(&self) -> &str;
    async fn propose(&self, request: OptimizationRequest) -> anyhow::Result<OptimizationProposal>;
}

/// Delivery channel for alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Pushes individual setting values to the serving gateway.
#[async_trait]
pub trait ConfigTarget: Send + Sync {
    async fn apply(&self, component_id: &str, value: &SettingValue) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serializes_with_type_tag() {
        let err = VirtuousError::RollbackFailure("model unavailable".to_string());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "RollbackFailure");
        assert_eq!(json["detail"], "model unavailable");
    }

    #[test]
    fn test_id_from_name_is_deterministic() {
        assert_eq!(VirtuousId::from_name("a:b"), VirtuousId::from_name("a:b"));
        assert_ne!(VirtuousId::from_name("a:b"), VirtuousId::from_name("a:c"));
    }
}
