//! Optimization cycle orchestration.

pub mod orchestrator;
pub mod slots;

use serde::{Deserialize, Serialize};

pub use orchestrator::{
    combine_confidence, CycleOrchestrator, PendingCycle, TriggerRejection, MANUAL_OVERRIDE_TAG,
};
pub use slots::{CycleSlot, SlotRegistry};

use virtuous_shared::{QualityCondition, QualityEvent, ThresholdTier};

/// Which quality events start an optimization cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolicy {
    /// Every event, including variance-only and drops into the target tier.
    AnyEvent,
    /// Drops into warning or critical and negative trends only.
    Degraded,
}

impl TriggerPolicy {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "any" | "any_event" => Some(Self::AnyEvent),
            "degraded" => Some(Self::Degraded),
            _ => None,
        }
    }

    #[must_use]
    pub fn admits(self, event: &QualityEvent) -> bool {
        match self {
            Self::AnyEvent => true,
            Self::Degraded => {
                event.tier <= ThresholdTier::Warning || event.condition == QualityCondition::Trend
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Global cap on cycles in flight across all components.
    pub max_concurrent: usize,
    /// Per-component quiet period after a cycle ends.
    pub cooldown_secs: i64,
    /// Minimum predicted improvement (inclusive) for deployment.
    pub deploy_threshold_pct: f64,
    /// Minimum combined confidence (inclusive) for deployment.
    pub confidence_threshold_pct: f64,
    pub optimizer_timeout_secs: u64,
    /// Recent measurements handed to the optimizer.
    pub measurement_window: usize,
    /// Finalized cycles kept for `/cycles`.
    pub history_size: usize,
    pub trigger_policy: TriggerPolicy,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            cooldown_secs: 7200,
            deploy_threshold_pct: 2.0,
            confidence_threshold_pct: 80.0,
            optimizer_timeout_secs: 30,
            measurement_window: 20,
            history_size: 100,
            trigger_policy: TriggerPolicy::AnyEvent,
        }
    }
}

impl CycleConfig {
    #[must_use]
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs)
    }

    /// Deployment gate; both bounds are inclusive.
    #[must_use]
    pub fn is_deployable(&self, improvement_pct: f64, confidence_pct: f64) -> bool {
        improvement_pct >= self.deploy_threshold_pct && confidence_pct >= self.confidence_threshold_pct
    }
}
