//! Optimization cycles, learning patterns and the change ledger records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::quality::QualityMeasurement;
use crate::settings::{ComponentSettings, ConfigurationChange};

/// Lifecycle of an optimization attempt for one component.
///
/// `Idle → Triggered → Optimizing → Validating → {ReadyToDeploy | Discarded}
///  → Cooldown → Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Triggered,
    Optimizing,
    Validating,
    ReadyToDeploy,
    Discarded,
    Cooldown,
}

impl CyclePhase {
    /// Phases that count against the global concurrency cap.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::Triggered | Self::Optimizing | Self::Validating | Self::ReadyToDeploy
        )
    }
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Triggered => "triggered",
            Self::Optimizing => "optimizing",
            Self::Validating => "validating",
            Self::ReadyToDeploy => "ready_to_deploy",
            Self::Discarded => "discarded",
            Self::Cooldown => "cooldown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// Created, not yet finalized.
    Pending,
    Success,
    Failure,
    Discarded,
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Discarded => write!(f, "discarded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationCycle {
    pub cycle_id: String,
    pub component_id: String,
    pub trigger_reason: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub quality_before: Option<f64>,
    /// Predicted quality after deployment (`quality_before` scaled by the
    /// proposal's improvement); observed quality arrives through telemetry.
    pub quality_after: Option<f64>,
    pub proposed_changes: Vec<ConfigurationChange>,
    pub status: CycleStatus,
    pub improvement_pct: f64,
    pub confidence_pct: f64,
    #[serde(default)]
    pub strategy_tag: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Input handed to the optimizer for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationRequest {
    pub cycle_id: String,
    pub component_id: String,
    pub measurements: Vec<QualityMeasurement>,
    pub patterns: Vec<LearningPattern>,
    pub current_settings: ComponentSettings,
    pub budget_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationProposal {
    pub changes: Vec<ConfigurationChange>,
    pub improvement_pct: f64,
    pub confidence_pct: f64,
    #[serde(default)]
    pub strategy_tag: Option<String>,
    #[serde(default)]
    pub rationale: Option<String>,
}

impl OptimizationProposal {
    /// Strategy tag used for learning: the optimizer's own tag, or the sorted
    /// set of setting kinds the proposal touches.
    #[must_use]
    pub fn resolved_strategy_tag(&self) -> String {
        if let Some(tag) = self.strategy_tag.as_deref().filter(|t| !t.trim().is_empty()) {
            return tag.to_string();
        }
        let mut keys: Vec<String> = self.changes.iter().map(|c| c.key().to_string()).collect();
        keys.sort();
        keys.dedup();
        if keys.is_empty() {
            "empty".to_string()
        } else {
            keys.join("+")
        }
    }
}

/// Confidence-scored memory of how a strategy fared in a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningPattern {
    pub id: String,
    /// Component or spectrum the pattern applies to.
    pub context: String,
    pub strategy_tag: String,
    pub confidence: f64,
    pub success_count: u64,
    pub failure_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_applied_at: Option<DateTime<Utc>>,
    /// Recency-weighted outcome mass; decays between updates.
    #[serde(default)]
    pub weighted_success: f64,
    #[serde(default)]
    pub weighted_failure: f64,
    pub updated_at: DateTime<Utc>,
}

impl LearningPattern {
    #[must_use]
    pub fn total_outcomes(&self) -> u64 {
        self.success_count + self.failure_count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    Optimization,
    Rollback,
}

impl std::fmt::Display for LedgerEntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Optimization => write!(f, "optimization"),
            Self::Rollback => write!(f, "rollback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLedgerEntry {
    pub cycle_id: String,
    #[serde(rename = "type")]
    pub entry_type: LedgerEntryType,
    pub changes: Vec<ConfigurationChange>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    /// For rollback entries: the optimization cycle that was reverted.
    #[serde(default)]
    pub reverts: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingValue;

    fn change(before: SettingValue, after: SettingValue) -> ConfigurationChange {
        ConfigurationChange {
            component: "x".to_string(),
            before,
            after,
            reason: "r".to_string(),
            impact_description: String::new(),
        }
    }

    #[test]
    fn test_strategy_tag_derived_from_changes() {
        let proposal = OptimizationProposal {
            changes: vec![
                change(SettingValue::TimeoutSecs(30), SettingValue::TimeoutSecs(45)),
                change(SettingValue::Temperature(0.7), SettingValue::Temperature(0.5)),
            ],
            improvement_pct: 3.0,
            confidence_pct: 90.0,
            strategy_tag: None,
            rationale: None,
        };
        assert_eq!(proposal.resolved_strategy_tag(), "temperature+timeout");

        let tagged = OptimizationProposal {
            strategy_tag: Some("prompt_tightening".to_string()),
            ..proposal
        };
        assert_eq!(tagged.resolved_strategy_tag(), "prompt_tightening");
    }

    #[test]
    fn test_ledger_entry_type_field_name() {
        let entry = ChangeLedgerEntry {
            cycle_id: "c1".to_string(),
            entry_type: LedgerEntryType::Rollback,
            changes: vec![],
            success: true,
            timestamp: Utc::now(),
            reverts: Some("c0".to_string()),
            error: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "rollback");
    }

    #[test]
    fn test_in_flight_phases() {
        assert!(CyclePhase::Optimizing.is_in_flight());
        assert!(CyclePhase::Validating.is_in_flight());
        assert!(!CyclePhase::Cooldown.is_in_flight());
        assert!(!CyclePhase::Idle.is_in_flight());
    }
}
