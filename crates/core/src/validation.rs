use serde::Deserialize;
use std::collections::HashSet;
use validator::Validate;

use virtuous_shared::{ComponentSettings, OptimizationProposal, SettingValue, VirtuousError};

// ══════════════════════════════════════════════════════════════
// Proposal Gate
// ══════════════════════════════════════════════════════════════

/// Structural checks on an optimizer proposal before any scoring.
///
/// Each change must target `component_id`, be well formed, touch a distinct
/// setting, and start from the value currently being served.
pub fn validate_proposal(
    component_id: &str,
    proposal: &OptimizationProposal,
    current: &ComponentSettings,
) -> Result<(), VirtuousError> {
    if proposal.changes.is_empty() {
        return Err(VirtuousError::Validation("proposal contains no changes".into()));
    }
    if !proposal.improvement_pct.is_finite() {
        return Err(VirtuousError::Validation("improvement_pct is not a finite number".into()));
    }
    if !proposal.confidence_pct.is_finite() || !(0.0..=100.0).contains(&proposal.confidence_pct) {
        return Err(VirtuousError::Validation(format!(
            "confidence_pct must be in [0, 100], got {}",
            proposal.confidence_pct
        )));
    }

    let mut seen = HashSet::new();
    for change in &proposal.changes {
        if change.component != component_id {
            return Err(VirtuousError::Validation(format!(
                "change targets '{}' but the cycle is for '{}'",
                change.component, component_id
            )));
        }
        change.validate()?;
        if !seen.insert(change.key()) {
            return Err(VirtuousError::Validation(format!(
                "proposal changes {} more than once",
                change.key()
            )));
        }
        let live = current.get(change.key());
        if live != change.before {
            return Err(VirtuousError::Validation(format!(
                "stale proposal: {} is {}, proposal assumed {}",
                change.key(),
                live,
                change.before
            )));
        }
    }
    Ok(())
}

// ══════════════════════════════════════════════════════════════
// Request Bodies
// ══════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize, Validate)]
pub struct TriggerRequest {
    #[validate(length(min = 1, max = 200, message = "component_id must be 1-200 characters"))]
    pub component_id: String,

    #[validate(length(max = 500, message = "reason must be at most 500 characters"))]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct RollbackRequest {
    #[validate(length(min = 1, max = 100, message = "target_cycle_id must be 1-100 characters"))]
    pub target_cycle_id: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MeasurementRequest {
    #[validate(length(min = 1, max = 200, message = "component_id must be 1-200 characters"))]
    pub component_id: String,

    #[validate(length(min = 1, max = 200, message = "model_id must be 1-200 characters"))]
    pub model_id: String,

    pub score: f64,

    pub sample_size: Option<u32>,

    pub latency_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ConfigSetRequest {
    #[validate(length(min = 1, max = 200, message = "component_id must be 1-200 characters"))]
    pub component_id: String,

    /// Tagged value, e.g. `{"kind": "temperature", "value": 0.4}`.
    pub setting: SettingValue,

    #[validate(length(min = 1, max = 500, message = "reason must be 1-500 characters"))]
    pub reason: String,
}

pub fn validate_request<T: Validate>(req: &T) -> Result<(), String> {
    req.validate().map_err(|e| format!("Validation error: {}", e))
}
