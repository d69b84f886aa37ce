use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use virtuous_shared::{CyclePhase, ThresholdTier};

use crate::quality::ComponentQuality;
use crate::{AppResult, AppState};

/// Operator-facing health label. Engine internals never leak into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentHealth {
    Healthy,
    Warning,
    Critical,
    Optimizing,
    InCooldown,
}

impl ComponentHealth {
    #[must_use]
    pub fn derive(tier: ThresholdTier, phase: CyclePhase, cooling_down: bool) -> Self {
        if phase.is_in_flight() {
            return Self::Optimizing;
        }
        if cooling_down {
            return Self::InCooldown;
        }
        match tier {
            ThresholdTier::Critical => Self::Critical,
            ThresholdTier::Warning => Self::Warning,
            ThresholdTier::Target | ThresholdTier::Excellent => Self::Healthy,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ComponentStatus {
    #[serde(flatten)]
    pub quality: ComponentQuality,
    pub phase: CyclePhase,
    pub health: ComponentHealth,
    pub cooldown_remaining_secs: Option<i64>,
}

/// Monitoring state and per-component health.
///
/// **Route:** `GET /status`
///
/// # Authentication
/// No authentication required (read-only, no side effects).
///
/// # Response
/// ```json
/// {
///   "status": "ok",
///   "monitoring": { "components_tracked": 2, "cycles_in_flight": ["summarizer"], ... },
///   "thresholds": { "critical": 0.85, "warning": 0.90, "target": 0.95,
///                   "slope_threshold": 0.01, "trend_unit_secs": 60,
///                   "variance_ceiling": 0.05, "variance_unit": "std_dev" },
///   "components": [{ "component_id": "summarizer", "latest_score": 0.82, "health": "optimizing", ... }]
/// }
/// ```
///
/// Per-component `variance` is the population standard deviation of the
/// window's scores and `slope` is score change per `trend_unit_secs`.
pub async fn status_handler(State(state): State<Arc<AppState>>) -> AppResult<Json<serde_json::Value>> {
    let components: Vec<ComponentStatus> = state
        .monitor
        .components()
        .into_iter()
        .map(|quality| {
            let phase = state.orchestrator.phase(&quality.component_id);
            let cooldown_remaining_secs = state
                .orchestrator
                .cooldown_remaining_secs(&quality.component_id);
            ComponentStatus {
                health: ComponentHealth::derive(quality.tier, phase, cooldown_remaining_secs.is_some()),
                phase,
                cooldown_remaining_secs,
                quality,
            }
        })
        .collect();

    let thresholds = state.monitor.config();
    let live = state.governor.snapshot();
    let uptime_secs = (state.clock.now() - state.started_at).num_seconds().max(0);

    Ok(Json(serde_json::json!({
        "status": "ok",
        "monitoring": {
            "components_tracked": components.len(),
            "cycles_in_flight": state.orchestrator.in_flight(),
            "max_concurrent_cycles": state.orchestrator.config().max_concurrent,
            "optimizer": state.orchestrator.optimizer_name(),
            "unresolved_alerts": state.alerts.unresolved_count(),
            "config_version": live.version,
            "pending_writes": state.learning.pending_writes()
                + state.ledger.pending_writes()
                + usize::from(state.governor.has_unsaved_config()),
            "uptime_secs": uptime_secs,
        },
        "thresholds": {
            "critical": thresholds.critical,
            "warning": thresholds.warning,
            "target": thresholds.target,
            "slope_threshold": thresholds.slope_threshold,
            "trend_unit_secs": thresholds.trend_unit_secs,
            "variance_ceiling": thresholds.variance_ceiling,
            "variance_unit": "std_dev",
        },
        "components": components,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_precedence() {
        assert_eq!(
            ComponentHealth::derive(ThresholdTier::Critical, CyclePhase::Optimizing, false),
            ComponentHealth::Optimizing
        );
        assert_eq!(
            ComponentHealth::derive(ThresholdTier::Critical, CyclePhase::Cooldown, true),
            ComponentHealth::InCooldown
        );
        assert_eq!(
            ComponentHealth::derive(ThresholdTier::Warning, CyclePhase::Idle, false),
            ComponentHealth::Warning
        );
        assert_eq!(
            ComponentHealth::derive(ThresholdTier::Target, CyclePhase::Idle, false),
            ComponentHealth::Healthy
        );
    }
}
