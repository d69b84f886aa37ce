use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

use virtuous_shared::{
    ConfigurationChange, CyclePhase, CycleStatus, LearningPattern, OptimizationCycle,
    OptimizationProposal, OptimizationRequest, Optimizer, QualityEvent,
    SettingValue, VirtuousError, VirtuousId,
};

use super::slots::{CycleSlot, SlotRegistry, SlotRejection};
use super::CycleConfig;
use crate::clock::Clock;
use crate::cooldown::{CooldownKey, CooldownRegistry, OPTIMIZATION_CONDITION};
use crate::deploy::{DeploymentGovernor, DeploymentResult};
use crate::learning::{LearningStore, OPTIMIZER_UNAVAILABLE_TAG};
use crate::quality::ThresholdMonitor;
use crate::shutdown::Shutdown;
use crate::validation::validate_proposal;

/// Outcomes needed before history carries its full weight.
const HISTORY_SATURATION: f64 = 5.0;
/// Largest share historical confidence can take in the combined estimate.
const MAX_HISTORY_WEIGHT: f64 = 0.3;

pub const MANUAL_OVERRIDE_TAG: &str = "manual_override";

/// Why a trigger was dropped. Rejected triggers are never queued.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerRejection {
    InFlight,
    Cooldown { remaining_secs: i64 },
    AtCapacity { cap: usize },
    ShuttingDown,
}

impl std::fmt::Display for TriggerRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InFlight => write!(f, "an optimization cycle is already running for this component"),
            Self::Cooldown { remaining_secs } => {
                write!(f, "component is in cooldown for another {}s", remaining_secs)
            }
            Self::AtCapacity { cap } => write!(f, "optimization capacity reached ({} cycles in flight)", cap),
            Self::ShuttingDown => write!(f, "engine is shutting down"),
        }
    }
}

impl From<TriggerRejection> for VirtuousError {
    fn from(rejection: TriggerRejection) -> Self {
        VirtuousError::Conflict(rejection.to_string())
    }
}

/// Confidence estimate mixing the optimizer's own figure with the historical
/// confidence of the same strategy on the same component. History weighs more
/// as evidence accumulates, up to a fixed share.
#[must_use]
pub fn combine_confidence(optimizer_pct: f64, pattern: Option<&LearningPattern>) -> f64 {
    let Some(pattern) = pattern else {
        return optimizer_pct;
    };
    let evidence = (pattern.total_outcomes() as f64 / HISTORY_SATURATION).min(1.0);
    let weight = MAX_HISTORY_WEIGHT * evidence;
    (1.0 - weight) * optimizer_pct + weight * pattern.confidence * 100.0
}

/// A cycle that won its slot and is ready to run.
pub struct PendingCycle {
    slot: CycleSlot,
    cycle: OptimizationCycle,
}

impl PendingCycle {
    #[must_use]
    pub fn cycle_id(&self) -> &str {
        &self.cycle.cycle_id
    }
}

/// Drives `IDLE → TRIGGERED → OPTIMIZING → VALIDATING → {READY_TO_DEPLOY |
/// DISCARDED} → COOLDOWN → IDLE` per component.
pub struct CycleOrchestrator {
    config: CycleConfig,
    slots: Arc<SlotRegistry>,
    cooldowns: Arc<CooldownRegistry>,
    optimizer: Arc<dyn Optimizer>,
    monitor: Arc<ThresholdMonitor>,
    learning: Arc<LearningStore>,
    governor: Arc<DeploymentGovernor>,
    clock: Arc<dyn Clock>,
    shutdown: Arc<Shutdown>,
    phases: DashMap<String, CyclePhase>,
    history: RwLock<VecDeque<OptimizationCycle>>,
}

impl CycleOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CycleConfig,
        cooldowns: Arc<CooldownRegistry>,
        optimizer: Arc<dyn Optimizer>,
        monitor: Arc<ThresholdMonitor>,
        learning: Arc<LearningStore>,
        governor: Arc<DeploymentGovernor>,
        clock: Arc<dyn Clock>,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            slots: SlotRegistry::new(config.max_concurrent),
            config,
            cooldowns,
            optimizer,
            monitor,
            learning,
            governor,
            clock,
            shutdown,
            phases: DashMap::new(),
            history: RwLock::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CycleConfig {
        &self.config
    }

    #[must_use]
    pub fn optimizer_name(&self) -> &str {
        self.optimizer.name()
    }

    /// Events that warrant an optimization attempt under the configured policy.
    #[must_use]
    pub fn qualifies(&self, event: &QualityEvent) -> bool {
        self.config.trigger_policy.admits(event)
    }

    fn cooldown_key(component_id: &str) -> CooldownKey {
        CooldownKey::new(component_id, OPTIMIZATION_CONDITION)
    }

    // ══════════════════════════════════════════════════════════════
    // Triggering
    // ══════════════════════════════════════════════════════════════

    /// `IDLE → TRIGGERED`: claims the component's slot if it is idle, out of
    /// cooldown and under the global cap. `quality_before` is the latest
    /// observed score.
    pub fn try_begin(&self, component_id: &str, reason: &str) -> Result<PendingCycle, TriggerRejection> {
        self.begin(component_id, reason, self.monitor.latest_score(component_id))
    }

    fn begin(
        &self,
        component_id: &str,
        reason: &str,
        quality_before: Option<f64>,
    ) -> Result<PendingCycle, TriggerRejection> {
        if self.shutdown.is_triggered() {
            return Err(TriggerRejection::ShuttingDown);
        }
        let key = Self::cooldown_key(component_id);
        if let Some(left) = self.cooldowns.remaining(&key) {
            return Err(TriggerRejection::Cooldown {
                remaining_secs: left.num_seconds(),
            });
        }

        let slot = self.slots.acquire(component_id).map_err(|rejection| match rejection {
            SlotRejection::InFlight => TriggerRejection::InFlight,
            SlotRejection::AtCapacity { cap } => TriggerRejection::AtCapacity { cap },
        })?;

        // A cycle that finished between the check above and the acquire has
        // armed its cooldown before releasing the slot.
        if let Some(left) = self.cooldowns.remaining(&key) {
            return Err(TriggerRejection::Cooldown {
                remaining_secs: left.num_seconds(),
            });
        }

        let cycle = OptimizationCycle {
            cycle_id: VirtuousId::new().to_string(),
            component_id: component_id.to_string(),
            trigger_reason: reason.to_string(),
            started_at: self.clock.now(),
            completed_at: None,
            quality_before,
            quality_after: None,
            proposed_changes: Vec::new(),
            status: CycleStatus::Pending,
            improvement_pct: 0.0,
            confidence_pct: 0.0,
            strategy_tag: None,
            error: None,
        };
        self.phases.insert(component_id.to_string(), CyclePhase::Triggered);
        info!(
            cycle_id = %cycle.cycle_id,
            component_id = %component_id,
            reason = %reason,
            "🔁 Optimization cycle triggered"
        );
        Ok(PendingCycle { slot, cycle })
    }

    /// Starts a cycle on its own task. Returns the cycle id, or why it was dropped.
    pub fn spawn_cycle(self: &Arc<Self>, component_id: &str, reason: &str) -> Result<String, TriggerRejection> {
        let pending = self.try_begin(component_id, reason)?;
        Ok(self.spawn_pending(pending))
    }

    fn spawn_pending(self: &Arc<Self>, pending: PendingCycle) -> String {
        let cycle_id = pending.cycle_id().to_string();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run(pending).await;
        });
        cycle_id
    }

    /// Routes a monitor event. Non-qualifying and rejected events are logged
    /// and dropped. The cycle records the triggering score as `quality_before`.
    pub fn handle_event(self: &Arc<Self>, event: &QualityEvent) -> Option<String> {
        if !self.qualifies(event) {
            info!(
                component_id = %event.component_id,
                condition = %event.condition,
                tier = %event.tier,
                "Quality event dropped by trigger policy"
            );
            return None;
        }
        let reason = format!(
            "{} ({} tier, score {:.3}, slope {:.4})",
            event.condition, event.tier, event.score, event.slope
        );
        match self.begin(&event.component_id, &reason, Some(event.score)) {
            Ok(pending) => Some(self.spawn_pending(pending)),
            Err(rejection) => {
                info!(
                    component_id = %event.component_id,
                    "Quality event dropped: {}",
                    rejection
                );
                None
            }
        }
    }

    /// Operator-initiated setting change. Holds the component's slot like a
    /// cycle so it cannot interleave with an automatic deploy, but skips the
    /// optimizer, the deployment thresholds and the cooldown.
    pub async fn apply_override(
        &self,
        component_id: &str,
        value: SettingValue,
        reason: &str,
    ) -> Result<DeploymentResult, VirtuousError> {
        if self.shutdown.is_triggered() {
            return Err(TriggerRejection::ShuttingDown.into());
        }
        let slot = self.slots.acquire(component_id).map_err(|rejection| match rejection {
            SlotRejection::InFlight => TriggerRejection::InFlight,
            SlotRejection::AtCapacity { cap } => TriggerRejection::AtCapacity { cap },
        })?;

        let current = self.governor.settings_for(component_id);
        let change = ConfigurationChange {
            component: component_id.to_string(),
            before: current.get(value.key()),
            after: value,
            reason: reason.to_string(),
            impact_description: "manual override".to_string(),
        };
        change.validate()?;

        let cycle = OptimizationCycle {
            cycle_id: VirtuousId::new().to_string(),
            component_id: component_id.to_string(),
            trigger_reason: format!("manual override: {}", reason),
            started_at: self.clock.now(),
            completed_at: None,
            quality_before: self.monitor.latest_score(component_id),
            quality_after: None,
            proposed_changes: vec![change],
            status: CycleStatus::Pending,
            improvement_pct: 0.0,
            confidence_pct: 100.0,
            strategy_tag: Some(MANUAL_OVERRIDE_TAG.to_string()),
            error: None,
        };
        info!(cycle_id = %cycle.cycle_id, component_id = %component_id, "✋ Manual override requested");
        let result = self.governor.deploy(cycle).await;
        self.remember(result.cycle.clone());
        drop(slot);
        Ok(result)
    }

    // ══════════════════════════════════════════════════════════════
    // Running
    // ══════════════════════════════════════════════════════════════

    /// Runs a claimed cycle to its terminal state and returns it finalized.
    /// Every error is folded into the cycle; nothing propagates.
    pub async fn run(&self, pending: PendingCycle) -> OptimizationCycle {
        let PendingCycle { slot, mut cycle } = pending;
        let component_id = slot.component_id().to_string();

        // OPTIMIZING
        self.set_phase(&component_id, CyclePhase::Optimizing);
        let current_settings = self.governor.settings_for(&component_id);
        let request = OptimizationRequest {
            cycle_id: cycle.cycle_id.clone(),
            component_id: component_id.clone(),
            measurements: self.monitor.recent(&component_id, self.config.measurement_window),
            patterns: self.learning.top_patterns(&component_id),
            current_settings: current_settings.clone(),
            budget_secs: self.config.optimizer_timeout_secs,
        };

        let budget = Duration::from_secs(self.config.optimizer_timeout_secs);
        let proposal = tokio::select! {
            () = self.shutdown.wait() => {
                cycle.error = Some("cancelled by shutdown".to_string());
                return self.finish_cancelled(slot, cycle);
            }
            outcome = tokio::time::timeout(budget, self.optimizer.propose(request)) => match outcome {
                Ok(Ok(proposal)) => proposal,
                Ok(Err(e)) => {
                    let err = VirtuousError::OptimizerFailure(e.to_string());
                    return self.discard(slot, cycle, OPTIMIZER_UNAVAILABLE_TAG.to_string(), err).await;
                }
                Err(_) => {
                    let err = VirtuousError::OptimizerTimeout(self.config.optimizer_timeout_secs);
                    return self.discard(slot, cycle, OPTIMIZER_UNAVAILABLE_TAG.to_string(), err).await;
                }
            },
        };

        // VALIDATING
        self.set_phase(&component_id, CyclePhase::Validating);
        let tag = proposal.resolved_strategy_tag();
        cycle.proposed_changes = proposal.changes.clone();
        cycle.improvement_pct = proposal.improvement_pct;

        if let Err(e) = validate_proposal(&component_id, &proposal, &current_settings) {
            cycle.confidence_pct = proposal.confidence_pct;
            return self.discard(slot, cycle, tag, e).await;
        }

        let historical = self.learning.pattern(&component_id, &tag);
        cycle.confidence_pct = combine_confidence(proposal.confidence_pct, historical.as_ref());
        cycle.strategy_tag = Some(tag.clone());

        if !self.config.is_deployable(cycle.improvement_pct, cycle.confidence_pct) {
            let err = VirtuousError::Validation(below_threshold(&self.config, &proposal, cycle.confidence_pct));
            return self.discard(slot, cycle, tag, err).await;
        }

        // READY_TO_DEPLOY → hand-off
        self.set_phase(&component_id, CyclePhase::ReadyToDeploy);
        let result = self.governor.deploy(cycle).await;
        self.finish(slot, result.cycle).await
    }

    async fn discard(
        &self,
        slot: CycleSlot,
        mut cycle: OptimizationCycle,
        strategy_tag: String,
        error: VirtuousError,
    ) -> OptimizationCycle {
        warn!(
            cycle_id = %cycle.cycle_id,
            component_id = %cycle.component_id,
            "Cycle discarded: {}",
            error
        );
        self.set_phase(slot.component_id(), CyclePhase::Discarded);
        cycle.status = CycleStatus::Discarded;
        cycle.strategy_tag = Some(strategy_tag);
        cycle.error = Some(error.to_string());
        cycle.completed_at = Some(self.clock.now());
        self.finish(slot, cycle).await
    }

    /// `→ COOLDOWN`: learning, cooldown and history, then the slot is released.
    async fn finish(&self, slot: CycleSlot, cycle: OptimizationCycle) -> OptimizationCycle {
        self.learning.record(&cycle).await;
        self.cooldowns
            .arm(Self::cooldown_key(slot.component_id()), self.config.cooldown());
        self.set_phase(slot.component_id(), CyclePhase::Cooldown);
        self.remember(cycle.clone());

        match cycle.status {
            CycleStatus::Success => info!(
                cycle_id = %cycle.cycle_id,
                component_id = %cycle.component_id,
                improvement_pct = cycle.improvement_pct,
                confidence_pct = cycle.confidence_pct,
                "✅ Cycle complete"
            ),
            status => info!(
                cycle_id = %cycle.cycle_id,
                component_id = %cycle.component_id,
                status = %status,
                "Cycle ended without deployment"
            ),
        }
        drop(slot);
        cycle
    }

    /// Shutdown is not a strategy outcome: no learning, no cooldown.
    fn finish_cancelled(&self, slot: CycleSlot, mut cycle: OptimizationCycle) -> OptimizationCycle {
        cycle.status = CycleStatus::Discarded;
        cycle.completed_at = Some(self.clock.now());
        self.set_phase(slot.component_id(), CyclePhase::Idle);
        self.remember(cycle.clone());
        drop(slot);
        cycle
    }

    fn set_phase(&self, component_id: &str, phase: CyclePhase) {
        self.phases.insert(component_id.to_string(), phase);
    }

    fn remember(&self, cycle: OptimizationCycle) {
        let mut history = self.history.write().unwrap_or_else(|e| e.into_inner());
        history.push_back(cycle);
        while history.len() > self.config.history_size {
            history.pop_front();
        }
    }

    // ══════════════════════════════════════════════════════════════
    // Queries
    // ══════════════════════════════════════════════════════════════

    /// Current phase; a finished cooldown reads as `Idle`.
    #[must_use]
    pub fn phase(&self, component_id: &str) -> CyclePhase {
        let phase = self
            .phases
            .get(component_id)
            .map_or(CyclePhase::Idle, |p| *p);
        match phase {
            CyclePhase::Cooldown | CyclePhase::Discarded
                if !self.cooldowns.is_active(&Self::cooldown_key(component_id)) =>
            {
                CyclePhase::Idle
            }
            other => other,
        }
    }

    #[must_use]
    pub fn cooldown_remaining_secs(&self, component_id: &str) -> Option<i64> {
        self.cooldowns
            .remaining(&Self::cooldown_key(component_id))
            .map(|d| d.num_seconds())
    }

    #[must_use]
    pub fn in_flight(&self) -> Vec<String> {
        self.slots.in_flight()
    }

    /// Newest first.
    #[must_use]
    pub fn recent_cycles(&self, limit: usize) -> Vec<OptimizationCycle> {
        let history = self.history.read().unwrap_or_else(|e| e.into_inner());
        history.iter().rev().take(limit).cloned().collect()
    }

    #[must_use]
    pub fn find_cycle(&self, cycle_id: &str) -> Option<OptimizationCycle> {
        let history = self.history.read().unwrap_or_else(|e| e.into_inner());
        history.iter().find(|c| c.cycle_id == cycle_id).cloned()
    }
}

fn below_threshold(config: &CycleConfig, proposal: &OptimizationProposal, confidence_pct: f64) -> String {
    let mut reasons = Vec::new();
    if proposal.improvement_pct < config.deploy_threshold_pct {
        reasons.push(format!(
            "improvement {:.2}% < {:.2}%",
            proposal.improvement_pct, config.deploy_threshold_pct
        ));
    }
    if confidence_pct < config.confidence_threshold_pct {
        reasons.push(format!(
            "confidence {:.2}% < {:.2}%",
            confidence_pct, config.confidence_threshold_pct
        ));
    }
    format!("below deployment thresholds: {}", reasons.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn pattern(confidence: f64, outcomes: u64) -> LearningPattern {
        LearningPattern {
            id: "p".to_string(),
            context: "x".to_string(),
            strategy_tag: "temperature".to_string(),
            confidence,
            success_count: outcomes,
            failure_count: 0,
            created_at: Utc::now(),
            last_applied_at: None,
            weighted_success: outcomes as f64,
            weighted_failure: 0.0,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_combined_confidence_without_history_is_optimizer_value() {
        assert_eq!(combine_confidence(85.0, None), 85.0);
    }

    #[test]
    fn test_combined_confidence_weights_history_by_evidence() {
        // Full evidence: 0.7 * 90 + 0.3 * 50
        let full = combine_confidence(90.0, Some(&pattern(0.5, 10)));
        assert!((full - 78.0).abs() < 1e-9);
        // One outcome: weight 0.06
        let thin = combine_confidence(90.0, Some(&pattern(0.5, 1)));
        assert!((thin - (0.94 * 90.0 + 0.06 * 50.0)).abs() < 1e-9);
    }
}
