use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};

use virtuous_shared::{
    ChangeLedgerEntry, ComponentSettings, ConfigTarget, ConfigurationChange, CycleStatus,
    LedgerEntryType, LiveConfiguration, OptimizationCycle, QualityDataStore, VirtuousError,
    VirtuousId,
};

use super::ledger::ChangeLedger;
use crate::clock::Clock;
use crate::db::{spawn_audit_log, AuditLogEntry};

const PERSIST_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub success: bool,
    /// Live configuration version after the attempt.
    pub config_version: u64,
    pub error: Option<String>,
    /// The cycle, finalized with its terminal status.
    pub cycle: OptimizationCycle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackResult {
    pub rollback_cycle_id: String,
    pub reverted_cycle_id: String,
    pub changes: Vec<ConfigurationChange>,
    pub config_version: u64,
}

/// Sole writer of the live configuration.
///
/// Readers get `Arc` snapshots that never change underneath them. Deploy and
/// rollback are serialized by `deploy_lock` and run on a detached task, so a
/// cancelled caller cannot interrupt a half-applied change set.
pub struct DeploymentGovernor {
    live: RwLock<Arc<LiveConfiguration>>,
    /// Newest applied configuration whose durable write failed; retried by
    /// the maintenance loop until it lands.
    unsaved: Mutex<Option<Arc<LiveConfiguration>>>,
    deploy_lock: tokio::sync::Mutex<()>,
    target: Arc<dyn ConfigTarget>,
    ledger: Arc<ChangeLedger>,
    store: Arc<dyn QualityDataStore>,
    clock: Arc<dyn Clock>,
    audit_pool: Option<SqlitePool>,
    push_timeout: Duration,
}

impl DeploymentGovernor {
    pub fn new(
        initial: LiveConfiguration,
        target: Arc<dyn ConfigTarget>,
        ledger: Arc<ChangeLedger>,
        store: Arc<dyn QualityDataStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            live: RwLock::new(Arc::new(initial)),
            unsaved: Mutex::new(None),
            deploy_lock: tokio::sync::Mutex::new(()),
            target,
            ledger,
            store,
            clock,
            audit_pool: None,
            push_timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn with_audit_pool(mut self, pool: SqlitePool) -> Self {
        self.audit_pool = Some(pool);
        self
    }

    #[must_use]
    pub fn with_push_timeout(mut self, timeout: Duration) -> Self {
        self.push_timeout = timeout;
        self
    }

    /// Replaces the startup configuration with the persisted one, if any.
    pub async fn restore(&self) -> anyhow::Result<bool> {
        let Some(persisted) = self.store.load_live_config().await? else {
            return Ok(false);
        };
        info!(version = persisted.version, "⚙️ Restored live configuration");
        *self.live.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(persisted);
        Ok(true)
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<LiveConfiguration> {
        Arc::clone(&self.live.read().unwrap_or_else(|e| e.into_inner()))
    }

    #[must_use]
    pub fn settings_for(&self, component_id: &str) -> ComponentSettings {
        self.snapshot().settings_for(component_id)
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<ChangeLedger> {
        &self.ledger
    }

    // ══════════════════════════════════════════════════════════════
    // Deploy
    // ══════════════════════════════════════════════════════════════

    /// Applies a validated cycle all-or-nothing and records it in the ledger.
    pub async fn deploy(self: &Arc<Self>, cycle: OptimizationCycle) -> DeploymentResult {
        let this = Arc::clone(self);
        let cycle_id = cycle.cycle_id.clone();
        let fallback = cycle.clone();
        match tokio::spawn(async move { this.deploy_detached(cycle).await }).await {
            Ok(result) => result,
            Err(e) => {
                error!(cycle_id = %cycle_id, "Deploy task aborted: {}", e);
                let mut cycle = fallback;
                cycle.status = CycleStatus::Failure;
                cycle.error = Some(format!("deploy task aborted: {}", e));
                DeploymentResult {
                    success: false,
                    config_version: self.snapshot().version,
                    error: cycle.error.clone(),
                    cycle,
                }
            }
        }
    }

    async fn deploy_detached(&self, mut cycle: OptimizationCycle) -> DeploymentResult {
        let _guard = self.deploy_lock.lock().await;
        let outcome = self.apply_changes(&cycle.proposed_changes).await;
        let now = self.clock.now();
        cycle.completed_at = Some(now);

        let (success, error, version) = match outcome {
            Ok(version) => {
                cycle.status = CycleStatus::Success;
                cycle.quality_after = cycle
                    .quality_before
                    .map(|q| (q * (1.0 + cycle.improvement_pct / 100.0)).min(1.0));
                info!(
                    cycle_id = %cycle.cycle_id,
                    component_id = %cycle.component_id,
                    changes = cycle.proposed_changes.len(),
                    version = version,
                    "🚀 Deployed optimization"
                );
                (true, None, version)
            }
            Err(e) => {
                warn!(
                    cycle_id = %cycle.cycle_id,
                    component_id = %cycle.component_id,
                    "Deployment failed, changes reverted: {}",
                    e
                );
                cycle.status = CycleStatus::Failure;
                cycle.error = Some(e.to_string());
                (false, cycle.error.clone(), self.snapshot().version)
            }
        };

        self.ledger
            .append(ChangeLedgerEntry {
                cycle_id: cycle.cycle_id.clone(),
                entry_type: LedgerEntryType::Optimization,
                changes: cycle.proposed_changes.clone(),
                success,
                timestamp: now,
                reverts: None,
                error: error.clone(),
            })
            .await;

        self.audit(
            AuditLogEntry::new(
                "CONFIG_DEPLOYED",
                Some(&cycle.component_id),
                if success { "SUCCESS" } else { "FAILURE" },
                error.clone().unwrap_or_else(|| cycle.trigger_reason.clone()),
            )
            .with_actor("cycle_orchestrator")
            .with_metadata(serde_json::json!({
                "cycle_id": cycle.cycle_id,
                "version": version,
                "improvement_pct": cycle.improvement_pct,
                "confidence_pct": cycle.confidence_pct,
            })),
        );

        DeploymentResult {
            success,
            config_version: version,
            error,
            cycle,
        }
    }

    // ══════════════════════════════════════════════════════════════
    // Rollback
    // ══════════════════════════════════════════════════════════════

    /// Deploys the inverse of a past optimization. Defaults to the newest
    /// successful optimization that has not been reverted. A rollback entry is
    /// appended whether or not the inverse applies.
    pub async fn rollback(
        self: &Arc<Self>,
        target_cycle_id: Option<String>,
        actor: Option<String>,
    ) -> Result<RollbackResult, VirtuousError> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.rollback_detached(target_cycle_id, actor).await })
            .await
            .map_err(|e| VirtuousError::RollbackFailure(format!("rollback task aborted: {}", e)))?
    }

    fn resolve_target(&self, target_cycle_id: Option<&str>) -> Result<ChangeLedgerEntry, VirtuousError> {
        let Some(id) = target_cycle_id else {
            return self.ledger.rollback_target().ok_or_else(|| {
                VirtuousError::NotFound("no successful optimization available to roll back".into())
            });
        };
        let entry = self
            .ledger
            .find(id)
            .ok_or_else(|| VirtuousError::NotFound(format!("ledger entry '{}'", id)))?;
        if entry.entry_type != LedgerEntryType::Optimization {
            return Err(VirtuousError::Validation(format!(
                "'{}' is a rollback entry; only optimizations can be rolled back",
                id
            )));
        }
        if !entry.success {
            return Err(VirtuousError::Validation(format!(
                "'{}' was never applied; nothing to roll back",
                id
            )));
        }
        if self.ledger.is_reverted(id) {
            return Err(VirtuousError::Conflict(format!("'{}' has already been rolled back", id)));
        }
        Ok(entry)
    }

    async fn rollback_detached(
        &self,
        target_cycle_id: Option<String>,
        actor: Option<String>,
    ) -> Result<RollbackResult, VirtuousError> {
        let _guard = self.deploy_lock.lock().await;
        let target = self.resolve_target(target_cycle_id.as_deref())?;

        let reason = format!("rollback of {}", target.cycle_id);
        let inverse: Vec<ConfigurationChange> =
            target.changes.iter().rev().map(|c| c.inverse(reason.clone())).collect();
        let rollback_id = VirtuousId::new().to_string();

        let outcome = self.apply_changes(&inverse).await;
        let error = outcome.as_ref().err().map(ToString::to_string);

        self.ledger
            .append(ChangeLedgerEntry {
                cycle_id: rollback_id.clone(),
                entry_type: LedgerEntryType::Rollback,
                changes: inverse.clone(),
                success: outcome.is_ok(),
                timestamp: self.clock.now(),
                reverts: Some(target.cycle_id.clone()),
                error: error.clone(),
            })
            .await;

        let mut audit = AuditLogEntry::new(
            "CONFIG_ROLLBACK",
            Some(&target.cycle_id),
            if outcome.is_ok() { "SUCCESS" } else { "FAILURE" },
            error.unwrap_or_else(|| reason.clone()),
        )
        .with_metadata(serde_json::json!({ "rollback_cycle_id": rollback_id }));
        if let Some(actor) = actor {
            audit = audit.with_actor(actor);
        }
        self.audit(audit);

        match outcome {
            Ok(version) => {
                info!(
                    reverted = %target.cycle_id,
                    rollback_cycle_id = %rollback_id,
                    version = version,
                    "⏪ Rolled back optimization"
                );
                Ok(RollbackResult {
                    rollback_cycle_id: rollback_id,
                    reverted_cycle_id: target.cycle_id,
                    changes: inverse,
                    config_version: version,
                })
            }
            Err(e) => {
                error!(reverted = %target.cycle_id, "Rollback failed: {}", e);
                Err(VirtuousError::RollbackFailure(e.to_string()))
            }
        }
    }

    // ══════════════════════════════════════════════════════════════
    // Apply
    // ══════════════════════════════════════════════════════════════

    /// Compare-and-set of a change set against the current snapshot, then a
    /// push to the serving target with in-order revert on failure. Only after
    /// every push succeeds is the new version published. Caller holds
    /// `deploy_lock`.
    async fn apply_changes(&self, changes: &[ConfigurationChange]) -> Result<u64, VirtuousError> {
        let current = self.snapshot();
        let mut candidate = (*current).clone();
        for change in changes {
            candidate.apply(change)?;
        }

        let mut pushed: Vec<&ConfigurationChange> = Vec::with_capacity(changes.len());
        for change in changes {
            if let Err(e) = self.push(&change.component, &change.after).await {
                for done in pushed.iter().rev() {
                    if let Err(revert_err) = self.push(&done.component, &done.before).await {
                        error!(
                            component_id = %done.component,
                            setting = %done.key(),
                            "Failed to revert pushed setting: {}",
                            revert_err
                        );
                    }
                }
                return Err(VirtuousError::DeploymentFailure(format!(
                    "{} of '{}' could not be applied: {}",
                    change.key(),
                    change.component,
                    e
                )));
            }
            pushed.push(change);
        }

        candidate.version = current.version + 1;
        candidate.updated_at = self.clock.now();
        let published = Arc::new(candidate);
        *self.live.write().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&published);

        self.persist(&published).await;
        Ok(published.version)
    }

    async fn push(&self, component_id: &str, value: &virtuous_shared::SettingValue) -> anyhow::Result<()> {
        tokio::time::timeout(self.push_timeout, self.target.apply(component_id, value))
            .await
            .map_err(|_| anyhow::anyhow!("config push timed out after {:?}", self.push_timeout))?
    }

    /// Durable copy of the live config. Failure is logged and queued for the
    /// maintenance loop, never undone.
    async fn persist(&self, config: &Arc<LiveConfiguration>) {
        for attempt in 0..PERSIST_ATTEMPTS {
            match self.store.save_live_config(config).await {
                Ok(()) => {
                    *self.lock_unsaved() = None;
                    return;
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, version = config.version, "Failed to persist live config: {}", e);
                    if attempt + 1 < PERSIST_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(100 * (u64::from(attempt) + 1))).await;
                    }
                }
            }
        }
        error!(
            version = config.version,
            "Live config v{} is applied but not persisted, queued for retry",
            config.version
        );
        *self.lock_unsaved() = Some(Arc::clone(config));
    }

    /// Retries the queued live-config write. Returns `true` once nothing is
    /// left to persist.
    pub async fn flush_pending(&self) -> bool {
        let _guard = self.deploy_lock.lock().await;
        let Some(config) = self.lock_unsaved().clone() else {
            return true;
        };
        match self.store.save_live_config(&config).await {
            Ok(()) => {
                *self.lock_unsaved() = None;
                info!(version = config.version, "Recovered queued live config write");
                true
            }
            Err(e) => {
                warn!(version = config.version, "Live config write still failing: {}", e);
                false
            }
        }
    }

    #[must_use]
    pub fn has_unsaved_config(&self) -> bool {
        self.lock_unsaved().is_some()
    }

    fn lock_unsaved(&self) -> std::sync::MutexGuard<'_, Option<Arc<LiveConfiguration>>> {
        self.unsaved.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn audit(&self, entry: AuditLogEntry) {
        if let Some(pool) = &self.audit_pool {
            spawn_audit_log(pool.clone(), entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::test_utils::{default_settings, pending_cycle, temperature_change, MemoryDataStore, RecordingTarget};
    use virtuous_shared::SettingValue;

    fn governor(target: Arc<RecordingTarget>, backing: Arc<MemoryDataStore>) -> Arc<DeploymentGovernor> {
        let ledger = Arc::new(ChangeLedger::new(50, backing.clone()));
        Arc::new(DeploymentGovernor::new(
            LiveConfiguration::new(default_settings()),
            target,
            ledger,
            backing,
            Arc::new(ManualClock::default()),
        ))
    }

    #[tokio::test]
    async fn test_deploy_bumps_version_and_records() {
        let target = Arc::new(RecordingTarget::default());
        let backing = Arc::new(MemoryDataStore::default());
        let gov = governor(target.clone(), backing.clone());

        let cycle = pending_cycle("summarizer", vec![temperature_change("summarizer", 0.7, 0.5)]);
        let result = gov.deploy(cycle).await;
        assert!(result.success);
        assert_eq!(result.config_version, 1);
        assert_eq!(result.cycle.status, CycleStatus::Success);
        assert_eq!(gov.settings_for("summarizer").temperature, 0.5);
        assert_eq!(target.applied().len(), 1);
        assert_eq!(gov.ledger().len(), 1);
        assert_eq!(backing.live_config().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_failed_push_reverts_pushed_changes() {
        let target = Arc::new(RecordingTarget::failing_on("model"));
        let backing = Arc::new(MemoryDataStore::default());
        let gov = governor(target.clone(), backing);

        let changes = vec![
            temperature_change("summarizer", 0.7, 0.5),
            ConfigurationChange {
                component: "summarizer".to_string(),
                before: SettingValue::Model("gpt-4o-mini".to_string()),
                after: SettingValue::Model("gpt-4o".to_string()),
                reason: "fallback".to_string(),
                impact_description: String::new(),
            },
        ];
        let result = gov.deploy(pending_cycle("summarizer", changes)).await;
        assert!(!result.success);
        assert_eq!(result.cycle.status, CycleStatus::Failure);
        assert_eq!(gov.snapshot().version, 0);
        assert_eq!(gov.settings_for("summarizer"), default_settings());

        // The temperature push was undone at the target too
        let pushes = target.applied();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[1].1, SettingValue::Temperature(0.7));

        let ledger = gov.ledger().recent(1);
        assert!(!ledger[0].success);
        assert!(gov.ledger().rollback_target().is_none());
    }

    #[tokio::test]
    async fn test_stale_change_is_rejected_before_any_push() {
        let target = Arc::new(RecordingTarget::default());
        let gov = governor(target.clone(), Arc::new(MemoryDataStore::default()));
        let result = gov
            .deploy(pending_cycle("summarizer", vec![temperature_change("summarizer", 0.9, 0.5)]))
            .await;
        assert!(!result.success);
        assert!(target.applied().is_empty());
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_applied_change() {
        let backing = Arc::new(MemoryDataStore::default());
        backing.set_fail_writes(true);
        let gov = governor(Arc::new(RecordingTarget::default()), backing.clone());
        let result = gov
            .deploy(pending_cycle("summarizer", vec![temperature_change("summarizer", 0.7, 0.5)]))
            .await;
        assert!(result.success);
        assert_eq!(gov.settings_for("summarizer").temperature, 0.5);
        assert!(backing.live_config().is_none());
        assert_eq!(gov.ledger().pending_writes(), 1);
        assert!(gov.has_unsaved_config());
    }

    #[tokio::test]
    async fn test_unsaved_config_is_flushed_and_survives_restart() {
        let backing = Arc::new(MemoryDataStore::default());
        backing.set_fail_writes(true);
        let gov = governor(Arc::new(RecordingTarget::default()), backing.clone());
        let result = gov
            .deploy(pending_cycle("summarizer", vec![temperature_change("summarizer", 0.7, 0.5)]))
            .await;
        assert!(result.success);

        // Still failing: stays queued
        assert!(!gov.flush_pending().await);
        assert!(gov.has_unsaved_config());

        backing.set_fail_writes(false);
        assert!(gov.flush_pending().await);
        assert_eq!(gov.ledger().flush_pending().await, 1);
        assert!(!gov.has_unsaved_config());
        assert_eq!(backing.live_config().unwrap().version, 1);

        let restarted = governor(Arc::new(RecordingTarget::default()), backing.clone());
        assert!(restarted.restore().await.unwrap());
        restarted.ledger().load().await.unwrap();
        assert_eq!(restarted.settings_for("summarizer").temperature, 0.5);

        // The restored entry reverts cleanly against the restored config
        let rolled_back = restarted.rollback(None, None).await.unwrap();
        assert_eq!(rolled_back.reverted_cycle_id, result.cycle.cycle_id);
        assert_eq!(restarted.settings_for("summarizer").temperature, 0.7);
    }

    #[tokio::test]
    async fn test_later_successful_write_clears_queue() {
        let backing = Arc::new(MemoryDataStore::default());
        backing.set_fail_writes(true);
        let gov = governor(Arc::new(RecordingTarget::default()), backing.clone());
        gov.deploy(pending_cycle("summarizer", vec![temperature_change("summarizer", 0.7, 0.5)]))
            .await;
        assert!(gov.has_unsaved_config());

        backing.set_fail_writes(false);
        gov.deploy(pending_cycle("summarizer", vec![temperature_change("summarizer", 0.5, 0.4)]))
            .await;
        assert!(!gov.has_unsaved_config());
        assert_eq!(backing.live_config().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_rollback_errors() {
        let gov = governor(Arc::new(RecordingTarget::default()), Arc::new(MemoryDataStore::default()));
        assert!(matches!(gov.rollback(None, None).await, Err(VirtuousError::NotFound(_))));
        assert!(gov.ledger().is_empty());

        let deployed = gov
            .deploy(pending_cycle("summarizer", vec![temperature_change("summarizer", 0.7, 0.5)]))
            .await;
        let id = deployed.cycle.cycle_id.clone();
        gov.rollback(Some(id.clone()), None).await.unwrap();
        assert!(matches!(
            gov.rollback(Some(id), None).await,
            Err(VirtuousError::Conflict(_))
        ));
        assert!(matches!(
            gov.rollback(Some("missing".to_string()), None).await,
            Err(VirtuousError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rollback_failure_is_recorded_and_surfaced() {
        let target = Arc::new(RecordingTarget::default());
        let gov = governor(target.clone(), Arc::new(MemoryDataStore::default()));
        let deployed = gov
            .deploy(pending_cycle("summarizer", vec![temperature_change("summarizer", 0.7, 0.5)]))
            .await;
        assert!(deployed.success);

        target.fail_on("temperature");
        let err = gov.rollback(None, Some("operator".to_string())).await.unwrap_err();
        assert!(matches!(err, VirtuousError::RollbackFailure(_)));

        let latest = &gov.ledger().recent(1)[0];
        assert_eq!(latest.entry_type, LedgerEntryType::Rollback);
        assert!(!latest.success);
        assert_eq!(latest.reverts.as_deref(), Some(deployed.cycle.cycle_id.as_str()));
        assert_eq!(gov.settings_for("summarizer").temperature, 0.5);
        // Still the rollback point
        assert_eq!(
            gov.ledger().rollback_target().unwrap().cycle_id,
            deployed.cycle.cycle_id
        );
    }
}
