//! Builders and in-memory doubles shared by unit and integration tests.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};

use virtuous_shared::{
    ChangeLedgerEntry, ComponentSettings, ConfigTarget, ConfigurationChange, CycleStatus,
    LearningPattern, LiveConfiguration, OptimizationCycle, OptimizationProposal,
    OptimizationRequest, Optimizer, QualityDataStore, QualityMeasurement, SettingValue, VirtuousId,
};

use crate::clock::ManualClock;
use crate::config::{AppConfig, DEFAULT_SYSTEM_PROMPT};
use crate::cycle::CycleConfig;
use crate::learning::LearningConfig;
use crate::quality::{AlertConfig, ThresholdConfig};
use crate::shutdown::Shutdown;
use crate::{AppState, Collaborators};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ══════════════════════════════════════════════════════════════
// Fixtures
// ══════════════════════════════════════════════════════════════

#[must_use]
pub fn default_settings() -> ComponentSettings {
    ComponentSettings {
        system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        model: "gpt-4o-mini".to_string(),
        temperature: 0.7,
        timeout_secs: 30,
    }
}

#[must_use]
pub fn temperature_change(component: &str, before: f64, after: f64) -> ConfigurationChange {
    ConfigurationChange {
        component: component.to_string(),
        before: SettingValue::Temperature(before),
        after: SettingValue::Temperature(after),
        reason: "reduce sampling noise".to_string(),
        impact_description: "expected +6% quality".to_string(),
    }
}

/// A validated cycle ready for the governor.
#[must_use]
pub fn pending_cycle(component: &str, changes: Vec<ConfigurationChange>) -> OptimizationCycle {
    OptimizationCycle {
        cycle_id: VirtuousId::new().to_string(),
        component_id: component.to_string(),
        trigger_reason: "test".to_string(),
        started_at: Utc::now(),
        completed_at: None,
        quality_before: Some(0.82),
        quality_after: None,
        proposed_changes: changes,
        status: CycleStatus::Pending,
        improvement_pct: 6.0,
        confidence_pct: 85.0,
        strategy_tag: Some("temperature".to_string()),
        error: None,
    }
}

#[must_use]
pub fn temperature_proposal(
    component: &str,
    before: f64,
    after: f64,
    improvement_pct: f64,
    confidence_pct: f64,
) -> OptimizationProposal {
    OptimizationProposal {
        changes: vec![temperature_change(component, before, after)],
        improvement_pct,
        confidence_pct,
        strategy_tag: Some("temperature".to_string()),
        rationale: None,
    }
}

static MEASUREMENT_SEQ: AtomicI64 = AtomicI64::new(0);

/// Successive calls are observed at least a minute apart, so trend slopes
/// behave like a real sampling cadence.
#[must_use]
pub fn measurement(component: &str, score: f64) -> QualityMeasurement {
    let seq = MEASUREMENT_SEQ.fetch_add(1, Ordering::SeqCst);
    QualityMeasurement {
        component_id: component.to_string(),
        model_id: "gpt-4o-mini".to_string(),
        score,
        sample_size: 10,
        observed_at: Utc::now() + chrono::Duration::minutes(seq),
        latency_ms: Some(800),
    }
}

/// Defaults without reading the environment, so env-mutating tests cannot
/// interfere.
#[must_use]
pub fn test_config(api_key: Option<String>) -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".to_string(),
        port: 8090,
        bind_address: "127.0.0.1".to_string(),
        cors_origins: vec![],
        api_key,
        threshold: ThresholdConfig::default(),
        alerts: AlertConfig::default(),
        cycle: CycleConfig::default(),
        learning: LearningConfig::default(),
        ledger_capacity: crate::deploy::DEFAULT_LEDGER_CAPACITY,
        operator_rate_per_min: 3,
        optimizer_url: None,
        telemetry_url: None,
        telemetry_poll_secs: 30,
        config_push_url: None,
        default_settings: default_settings(),
        fallback_models: vec!["gpt-4o".to_string()],
    }
}

pub async fn memory_pool() -> SqlitePool {
    // One connection that never recycles: each in-memory connection is its own database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    crate::db::init_db(&pool).await.unwrap();
    pool
}

// ══════════════════════════════════════════════════════════════
// In-memory store
// ══════════════════════════════════════════════════════════════

#[derive(Default)]
struct StoreInner {
    patterns: Vec<LearningPattern>,
    ledger: Vec<ChangeLedgerEntry>,
    live: Option<LiveConfiguration>,
}

/// `QualityDataStore` double with switchable write failures.
#[derive(Default)]
pub struct MemoryDataStore {
    inner: Mutex<StoreInner>,
    fail_writes: AtomicBool,
}

impl MemoryDataStore {
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn patterns(&self) -> Vec<LearningPattern> {
        lock(&self.inner).patterns.clone()
    }

    #[must_use]
    pub fn ledger(&self) -> Vec<ChangeLedgerEntry> {
        lock(&self.inner).ledger.clone()
    }

    #[must_use]
    pub fn live_config(&self) -> Option<LiveConfiguration> {
        lock(&self.inner).live.clone()
    }

    fn check_writable(&self) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("simulated write failure");
        }
        Ok(())
    }
}

#[async_trait]
impl QualityDataStore for MemoryDataStore {
    async fn upsert_patterns(&self, patterns: &[LearningPattern]) -> anyhow::Result<()> {
        self.check_writable()?;
        let mut inner = lock(&self.inner);
        for pattern in patterns {
            let existing = inner
                .patterns
                .iter()
                .position(|p| p.context == pattern.context && p.strategy_tag == pattern.strategy_tag);
            match existing {
                Some(i) => inner.patterns[i] = pattern.clone(),
                None => inner.patterns.push(pattern.clone()),
            }
        }
        Ok(())
    }

    async fn load_patterns(&self) -> anyhow::Result<Vec<LearningPattern>> {
        Ok(self.patterns())
    }

    async fn append_ledger_entry(&self, entry: &ChangeLedgerEntry, capacity: usize) -> anyhow::Result<()> {
        self.check_writable()?;
        let mut inner = lock(&self.inner);
        if inner.ledger.iter().any(|e| e.cycle_id == entry.cycle_id) {
            return Ok(());
        }
        inner.ledger.push(entry.clone());
        let excess = inner.ledger.len().saturating_sub(capacity);
        inner.ledger.drain(..excess);
        Ok(())
    }

    async fn load_ledger(&self, limit: usize) -> anyhow::Result<Vec<ChangeLedgerEntry>> {
        let ledger = self.ledger();
        let skip = ledger.len().saturating_sub(limit);
        Ok(ledger.into_iter().skip(skip).collect())
    }

    async fn clear_ledger(&self) -> anyhow::Result<u64> {
        self.check_writable()?;
        let mut inner = lock(&self.inner);
        let n = inner.ledger.len() as u64;
        inner.ledger.clear();
        Ok(n)
    }

    async fn save_live_config(&self, config: &LiveConfiguration) -> anyhow::Result<()> {
        self.check_writable()?;
        let mut inner = lock(&self.inner);
        if inner.live.as_ref().map_or(true, |l| l.version <= config.version) {
            inner.live = Some(config.clone());
        }
        Ok(())
    }

    async fn load_live_config(&self) -> anyhow::Result<Option<LiveConfiguration>> {
        Ok(self.live_config())
    }
}

// ══════════════════════════════════════════════════════════════
// Config target
// ══════════════════════════════════════════════════════════════

/// Records successful pushes; fails pushes for the configured setting keys.
#[derive(Default)]
pub struct RecordingTarget {
    applied: Mutex<Vec<(String, SettingValue)>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingTarget {
    #[must_use]
    pub fn failing_on(key: &str) -> Self {
        let target = Self::default();
        target.fail_on(key);
        target
    }

    pub fn fail_on(&self, key: &str) {
        lock(&self.failing).insert(key.to_string());
    }

    pub fn heal(&self) {
        lock(&self.failing).clear();
    }

    #[must_use]
    pub fn applied(&self) -> Vec<(String, SettingValue)> {
        lock(&self.applied).clone()
    }
}

#[async_trait]
impl ConfigTarget for RecordingTarget {
    async fn apply(&self, component_id: &str, value: &SettingValue) -> anyhow::Result<()> {
        if lock(&self.failing).contains(&value.key().to_string()) {
            anyhow::bail!("gateway refused {} for '{}'", value.key(), component_id);
        }
        lock(&self.applied).push((component_id.to_string(), value.clone()));
        Ok(())
    }
}

// ══════════════════════════════════════════════════════════════
// Optimizer
// ══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Propose(OptimizationProposal),
    Fail(String),
    /// Never answers; exercises the optimizer timeout.
    Hang,
}

/// Optimizer double. Proposals are re-targeted at the requesting component
/// and start from its current settings, so they always pass the stale check.
pub struct ScriptedOptimizer {
    response: Mutex<ScriptedResponse>,
    gate: Option<Semaphore>,
    calls: AtomicUsize,
    requests: Mutex<Vec<OptimizationRequest>>,
}

impl ScriptedOptimizer {
    #[must_use]
    pub fn new(response: ScriptedResponse) -> Self {
        Self {
            response: Mutex::new(response),
            gate: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn proposing(proposal: OptimizationProposal) -> Self {
        Self::new(ScriptedResponse::Propose(proposal))
    }

    /// Every call parks until [`release`](Self::release) hands out a permit.
    #[must_use]
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    pub fn release(&self, calls: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(calls);
        }
    }

    pub fn set_response(&self, response: ScriptedResponse) {
        *lock(&self.response) = response;
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn requests(&self) -> Vec<OptimizationRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl Optimizer for ScriptedOptimizer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn propose(&self, request: OptimizationRequest) -> anyhow::Result<OptimizationProposal> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(request.clone());
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        let response = lock(&self.response).clone();
        match response {
            ScriptedResponse::Propose(mut proposal) => {
                for change in &mut proposal.changes {
                    change.component = request.component_id.clone();
                    change.before = request.current_settings.get(change.key());
                }
                Ok(proposal)
            }
            ScriptedResponse::Fail(message) => anyhow::bail!(message),
            ScriptedResponse::Hang => std::future::pending().await,
        }
    }
}

// ══════════════════════════════════════════════════════════════
// App state
// ══════════════════════════════════════════════════════════════

/// A fully wired engine over an in-memory database, with handles on the doubles.
pub struct TestEngine {
    pub state: Arc<AppState>,
    pub clock: Arc<ManualClock>,
    pub optimizer: Arc<ScriptedOptimizer>,
    pub target: Arc<RecordingTarget>,
    pub measurement_rx: Option<mpsc::Receiver<QualityMeasurement>>,
}

impl TestEngine {
    /// Starts the evaluation, optimization and maintenance loops.
    pub fn start(&mut self) -> Vec<tokio::task::JoinHandle<()>> {
        match self.measurement_rx.take() {
            Some(rx) => crate::spawn_engine_tasks(&self.state, rx, None),
            None => Vec::new(),
        }
    }
}

pub async fn create_test_engine(config: AppConfig, optimizer: ScriptedOptimizer) -> TestEngine {
    let pool = memory_pool().await;
    create_test_engine_with_pool(config, optimizer, pool).await
}

pub async fn create_test_engine_with_pool(
    config: AppConfig,
    optimizer: ScriptedOptimizer,
    pool: SqlitePool,
) -> TestEngine {
    let clock = Arc::new(ManualClock::default());
    let optimizer = Arc::new(optimizer);
    let target = Arc::new(RecordingTarget::default());
    let collaborators = Collaborators {
        optimizer: optimizer.clone(),
        target: target.clone(),
        telemetry: None,
        sinks: vec![],
    };
    let (state, measurement_rx) = crate::assemble(
        config,
        pool,
        clock.clone(),
        &collaborators,
        Arc::new(Shutdown::new()),
    )
    .await
    .unwrap();
    TestEngine {
        state,
        clock,
        optimizer,
        target,
        measurement_rx: Some(measurement_rx),
    }
}

/// Running engine with a scripted optimizer proposing `temperature 0.7 → 0.5`
/// at 6% / 85%.
pub async fn create_test_app_state(api_key: Option<String>) -> Arc<AppState> {
    let optimizer = ScriptedOptimizer::proposing(temperature_proposal("any", 0.7, 0.5, 6.0, 85.0));
    let mut engine = create_test_engine(test_config(api_key), optimizer).await;
    engine.start();
    engine.state
}
