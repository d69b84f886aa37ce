use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use virtuous_shared::{
    CycleStatus, LearningPattern, OptimizationCycle, QualityDataStore, VirtuousError, VirtuousId,
};

use crate::clock::Clock;

/// Strategy tag recorded when the optimizer itself failed or timed out.
pub const OPTIMIZER_UNAVAILABLE_TAG: &str = "optimizer_unavailable";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    /// Age at which an outcome counts half as much as a fresh one.
    pub half_life_hours: f64,
    /// Patterns handed to the optimizer per request.
    pub top_patterns: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            half_life_hours: 168.0,
            top_patterns: 5,
        }
    }
}

type PatternKey = (String, String);

#[derive(Default)]
struct Inner {
    patterns: HashMap<PatternKey, LearningPattern>,
    /// Keys updated in memory but not yet durably written.
    dirty: HashSet<PatternKey>,
}

/// Decays the pattern's weighted mass to `now`, then adds one outcome.
fn apply_outcome(pattern: &mut LearningPattern, success: bool, now: DateTime<Utc>, half_life_hours: f64) {
    let elapsed_hours = (now - pattern.updated_at).num_milliseconds().max(0) as f64 / 3_600_000.0;
    let decay = if half_life_hours > 0.0 {
        0.5_f64.powf(elapsed_hours / half_life_hours)
    } else {
        1.0
    };
    pattern.weighted_success *= decay;
    pattern.weighted_failure *= decay;

    if success {
        pattern.success_count += 1;
        pattern.weighted_success += 1.0;
    } else {
        pattern.failure_count += 1;
        pattern.weighted_failure += 1.0;
    }

    let mass = pattern.weighted_success + pattern.weighted_failure;
    pattern.confidence = if mass > 0.0 {
        (pattern.weighted_success / mass).clamp(0.0, 1.0)
    } else {
        0.0
    };
    pattern.last_applied_at = Some(now);
    pattern.updated_at = now;
}

/// Durable memory of which strategies worked for which component.
///
/// Updates land in memory first and are marked dirty; `flush` writes the dirty
/// set in one transaction. A failed flush leaves everything dirty for the next
/// attempt, so an outcome is never lost to a storage hiccup.
pub struct LearningStore {
    config: LearningConfig,
    store: Arc<dyn QualityDataStore>,
    clock: Arc<dyn Clock>,
    inner: RwLock<Inner>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl LearningStore {
    pub fn new(config: LearningConfig, store: Arc<dyn QualityDataStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
            inner: RwLock::new(Inner::default()),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Restores persisted patterns. In-memory entries that are still dirty win.
    pub async fn load(&self) -> anyhow::Result<usize> {
        let persisted = self.store.load_patterns().await?;
        let count = persisted.len();
        let mut inner = self.write_inner();
        for p in persisted {
            let key = (p.context.clone(), p.strategy_tag.clone());
            if !inner.dirty.contains(&key) {
                inner.patterns.insert(key, p);
            }
        }
        info!("🧠 Loaded {} learning patterns", count);
        Ok(count)
    }

    /// Records the outcome of a finalized cycle and attempts to persist it.
    pub async fn record(&self, cycle: &OptimizationCycle) {
        let success = cycle.status == CycleStatus::Success;
        let tag = cycle
            .strategy_tag
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        self.record_outcome(&cycle.component_id, &tag, success);

        if let Err(e) = self.flush().await {
            warn!(
                cycle_id = %cycle.cycle_id,
                "Learning update kept in memory, will retry on next flush: {}",
                e
            );
        }
    }

    /// In-memory half of [`record`](Self::record).
    pub fn record_outcome(&self, context: &str, strategy_tag: &str, success: bool) -> LearningPattern {
        let now = self.clock.now();
        let key = (context.to_string(), strategy_tag.to_string());
        let mut inner = self.write_inner();
        let pattern = inner.patterns.entry(key.clone()).or_insert_with(|| LearningPattern {
            id: VirtuousId::from_name(&format!("{}:{}", context, strategy_tag)).to_string(),
            context: context.to_string(),
            strategy_tag: strategy_tag.to_string(),
            confidence: 0.0,
            success_count: 0,
            failure_count: 0,
            created_at: now,
            last_applied_at: None,
            weighted_success: 0.0,
            weighted_failure: 0.0,
            updated_at: now,
        });
        apply_outcome(pattern, success, now, self.config.half_life_hours);
        let snapshot = pattern.clone();
        inner.dirty.insert(key);

        debug!(
            context = %context,
            strategy_tag = %strategy_tag,
            success = success,
            confidence = snapshot.confidence,
            "Learning pattern updated"
        );
        snapshot
    }

    /// Writes every dirty pattern. Returns how many were persisted.
    pub async fn flush(&self) -> Result<usize, VirtuousError> {
        let _guard = self.flush_lock.lock().await;

        let batch: Vec<LearningPattern> = {
            let inner = self.read_inner();
            inner
                .dirty
                .iter()
                .filter_map(|k| inner.patterns.get(k).cloned())
                .collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        self.store
            .upsert_patterns(&batch)
            .await
            .map_err(|e| VirtuousError::Persistence(e.to_string()))?;

        let mut inner = self.write_inner();
        for written in &batch {
            let key = (written.context.clone(), written.strategy_tag.clone());
            // Updated again while the write was in flight: stays dirty.
            if inner.patterns.get(&key) == Some(written) {
                inner.dirty.remove(&key);
            }
        }
        Ok(batch.len())
    }

    /// Patterns for a context, most confident first (ties: more evidence first).
    #[must_use]
    pub fn patterns_for(&self, context: &str) -> Vec<LearningPattern> {
        let inner = self.read_inner();
        let mut patterns: Vec<LearningPattern> = inner
            .patterns
            .values()
            .filter(|p| p.context == context)
            .cloned()
            .collect();
        sort_by_confidence(&mut patterns);
        patterns
    }

    #[must_use]
    pub fn top_patterns(&self, context: &str) -> Vec<LearningPattern> {
        let mut patterns = self.patterns_for(context);
        patterns.truncate(self.config.top_patterns);
        patterns
    }

    #[must_use]
    pub fn pattern(&self, context: &str, strategy_tag: &str) -> Option<LearningPattern> {
        self.read_inner()
            .patterns
            .get(&(context.to_string(), strategy_tag.to_string()))
            .cloned()
    }

    #[must_use]
    pub fn all(&self) -> Vec<LearningPattern> {
        let mut patterns: Vec<LearningPattern> = self.read_inner().patterns.values().cloned().collect();
        sort_by_confidence(&mut patterns);
        patterns
    }

    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.read_inner().dirty.len()
    }

    fn read_inner(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_inner(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn sort_by_confidence(patterns: &mut [LearningPattern]) {
    patterns.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| b.total_outcomes().cmp(&a.total_outcomes()))
            .then_with(|| a.strategy_tag.cmp(&b.strategy_tag))
    });
}
