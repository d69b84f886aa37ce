use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{error, info, warn};

use virtuous_shared::{ChangeLedgerEntry, LedgerEntryType, QualityDataStore, VirtuousError};

pub const DEFAULT_LEDGER_CAPACITY: usize = 50;

const PERSIST_ATTEMPTS: u32 = 3;

/// Aggregates shown next to the ledger on `/changes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub total_changes_tracked: usize,
    pub optimizations: usize,
    pub rollbacks: usize,
    pub successful: usize,
    /// Percentage of successful entries (0 when empty).
    pub success_rate: f64,
    pub rollback_available: bool,
    pub rollback_target: Option<String>,
}

/// Append-only, capacity-bounded record of deployments and rollbacks.
///
/// Readers take the in-memory ring under a read lock; appends and `clear` are
/// serialized by `write_lock` so the durable copy sees the same order.
pub struct ChangeLedger {
    capacity: usize,
    entries: RwLock<VecDeque<ChangeLedgerEntry>>,
    /// Entries whose durable write failed; retried by the flush task.
    pending: Mutex<VecDeque<ChangeLedgerEntry>>,
    store: Arc<dyn QualityDataStore>,
    write_lock: tokio::sync::Mutex<()>,
}

impl ChangeLedger {
    pub fn new(capacity: usize, store: Arc<dyn QualityDataStore>) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
            pending: Mutex::new(VecDeque::new()),
            store,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn load(&self) -> anyhow::Result<usize> {
        let _guard = self.write_lock.lock().await;
        let restored = self.store.load_ledger(self.capacity).await?;
        let count = restored.len();
        *self.write_entries() = restored.into_iter().collect();
        info!("📒 Restored {} change ledger entries", count);
        Ok(count)
    }

    /// Appends an entry, evicting the oldest beyond capacity. The in-memory
    /// append always succeeds; a failed durable write is queued for retry.
    pub async fn append(&self, entry: ChangeLedgerEntry) {
        let _guard = self.write_lock.lock().await;
        {
            let mut entries = self.write_entries();
            entries.push_back(entry.clone());
            while entries.len() > self.capacity {
                entries.pop_front();
            }
        }

        // Earlier failures go first to keep the durable order.
        let has_backlog = !self.lock_pending().is_empty();
        if has_backlog {
            self.lock_pending().push_back(entry);
            self.drain_pending().await;
            return;
        }

        if let Err(e) = self.persist_with_retry(&entry).await {
            error!(
                cycle_id = %entry.cycle_id,
                "Ledger entry not persisted, queued for retry: {}",
                e
            );
            self.lock_pending().push_back(entry);
        }
    }

    async fn persist_with_retry(&self, entry: &ChangeLedgerEntry) -> Result<(), VirtuousError> {
        let mut last_error = String::new();
        for attempt in 0..PERSIST_ATTEMPTS {
            match self.store.append_ledger_entry(entry, self.capacity).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt = attempt + 1, cycle_id = %entry.cycle_id, "Ledger write failed: {}", e);
                    last_error = e.to_string();
                    if attempt + 1 < PERSIST_ATTEMPTS {
                        tokio::time::sleep(std::time::Duration::from_millis(
                            100 * (u64::from(attempt) + 1),
                        ))
                        .await;
                    }
                }
            }
        }
        Err(VirtuousError::Persistence(last_error))
    }

    /// Retries queued writes in order; stops at the first failure.
    pub async fn flush_pending(&self) -> usize {
        let _guard = self.write_lock.lock().await;
        self.drain_pending().await
    }

    async fn drain_pending(&self) -> usize {
        let mut written = 0;
        loop {
            let Some(next) = self.lock_pending().front().cloned() else {
                break;
            };
            match self.store.append_ledger_entry(&next, self.capacity).await {
                Ok(()) => {
                    self.lock_pending().pop_front();
                    written += 1;
                }
                Err(e) => {
                    warn!(cycle_id = %next.cycle_id, "Ledger backlog still failing: {}", e);
                    break;
                }
            }
        }
        written
    }

    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.lock_pending().len()
    }

    /// Empties the ledger view (memory and durable copy). Not itself a ledger
    /// entry, and never touches the live configuration.
    pub async fn clear(&self) -> Result<usize, VirtuousError> {
        let _guard = self.write_lock.lock().await;
        self.store
            .clear_ledger()
            .await
            .map_err(|e| VirtuousError::Persistence(e.to_string()))?;
        self.lock_pending().clear();
        let mut entries = self.write_entries();
        let cleared = entries.len();
        entries.clear();
        Ok(cleared)
    }

    /// The `n` most recent entries, newest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<ChangeLedgerEntry> {
        self.read_entries().iter().rev().take(n).cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn find(&self, cycle_id: &str) -> Option<ChangeLedgerEntry> {
        self.read_entries().iter().find(|e| e.cycle_id == cycle_id).cloned()
    }

    /// Whether a successful rollback already reverted `cycle_id`.
    #[must_use]
    pub fn is_reverted(&self, cycle_id: &str) -> bool {
        self.read_entries().iter().any(|e| {
            e.entry_type == LedgerEntryType::Rollback && e.success && e.reverts.as_deref() == Some(cycle_id)
        })
    }

    /// Default rollback point: the newest successful optimization not yet reverted.
    #[must_use]
    pub fn rollback_target(&self) -> Option<ChangeLedgerEntry> {
        let entries = self.read_entries();
        let reverted: HashSet<&str> = entries
            .iter()
            .filter(|e| e.entry_type == LedgerEntryType::Rollback && e.success)
            .filter_map(|e| e.reverts.as_deref())
            .collect();
        entries
            .iter()
            .rev()
            .find(|e| {
                e.entry_type == LedgerEntryType::Optimization
                    && e.success
                    && !reverted.contains(e.cycle_id.as_str())
            })
            .cloned()
    }

    #[must_use]
    pub fn summary(&self) -> LedgerSummary {
        let target = self.rollback_target().map(|e| e.cycle_id);
        let entries = self.read_entries();
        let total = entries.len();
        let optimizations = entries
            .iter()
            .filter(|e| e.entry_type == LedgerEntryType::Optimization)
            .count();
        let successful = entries.iter().filter(|e| e.success).count();
        let success_rate = if total == 0 {
            0.0
        } else {
            (successful as f64 / total as f64 * 1000.0).round() / 10.0
        };
        LedgerSummary {
            total_changes_tracked: total,
            optimizations,
            rollbacks: total - optimizations,
            successful,
            success_rate,
            rollback_available: target.is_some(),
            rollback_target: target,
        }
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, VecDeque<ChangeLedgerEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, VecDeque<ChangeLedgerEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, VecDeque<ChangeLedgerEntry>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryDataStore;
    use chrono::Utc;

    fn entry(cycle_id: &str, entry_type: LedgerEntryType, success: bool, reverts: Option<&str>) -> ChangeLedgerEntry {
        ChangeLedgerEntry {
            cycle_id: cycle_id.to_string(),
            entry_type,
            changes: vec![],
            success,
            timestamp: Utc::now(),
            reverts: reverts.map(str::to_string),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_recent_is_newest_first_and_bounded() {
        let ledger = ChangeLedger::new(3, Arc::new(MemoryDataStore::default()));
        for i in 0..5 {
            ledger.append(entry(&format!("c{}", i), LedgerEntryType::Optimization, true, None)).await;
        }
        let ids: Vec<_> = ledger.recent(10).into_iter().map(|e| e.cycle_id).collect();
        assert_eq!(ids, vec!["c4", "c3", "c2"]);
        assert_eq!(ledger.recent(1).len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_target_skips_reverted_and_failed() {
        let ledger = ChangeLedger::new(50, Arc::new(MemoryDataStore::default()));
        assert!(ledger.rollback_target().is_none());

        ledger.append(entry("a", LedgerEntryType::Optimization, true, None)).await;
        ledger.append(entry("b", LedgerEntryType::Optimization, true, None)).await;
        ledger.append(entry("c", LedgerEntryType::Optimization, false, None)).await;
        assert_eq!(ledger.rollback_target().unwrap().cycle_id, "b");

        // A failed rollback leaves the target in place
        ledger.append(entry("r0", LedgerEntryType::Rollback, false, Some("b"))).await;
        assert_eq!(ledger.rollback_target().unwrap().cycle_id, "b");

        ledger.append(entry("r1", LedgerEntryType::Rollback, true, Some("b"))).await;
        assert_eq!(ledger.rollback_target().unwrap().cycle_id, "a");
        ledger.append(entry("r2", LedgerEntryType::Rollback, true, Some("a"))).await;
        assert!(ledger.rollback_target().is_none());

        let summary = ledger.summary();
        assert_eq!(summary.total_changes_tracked, 6);
        assert_eq!(summary.optimizations, 3);
        assert_eq!(summary.rollbacks, 3);
        assert_eq!(summary.successful, 4);
        assert!((summary.success_rate - 66.7).abs() < 1e-9);
        assert!(!summary.rollback_available);
    }

    #[tokio::test]
    async fn test_failed_persistence_is_queued_and_retried() {
        let backing = Arc::new(MemoryDataStore::default());
        let ledger = ChangeLedger::new(50, backing.clone());
        backing.set_fail_writes(true);
        ledger.append(entry("a", LedgerEntryType::Optimization, true, None)).await;
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.pending_writes(), 1);

        backing.set_fail_writes(false);
        assert_eq!(ledger.flush_pending().await, 1);
        assert_eq!(ledger.pending_writes(), 0);
        assert_eq!(backing.ledger().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_empties_view_and_store() {
        let backing = Arc::new(MemoryDataStore::default());
        let ledger = ChangeLedger::new(50, backing.clone());
        ledger.append(entry("a", LedgerEntryType::Optimization, true, None)).await;
        ledger.append(entry("b", LedgerEntryType::Optimization, true, None)).await;
        assert_eq!(ledger.clear().await.unwrap(), 2);
        assert!(ledger.is_empty());
        assert!(backing.ledger().is_empty());
        assert!(!ledger.summary().rollback_available);
    }
}
