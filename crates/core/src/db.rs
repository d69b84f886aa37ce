use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::time::{timeout, Duration};
use tracing::info;

use virtuous_shared::{
    ChangeLedgerEntry, LearningPattern, LedgerEntryType, LiveConfiguration, QualityDataStore,
};

// Bound every statement so a locked database cannot hang a cycle.
const DB_TIMEOUT_SECS: u64 = 10;

fn timed_out(_: tokio::time::error::Elapsed) -> anyhow::Error {
    anyhow::anyhow!("Database operation timed out after {}s", DB_TIMEOUT_SECS)
}

fn parse_ts(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn count(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or(0)
}

pub struct SqliteDataStore {
    pool: SqlitePool,
}

impl SqliteDataStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

type PatternRow = (
    String,
    String,
    String,
    f64,
    i64,
    i64,
    f64,
    f64,
    String,
    Option<String>,
    String,
);

type LedgerRow = (String, String, String, i64, String, Option<String>, Option<String>);

#[async_trait]
impl QualityDataStore for SqliteDataStore {
    async fn upsert_patterns(&self, patterns: &[LearningPattern]) -> anyhow::Result<()> {
        if patterns.is_empty() {
            return Ok(());
        }

        // One transaction per flush: either every dirty pattern lands or none does.
        let write = async {
            let mut tx = self.pool.begin().await?;
            for p in patterns {
                sqlx::query(
                    "INSERT INTO learning_patterns (context, strategy_tag, id, confidence, success_count, failure_count,
                        weighted_success, weighted_failure, created_at, last_applied_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(context, strategy_tag) DO UPDATE SET
                        confidence = excluded.confidence,
                        success_count = excluded.success_count,
                        failure_count = excluded.failure_count,
                        weighted_success = excluded.weighted_success,
                        weighted_failure = excluded.weighted_failure,
                        last_applied_at = excluded.last_applied_at,
                        updated_at = excluded.updated_at",
                )
                .bind(&p.context)
                .bind(&p.strategy_tag)
                .bind(&p.id)
                .bind(p.confidence)
                .bind(i64::try_from(p.success_count).unwrap_or(i64::MAX))
                .bind(i64::try_from(p.failure_count).unwrap_or(i64::MAX))
                .bind(p.weighted_success)
                .bind(p.weighted_failure)
                .bind(p.created_at.to_rfc3339())
                .bind(p.last_applied_at.map(|t| t.to_rfc3339()))
                .bind(p.updated_at.to_rfc3339())
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        };

        timeout(Duration::from_secs(DB_TIMEOUT_SECS), write)
            .await
            .map_err(timed_out)?
            .map_err(|e| anyhow::anyhow!("Failed to upsert {} learning patterns: {}", patterns.len(), e))?;

        Ok(())
    }

    async fn load_patterns(&self) -> anyhow::Result<Vec<LearningPattern>> {
        let query_future = sqlx::query_as::<_, PatternRow>(
            "SELECT context, strategy_tag, id, confidence, success_count, failure_count,
                    weighted_success, weighted_failure, created_at, last_applied_at, updated_at
             FROM learning_patterns
             ORDER BY context, confidence DESC",
        )
        .fetch_all(&self.pool);

        let rows = timeout(Duration::from_secs(DB_TIMEOUT_SECS), query_future)
            .await
            .map_err(timed_out)?
            .map_err(|e| anyhow::anyhow!("Failed to load learning patterns: {}", e))?;

        let mut patterns = Vec::with_capacity(rows.len());
        for (context, strategy_tag, id, confidence, sc, fc, ws, wf, created, applied, updated) in rows {
            patterns.push(LearningPattern {
                id,
                context,
                strategy_tag,
                confidence,
                success_count: count(sc),
                failure_count: count(fc),
                created_at: parse_ts(&created)?,
                last_applied_at: applied.as_deref().map(parse_ts).transpose()?,
                weighted_success: ws,
                weighted_failure: wf,
                updated_at: parse_ts(&updated)?,
            });
        }
        Ok(patterns)
    }

    async fn append_ledger_entry(
        &self,
        entry: &ChangeLedgerEntry,
        capacity: usize,
    ) -> anyhow::Result<()> {
        let changes = serde_json::to_string(&entry.changes)?;
        let keep = i64::try_from(capacity).unwrap_or(i64::MAX);

        let write = async {
            let mut tx = self.pool.begin().await?;
            // A retried append of an already stored entry is a no-op.
            sqlx::query(
                "INSERT INTO change_ledger (cycle_id, entry_type, changes, success, timestamp, reverts, error)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(cycle_id) DO NOTHING",
            )
            .bind(&entry.cycle_id)
            .bind(entry.entry_type.to_string())
            .bind(&changes)
            .bind(entry.success)
            .bind(entry.timestamp.to_rfc3339())
            .bind(&entry.reverts)
            .bind(&entry.error)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "DELETE FROM change_ledger WHERE seq NOT IN
                    (SELECT seq FROM change_ledger ORDER BY seq DESC LIMIT ?)",
            )
            .bind(keep)
            .execute(&mut *tx)
            .await?;
            tx.commit().await
        };

        timeout(Duration::from_secs(DB_TIMEOUT_SECS), write)
            .await
            .map_err(timed_out)?
            .map_err(|e| anyhow::anyhow!("Failed to append ledger entry '{}': {}", entry.cycle_id, e))?;

        Ok(())
    }

    async fn load_ledger(&self, limit: usize) -> anyhow::Result<Vec<ChangeLedgerEntry>> {
        let query_future = sqlx::query_as::<_, LedgerRow>(
            "SELECT cycle_id, entry_type, changes, success, timestamp, reverts, error
             FROM (SELECT * FROM change_ledger ORDER BY seq DESC LIMIT ?)
             ORDER BY seq ASC",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool);

        let rows = timeout(Duration::from_secs(DB_TIMEOUT_SECS), query_future)
            .await
            .map_err(timed_out)?
            .map_err(|e| anyhow::anyhow!("Failed to load change ledger: {}", e))?;

        let mut entries = Vec::with_capacity(rows.len());
        for (cycle_id, entry_type, changes, success, timestamp, reverts, error) in rows {
            let entry_type = match entry_type.as_str() {
                "optimization" => LedgerEntryType::Optimization,
                "rollback" => LedgerEntryType::Rollback,
                other => anyhow::bail!("Unknown ledger entry type '{}' for '{}'", other, cycle_id),
            };
            entries.push(ChangeLedgerEntry {
                changes: serde_json::from_str(&changes)
                    .map_err(|e| anyhow::anyhow!("Corrupt changes for '{}': {}", cycle_id, e))?,
                cycle_id,
                entry_type,
                success: success != 0,
                timestamp: parse_ts(&timestamp)?,
                reverts,
                error,
            });
        }
        Ok(entries)
    }

    async fn clear_ledger(&self) -> anyhow::Result<u64> {
        let query_future = sqlx::query("DELETE FROM change_ledger").execute(&self.pool);
        let result = timeout(Duration::from_secs(DB_TIMEOUT_SECS), query_future)
            .await
            .map_err(timed_out)?
            .map_err(|e| anyhow::anyhow!("Failed to clear change ledger: {}", e))?;
        Ok(result.rows_affected())
    }

    async fn save_live_config(&self, config: &LiveConfiguration) -> anyhow::Result<()> {
        let payload = serde_json::to_string(config)?;
        // Never let an older version overwrite a newer one.
        let query_future = sqlx::query(
            "INSERT INTO live_config (id, version, payload, updated_at) VALUES (1, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                version = excluded.version,
                payload = excluded.payload,
                updated_at = excluded.updated_at
             WHERE excluded.version >= live_config.version",
        )
        .bind(i64::try_from(config.version).unwrap_or(i64::MAX))
        .bind(payload)
        .bind(config.updated_at.to_rfc3339())
        .execute(&self.pool);

        timeout(Duration::from_secs(DB_TIMEOUT_SECS), query_future)
            .await
            .map_err(timed_out)?
            .map_err(|e| anyhow::anyhow!("Failed to save live config v{}: {}", config.version, e))?;
        Ok(())
    }

    async fn load_live_config(&self) -> anyhow::Result<Option<LiveConfiguration>> {
        let query_future =
            sqlx::query_as::<_, (String,)>("SELECT payload FROM live_config WHERE id = 1")
                .fetch_optional(&self.pool);

        let row = timeout(Duration::from_secs(DB_TIMEOUT_SECS), query_future)
            .await
            .map_err(timed_out)?
            .map_err(|e| anyhow::anyhow!("Failed to load live config: {}", e))?;

        match row {
            Some((payload,)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }
}

pub async fn init_db(pool: &SqlitePool) -> anyhow::Result<()> {
    info!("Running database migrations...");

    // Schema changes get a longer budget than ordinary statements.
    const MIGRATION_TIMEOUT_SECS: u64 = 30;
    let migration_future = sqlx::migrate!("./migrations").run(pool);
    timeout(Duration::from_secs(MIGRATION_TIMEOUT_SECS), migration_future)
        .await
        .map_err(|_| anyhow::anyhow!("Database migrations timed out after {}s", MIGRATION_TIMEOUT_SECS))?
        .map_err(|e| anyhow::anyhow!("Database migration failed: {}", e))?;

    Ok(())
}

// ══════════════════════════════════════════════════════════════
// Audit Log
// ══════════════════════════════════════════════════════════════

/// Operator and governance actions (trigger, rollback, ledger clear, deploy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub actor_id: Option<String>,
    pub target_id: Option<String>,
    pub result: String,
    pub reason: String,
    pub metadata: Option<serde_json::Value>,
}

impl AuditLogEntry {
    #[must_use]
    pub fn new(event_type: &str, target_id: Option<&str>, result: &str, reason: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            actor_id: None,
            target_id: target_id.map(str::to_string),
            result: result.to_string(),
            reason: reason.into(),
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor_id = Some(actor.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

pub async fn write_audit_log(pool: &SqlitePool, entry: AuditLogEntry) -> anyhow::Result<()> {
    let metadata_str = entry.metadata.map(|v| v.to_string());

    let query_future = sqlx::query(
        "INSERT INTO audit_logs (timestamp, event_type, actor_id, target_id, result, reason, metadata)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.timestamp.to_rfc3339())
    .bind(&entry.event_type)
    .bind(&entry.actor_id)
    .bind(&entry.target_id)
    .bind(&entry.result)
    .bind(&entry.reason)
    .bind(&metadata_str)
    .execute(pool);

    timeout(Duration::from_secs(DB_TIMEOUT_SECS), query_future)
        .await
        .map_err(timed_out)?
        .map_err(|e| anyhow::anyhow!("Database operation failed: {}", e))?;

    Ok(())
}

/// Writes an audit entry in the background, retrying up to 3 times with backoff.
pub fn spawn_audit_log(pool: SqlitePool, entry: AuditLogEntry) {
    tokio::spawn(async move {
        for attempt in 0..3u32 {
            match write_audit_log(&pool, entry.clone()).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::error!(attempt = attempt + 1, "Failed to write audit log: {}", e);
                    if attempt < 2 {
                        tokio::time::sleep(std::time::Duration::from_millis(
                            100 * (u64::from(attempt) + 1),
                        ))
                        .await;
                    }
                }
            }
        }
        tracing::error!(event_type = %entry.event_type, "Audit log entry permanently lost after 3 attempts");
    });
}

/// Most recent audit entries first.
pub async fn query_audit_logs(pool: &SqlitePool, limit: i64) -> anyhow::Result<Vec<AuditLogEntry>> {
    #[allow(clippy::type_complexity)]
    let query_future = sqlx::query_as::<_, (String, String, Option<String>, Option<String>, String, String, Option<String>)>(
        "SELECT timestamp, event_type, actor_id, target_id, result, reason, metadata
         FROM audit_logs
         ORDER BY id DESC
         LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool);

    let rows = timeout(Duration::from_secs(DB_TIMEOUT_SECS), query_future)
        .await
        .map_err(timed_out)?
        .map_err(|e| anyhow::anyhow!("Database query failed: {}", e))?;

    let mut logs = Vec::with_capacity(rows.len());
    for (timestamp, event_type, actor_id, target_id, result, reason, metadata) in rows {
        logs.push(AuditLogEntry {
            timestamp: parse_ts(&timestamp)?,
            event_type,
            actor_id,
            target_id,
            result,
            reason,
            metadata: metadata.and_then(|s| serde_json::from_str(&s).ok()),
        });
    }
    Ok(logs)
}
