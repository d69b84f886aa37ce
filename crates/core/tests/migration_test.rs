//! Database migration and initialization tests.
//! Tests that DB init is idempotent and creates required tables.

use virtuous_core::test_utils::memory_pool;
use virtuous_core::{query_audit_logs, write_audit_log, AuditLogEntry};

#[tokio::test]
async fn test_db_init_is_idempotent() {
    let pool = memory_pool().await;

    // memory_pool already ran init_db once
    virtuous_core::db::init_db(&pool).await.unwrap();
}

#[tokio::test]
async fn test_migration_creates_required_tables() {
    let pool = memory_pool().await;

    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name"
    )
    .fetch_all(&pool)
    .await
    .unwrap();

    let table_names: Vec<String> = tables.into_iter().map(|(n,)| n).collect();

    for required in &["learning_patterns", "change_ledger", "live_config", "audit_logs"] {
        assert!(
            table_names.contains(&(*required).to_string()),
            "Required table '{}' not found; existing tables: {:?}",
            required,
            table_names
        );
    }
}

#[tokio::test]
async fn test_ledger_rejects_unknown_entry_type() {
    let pool = memory_pool().await;

    let result = sqlx::query(
        "INSERT INTO change_ledger (cycle_id, entry_type, changes, success, timestamp)
         VALUES ('c1', 'bogus', '[]', 1, '2026-01-01T00:00:00Z')",
    )
    .execute(&pool)
    .await;
    assert!(result.is_err(), "CHECK constraint should reject unknown entry types");
}

#[tokio::test]
async fn test_audit_log_round_trip() {
    let pool = memory_pool().await;

    write_audit_log(
        &pool,
        AuditLogEntry::new("LEDGER_CLEARED", None, "SUCCESS", "Operator cleared 3 ledger entries")
            .with_actor("operator"),
    )
    .await
    .unwrap();
    write_audit_log(
        &pool,
        AuditLogEntry::new("CYCLE_TRIGGERED", Some("summarizer"), "SUCCESS", "manual trigger")
            .with_metadata(serde_json::json!({ "cycle_id": "c1" })),
    )
    .await
    .unwrap();

    let logs = query_audit_logs(&pool, 10).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].event_type, "CYCLE_TRIGGERED");
    assert_eq!(logs[0].target_id.as_deref(), Some("summarizer"));
    assert_eq!(logs[0].metadata.as_ref().unwrap()["cycle_id"], "c1");
    assert_eq!(logs[1].actor_id.as_deref(), Some("operator"));
}
