use virtuous_core::test_utils::{
    create_test_engine, create_test_engine_with_pool, memory_pool, temperature_proposal,
    test_config, ScriptedOptimizer, TestEngine,
};
use virtuous_shared::{LedgerEntryType, SettingKey, SettingValue, VirtuousError};

fn optimizer() -> ScriptedOptimizer {
    ScriptedOptimizer::proposing(temperature_proposal("any", 0.7, 0.5, 6.0, 85.0))
}

async fn optimize(engine: &TestEngine, component: &str) -> String {
    let orchestrator = &engine.state.orchestrator;
    let pending = orchestrator.try_begin(component, "degraded").unwrap();
    let cycle = orchestrator.run(pending).await;
    assert_eq!(cycle.status, virtuous_shared::CycleStatus::Success);
    cycle.cycle_id
}

fn temperature(engine: &TestEngine, component: &str) -> SettingValue {
    engine.state.governor.settings_for(component).get(SettingKey::Temperature)
}

#[tokio::test]
async fn test_rollback_applies_exact_inverse() {
    let engine = create_test_engine(test_config(None), optimizer()).await;
    let cycle_id = optimize(&engine, "X").await;
    assert_eq!(temperature(&engine, "X"), SettingValue::Temperature(0.5));

    let result = engine.state.governor.rollback(None, None).await.unwrap();

    assert_eq!(result.reverted_cycle_id, cycle_id);
    assert_eq!(result.changes.len(), 1);
    assert_eq!(result.changes[0].before, SettingValue::Temperature(0.5));
    assert_eq!(result.changes[0].after, SettingValue::Temperature(0.7));
    assert_eq!(temperature(&engine, "X"), SettingValue::Temperature(0.7));

    let ledger = &engine.state.ledger;
    assert_eq!(ledger.len(), 2);
    let newest = &ledger.recent(1)[0];
    assert_eq!(newest.entry_type, LedgerEntryType::Rollback);
    assert_eq!(newest.reverts.as_deref(), Some(cycle_id.as_str()));
    assert!(newest.success);

    // Pushed to the serving target in both directions.
    let applied = engine.target.applied();
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[1], ("X".to_string(), SettingValue::Temperature(0.7)));
}

#[tokio::test]
async fn test_default_target_walks_back_through_history() {
    let engine = create_test_engine(test_config(None), optimizer()).await;
    let first = optimize(&engine, "A").await;
    let second = optimize(&engine, "B").await;

    let summary = engine.state.ledger.summary();
    assert!(summary.rollback_available);
    assert_eq!(summary.rollback_target.as_deref(), Some(second.as_str()));

    let result = engine.state.governor.rollback(None, None).await.unwrap();
    assert_eq!(result.reverted_cycle_id, second);

    let summary = engine.state.ledger.summary();
    assert!(summary.rollback_available);
    assert_eq!(summary.rollback_target.as_deref(), Some(first.as_str()));

    engine.state.governor.rollback(None, None).await.unwrap();
    let summary = engine.state.ledger.summary();
    assert!(!summary.rollback_available);
    assert_eq!(summary.optimizations, 2);
    assert_eq!(summary.rollbacks, 2);

    let err = engine.state.governor.rollback(None, None).await.unwrap_err();
    assert!(matches!(err, VirtuousError::NotFound(_)));
}

#[tokio::test]
async fn test_explicit_target_rules() {
    let engine = create_test_engine(test_config(None), optimizer()).await;
    let cycle_id = optimize(&engine, "X").await;

    let err = engine
        .state
        .governor
        .rollback(Some("no-such-cycle".to_string()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, VirtuousError::NotFound(_)));

    let rollback = engine
        .state
        .governor
        .rollback(Some(cycle_id.clone()), None)
        .await
        .unwrap();

    let err = engine
        .state
        .governor
        .rollback(Some(cycle_id), None)
        .await
        .unwrap_err();
    assert!(matches!(err, VirtuousError::Conflict(_)));

    let err = engine
        .state
        .governor
        .rollback(Some(rollback.rollback_cycle_id), None)
        .await
        .unwrap_err();
    assert!(matches!(err, VirtuousError::Validation(_)));
}

#[tokio::test]
async fn test_failed_rollback_is_recorded_and_retryable() {
    let engine = create_test_engine(test_config(None), optimizer()).await;
    let cycle_id = optimize(&engine, "X").await;

    engine.target.fail_on("temperature");
    let err = engine.state.governor.rollback(None, None).await.unwrap_err();
    assert!(matches!(err, VirtuousError::RollbackFailure(_)));
    assert_eq!(temperature(&engine, "X"), SettingValue::Temperature(0.5));

    let failed = &engine.state.ledger.recent(1)[0];
    assert_eq!(failed.entry_type, LedgerEntryType::Rollback);
    assert!(!failed.success);

    // Still the default target.
    engine.target.heal();
    let result = engine.state.governor.rollback(None, None).await.unwrap();
    assert_eq!(result.reverted_cycle_id, cycle_id);
    assert_eq!(engine.state.ledger.len(), 3);
}

#[tokio::test]
async fn test_ledger_keeps_most_recent_fifty() {
    let engine = create_test_engine(test_config(None), optimizer()).await;

    let mut ids = Vec::new();
    for i in 0..55 {
        ids.push(optimize(&engine, &format!("component-{i}")).await);
        assert!(engine.state.ledger.summary().total_changes_tracked <= 50);
    }

    let ledger = &engine.state.ledger;
    assert_eq!(ledger.len(), 50);
    for evicted in &ids[..5] {
        assert!(ledger.find(evicted).is_none());
    }
    let recent: Vec<String> = ledger.recent(50).into_iter().map(|e| e.cycle_id).collect();
    let expected: Vec<String> = ids[5..].iter().rev().cloned().collect();
    assert_eq!(recent, expected);
}

#[tokio::test]
async fn test_clear_history_keeps_live_config() {
    let engine = create_test_engine(test_config(None), optimizer()).await;
    optimize(&engine, "X").await;
    let version = engine.state.governor.snapshot().version;

    let cleared = engine.state.ledger.clear().await.unwrap();
    assert_eq!(cleared, 1);
    assert!(engine.state.ledger.is_empty());
    assert!(!engine.state.ledger.summary().rollback_available);
    assert_eq!(engine.state.governor.snapshot().version, version);
    assert_eq!(temperature(&engine, "X"), SettingValue::Temperature(0.5));
}

#[tokio::test]
async fn test_state_survives_restart() {
    let pool = memory_pool().await;

    let first = create_test_engine_with_pool(test_config(None), optimizer(), pool.clone()).await;
    let cycle_id = optimize(&first, "X").await;
    let version = first.state.governor.snapshot().version;
    first.state.learning.flush().await.unwrap();

    let second = create_test_engine_with_pool(test_config(None), optimizer(), pool).await;
    let state = &second.state;

    assert_eq!(state.governor.snapshot().version, version);
    assert_eq!(temperature(&second, "X"), SettingValue::Temperature(0.5));
    assert_eq!(state.ledger.len(), 1);
    assert_eq!(state.ledger.summary().rollback_target.as_deref(), Some(cycle_id.as_str()));
    let patterns = state.learning.patterns_for("X");
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].success_count, 1);

    // The restored ledger is a working rollback source.
    state.governor.rollback(None, None).await.unwrap();
    assert_eq!(temperature(&second, "X"), SettingValue::Temperature(0.7));
}
