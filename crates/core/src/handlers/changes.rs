use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use std::sync::Arc;
use tracing::{info, warn};

use super::{check_auth, spawn_admin_audit, validation_error, LimitQuery};
use crate::validation::{validate_request, RollbackRequest};
use crate::{AppError, AppResult, AppState};

/// Recent ledger entries and summary statistics.
///
/// **Route:** `GET /changes?limit=20`
///
/// # Response
/// ```json
/// {
///   "changes": [{ "cycle_id": "...", "type": "optimization", "changes": [...], "success": true, ... }],
///   "summary": { "total_changes_tracked": 3, "success_rate": 100.0, "rollback_available": true, ... }
/// }
/// ```
pub async fn changes_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let limit = query.resolve(20, state.ledger.capacity());
    Ok(Json(serde_json::json!({
        "changes": state.ledger.recent(limit),
        "summary": state.ledger.summary(),
    })))
}

/// Revert a past optimization.
///
/// **Route:** `POST /rollback`
///
/// # Authentication
/// Requires valid API key in `X-API-Key` header. Rate-limited per client.
/// Callers confirm with the end user before invoking.
///
/// # Request Body
/// Optional. Without a body (or without `target_cycle_id`) the newest
/// successful, not yet reverted optimization is rolled back.
/// ```json
/// { "target_cycle_id": "5f0c..." }
/// ```
///
/// # Response
/// - **200 OK:** the rollback entry, the reverted changes and the new summary
/// - **404 Not Found:** nothing to roll back, or unknown cycle id
/// - **409 Conflict:** the target was already reverted
/// - **422 Unprocessable Entity:** the inverse could not be applied
pub async fn rollback_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<serde_json::Value>> {
    check_auth(&state, &headers)?;

    let request = if body.iter().all(u8::is_ascii_whitespace) {
        RollbackRequest::default()
    } else {
        serde_json::from_slice::<RollbackRequest>(&body)
            .map_err(|e| AppError::Validation(format!("Invalid rollback request: {}", e)))?
    };
    validate_request(&request).map_err(validation_error)?;

    info!(target = ?request.target_cycle_id, "⏪ Rollback requested");
    let result = state
        .governor
        .rollback(request.target_cycle_id.clone(), Some("operator".to_string()))
        .await
        .map_err(|e| {
            warn!(target = ?request.target_cycle_id, "Rollback failed: {}", e);
            AppError::Virtuous(e)
        })?;

    Ok(Json(serde_json::json!({
        "status": "success",
        "rollback_cycle_id": result.rollback_cycle_id,
        "reverted_cycle_id": result.reverted_cycle_id,
        "changes": result.changes,
        "config_version": result.config_version,
        "summary": state.ledger.summary(),
    })))
}

/// Empty the change ledger. The live configuration is untouched.
///
/// **Route:** `POST /clear-history`
///
/// # Authentication
/// Requires valid API key in `X-API-Key` header.
pub async fn clear_history_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<serde_json::Value>> {
    check_auth(&state, &headers)?;

    let cleared = state.ledger.clear().await?;
    info!(cleared = cleared, "🧹 Change ledger cleared");
    spawn_admin_audit(
        &state,
        "LEDGER_CLEARED",
        None,
        format!("Operator cleared {} ledger entries", cleared),
        None,
    );

    Ok(Json(serde_json::json!({
        "status": "success",
        "cleared": cleared,
        "config_version": state.governor.snapshot().version,
    })))
}
