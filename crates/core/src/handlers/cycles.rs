use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;
use tracing::info;

use super::{check_auth, spawn_admin_audit, validation_error, LimitQuery};
use crate::validation::{validate_request, TriggerRequest};
use crate::{AppError, AppResult, AppState};

/// Force an optimization cycle for a component.
///
/// **Route:** `POST /trigger`
///
/// # Authentication
/// Requires valid API key in `X-API-Key` header. Rate-limited per client.
///
/// # Request Body
/// ```json
/// { "component_id": "summarizer", "reason": "customer complaints" }
/// ```
///
/// # Response
/// - **202 Accepted:** `{ "status": "success", "cycle_id": "...", "message": "..." }`
/// - **409 Conflict:** a cycle is already running, the component is in
///   cooldown, or the global cap is reached. The trigger is dropped.
pub async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<TriggerRequest>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    check_auth(&state, &headers)?;
    validate_request(&payload).map_err(validation_error)?;

    let reason = payload
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map_or_else(|| "manual trigger".to_string(), |r| format!("manual trigger: {}", r));

    let cycle_id = state
        .orchestrator
        .spawn_cycle(&payload.component_id, &reason)
        .map_err(|rejection| {
            info!(component_id = %payload.component_id, "Manual trigger rejected: {}", rejection);
            AppError::Conflict(rejection.to_string())
        })?;

    spawn_admin_audit(
        &state,
        "CYCLE_TRIGGERED",
        Some(&payload.component_id),
        reason.clone(),
        Some(serde_json::json!({ "cycle_id": cycle_id })),
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": "success",
            "cycle_id": cycle_id,
            "component_id": payload.component_id,
            "message": format!("optimization cycle started ({})", reason),
        })),
    ))
}

/// Recent finalized cycles, newest first.
///
/// **Route:** `GET /cycles?limit=20`
pub async fn list_cycles(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let limit = query.resolve(20, state.orchestrator.config().history_size.max(1));
    let cycles = state.orchestrator.recent_cycles(limit);
    Ok(Json(serde_json::json!({
        "cycles": cycles,
        "in_flight": state.orchestrator.in_flight(),
    })))
}
