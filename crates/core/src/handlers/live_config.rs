use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use virtuous_shared::VirtuousError;

use super::{check_auth, validation_error};
use crate::validation::{validate_request, ConfigSetRequest};
use crate::{AppError, AppResult, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct ConfigQuery {
    pub component: Option<String>,
}

/// Immutable snapshot of the live configuration. With `?component=`, the
/// effective settings for that component (defaults plus overrides).
///
/// **Route:** `GET /config`
pub async fn get_config(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConfigQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let snapshot = state.governor.snapshot();
    match query.component {
        Some(component) => Ok(Json(serde_json::json!({
            "version": snapshot.version,
            "updated_at": snapshot.updated_at,
            "component_id": component,
            "settings": snapshot.settings_for(&component),
        }))),
        None => Ok(Json(serde_json::json!(*snapshot))),
    }
}

/// Operator override of a single setting. Goes through the deployment
/// governor, so it is recorded in the ledger and can be rolled back.
///
/// **Route:** `POST /config`
///
/// # Authentication
/// Requires valid API key in `X-API-Key` header.
///
/// # Request Body
/// ```json
/// { "component_id": "summarizer", "setting": { "kind": "model", "value": "gpt-4o" }, "reason": "..." }
/// ```
pub async fn set_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<ConfigSetRequest>,
) -> AppResult<Json<serde_json::Value>> {
    check_auth(&state, &headers)?;
    validate_request(&payload).map_err(validation_error)?;

    info!(
        component_id = %payload.component_id,
        setting = %payload.setting.key(),
        "⚙️ Manual configuration change requested"
    );
    let result = state
        .orchestrator
        .apply_override(&payload.component_id, payload.setting, &payload.reason)
        .await?;

    if !result.success {
        return Err(AppError::Virtuous(VirtuousError::DeploymentFailure(
            result.error.unwrap_or_else(|| "change was not applied".to_string()),
        )));
    }

    Ok(Json(serde_json::json!({
        "status": "success",
        "cycle_id": result.cycle.cycle_id,
        "config_version": result.config_version,
        "changes": result.cycle.proposed_changes,
    })))
}
