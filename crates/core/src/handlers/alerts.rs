use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use super::{check_auth, spawn_admin_audit};
use crate::{AppResult, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct AlertQuery {
    pub limit: Option<usize>,
    #[serde(default)]
    pub unresolved: bool,
}

/// **Route:** `GET /alerts?limit=50&unresolved=true`
///
/// Newest first.
pub async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 1000);
    Ok(Json(serde_json::json!({
        "alerts": state.alerts.recent(limit, query.unresolved),
        "unresolved": state.alerts.unresolved_count(),
        "total": state.alerts.len(),
    })))
}

/// **Route:** `POST /alerts/:id/resolve`
///
/// Requires valid API key in `X-API-Key` header.
pub async fn resolve_alert(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    check_auth(&state, &headers)?;
    let alert = state.alerts.resolve(&id)?;
    spawn_admin_audit(
        &state,
        "ALERT_RESOLVED",
        Some(&alert.component_id),
        format!("Operator resolved alert {}", alert.id),
        None,
    );
    Ok(Json(serde_json::json!({ "status": "success", "alert": alert })))
}
