pub mod alerts;
pub mod changes;
pub mod cycles;
pub mod learning;
pub mod live_config;
pub mod measurements;
pub mod status;

use axum::{http::HeaderMap, Json};
use serde::Deserialize;

use crate::{AppError, AppResult, AppState};

/// Mutating routes require the configured API key. Without one, release
/// builds refuse and debug builds allow with a warning.
pub(crate) fn check_auth(state: &AppState, headers: &HeaderMap) -> AppResult<()> {
    use subtle::ConstantTimeEq;
    if let Some(ref required_key) = state.config.api_key {
        let auth_header = headers.get("X-API-Key").and_then(|h| h.to_str().ok());

        let matches: bool = match auth_header {
            Some(provided) => provided.as_bytes().ct_eq(required_key.as_bytes()).into(),
            None => false,
        };
        if !matches {
            return Err(AppError::Forbidden("missing or invalid X-API-Key".to_string()));
        }
    } else {
        if !cfg!(debug_assertions) {
            return Err(AppError::Forbidden(
                "VIRTUOUS_API_KEY is not configured on the server".to_string(),
            ));
        }
        tracing::warn!(
            "⚠️  SECURITY: operator API access without authentication (debug mode, no VIRTUOUS_API_KEY)"
        );
    }
    Ok(())
}

/// Fire-and-forget audit record for operator actions.
pub(crate) fn spawn_admin_audit(
    state: &AppState,
    event_type: &str,
    target_id: Option<&str>,
    reason: impl Into<String>,
    metadata: Option<serde_json::Value>,
) {
    let mut entry = crate::db::AuditLogEntry::new(event_type, target_id, "SUCCESS", reason)
        .with_actor("operator");
    if let Some(metadata) = metadata {
        entry = entry.with_metadata(metadata);
    }
    crate::db::spawn_audit_log(state.pool.clone(), entry);
}

/// `?limit=` shared by the list endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    pub(crate) fn resolve(&self, default: usize, max: usize) -> usize {
        self.limit.unwrap_or(default).clamp(1, max)
    }
}

pub(crate) fn validation_error(message: String) -> AppError {
    AppError::Validation(message)
}

/// **Route:** `GET /system/version`
pub async fn version_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "sdk_version": virtuous_shared::SDK_VERSION,
    }))
}
