use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::{AppResult, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct LearningQuery {
    pub context: Option<String>,
}

/// Learning patterns ordered by confidence, optionally for one component.
///
/// **Route:** `GET /learning?context=summarizer`
pub async fn list_patterns(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LearningQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let patterns = match query.context.as_deref() {
        Some(context) => state.learning.patterns_for(context),
        None => state.learning.all(),
    };
    Ok(Json(serde_json::json!({
        "patterns": patterns,
        "pending_writes": state.learning.pending_writes(),
    })))
}
