use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;

use virtuous_shared::QualityMeasurement;

use super::{check_auth, validation_error};
use crate::validation::{validate_request, MeasurementRequest};
use crate::{AppError, AppResult, AppState};

/// Push ingestion. Measurements join the same evaluation queue as the
/// telemetry poller's, stamped with the server's clock.
///
/// **Route:** `POST /measurements`
///
/// # Authentication
/// Requires valid API key in `X-API-Key` header.
///
/// # Request Body
/// ```json
/// { "component_id": "summarizer", "model_id": "gpt-4o-mini", "score": 0.91, "sample_size": 25 }
/// ```
///
/// # Response
/// - **202 Accepted:** queued for evaluation
/// - **409 Conflict:** the evaluation queue is full; retry later
pub async fn ingest_measurement(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<MeasurementRequest>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    check_auth(&state, &headers)?;
    validate_request(&payload).map_err(validation_error)?;

    let measurement = QualityMeasurement {
        component_id: payload.component_id,
        model_id: payload.model_id,
        score: payload.score,
        sample_size: payload.sample_size.unwrap_or(1),
        observed_at: state.clock.now(),
        latency_ms: payload.latency_ms,
    };
    measurement.validate()?;

    let component_id = measurement.component_id.clone();
    state.measurement_tx.try_send(measurement).map_err(|e| match e {
        TrySendError::Full(_) => AppError::Conflict("evaluation queue is full".to_string()),
        TrySendError::Closed(_) => AppError::Internal(anyhow::anyhow!("evaluation loop is not running")),
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "accepted", "component_id": component_id })),
    ))
}
