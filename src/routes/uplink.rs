//! `POST /uplink`: raw network-server envelopes in, incident outcome out.

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use super::AppState;
use crate::engine::IngestOutcome;
use crate::error::ApiError;
use crate::normalize::normalize;

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/uplink", post(handler))
}

async fn handler(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<IngestOutcome>, ApiError> {
    // ---
    let Json(raw) = body.map_err(|e| ApiError::Validation(e.body_text()))?;
    let ingestion = normalize(&raw, Utc::now())?;
    debug!(
        "POST /uplink - node {} with {} hazard report(s)",
        ingestion.node_id,
        ingestion.hazards.len()
    );

    // Run on its own task so a client hanging up does not cut a unit of
    // work in half.
    let engine = state.engine.clone();
    let outcome = tokio::spawn(async move { engine.ingest(ingestion).await })
        .await
        .map_err(|e| ApiError::Internal(format!("ingestion task failed: {e}")))??;

    Ok(Json(outcome))
}
