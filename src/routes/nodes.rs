use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use super::AppState;
use crate::error::ApiError;
use crate::maintenance;
use crate::models::SensorNode;

// ---

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/nodes", get(list).post(provision))
        .route("/nodes/{id}", get(fetch).delete(remove))
}

async fn list(State(state): State<AppState>) -> Result<Json<Vec<SensorNode>>, ApiError> {
    Ok(Json(state.store.list_nodes().await?))
}

async fn fetch(
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
) -> Result<Json<SensorNode>, ApiError> {
    state
        .store
        .get_node(node_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("node {node_id}")))
}

#[derive(Debug, Deserialize)]
struct ProvisionRequest {
    node_id: i64,
    name: Option<String>,
}

async fn provision(
    State(state): State<AppState>,
    body: Result<Json<ProvisionRequest>, JsonRejection>,
) -> Result<Json<SensorNode>, ApiError> {
    // ---
    let Json(request) = body.map_err(|e| ApiError::Validation(e.body_text()))?;
    let name = request
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());

    let node = state.store.provision_node(request.node_id, name).await?;
    info!("Provisioned node {} as '{}'", node.node_id, node.name);
    Ok(Json(node))
}

async fn remove(
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    // ---
    let live_after = maintenance::saturating_before(
        Utc::now(),
        maintenance::seconds(state.config.node_delete_guard_secs),
    );
    state.store.delete_node(node_id, live_after).await?;
    info!("Deleted node {} with its readings and incidents", node_id);
    Ok(StatusCode::NO_CONTENT)
}
