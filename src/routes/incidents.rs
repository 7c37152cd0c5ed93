//! Incident history, active incidents, timeline, manual resolution and
//! retention cleanup.

use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Path, Query, State},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{hazard_param, limit_param, query, AppState};
use crate::error::ApiError;
use crate::maintenance;
use crate::models::{Incident, IncidentGroup};
use crate::store::{IncidentFilter, ResolvedGroup, TimelineFilter, DEFAULT_INCIDENTS_LIMIT};

// ---

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/incidents", get(list))
        .route("/incidents/active", get(active))
        .route("/incidents/timeline", get(timeline))
        .route("/incidents/resolved", delete(cleanup))
        .route("/incidents/{id}/resolve", post(resolve))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    node_id: Option<i64>,
    hazard_type: Option<String>,
    resolved: Option<bool>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list(
    State(state): State<AppState>,
    params: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<Incident>>, ApiError> {
    // ---
    let params = query(params)?;
    debug!("GET /incidents - {:?}", params);

    let offset = params.offset.unwrap_or(0);
    if offset < 0 {
        return Err(ApiError::Validation(format!(
            "offset must not be negative, got {offset}"
        )));
    }

    let filter = IncidentFilter {
        node_id: params.node_id,
        hazard_type: hazard_param(params.hazard_type.as_deref())?,
        resolved: params.resolved,
        limit: limit_param(params.limit, DEFAULT_INCIDENTS_LIMIT)?,
        offset,
    };
    Ok(Json(state.store.list_incidents(&filter).await?))
}

#[derive(Debug, Deserialize)]
struct ActiveQuery {
    node_id: Option<i64>,
}

async fn active(
    State(state): State<AppState>,
    params: Result<Query<ActiveQuery>, QueryRejection>,
) -> Result<Json<Vec<Incident>>, ApiError> {
    let params = query(params)?;
    Ok(Json(state.store.open_incidents(params.node_id).await?))
}

#[derive(Debug, Deserialize)]
struct TimelineQuery {
    node_id: Option<i64>,
    hazard_type: Option<String>,
    limit: Option<i64>,
}

async fn timeline(
    State(state): State<AppState>,
    params: Result<Query<TimelineQuery>, QueryRejection>,
) -> Result<Json<Vec<IncidentGroup>>, ApiError> {
    // ---
    let params = query(params)?;
    let filter = TimelineFilter {
        node_id: params.node_id,
        hazard_type: hazard_param(params.hazard_type.as_deref())?,
        limit: limit_param(params.limit, DEFAULT_INCIDENTS_LIMIT)?,
    };
    Ok(Json(state.store.incident_timeline(&filter).await?))
}

/// Optional body of `POST /incidents/{id}/resolve`.
#[derive(Debug, Default, Deserialize)]
struct ResolveRequest {
    resolved_at: Option<DateTime<Utc>>,
}

async fn resolve(
    State(state): State<AppState>,
    Path(incident_id): Path<i64>,
    body: Bytes,
) -> Result<Json<ResolvedGroup>, ApiError> {
    // ---
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        ResolveRequest::default()
    } else {
        serde_json::from_slice::<ResolveRequest>(&body)
            .map_err(|e| ApiError::Validation(format!("invalid resolve body: {e}")))?
    };

    info!("POST /incidents/{}/resolve", incident_id);
    let resolved = state
        .engine
        .resolve_manually(incident_id, request.resolved_at)
        .await?;
    Ok(Json(resolved))
}

#[derive(Debug, Deserialize)]
struct CleanupQuery {
    older_than_days: Option<u32>,
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    deleted: u64,
    older_than_days: u32,
}

async fn cleanup(
    State(state): State<AppState>,
    params: Result<Query<CleanupQuery>, QueryRejection>,
) -> Result<Json<CleanupResponse>, ApiError> {
    // ---
    let params = query(params)?;
    let older_than_days = params
        .older_than_days
        .unwrap_or(state.config.cleanup_retention_days);

    let now = Utc::now();
    if maintenance::retention_cutoff(now, older_than_days).is_none() {
        return Err(ApiError::Validation(format!(
            "older_than_days {older_than_days} is out of range"
        )));
    }

    let deleted = maintenance::purge_resolved(state.store.as_ref(), older_than_days, now).await?;
    Ok(Json(CleanupResponse {
        deleted,
        older_than_days,
    }))
}
