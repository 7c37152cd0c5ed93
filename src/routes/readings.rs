use axum::{
    extract::{rejection::QueryRejection, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use super::{limit_param, query, AppState};
use crate::error::ApiError;
use crate::models::Reading;
use crate::store::{ReadingFilter, DEFAULT_READINGS_LIMIT};

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/readings", get(handler))
}

/// Query parameters for `GET /readings`.
#[derive(Debug, Deserialize)]
struct ReadingsQuery {
    node_id: Option<i64>,
    /// Only readings at or after this instant (RFC 3339).
    since: Option<DateTime<Utc>>,
    limit: Option<i64>,
}

async fn handler(
    State(state): State<AppState>,
    params: Result<Query<ReadingsQuery>, QueryRejection>,
) -> Result<Json<Vec<Reading>>, ApiError> {
    // ---
    let params = query(params)?;
    debug!("GET /readings - {:?}", params);

    let filter = ReadingFilter {
        node_id: params.node_id,
        since: params.since,
        limit: limit_param(params.limit, DEFAULT_READINGS_LIMIT)?,
    };
    Ok(Json(state.store.list_readings(&filter).await?))
}
