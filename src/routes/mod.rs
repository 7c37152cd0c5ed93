//! HTTP route gateway.
//!
//! Each sibling module exports a subrouter over [`AppState`]; this gateway
//! merges them and attaches the state so `main.rs` only sees [`router`].

use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::Query;
use axum::Router;

use crate::engine::IncidentEngine;
use crate::error::ApiError;
use crate::fanout::Fanout;
use crate::models::HazardType;
use crate::store::IncidentStore;
use crate::Config;

mod events;
mod health;
mod incidents;
mod nodes;
mod readings;
mod uplink;

// ---

/// Shared handles every handler can reach.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<IncidentEngine>,
    pub store: Arc<dyn IncidentStore>,
    pub fanout: Arc<Fanout>,
    pub config: Config,
}

impl AppState {
    /// Wire an engine over `store` publishing into a fresh fan-out.
    pub fn new(store: Arc<dyn IncidentStore>, config: Config) -> Self {
        // ---
        let fanout = Fanout::new(config.subscriber_buffer);
        let engine = Arc::new(IncidentEngine::new(
            store.clone(),
            fanout.clone(),
            config.engine_settings(),
        ));
        Self {
            engine,
            store,
            fanout,
            config,
        }
    }
}

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(uplink::router())
        .merge(readings::router())
        .merge(incidents::router())
        .merge(nodes::router())
        .merge(events::router())
        .merge(health::router())
        .with_state(state)
}

// ---

/// Unwrap query parameters, turning a parse failure into a 400 with the
/// usual error body.
fn query<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    params
        .map(|Query(inner)| inner)
        .map_err(|e| ApiError::Validation(e.body_text()))
}

fn hazard_param(raw: Option<&str>) -> Result<Option<HazardType>, ApiError> {
    raw.map(|h| h.parse::<HazardType>().map_err(ApiError::Validation))
        .transpose()
}

fn limit_param(limit: Option<i64>, default: i64) -> Result<i64, ApiError> {
    match limit {
        None => Ok(default),
        Some(n) if n > 0 => Ok(n),
        Some(n) => Err(ApiError::Validation(format!(
            "limit must be positive, got {n}"
        ))),
    }
}
