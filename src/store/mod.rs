//! Persistence contract for nodes, readings and incidents.
//!
//! The engine and the HTTP routes only see [`IncidentStore`]. `PgStore` is
//! the production backend; `MemoryStore` backs tests and the `memory`
//! store mode.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;
use crate::models::{
    HazardType, Incident, IncidentGroup, NewIncident, NewReading, NodeTouch, Reading, SensorNode,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub type StoreResult<T> = Result<T, StoreError>;

pub const DEFAULT_READINGS_LIMIT: i64 = 500;
pub const DEFAULT_INCIDENTS_LIMIT: i64 = 100;

// ---

/// Filter for [`IncidentStore::list_readings`].
#[derive(Debug, Clone)]
pub struct ReadingFilter {
    pub node_id: Option<i64>,
    pub since: Option<DateTime<Utc>>,
    pub limit: i64,
}

impl Default for ReadingFilter {
    fn default() -> Self {
        Self {
            node_id: None,
            since: None,
            limit: DEFAULT_READINGS_LIMIT,
        }
    }
}

/// Filter for [`IncidentStore::list_incidents`].
#[derive(Debug, Clone)]
pub struct IncidentFilter {
    pub node_id: Option<i64>,
    pub hazard_type: Option<HazardType>,
    /// `Some(true)` for resolved rows only, `Some(false)` for unresolved only.
    pub resolved: Option<bool>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for IncidentFilter {
    fn default() -> Self {
        Self {
            node_id: None,
            hazard_type: None,
            resolved: None,
            limit: DEFAULT_INCIDENTS_LIMIT,
            offset: 0,
        }
    }
}

/// Filter for [`IncidentStore::incident_timeline`].
#[derive(Debug, Clone)]
pub struct TimelineFilter {
    pub node_id: Option<i64>,
    pub hazard_type: Option<HazardType>,
    pub limit: i64,
}

impl Default for TimelineFilter {
    fn default() -> Self {
        Self {
            node_id: None,
            hazard_type: None,
            limit: DEFAULT_INCIDENTS_LIMIT,
        }
    }
}

/// The two rows touched by a reinforcing alert.
#[derive(Debug, Clone)]
pub struct Reinforcement {
    /// Newly appended non-start row.
    pub alert: Incident,
    /// Start-row after its cooldown reset.
    pub start: Incident,
}

/// Result of closing every unresolved row of one logical incident.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedGroup {
    pub incident_id: i64,
    pub node_id: i64,
    pub hazard_type: HazardType,
    pub start_timestamp: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
    pub rows_closed: u64,
}

#[async_trait]
pub trait IncidentStore: Send + Sync {
    // ---
    /// Short backend label for health output.
    fn backend(&self) -> &'static str;

    /// Upsert a node on contact: status becomes active and `last_seen`
    /// advances to `seen_at` (never backwards).
    async fn touch_node(&self, node_id: i64, seen_at: DateTime<Utc>) -> StoreResult<NodeTouch>;

    /// Create a node ahead of first contact, or rename an existing one.
    async fn provision_node(&self, node_id: i64, name: Option<&str>) -> StoreResult<SensorNode>;

    async fn get_node(&self, node_id: i64) -> StoreResult<Option<SensorNode>>;

    async fn list_nodes(&self) -> StoreResult<Vec<SensorNode>>;

    /// Flip active nodes not seen since `seen_before` to inactive and
    /// return them.
    async fn mark_inactive_nodes(&self, seen_before: DateTime<Utc>)
        -> StoreResult<Vec<SensorNode>>;

    /// Delete a node with its readings and incidents. Refused with
    /// `Conflict` when the node was seen at or after `live_after`.
    async fn delete_node(&self, node_id: i64, live_after: DateTime<Utc>) -> StoreResult<()>;

    async fn insert_reading(&self, reading: &NewReading) -> StoreResult<Reading>;

    /// Readings ordered by timestamp, newest first.
    async fn list_readings(&self, filter: &ReadingFilter) -> StoreResult<Vec<Reading>>;

    /// The open start-row for (node, hazard), if any.
    async fn open_incident(
        &self,
        node_id: i64,
        hazard_type: HazardType,
    ) -> StoreResult<Option<Incident>>;

    /// All open start-rows, optionally for one node, newest start first.
    async fn open_incidents(&self, node_id: Option<i64>) -> StoreResult<Vec<Incident>>;

    /// Insert a start-row. Fails with `Conflict` if (node, hazard) already
    /// has an open incident.
    async fn start_incident(&self, incident: &NewIncident) -> StoreResult<Incident>;

    /// Append a non-start row for `start` and, in the same unit of work,
    /// reset the start-row's cooldown, bump its last update time and
    /// escalate its severity (see [`Severity::escalated`]).
    ///
    /// [`Severity::escalated`]: crate::models::Severity::escalated
    async fn reinforce_incident(
        &self,
        start: &Incident,
        alert: &NewIncident,
    ) -> StoreResult<Reinforcement>;

    async fn set_cooldown(&self, incident_id: i64, counter: i32) -> StoreResult<()>;

    /// Close a start-row with its final counter together with every
    /// unresolved sibling row. Returns the number of rows closed.
    async fn close_incident(
        &self,
        start: &Incident,
        final_counter: i32,
        resolved_at: DateTime<Utc>,
    ) -> StoreResult<u64>;

    async fn get_incident(&self, incident_id: i64) -> StoreResult<Option<Incident>>;

    /// Resolve every unresolved row sharing the (node, hazard, start)
    /// of `incident_id`. `NotFound` when the id is unknown or nothing is
    /// left unresolved.
    async fn resolve_group(
        &self,
        incident_id: i64,
        resolved_at: DateTime<Utc>,
    ) -> StoreResult<ResolvedGroup>;

    /// Incident rows, most recently updated first.
    async fn list_incidents(&self, filter: &IncidentFilter) -> StoreResult<Vec<Incident>>;

    /// Logical incidents, newest start first.
    async fn incident_timeline(&self, filter: &TimelineFilter) -> StoreResult<Vec<IncidentGroup>>;

    /// Delete resolved rows whose `resolved_at` is before the cutoff.
    async fn purge_resolved(&self, resolved_before: DateTime<Utc>) -> StoreResult<u64>;
}
