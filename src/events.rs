//! Domain events pushed to dashboard subscribers.
//!
//! Every event serializes as `{ "event": <name>, "timestamp": <RFC 3339>,
//! "data": {...} }`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::models::{HazardType, Location, NodeStatus, Reading, SensorNode, Severity};
use crate::store::ResolvedGroup;

// ---

pub const HAZARD_DETECTED: &str = "hazard_detected";
pub const HAZARD_COOLDOWN_TICK: &str = "hazard_cooldown_tick";
pub const HAZARD_RESOLVED: &str = "hazard_resolved";
pub const HAZARD_RESOLVED_MANUAL: &str = "hazard_resolved_manual";
pub const NEW_READING: &str = "new_reading";
pub const NODE_STATUS_CHANGED: &str = "node_status_changed";

/// Per-hazard alias of `hazard_detected` older dashboards listen for.
pub fn legacy_detected_name(hazard_type: HazardType) -> String {
    format!("{hazard_type}_detected")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl Event {
    pub fn new(name: impl Into<String>, data: &impl Serialize) -> Self {
        Self {
            event: name.into(),
            timestamp: Utc::now(),
            // Payload types are plain structs; serialization cannot fail.
            data: serde_json::to_value(data).unwrap_or_default(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Payload of `hazard_detected`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HazardDetected {
    // ---
    pub node_id: i64,
    pub hazard_type: HazardType,
    pub incident_id: i64,
    pub is_new_incident: bool,
    pub incident_start_timestamp: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub confidence: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub co_level: Option<f64>,
    pub location: Option<Location>,
    pub rssi: Option<f64>,
    pub snr: Option<f64>,
}

/// Payload of `hazard_cooldown_tick`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CooldownTick {
    pub node_id: i64,
    pub hazard_type: HazardType,
    pub incident_id: i64,
    pub cooldown_counter: i32,
    pub threshold: i32,
    pub incident_start_timestamp: DateTime<Utc>,
}

/// Payload of `hazard_resolved` and `hazard_resolved_manual`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HazardResolved {
    pub node_id: i64,
    pub hazard_type: HazardType,
    pub incident_id: i64,
    pub incident_start_timestamp: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
    pub rows_closed: u64,
    pub manual: bool,
}

impl From<&ResolvedGroup> for HazardResolved {
    fn from(group: &ResolvedGroup) -> Self {
        Self {
            node_id: group.node_id,
            hazard_type: group.hazard_type,
            incident_id: group.incident_id,
            incident_start_timestamp: group.start_timestamp,
            resolved_at: group.resolved_at,
            rows_closed: group.rows_closed,
            manual: true,
        }
    }
}

/// Payload of `node_status_changed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatusChanged {
    pub node_id: i64,
    pub name: String,
    pub status: NodeStatus,
    pub previous_status: Option<NodeStatus>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl NodeStatusChanged {
    pub fn new(node: &SensorNode, previous_status: Option<NodeStatus>) -> Self {
        Self {
            node_id: node.node_id,
            name: node.name.clone(),
            status: node.status,
            previous_status,
            last_seen: node.last_seen,
        }
    }
}

impl Event {
    pub fn hazard_detected(payload: &HazardDetected) -> Self {
        Self::new(HAZARD_DETECTED, payload)
    }

    pub fn legacy_hazard_detected(payload: &HazardDetected) -> Self {
        Self::new(legacy_detected_name(payload.hazard_type), payload)
    }

    pub fn cooldown_tick(payload: &CooldownTick) -> Self {
        Self::new(HAZARD_COOLDOWN_TICK, payload)
    }

    pub fn hazard_resolved(payload: &HazardResolved) -> Self {
        let name = if payload.manual {
            HAZARD_RESOLVED_MANUAL
        } else {
            HAZARD_RESOLVED
        };
        Self::new(name, payload)
    }

    pub fn new_reading(reading: &Reading) -> Self {
        Self::new(NEW_READING, reading)
    }

    pub fn node_status_changed(payload: &NodeStatusChanged) -> Self {
        Self::new(NODE_STATUS_CHANGED, payload)
    }
}
