//! Data models for nodes, readings and hazard incidents.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---

/// Hazard categories a field node can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HazardType {
    Fire,
    Chainsaw,
    Gunshots,
}

impl HazardType {
    pub const ALL: [HazardType; 3] = [HazardType::Fire, HazardType::Chainsaw, HazardType::Gunshots];

    pub fn as_str(&self) -> &'static str {
        match self {
            HazardType::Fire => "fire",
            HazardType::Chainsaw => "chainsaw",
            HazardType::Gunshots => "gunshots",
        }
    }
}

impl fmt::Display for HazardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HazardType {
    type Err = String;

    /// Accepts the canonical names plus the aliases detectors emit
    /// (`logging` for chainsaw, singular `gunshot`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fire" => Ok(HazardType::Fire),
            "chainsaw" | "logging" => Ok(HazardType::Chainsaw),
            "gunshots" | "gunshot" => Ok(HazardType::Gunshots),
            other => Err(format!("unrecognized hazard type '{other}'")),
        }
    }
}

/// Reported severity of a hazard alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Unknown,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Unknown => "unknown",
        }
    }

    /// Numeric score used for timeline aggregates. `Unknown` scores 0.
    pub fn score(&self) -> u8 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Unknown => 0,
        }
    }

    /// Severity of an open incident after another report: the higher of
    /// the two by [`score`](Self::score), the reported one on a tie.
    pub fn escalated(self, reported: Severity) -> Severity {
        if reported.score() >= self.score() {
            reported
        } else {
            self
        }
    }

    /// Map a detector's integer code (1/2/3) to a label. Anything else is `Unknown`.
    pub fn from_code(code: i64) -> Severity {
        match code {
            1 => Severity::Low,
            2 => Severity::Medium,
            3 => Severity::High,
            _ => Severity::Unknown,
        }
    }

    /// Validate a textual label. Anything outside the enumeration is `Unknown`.
    pub fn from_label(label: &str) -> Severity {
        match label.trim().to_ascii_lowercase().as_str() {
            "low" => Severity::Low,
            "medium" => Severity::Medium,
            "high" => Severity::High,
            _ => Severity::Unknown,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness of a field node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    Inactive,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Active => "active",
            NodeStatus::Inactive => "inactive",
        }
    }

    pub fn from_label(label: &str) -> NodeStatus {
        if label.eq_ignore_ascii_case("active") {
            NodeStatus::Active
        } else {
            NodeStatus::Inactive
        }
    }
}

/// GPS fix attached to a reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    // ---
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub fix_acquired: Option<bool>,
}

impl Location {
    /// Build a location from nullable columns. Returns `None` unless at
    /// least one of latitude or longitude is set.
    pub fn from_parts(
        latitude: Option<f64>,
        longitude: Option<f64>,
        altitude: Option<f64>,
        fix_acquired: Option<bool>,
    ) -> Option<Location> {
        if latitude.is_none() && longitude.is_none() {
            return None;
        }
        Some(Location {
            latitude,
            longitude,
            altitude,
            fix_acquired,
        })
    }
}

/// Environmental sample values carried by an uplink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub co_level: Option<f64>,
}

impl Telemetry {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.humidity.is_none() && self.co_level.is_none()
    }
}

/// Uplink signal quality as reported by the network server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalQuality {
    pub rssi: Option<f64>,
    pub snr: Option<f64>,
}

/// Identity and liveness of a field device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorNode {
    // ---
    pub node_id: i64,
    pub name: String,
    pub status: NodeStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SensorNode {
    pub fn default_name(node_id: i64) -> String {
        format!("node-{node_id}")
    }
}

/// Result of recording contact with a node.
#[derive(Debug, Clone)]
pub struct NodeTouch {
    pub node: SensorNode,
    /// Status before this contact. `None` when the node was just created.
    pub previous_status: Option<NodeStatus>,
}

impl NodeTouch {
    pub fn status_changed(&self) -> bool {
        self.previous_status != Some(self.node.status)
    }
}

/// One stored environmental sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    // ---
    pub reading_id: i64,
    pub node_id: i64,
    pub timestamp: DateTime<Utc>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub co_level: Option<f64>,
    pub location: Option<Location>,
    pub rssi: Option<f64>,
    pub snr: Option<f64>,
}

/// A reading about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub node_id: i64,
    pub timestamp: DateTime<Utc>,
    pub telemetry: Telemetry,
    pub location: Option<Location>,
    pub signal: SignalQuality,
}

/// One incident row: either the start-row of a logical incident or a
/// reinforcing alert sharing its `start_timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    // ---
    pub incident_id: i64,
    pub node_id: i64,
    pub hazard_type: HazardType,
    pub start_timestamp: DateTime<Utc>,
    pub last_update_timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub confidence: Option<f64>,
    pub cooldown_counter: i32,
    pub is_incident_start: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub linked_reading_id: Option<i64>,
}

impl Incident {
    pub fn is_open(&self) -> bool {
        self.is_incident_start && self.resolved_at.is_none()
    }
}

/// An incident row about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIncident {
    pub node_id: i64,
    pub hazard_type: HazardType,
    pub start_timestamp: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub confidence: Option<f64>,
    pub is_incident_start: bool,
    pub linked_reading_id: Option<i64>,
}

/// Incident rows grouped into one logical incident for timeline displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentGroup {
    // ---
    pub node_id: i64,
    pub hazard_type: HazardType,
    pub start_timestamp: DateTime<Utc>,
    pub last_alert_timestamp: DateTime<Utc>,
    pub alert_count: i64,
    pub max_severity: Severity,
    pub avg_severity_score: f64,
    pub max_confidence: Option<f64>,
    pub avg_confidence: Option<f64>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl IncidentGroup {
    /// Fold rows that share (node, hazard, start timestamp) into one group.
    /// Returns `None` for an empty slice.
    pub fn from_rows(rows: &[&Incident]) -> Option<IncidentGroup> {
        // ---
        let first = rows.first()?;
        let alert_count = rows.len() as i64;

        let max_severity = rows
            .iter()
            .map(|r| r.severity)
            .max_by_key(|s| s.score())
            .unwrap_or(Severity::Unknown);
        let avg_severity_score =
            rows.iter().map(|r| f64::from(r.severity.score())).sum::<f64>() / alert_count as f64;

        let confidences: Vec<f64> = rows.iter().filter_map(|r| r.confidence).collect();
        let max_confidence = confidences.iter().copied().reduce(f64::max);
        let avg_confidence = if confidences.is_empty() {
            None
        } else {
            Some(confidences.iter().sum::<f64>() / confidences.len() as f64)
        };

        let last_alert_timestamp = rows
            .iter()
            .map(|r| r.last_update_timestamp)
            .max()
            .unwrap_or(first.start_timestamp);

        let is_active = rows.iter().any(|r| r.resolved_at.is_none());
        let resolved_at = if is_active {
            None
        } else {
            rows.iter().filter_map(|r| r.resolved_at).max()
        };

        Some(IncidentGroup {
            node_id: first.node_id,
            hazard_type: first.hazard_type,
            start_timestamp: first.start_timestamp,
            last_alert_timestamp,
            alert_count,
            max_severity,
            avg_severity_score,
            max_confidence,
            avg_confidence,
            resolved_at,
            is_active,
        })
    }
}
