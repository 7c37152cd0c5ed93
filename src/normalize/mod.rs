//! Uplink normalization.
//!
//! Network servers and node firmware revisions disagree on where things
//! live in an uplink envelope. This module flattens every shape we accept
//! into one [`NormalizedIngestion`]. It is a pure function of the envelope
//! and the receipt time; nothing here touches the store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::NormalizationError;
use crate::models::{HazardType, Location, Severity, SignalQuality, Telemetry};

mod signal;

pub use signal::{extract_signal, SignalExtractor, SIGNAL_STRATEGIES};

// ---

const NODE_ID_KEYS: &[&str] = &["node_id", "nodeId", "nodeID"];
const PAYLOAD_TIMESTAMP_KEYS: &[&str] = &["timestamp", "time"];
const ENVELOPE_TIMESTAMP_KEYS: &[&str] = &["time", "timestamp", "received_at"];
const PAYLOAD_KEYS: &[&str] = &["object", "decoded_payload", "decoded", "payload", "data"];

/// Epoch values above this are taken to be milliseconds.
const EPOCH_MILLIS_CUTOFF: i64 = 100_000_000_000;

/// One detector claim carried by an uplink.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HazardReport {
    pub hazard_type: HazardType,
    pub severity: Severity,
    pub confidence: Option<f64>,
}

/// Canonical ingestion record consumed by the incident engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedIngestion {
    // ---
    pub node_id: i64,
    pub timestamp: DateTime<Utc>,
    pub readings: Option<Telemetry>,
    pub location: Option<Location>,
    pub hazards: Vec<HazardReport>,
    pub signal: SignalQuality,
}

impl NormalizedIngestion {
    /// Minimal record for a node, used by tests and provisioning tools.
    pub fn plain(node_id: i64, timestamp: DateTime<Utc>) -> Self {
        Self {
            node_id,
            timestamp,
            readings: None,
            location: None,
            hazards: Vec::new(),
            signal: SignalQuality::default(),
        }
    }

    pub fn has_telemetry(&self) -> bool {
        self.readings.map_or(false, |t| !t.is_empty())
    }
}

/// Normalize a raw uplink envelope.
///
/// `received_at` is used when the envelope carries no event time. The only
/// hard failure is a missing node identifier; a malformed hazard list
/// normalizes to no hazards.
pub fn normalize(
    raw: &Value,
    received_at: DateTime<Utc>,
) -> Result<NormalizedIngestion, NormalizationError> {
    // ---
    let payload = payload_of(raw);

    let node_id = field(raw, NODE_ID_KEYS)
        .or_else(|| field(payload, NODE_ID_KEYS))
        .and_then(as_node_id)
        .ok_or(NormalizationError::MissingNodeId)?;

    let timestamp = field(payload, PAYLOAD_TIMESTAMP_KEYS)
        .or_else(|| field(raw, ENVELOPE_TIMESTAMP_KEYS))
        .or_else(|| path(raw, &["uplink_message", "received_at"]))
        .and_then(as_timestamp)
        .unwrap_or(received_at);

    let telemetry = Telemetry {
        temperature: field(payload, &["temperature", "temp"]).and_then(number),
        humidity: field(payload, &["humidity", "hum"]).and_then(number),
        co_level: field(payload, &["co_level", "coLevel", "co", "co_ppm"]).and_then(number),
    };
    let readings = (!telemetry.is_empty()).then_some(telemetry);

    Ok(NormalizedIngestion {
        node_id,
        timestamp,
        readings,
        location: location_of(payload),
        hazards: hazard_reports(payload),
        signal: extract_signal(raw),
    })
}

// ---

/// Locate the decoded application payload inside the envelope.
pub(crate) fn payload_of(raw: &Value) -> &Value {
    // ---
    if let Some(decoded) = path(raw, &["uplink_message", "decoded_payload"]) {
        if decoded.is_object() {
            return decoded;
        }
    }
    PAYLOAD_KEYS
        .iter()
        .filter_map(|key| raw.get(*key))
        .find(|v| v.is_object())
        .unwrap_or(raw)
}

/// First non-null value among `keys` on `obj`.
pub(crate) fn field<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| obj.get(*key))
        .find(|v| !v.is_null())
}

/// Walk nested object keys.
pub(crate) fn path<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .try_fold(obj, |cur, key| cur.get(*key))
        .filter(|v| !v.is_null())
}

/// Numbers arrive both as JSON numbers and as numeric strings.
pub(crate) fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_node_id(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn as_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => {
            let epoch = n.as_i64()?;
            if epoch > EPOCH_MILLIS_CUTOFF {
                DateTime::from_timestamp_millis(epoch)
            } else {
                DateTime::from_timestamp(epoch, 0)
            }
        }
        _ => None,
    }
}

fn location_of(payload: &Value) -> Option<Location> {
    // ---
    let gps = field(payload, &["gps", "location"])
        .filter(|v| v.is_object())
        .unwrap_or(payload);

    Location::from_parts(
        field(gps, &["latitude", "lat"]).and_then(number),
        field(gps, &["longitude", "lon", "lng"]).and_then(number),
        field(gps, &["altitude", "alt"]).and_then(number),
        field(gps, &["fix_acquired", "fix"]).and_then(as_flag),
    )
}

fn as_flag(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Integer codes map through [`Severity::from_code`], text is validated,
/// everything else is `Unknown`.
pub fn severity_of(v: Option<&Value>) -> Severity {
    match v {
        Some(Value::Number(n)) => n.as_i64().map_or(Severity::Unknown, Severity::from_code),
        Some(Value::String(s)) => Severity::from_label(s),
        _ => Severity::Unknown,
    }
}

fn hazard_reports(payload: &Value) -> Vec<HazardReport> {
    // ---
    match payload.get("hazards") {
        Some(Value::Array(items)) => items.iter().filter_map(hazard_from_item).collect(),
        _ => hazard_shorthand(payload).into_iter().collect(),
    }
}

fn hazard_from_item(item: &Value) -> Option<HazardReport> {
    match item {
        Value::String(name) => parse_hazard(name).map(|hazard_type| HazardReport {
            hazard_type,
            severity: Severity::Unknown,
            confidence: None,
        }),
        Value::Object(_) => {
            let name = field(item, &["type", "hazard", "hazard_type", "hazardType"])?.as_str()?;
            Some(HazardReport {
                hazard_type: parse_hazard(name)?,
                severity: severity_of(item.get("severity")),
                confidence: item.get("confidence").and_then(number),
            })
        }
        _ => None,
    }
}

fn hazard_shorthand(payload: &Value) -> Option<HazardReport> {
    let name = field(payload, &["hazard", "hazard_type", "hazardType"])?.as_str()?;
    Some(HazardReport {
        hazard_type: parse_hazard(name)?,
        severity: severity_of(payload.get("severity")),
        confidence: payload.get("confidence").and_then(number),
    })
}

fn parse_hazard(name: &str) -> Option<HazardType> {
    match name.parse::<HazardType>() {
        Ok(hazard) => Some(hazard),
        Err(e) => {
            warn!("Dropping hazard report: {}", e);
            None
        }
    }
}
