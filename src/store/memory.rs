//! In-process store used by tests and by `STORE_BACKEND=memory`.
//!
//! State lives behind one mutex. No call holds the lock across an await.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    IncidentFilter, IncidentStore, ReadingFilter, Reinforcement, ResolvedGroup, StoreResult,
    TimelineFilter,
};
use crate::error::StoreError;
use crate::models::{
    HazardType, Incident, IncidentGroup, Location, NewIncident, NewReading, NodeStatus, NodeTouch,
    Reading, SensorNode,
};

// ---

#[derive(Default)]
struct MemoryState {
    nodes: BTreeMap<i64, SensorNode>,
    readings: BTreeMap<i64, Reading>,
    incidents: BTreeMap<i64, Incident>,
    next_reading_id: i64,
    next_incident_id: i64,
    #[cfg(test)]
    failing_hazard: Option<HazardType>,
    #[cfg(test)]
    pause_after_lookup: bool,
}

impl MemoryState {
    fn open_start_row(&self, node_id: i64, hazard_type: HazardType) -> Option<&Incident> {
        self.incidents
            .values()
            .filter(|i| i.node_id == node_id && i.hazard_type == hazard_type && i.is_open())
            .max_by_key(|i| (i.start_timestamp, i.incident_id))
    }

    fn insert_incident(&mut self, new: &NewIncident) -> Incident {
        self.next_incident_id += 1;
        let incident = Incident {
            incident_id: self.next_incident_id,
            node_id: new.node_id,
            hazard_type: new.hazard_type,
            start_timestamp: new.start_timestamp,
            last_update_timestamp: new.timestamp,
            severity: new.severity,
            confidence: new.confidence,
            cooldown_counter: 0,
            is_incident_start: new.is_incident_start,
            resolved_at: None,
            linked_reading_id: new.linked_reading_id,
        };
        self.incidents.insert(incident.incident_id, incident.clone());
        incident
    }

    /// Resolve unresolved rows of one logical incident; returns how many.
    fn close_group(
        &mut self,
        node_id: i64,
        hazard_type: HazardType,
        start_timestamp: DateTime<Utc>,
        resolved_at: DateTime<Utc>,
    ) -> u64 {
        let mut closed = 0;
        for row in self.incidents.values_mut().filter(|i| {
            i.node_id == node_id
                && i.hazard_type == hazard_type
                && i.start_timestamp == start_timestamp
                && i.resolved_at.is_none()
        }) {
            row.resolved_at = Some(resolved_at);
            closed += 1;
        }
        closed
    }

    #[cfg(test)]
    fn check_failure(&self, hazard_type: HazardType) -> StoreResult<()> {
        if self.failing_hazard == Some(hazard_type) {
            return Err(StoreError::Unavailable(format!(
                "injected failure for {hazard_type}"
            )));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_failure(&self, _hazard_type: HazardType) -> StoreResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock leaves plain data behind; keep serving it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every incident write for `hazard_type` fail.
    #[cfg(test)]
    pub(crate) fn fail_writes_for(&self, hazard_type: Option<HazardType>) {
        self.state().failing_hazard = hazard_type;
    }

    /// Yield to the scheduler after every open-incident lookup, the way a
    /// database round trip would.
    #[cfg(test)]
    pub(crate) fn pause_after_lookup(&self, pause: bool) {
        self.state().pause_after_lookup = pause;
    }

    #[cfg(test)]
    async fn lookup_pause(&self) {
        let pause = self.state().pause_after_lookup;
        if pause {
            tokio::task::yield_now().await;
        }
    }

    #[cfg(not(test))]
    async fn lookup_pause(&self) {}
}

#[async_trait]
impl IncidentStore for MemoryStore {
    // ---
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn touch_node(&self, node_id: i64, seen_at: DateTime<Utc>) -> StoreResult<NodeTouch> {
        // ---
        let mut state = self.state();
        let previous_status = state.nodes.get(&node_id).map(|n| n.status);
        let node = state.nodes.entry(node_id).or_insert_with(|| SensorNode {
            node_id,
            name: SensorNode::default_name(node_id),
            status: NodeStatus::Active,
            last_seen: None,
            created_at: Utc::now(),
        });
        node.status = NodeStatus::Active;
        node.last_seen = Some(node.last_seen.map_or(seen_at, |prev| prev.max(seen_at)));

        Ok(NodeTouch {
            node: node.clone(),
            previous_status,
        })
    }

    async fn provision_node(&self, node_id: i64, name: Option<&str>) -> StoreResult<SensorNode> {
        // ---
        let mut state = self.state();
        let node = state.nodes.entry(node_id).or_insert_with(|| SensorNode {
            node_id,
            name: SensorNode::default_name(node_id),
            status: NodeStatus::Inactive,
            last_seen: None,
            created_at: Utc::now(),
        });
        if let Some(name) = name {
            node.name = name.to_string();
        }
        Ok(node.clone())
    }

    async fn get_node(&self, node_id: i64) -> StoreResult<Option<SensorNode>> {
        Ok(self.state().nodes.get(&node_id).cloned())
    }

    async fn list_nodes(&self) -> StoreResult<Vec<SensorNode>> {
        Ok(self.state().nodes.values().cloned().collect())
    }

    async fn mark_inactive_nodes(
        &self,
        seen_before: DateTime<Utc>,
    ) -> StoreResult<Vec<SensorNode>> {
        // ---
        let mut state = self.state();
        let mut flipped = Vec::new();
        for node in state.nodes.values_mut() {
            let stale = node.last_seen.map_or(true, |seen| seen < seen_before);
            if node.status == NodeStatus::Active && stale {
                node.status = NodeStatus::Inactive;
                flipped.push(node.clone());
            }
        }
        Ok(flipped)
    }

    async fn delete_node(&self, node_id: i64, live_after: DateTime<Utc>) -> StoreResult<()> {
        // ---
        let mut state = self.state();
        let node = state
            .nodes
            .get(&node_id)
            .ok_or_else(|| StoreError::NotFound(format!("node {node_id}")))?;
        if node.last_seen.map_or(false, |seen| seen >= live_after) {
            return Err(StoreError::Conflict(format!(
                "node {node_id} was seen recently and cannot be deleted"
            )));
        }

        state.nodes.remove(&node_id);
        state.readings.retain(|_, r| r.node_id != node_id);
        state.incidents.retain(|_, i| i.node_id != node_id);
        Ok(())
    }

    async fn insert_reading(&self, reading: &NewReading) -> StoreResult<Reading> {
        // ---
        let mut state = self.state();
        if !state.nodes.contains_key(&reading.node_id) {
            return Err(StoreError::NotFound(format!("node {}", reading.node_id)));
        }
        state.next_reading_id += 1;
        let stored = Reading {
            reading_id: state.next_reading_id,
            node_id: reading.node_id,
            timestamp: reading.timestamp,
            temperature: reading.telemetry.temperature,
            humidity: reading.telemetry.humidity,
            co_level: reading.telemetry.co_level,
            location: reading.location.and_then(|l| {
                Location::from_parts(l.latitude, l.longitude, l.altitude, l.fix_acquired)
            }),
            rssi: reading.signal.rssi,
            snr: reading.signal.snr,
        };
        state.readings.insert(stored.reading_id, stored.clone());
        Ok(stored)
    }

    async fn list_readings(&self, filter: &ReadingFilter) -> StoreResult<Vec<Reading>> {
        // ---
        let state = self.state();
        let mut rows: Vec<Reading> = state
            .readings
            .values()
            .filter(|r| filter.node_id.map_or(true, |id| r.node_id == id))
            .filter(|r| filter.since.map_or(true, |since| r.timestamp >= since))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then(b.reading_id.cmp(&a.reading_id))
        });
        rows.truncate(filter.limit.max(0) as usize);
        Ok(rows)
    }

    async fn open_incident(
        &self,
        node_id: i64,
        hazard_type: HazardType,
    ) -> StoreResult<Option<Incident>> {
        let open = self.state().open_start_row(node_id, hazard_type).cloned();
        self.lookup_pause().await;
        Ok(open)
    }

    async fn open_incidents(&self, node_id: Option<i64>) -> StoreResult<Vec<Incident>> {
        // ---
        let state = self.state();
        let mut rows: Vec<Incident> = state
            .incidents
            .values()
            .filter(|i| i.is_open() && node_id.map_or(true, |id| i.node_id == id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.start_timestamp
                .cmp(&a.start_timestamp)
                .then(b.incident_id.cmp(&a.incident_id))
        });
        Ok(rows)
    }

    async fn start_incident(&self, incident: &NewIncident) -> StoreResult<Incident> {
        // ---
        let mut state = self.state();
        state.check_failure(incident.hazard_type)?;
        if state
            .open_start_row(incident.node_id, incident.hazard_type)
            .is_some()
        {
            return Err(StoreError::Conflict(format!(
                "node {} already has an open {} incident",
                incident.node_id, incident.hazard_type
            )));
        }
        Ok(state.insert_incident(incident))
    }

    async fn reinforce_incident(
        &self,
        start: &Incident,
        alert: &NewIncident,
    ) -> StoreResult<Reinforcement> {
        // ---
        let mut state = self.state();
        state.check_failure(alert.hazard_type)?;

        // Validate before writing so a failure leaves nothing behind.
        match state.incidents.get(&start.incident_id) {
            Some(row) if row.is_open() => {}
            _ => {
                return Err(StoreError::NotFound(format!(
                    "open incident {}",
                    start.incident_id
                )))
            }
        }

        let alert = state.insert_incident(alert);
        let start = match state.incidents.get_mut(&start.incident_id) {
            Some(row) => {
                row.cooldown_counter = 0;
                row.severity = row.severity.escalated(alert.severity);
                row.last_update_timestamp = row.last_update_timestamp.max(alert.last_update_timestamp);
                row.clone()
            }
            None => return Err(StoreError::NotFound(format!("incident {}", start.incident_id))),
        };
        Ok(Reinforcement { alert, start })
    }

    async fn set_cooldown(&self, incident_id: i64, counter: i32) -> StoreResult<()> {
        // ---
        let mut state = self.state();
        let row = state
            .incidents
            .get_mut(&incident_id)
            .ok_or_else(|| StoreError::NotFound(format!("incident {incident_id}")))?;
        row.cooldown_counter = counter;
        Ok(())
    }

    async fn close_incident(
        &self,
        start: &Incident,
        final_counter: i32,
        resolved_at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        // ---
        let mut state = self.state();
        state.check_failure(start.hazard_type)?;
        let row = state
            .incidents
            .get_mut(&start.incident_id)
            .ok_or_else(|| StoreError::NotFound(format!("incident {}", start.incident_id)))?;
        row.cooldown_counter = final_counter;

        Ok(state.close_group(
            start.node_id,
            start.hazard_type,
            start.start_timestamp,
            resolved_at,
        ))
    }

    async fn get_incident(&self, incident_id: i64) -> StoreResult<Option<Incident>> {
        Ok(self.state().incidents.get(&incident_id).cloned())
    }

    async fn resolve_group(
        &self,
        incident_id: i64,
        resolved_at: DateTime<Utc>,
    ) -> StoreResult<ResolvedGroup> {
        // ---
        let mut state = self.state();
        let row = state
            .incidents
            .get(&incident_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("incident {incident_id}")))?;

        let rows_closed =
            state.close_group(row.node_id, row.hazard_type, row.start_timestamp, resolved_at);
        if rows_closed == 0 {
            return Err(StoreError::NotFound(format!(
                "no active rows for incident {incident_id}"
            )));
        }

        Ok(ResolvedGroup {
            incident_id,
            node_id: row.node_id,
            hazard_type: row.hazard_type,
            start_timestamp: row.start_timestamp,
            resolved_at,
            rows_closed,
        })
    }

    async fn list_incidents(&self, filter: &IncidentFilter) -> StoreResult<Vec<Incident>> {
        // ---
        let state = self.state();
        let mut rows: Vec<Incident> = state
            .incidents
            .values()
            .filter(|i| filter.node_id.map_or(true, |id| i.node_id == id))
            .filter(|i| filter.hazard_type.map_or(true, |h| i.hazard_type == h))
            .filter(|i| filter.resolved.map_or(true, |r| i.resolved_at.is_some() == r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.last_update_timestamp
                .cmp(&a.last_update_timestamp)
                .then(b.incident_id.cmp(&a.incident_id))
        });
        Ok(rows
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn incident_timeline(
        &self,
        filter: &TimelineFilter,
    ) -> StoreResult<Vec<IncidentGroup>> {
        // ---
        let state = self.state();
        let mut groups: BTreeMap<(i64, HazardType, DateTime<Utc>), Vec<&Incident>> =
            BTreeMap::new();
        for row in state
            .incidents
            .values()
            .filter(|i| filter.node_id.map_or(true, |id| i.node_id == id))
            .filter(|i| filter.hazard_type.map_or(true, |h| i.hazard_type == h))
        {
            groups
                .entry((row.node_id, row.hazard_type, row.start_timestamp))
                .or_default()
                .push(row);
        }

        let mut timeline: Vec<IncidentGroup> = groups
            .values()
            .filter_map(|rows| IncidentGroup::from_rows(rows))
            .collect();
        timeline.sort_by(|a, b| {
            b.start_timestamp
                .cmp(&a.start_timestamp)
                .then(a.node_id.cmp(&b.node_id))
                .then(a.hazard_type.cmp(&b.hazard_type))
        });
        timeline.truncate(filter.limit.max(0) as usize);
        Ok(timeline)
    }

    async fn purge_resolved(&self, resolved_before: DateTime<Utc>) -> StoreResult<u64> {
        // ---
        let mut state = self.state();
        let before = state.incidents.len();
        state
            .incidents
            .retain(|_, i| i.resolved_at.map_or(true, |at| at >= resolved_before));
        Ok((before - state.incidents.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{Severity, SignalQuality, Telemetry};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn new_start(node_id: i64, hazard_type: HazardType, at: DateTime<Utc>) -> NewIncident {
        NewIncident {
            node_id,
            hazard_type,
            start_timestamp: at,
            timestamp: at,
            severity: Severity::Medium,
            confidence: Some(0.8),
            is_incident_start: true,
            linked_reading_id: None,
        }
    }

    #[tokio::test]
    async fn test_touch_node_reports_status_change() {
        // ---
        let store = MemoryStore::new();
        let first = store.touch_node(7, t0()).await.unwrap();
        assert!(first.status_changed());
        assert_eq!(first.previous_status, None);

        let second = store.touch_node(7, t0() - Duration::minutes(5)).await.unwrap();
        assert!(!second.status_changed());
        // last_seen never moves backwards
        assert_eq!(second.node.last_seen, Some(t0()));
    }

    #[tokio::test]
    async fn test_start_incident_rejects_second_open_row() {
        // ---
        let store = MemoryStore::new();
        store.touch_node(1, t0()).await.unwrap();
        store
            .start_incident(&new_start(1, HazardType::Fire, t0()))
            .await
            .unwrap();

        let err = store
            .start_incident(&new_start(1, HazardType::Fire, t0() + Duration::seconds(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Other hazards and other nodes are independent
        store
            .start_incident(&new_start(1, HazardType::Gunshots, t0()))
            .await
            .unwrap();
        store
            .start_incident(&new_start(2, HazardType::Fire, t0()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_readings_order_filter_and_location() {
        // ---
        let store = MemoryStore::new();
        store.touch_node(1, t0()).await.unwrap();
        for minutes in 0..3 {
            store
                .insert_reading(&NewReading {
                    node_id: 1,
                    timestamp: t0() + Duration::minutes(minutes),
                    telemetry: Telemetry {
                        temperature: Some(20.0 + minutes as f64),
                        ..Telemetry::default()
                    },
                    location: None,
                    signal: SignalQuality::default(),
                })
                .await
                .unwrap();
        }

        let filter = ReadingFilter {
            since: Some(t0() + Duration::minutes(1)),
            ..ReadingFilter::default()
        };
        let rows = store.list_readings(&filter).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].temperature, Some(22.0));
        assert!(rows.iter().all(|r| r.location.is_none()));

        let err = store
            .insert_reading(&NewReading {
                node_id: 99,
                timestamp: t0(),
                telemetry: Telemetry::default(),
                location: None,
                signal: SignalQuality::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_purge_only_old_resolved_rows() {
        // ---
        let store = MemoryStore::new();
        store.touch_node(1, t0()).await.unwrap();
        let old = store
            .start_incident(&new_start(1, HazardType::Fire, t0()))
            .await
            .unwrap();
        store.resolve_group(old.incident_id, t0()).await.unwrap();
        store
            .start_incident(&new_start(1, HazardType::Fire, t0() + Duration::days(1)))
            .await
            .unwrap();

        let purged = store.purge_resolved(t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.open_incidents(Some(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_node_gated_by_liveness() {
        // ---
        let store = MemoryStore::new();
        store.touch_node(5, t0()).await.unwrap();

        let err = store.delete_node(5, t0() - Duration::hours(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        store.delete_node(5, t0() + Duration::hours(1)).await.unwrap();
        assert!(store.get_node(5).await.unwrap().is_none());

        let err = store.delete_node(5, t0()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
