//! Incident lifecycle engine.
//!
//! Each (node, hazard type) pair runs a small state machine on top of the
//! append-only incident log:
//!
//! ```text
//! NoIncident --alert--> Open --alert--> Open (reinforced) ... --cooldown--> Resolved
//! ```
//!
//! One ingestion is processed as a single unit of work under a per-node
//! lock, in this order:
//!
//! 1. upsert the node, then append the reading if telemetry is present;
//! 2. **hazard phase**: every hazard report either opens an incident or
//!    reinforces the open one (cooldown reset to 0);
//! 3. **cooldown phase**: every open incident of the node whose hazard type
//!    was *not* reported in this ingestion advances its cooldown by one and
//!    is resolved when it reaches the threshold.
//!
//! Events are published only after the write they describe returned.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::error::{IngestError, StoreError};
use crate::events::{CooldownTick, Event, HazardDetected, HazardResolved, NodeStatusChanged};
use crate::fanout::Publisher;
use crate::models::{HazardType, Incident, NewIncident, NewReading, Reading};
use crate::normalize::{HazardReport, NormalizedIngestion};
use crate::store::{IncidentStore, ResolvedGroup};

// ---

pub const DEFAULT_COOLDOWN_THRESHOLD: i32 = 5;

/// Number of consecutive plain readings that resolves an incident, per hazard.
#[derive(Debug, Clone, PartialEq)]
pub struct CooldownPolicy {
    default_threshold: i32,
    overrides: HashMap<HazardType, i32>,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN_THRESHOLD)
    }
}

impl CooldownPolicy {
    pub fn new(default_threshold: i32) -> Self {
        Self {
            default_threshold: default_threshold.max(1),
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, hazard_type: HazardType, threshold: i32) -> Self {
        self.overrides.insert(hazard_type, threshold.max(1));
        self
    }

    pub fn threshold(&self, hazard_type: HazardType) -> i32 {
        self.overrides
            .get(&hazard_type)
            .copied()
            .unwrap_or(self.default_threshold)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub cooldown: CooldownPolicy,
    /// Publish `<hazard>_detected` alongside `hazard_detected`.
    pub legacy_hazard_events: bool,
}

/// Cooldown advanced without resolving.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CooldownAdvance {
    pub hazard_type: HazardType,
    pub incident_id: i64,
    pub cooldown_counter: i32,
}

/// What one ingestion did, returned to the transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestOutcome {
    // ---
    pub node_id: i64,
    pub reading_id: Option<i64>,
    pub started: Vec<HazardType>,
    pub reinforced: Vec<HazardType>,
    pub cooldown: Vec<CooldownAdvance>,
    pub resolved: Vec<HazardType>,
}

/// Per-node async locks, created on first use.
///
/// An entry whose only reference is the map is neither held nor awaited,
/// so it is pruned the next time any lock is taken. Deleted or silent
/// nodes therefore do not accumulate.
#[derive(Default)]
struct NodeLocks {
    locks: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
}

impl NodeLocks {
    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Arc<AsyncMutex<()>>>> {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn lock(&self, node_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.map();
            locks.retain(|id, lock| *id == node_id || Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(node_id).or_default())
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map().len()
    }
}

pub struct IncidentEngine {
    store: Arc<dyn IncidentStore>,
    publisher: Arc<dyn Publisher>,
    settings: EngineSettings,
    node_locks: NodeLocks,
}

impl IncidentEngine {
    pub fn new(
        store: Arc<dyn IncidentStore>,
        publisher: Arc<dyn Publisher>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            publisher,
            settings,
            node_locks: NodeLocks::default(),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Process one normalized uplink.
    ///
    /// A failed node upsert aborts everything. A failed reading or hazard
    /// write aborts only that unit; the rest still runs and the first
    /// failure is returned. Writes that already committed stay.
    pub async fn ingest(&self, ingestion: NormalizedIngestion) -> Result<IngestOutcome, IngestError> {
        // ---
        let span = info_span!("ingest", node_id = ingestion.node_id, ingest_id = %Uuid::new_v4());
        self.ingest_locked(ingestion).instrument(span).await
    }

    async fn ingest_locked(
        &self,
        ingestion: NormalizedIngestion,
    ) -> Result<IngestOutcome, IngestError> {
        // ---
        let node_id = ingestion.node_id;
        let at = ingestion.timestamp;
        let _guard = self.node_locks.lock(node_id).await;

        debug!(
            "Ingesting at {} with {} hazard report(s)",
            at,
            ingestion.hazards.len()
        );

        let touch = self.store.touch_node(node_id, at).await?;
        if touch.status_changed() {
            info!("Node {} is now {}", node_id, touch.node.status.as_str());
            self.publisher.publish(Event::node_status_changed(
                &NodeStatusChanged::new(&touch.node, touch.previous_status),
            ));
        }

        let mut outcome = IngestOutcome {
            node_id,
            ..IngestOutcome::default()
        };
        let mut first_error: Option<StoreError> = None;

        let reading = match self.store_reading(&ingestion).await {
            Ok(reading) => reading,
            Err(e) => {
                error!("Failed to store reading: {}", e);
                first_error.get_or_insert(e);
                None
            }
        };
        outcome.reading_id = reading.as_ref().map(|r| r.reading_id);

        // Hazard phase
        let mut reported: HashSet<HazardType> = HashSet::new();
        for report in &ingestion.hazards {
            reported.insert(report.hazard_type);
            if let Err(e) = self
                .apply_report(&ingestion, report, reading.as_ref(), &mut outcome)
                .await
            {
                error!("Failed to record {} alert: {}", report.hazard_type, e);
                first_error.get_or_insert(e);
            }
        }

        // Cooldown phase. Hazards reported above were just reset (or failed)
        // and are left alone; everything else open on this node is still in
        // its pre-ingestion state.
        match self.store.open_incidents(Some(node_id)).await {
            Ok(open) => {
                for incident in open
                    .into_iter()
                    .filter(|i| !reported.contains(&i.hazard_type))
                {
                    let hazard_type = incident.hazard_type;
                    if let Err(e) = self.advance_cooldown(incident, at, &mut outcome).await {
                        error!("Failed to advance {} cooldown: {}", hazard_type, e);
                        first_error.get_or_insert(e);
                    }
                }
            }
            Err(e) => {
                error!("Failed to load open incidents: {}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(IngestError::Persistence(e)),
            None => Ok(outcome),
        }
    }

    async fn store_reading(
        &self,
        ingestion: &NormalizedIngestion,
    ) -> Result<Option<Reading>, StoreError> {
        // ---
        let Some(telemetry) = ingestion.readings.filter(|t| !t.is_empty()) else {
            return Ok(None);
        };

        let reading = self
            .store
            .insert_reading(&NewReading {
                node_id: ingestion.node_id,
                timestamp: ingestion.timestamp,
                telemetry,
                location: ingestion.location,
                signal: ingestion.signal,
            })
            .await?;
        self.publisher.publish(Event::new_reading(&reading));
        Ok(Some(reading))
    }

    /// Open a new incident or reinforce the open one for this report.
    async fn apply_report(
        &self,
        ingestion: &NormalizedIngestion,
        report: &HazardReport,
        reading: Option<&Reading>,
        outcome: &mut IngestOutcome,
    ) -> Result<(), StoreError> {
        // ---
        let node_id = ingestion.node_id;
        let hazard_type = report.hazard_type;
        let linked_reading_id = reading.map(|r| r.reading_id);

        let open = self.store.open_incident(node_id, hazard_type).await?;
        let is_new_incident = open.is_none();

        let start = match open {
            None => {
                let start = self
                    .store
                    .start_incident(&NewIncident {
                        node_id,
                        hazard_type,
                        start_timestamp: ingestion.timestamp,
                        timestamp: ingestion.timestamp,
                        severity: report.severity,
                        confidence: report.confidence,
                        is_incident_start: true,
                        linked_reading_id,
                    })
                    .await?;
                info!("Opened {} incident {}", hazard_type, start.incident_id);
                outcome.started.push(hazard_type);
                start
            }
            Some(open) => {
                let reinforced = self
                    .store
                    .reinforce_incident(
                        &open,
                        &NewIncident {
                            node_id,
                            hazard_type,
                            start_timestamp: open.start_timestamp,
                            timestamp: ingestion.timestamp,
                            severity: report.severity,
                            confidence: report.confidence,
                            is_incident_start: false,
                            linked_reading_id,
                        },
                    )
                    .await?;
                debug!(
                    "Reinforced {} incident {} with row {}",
                    hazard_type, reinforced.start.incident_id, reinforced.alert.incident_id
                );
                outcome.reinforced.push(hazard_type);
                reinforced.start
            }
        };

        let telemetry = ingestion.readings.unwrap_or_default();
        let payload = HazardDetected {
            node_id,
            hazard_type,
            incident_id: start.incident_id,
            is_new_incident,
            incident_start_timestamp: start.start_timestamp,
            timestamp: ingestion.timestamp,
            severity: report.severity,
            confidence: report.confidence,
            temperature: telemetry.temperature,
            humidity: telemetry.humidity,
            co_level: telemetry.co_level,
            location: ingestion.location,
            rssi: ingestion.signal.rssi,
            snr: ingestion.signal.snr,
        };
        self.publisher.publish(Event::hazard_detected(&payload));
        if self.settings.legacy_hazard_events {
            self.publisher.publish(Event::legacy_hazard_detected(&payload));
        }
        Ok(())
    }

    /// Count one plain reading against an open incident.
    async fn advance_cooldown(
        &self,
        incident: Incident,
        at: DateTime<Utc>,
        outcome: &mut IngestOutcome,
    ) -> Result<(), StoreError> {
        // ---
        let hazard_type = incident.hazard_type;
        let threshold = self.settings.cooldown.threshold(hazard_type);
        let counter = incident.cooldown_counter.saturating_add(1);

        if counter >= threshold {
            let rows_closed = self.store.close_incident(&incident, counter, at).await?;
            info!(
                "Resolved {} incident {} after {} quiet readings ({} rows closed)",
                hazard_type, incident.incident_id, counter, rows_closed
            );
            outcome.resolved.push(hazard_type);
            self.publisher.publish(Event::hazard_resolved(&HazardResolved {
                node_id: incident.node_id,
                hazard_type,
                incident_id: incident.incident_id,
                incident_start_timestamp: incident.start_timestamp,
                resolved_at: at,
                rows_closed,
                manual: false,
            }));
        } else {
            self.store.set_cooldown(incident.incident_id, counter).await?;
            debug!(
                "{} incident {} cooldown {}/{}",
                hazard_type, incident.incident_id, counter, threshold
            );
            outcome.cooldown.push(CooldownAdvance {
                hazard_type,
                incident_id: incident.incident_id,
                cooldown_counter: counter,
            });
            self.publisher.publish(Event::cooldown_tick(&CooldownTick {
                node_id: incident.node_id,
                hazard_type,
                incident_id: incident.incident_id,
                cooldown_counter: counter,
                threshold,
                incident_start_timestamp: incident.start_timestamp,
            }));
        }
        Ok(())
    }

    /// Resolve the logical incident `incident_id` belongs to.
    ///
    /// Serialized with ingestion for the same node. `resolved_at` defaults
    /// to now.
    pub async fn resolve_manually(
        &self,
        incident_id: i64,
        resolved_at: Option<DateTime<Utc>>,
    ) -> Result<ResolvedGroup, StoreError> {
        // ---
        let incident = self
            .store
            .get_incident(incident_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("incident {incident_id}")))?;

        let _guard = self.node_locks.lock(incident.node_id).await;
        let resolved = self
            .store
            .resolve_group(incident_id, resolved_at.unwrap_or_else(Utc::now))
            .await?;

        info!(
            "Manually resolved {} incident on node {} ({} rows)",
            resolved.hazard_type, resolved.node_id, resolved.rows_closed
        );
        self.publisher
            .publish(Event::hazard_resolved(&HazardResolved::from(&resolved)));
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::events::{self, Event};
    use crate::fanout::{Fanout, Subscription};
    use crate::models::{Location, NodeStatus, Severity, Telemetry};
    use crate::store::{IncidentFilter, MemoryStore};
    use chrono::{Duration, TimeZone};

    struct Harness {
        store: Arc<MemoryStore>,
        engine: IncidentEngine,
        events: Subscription,
        _fanout: Arc<Fanout>,
    }

    fn harness(settings: EngineSettings) -> Harness {
        // ---
        let store = Arc::new(MemoryStore::new());
        let fanout = Fanout::new(1024);
        let events = fanout.subscribe();
        let engine = IncidentEngine::new(store.clone(), fanout.clone(), settings);
        Harness {
            store,
            engine,
            events,
            _fanout: fanout,
        }
    }

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn plain(node_id: i64, at: DateTime<Utc>) -> NormalizedIngestion {
        NormalizedIngestion {
            readings: Some(Telemetry {
                temperature: Some(24.0),
                humidity: Some(60.0),
                co_level: Some(3.0),
            }),
            ..NormalizedIngestion::plain(node_id, at)
        }
    }

    fn alert(node_id: i64, at: DateTime<Utc>, reports: &[(HazardType, Severity)]) -> NormalizedIngestion {
        NormalizedIngestion {
            hazards: reports
                .iter()
                .map(|(hazard_type, severity)| HazardReport {
                    hazard_type: *hazard_type,
                    severity: *severity,
                    confidence: Some(0.81),
                })
                .collect(),
            ..plain(node_id, at)
        }
    }

    fn names(events: &[Arc<Event>]) -> Vec<&str> {
        events.iter().map(|e| e.event.as_str()).collect()
    }

    async fn open_rows(store: &MemoryStore, node_id: i64) -> Vec<Incident> {
        store.open_incidents(Some(node_id)).await.unwrap()
    }

    async fn assert_single_open_start(store: &MemoryStore) {
        // ---
        let open = store.open_incidents(None).await.unwrap();
        let mut seen = HashSet::new();
        for row in &open {
            assert!(
                seen.insert((row.node_id, row.hazard_type)),
                "two open start-rows for node {} {}",
                row.node_id,
                row.hazard_type
            );
        }
    }

    #[tokio::test]
    async fn test_plain_reading_creates_node_and_reading() {
        // ---
        let mut h = harness(EngineSettings::default());
        let outcome = h.engine.ingest(plain(7, t(0))).await.unwrap();

        let node = h.store.get_node(7).await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Active);
        assert_eq!(node.last_seen, Some(t(0)));
        assert!(outcome.reading_id.is_some());

        let readings = h.store.list_readings(&Default::default()).await.unwrap();
        assert_eq!(readings.len(), 1);
        let all = h.store.list_incidents(&IncidentFilter::default()).await.unwrap();
        assert!(all.is_empty());

        assert_eq!(
            names(&h.events.drain()),
            vec![events::NODE_STATUS_CHANGED, events::NEW_READING]
        );
    }

    #[tokio::test]
    async fn test_first_alert_opens_incident() {
        // ---
        let mut h = harness(EngineSettings::default());
        h.engine.ingest(plain(7, t(0))).await.unwrap();
        h.events.drain();

        let outcome = h
            .engine
            .ingest(alert(7, t(1), &[(HazardType::Fire, Severity::Medium)]))
            .await
            .unwrap();
        assert_eq!(outcome.started, vec![HazardType::Fire]);

        let open = open_rows(&h.store, 7).await;
        assert_eq!(open.len(), 1);
        let start = &open[0];
        assert!(start.is_incident_start);
        assert_eq!(start.severity, Severity::Medium);
        assert_eq!(start.confidence, Some(0.81));
        assert_eq!(start.cooldown_counter, 0);
        assert_eq!(start.start_timestamp, t(1));
        assert_eq!(start.linked_reading_id, outcome.reading_id);

        let evs = h.events.drain();
        let detected = evs.iter().find(|e| e.event == events::HAZARD_DETECTED).unwrap();
        assert_eq!(detected.data["is_new_incident"], true);
        assert_eq!(detected.data["severity"], "medium");
        assert_eq!(detected.data["temperature"], 24.0);
    }

    #[tokio::test]
    async fn test_second_alert_reinforces() {
        // ---
        let mut h = harness(EngineSettings::default());
        h.engine
            .ingest(alert(7, t(0), &[(HazardType::Fire, Severity::Medium)]))
            .await
            .unwrap();
        h.engine.ingest(plain(7, t(1))).await.unwrap();
        assert_eq!(open_rows(&h.store, 7).await[0].cooldown_counter, 1);
        h.events.drain();

        let outcome = h
            .engine
            .ingest(alert(7, t(2), &[(HazardType::Fire, Severity::High)]))
            .await
            .unwrap();
        assert_eq!(outcome.reinforced, vec![HazardType::Fire]);

        let open = open_rows(&h.store, 7).await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].cooldown_counter, 0);
        assert_eq!(open[0].last_update_timestamp, t(2));
        assert_eq!(open[0].start_timestamp, t(0));

        let rows = h.store.list_incidents(&IncidentFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 2);
        let history = rows.iter().find(|r| !r.is_incident_start).unwrap();
        assert_eq!(history.start_timestamp, t(0));
        assert_eq!(history.severity, Severity::High);
        assert!(history.resolved_at.is_none());

        let evs = h.events.drain();
        let detected = evs.iter().find(|e| e.event == events::HAZARD_DETECTED).unwrap();
        assert_eq!(detected.data["is_new_incident"], false);
        assert_eq!(detected.data["incident_start_timestamp"], "2025-06-01T12:00:00Z");
    }

    #[tokio::test]
    async fn test_reinforcing_alert_escalates_severity() {
        // ---
        let h = harness(EngineSettings::default());
        h.engine
            .ingest(alert(7, t(0), &[(HazardType::Fire, Severity::Low)]))
            .await
            .unwrap();
        h.engine
            .ingest(alert(7, t(1), &[(HazardType::Fire, Severity::High)]))
            .await
            .unwrap();

        let open = open_rows(&h.store, 7).await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].severity, Severity::High);

        // A weaker report does not downgrade it.
        h.engine
            .ingest(alert(7, t(2), &[(HazardType::Fire, Severity::Low)]))
            .await
            .unwrap();
        assert_eq!(open_rows(&h.store, 7).await[0].severity, Severity::High);
    }

    #[tokio::test]
    async fn test_fifth_plain_reading_resolves() {
        // ---
        let mut h = harness(EngineSettings::default());
        h.engine
            .ingest(alert(7, t(0), &[(HazardType::Fire, Severity::Medium)]))
            .await
            .unwrap();
        h.engine
            .ingest(alert(7, t(1), &[(HazardType::Fire, Severity::Medium)]))
            .await
            .unwrap();
        h.events.drain();

        let mut last_counter = 0;
        for i in 1..=4 {
            let outcome = h.engine.ingest(plain(7, t(1 + i))).await.unwrap();
            assert!(outcome.resolved.is_empty());
            let counter = open_rows(&h.store, 7).await[0].cooldown_counter;
            assert!(counter > last_counter);
            assert_eq!(counter, i as i32);
            last_counter = counter;
        }
        let ticks = h.events.drain();
        assert_eq!(
            ticks.iter().filter(|e| e.event == events::HAZARD_COOLDOWN_TICK).count(),
            4
        );

        let outcome = h.engine.ingest(plain(7, t(6))).await.unwrap();
        assert_eq!(outcome.resolved, vec![HazardType::Fire]);
        assert!(open_rows(&h.store, 7).await.is_empty());

        // Start-row and the reinforcing row are both closed
        let rows = h.store.list_incidents(&IncidentFilter::default()).await.unwrap();
        assert!(rows.iter().all(|r| r.resolved_at == Some(t(6))));
        let start = rows.iter().find(|r| r.is_incident_start).unwrap();
        assert_eq!(start.cooldown_counter, 5);

        let evs = h.events.drain();
        let resolved = evs.iter().find(|e| e.event == events::HAZARD_RESOLVED).unwrap();
        assert_eq!(resolved.data["rows_closed"], 2);
        assert_eq!(resolved.data["hazard_type"], "fire");
        assert_eq!(resolved.data["manual"], false);
    }

    #[tokio::test]
    async fn test_alert_after_resolution_opens_fresh_incident() {
        // ---
        let h = harness(EngineSettings {
            cooldown: CooldownPolicy::new(1),
            legacy_hazard_events: false,
        });
        h.engine
            .ingest(alert(7, t(0), &[(HazardType::Chainsaw, Severity::Low)]))
            .await
            .unwrap();
        h.engine.ingest(plain(7, t(1))).await.unwrap();
        assert!(open_rows(&h.store, 7).await.is_empty());

        let outcome = h
            .engine
            .ingest(alert(7, t(2), &[(HazardType::Chainsaw, Severity::Low)]))
            .await
            .unwrap();
        assert_eq!(outcome.started, vec![HazardType::Chainsaw]);
        assert_eq!(open_rows(&h.store, 7).await[0].start_timestamp, t(2));
    }

    #[tokio::test]
    async fn test_mixed_ingestion_resets_one_and_ticks_other() {
        // ---
        let h = harness(EngineSettings::default());
        h.engine
            .ingest(alert(7, t(0), &[(HazardType::Fire, Severity::Medium)]))
            .await
            .unwrap();
        h.engine
            .ingest(alert(7, t(1), &[(HazardType::Chainsaw, Severity::Low)]))
            .await
            .unwrap();
        h.engine.ingest(plain(7, t(2))).await.unwrap();

        let counters = |rows: Vec<Incident>| -> HashMap<HazardType, i32> {
            rows.into_iter().map(|r| (r.hazard_type, r.cooldown_counter)).collect()
        };
        let before = counters(open_rows(&h.store, 7).await);
        assert_eq!(before[&HazardType::Fire], 2);
        assert_eq!(before[&HazardType::Chainsaw], 1);

        // Fire reinforced, gunshots new, chainsaw is a plain reading
        let outcome = h
            .engine
            .ingest(alert(
                7,
                t(3),
                &[
                    (HazardType::Fire, Severity::High),
                    (HazardType::Gunshots, Severity::High),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(outcome.reinforced, vec![HazardType::Fire]);
        assert_eq!(outcome.started, vec![HazardType::Gunshots]);

        let after = counters(open_rows(&h.store, 7).await);
        assert_eq!(after[&HazardType::Fire], 0);
        assert_eq!(after[&HazardType::Gunshots], 0);
        assert_eq!(after[&HazardType::Chainsaw], 2);
        assert_single_open_start(&h.store).await;
    }

    #[tokio::test]
    async fn test_duplicate_reports_in_one_uplink() {
        // ---
        let h = harness(EngineSettings::default());
        let outcome = h
            .engine
            .ingest(alert(
                3,
                t(0),
                &[(HazardType::Fire, Severity::Low), (HazardType::Fire, Severity::High)],
            ))
            .await
            .unwrap();
        assert_eq!(outcome.started, vec![HazardType::Fire]);
        assert_eq!(outcome.reinforced, vec![HazardType::Fire]);
        assert_eq!(open_rows(&h.store, 3).await.len(), 1);
        assert_single_open_start(&h.store).await;
    }

    #[tokio::test]
    async fn test_nodes_do_not_share_cooldown() {
        // ---
        let h = harness(EngineSettings::default());
        h.engine
            .ingest(alert(1, t(0), &[(HazardType::Fire, Severity::Low)]))
            .await
            .unwrap();
        h.engine.ingest(plain(2, t(1))).await.unwrap();
        assert_eq!(open_rows(&h.store, 1).await[0].cooldown_counter, 0);
    }

    #[tokio::test]
    async fn test_per_hazard_threshold() {
        // ---
        let h = harness(EngineSettings {
            cooldown: CooldownPolicy::default().with_override(HazardType::Gunshots, 2),
            legacy_hazard_events: false,
        });
        h.engine
            .ingest(alert(
                9,
                t(0),
                &[(HazardType::Gunshots, Severity::High), (HazardType::Fire, Severity::High)],
            ))
            .await
            .unwrap();
        h.engine.ingest(plain(9, t(1))).await.unwrap();
        let outcome = h.engine.ingest(plain(9, t(2))).await.unwrap();
        assert_eq!(outcome.resolved, vec![HazardType::Gunshots]);

        let open = open_rows(&h.store, 9).await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].hazard_type, HazardType::Fire);
        assert_eq!(open[0].cooldown_counter, 2);
    }

    #[tokio::test]
    async fn test_hazard_only_uplink_has_no_reading() {
        // ---
        let h = harness(EngineSettings::default());
        let ingestion = NormalizedIngestion {
            readings: None,
            location: Location::from_parts(Some(1.0), Some(2.0), None, None),
            ..alert(4, t(0), &[(HazardType::Gunshots, Severity::Unknown)])
        };
        let outcome = h.engine.ingest(ingestion).await.unwrap();
        assert!(outcome.reading_id.is_none());
        assert_eq!(open_rows(&h.store, 4).await[0].linked_reading_id, None);
        assert!(h.store.list_readings(&Default::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_legacy_alias_published() {
        // ---
        let mut h = harness(EngineSettings {
            cooldown: CooldownPolicy::default(),
            legacy_hazard_events: true,
        });
        h.engine
            .ingest(alert(5, t(0), &[(HazardType::Chainsaw, Severity::Medium)]))
            .await
            .unwrap();
        let evs = h.events.drain();
        let names = names(&evs);
        assert!(names.contains(&events::HAZARD_DETECTED));
        assert!(names.contains(&"chainsaw_detected"));
    }

    #[tokio::test]
    async fn test_failed_hazard_does_not_block_others() {
        // ---
        let h = harness(EngineSettings::default());
        h.store.fail_writes_for(Some(HazardType::Fire));

        let err = h
            .engine
            .ingest(alert(
                6,
                t(0),
                &[(HazardType::Fire, Severity::High), (HazardType::Gunshots, Severity::High)],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Persistence(_)));

        // Gunshots and the reading committed regardless
        let open = open_rows(&h.store, 6).await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].hazard_type, HazardType::Gunshots);
        assert_eq!(h.store.list_readings(&Default::default()).await.unwrap().len(), 1);

        h.store.fail_writes_for(None);
        h.engine.ingest(plain(6, t(1))).await.unwrap();
        assert_eq!(open_rows(&h.store, 6).await[0].cooldown_counter, 1);
    }

    #[tokio::test]
    async fn test_manual_resolution() {
        // ---
        let mut h = harness(EngineSettings::default());
        h.engine
            .ingest(alert(7, t(0), &[(HazardType::Fire, Severity::Medium)]))
            .await
            .unwrap();
        h.engine
            .ingest(alert(7, t(1), &[(HazardType::Fire, Severity::Medium)]))
            .await
            .unwrap();
        h.events.drain();

        let rows = h.store.list_incidents(&IncidentFilter::default()).await.unwrap();
        let reinforcing = rows.iter().find(|r| !r.is_incident_start).unwrap();

        let resolved = h
            .engine
            .resolve_manually(reinforcing.incident_id, Some(t(10)))
            .await
            .unwrap();
        assert_eq!(resolved.rows_closed, 2);
        assert!(open_rows(&h.store, 7).await.is_empty());

        let evs = h.events.drain();
        assert_eq!(names(&evs), vec![events::HAZARD_RESOLVED_MANUAL]);

        let err = h
            .engine
            .resolve_manually(reinforcing.incident_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(msg) if msg.contains("no active rows")));

        let err = h.engine.resolve_manually(999, None).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ingestion_same_node() {
        // ---
        let store = Arc::new(MemoryStore::new());
        store.pause_after_lookup(true);
        let fanout = Fanout::new(16);
        let engine = Arc::new(IncidentEngine::new(
            store.clone(),
            fanout,
            EngineSettings::default(),
        ));

        let mut handles = Vec::new();
        for i in 0..20 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .ingest(alert(11, t(i), &[(HazardType::Fire, Severity::Low)]))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let rows = store.list_incidents(&IncidentFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 20);
        assert_eq!(rows.iter().filter(|r| r.is_incident_start).count(), 1);
        assert_single_open_start(&store).await;
    }

    #[tokio::test]
    async fn test_idle_node_locks_are_pruned() {
        // ---
        let h = harness(EngineSettings::default());
        for node_id in 1..=10 {
            h.engine.ingest(plain(node_id, t(0))).await.unwrap();
        }
        assert_eq!(h.engine.node_locks.len(), 1);

        let locks = NodeLocks::default();
        let held = locks.lock(1).await;
        let _other = locks.lock(2).await;
        assert_eq!(locks.len(), 2);
        drop(held);
        let _third = locks.lock(3).await;
        assert_eq!(locks.len(), 2);
    }
}
