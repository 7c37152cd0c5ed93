//! PostgreSQL implementation of [`IncidentStore`].
//!
//! Every multi-statement operation runs in its own transaction, so one
//! hazard type's update either lands completely or not at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{
    IncidentFilter, IncidentStore, ReadingFilter, Reinforcement, ResolvedGroup, StoreResult,
    TimelineFilter,
};
use crate::error::StoreError;
use crate::models::{
    HazardType, Incident, IncidentGroup, Location, NewIncident, NewReading, NodeStatus, NodeTouch,
    Reading, SensorNode, Severity,
};

// ---

const NODE_COLUMNS: &str = "node_id, name, status, last_seen, created_at";

const READING_COLUMNS: &str = "reading_id, node_id, timestamp, temperature, humidity, co_level, \
     latitude, longitude, altitude, fix_acquired, rssi, snr";

const INCIDENT_COLUMNS: &str = "incident_id, node_id, hazard_type, start_timestamp, \
     last_update_timestamp, severity, confidence, cooldown_counter, is_incident_start, \
     resolved_at, linked_reading_id";

#[derive(sqlx::FromRow)]
struct NodeRow {
    node_id: i64,
    name: String,
    status: String,
    last_seen: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<NodeRow> for SensorNode {
    fn from(row: NodeRow) -> Self {
        SensorNode {
            node_id: row.node_id,
            name: row.name,
            status: NodeStatus::from_label(&row.status),
            last_seen: row.last_seen,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TouchRow {
    #[sqlx(flatten)]
    node: NodeRow,
    previous_status: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ReadingRow {
    reading_id: i64,
    node_id: i64,
    timestamp: DateTime<Utc>,
    temperature: Option<f64>,
    humidity: Option<f64>,
    co_level: Option<f64>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    altitude: Option<f64>,
    fix_acquired: Option<bool>,
    rssi: Option<f64>,
    snr: Option<f64>,
}

impl From<ReadingRow> for Reading {
    fn from(row: ReadingRow) -> Self {
        Reading {
            reading_id: row.reading_id,
            node_id: row.node_id,
            timestamp: row.timestamp,
            temperature: row.temperature,
            humidity: row.humidity,
            co_level: row.co_level,
            location: Location::from_parts(
                row.latitude,
                row.longitude,
                row.altitude,
                row.fix_acquired,
            ),
            rssi: row.rssi,
            snr: row.snr,
        }
    }
}

#[derive(sqlx::FromRow)]
struct IncidentRow {
    incident_id: i64,
    node_id: i64,
    hazard_type: String,
    start_timestamp: DateTime<Utc>,
    last_update_timestamp: DateTime<Utc>,
    severity: String,
    confidence: Option<f64>,
    cooldown_counter: i32,
    is_incident_start: bool,
    resolved_at: Option<DateTime<Utc>>,
    linked_reading_id: Option<i64>,
}

impl TryFrom<IncidentRow> for Incident {
    type Error = StoreError;

    fn try_from(row: IncidentRow) -> Result<Self, Self::Error> {
        Ok(Incident {
            incident_id: row.incident_id,
            node_id: row.node_id,
            hazard_type: parse_hazard(&row.hazard_type)?,
            start_timestamp: row.start_timestamp,
            last_update_timestamp: row.last_update_timestamp,
            severity: Severity::from_label(&row.severity),
            confidence: row.confidence,
            cooldown_counter: row.cooldown_counter,
            is_incident_start: row.is_incident_start,
            resolved_at: row.resolved_at,
            linked_reading_id: row.linked_reading_id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct GroupRow {
    node_id: i64,
    hazard_type: String,
    start_timestamp: DateTime<Utc>,
    last_alert_timestamp: DateTime<Utc>,
    alert_count: i64,
    max_severity_score: i32,
    avg_severity_score: f64,
    max_confidence: Option<f64>,
    avg_confidence: Option<f64>,
    is_active: Option<bool>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<GroupRow> for IncidentGroup {
    type Error = StoreError;

    fn try_from(row: GroupRow) -> Result<Self, Self::Error> {
        let is_active = row.is_active.unwrap_or(false);
        Ok(IncidentGroup {
            node_id: row.node_id,
            hazard_type: parse_hazard(&row.hazard_type)?,
            start_timestamp: row.start_timestamp,
            last_alert_timestamp: row.last_alert_timestamp,
            alert_count: row.alert_count,
            max_severity: Severity::from_code(i64::from(row.max_severity_score)),
            avg_severity_score: row.avg_severity_score,
            max_confidence: row.max_confidence,
            avg_confidence: row.avg_confidence,
            resolved_at: if is_active { None } else { row.resolved_at },
            is_active,
        })
    }
}

fn parse_hazard(raw: &str) -> StoreResult<HazardType> {
    raw.parse::<HazardType>().map_err(StoreError::Corrupt)
}

fn incidents(rows: Vec<IncidentRow>) -> StoreResult<Vec<Incident>> {
    rows.into_iter().map(Incident::try_from).collect()
}

/// Unique violations on the open-incident index surface as `Conflict`.
fn map_insert_error(err: sqlx::Error, what: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(format!("{what} already has an open incident"))
        }
        _ => StoreError::Database(err),
    }
}

/// Severity score expression shared by the timeline aggregates.
const SEVERITY_SCORE_SQL: &str =
    "CASE severity WHEN 'high' THEN 3 WHEN 'medium' THEN 2 WHEN 'low' THEN 1 ELSE 0 END";

// ---

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl IncidentStore for PgStore {
    // ---
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn touch_node(&self, node_id: i64, seen_at: DateTime<Utc>) -> StoreResult<NodeTouch> {
        // ---
        // All parts of one statement share a snapshot, so `prev` sees the
        // status from before the upsert.
        let sql = format!(
            r#"
            WITH prev AS (
                SELECT status FROM sensor_nodes WHERE node_id = $1
            )
            INSERT INTO sensor_nodes (node_id, name, status, last_seen)
            VALUES ($1, $2, 'active', $3)
            ON CONFLICT (node_id) DO UPDATE SET
                status    = 'active',
                last_seen = GREATEST(sensor_nodes.last_seen, EXCLUDED.last_seen)
            RETURNING {NODE_COLUMNS}, (SELECT status FROM prev) AS previous_status
            "#
        );

        let row: TouchRow = sqlx::query_as(&sql)
            .bind(node_id)
            .bind(SensorNode::default_name(node_id))
            .bind(seen_at)
            .fetch_one(&self.pool)
            .await?;

        Ok(NodeTouch {
            previous_status: row.previous_status.as_deref().map(NodeStatus::from_label),
            node: row.node.into(),
        })
    }

    async fn provision_node(&self, node_id: i64, name: Option<&str>) -> StoreResult<SensorNode> {
        // ---
        let sql = format!(
            r#"
            INSERT INTO sensor_nodes (node_id, name, status)
            VALUES ($1, COALESCE($2, $3), 'inactive')
            ON CONFLICT (node_id) DO UPDATE SET
                name = COALESCE($2, sensor_nodes.name)
            RETURNING {NODE_COLUMNS}
            "#
        );

        let row: NodeRow = sqlx::query_as(&sql)
            .bind(node_id)
            .bind(name)
            .bind(SensorNode::default_name(node_id))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    async fn get_node(&self, node_id: i64) -> StoreResult<Option<SensorNode>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM sensor_nodes WHERE node_id = $1");
        let row: Option<NodeRow> = sqlx::query_as(&sql)
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn list_nodes(&self) -> StoreResult<Vec<SensorNode>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM sensor_nodes ORDER BY node_id");
        let rows: Vec<NodeRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn mark_inactive_nodes(
        &self,
        seen_before: DateTime<Utc>,
    ) -> StoreResult<Vec<SensorNode>> {
        // ---
        let sql = format!(
            r#"
            UPDATE sensor_nodes SET status = 'inactive'
            WHERE status = 'active' AND (last_seen IS NULL OR last_seen < $1)
            RETURNING {NODE_COLUMNS}
            "#
        );
        let rows: Vec<NodeRow> = sqlx::query_as(&sql)
            .bind(seen_before)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_node(&self, node_id: i64, live_after: DateTime<Utc>) -> StoreResult<()> {
        // ---
        let mut tx = self.pool.begin().await?;

        let last_seen: Option<(Option<DateTime<Utc>>,)> =
            sqlx::query_as("SELECT last_seen FROM sensor_nodes WHERE node_id = $1 FOR UPDATE")
                .bind(node_id)
                .fetch_optional(&mut *tx)
                .await?;

        match last_seen {
            None => return Err(StoreError::NotFound(format!("node {node_id}"))),
            Some((Some(seen),)) if seen >= live_after => {
                return Err(StoreError::Conflict(format!(
                    "node {node_id} was seen recently and cannot be deleted"
                )))
            }
            Some(_) => {}
        }

        // readings and incidents go with the node (ON DELETE CASCADE)
        sqlx::query("DELETE FROM sensor_nodes WHERE node_id = $1")
            .bind(node_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_reading(&self, reading: &NewReading) -> StoreResult<Reading> {
        // ---
        let location = reading.location.unwrap_or_default();
        let sql = format!(
            r#"
            INSERT INTO readings (
                node_id, timestamp, temperature, humidity, co_level,
                latitude, longitude, altitude, fix_acquired, rssi, snr
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {READING_COLUMNS}
            "#
        );

        let row: ReadingRow = sqlx::query_as(&sql)
            .bind(reading.node_id)
            .bind(reading.timestamp)
            .bind(reading.telemetry.temperature)
            .bind(reading.telemetry.humidity)
            .bind(reading.telemetry.co_level)
            .bind(location.latitude)
            .bind(location.longitude)
            .bind(location.altitude)
            .bind(location.fix_acquired)
            .bind(reading.signal.rssi)
            .bind(reading.signal.snr)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    async fn list_readings(&self, filter: &ReadingFilter) -> StoreResult<Vec<Reading>> {
        // ---
        let sql = format!(
            r#"
            SELECT {READING_COLUMNS} FROM readings
            WHERE ($1::BIGINT IS NULL OR node_id = $1)
              AND ($2::TIMESTAMPTZ IS NULL OR timestamp >= $2)
            ORDER BY timestamp DESC, reading_id DESC
            LIMIT $3
            "#
        );
        let rows: Vec<ReadingRow> = sqlx::query_as(&sql)
            .bind(filter.node_id)
            .bind(filter.since)
            .bind(filter.limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn open_incident(
        &self,
        node_id: i64,
        hazard_type: HazardType,
    ) -> StoreResult<Option<Incident>> {
        // ---
        // Served by idx_incidents_open_start
        let sql = format!(
            r#"
            SELECT {INCIDENT_COLUMNS} FROM incidents
            WHERE node_id = $1 AND hazard_type = $2
              AND resolved_at IS NULL AND is_incident_start
            ORDER BY start_timestamp DESC
            LIMIT 1
            "#
        );
        let row: Option<IncidentRow> = sqlx::query_as(&sql)
            .bind(node_id)
            .bind(hazard_type.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Incident::try_from).transpose()
    }

    async fn open_incidents(&self, node_id: Option<i64>) -> StoreResult<Vec<Incident>> {
        // ---
        let sql = format!(
            r#"
            SELECT {INCIDENT_COLUMNS} FROM incidents
            WHERE resolved_at IS NULL AND is_incident_start
              AND ($1::BIGINT IS NULL OR node_id = $1)
            ORDER BY start_timestamp DESC, incident_id DESC
            "#
        );
        let rows: Vec<IncidentRow> = sqlx::query_as(&sql)
            .bind(node_id)
            .fetch_all(&self.pool)
            .await?;
        incidents(rows)
    }

    async fn start_incident(&self, incident: &NewIncident) -> StoreResult<Incident> {
        // ---
        let sql = format!(
            r#"
            INSERT INTO incidents (
                node_id, hazard_type, start_timestamp, last_update_timestamp,
                severity, confidence, cooldown_counter, is_incident_start, linked_reading_id
            ) VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $8)
            RETURNING {INCIDENT_COLUMNS}
            "#
        );
        let row: IncidentRow = sqlx::query_as(&sql)
            .bind(incident.node_id)
            .bind(incident.hazard_type.as_str())
            .bind(incident.start_timestamp)
            .bind(incident.timestamp)
            .bind(incident.severity.as_str())
            .bind(incident.confidence)
            .bind(incident.is_incident_start)
            .bind(incident.linked_reading_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                map_insert_error(e, &format!("node {} {}", incident.node_id, incident.hazard_type))
            })?;
        row.try_into()
    }

    async fn reinforce_incident(
        &self,
        start: &Incident,
        alert: &NewIncident,
    ) -> StoreResult<Reinforcement> {
        // ---
        let mut tx = self.pool.begin().await?;

        let insert = format!(
            r#"
            INSERT INTO incidents (
                node_id, hazard_type, start_timestamp, last_update_timestamp,
                severity, confidence, cooldown_counter, is_incident_start, linked_reading_id
            ) VALUES ($1, $2, $3, $4, $5, $6, 0, FALSE, $7)
            RETURNING {INCIDENT_COLUMNS}
            "#
        );
        let alert_row: IncidentRow = sqlx::query_as(&insert)
            .bind(alert.node_id)
            .bind(alert.hazard_type.as_str())
            .bind(start.start_timestamp)
            .bind(alert.timestamp)
            .bind(alert.severity.as_str())
            .bind(alert.confidence)
            .bind(alert.linked_reading_id)
            .fetch_one(&mut *tx)
            .await?;

        let reset = format!(
            r#"
            UPDATE incidents SET
                cooldown_counter      = 0,
                last_update_timestamp = GREATEST(last_update_timestamp, $2),
                severity              = CASE
                    WHEN $4 >= {SEVERITY_SCORE_SQL} THEN $3
                    ELSE severity
                END
            WHERE incident_id = $1 AND resolved_at IS NULL AND is_incident_start
            RETURNING {INCIDENT_COLUMNS}
            "#
        );
        let start_row: Option<IncidentRow> = sqlx::query_as(&reset)
            .bind(start.incident_id)
            .bind(alert.timestamp)
            .bind(alert.severity.as_str())
            .bind(i32::from(alert.severity.score()))
            .fetch_optional(&mut *tx)
            .await?;

        // Dropping `tx` without commit rolls back the appended row.
        let start_row = start_row
            .ok_or_else(|| StoreError::NotFound(format!("open incident {}", start.incident_id)))?;

        tx.commit().await?;

        Ok(Reinforcement {
            alert: alert_row.try_into()?,
            start: start_row.try_into()?,
        })
    }

    async fn set_cooldown(&self, incident_id: i64, counter: i32) -> StoreResult<()> {
        // ---
        let result = sqlx::query("UPDATE incidents SET cooldown_counter = $2 WHERE incident_id = $1")
            .bind(incident_id)
            .bind(counter)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("incident {incident_id}")));
        }
        Ok(())
    }

    async fn close_incident(
        &self,
        start: &Incident,
        final_counter: i32,
        resolved_at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        // ---
        let result = sqlx::query(
            r#"
            UPDATE incidents SET
                resolved_at      = $4,
                cooldown_counter = CASE WHEN incident_id = $5 THEN $6 ELSE cooldown_counter END
            WHERE node_id = $1 AND hazard_type = $2 AND start_timestamp = $3
              AND resolved_at IS NULL
            "#,
        )
        .bind(start.node_id)
        .bind(start.hazard_type.as_str())
        .bind(start.start_timestamp)
        .bind(resolved_at)
        .bind(start.incident_id)
        .bind(final_counter)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_incident(&self, incident_id: i64) -> StoreResult<Option<Incident>> {
        let sql = format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE incident_id = $1");
        let row: Option<IncidentRow> = sqlx::query_as(&sql)
            .bind(incident_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Incident::try_from).transpose()
    }

    async fn resolve_group(
        &self,
        incident_id: i64,
        resolved_at: DateTime<Utc>,
    ) -> StoreResult<ResolvedGroup> {
        // ---
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE incident_id = $1");
        let row: Incident = sqlx::query_as::<_, IncidentRow>(&sql)
            .bind(incident_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("incident {incident_id}")))?
            .try_into()?;

        let result = sqlx::query(
            r#"
            UPDATE incidents SET resolved_at = $4
            WHERE node_id = $1 AND hazard_type = $2 AND start_timestamp = $3
              AND resolved_at IS NULL
            "#,
        )
        .bind(row.node_id)
        .bind(row.hazard_type.as_str())
        .bind(row.start_timestamp)
        .bind(resolved_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "no active rows for incident {incident_id}"
            )));
        }
        tx.commit().await?;

        Ok(ResolvedGroup {
            incident_id,
            node_id: row.node_id,
            hazard_type: row.hazard_type,
            start_timestamp: row.start_timestamp,
            resolved_at,
            rows_closed: result.rows_affected(),
        })
    }

    async fn list_incidents(&self, filter: &IncidentFilter) -> StoreResult<Vec<Incident>> {
        // ---
        let sql = format!(
            r#"
            SELECT {INCIDENT_COLUMNS} FROM incidents
            WHERE ($1::BIGINT IS NULL OR node_id = $1)
              AND ($2::TEXT IS NULL OR hazard_type = $2)
              AND ($3::BOOLEAN IS NULL OR (resolved_at IS NOT NULL) = $3)
            ORDER BY last_update_timestamp DESC, incident_id DESC
            LIMIT $4 OFFSET $5
            "#
        );
        let rows: Vec<IncidentRow> = sqlx::query_as(&sql)
            .bind(filter.node_id)
            .bind(filter.hazard_type.map(|h| h.as_str()))
            .bind(filter.resolved)
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await?;
        incidents(rows)
    }

    async fn incident_timeline(
        &self,
        filter: &TimelineFilter,
    ) -> StoreResult<Vec<IncidentGroup>> {
        // ---
        let sql = format!(
            r#"
            SELECT
                node_id,
                hazard_type,
                start_timestamp,
                MAX(last_update_timestamp)                       AS last_alert_timestamp,
                COUNT(*)                                         AS alert_count,
                MAX({SEVERITY_SCORE_SQL})::INTEGER               AS max_severity_score,
                AVG({SEVERITY_SCORE_SQL})::DOUBLE PRECISION      AS avg_severity_score,
                MAX(confidence)                                  AS max_confidence,
                AVG(confidence)                                  AS avg_confidence,
                BOOL_OR(resolved_at IS NULL)                     AS is_active,
                MAX(resolved_at)                                 AS resolved_at
            FROM incidents
            WHERE ($1::BIGINT IS NULL OR node_id = $1)
              AND ($2::TEXT IS NULL OR hazard_type = $2)
            GROUP BY node_id, hazard_type, start_timestamp
            ORDER BY start_timestamp DESC, node_id, hazard_type
            LIMIT $3
            "#
        );
        let rows: Vec<GroupRow> = sqlx::query_as(&sql)
            .bind(filter.node_id)
            .bind(filter.hazard_type.map(|h| h.as_str()))
            .bind(filter.limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(IncidentGroup::try_from).collect()
    }

    async fn purge_resolved(&self, resolved_before: DateTime<Utc>) -> StoreResult<u64> {
        // ---
        let result =
            sqlx::query("DELETE FROM incidents WHERE resolved_at IS NOT NULL AND resolved_at < $1")
                .bind(resolved_before)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
