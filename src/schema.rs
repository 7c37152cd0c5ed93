//! Database schema management for `forestwatch`.
//!
//! Ensures required tables and indexes exist before serving requests.
//! Applied once on startup from `main.rs` when the postgres backend is
//! selected.

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// Creates `sensor_nodes`, `readings` and `incidents` plus their indexes.
/// Safe to call on every startup; no-op if objects already exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    for statement in SCHEMA_STATEMENTS {
        sqlx::query(*statement).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(())
}

const SCHEMA_STATEMENTS: &[&str] = &[
    // Field devices, upserted on first contact
    r#"
    CREATE TABLE IF NOT EXISTS sensor_nodes (
        node_id     BIGINT      PRIMARY KEY,
        name        TEXT        NOT NULL,
        status      TEXT        NOT NULL DEFAULT 'inactive'
                                CHECK (status IN ('active', 'inactive')),
        last_seen   TIMESTAMPTZ,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    "#,
    // Append-only environmental samples
    r#"
    CREATE TABLE IF NOT EXISTS readings (
        reading_id   BIGSERIAL        PRIMARY KEY,
        node_id      BIGINT           NOT NULL
                                      REFERENCES sensor_nodes (node_id) ON DELETE CASCADE,
        timestamp    TIMESTAMPTZ      NOT NULL,
        temperature  DOUBLE PRECISION,
        humidity     DOUBLE PRECISION,
        co_level     DOUBLE PRECISION,
        latitude     DOUBLE PRECISION,
        longitude    DOUBLE PRECISION,
        altitude     DOUBLE PRECISION,
        fix_acquired BOOLEAN,
        rssi         DOUBLE PRECISION,
        snr          DOUBLE PRECISION,
        received_at  TIMESTAMPTZ      NOT NULL DEFAULT NOW()
    );
    "#,
    // Start-rows and reinforcing alerts of hazard incidents
    r#"
    CREATE TABLE IF NOT EXISTS incidents (
        incident_id           BIGSERIAL        PRIMARY KEY,
        node_id               BIGINT           NOT NULL
                                               REFERENCES sensor_nodes (node_id) ON DELETE CASCADE,
        hazard_type           TEXT             NOT NULL
                                               CHECK (hazard_type IN ('fire', 'chainsaw', 'gunshots')),
        start_timestamp       TIMESTAMPTZ      NOT NULL,
        last_update_timestamp TIMESTAMPTZ      NOT NULL,
        severity              TEXT             NOT NULL
                                               CHECK (severity IN ('low', 'medium', 'high', 'unknown')),
        confidence            DOUBLE PRECISION,
        cooldown_counter      INTEGER          NOT NULL DEFAULT 0 CHECK (cooldown_counter >= 0),
        is_incident_start     BOOLEAN          NOT NULL,
        resolved_at           TIMESTAMPTZ,
        linked_reading_id     BIGINT           REFERENCES readings (reading_id) ON DELETE SET NULL
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_readings_node_timestamp
        ON readings (node_id, timestamp DESC);
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_readings_timestamp
        ON readings (timestamp DESC);
    "#,
    // At most one open start-row per (node, hazard)
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_incidents_open_start
        ON incidents (node_id, hazard_type)
        WHERE resolved_at IS NULL AND is_incident_start;
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_incidents_group
        ON incidents (node_id, hazard_type, start_timestamp);
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_incidents_resolved_at
        ON incidents (resolved_at)
        WHERE resolved_at IS NOT NULL;
    "#,
];
