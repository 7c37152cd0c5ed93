//! `PgStore` against a real database. Needs `DATABASE_URL`; run with
//! `cargo test --test postgres_store -- --ignored`.

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::postgres::PgPoolOptions;

use forestwatch::models::NewIncident;
use forestwatch::schema::create_schema;
use forestwatch::store::{IncidentFilter, TimelineFilter};
use forestwatch::{HazardType, IncidentStore, PgStore, Severity, StoreError};

async fn connect() -> Result<PgStore> {
    // ---
    let url = std::env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new().max_connections(2).connect(&url).await?;
    create_schema(&pool).await?;
    Ok(PgStore::new(pool))
}

/// Whole seconds, so values survive the round trip through `timestamptz`.
fn now() -> DateTime<Utc> {
    Utc.timestamp_opt(Utc::now().timestamp(), 0).unwrap()
}

/// A node id no earlier run has used.
fn fresh_node_id(salt: i64) -> i64 {
    900_000_000 + (Utc::now().timestamp_micros() % 100_000_000) * 10 + salt
}

fn start(node_id: i64, at: DateTime<Utc>, severity: Severity) -> NewIncident {
    NewIncident {
        node_id,
        hazard_type: HazardType::Fire,
        start_timestamp: at,
        timestamp: at,
        severity,
        confidence: Some(0.6),
        is_incident_start: true,
        linked_reading_id: None,
    }
}

async fn cleanup(store: &PgStore, node_id: i64) -> Result<()> {
    store.delete_node(node_id, now() + Duration::days(3650)).await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_start_reinforce_close_flow() -> Result<()> {
    // ---
    let store = connect().await?;
    let node_id = fresh_node_id(1);
    let t0 = now();

    let touch = store.touch_node(node_id, t0).await?;
    assert_eq!(touch.node.node_id, node_id);

    let first = store.start_incident(&start(node_id, t0, Severity::Low)).await?;
    assert!(first.is_incident_start);
    assert_eq!(
        store.open_incident(node_id, HazardType::Fire).await?.map(|i| i.incident_id),
        Some(first.incident_id)
    );

    let mut alert = start(node_id, t0 + Duration::minutes(1), Severity::High);
    alert.is_incident_start = false;
    alert.confidence = Some(0.9);
    let reinforced = store.reinforce_incident(&first, &alert).await?;
    assert!(!reinforced.alert.is_incident_start);
    assert_eq!(reinforced.alert.start_timestamp, t0);
    assert_eq!(reinforced.start.cooldown_counter, 0);
    assert_eq!(reinforced.start.severity, Severity::High);
    assert_eq!(reinforced.start.last_update_timestamp, t0 + Duration::minutes(1));

    store.set_cooldown(first.incident_id, 4).await?;
    let closed = store
        .close_incident(&reinforced.start, 5, t0 + Duration::minutes(10))
        .await?;
    assert_eq!(closed, 2);
    assert!(store.open_incident(node_id, HazardType::Fire).await?.is_none());

    let rows = store
        .list_incidents(&IncidentFilter {
            node_id: Some(node_id),
            ..IncidentFilter::default()
        })
        .await?;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.resolved_at == Some(t0 + Duration::minutes(10))));
    let start_row = rows.iter().find(|r| r.is_incident_start).unwrap();
    assert_eq!(start_row.cooldown_counter, 5);

    let timeline = store
        .incident_timeline(&TimelineFilter {
            node_id: Some(node_id),
            ..TimelineFilter::default()
        })
        .await?;
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].alert_count, 2);
    assert_eq!(timeline[0].max_severity, Severity::High);
    assert!(!timeline[0].is_active);

    cleanup(&store, node_id).await
}

#[tokio::test]
#[ignore]
async fn test_second_open_start_is_conflict() -> Result<()> {
    // ---
    let store = connect().await?;
    let node_id = fresh_node_id(2);
    let t0 = now();

    store.touch_node(node_id, t0).await?;
    store.start_incident(&start(node_id, t0, Severity::Medium)).await?;

    let err = store
        .start_incident(&start(node_id, t0 + Duration::minutes(1), Severity::High))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)), "got {err:?}");

    let open = store.open_incidents(Some(node_id)).await?;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].severity, Severity::Medium);

    cleanup(&store, node_id).await
}
