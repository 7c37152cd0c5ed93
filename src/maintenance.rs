//! Periodic background work: node liveness and resolved-incident retention.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::StoreError;
use crate::events::{Event, NodeStatusChanged};
use crate::fanout::Publisher;
use crate::models::NodeStatus;
use crate::store::IncidentStore;
use crate::Config;

// ---

/// Mark nodes not heard from since `seen_before` inactive and announce each.
pub async fn sweep_liveness(
    store: &dyn IncidentStore,
    publisher: &dyn Publisher,
    seen_before: DateTime<Utc>,
) -> Result<usize, StoreError> {
    // ---
    let stale = store.mark_inactive_nodes(seen_before).await?;
    for node in &stale {
        info!("Node {} went quiet, now inactive", node.node_id);
        publisher.publish(Event::node_status_changed(&NodeStatusChanged::new(
            node,
            Some(NodeStatus::Active),
        )));
    }
    Ok(stale.len())
}

/// Delete resolved incident rows older than `retention_days` before `now`.
pub async fn purge_resolved(
    store: &dyn IncidentStore,
    retention_days: u32,
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    // ---
    let Some(cutoff) = retention_cutoff(now, retention_days) else {
        debug!("Retention of {} days reaches past the calendar, nothing to purge", retention_days);
        return Ok(0);
    };
    let removed = store.purge_resolved(cutoff).await?;
    if removed > 0 {
        info!("Purged {} resolved incident rows older than {}", removed, cutoff);
    }
    Ok(removed)
}

/// `now` minus `retention_days`, or `None` when that is before the earliest
/// representable instant.
pub fn retention_cutoff(now: DateTime<Utc>, retention_days: u32) -> Option<DateTime<Utc>> {
    Duration::try_days(i64::from(retention_days)).and_then(|span| now.checked_sub_signed(span))
}

/// `now` minus `span`, saturating at the earliest representable instant.
pub fn saturating_before(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Seconds as a chrono duration, saturating at what chrono can represent.
pub fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000))
}

/// Start the periodic tasks enabled in `config`. A period of 0 disables a task.
pub fn spawn(
    config: &Config,
    store: Arc<dyn IncidentStore>,
    publisher: Arc<dyn Publisher>,
) -> Vec<JoinHandle<()>> {
    // ---
    let mut handles = Vec::new();

    if config.liveness_sweep_secs > 0 {
        let store = store.clone();
        let period = StdDuration::from_secs(config.liveness_sweep_secs);
        let inactive_after = seconds(config.node_inactive_after_secs);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let cutoff = saturating_before(Utc::now(), inactive_after);
                match sweep_liveness(store.as_ref(), publisher.as_ref(), cutoff).await {
                    Ok(n) => debug!("Liveness sweep marked {} node(s) inactive", n),
                    Err(e) => error!("Liveness sweep failed: {}", e),
                }
            }
        }));
    }

    if config.cleanup_interval_secs > 0 {
        let period = StdDuration::from_secs(config.cleanup_interval_secs);
        let retention_days = config.cleanup_retention_days;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = purge_resolved(store.as_ref(), retention_days, Utc::now()).await {
                    error!("Scheduled cleanup failed: {}", e);
                }
            }
        }));
    }

    handles
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::events::NODE_STATUS_CHANGED;
    use crate::fanout::Fanout;
    use crate::models::{HazardType, NewIncident, Severity};
    use crate::store::{IncidentFilter, MemoryStore};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_sweep_marks_quiet_nodes_inactive() {
        // ---
        let store = MemoryStore::new();
        let fanout = Fanout::new(16);
        let mut sub = fanout.subscribe();

        store.touch_node(1, t0()).await.unwrap();
        store.touch_node(2, t0() + Duration::minutes(30)).await.unwrap();

        let n = sweep_liveness(&store, fanout.as_ref(), t0() + Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(n, 1);

        assert_eq!(
            store.get_node(1).await.unwrap().unwrap().status,
            NodeStatus::Inactive
        );
        assert_eq!(
            store.get_node(2).await.unwrap().unwrap().status,
            NodeStatus::Active
        );

        let evs = sub.drain();
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].event, NODE_STATUS_CHANGED);
        assert_eq!(evs[0].data["status"], "inactive");

        // Already inactive nodes are not announced again
        let n = sweep_liveness(&store, fanout.as_ref(), t0() + Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_purge_respects_retention() {
        // ---
        let store = MemoryStore::new();
        store.touch_node(1, t0()).await.unwrap();
        let start = store
            .start_incident(&NewIncident {
                node_id: 1,
                hazard_type: HazardType::Fire,
                start_timestamp: t0(),
                timestamp: t0(),
                severity: Severity::High,
                confidence: None,
                is_incident_start: true,
                linked_reading_id: None,
            })
            .await
            .unwrap();
        store.close_incident(&start, 5, t0()).await.unwrap();

        let removed = purge_resolved(&store, 90, t0() + Duration::days(30)).await.unwrap();
        assert_eq!(removed, 0);

        let removed = purge_resolved(&store, 90, t0() + Duration::days(91)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store
            .list_incidents(&IncidentFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_huge_retention_purges_nothing() {
        // ---
        assert!(retention_cutoff(t0(), 4_000_000_000).is_none());
        assert_eq!(retention_cutoff(t0(), 1), Some(t0() - Duration::days(1)));

        let store = MemoryStore::new();
        store.touch_node(1, t0()).await.unwrap();
        let start = store
            .start_incident(&NewIncident {
                node_id: 1,
                hazard_type: HazardType::Fire,
                start_timestamp: t0(),
                timestamp: t0(),
                severity: Severity::Low,
                confidence: None,
                is_incident_start: true,
                linked_reading_id: None,
            })
            .await
            .unwrap();
        store.close_incident(&start, 5, t0()).await.unwrap();

        let removed = purge_resolved(&store, u32::MAX, t0()).await.unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn test_saturating_before() {
        // ---
        assert_eq!(
            saturating_before(t0(), Duration::minutes(5)),
            t0() - Duration::minutes(5)
        );
        assert_eq!(
            saturating_before(t0(), seconds(u64::MAX)),
            DateTime::<Utc>::MIN_UTC
        );
    }
}
