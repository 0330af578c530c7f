//! Live visitor presence.
//!
//! Per project, a sorted set maps profile id to the time of its last heartbeat
//! (`live:visitors:{project}`), and each visitor also gets an expiring marker
//! (`live:visitor:{project}:{profile}`). Stale set members are purged lazily when the
//! count is read.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clock::Clock;
use crate::error::BufferResult;
use crate::keys;
use crate::store::{BufferStore, StoreTransaction};

pub struct PresenceTracker {
    store: Arc<dyn BufferStore>,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn BufferStore>, clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self {
            store,
            clock,
            window,
        }
    }

    /// Stage a heartbeat for `profile_id`: score = now, marker refreshed.
    pub fn stage_heartbeat(&self, tx: &mut StoreTransaction, project_id: &str, profile_id: &str) {
        let now = self.clock.now_ms();
        tx.zadd(keys::live_visitors(project_id), profile_id, now)
            .set_ex(
                keys::visitor_heartbeat(project_id, profile_id),
                "1",
                self.window.as_secs().max(1),
            );
    }

    /// Visitors whose last heartbeat is within the window.
    ///
    /// A heartbeat at time T counts for queries before T + window and is purged by any
    /// query at or after it. Purge and count happen in one atomic round trip.
    pub async fn active_visitor_count(&self, project_id: &str) -> BufferResult<u64> {
        let cutoff = self.clock.now_ms() - self.window.as_millis() as i64;
        let count = self
            .store
            .prune_and_count(&keys::live_visitors(project_id), cutoff)
            .await?;
        debug!(project_id = project_id, count = count, "Counted active visitors");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryBufferStore;

    const T: i64 = 1_700_000_000_000;

    fn tracker() -> (PresenceTracker, Arc<ManualClock>, Arc<InMemoryBufferStore>) {
        let clock = Arc::new(ManualClock::new(T));
        let store = Arc::new(InMemoryBufferStore::with_clock(clock.clone()));
        let tracker = PresenceTracker::new(store.clone(), clock.clone(), Duration::from_secs(300));
        (tracker, clock, store)
    }

    async fn heartbeat(tracker: &PresenceTracker, store: &InMemoryBufferStore, profile: &str) {
        let mut tx = StoreTransaction::new();
        tracker.stage_heartbeat(&mut tx, "p1", profile);
        store.exec(tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_active_until_window_elapses() {
        let (tracker, clock, store) = tracker();
        heartbeat(&tracker, &store, "alice").await;

        assert_eq!(tracker.active_visitor_count("p1").await.unwrap(), 1);

        clock.set(T + 299_999);
        assert_eq!(tracker.active_visitor_count("p1").await.unwrap(), 1);

        clock.set(T + 300_000);
        assert_eq!(tracker.active_visitor_count("p1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_score_and_marker() {
        let (tracker, clock, store) = tracker();
        heartbeat(&tracker, &store, "alice").await;
        heartbeat(&tracker, &store, "bob").await;

        clock.set(T + 200_000);
        heartbeat(&tracker, &store, "alice").await;

        clock.set(T + 400_000);
        assert_eq!(tracker.active_visitor_count("p1").await.unwrap(), 1);
        assert!(store.get("live:visitor:p1:alice").await.unwrap().is_some());
        assert!(store.get("live:visitor:p1:bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_projects_are_isolated() {
        let (tracker, _clock, store) = tracker();
        heartbeat(&tracker, &store, "alice").await;
        assert_eq!(tracker.active_visitor_count("other").await.unwrap(), 0);
    }
}
