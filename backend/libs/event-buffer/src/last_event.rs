//! Last screen view per profile, used to enrich later events.

use std::sync::Arc;
use std::time::Duration;

use crate::engine::{BufferCodec, JsonCodec};
use crate::error::{BufferError, BufferResult};
use crate::event::{Event, PublicEvent};
use crate::keys;
use crate::store::{BufferStore, StoreTransaction};

/// Key for [`LastEventCache::last_screen_view`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LastEventLookup {
    ByProfile {
        project_id: String,
        profile_id: String,
    },
    /// Not kept: events are processed close to real time, so no session-scoped entry
    /// exists. Always answered with [`BufferError::UnsupportedLookup`].
    BySession {
        project_id: String,
        session_id: String,
    },
}

pub struct LastEventCache {
    store: Arc<dyn BufferStore>,
    ttl: Duration,
    codec: JsonCodec<Event>,
}

impl LastEventCache {
    pub fn new(store: Arc<dyn BufferStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            codec: JsonCodec::new(),
        }
    }

    /// Stage the cache update implied by `event`.
    ///
    /// A `screen_view` overwrites the profile's entry, a `session_end` clears it; other
    /// events and events without a profile leave the cache alone.
    pub fn stage_update(&self, tx: &mut StoreTransaction, event: &Event, raw: &str) {
        let Some(profile_id) = event.profile() else {
            return;
        };
        let key = keys::last_screen_view(&event.project_id, profile_id);

        if event.is_screen_view() {
            tx.set_ex(key, raw, self.ttl.as_secs().max(1));
        } else if event.is_session_end() {
            tx.del(key);
        }
    }

    pub async fn last_screen_view(
        &self,
        lookup: &LastEventLookup,
    ) -> BufferResult<Option<PublicEvent>> {
        match lookup {
            LastEventLookup::ByProfile {
                project_id,
                profile_id,
            } => {
                let raw = self
                    .store
                    .get(&keys::last_screen_view(project_id, profile_id))
                    .await?;
                Ok(raw
                    .and_then(|r| self.codec.decode(&r))
                    .map(|event| PublicEvent::from(&event)))
            }
            LastEventLookup::BySession { session_id, .. } => Err(BufferError::UnsupportedLookup(
                format!("last screen view by session ({})", session_id),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::event::fixtures::profile_event;
    use crate::event::{SCREEN_VIEW, SESSION_END};
    use crate::store::InMemoryBufferStore;

    fn by_profile(profile_id: &str) -> LastEventLookup {
        LastEventLookup::ByProfile {
            project_id: "project-1".to_string(),
            profile_id: profile_id.to_string(),
        }
    }

    async fn apply(cache: &LastEventCache, store: &InMemoryBufferStore, event: &Event) {
        let raw = serde_json::to_string(event).unwrap();
        let mut tx = StoreTransaction::new();
        cache.stage_update(&mut tx, event, &raw);
        store.exec(tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_screen_view_overwrites_and_session_end_clears() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryBufferStore::with_clock(clock));
        let cache = LastEventCache::new(store.clone(), Duration::from_secs(3600));

        apply(&cache, &store, &profile_event("e1", SCREEN_VIEW, "u1")).await;
        apply(&cache, &store, &profile_event("e2", SCREEN_VIEW, "u1")).await;
        let last = cache.last_screen_view(&by_profile("u1")).await.unwrap().unwrap();
        assert_eq!(last.id, "e2");

        // Non screen views do not touch the entry
        apply(&cache, &store, &profile_event("e3", "click", "u1")).await;
        let last = cache.last_screen_view(&by_profile("u1")).await.unwrap().unwrap();
        assert_eq!(last.id, "e2");

        apply(&cache, &store, &profile_event("e4", SESSION_END, "u1")).await;
        assert!(cache.last_screen_view(&by_profile("u1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryBufferStore::with_clock(clock.clone()));
        let cache = LastEventCache::new(store.clone(), Duration::from_secs(3600));

        apply(&cache, &store, &profile_event("e1", SCREEN_VIEW, "u1")).await;
        clock.advance(Duration::from_secs(3600));
        assert!(cache.last_screen_view(&by_profile("u1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_lookup_is_unsupported() {
        let store = Arc::new(InMemoryBufferStore::new());
        let cache = LastEventCache::new(store, Duration::from_secs(3600));
        let lookup = LastEventLookup::BySession {
            project_id: "project-1".to_string(),
            session_id: "s1".to_string(),
        };

        assert!(matches!(
            cache.last_screen_view(&lookup).await,
            Err(BufferError::UnsupportedLookup(_))
        ));
    }
}
