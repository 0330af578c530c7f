//! Event buffer: the event instantiation of [`BufferEngine`] plus its side state.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::EventBufferConfig;
use crate::engine::{counter_key_for, BufferEngine, EngineOptions, JsonCodec};
use crate::error::BufferResult;
use crate::event::{Event, PublicEvent};
use crate::fanout::{self, FanoutKind};
use crate::keys;
use crate::last_event::{LastEventCache, LastEventLookup};
use crate::metrics::BufferMetrics;
use crate::presence::PresenceTracker;
use crate::processor::{BatchProcessor, ProcessOutcome};
use crate::retry::{RetryEnvelope, RetryOutcome, RetryQueue};
use crate::sink::EventSink;
use crate::store::{BufferStore, StoreTransaction};

/// Buffer name; derives the size counter (`event:buffer:count`) and flush lock keys.
pub const EVENT_BUFFER_NAME: &str = "event";

/// Queue sizes as reported by [`EventBuffer::get_buffer_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub main: u64,
    pub retry: u64,
    pub dlq: u64,
    /// Events still expected to reach the analytical store (main + retry)
    pub total: u64,
}

/// Ingestion counters kept in the store, shared by every worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferCounters {
    /// Events other than session start/end accepted into the queue
    pub tracked: i64,
    /// Events inserted through the CSV path
    pub csv_inserted: i64,
    /// Events inserted through the JSON path
    pub json_inserted: i64,
}

const COUNTER_KEYS: [&str; 3] = [
    keys::TRACKED_COUNTER,
    keys::CSV_INSERT_COUNTER,
    keys::JSON_INSERT_COUNTER,
];

pub struct EventBuffer {
    engine: BufferEngine<BatchProcessor, JsonCodec<Event>>,
    store: Arc<dyn BufferStore>,
    retry: Arc<RetryQueue>,
    presence: PresenceTracker,
    last_event: LastEventCache,
    metrics: BufferMetrics,
    config: EventBufferConfig,
}

impl EventBuffer {
    pub fn new(
        store: Arc<dyn BufferStore>,
        sink: Arc<dyn EventSink>,
        config: EventBufferConfig,
    ) -> BufferResult<Self> {
        Self::with_clock(store, sink, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn BufferStore>,
        sink: Arc<dyn EventSink>,
        config: EventBufferConfig,
        clock: Arc<dyn Clock>,
    ) -> BufferResult<Self> {
        config.validate()?;

        let metrics = BufferMetrics::new(EVENT_BUFFER_NAME);
        let retry = Arc::new(RetryQueue::new(store.clone(), clock.clone(), config.max_retries));
        let processor = BatchProcessor::new(
            store.clone(),
            sink,
            retry.clone(),
            metrics.clone(),
            counter_key_for(EVENT_BUFFER_NAME),
            config.table.clone(),
            config.format,
            config.batch_size,
            config.chunk_size,
        );
        let engine = BufferEngine::new(
            EVENT_BUFFER_NAME,
            processor,
            JsonCodec::new(),
            store.clone(),
            EngineOptions {
                parallel: config.parallel,
                lock_timeout: config.lock_timeout,
                counter_resync_interval: config.counter_resync_interval,
            },
        );

        Ok(Self {
            engine,
            presence: PresenceTracker::new(store.clone(), clock, config.presence_window),
            last_event: LastEventCache::new(store.clone(), config.last_event_ttl),
            store,
            retry,
            metrics,
            config,
        })
    }

    pub fn config(&self) -> &EventBufferConfig {
        &self.config
    }

    pub fn metrics(&self) -> &BufferMetrics {
        &self.metrics
    }

    /// Enqueue one event. Failures are logged and the event is dropped.
    pub async fn add(&self, event: &Event) {
        if let Err(e) = self.append(std::slice::from_ref(event)).await {
            error!(event_id = %event.id, error = %e, "Failed to add event to buffer");
            self.metrics.add_failures.inc();
            return;
        }
        self.flush_if_full().await;
    }

    /// Enqueue a batch in one transaction, then check the flush threshold once.
    pub async fn bulk_add(&self, events: &[Event]) -> BufferResult<()> {
        if let Err(e) = self.append(events).await {
            error!(count = events.len(), error = %e, "Failed to bulk add events to buffer");
            self.metrics.add_failures.inc_by(events.len() as u64);
            return Err(e);
        }
        self.flush_if_full().await;
        Ok(())
    }

    async fn append(&self, events: &[Event]) -> BufferResult<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut tx = StoreTransaction::new();
        for event in events {
            self.stage_event(&mut tx, event)?;
        }
        self.store.exec(tx).await?;

        self.metrics.events_added.inc_by(events.len() as u64);
        Ok(())
    }

    fn stage_event(&self, tx: &mut StoreTransaction, event: &Event) -> BufferResult<()> {
        if !event.is_session_lifecycle() {
            tx.incr_by(keys::TRACKED_COUNTER, 1);
        }

        let raw = self.engine.stage_append(tx, keys::EVENT_QUEUE, event)?;
        self.last_event.stage_update(tx, event, &raw);

        if let Some(profile_id) = event.profile() {
            self.presence.stage_heartbeat(tx, &event.project_id, profile_id);
        }

        fanout::stage_event(tx, FanoutKind::Received, event)
    }

    /// Best-effort threshold check; concurrent adders may both trigger a flush.
    async fn flush_if_full(&self) {
        match self.get_buffer_size().await {
            Ok(size) if size >= self.config.batch_size as u64 => {
                debug!(size = size, "Buffer reached batch size, flushing");
                if let Err(e) = self.try_flush().await {
                    warn!(error = %e, "Threshold flush failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to read buffer size after add"),
        }
    }

    /// Flush through the engine, honoring the flush lock unless running in parallel mode.
    pub async fn try_flush(&self) -> BufferResult<()> {
        self.engine.try_flush().await
    }

    pub async fn process_buffer(&self) -> BufferResult<ProcessOutcome> {
        self.engine.handler().process_buffer().await
    }

    pub async fn process_retry_buffer(&self) -> BufferResult<ProcessOutcome> {
        self.engine.handler().process_retry_buffer().await
    }

    pub async fn push_to_retry(
        &self,
        events: &[String],
        retry_count: u32,
    ) -> BufferResult<RetryOutcome> {
        self.engine.handler().requeue(events, retry_count).await
    }

    pub async fn get_buffer_size(&self) -> BufferResult<u64> {
        let size = self.engine.size_with_counter(keys::EVENT_QUEUE).await?;
        self.metrics.queue_size.set(size as i64);
        Ok(size)
    }

    pub async fn get_retry_buffer_size(&self) -> BufferResult<u64> {
        let size = self.retry.retry_size().await?;
        self.metrics.retry_queue_size.set(size as i64);
        Ok(size)
    }

    pub async fn get_dlq_size(&self) -> BufferResult<u64> {
        let size = self.retry.dlq_size().await?;
        self.metrics.dlq_size.set(size as i64);
        Ok(size)
    }

    pub async fn get_buffer_stats(&self) -> BufferResult<BufferStats> {
        let (main, retry, dlq) = tokio::try_join!(
            self.get_buffer_size(),
            self.get_retry_buffer_size(),
            self.get_dlq_size()
        )?;

        Ok(BufferStats {
            main,
            retry,
            dlq,
            total: main + retry,
        })
    }

    pub async fn inspect_dlq(&self, limit: usize) -> BufferResult<Vec<RetryEnvelope>> {
        self.retry.inspect_dlq(limit).await
    }

    pub async fn clear_dlq(&self) -> BufferResult<u64> {
        let removed = self.retry.clear_dlq().await?;
        self.metrics.dlq_size.set(0);
        Ok(removed)
    }

    pub async fn get_active_visitor_count(&self, project_id: &str) -> BufferResult<u64> {
        self.presence.active_visitor_count(project_id).await
    }

    pub async fn get_last_screen_view(
        &self,
        lookup: &LastEventLookup,
    ) -> BufferResult<Option<PublicEvent>> {
        self.last_event.last_screen_view(lookup).await
    }

    /// Read the shared ingestion counters; missing or unparseable values read as 0.
    pub async fn read_counters(&self) -> BufferResult<BufferCounters> {
        let mut values = [0i64; 3];
        for (value, key) in values.iter_mut().zip(COUNTER_KEYS) {
            *value = self
                .store
                .get(key)
                .await?
                .and_then(|raw| raw.trim().parse().ok())
                .unwrap_or(0);
        }

        Ok(BufferCounters {
            tracked: values[0],
            csv_inserted: values[1],
            json_inserted: values[2],
        })
    }

    /// Reset the shared ingestion counters to 0 in one transaction.
    pub async fn reset_counters(&self) -> BufferResult<()> {
        let mut tx = StoreTransaction::new();
        for key in COUNTER_KEYS {
            tx.set(key, "0");
        }
        self.store.exec(tx).await?;
        warn!("Ingestion counters reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures::{event, profile_event};
    use crate::event::{SCREEN_VIEW, SESSION_START};
    use crate::format::InsertPayload;
    use crate::store::InMemoryBufferStore;
    use async_trait::async_trait;

    struct NullSink;

    #[async_trait]
    impl EventSink for NullSink {
        async fn insert(&self, _table: &str, _payload: InsertPayload) -> BufferResult<()> {
            Ok(())
        }
    }

    fn buffer(store: Arc<InMemoryBufferStore>, batch_size: usize) -> EventBuffer {
        let config = EventBufferConfig {
            batch_size,
            ..Default::default()
        };
        EventBuffer::new(store, Arc::new(NullSink), config).unwrap()
    }

    #[tokio::test]
    async fn test_add_stages_every_side_effect() {
        let store = Arc::new(InMemoryBufferStore::new());
        let buffer = buffer(store.clone(), 100);

        buffer.add(&profile_event("e1", SCREEN_VIEW, "u1")).await;

        assert_eq!(store.list(keys::EVENT_QUEUE).len(), 1);
        assert_eq!(buffer.get_buffer_size().await.unwrap(), 1);
        assert_eq!(buffer.read_counters().await.unwrap().tracked, 1);
        assert_eq!(buffer.get_active_visitor_count("project-1").await.unwrap(), 1);

        let lookup = LastEventLookup::ByProfile {
            project_id: "project-1".to_string(),
            profile_id: "u1".to_string(),
        };
        let last = buffer.get_last_screen_view(&lookup).await.unwrap().unwrap();
        assert_eq!(last.id, "e1");

        let published = store.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "events:received");
    }

    #[tokio::test]
    async fn test_session_lifecycle_not_tracked() {
        let store = Arc::new(InMemoryBufferStore::new());
        let buffer = buffer(store.clone(), 100);

        buffer
            .bulk_add(&[
                event("e1", SESSION_START, "2024-05-01 10:00:00"),
                event("e2", "click", "2024-05-01 10:00:01"),
            ])
            .await
            .unwrap();

        assert_eq!(buffer.get_buffer_size().await.unwrap(), 2);
        assert_eq!(buffer.read_counters().await.unwrap().tracked, 1);
    }

    #[tokio::test]
    async fn test_reaching_batch_size_flushes() {
        let store = Arc::new(InMemoryBufferStore::new());
        let buffer = buffer(store.clone(), 3);

        buffer.add(&event("e1", "click", "2024-05-01 10:00:00")).await;
        buffer.add(&event("e2", "click", "2024-05-01 10:00:01")).await;
        assert_eq!(buffer.get_buffer_size().await.unwrap(), 2);

        buffer.add(&event("e3", "click", "2024-05-01 10:00:02")).await;
        assert_eq!(buffer.get_buffer_size().await.unwrap(), 0);
        assert!(store.list(keys::EVENT_QUEUE).is_empty());
        assert_eq!(buffer.read_counters().await.unwrap().json_inserted, 3);
    }

    #[tokio::test]
    async fn test_add_swallows_store_failure() {
        let store = Arc::new(InMemoryBufferStore::new());
        let buffer = buffer(store.clone(), 100);
        store.set_unavailable(true);

        buffer.add(&event("e1", "click", "2024-05-01 10:00:00")).await;
        assert!(buffer
            .bulk_add(&[event("e2", "click", "2024-05-01 10:00:00")])
            .await
            .is_err());

        store.set_unavailable(false);
        assert_eq!(buffer.get_buffer_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reset_counters() {
        let store = Arc::new(InMemoryBufferStore::new());
        let buffer = buffer(store.clone(), 100);
        buffer.add(&event("e1", "click", "2024-05-01 10:00:00")).await;

        buffer.reset_counters().await.unwrap();
        assert_eq!(buffer.read_counters().await.unwrap(), BufferCounters::default());
    }
}
