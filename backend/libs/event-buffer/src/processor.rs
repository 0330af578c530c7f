//! Batch processor: drains claimed events into the analytical store.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::config::WireFormat;
use crate::engine::{chunks, BufferCodec, FlushHandler, JsonCodec};
use crate::error::BufferResult;
use crate::event::Event;
use crate::fanout::{self, FanoutKind};
use crate::format::encode_chunk;
use crate::keys;
use crate::metrics::BufferMetrics;
use crate::retry::{RetryOutcome, RetryQueue};
use crate::sink::EventSink;
use crate::store::{BufferStore, StoreTransaction};

/// Summary of one processing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessOutcome {
    /// Entries claimed from the queue
    pub claimed: usize,
    /// Events written to the analytical store
    pub written: usize,
    /// Entries dropped because they could not be decoded
    pub malformed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

impl ProcessOutcome {
    fn requeued(claimed: usize, outcome: RetryOutcome) -> Self {
        Self {
            claimed,
            retried: outcome.retried,
            dead_lettered: outcome.dead_lettered,
            ..Default::default()
        }
    }
}

/// Outcome of [`BatchProcessor::write_events`].
struct Written {
    written: usize,
    malformed: usize,
}

pub struct BatchProcessor {
    store: Arc<dyn BufferStore>,
    sink: Arc<dyn EventSink>,
    retry: Arc<RetryQueue>,
    metrics: BufferMetrics,
    codec: JsonCodec<Event>,
    queue_counter: String,
    table: String,
    format: WireFormat,
    batch_size: usize,
    chunk_size: usize,
}

impl BatchProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn BufferStore>,
        sink: Arc<dyn EventSink>,
        retry: Arc<RetryQueue>,
        metrics: BufferMetrics,
        queue_counter: String,
        table: String,
        format: WireFormat,
        batch_size: usize,
        chunk_size: usize,
    ) -> Self {
        Self {
            store,
            sink,
            retry,
            metrics,
            codec: JsonCodec::new(),
            queue_counter,
            table,
            format,
            batch_size,
            chunk_size,
        }
    }

    /// Claim up to one batch from the main queue and write it.
    ///
    /// The claim is atomic, so concurrent callers never receive the same event. If the
    /// write fails the whole claimed batch goes to the retry queue with a count of 1.
    pub async fn process_buffer(&self) -> BufferResult<ProcessOutcome> {
        let raw = self
            .store
            .pop_front(keys::EVENT_QUEUE, &self.queue_counter, self.batch_size)
            .await?;

        if raw.is_empty() {
            debug!("No events to process");
            return Ok(ProcessOutcome::default());
        }

        match self.write_events(&raw).await {
            Ok(written) => {
                debug!(count = raw.len(), "Processed events from buffer");
                Ok(ProcessOutcome {
                    claimed: raw.len(),
                    written: written.written,
                    malformed: written.malformed,
                    ..Default::default()
                })
            }
            Err(e) => {
                error!(
                    error = %e,
                    count = raw.len(),
                    "Error processing buffer, pushing to retry"
                );
                self.metrics.flush_failures.inc();
                let outcome = self.requeue(&raw, 0).await?;
                Ok(ProcessOutcome::requeued(raw.len(), outcome))
            }
        }
    }

    /// Claim up to one batch from the retry queue and write it.
    ///
    /// On failure the batch is pushed back with the highest retry count it carried, which
    /// sends it to the dead letter queue once that count reached the maximum.
    pub async fn process_retry_buffer(&self) -> BufferResult<ProcessOutcome> {
        let claim = self.retry.claim(self.batch_size).await?;
        if claim.malformed > 0 {
            self.metrics.malformed_dropped.inc_by(claim.malformed as u64);
        }

        if claim.is_empty() {
            debug!("No retry events to process");
            return Ok(ProcessOutcome {
                claimed: claim.malformed,
                malformed: claim.malformed,
                ..Default::default()
            });
        }

        let events = claim.events();
        let claimed = events.len() + claim.malformed;
        let max_retry_count = claim.max_retry_count();
        debug!(
            count = events.len(),
            max_retry_count = max_retry_count,
            "Processing retry buffer"
        );

        match self.write_events(&events).await {
            Ok(written) => {
                debug!(count = events.len(), "Successfully processed retry events");
                Ok(ProcessOutcome {
                    claimed,
                    written: written.written,
                    malformed: claim.malformed + written.malformed,
                    ..Default::default()
                })
            }
            Err(e) => {
                error!(
                    error = %e,
                    count = events.len(),
                    max_retry_count = max_retry_count,
                    "Failed to process retry events"
                );
                self.metrics.flush_failures.inc();
                let outcome = self.requeue(&events, max_retry_count).await?;
                let mut result = ProcessOutcome::requeued(claimed, outcome);
                result.malformed = claim.malformed;
                Ok(result)
            }
        }
    }

    /// Explicitly requeue raw events, see [`RetryQueue::push_to_retry`].
    pub async fn requeue(&self, raw: &[String], retry_count: u32) -> BufferResult<RetryOutcome> {
        let outcome = self.retry.push_to_retry(raw, retry_count).await?;
        self.metrics.events_retried.inc_by(outcome.retried as u64);
        self.metrics.events_dead_lettered.inc_by(outcome.dead_lettered as u64);
        Ok(outcome)
    }

    /// Decode, order by creation time and insert in chunks, then announce the saved events.
    ///
    /// Malformed entries are dropped. Any failing chunk fails the whole call; chunks
    /// inserted before it are not rolled back.
    async fn write_events(&self, raw: &[String]) -> BufferResult<Written> {
        let mut events: Vec<Event> = raw.iter().filter_map(|r| self.codec.decode(r)).collect();
        let malformed = raw.len() - events.len();
        if malformed > 0 {
            warn!(malformed = malformed, "Dropped malformed queue entries");
            self.metrics.malformed_dropped.inc_by(malformed as u64);
        }

        // Stable: events with equal timestamps keep their queue order
        events.sort_by_key(|e| e.created_at_ms());

        debug!(
            total = events.len(),
            chunks = (events.len() + self.chunk_size.max(1) - 1) / self.chunk_size.max(1),
            "Inserting events into ClickHouse"
        );

        let insert_counter = match self.format {
            WireFormat::Csv => keys::CSV_INSERT_COUNTER,
            WireFormat::JsonEachRow => keys::JSON_INSERT_COUNTER,
        };

        for chunk in chunks(&events, self.chunk_size) {
            let payload = encode_chunk(self.format, chunk)?;
            self.sink.insert(&self.table, payload).await?;

            let mut tx = StoreTransaction::new();
            tx.incr_by(insert_counter, chunk.len() as i64);
            if let Err(e) = self.store.exec(tx).await {
                warn!(counter = insert_counter, error = %e, "Failed to bump insert counter");
            }
        }

        self.metrics.events_flushed.inc_by(events.len() as u64);
        self.publish_saved(&events).await;

        Ok(Written {
            written: events.len(),
            malformed,
        })
    }

    async fn publish_saved(&self, events: &[Event]) {
        if events.is_empty() {
            return;
        }

        let mut tx = StoreTransaction::new();
        for event in events {
            if let Err(e) = fanout::stage_event(&mut tx, FanoutKind::Saved, event) {
                warn!(event_id = %event.id, error = %e, "Failed to encode saved notification");
            }
        }
        if let Err(e) = self.store.exec(tx).await {
            warn!(count = events.len(), error = %e, "Failed to publish saved events");
        }
    }
}

#[async_trait]
impl FlushHandler for BatchProcessor {
    async fn on_flush(&self) -> BufferResult<()> {
        self.process_buffer().await.map(|_| ())
    }
}
