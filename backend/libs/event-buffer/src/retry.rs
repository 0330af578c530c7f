//! Retry queue and dead letter queue.
//!
//! Events whose write failed are wrapped in a [`RetryEnvelope`] and appended to the
//! retry queue. A batch that keeps failing is moved to the dead letter queue, where it
//! stays until an operator inspects and clears it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::engine::counted_len;
use crate::error::BufferResult;
use crate::keys;
use crate::store::{BufferStore, StoreTransaction};

/// Queue entry of the retry and dead letter queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryEnvelope {
    /// Serialized event exactly as it sat in the main queue
    pub event: String,
    /// Failed write attempts so far
    pub retry_count: u32,
    /// Epoch milliseconds of the last failed attempt
    pub last_attempt: i64,
}

impl RetryEnvelope {
    pub fn decode(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

/// Where [`RetryQueue::push_to_retry`] sent a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryOutcome {
    pub retried: usize,
    pub dead_lettered: usize,
}

/// Envelopes claimed from the retry queue by one worker.
#[derive(Debug, Clone, Default)]
pub struct RetryClaim {
    pub envelopes: Vec<RetryEnvelope>,
    /// Entries popped but dropped because they were not valid envelopes
    pub malformed: usize,
}

impl RetryClaim {
    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    pub fn events(&self) -> Vec<String> {
        self.envelopes.iter().map(|e| e.event.clone()).collect()
    }

    /// Highest retry count in the claim; the whole batch is judged by it.
    pub fn max_retry_count(&self) -> u32 {
        self.envelopes
            .iter()
            .map(|e| e.retry_count)
            .max()
            .unwrap_or(0)
    }
}

pub struct RetryQueue {
    store: Arc<dyn BufferStore>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
}

impl RetryQueue {
    pub fn new(store: Arc<dyn BufferStore>, clock: Arc<dyn Clock>, max_retries: u32) -> Self {
        Self {
            store,
            clock,
            max_retries,
        }
    }

    /// Wrap `events` with `retry_count + 1` and the current time, then append them to the
    /// retry queue, or to the dead letter queue once `retry_count` reached the maximum.
    /// Envelopes and counter increments commit in one transaction.
    pub async fn push_to_retry(
        &self,
        events: &[String],
        retry_count: u32,
    ) -> BufferResult<RetryOutcome> {
        if events.is_empty() {
            return Ok(RetryOutcome::default());
        }

        let dead_letter = retry_count >= self.max_retries;
        let (queue, counter) = if dead_letter {
            (keys::DEAD_LETTER_QUEUE, keys::DLQ_COUNTER)
        } else {
            (keys::RETRY_QUEUE, keys::RETRY_COUNTER)
        };

        let now = self.clock.now_ms();
        let mut tx = StoreTransaction::new();
        for event in events {
            let envelope = RetryEnvelope {
                event: event.clone(),
                retry_count: retry_count + 1,
                last_attempt: now,
            };
            tx.push(queue, serde_json::to_string(&envelope)?);
        }
        tx.incr_by(counter, events.len() as i64);
        self.store.exec(tx).await?;

        if dead_letter {
            warn!(
                count = events.len(),
                retry_count = retry_count + 1,
                "Pushed events to dead letter queue after max retries"
            );
            Ok(RetryOutcome {
                retried: 0,
                dead_lettered: events.len(),
            })
        } else {
            warn!(
                count = events.len(),
                retry_count = retry_count + 1,
                "Pushed events to retry queue"
            );
            Ok(RetryOutcome {
                retried: events.len(),
                dead_lettered: 0,
            })
        }
    }

    /// Atomically claim up to `batch_size` envelopes, decrementing the retry counter by
    /// the number popped.
    pub async fn claim(&self, batch_size: usize) -> BufferResult<RetryClaim> {
        let raw = self
            .store
            .pop_front(keys::RETRY_QUEUE, keys::RETRY_COUNTER, batch_size)
            .await?;

        let total = raw.len();
        let envelopes: Vec<RetryEnvelope> =
            raw.iter().filter_map(|r| RetryEnvelope::decode(r)).collect();
        let malformed = total - envelopes.len();
        if malformed > 0 {
            warn!(malformed = malformed, "Dropped malformed retry envelopes");
        }
        debug!(claimed = envelopes.len(), "Claimed retry envelopes");

        Ok(RetryClaim {
            envelopes,
            malformed,
        })
    }

    pub async fn retry_size(&self) -> BufferResult<u64> {
        counted_len(self.store.as_ref(), keys::RETRY_COUNTER, keys::RETRY_QUEUE).await
    }

    pub async fn dlq_size(&self) -> BufferResult<u64> {
        counted_len(self.store.as_ref(), keys::DLQ_COUNTER, keys::DEAD_LETTER_QUEUE).await
    }

    /// First `limit` dead letter envelopes, without removing them. Malformed entries are skipped.
    pub async fn inspect_dlq(&self, limit: usize) -> BufferResult<Vec<RetryEnvelope>> {
        let raw = self.store.range(keys::DEAD_LETTER_QUEUE, limit).await?;
        Ok(raw.iter().filter_map(|r| RetryEnvelope::decode(r)).collect())
    }

    /// Drop every dead letter and reset its counter. Returns how many were removed.
    pub async fn clear_dlq(&self) -> BufferResult<u64> {
        let removed = self
            .store
            .clear_queue(keys::DEAD_LETTER_QUEUE, keys::DLQ_COUNTER)
            .await?;
        if removed > 0 {
            warn!(removed = removed, "Dead letter queue cleared");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryBufferStore;
    use tokio_test::assert_ok;

    const NOW: i64 = 1_714_557_600_000;

    fn queue() -> (RetryQueue, Arc<InMemoryBufferStore>) {
        let clock = Arc::new(ManualClock::new(NOW));
        let store = Arc::new(InMemoryBufferStore::with_clock(clock.clone()));
        (RetryQueue::new(store.clone(), clock, 3), store)
    }

    fn raw_events(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{{\"id\":\"e{}\"}}", i)).collect()
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = RetryEnvelope {
            event: "{\"id\":\"e1\"}".to_string(),
            retry_count: 2,
            last_attempt: NOW,
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["event"], "{\"id\":\"e1\"}");
        assert_eq!(json["retryCount"], 2);
        assert_eq!(json["lastAttempt"], NOW);
    }

    #[tokio::test]
    async fn test_push_increments_count_and_counter() {
        let (queue, store) = queue();
        let outcome = assert_ok!(queue.push_to_retry(&raw_events(2), 0).await);
        assert_eq!(outcome, RetryOutcome { retried: 2, dead_lettered: 0 });

        let stored = store.list(keys::RETRY_QUEUE);
        let envelope = RetryEnvelope::decode(&stored[0]).unwrap();
        assert_eq!(envelope.retry_count, 1);
        assert_eq!(envelope.last_attempt, NOW);
        assert_eq!(queue.retry_size().await.unwrap(), 2);
        assert_eq!(queue.dlq_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_push_at_max_goes_to_dlq() {
        let (queue, _store) = queue();
        let outcome = assert_ok!(queue.push_to_retry(&raw_events(3), 3).await);
        assert_eq!(outcome, RetryOutcome { retried: 0, dead_lettered: 3 });

        let dlq = queue.inspect_dlq(10).await.unwrap();
        assert_eq!(dlq.len(), 3);
        assert!(dlq.iter().all(|e| e.retry_count == 4));
        assert_eq!(queue.dlq_size().await.unwrap(), 3);
        assert_eq!(queue.retry_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_drops_malformed_and_decrements_counter() {
        let (queue, store) = queue();
        queue.push_to_retry(&raw_events(2), 1).await.unwrap();

        let mut tx = StoreTransaction::new();
        tx.push(keys::RETRY_QUEUE, "not an envelope").incr_by(keys::RETRY_COUNTER, 1);
        store.exec(tx).await.unwrap();

        let claim = assert_ok!(queue.claim(10).await);
        assert_eq!(claim.envelopes.len(), 2);
        assert_eq!(claim.malformed, 1);
        assert_eq!(claim.max_retry_count(), 2);
        assert_eq!(queue.retry_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_inspect_respects_limit_and_clear_resets() {
        let (queue, _store) = queue();
        queue.push_to_retry(&raw_events(5), 3).await.unwrap();

        assert_eq!(queue.inspect_dlq(2).await.unwrap().len(), 2);
        assert_eq!(queue.clear_dlq().await.unwrap(), 5);
        assert_eq!(queue.dlq_size().await.unwrap(), 0);
        assert!(queue.inspect_dlq(10).await.unwrap().is_empty());
        assert_eq!(queue.clear_dlq().await.unwrap(), 0);
    }
}
