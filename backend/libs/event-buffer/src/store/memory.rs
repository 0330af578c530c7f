//! Single-process store honoring the same atomicity contracts as Redis.
//!
//! All state sits behind one mutex, so every trait method is trivially atomic. Expiry is
//! evaluated lazily against the injected clock. Published messages are recorded so
//! callers can observe fanout.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{BufferStore, StoreOp, StoreTransaction};
use crate::clock::{Clock, SystemClock};
use crate::error::{BufferError, BufferResult};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at_ms: Option<i64>,
}

#[derive(Debug, Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    values: HashMap<String, StoredValue>,
    sorted_sets: HashMap<String, HashMap<String, i64>>,
    published: Vec<(String, String)>,
}

impl State {
    fn live_value(&mut self, key: &str, now_ms: i64) -> Option<&StoredValue> {
        let expired = self
            .values
            .get(key)
            .and_then(|v| v.expires_at_ms)
            .map(|at| at <= now_ms)
            .unwrap_or(false);
        if expired {
            self.values.remove(key);
        }
        self.values.get(key)
    }

    fn counter(&mut self, key: &str, now_ms: i64) -> BufferResult<i64> {
        match self.live_value(key, now_ms) {
            Some(stored) => stored.value.parse::<i64>().map_err(|_| {
                BufferError::Store(format!("value at {} is not an integer", key))
            }),
            None => Ok(0),
        }
    }

    fn apply(&mut self, op: StoreOp, now_ms: i64) -> BufferResult<()> {
        match op {
            StoreOp::Push { key, value } => {
                self.lists.entry(key).or_default().push_back(value);
            }
            StoreOp::IncrBy { key, delta } => {
                let current = self.counter(&key, now_ms)?;
                let expires_at_ms = self.values.get(&key).and_then(|v| v.expires_at_ms);
                self.values.insert(
                    key,
                    StoredValue {
                        value: (current + delta).to_string(),
                        expires_at_ms,
                    },
                );
            }
            StoreOp::Set { key, value } => {
                self.values.insert(
                    key,
                    StoredValue {
                        value,
                        expires_at_ms: None,
                    },
                );
            }
            StoreOp::SetEx {
                key,
                value,
                ttl_secs,
            } => {
                self.values.insert(
                    key,
                    StoredValue {
                        value,
                        expires_at_ms: Some(now_ms + (ttl_secs as i64) * 1000),
                    },
                );
            }
            StoreOp::Del { key } => {
                self.lists.remove(&key);
                self.values.remove(&key);
                self.sorted_sets.remove(&key);
            }
            StoreOp::ZAdd { key, member, score } => {
                self.sorted_sets.entry(key).or_default().insert(member, score);
            }
            StoreOp::Publish { channel, message } => {
                self.published.push((channel, message));
            }
        }
        Ok(())
    }
}

/// In-memory [`BufferStore`].
pub struct InMemoryBufferStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
}

impl Default for InMemoryBufferStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBufferStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: every operation fails until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Messages published so far, as `(channel, message)` pairs.
    pub fn published(&self) -> Vec<(String, String)> {
        self.state.lock().published.clone()
    }

    /// Current contents of a list, front first.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.state
            .lock()
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn check_available(&self) -> BufferResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BufferError::Store("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BufferStore for InMemoryBufferStore {
    async fn exec(&self, tx: StoreTransaction) -> BufferResult<()> {
        self.check_available()?;
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock();

        // Validate counters first so a failing op leaves nothing half-applied.
        for op in tx.ops() {
            if let StoreOp::IncrBy { key, .. } = op {
                state.counter(key, now_ms)?;
            }
        }
        for op in tx.ops().iter().cloned() {
            state.apply(op, now_ms)?;
        }
        Ok(())
    }

    async fn pop_front(
        &self,
        queue: &str,
        counter: &str,
        count: usize,
    ) -> BufferResult<Vec<String>> {
        self.check_available()?;
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock();

        let popped: Vec<String> = match state.lists.get_mut(queue) {
            Some(list) => {
                let take = count.min(list.len());
                list.drain(..take).collect()
            }
            None => Vec::new(),
        };
        if state.lists.get(queue).map(|l| l.is_empty()).unwrap_or(false) {
            state.lists.remove(queue);
        }

        if !popped.is_empty() {
            state.apply(
                StoreOp::IncrBy {
                    key: counter.to_string(),
                    delta: -(popped.len() as i64),
                },
                now_ms,
            )?;
        }
        Ok(popped)
    }

    async fn range(&self, queue: &str, limit: usize) -> BufferResult<Vec<String>> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .lists
            .get(queue)
            .map(|l| l.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn queue_len(&self, queue: &str) -> BufferResult<u64> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state.lists.get(queue).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn get(&self, key: &str) -> BufferResult<Option<String>> {
        self.check_available()?;
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock();
        Ok(state.live_value(key, now_ms).map(|v| v.value.clone()))
    }

    async fn prune_and_count(&self, key: &str, cutoff: i64) -> BufferResult<u64> {
        self.check_available()?;
        let mut state = self.state.lock();
        let Some(set) = state.sorted_sets.get_mut(key) else {
            return Ok(0);
        };
        set.retain(|_, score| *score > cutoff);
        let count = set.len() as u64;
        if set.is_empty() {
            state.sorted_sets.remove(key);
        }
        Ok(count)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_secs: u64) -> BufferResult<bool> {
        self.check_available()?;
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock();
        if state.live_value(key, now_ms).is_some() {
            return Ok(false);
        }
        state.apply(
            StoreOp::SetEx {
                key: key.to_string(),
                value: value.to_string(),
                ttl_secs,
            },
            now_ms,
        )?;
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> BufferResult<bool> {
        self.check_available()?;
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock();
        let matches = state
            .live_value(key, now_ms)
            .map(|v| v.value == value)
            .unwrap_or(false);
        if matches {
            state.values.remove(key);
        }
        Ok(matches)
    }

    async fn clear_queue(&self, queue: &str, counter: &str) -> BufferResult<u64> {
        self.check_available()?;
        let mut state = self.state.lock();
        let removed = state.lists.remove(queue).map(|l| l.len() as u64).unwrap_or(0);
        state.values.insert(
            counter.to_string(),
            StoredValue {
                value: "0".to_string(),
                expires_at_ms: None,
            },
        );
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pop_front_decrements_counter() {
        let store = InMemoryBufferStore::new();
        let mut tx = StoreTransaction::new();
        for v in ["a", "b", "c"] {
            tx.push("q", v).incr_by("q:count", 1);
        }
        store.exec(tx).await.unwrap();

        let popped = store.pop_front("q", "q:count", 2).await.unwrap();
        assert_eq!(popped, vec!["a", "b"]);
        assert_eq!(store.get("q:count").await.unwrap().as_deref(), Some("1"));

        let rest = store.pop_front("q", "q:count", 10).await.unwrap();
        assert_eq!(rest, vec!["c"]);
        assert_eq!(store.queue_len("q").await.unwrap(), 0);

        // Nothing popped, counter untouched
        let none = store.pop_front("q", "q:count", 10).await.unwrap();
        assert!(none.is_empty());
        assert_eq!(store.get("q:count").await.unwrap().as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_values_expire() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = InMemoryBufferStore::with_clock(clock.clone());

        let mut tx = StoreTransaction::new();
        tx.set_ex("k", "v", 60);
        store.exec(tx).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        clock.advance(Duration::from_secs(59));
        assert!(store.get("k").await.unwrap().is_some());

        clock.advance(Duration::from_secs(1));
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_transaction_applies_nothing() {
        let store = InMemoryBufferStore::new();
        let mut setup = StoreTransaction::new();
        setup.set("not-a-number", "abc");
        store.exec(setup).await.unwrap();

        let mut tx = StoreTransaction::new();
        tx.push("q", "a").incr_by("not-a-number", 1);
        assert!(store.exec(tx).await.is_err());
        assert_eq!(store.queue_len("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_prune_and_count_boundary() {
        let store = InMemoryBufferStore::new();
        let mut tx = StoreTransaction::new();
        tx.zadd("z", "old", 100).zadd("z", "edge", 200).zadd("z", "new", 300);
        store.exec(tx).await.unwrap();

        assert_eq!(store.prune_and_count("z", 200).await.unwrap(), 1);
        assert_eq!(store.prune_and_count("z", 0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lock_primitives() {
        let store = InMemoryBufferStore::new();
        assert!(store.set_if_absent("lock", "t1", 60).await.unwrap());
        assert!(!store.set_if_absent("lock", "t2", 60).await.unwrap());
        assert!(!store.delete_if_equals("lock", "t2").await.unwrap());
        assert!(store.delete_if_equals("lock", "t1").await.unwrap());
        assert!(store.set_if_absent("lock", "t2", 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = InMemoryBufferStore::new();
        store.set_unavailable(true);
        assert!(store.queue_len("q").await.is_err());
        store.set_unavailable(false);
        assert!(store.queue_len("q").await.is_ok());
    }
}
