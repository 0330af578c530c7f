//! Generic buffer engine.
//!
//! A [`BufferEngine`] is instantiated once per buffer variant. It owns the flush
//! handler, the entity codec and the shared size counter, and knows nothing about what
//! the entities are. The event buffer is one instantiation; other variants (sessions,
//! profiles) plug in their own handler and codec.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::BufferResult;
use crate::store::{BufferStore, StoreTransaction};

/// Callback invoked by [`BufferEngine::try_flush`].
#[async_trait]
pub trait FlushHandler: Send + Sync {
    async fn on_flush(&self) -> BufferResult<()>;
}

/// Encodes buffered entities into queue entries and back.
pub trait BufferCodec: Send + Sync {
    type Item;

    fn encode(&self, item: &Self::Item) -> BufferResult<String>;

    /// Malformed entries decode to `None`.
    fn decode(&self, raw: &str) -> Option<Self::Item>;
}

/// serde_json codec.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BufferCodec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    type Item = T;

    fn encode(&self, item: &T) -> BufferResult<String> {
        Ok(serde_json::to_string(item)?)
    }

    fn decode(&self, raw: &str) -> Option<T> {
        serde_json::from_str(raw).ok()
    }
}

/// Options shared by every buffer variant.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Skip the flush lock and let every worker flush concurrently
    pub parallel: bool,
    pub lock_timeout: Duration,
    pub counter_resync_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            parallel: false,
            lock_timeout: Duration::from_secs(60),
            counter_resync_interval: Duration::from_secs(60 * 15),
        }
    }
}

pub struct BufferEngine<H, C> {
    name: String,
    handler: H,
    codec: C,
    store: Arc<dyn BufferStore>,
    options: EngineOptions,
    counter_key: String,
    lock_key: String,
    resync_key: String,
}

impl<H, C> BufferEngine<H, C>
where
    H: FlushHandler,
    C: BufferCodec,
{
    pub fn new(
        name: &str,
        handler: H,
        codec: C,
        store: Arc<dyn BufferStore>,
        options: EngineOptions,
    ) -> Self {
        Self {
            name: name.to_string(),
            handler,
            codec,
            store,
            options,
            counter_key: counter_key_for(name),
            lock_key: format!("lock:{}", name),
            resync_key: format!("{}:buffer:resync", name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Key of the O(1) size counter kept next to the queue.
    pub fn counter_key(&self) -> &str {
        &self.counter_key
    }

    /// Encode `item` and stage "append to `queue` + increment counter" into `tx`.
    pub fn stage_append(
        &self,
        tx: &mut StoreTransaction,
        queue: &str,
        item: &C::Item,
    ) -> BufferResult<String> {
        let raw = self.codec.encode(item)?;
        tx.push(queue, raw.clone()).incr_by(&self.counter_key, 1);
        Ok(raw)
    }

    /// Run the flush handler.
    ///
    /// In parallel mode the handler runs directly; the handler's own atomic claim keeps
    /// concurrent flushes apart. Otherwise a store-level lock serializes flushes across
    /// workers and a worker that loses the race skips its flush.
    pub async fn try_flush(&self) -> BufferResult<()> {
        if self.options.parallel {
            return self.handler.on_flush().await;
        }

        let token = Uuid::new_v4().to_string();
        let acquired = self
            .store
            .set_if_absent(
                &self.lock_key,
                &token,
                self.options.lock_timeout.as_secs().max(1),
            )
            .await?;

        if !acquired {
            debug!(buffer = %self.name, "Flush already in progress, skipping");
            return Ok(());
        }

        let result = self.handler.on_flush().await;

        if let Err(e) = self.store.delete_if_equals(&self.lock_key, &token).await {
            warn!(buffer = %self.name, error = %e, "Failed to release flush lock");
        }

        if let Err(e) = &result {
            error!(buffer = %self.name, error = %e, "Flush failed");
        }
        result
    }

    /// Size of `queue` read from the counter, reconciled against the true length.
    ///
    /// At most once per resync interval (across all workers) the counter is overwritten
    /// with the true length, which bounds drift from crashed or partial updates.
    pub async fn size_with_counter(&self, queue: &str) -> BufferResult<u64> {
        let resync_secs = self.options.counter_resync_interval.as_secs().max(1);
        match self
            .store
            .set_if_absent(&self.resync_key, "1", resync_secs)
            .await
        {
            Ok(true) => {
                let actual = self.store.queue_len(queue).await?;
                let mut tx = StoreTransaction::new();
                tx.set(&self.counter_key, actual.to_string());
                self.store.exec(tx).await?;
                debug!(buffer = %self.name, size = actual, "Resynced buffer counter");
                return Ok(actual);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(buffer = %self.name, error = %e, "Counter resync check failed");
            }
        }

        counted_len(self.store.as_ref(), &self.counter_key, queue).await
    }
}

/// Size counter key of the buffer named `name`.
pub fn counter_key_for(name: &str) -> String {
    format!("{}:buffer:count", name)
}

/// Read a queue size from its counter, falling back to the true length.
///
/// A missing or unparseable counter is rebuilt from the true length; a negative counter
/// reads as 0. If the counter cannot be read at all, the true length is returned.
pub async fn counted_len(
    store: &dyn BufferStore,
    counter_key: &str,
    queue: &str,
) -> BufferResult<u64> {
    match store.get(counter_key).await {
        Ok(Some(raw)) => {
            if let Ok(value) = raw.trim().parse::<i64>() {
                return Ok(value.max(0) as u64);
            }
            warn!(counter = counter_key, value = %raw, "Counter is not an integer, rebuilding");
        }
        Ok(None) => {}
        Err(e) => {
            warn!(counter = counter_key, error = %e, "Failed to read counter, using queue length");
            return store.queue_len(queue).await;
        }
    }

    let actual = store.queue_len(queue).await?;
    let mut tx = StoreTransaction::new();
    tx.set(counter_key, actual.to_string());
    store.exec(tx).await?;
    Ok(actual)
}

/// Split `items` into consecutive slices of at most `size` elements.
pub fn chunks<T>(items: &[T], size: usize) -> std::slice::Chunks<'_, T> {
    items.chunks(size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBufferStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FlushHandler for CountingHandler {
        async fn on_flush(&self) -> BufferResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn engine(
        store: Arc<InMemoryBufferStore>,
        parallel: bool,
    ) -> BufferEngine<CountingHandler, JsonCodec<String>> {
        BufferEngine::new(
            "test",
            CountingHandler::default(),
            JsonCodec::new(),
            store,
            EngineOptions {
                parallel,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_chunks() {
        let items: Vec<u32> = (0..2500).collect();
        let sizes: Vec<usize> = chunks(&items, 1000).map(|c| c.len()).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);

        let empty: Vec<u32> = Vec::new();
        assert_eq!(chunks(&empty, 1000).count(), 0);
        assert_eq!(chunks(&items[..3], 0).count(), 3);
    }

    #[test]
    fn test_json_codec_rejects_garbage() {
        let codec: JsonCodec<Vec<u32>> = JsonCodec::new();
        let raw = codec.encode(&vec![1, 2, 3]).unwrap();
        assert_eq!(codec.decode(&raw), Some(vec![1, 2, 3]));
        assert_eq!(codec.decode("{not json"), None);
    }

    #[tokio::test]
    async fn test_keys_derive_from_name() {
        let store = Arc::new(InMemoryBufferStore::new());
        let engine = engine(store, false);
        assert_eq!(engine.name(), "test");
        assert_eq!(engine.counter_key(), "test:buffer:count");
    }

    #[tokio::test]
    async fn test_try_flush_skips_when_locked() {
        let store = Arc::new(InMemoryBufferStore::new());
        let engine = engine(store.clone(), false);

        engine.try_flush().await.unwrap();
        assert_eq!(engine.handler().calls.load(Ordering::SeqCst), 1);

        // Another worker holds the lock
        assert!(store.set_if_absent("lock:test", "other", 60).await.unwrap());
        engine.try_flush().await.unwrap();
        assert_eq!(engine.handler().calls.load(Ordering::SeqCst), 1);

        // Lock released by its owner
        assert!(store.delete_if_equals("lock:test", "other").await.unwrap());
        engine.try_flush().await.unwrap();
        assert_eq!(engine.handler().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_parallel_flush_ignores_lock() {
        let store = Arc::new(InMemoryBufferStore::new());
        let engine = engine(store.clone(), true);
        assert!(store.set_if_absent("lock:test", "other", 60).await.unwrap());

        engine.try_flush().await.unwrap();
        assert_eq!(engine.handler().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stage_append_counts() {
        let store = Arc::new(InMemoryBufferStore::new());
        let engine = engine(store.clone(), false);

        let mut tx = StoreTransaction::new();
        engine.stage_append(&mut tx, "q", &"a".to_string()).unwrap();
        engine.stage_append(&mut tx, "q", &"b".to_string()).unwrap();
        store.exec(tx).await.unwrap();

        assert_eq!(store.list("q"), vec!["\"a\"", "\"b\""]);
        assert_eq!(engine.size_with_counter("q").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_counted_len_rebuilds_missing_and_clamps_negative() {
        let store = Arc::new(InMemoryBufferStore::new());
        let mut tx = StoreTransaction::new();
        tx.push("q", "a").push("q", "b");
        store.exec(tx).await.unwrap();

        // Missing counter is rebuilt from the true length
        assert_eq!(counted_len(store.as_ref(), "q:count", "q").await.unwrap(), 2);
        assert_eq!(store.get("q:count").await.unwrap().as_deref(), Some("2"));

        // Negative counter clamps to zero
        let mut tx = StoreTransaction::new();
        tx.set("q:count", "-5");
        store.exec(tx).await.unwrap();
        assert_eq!(counted_len(store.as_ref(), "q:count", "q").await.unwrap(), 0);

        // Garbage counter is rebuilt
        let mut tx = StoreTransaction::new();
        tx.set("q:count", "oops");
        store.exec(tx).await.unwrap();
        assert_eq!(counted_len(store.as_ref(), "q:count", "q").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_size_resyncs_drifted_counter_once_per_interval() {
        let store = Arc::new(InMemoryBufferStore::new());
        let engine = engine(store.clone(), false);

        let mut tx = StoreTransaction::new();
        tx.push("q", "a").set("test:buffer:count", "10");
        store.exec(tx).await.unwrap();

        // First read reconciles the drifted counter
        assert_eq!(engine.size_with_counter("q").await.unwrap(), 1);

        // Within the interval the counter is trusted
        let mut tx = StoreTransaction::new();
        tx.set("test:buffer:count", "7");
        store.exec(tx).await.unwrap();
        assert_eq!(engine.size_with_counter("q").await.unwrap(), 7);
    }
}
