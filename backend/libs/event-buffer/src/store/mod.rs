//! Shared store abstraction.
//!
//! Every piece of shared mutable state (event queue, retry queue, dead letter queue,
//! their counters, presence sets and last-event entries) lives behind [`BufferStore`].
//! The trait exposes only the atomic primitives the buffer relies on, so any number of
//! worker processes can mutate the same state without a central lock:
//!
//! - [`BufferStore::exec`] applies a [`StoreTransaction`] all-or-nothing
//!   (append + counter increment, score update, publish)
//! - [`BufferStore::pop_front`] claims up to N items and decrements a counter in one step
//! - [`BufferStore::prune_and_count`] trims a scored set and counts what is left in one step

use async_trait::async_trait;

use crate::error::BufferResult;

pub mod memory;
pub mod redis;

pub use self::memory::InMemoryBufferStore;
pub use self::redis::RedisBufferStore;

/// Single operation inside a [`StoreTransaction`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Append to the back of a list
    Push { key: String, value: String },
    /// Add `delta` to an integer counter (missing counters start at 0)
    IncrBy { key: String, delta: i64 },
    /// Overwrite a plain value without expiry
    Set { key: String, value: String },
    /// Overwrite a plain value with an expiry in seconds
    SetEx {
        key: String,
        value: String,
        ttl_secs: u64,
    },
    /// Remove a key of any type
    Del { key: String },
    /// Insert or update a member score in a sorted set
    ZAdd {
        key: String,
        member: String,
        score: i64,
    },
    /// Fire-and-forget pub/sub message
    Publish { channel: String, message: String },
}

/// Ordered batch of operations applied atomically by [`BufferStore::exec`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreTransaction {
    ops: Vec<StoreOp>,
}

impl StoreTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(StoreOp::Push {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn incr_by(&mut self, key: impl Into<String>, delta: i64) -> &mut Self {
        self.ops.push(StoreOp::IncrBy {
            key: key.into(),
            delta,
        });
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(StoreOp::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn set_ex(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl_secs: u64,
    ) -> &mut Self {
        self.ops.push(StoreOp::SetEx {
            key: key.into(),
            value: value.into(),
            ttl_secs,
        });
        self
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(StoreOp::Del { key: key.into() });
        self
    }

    pub fn zadd(
        &mut self,
        key: impl Into<String>,
        member: impl Into<String>,
        score: i64,
    ) -> &mut Self {
        self.ops.push(StoreOp::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
        });
        self
    }

    pub fn publish(&mut self, channel: impl Into<String>, message: impl Into<String>) -> &mut Self {
        self.ops.push(StoreOp::Publish {
            channel: channel.into(),
            message: message.into(),
        });
        self
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Shared store offering the atomicity contracts the buffer depends on.
#[async_trait]
pub trait BufferStore: Send + Sync {
    /// Apply every operation of the transaction atomically, in order.
    async fn exec(&self, tx: StoreTransaction) -> BufferResult<()>;

    /// Pop up to `count` items from the front of `queue` and decrement `counter` by the
    /// number actually popped, as one atomic step. No two callers ever receive the same item.
    async fn pop_front(&self, queue: &str, counter: &str, count: usize)
        -> BufferResult<Vec<String>>;

    /// Read up to `limit` items from the front of `queue` without removing them.
    async fn range(&self, queue: &str, limit: usize) -> BufferResult<Vec<String>>;

    /// True length of `queue`.
    async fn queue_len(&self, queue: &str) -> BufferResult<u64>;

    /// Read a plain value; expired or missing keys yield `None`.
    async fn get(&self, key: &str) -> BufferResult<Option<String>>;

    /// Remove every member scored at or below `cutoff`, then count members scored above
    /// it, as one atomic step.
    async fn prune_and_count(&self, key: &str, cutoff: i64) -> BufferResult<u64>;

    /// Set `key` only if it does not exist. Returns whether the value was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl_secs: u64) -> BufferResult<bool>;

    /// Delete `key` only if it currently holds `value`. Returns whether it was deleted.
    async fn delete_if_equals(&self, key: &str, value: &str) -> BufferResult<bool>;

    /// Delete `queue` and reset `counter` to 0 atomically, returning the number of items
    /// that were in the queue.
    async fn clear_queue(&self, queue: &str, counter: &str) -> BufferResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_builder_keeps_order() {
        let mut tx = StoreTransaction::new();
        tx.push("queue", "a").incr_by("queue:count", 1).del("other");

        assert_eq!(tx.len(), 3);
        assert_eq!(
            tx.ops()[0],
            StoreOp::Push {
                key: "queue".to_string(),
                value: "a".to_string()
            }
        );
        assert_eq!(
            tx.ops()[2],
            StoreOp::Del {
                key: "other".to_string()
            }
        );
    }
}
