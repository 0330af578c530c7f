//! Redis-backed store.
//!
//! Transactions are sent as `MULTI`/`EXEC` pipelines; the two compound primitives that
//! need to read before they write (pop-N with counter decrement, compare-and-delete)
//! run as Lua scripts so they stay atomic. Every round trip is bounded by the command
//! timeout.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{BufferStore, StoreOp, StoreTransaction};
use crate::error::{BufferError, BufferResult};

/// Shared Redis connection manager guarded by a Tokio mutex.
pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 3_000;
const MIN_COMMAND_TIMEOUT_MS: u64 = 500;

// LPOP with a count needs Redis >= 6.2.
const POP_FRONT_SCRIPT: &str = r#"
local items = redis.call('LPOP', KEYS[1], ARGV[1])
if not items then
    return {}
end
redis.call('DECRBY', KEYS[2], #items)
return items
"#;

const DELETE_IF_EQUALS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

pub struct RedisBufferStore {
    manager: SharedConnectionManager,
    command_timeout: Duration,
    pop_front_script: Script,
    delete_if_equals_script: Script,
}

impl RedisBufferStore {
    pub fn new(manager: SharedConnectionManager, command_timeout: Duration) -> Self {
        let floor = Duration::from_millis(MIN_COMMAND_TIMEOUT_MS);
        Self {
            manager,
            command_timeout: command_timeout.max(floor),
            pop_front_script: Script::new(POP_FRONT_SCRIPT),
            delete_if_equals_script: Script::new(DELETE_IF_EQUALS_SCRIPT),
        }
    }

    /// Open a connection manager for `redis_url` and wrap it in a store.
    pub async fn connect(redis_url: &str, command_timeout: Option<Duration>) -> BufferResult<Self> {
        let client = Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        info!("Connected event buffer store to Redis");

        Ok(Self::new(
            Arc::new(Mutex::new(manager)),
            command_timeout.unwrap_or(Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS)),
        ))
    }

    async fn connection(&self) -> ConnectionManager {
        self.manager.lock().await.clone()
    }

    async fn run_with_timeout<F, T>(&self, future: F) -> BufferResult<T>
    where
        F: Future<Output = Result<T, RedisError>>,
    {
        match timeout(self.command_timeout, future).await {
            Ok(res) => res.map_err(BufferError::from),
            Err(_) => Err(BufferError::Timeout(self.command_timeout.as_millis() as u64)),
        }
    }
}

fn build_pipeline(tx: &StoreTransaction) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();

    for op in tx.ops() {
        match op {
            StoreOp::Push { key, value } => {
                pipe.cmd("RPUSH").arg(key).arg(value).ignore();
            }
            StoreOp::IncrBy { key, delta } => {
                pipe.cmd("INCRBY").arg(key).arg(*delta).ignore();
            }
            StoreOp::Set { key, value } => {
                pipe.cmd("SET").arg(key).arg(value).ignore();
            }
            StoreOp::SetEx {
                key,
                value,
                ttl_secs,
            } => {
                pipe.cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("EX")
                    .arg(*ttl_secs)
                    .ignore();
            }
            StoreOp::Del { key } => {
                pipe.cmd("DEL").arg(key).ignore();
            }
            StoreOp::ZAdd { key, member, score } => {
                pipe.cmd("ZADD").arg(key).arg(*score).arg(member).ignore();
            }
            StoreOp::Publish { channel, message } => {
                pipe.cmd("PUBLISH").arg(channel).arg(message).ignore();
            }
        }
    }

    pipe
}

#[async_trait]
impl BufferStore for RedisBufferStore {
    async fn exec(&self, tx: StoreTransaction) -> BufferResult<()> {
        if tx.is_empty() {
            return Ok(());
        }
        let pipe = build_pipeline(&tx);
        let mut conn = self.connection().await;
        self.run_with_timeout(pipe.query_async::<_, ()>(&mut conn))
            .await?;
        debug!(ops = tx.len(), "Applied store transaction");
        Ok(())
    }

    async fn pop_front(
        &self,
        queue: &str,
        counter: &str,
        count: usize,
    ) -> BufferResult<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await;
        let mut invocation = self.pop_front_script.prepare_invoke();
        invocation.key(queue).key(counter).arg(count);
        self.run_with_timeout(invocation.invoke_async::<_, Vec<String>>(&mut conn))
            .await
    }

    async fn range(&self, queue: &str, limit: usize) -> BufferResult<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await;
        self.run_with_timeout(
            redis::cmd("LRANGE")
                .arg(queue)
                .arg(0)
                .arg(range_stop(limit))
                .query_async(&mut conn),
        )
        .await
    }

    async fn queue_len(&self, queue: &str) -> BufferResult<u64> {
        let mut conn = self.connection().await;
        self.run_with_timeout(redis::cmd("LLEN").arg(queue).query_async(&mut conn))
            .await
    }

    async fn get(&self, key: &str) -> BufferResult<Option<String>> {
        let mut conn = self.connection().await;
        self.run_with_timeout(redis::cmd("GET").arg(key).query_async(&mut conn))
            .await
    }

    async fn prune_and_count(&self, key: &str, cutoff: i64) -> BufferResult<u64> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(cutoff)
            .ignore()
            .cmd("ZCOUNT")
            .arg(key)
            .arg(format!("({}", cutoff))
            .arg("+inf");

        let mut conn = self.connection().await;
        let (count,): (u64,) = self.run_with_timeout(pipe.query_async(&mut conn)).await?;
        Ok(count)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_secs: u64) -> BufferResult<bool> {
        let mut conn = self.connection().await;
        let reply: Option<String> = self
            .run_with_timeout(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_secs.max(1))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> BufferResult<bool> {
        let mut conn = self.connection().await;
        let mut invocation = self.delete_if_equals_script.prepare_invoke();
        invocation.key(key).arg(value);
        let deleted: i64 = self
            .run_with_timeout(invocation.invoke_async(&mut conn))
            .await?;
        Ok(deleted > 0)
    }

    async fn clear_queue(&self, queue: &str, counter: &str) -> BufferResult<u64> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LLEN")
            .arg(queue)
            .cmd("DEL")
            .arg(queue)
            .ignore()
            .cmd("SET")
            .arg(counter)
            .arg(0)
            .ignore();

        let mut conn = self.connection().await;
        let (removed,): (u64,) = self.run_with_timeout(pipe.query_async(&mut conn)).await?;
        Ok(removed)
    }
}

/// Inclusive `LRANGE` stop index for the first `limit` items.
fn range_stop(limit: usize) -> isize {
    limit.min(isize::MAX as usize) as isize - 1
}
