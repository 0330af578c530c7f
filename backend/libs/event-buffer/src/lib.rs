//! # Event Ingestion Buffer
//!
//! Durable buffer between a high-volume event tracking endpoint and ClickHouse. Events
//! are appended to a shared Redis queue, batch-flushed into the `events` table and, when
//! a flush fails, parked in a retry queue and eventually a dead letter queue.
//!
//! ## Guarantees
//!
//! - **At-least-once delivery**: a failed batch is requeued whole, so rows that were
//!   inserted before the failing chunk may be inserted again
//! - **Concurrent workers**: any number of processes may add and flush; a batch is
//!   claimed with one atomic pop, so no two workers write the same event
//! - **Intra-chunk ordering**: events are sorted by `created_at` within a claimed batch
//!
//! ## Architecture
//!
//! ```text
//! producer → EventBuffer::add ──┬─> event queue + counter ─> BatchProcessor ─> ClickHouse
//!                               ├─> last screen view cache        │ failure
//!                               ├─> live visitor presence         v
//!                               └─> "received" fanout       retry queue ─> dead letter queue
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_buffer::{ClickHouseEventSink, EventBuffer, EventBufferConfig, RedisBufferStore};
//! use std::sync::Arc;
//!
//! # async fn run(event: event_buffer::Event) -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisBufferStore::connect("redis://127.0.0.1:6379", None).await?;
//! let sink = ClickHouseEventSink::new("http://127.0.0.1:8123", "default", "default", "", 30_000);
//! let buffer = EventBuffer::new(Arc::new(store), Arc::new(sink), EventBufferConfig::from_env()?)?;
//!
//! buffer.add(&event).await;
//! buffer.process_buffer().await?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod fanout;
pub mod format;
pub mod keys;
pub mod last_event;
pub mod metrics;
pub mod presence;
pub mod processor;
pub mod retry;
pub mod sink;
pub mod store;

pub use buffer::{BufferCounters, BufferStats, EventBuffer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EventBufferConfig, WireFormat};
pub use engine::{BufferCodec, BufferEngine, EngineOptions, FlushHandler, JsonCodec};
pub use error::{BufferError, BufferResult};
pub use event::{Event, PublicEvent};
pub use format::InsertPayload;
pub use last_event::LastEventLookup;
pub use metrics::BufferMetrics;
pub use processor::ProcessOutcome;
pub use retry::{RetryEnvelope, RetryOutcome};
pub use sink::{ClickHouseEventSink, EventSink};
pub use store::{BufferStore, InMemoryBufferStore, RedisBufferStore, StoreTransaction};
