use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{BufferError, BufferResult};

/// Wire format used when inserting a chunk into the analytical store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// Header line plus one single-quoted CSV row per event
    Csv,
    /// One JSON object per line (`JSONEachRow`)
    JsonEachRow,
}

impl WireFormat {
    /// ClickHouse `FORMAT` clause name.
    pub fn clickhouse_name(&self) -> &'static str {
        match self {
            WireFormat::Csv => "CSV",
            WireFormat::JsonEachRow => "JSONEachRow",
        }
    }
}

/// Configuration for the event buffer.
#[derive(Debug, Clone)]
pub struct EventBufferConfig {
    /// Maximum events claimed per flush, also the size that triggers a flush on add
    pub batch_size: usize,

    /// Events per analytical store insert call
    pub chunk_size: usize,

    /// Insert wire format
    pub format: WireFormat,

    /// Allow concurrent flushes across workers (no flush lock)
    pub parallel: bool,

    /// Destination table
    pub table: String,

    /// Window after the last heartbeat during which a visitor counts as active
    pub presence_window: Duration,

    /// Expiry of the cached last screen view per profile
    pub last_event_ttl: Duration,

    /// Failed retry passes before a batch is moved to the dead letter queue
    pub max_retries: u32,

    /// Expiry of the flush lock taken in non-parallel mode
    pub lock_timeout: Duration,

    /// Minimum interval between counter reconciliations against the true queue length
    pub counter_resync_interval: Duration,
}

impl Default for EventBufferConfig {
    fn default() -> Self {
        Self {
            batch_size: 4000,
            chunk_size: 1000,
            format: WireFormat::JsonEachRow,
            parallel: false,
            table: "events".to_string(),
            presence_window: Duration::from_secs(60 * 5),
            last_event_ttl: Duration::from_secs(60 * 60),
            max_retries: 3,
            lock_timeout: Duration::from_secs(60),
            counter_resync_interval: Duration::from_secs(60 * 15),
        }
    }
}

impl EventBufferConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// Recognized variables: `EVENT_BUFFER_BATCH_SIZE`, `EVENT_BUFFER_CHUNK_SIZE`,
    /// `EVENT_BUFFER_PARALLEL`, `USE_CSV`, `EVENT_BUFFER_MAX_RETRIES`, `EVENT_BUFFER_TABLE`.
    pub fn from_env() -> BufferResult<Self> {
        let defaults = Self::default();

        let config = Self {
            batch_size: parse_var("EVENT_BUFFER_BATCH_SIZE", defaults.batch_size)?,
            chunk_size: parse_var("EVENT_BUFFER_CHUNK_SIZE", defaults.chunk_size)?,
            format: if flag_var("USE_CSV") {
                WireFormat::Csv
            } else {
                WireFormat::JsonEachRow
            },
            parallel: flag_var("EVENT_BUFFER_PARALLEL"),
            table: env::var("EVENT_BUFFER_TABLE").unwrap_or(defaults.table),
            max_retries: parse_var("EVENT_BUFFER_MAX_RETRIES", defaults.max_retries)?,
            ..defaults
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BufferResult<()> {
        if self.batch_size == 0 {
            return Err(BufferError::Config(
                "batch size must be greater than zero".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(BufferError::Config(
                "chunk size must be greater than zero".to_string(),
            ));
        }
        if self.table.trim().is_empty() {
            return Err(BufferError::Config("table name is empty".to_string()));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> BufferResult<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| BufferError::Config(format!("{} has invalid value '{}'", name, raw))),
        Err(_) => Ok(default),
    }
}

fn flag_var(name: &str) -> bool {
    env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}
