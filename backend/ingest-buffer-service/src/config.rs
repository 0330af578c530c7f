/// Configuration for the ingest buffer service
///
/// Everything is read from environment variables; a `.env` file is loaded first when present.
use event_buffer::EventBufferConfig;
use serde::{Deserialize, Serialize};

/// Main service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub http: HttpConfig,
    pub redis: RedisConfig,
    pub clickhouse: ClickHouseConfig,
    pub worker: WorkerConfig,
    /// Buffer behavior (batch size, wire format, retries, ...)
    pub buffer: EventBufferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    /// Per-command timeout (floored at 500ms by the store)
    pub command_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickHouseConfig {
    pub url: String,
    pub database: String,
    pub user: String,
    pub password: String,
    pub query_timeout_ms: u64,
}

/// Background worker cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub flush_interval_ms: u64,
    pub retry_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 10_000,
            retry_interval_ms: 60_000,
        }
    }
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parsed_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("{} must be a valid number, got '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, String> {
        let worker_defaults = WorkerConfig::default();

        let config = ServiceConfig {
            http: HttpConfig {
                host: var_or("HTTP_HOST", "0.0.0.0"),
                port: parsed_or("HTTP_PORT", 8080)?,
            },
            redis: RedisConfig {
                url: var_or("REDIS_URL", "redis://127.0.0.1:6379"),
                command_timeout_ms: parsed_or("REDIS_COMMAND_TIMEOUT_MS", 3_000)?,
            },
            clickhouse: ClickHouseConfig {
                url: var_or("CLICKHOUSE_URL", "http://127.0.0.1:8123"),
                database: var_or("CLICKHOUSE_DATABASE", "default"),
                user: var_or("CLICKHOUSE_USER", "default"),
                password: var_or("CLICKHOUSE_PASSWORD", ""),
                query_timeout_ms: parsed_or("CLICKHOUSE_QUERY_TIMEOUT_MS", 30_000)?,
            },
            worker: WorkerConfig {
                flush_interval_ms: parsed_or(
                    "EVENT_BUFFER_FLUSH_INTERVAL_MS",
                    worker_defaults.flush_interval_ms,
                )?,
                retry_interval_ms: parsed_or(
                    "EVENT_BUFFER_RETRY_INTERVAL_MS",
                    worker_defaults.retry_interval_ms,
                )?,
            },
            buffer: EventBufferConfig::from_env().map_err(|e| e.to_string())?,
        };

        if config.worker.flush_interval_ms == 0 || config.worker.retry_interval_ms == 0 {
            return Err("worker intervals must be greater than zero".to_string());
        }

        Ok(config)
    }
}
