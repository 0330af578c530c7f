//! Analytical store sink.

use async_trait::async_trait;
use clickhouse::Client;
use std::time::Duration;
use tracing::{debug, error};

use crate::config::WireFormat;
use crate::error::{BufferError, BufferResult};
use crate::format::InsertPayload;

/// Destination for encoded event chunks. One call per chunk.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn insert(&self, table: &str, payload: InsertPayload) -> BufferResult<()>;
}

/// Settings attached to CSV inserts: skip the header row and accept both quote styles.
const CSV_INSERT_SETTINGS: &str = "input_format_csv_skip_first_lines = 1, \
     format_csv_allow_single_quotes = 1, \
     format_csv_allow_double_quotes = 1";

#[derive(Clone)]
pub struct ClickHouseEventSink {
    client: Client,
    insert_timeout: Duration,
}

impl ClickHouseEventSink {
    pub fn new(
        url: &str,
        database: &str,
        username: &str,
        password: &str,
        query_timeout_ms: u64,
    ) -> Self {
        let client = Client::default()
            .with_url(url)
            .with_database(database)
            .with_user(username)
            .with_password(password)
            .with_option("max_execution_time", (query_timeout_ms / 1000).max(1).to_string());

        Self {
            client,
            insert_timeout: Duration::from_millis(query_timeout_ms),
        }
    }

    pub async fn health_check(&self) -> BufferResult<()> {
        self.client
            .query("SELECT 1")
            .execute()
            .await
            .map_err(|e| {
                error!("ClickHouse health check failed: {}", e);
                BufferError::from(e)
            })
    }
}

/// Build the full insert statement: SQL prefix, newline, then the data.
///
/// The client treats `?` as a bind placeholder, so literal question marks in the data are
/// doubled to pass through unchanged.
pub fn insert_statement(table: &str, payload: &InsertPayload) -> String {
    let settings = match payload.format {
        WireFormat::Csv => format!(" SETTINGS {}", CSV_INSERT_SETTINGS),
        WireFormat::JsonEachRow => String::new(),
    };

    format!(
        "INSERT INTO {}{} FORMAT {}\n{}",
        table,
        settings,
        payload.format.clickhouse_name(),
        payload.body.replace('?', "??")
    )
}

#[async_trait]
impl EventSink for ClickHouseEventSink {
    async fn insert(&self, table: &str, payload: InsertPayload) -> BufferResult<()> {
        let statement = insert_statement(table, &payload);

        debug!(
            table = table,
            rows = payload.rows,
            format = payload.format.clickhouse_name(),
            "Inserting chunk into ClickHouse"
        );

        match tokio::time::timeout(self.insert_timeout, self.client.query(&statement).execute())
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(table = table, rows = payload.rows, "ClickHouse insert failed: {}", e);
                Err(e.into())
            }
            Err(_) => {
                error!(
                    table = table,
                    rows = payload.rows,
                    "ClickHouse insert timed out after {:?}", self.insert_timeout
                );
                Err(BufferError::ClickHouse(format!(
                    "insert timed out after {}ms",
                    self.insert_timeout.as_millis()
                )))
            }
        }
    }
}
