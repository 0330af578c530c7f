use actix_web::{web, App, HttpServer};
use anyhow::{anyhow, Context, Result};
use event_buffer::{ClickHouseEventSink, EventBuffer, RedisBufferStore};
use ingest_buffer_service::worker::Workers;
use ingest_buffer_service::{configure, AppState, ServiceConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "info,ingest_buffer_service=debug,event_buffer=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting ingest-buffer-service");

    let config = ServiceConfig::from_env().map_err(|e| anyhow!(e))?;

    let store = RedisBufferStore::connect(
        &config.redis.url,
        Some(Duration::from_millis(config.redis.command_timeout_ms)),
    )
    .await
    .context("Failed to connect to Redis")?;

    let sink = ClickHouseEventSink::new(
        &config.clickhouse.url,
        &config.clickhouse.database,
        &config.clickhouse.user,
        &config.clickhouse.password,
        config.clickhouse.query_timeout_ms,
    );
    if let Err(e) = sink.health_check().await {
        // Flushes keep failing into the retry queue until ClickHouse comes back
        tracing::warn!("ClickHouse not reachable at startup: {}", e);
    }

    tracing::info!(
        "Event buffer configured (batch_size: {}, chunk_size: {}, format: {}, parallel: {})",
        config.buffer.batch_size,
        config.buffer.chunk_size,
        config.buffer.format.clickhouse_name(),
        config.buffer.parallel
    );

    let buffer = Arc::new(
        EventBuffer::new(Arc::new(store), Arc::new(sink), config.buffer.clone())
            .context("Invalid event buffer configuration")?,
    );

    let workers = Workers::spawn(buffer.clone(), &config.worker);
    let state = AppState::new(buffer);

    tracing::info!(
        "Starting HTTP server on {}:{}",
        config.http.host,
        config.http.port
    );

    let server_result = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(configure)
    })
    .bind((config.http.host.as_str(), config.http.port))
    .context("Failed to bind HTTP server")?
    .run()
    .await
    .context("HTTP server error");

    workers.shutdown().await;
    server_result
}
