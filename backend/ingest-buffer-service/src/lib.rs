//! Ingest buffer service: background flush/retry workers plus an admin HTTP API over
//! the shared event buffer.

pub mod config;
pub mod error;
pub mod handlers;
pub mod state;
pub mod worker;

pub use config::ServiceConfig;
pub use error::{Result, ServiceError};
pub use handlers::configure;
pub use state::AppState;
