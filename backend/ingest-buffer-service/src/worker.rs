//! Background flush and retry loops.
//!
//! Every replica runs both loops. Flushes go through the buffer's flush lock (or the
//! atomic claim in parallel mode), so running many replicas is safe.

use event_buffer::EventBuffer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::WorkerConfig;

pub struct Workers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    pub fn spawn(buffer: Arc<EventBuffer>, config: &WorkerConfig) -> Self {
        let (shutdown, rx) = watch::channel(false);

        let handles = vec![
            tokio::spawn(flush_loop(
                buffer.clone(),
                Duration::from_millis(config.flush_interval_ms),
                rx.clone(),
            )),
            tokio::spawn(retry_loop(
                buffer,
                Duration::from_millis(config.retry_interval_ms),
                rx,
            )),
        ];

        Self { shutdown, handles }
    }

    /// Stop both loops after their current pass and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker task panicked: {}", e);
            }
        }
        info!("Buffer workers stopped");
    }
}

async fn flush_loop(
    buffer: Arc<EventBuffer>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Starting flush loop (interval: {}ms)", period.as_millis());
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = buffer.try_flush().await {
                    error!("Scheduled flush failed: {}", e);
                }
                if let Err(e) = buffer.get_buffer_stats().await {
                    debug!("Failed to refresh buffer gauges: {}", e);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn retry_loop(
    buffer: Arc<EventBuffer>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Starting retry loop (interval: {}ms)", period.as_millis());
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match buffer.process_retry_buffer().await {
                    Ok(outcome) if outcome.claimed > 0 => {
                        debug!(
                            written = outcome.written,
                            retried = outcome.retried,
                            dead_lettered = outcome.dead_lettered,
                            "Retry pass finished"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!("Retry pass failed: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
