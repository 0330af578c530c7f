use prometheus::{Encoder, IntCounter, IntGauge, Opts, TextEncoder};
use tracing::warn;

/// Prometheus instruments for one event buffer, registered in the default registry.
#[derive(Clone)]
pub struct BufferMetrics {
    pub events_added: IntCounter,
    pub add_failures: IntCounter,
    pub events_flushed: IntCounter,
    pub malformed_dropped: IntCounter,
    pub events_retried: IntCounter,
    pub events_dead_lettered: IntCounter,
    pub flush_failures: IntCounter,
    pub queue_size: IntGauge,
    pub retry_queue_size: IntGauge,
    pub dlq_size: IntGauge,
}

fn counter(name: &str, help: &str, buffer: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help).const_label("buffer", buffer.to_string()))
        .expect("valid metric opts for buffer counter")
}

fn gauge(name: &str, help: &str, buffer: &str) -> IntGauge {
    IntGauge::with_opts(Opts::new(name, help).const_label("buffer", buffer.to_string()))
        .expect("valid metric opts for buffer gauge")
}

impl BufferMetrics {
    pub fn new(buffer: &str) -> Self {
        let registry = prometheus::default_registry();

        let metrics = Self {
            events_added: counter(
                "event_buffer_events_added_total",
                "Events accepted into the buffer queue",
                buffer,
            ),
            add_failures: counter(
                "event_buffer_add_failures_total",
                "Events that could not be appended to the buffer queue",
                buffer,
            ),
            events_flushed: counter(
                "event_buffer_events_flushed_total",
                "Events written to the analytical store",
                buffer,
            ),
            malformed_dropped: counter(
                "event_buffer_malformed_dropped_total",
                "Queue entries dropped because they could not be decoded",
                buffer,
            ),
            events_retried: counter(
                "event_buffer_events_retried_total",
                "Events moved to the retry queue after a failed write",
                buffer,
            ),
            events_dead_lettered: counter(
                "event_buffer_events_dead_lettered_total",
                "Events moved to the dead letter queue after exhausting retries",
                buffer,
            ),
            flush_failures: counter(
                "event_buffer_flush_failures_total",
                "Batches whose write to the analytical store failed",
                buffer,
            ),
            queue_size: gauge(
                "event_buffer_queue_size",
                "Events waiting in the main queue",
                buffer,
            ),
            retry_queue_size: gauge(
                "event_buffer_retry_queue_size",
                "Events waiting in the retry queue",
                buffer,
            ),
            dlq_size: gauge(
                "event_buffer_dlq_size",
                "Events parked in the dead letter queue",
                buffer,
            ),
        };

        for metric in [
            Box::new(metrics.events_added.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(metrics.add_failures.clone()),
            Box::new(metrics.events_flushed.clone()),
            Box::new(metrics.malformed_dropped.clone()),
            Box::new(metrics.events_retried.clone()),
            Box::new(metrics.events_dead_lettered.clone()),
            Box::new(metrics.flush_failures.clone()),
            Box::new(metrics.queue_size.clone()),
            Box::new(metrics.retry_queue_size.clone()),
            Box::new(metrics.dlq_size.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register event buffer metric: {}", e);
            }
        }

        metrics
    }
}

/// Render every metric in the default registry in the text exposition format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_exported_with_buffer_label() {
        let metrics = BufferMetrics::new("metrics-test");
        metrics.events_added.inc_by(3);
        metrics.queue_size.set(7);

        let text = gather_text();
        assert!(text.contains("event_buffer_events_added_total{buffer=\"metrics-test\"} 3"));
        assert!(text.contains("event_buffer_queue_size{buffer=\"metrics-test\"} 7"));
    }
}
