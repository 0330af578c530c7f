//! Store key layout shared by every worker.

pub const EVENT_QUEUE: &str = "event-buffer";
pub const RETRY_QUEUE: &str = "event-buffer:retry";
pub const DEAD_LETTER_QUEUE: &str = "event-buffer:dlq";

pub const RETRY_COUNTER: &str = "event:retry:count";
pub const DLQ_COUNTER: &str = "event:dlq:count";

/// Events other than session start/end accepted into the queue
pub const TRACKED_COUNTER: &str = "event:buffer:counter";
pub const CSV_INSERT_COUNTER: &str = "event:buffer:csv:counter";
pub const JSON_INSERT_COUNTER: &str = "event:buffer:json:counter";

pub fn last_screen_view(project_id: &str, profile_id: &str) -> String {
    format!("session:last_screen_view:{}:{}", project_id, profile_id)
}

pub fn live_visitors(project_id: &str) -> String {
    format!("live:visitors:{}", project_id)
}

pub fn visitor_heartbeat(project_id: &str, profile_id: &str) -> String {
    format!("live:visitor:{}:{}", project_id, profile_id)
}
