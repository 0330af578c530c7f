use event_buffer::EventBuffer;
use std::sync::Arc;

/// Shared state handed to every admin handler.
#[derive(Clone)]
pub struct AppState {
    pub buffer: Arc<EventBuffer>,
}

impl AppState {
    pub fn new(buffer: Arc<EventBuffer>) -> Self {
        Self { buffer }
    }
}
