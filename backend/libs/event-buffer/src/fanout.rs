//! Live notifications for subscribers of the `events` channel.
//!
//! Messages are staged into store transactions rather than sent directly, so a
//! "received" notification commits together with the queue append and all "saved"
//! notifications of a batch go out in one round trip.

use std::fmt;

use crate::error::BufferResult;
use crate::event::{Event, PublicEvent};
use crate::store::StoreTransaction;

pub const EVENTS_CHANNEL: &str = "events";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutKind {
    /// Accepted into the queue
    Received,
    /// Durably written to the analytical store
    Saved,
}

impl FanoutKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FanoutKind::Received => "received",
            FanoutKind::Saved => "saved",
        }
    }
}

impl fmt::Display for FanoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pub/sub channel name for a message kind, e.g. `events:saved`.
pub fn channel_name(channel: &str, kind: FanoutKind) -> String {
    format!("{}:{}", channel, kind)
}

/// Stage a notification carrying the public shape of `event`.
pub fn stage_event(tx: &mut StoreTransaction, kind: FanoutKind, event: &Event) -> BufferResult<()> {
    let payload = serde_json::to_string(&PublicEvent::from(event))?;
    tx.publish(channel_name(EVENTS_CHANNEL, kind), payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures::event;
    use crate::store::StoreOp;

    #[test]
    fn test_channel_names() {
        assert_eq!(channel_name(EVENTS_CHANNEL, FanoutKind::Received), "events:received");
        assert_eq!(channel_name(EVENTS_CHANNEL, FanoutKind::Saved), "events:saved");
    }

    #[test]
    fn test_stage_event_publishes_public_shape() {
        let mut tx = StoreTransaction::new();
        let saved = event("e1", "click", "2024-05-01 10:00:00");
        stage_event(&mut tx, FanoutKind::Saved, &saved).unwrap();

        match &tx.ops()[0] {
            StoreOp::Publish { channel, message } => {
                assert_eq!(channel, "events:saved");
                let value: serde_json::Value = serde_json::from_str(message).unwrap();
                assert_eq!(value["id"], "e1");
                assert_eq!(value["deviceId"], "device-e1");
            }
            other => panic!("unexpected op {:?}", other),
        }
    }
}
