//! In-process broadcast bus for live dashboard updates.
//!
//! [`EventBus`] fans every [`LiveEvent`] out to all current subscribers via
//! a `tokio::sync::broadcast` channel. Publishing never fails from the
//! caller's point of view: with no subscribers the event is dropped, and
//! slow subscribers see `RecvError::Lagged` instead of blocking publishers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// A message for connected viewers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveEvent {
    /// Topic name, e.g. `"newEnvironmentData"` or `"alerts"`.
    pub topic: String,

    pub payload: serde_json::Value,

    pub timestamp: DateTime<Utc>,

    /// Device the event is addressed to. `None` means every viewer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl LiveEvent {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
            device_id: None,
        }
    }

    /// An event delivered only to connections registered for `device_id`.
    pub fn for_device(
        device_id: impl Into<String>,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            device_id: Some(device_id.into()),
            ..Self::new(topic, payload)
        }
    }

    /// Whether a connection registered for `device` (if any) should see this event.
    pub fn is_visible_to(&self, device: Option<&str>) -> bool {
        match &self.device_id {
            None => true,
            Some(target) => device == Some(target.as_str()),
        }
    }

    /// Build an event from any serializable payload.
    ///
    /// Payloads that cannot be represented as JSON become `null`.
    pub fn from_serialize<T: Serialize>(topic: impl Into<String>, payload: &T) -> Self {
        Self::new(topic, serde_json::to_value(payload).unwrap_or_default())
    }
}

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out hub shared as `Arc<EventBus>`.
pub struct EventBus {
    sender: broadcast::Sender<LiveEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to every current subscriber. Fire-and-forget.
    pub fn publish(&self, event: LiveEvent) {
        // Err only means there are no receivers right now.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
