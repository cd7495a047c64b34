//! Host-facing notifications from refresh engines.
//!
//! Every engine publishes through a shared [`EventDispatcher`]. Events are
//! serializable so a host can log them, forward them, or print them as JSON
//! lines.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use aranet_refresh_types::{DeviceInfo, SensorReading};

/// Default broadcast capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Events emitted by refresh engines.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum DeviceEvent {
    /// A new reading was decoded.
    Reading {
        device: String,
        reading: SensorReading,
    },
    /// The measurement-interval setting text changed.
    IntervalSetting { device: String, text: String },
    /// Cached device information changed.
    DeviceInfoUpdated { device: String, info: DeviceInfo },
    /// The device flipped between available and unavailable.
    AvailabilityChanged {
        device: String,
        available: bool,
        reason: Option<String>,
    },
    /// A cycle failed and a retry was scheduled.
    CycleFailed {
        device: String,
        error: String,
        retry_in_secs: u64,
        failures: u32,
    },
}

impl DeviceEvent {
    /// Identifier of the device the event is about.
    pub fn device(&self) -> &str {
        match self {
            DeviceEvent::Reading { device, .. }
            | DeviceEvent::IntervalSetting { device, .. }
            | DeviceEvent::DeviceInfoUpdated { device, .. }
            | DeviceEvent::AvailabilityChanged { device, .. }
            | DeviceEvent::CycleFailed { device, .. } => device,
        }
    }
}

/// Sender for device events.
pub type EventSender = broadcast::Sender<DeviceEvent>;

/// Receiver for device events.
pub type EventReceiver = broadcast::Receiver<DeviceEvent>;

/// Fan-out of events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a dispatcher with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: DeviceEvent) {
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    /// Number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_to_subscriber() {
        let dispatcher = EventDispatcher::default();
        let mut rx = dispatcher.subscribe();

        dispatcher.send(DeviceEvent::IntervalSetting {
            device: "dev".to_string(),
            text: "5 minutes".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.device(), "dev");
    }

    #[test]
    fn test_send_without_receivers() {
        let dispatcher = EventDispatcher::new(4);
        dispatcher.send(DeviceEvent::CycleFailed {
            device: "dev".to_string(),
            error: "boom".to_string(),
            retry_in_secs: 5,
            failures: 1,
        });
        assert_eq!(dispatcher.receiver_count(), 0);
    }

    #[test]
    fn test_event_json_shape() {
        let event = DeviceEvent::AvailabilityChanged {
            device: "AA:BB".to_string(),
            available: false,
            reason: Some("last seen: 3 minutes ago".to_string()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "availability_changed");
        assert_eq!(json["available"], false);
        assert_eq!(json["reason"], "last seen: 3 minutes ago");
    }
}
