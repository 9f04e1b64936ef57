//! Internal event bus.
//!
//! The engine publishes state changes here; the SSE feed subscribes one
//! receiver per browser. Lagging subscribers lose events rather than slow
//! the publisher (the broadcast channel drops from the tail), which is the
//! slow-client policy the web feed wants anyway.

use serde::Serialize;
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 256;

/// SSE event types.
pub const STATION_UPDATE: &str = "station_update";
pub const WEATHER_UPDATE: &str = "weather_update";
pub const MESSAGE_RECEIVED: &str = "message_received";
pub const GPS_UPDATE: &str = "gps_update";

#[derive(Clone, Debug)]
pub struct Event {
    pub kind: &'static str,
    pub data: serde_json::Value,
}

#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    pub fn publish<T: Serialize>(&self, kind: &'static str, data: &T) {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(error) => {
                tracing::error!(?error, kind, "failed to serialize event");
                return;
            }
        };
        // a send error only means nobody is listening
        let _ = self.sender.send(Event { kind, data });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_subscribers() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();
        bus.publish(STATION_UPDATE, &serde_json::json!({"callsign": "W1AW"}));
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.kind, STATION_UPDATE);
        assert_eq!(event.data["callsign"], "W1AW");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(GPS_UPDATE, &serde_json::json!({}));
    }
}
