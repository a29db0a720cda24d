//! Telemetry lifecycle notifications

use tokio::sync::broadcast;

use crate::events::EventType;

/// Namespace of events emitted by this crate
pub const TELEMETRY_NAMESPACE: &str = "telemetry";

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// A record was persisted
    Saved { eid: EventType, mid: String },
    /// A sync cycle uploaded events
    Synced { synced_event_count: u64, sync_time: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusEvent {
    pub namespace: &'static str,
    pub event: TelemetryEvent,
}

impl BusEvent {
    pub fn telemetry(event: TelemetryEvent) -> Self {
        Self {
            namespace: TELEMETRY_NAMESPACE,
            event,
        }
    }
}

/// Fire-and-forget notification sink
pub trait EventBus: Send + Sync {
    fn emit(&self, event: BusEvent);
}

/// Event bus over a tokio broadcast channel
#[derive(Debug)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus for BroadcastEventBus {
    fn emit(&self, event: BusEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives_events() {
        let bus = BroadcastEventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(BusEvent::telemetry(TelemetryEvent::Saved {
            eid: EventType::Log,
            mid: "LOG:1".to_string(),
        }));

        assert_eq!(first.recv().await.unwrap().namespace, "telemetry");
        assert!(matches!(
            second.recv().await.unwrap().event,
            TelemetryEvent::Saved { eid: EventType::Log, .. }
        ));
    }

    #[test]
    fn test_emit_without_subscribers() {
        BroadcastEventBus::new(4).emit(BusEvent::telemetry(TelemetryEvent::Synced {
            synced_event_count: 1,
            sync_time: 0,
        }));
    }
}
