use tokio::sync::broadcast;

use geocopilot_types::EngineEvent;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(event_type = %event.event_type, "engine event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_see_events_in_publish_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::new("run.started", json!({"runID": "r1"})));
        bus.publish(EngineEvent::new("run.finished", json!({"runID": "r1"})));
        assert_eq!(rx.recv().await.expect("first").event_type, "run.started");
        assert_eq!(rx.recv().await.expect("second").event_type, "run.finished");
    }
}
