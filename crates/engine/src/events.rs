//! In-process event bus.
//!
//! Fan-out of typed [`ServerEvent`]s to per-subscriber bounded queues. The
//! publisher never blocks on a slow consumer: each subscriber has its own
//! bounded channel and overruns drop the oldest events (tokio broadcast's
//! lagging semantics).

use tokio::sync::broadcast;

use lmx_domain::events::ServerEvent;

pub struct EventBus {
    sender: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(8));
        Self { sender }
    }

    /// Publish to all subscribers. Returns the number that received it.
    pub fn publish(&self, event: ServerEvent) -> usize {
        match self.sender.send(event) {
            Ok(count) => count,
            Err(_) => 0, // no subscribers
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let delivered = bus.publish(ServerEvent::ModelUnloaded {
            model_id: "m".into(),
        });
        assert_eq!(delivered, 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "model_unloaded");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new(8);
        assert_eq!(
            bus.publish(ServerEvent::Heartbeat {
                timestamp: Utc::now()
            }),
            0
        );
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        for i in 0..20 {
            bus.publish(ServerEvent::ModelUnloaded {
                model_id: format!("m{i}"),
            });
        }
        // The receiver lagged; the first recv reports how much was skipped,
        // subsequent recvs see the newest events.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped > 0),
            Ok(_) => panic!("expected lag error"),
            Err(e) => panic!("unexpected error: {e:?}"),
        }
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "model_unloaded");
    }
}
