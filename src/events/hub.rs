//! Event hub — per-session pub/sub over Tokio broadcast channels.
//!
//! One channel per session id. Publishing never blocks the orchestrator:
//! subscribers that fall more than the channel capacity behind lag out and
//! miss events instead of applying backpressure.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use uuid::Uuid;

use super::types::SessionEvent;

/// Default per-session channel capacity.
pub const DEFAULT_CAPACITY: usize = 256;

/// Shared reference to EventHub.
pub type SharedEventHub = Arc<EventHub>;

/// Process-wide registry mapping session ids to broadcast channels.
pub struct EventHub {
    channels: RwLock<HashMap<Uuid, broadcast::Sender<SessionEvent>>>,
    capacity: usize,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Create a shared reference to this hub.
    pub fn shared(self) -> SharedEventHub {
        Arc::new(self)
    }

    fn sender(&self, session_id: Uuid) -> broadcast::Sender<SessionEvent> {
        if let Some(sender) = self
            .channels
            .read()
            .expect("event hub lock poisoned")
            .get(&session_id)
        {
            return sender.clone();
        }
        let mut channels = self.channels.write().expect("event hub lock poisoned");
        channels
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish an event to all subscribers of its session. Events published
    /// by a single task arrive at every subscriber in publish order.
    pub fn publish(&self, event: SessionEvent) {
        let session_id = event.session_id();
        let event_type = event.event_type();
        let sender = self.sender(session_id);
        match sender.send(event) {
            Ok(receivers) => {
                tracing::trace!(%session_id, event_type, receivers, "Event published");
            }
            Err(_) => {
                // No receivers — fine, the session may have no watchers yet.
                tracing::trace!(%session_id, event_type, "Event published (no receivers)");
            }
        }
    }

    /// Subscribe to a session's event stream. Only events published after
    /// this call are received.
    pub fn subscribe(&self, session_id: Uuid) -> broadcast::Receiver<SessionEvent> {
        self.sender(session_id).subscribe()
    }

    /// Current subscriber count for a session.
    pub fn subscriber_count(&self, session_id: Uuid) -> usize {
        self.channels
            .read()
            .expect("event hub lock poisoned")
            .get(&session_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    /// Drop a session's channel (terminal transition or deletion). Existing
    /// receivers drain what they already have, then observe closure.
    pub fn remove_session(&self, session_id: Uuid) {
        self.channels
            .write()
            .expect("event hub lock poisoned")
            .remove(&session_id);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn started(session_id: Uuid) -> SessionEvent {
        SessionEvent::SessionStarted {
            session_id,
            timestamp: Utc::now(),
        }
    }

    fn iteration(session_id: Uuid, iteration: u32) -> SessionEvent {
        SessionEvent::IterationStarted {
            session_id,
            iteration,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let hub = EventHub::default();
        let id = Uuid::new_v4();
        let mut rx = hub.subscribe(id);

        hub.publish(started(id));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "session_started");
    }

    #[tokio::test]
    async fn test_fifo_per_session() {
        let hub = EventHub::default();
        let id = Uuid::new_v4();
        let mut rx = hub.subscribe(id);

        for i in 1..=10 {
            hub.publish(iteration(id, i));
        }
        for expected in 1..=10u32 {
            match rx.recv().await.unwrap() {
                SessionEvent::IterationStarted { iteration, .. } => {
                    assert_eq!(iteration, expected)
                }
                other => panic!("unexpected event: {:?}", other.event_type()),
            }
        }
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let hub = EventHub::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = hub.subscribe(a);

        hub.publish(started(b));
        hub.publish(started(a));

        let event = rx_a.recv().await.unwrap();
        assert_eq!(event.session_id(), a);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_mid_join_sees_only_later_events() {
        let hub = EventHub::default();
        let id = Uuid::new_v4();

        // Keep the channel alive while the "early" events are published.
        let _early = hub.subscribe(id);
        hub.publish(iteration(id, 1));

        let mut rx = hub.subscribe(id);
        hub.publish(iteration(id, 2));

        match rx.recv().await.unwrap() {
            SessionEvent::IterationStarted { iteration, .. } => assert_eq!(iteration, 2),
            other => panic!("unexpected event: {:?}", other.event_type()),
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_without_blocking() {
        let hub = EventHub::new(4);
        let id = Uuid::new_v4();
        let mut rx = hub.subscribe(id);

        // Overflow the buffer; publisher never blocks.
        for i in 1..=20 {
            hub.publish(iteration(id, i));
        }

        // The slow reader observes a lag error, then the retained tail.
        let err = rx.recv().await.unwrap_err();
        assert!(matches!(err, broadcast::error::RecvError::Lagged(_)));
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let hub = EventHub::default();
        hub.publish(started(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_remove_session() {
        let hub = EventHub::default();
        let id = Uuid::new_v4();
        let _rx = hub.subscribe(id);
        assert_eq!(hub.subscriber_count(id), 1);

        hub.remove_session(id);
        assert_eq!(hub.subscriber_count(id), 0);
    }

    #[tokio::test]
    async fn test_removed_channel_drains_then_closes() {
        let hub = EventHub::default();
        let id = Uuid::new_v4();
        let mut rx = hub.subscribe(id);

        // Terminal-transition order: publish the last event, then remove.
        hub.publish(started(id));
        hub.remove_session(id);

        assert!(rx.recv().await.is_ok());
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
