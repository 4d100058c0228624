//! Client-level event bus.
//!
//! Platform integrations publish reachability and lifecycle changes
//! here; the queue and coordinators subscribe at construction time.
//! Keeping the bus injected rather than global means two clients in
//! one process never observe each other's events.

use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 64;

/// An event published by the platform integration layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// Network reachability flipped.
    ReachabilityChanged {
        /// Whether the network is now reachable.
        reachable: bool,
    },
    /// The application returned to the foreground.
    EnteredForeground,
}

/// Broadcast fan-out for [`ClientEvent`]s.
///
/// Cloning the bus is cheap and shares the channel. Subscribers that
/// lag far enough to overflow the buffer miss events; both consumers
/// in this crate treat every event as a level trigger, so a missed
/// event is recovered by the next one.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    /// Creates a bus with no subscribers.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Publishes an event to all current subscribers.
    pub fn publish(&self, event: ClientEvent) {
        // Err just means nobody is listening right now.
        let _ = self.sender.send(event);
    }

    /// Opens a new subscription starting at the next published event.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
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

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(ClientEvent::EnteredForeground);
        bus.publish(ClientEvent::ReachabilityChanged { reachable: false });
        assert_eq!(rx.recv().await.unwrap(), ClientEvent::EnteredForeground);
        assert_eq!(
            rx.recv().await.unwrap(),
            ClientEvent::ReachabilityChanged { reachable: false }
        );
    }

    #[tokio::test]
    async fn late_subscribers_miss_earlier_events() {
        let bus = EventBus::new();
        bus.publish(ClientEvent::EnteredForeground);
        let mut rx = bus.subscribe();
        bus.publish(ClientEvent::ReachabilityChanged { reachable: true });
        assert_eq!(
            rx.recv().await.unwrap(),
            ClientEvent::ReachabilityChanged { reachable: true }
        );
    }
}
