//! Discovery notifications.

use crate::device::NatDevice;
use tokio::sync::broadcast;

/// Something that happened during discovery.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A device was found for the first time.
    DeviceFound(NatDevice),
    /// A searcher failed. Discovery carries on.
    Error {
        searcher: &'static str,
        message: String,
    },
    /// Continuous discovery reached its timeout without finding anything and stopped.
    TimedOut,
}

/// Fan-out of [`DiscoveryEvent`]s to any number of subscribers.
///
/// Publishing never blocks and never fails; subscribers that fall behind
/// miss the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DiscoveryEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: DiscoveryEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(DiscoveryEvent::Error {
            searcher: "upnp",
            message: "boom".into(),
        });
        bus.publish(DiscoveryEvent::TimedOut);

        for rx in [&mut first, &mut second] {
            assert!(matches!(rx.recv().await, Ok(DiscoveryEvent::Error { searcher: "upnp", .. })));
            assert!(matches!(rx.recv().await, Ok(DiscoveryEvent::TimedOut)));
        }
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        EventBus::default().publish(DiscoveryEvent::TimedOut);
    }
}
