//! Boot sequence notifications
//!
//! Storage, ownership and USB transitions are published here so that
//! anything interested (status output, tests) can follow the boot sequence.

pub mod types;

pub use types::SystemEvent;

use tokio::sync::broadcast;

/// Events kept for slow subscribers before they start lagging
const EVENT_BACKLOG: usize = 64;

/// Fan-out of [`SystemEvent`]s to any number of receivers
///
/// Receivers only see events published after they subscribed. One that falls
/// more than 64 events behind gets `RecvError::Lagged` and skips ahead.
///
/// ```no_run
/// use msc_gadget::events::{EventBus, SystemEvent};
///
/// # async fn demo() {
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
/// bus.publish(SystemEvent::StorageUnmounted {
///     mount_point: "/data".to_string(),
/// });
/// assert_eq!(rx.recv().await.unwrap().event_name(), "storage.unmounted");
/// # }
/// ```
pub struct EventBus {
    sender: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BACKLOG);
        Self { sender }
    }

    /// Send `event` to current subscribers; dropped if there are none
    pub fn publish(&self, event: SystemEvent) {
        tracing::trace!("event {}", event.event_name());
        if self.sender.send(event).is_err() {
            tracing::trace!("no event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
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
    async fn test_every_receiver_gets_the_event() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(SystemEvent::RestartRequested {
            source: "gpio".to_string(),
        });

        for rx in [&mut first, &mut second] {
            match rx.recv().await.unwrap() {
                SystemEvent::RestartRequested { source } => assert_eq!(source, "gpio"),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        bus.publish(SystemEvent::UsbTeardown { error: None });

        let mut rx = bus.subscribe();
        bus.publish(SystemEvent::StorageMounted {
            mount_point: "/data".to_string(),
            total_bytes: 4096,
            free_bytes: 2048,
            formatted: false,
        });

        assert_eq!(rx.recv().await.unwrap().event_name(), "storage.mounted");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_receiver_lags() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        for _ in 0..EVENT_BACKLOG + 1 {
            bus.publish(SystemEvent::UsbTeardown { error: None });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
    }
}
