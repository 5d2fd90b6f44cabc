//! Bounded-wait event delivery to the consumer channel

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{trace, warn};

use crate::event::EslEvent;

/// Pushes decoded events into the consumer's bounded channel.
///
/// A full channel is waited on for at most `wait`; after that the event is
/// dropped so the read loop keeps framing the stream.
pub(crate) struct EventDispatcher {
    tx: mpsc::Sender<EslEvent>,
    wait: Duration,
    dropped: Arc<AtomicU64>,
}

impl EventDispatcher {
    pub(crate) fn new(tx: mpsc::Sender<EslEvent>, wait: Duration, dropped: Arc<AtomicU64>) -> Self {
        Self { tx, wait, dropped }
    }

    /// Deliver one event. Returns `false` once the consumer has gone away.
    pub(crate) async fn deliver(&self, event: EslEvent) -> bool {
        let event = match self
            .tx
            .try_send(event)
        {
            Ok(()) => return true,
            Err(mpsc::error::TrySendError::Closed(_)) => return false,
            Err(mpsc::error::TrySendError::Full(event)) => event,
        };

        let unique_id = event
            .unique_id()
            .unwrap_or("")
            .to_string();
        let event_name = event
            .event_name()
            .unwrap_or("")
            .to_string();
        trace!(event_name = %event_name, "Event queue full, waiting for room");

        match timeout(
            self.wait,
            self.tx
                .send(event),
        )
        .await
        {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                let queued = self
                    .tx
                    .max_capacity()
                    - self
                        .tx
                        .capacity();
                let dropped = self
                    .dropped
                    .fetch_add(1, Ordering::Relaxed)
                    + 1;
                warn!(
                    unique_id = %unique_id,
                    event_name = %event_name,
                    queued,
                    dropped,
                    "Event queue full, dropping event"
                );
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn named(name: &str) -> EslEvent {
        let mut event = EslEvent::new();
        event.set_header("Event-Name".to_string(), name.to_string());
        event.set_header("Unique-ID".to_string(), format!("{}-uuid", name));
        event
    }

    fn dispatcher(capacity: usize, wait_ms: u64) -> (EventDispatcher, mpsc::Receiver<EslEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let dispatcher = EventDispatcher::new(
            tx,
            Duration::from_millis(wait_ms),
            Arc::new(AtomicU64::new(0)),
        );
        (dispatcher, rx)
    }

    fn dropped(dispatcher: &EventDispatcher) -> u64 {
        dispatcher
            .dropped
            .load(Ordering::Relaxed)
    }

    #[tokio::test]
    async fn test_full_channel_drops_after_bounded_wait() {
        let (dispatcher, mut rx) = dispatcher(2, 20);

        for name in ["A", "B"] {
            assert!(dispatcher
                .deliver(named(name))
                .await);
        }

        let started = Instant::now();
        assert!(dispatcher
            .deliver(named("C"))
            .await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(dropped(&dispatcher), 1);

        assert!(rx
            .recv()
            .await
            .unwrap()
            .is_event("A"));
        assert!(dispatcher
            .deliver(named("D"))
            .await);
        assert!(rx
            .recv()
            .await
            .unwrap()
            .is_event("B"));
        assert!(rx
            .recv()
            .await
            .unwrap()
            .is_event("D"));
        assert_eq!(dropped(&dispatcher), 1);
    }

    #[tokio::test]
    async fn test_consumer_drains_during_wait() {
        let (dispatcher, mut rx) = dispatcher(1, 1000);
        dispatcher
            .deliver(named("A"))
            .await;

        let consumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let first = rx
                .recv()
                .await
                .unwrap();
            let second = rx
                .recv()
                .await
                .unwrap();
            (first, second)
        });

        assert!(dispatcher
            .deliver(named("B"))
            .await);
        let (first, second) = consumer
            .await
            .unwrap();
        assert!(first.is_event("A"));
        assert!(second.is_event("B"));
        assert_eq!(dropped(&dispatcher), 0);
    }

    #[tokio::test]
    async fn test_closed_consumer() {
        let (dispatcher, rx) = dispatcher(4, 10);
        drop(rx);
        assert!(!dispatcher
            .deliver(named("A"))
            .await);
        assert_eq!(dropped(&dispatcher), 0);
    }
}
