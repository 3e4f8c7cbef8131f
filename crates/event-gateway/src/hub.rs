use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chess_domain::{EventSink, ServerEvent, SubscriberId};
use tokio::sync::mpsc;
use tracing::debug;

const DEFAULT_STREAM_CAPACITY: usize = 64;

/// Per-subscriber outbound channels. Rooms address events by subscriber
/// handle; the hub owns the only mapping from handles to live channels.
/// Subscribers that stop draining are dropped rather than allowed to
/// block a room's fan-out.
#[derive(Debug)]
pub struct SubscriberHub {
    channels: Mutex<HashMap<SubscriberId, mpsc::Sender<ServerEvent>>>,
    capacity: usize,
    slow_disconnects: Mutex<u64>,
}

impl Default for SubscriberHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberHub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: DEFAULT_STREAM_CAPACITY,
            slow_disconnects: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            slow_disconnects: Mutex::new(0),
        }
    }

    pub fn register(&self) -> (SubscriberId, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let subscriber = SubscriberId::new();
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subscriber, tx);
        (subscriber, rx)
    }

    pub fn unregister(&self, subscriber: &SubscriberId) {
        let _ = self.channels.lock().unwrap_or_else(PoisonError::into_inner).remove(subscriber);
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn slow_disconnect_count(&self) -> u64 {
        *self.slow_disconnects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventSink for SubscriberHub {
    fn deliver(&self, to: &SubscriberId, event: &ServerEvent) {
        let mut guard = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.get(to) else {
            return;
        };
        match sender.try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                guard.remove(to);
                *self.slow_disconnects.lock().unwrap_or_else(PoisonError::into_inner) += 1;
                debug!(subscriber = %to.0, "dropping slow subscriber");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                guard.remove(to);
            }
        }
    }
}
