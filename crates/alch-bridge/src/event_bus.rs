use std::sync::{Arc, Mutex};

use crate::protocol::Event;

/// A broadcast-style event bus built on flume channels.
///
/// Each [`subscribe`] call creates a receiver that observes every event
/// published afterwards. The bus clones cheaply (its internals live behind
/// an `Arc`), so any component can hold a handle and push.
///
/// [`subscribe`]: EventBus::subscribe
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> flume::Receiver<Event> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.push(tx);
        rx
    }

    /// Publish an event to every current subscriber.
    ///
    /// Subscribers whose receivers have been dropped are pruned.
    pub fn publish(&self, event: Event) {
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("EventBus lock poisoned").len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
