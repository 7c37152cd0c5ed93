//! Best-effort event fan-out to connected dashboard subscribers.
//!
//! The engine only sees the [`Publisher`] capability. [`Fanout`] owns the
//! subscriber set: each subscriber gets a bounded channel, and a subscriber
//! whose channel is full or closed is dropped on the next publish instead
//! of slowing everyone else down. Nothing is queued for late joiners.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::Event;

// ---

/// Capability to push an event to whoever is listening.
pub trait Publisher: Send + Sync {
    fn publish(&self, event: Event);
}

type SubscriberMap = HashMap<Uuid, mpsc::Sender<Arc<Event>>>;

pub struct Fanout {
    subscribers: Mutex<SubscriberMap>,
    buffer: usize,
}

impl Fanout {
    /// `buffer` is the number of undelivered events a subscriber may lag
    /// behind before it is dropped.
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
        })
    }

    fn subscribers(&self) -> MutexGuard<'_, SubscriberMap> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        // ---
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();
        self.subscribers().insert(id, tx);
        debug!("Subscriber {} connected", id);

        Subscription {
            id,
            rx,
            fanout: Arc::downgrade(self),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    /// Drop every subscriber. Their receivers see the stream end.
    pub fn close(&self) {
        let mut subs = self.subscribers();
        debug!("Closing fan-out with {} subscribers", subs.len());
        subs.clear();
    }

    fn unsubscribe(&self, id: &Uuid) {
        self.subscribers().remove(id);
    }
}

impl Publisher for Fanout {
    fn publish(&self, event: Event) {
        // ---
        let event = Arc::new(event);
        self.subscribers()
            .retain(|id, tx| match tx.try_send(Arc::clone(&event)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("Dropping slow subscriber {} (event {})", id, event.event);
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Subscriber {} went away", id);
                    false
                }
            });
    }
}

/// Receiving end of one subscriber. Unsubscribes on drop.
pub struct Subscription {
    id: Uuid,
    rx: mpsc::Receiver<Arc<Event>>,
    fanout: Weak<Fanout>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event, or `None` once this subscriber was dropped from the set.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.rx.try_recv().ok()
    }

    /// Everything currently buffered.
    pub fn drain(&mut self) -> Vec<Arc<Event>> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(fanout) = self.fanout.upgrade() {
            fanout.unsubscribe(&self.id);
        }
    }
}
