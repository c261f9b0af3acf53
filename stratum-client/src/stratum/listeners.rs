//! Fan-out of session events to independent consumers.
//!
//! Each event kind has its own [`ListenerSet`]: a keyed set of bounded tokio
//! channels. Publishing walks the current members in registration order and
//! awaits each send before moving on, so every consumer sees events in the
//! same order. The price is head-of-line blocking: one stalled consumer holds
//! up the rest, and the session's dispatch loop with them.

use std::sync::Arc;

use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};
use tokio::sync::mpsc;

use super::messages::{Response, SubmitParams};
use super::work::Work;
use crate::tracing::prelude::*;

new_key_type! {
    /// Identifies one registered listener within its set.
    pub struct ListenerKey;
}

/// A share handed to the pool.
#[derive(Debug, Clone)]
pub struct SubmitEvent {
    /// Message ID of the `submit` request
    pub request_id: u64,
    /// Parameters as sent
    pub params: SubmitParams,
    /// The job the share solves
    pub work: Arc<Work>,
}

/// Thread-safe set of channels receiving one kind of event.
pub struct ListenerSet<T> {
    kind: &'static str,
    members: Mutex<SlotMap<ListenerKey, mpsc::Sender<T>>>,
}

impl<T: Clone + Send> ListenerSet<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            members: Mutex::new(SlotMap::with_key()),
        }
    }

    /// Add a channel to the set.
    pub fn register(&self, tx: mpsc::Sender<T>) -> ListenerKey {
        let key = self.members.lock().insert(tx);
        debug!(kind = self.kind, listeners = self.len(), "Registered listener");
        key
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    /// Send `event` to every member in turn.
    ///
    /// Waits for room in each channel before moving to the next. Members
    /// whose receiver is gone are dropped from the set.
    pub async fn publish(&self, event: T) {
        // Snapshot so registration never waits on a slow consumer.
        let members: Vec<(ListenerKey, mpsc::Sender<T>)> = self
            .members
            .lock()
            .iter()
            .map(|(key, tx)| (key, tx.clone()))
            .collect();

        for (key, tx) in members {
            if tx.send(event.clone()).await.is_err() {
                debug!(kind = self.kind, "Listener went away, removing it");
                self.members.lock().remove(key);
            }
        }
    }
}

/// The three event groups a session publishes to.
pub struct ListenerRegistry {
    pub work: ListenerSet<Arc<Work>>,
    pub submit: ListenerSet<SubmitEvent>,
    pub response: ListenerSet<Response>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            work: ListenerSet::new("work"),
            submit: ListenerSet::new("submit"),
            response: ListenerSet::new("response"),
        }
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
