//! Cancellable push subscriptions. A `Subscription` is the handle a consumer
//! holds on a live document or collection feed; cancelling (or dropping) it
//! unregisters the sender so teardown cannot leak stale callbacks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use uuid::Uuid;

/// Fan-out registry: topic key -> (subscriber id -> sender). One registry per
/// snapshot type; the memory backend keeps one for documents and one for
/// collections.
pub struct SubscriberRegistry<T> {
    inner: Arc<Mutex<HashMap<String, HashMap<Uuid, mpsc::UnboundedSender<T>>>>>,
}

impl<T> Clone for SubscriberRegistry<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Default for SubscriberRegistry<T> {
    fn default() -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())) }
    }
}

impl<T: Clone> SubscriberRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber under `key` and returns its handle.
    pub fn subscribe(&self, key: &str) -> Subscription<T> {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().entry(key.to_string()).or_default().insert(id, tx);
        Subscription { key: key.to_string(), id, rx, registry: self.clone() }
    }

    /// Delivers a snapshot to every subscriber of `key`. Subscribers whose
    /// receiver is gone are pruned on the spot.
    pub fn publish(&self, key: &str, snapshot: T) {
        let mut guard = self.lock();
        if let Some(subs) = guard.get_mut(key) {
            subs.retain(|_, tx| tx.send(snapshot.clone()).is_ok());
            if subs.is_empty() {
                guard.remove(key);
            }
        }
    }

    /// Delivers a snapshot to a single subscriber (the initial snapshot on
    /// subscribe).
    pub fn publish_to(&self, key: &str, id: Uuid, snapshot: T) {
        if let Some(tx) = self.lock().get(key).and_then(|subs| subs.get(&id)) {
            let _ = tx.send(snapshot);
        }
    }

}

impl<T> SubscriberRegistry<T> {
    fn unsubscribe(&self, key: &str, id: Uuid) {
        let mut guard = self.lock();
        if let Some(subs) = guard.get_mut(key) {
            subs.remove(&id);
            if subs.is_empty() {
                guard.remove(key);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<Uuid, mpsc::UnboundedSender<T>>>> {
        // Poisoning only happens if a publisher panicked mid-send; the map
        // itself is still consistent, so keep going.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle on a live feed. Snapshots arrive in publication order; `recv`
/// returns `None` once the subscription is cancelled and drained.
pub struct Subscription<T> {
    key: String,
    id: Uuid,
    rx: mpsc::UnboundedReceiver<T>,
    registry: SubscriberRegistry<T>,
}

impl<T: Clone> Subscription<T> {
    /// Next snapshot, waiting if none is queued.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next snapshot if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    /// Stops delivery. Dropping the handle has the same effect.
    pub fn cancel(mut self) {
        self.unregister();
    }

    fn unregister(&mut self) {
        self.registry.unsubscribe(&self.key, self.id);
        self.rx.close();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.registry.unsubscribe(&self.key, self.id);
    }
}
