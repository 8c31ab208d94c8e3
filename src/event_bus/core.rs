//! Generic event bus core.
//!
//! A subscriber callback returns `true` to stay subscribed or `false` to be
//! removed after delivery, which is how one-shot subscriptions are realized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Identifies a subscription for later removal
pub type SubscriptionId = u64;

/// Event bus statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBusStats {
    pub subscriber_count: usize,
    pub events_published: u64,
}

struct Subscriber<T> {
    callback: Box<dyn Fn(&T) -> bool + Send + Sync>,
    filter: Option<Box<dyn Fn(&T) -> bool + Send + Sync>>,
}

/// Single-threaded event bus state; wrap in [`EventBusContainer`] for shared
/// use
pub struct EventBus<T> {
    subscribers: HashMap<SubscriptionId, Subscriber<T>>,
    next_id: SubscriptionId,
    events_published: u64,
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self {
            subscribers: HashMap::new(),
            next_id: 1,
            events_published: 0,
        }
    }

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.insert(
            id,
            Subscriber {
                callback: Box::new(callback),
                filter: None,
            },
        );
        id
    }

    pub fn subscribe_with_filter<F, P>(&mut self, callback: F, filter: P) -> SubscriptionId
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let id = self.subscribe(callback);
        if let Some(subscriber) = self.subscribers.get_mut(&id) {
            subscriber.filter = Some(Box::new(filter));
        }
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Deliver an event to every matching subscriber, removing the ones that
    /// asked to be dropped
    pub fn publish(&mut self, event: &T) {
        self.events_published += 1;

        let mut expired = Vec::new();
        for (id, subscriber) in &self.subscribers {
            if let Some(filter) = &subscriber.filter {
                if !filter(event) {
                    continue;
                }
            }
            if !(subscriber.callback)(event) {
                expired.push(*id);
            }
        }
        for id in expired {
            self.subscribers.remove(&id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            subscriber_count: self.subscribers.len(),
            events_published: self.events_published,
        }
    }

    pub fn clear(&mut self) {
        self.subscribers.clear();
    }
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe, cloneable handle around an [`EventBus`]
pub struct EventBusContainer<T> {
    inner: Arc<Mutex<EventBus<T>>>,
}

impl<T> Clone for EventBusContainer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> EventBusContainer<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventBus::new())),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.inner.lock().unwrap().subscribe(callback)
    }

    pub fn subscribe_with_filter<F, P>(&self, callback: F, filter: P) -> SubscriptionId
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .unwrap()
            .subscribe_with_filter(callback, filter)
    }

    /// Subscribe for a single event; the subscription is removed after the
    /// first delivery
    pub fn subscribe_once<F>(&self, callback: F) -> SubscriptionId
    where
        F: FnOnce(&T) + Send + Sync + 'static,
    {
        let slot = Mutex::new(Some(callback));
        self.subscribe(move |event| {
            if let Some(callback) = slot.lock().unwrap().take() {
                callback(event);
            }
            false
        })
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.lock().unwrap().unsubscribe(id)
    }

    pub fn publish(&self, event: T) {
        self.inner.lock().unwrap().publish(&event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscriber_count()
    }

    pub fn stats(&self) -> EventBusStats {
        self.inner.lock().unwrap().stats()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

impl<T> Default for EventBusContainer<T> {
    fn default() -> Self {
        Self::new()
    }
}
