// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lifecycle Notifications
//!
//! Connection and channel lifecycle events (connected, disconnected, channel
//! opened, channel closed) are published through a `Notifier`: an explicit list
//! of subscriber callbacks. Callbacks run on whatever thread raised the event,
//! so they must stay short and must not block.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard,
};

/// Callback invoked when an event fires.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Identifies one subscription so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    callback: Callback,
    once: bool,
}

/// A multi-subscriber callback registry.
#[derive(Default)]
pub struct Notifier {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Notifier {
    pub fn new() -> Self {
        Notifier::default()
    }

    /// Registers a callback invoked every time the event fires.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.push(Arc::new(callback), false)
    }

    /// Registers a callback invoked only the next time the event fires.
    pub fn subscribe_once<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.push(Arc::new(callback), true)
    }

    /// Removes a subscription, returning false if it had already fired or was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        before != subscribers.len()
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fires the event.
    ///
    /// The callbacks are collected under the lock and invoked after releasing it,
    /// so a callback may subscribe or unsubscribe without deadlocking.
    pub fn notify(&self) {
        let callbacks: Vec<Callback> = {
            let mut subscribers = self.lock();
            let callbacks = subscribers.iter().map(|s| s.callback.clone()).collect();
            subscribers.retain(|s| !s.once);
            callbacks
        };

        for callback in callbacks {
            callback();
        }
    }

    fn push(&self, callback: Callback, once: bool) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Subscriber { id, callback, once });
        id
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
