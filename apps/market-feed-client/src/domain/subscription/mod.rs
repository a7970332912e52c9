//! Subscription Tracking Types
//!
//! Domain types for tracking which callbacks are interested in which key
//! (a symbol on the tick channel or on the status channel).
//!
//! # Design
//!
//! A subscription is not an entity of its own: it is membership of a
//! callback in the [`SubscriberSet`] stored under a key. Callback identity
//! is the identity of its `Arc`, so registering the same `Arc` twice is
//! idempotent. Empty sets are removed from the [`SubscriptionRegistry`]
//! as soon as their last callback leaves.
//!
//! Each registration carries a delivery watermark: the sequence number of the
//! last value handed to it. [`Subscriber::deliver`] drops anything at or below
//! the watermark, so values racing in from different threads (a cached replay
//! and a live push) reach one subscription in sequence order only.

use std::cell::Cell;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::ReentrantMutex;

// =============================================================================
// Types
// =============================================================================

/// A subscriber callback for values of type `T`.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Outcome of adding a callback to a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First callback for this key; the key was created.
    NewKey,
    /// Added to an existing key.
    Joined,
    /// The identical callback was already registered; nothing changed.
    Duplicate,
}

// =============================================================================
// Subscriber
// =============================================================================

/// One registration: the callback plus its delivery watermark.
///
/// Clones share the watermark, so a snapshot taken for fan-out and the entry
/// left in the set gate the same deliveries.
pub struct Subscriber<T> {
    callback: Callback<T>,
    delivered: Arc<ReentrantMutex<Cell<u64>>>,
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            callback: Arc::clone(&self.callback),
            delivered: Arc::clone(&self.delivered),
        }
    }
}

impl<T> std::fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("delivered", &self.delivered.lock().get())
            .finish_non_exhaustive()
    }
}

impl<T> Subscriber<T> {
    fn new(callback: Callback<T>) -> Self {
        Self {
            callback,
            delivered: Arc::new(ReentrantMutex::new(Cell::new(0))),
        }
    }

    /// The registered callback.
    #[must_use]
    pub const fn callback(&self) -> &Callback<T> {
        &self.callback
    }

    /// Whether this registration is for exactly `callback`.
    #[must_use]
    pub fn is(&self, callback: &Callback<T>) -> bool {
        Arc::ptr_eq(&self.callback, callback)
    }

    /// Call the callback with `value` unless a value with the same or a
    /// later `sequence` was already delivered. Sequences start at 1.
    ///
    /// Deliveries to one registration never overlap across threads. A
    /// callback re-entering on its own thread sees the watermark already
    /// advanced.
    pub fn deliver(&self, sequence: u64, value: &T) -> bool {
        let delivered = self.delivered.lock();
        if sequence <= delivered.get() {
            return false;
        }
        delivered.set(sequence);
        (self.callback)(value);
        true
    }

    /// Call the callback with `value`, bypassing the watermark.
    pub fn call(&self, value: &T) {
        (self.callback)(value);
    }
}

// =============================================================================
// Subscriber Set
// =============================================================================

/// Set of callbacks registered under one key.
///
/// Insertion order is kept so fan-out order is stable for a given set, but
/// callers must not rely on it.
pub struct SubscriberSet<T> {
    subscribers: Vec<Subscriber<T>>,
}

impl<T> Default for SubscriberSet<T> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }
}

impl<T> std::fmt::Debug for SubscriberSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberSet")
            .field("len", &self.subscribers.len())
            .finish()
    }
}

impl<T> SubscriberSet<T> {
    /// Add a callback. Returns `false` if the identical callback is already present.
    pub fn insert(&mut self, callback: Callback<T>) -> bool {
        if self.contains(&callback) {
            return false;
        }
        self.subscribers.push(Subscriber::new(callback));
        true
    }

    /// Remove a callback. Returns `false` if it was not present.
    pub fn remove(&mut self, callback: &Callback<T>) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| !s.is(callback));
        self.subscribers.len() != before
    }

    /// The registration for `callback`, if present.
    #[must_use]
    pub fn get(&self, callback: &Callback<T>) -> Option<Subscriber<T>> {
        self.subscribers.iter().find(|s| s.is(callback)).cloned()
    }

    /// Check whether the identical callback is registered.
    #[must_use]
    pub fn contains(&self, callback: &Callback<T>) -> bool {
        self.subscribers.iter().any(|s| s.is(callback))
    }

    /// Number of callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Clone the registrations out so they can be invoked without holding a lock.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Subscriber<T>> {
        self.subscribers.clone()
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Map from key to the callbacks registered under it.
///
/// Not synchronised; owners wrap it in a lock.
pub struct SubscriptionRegistry<K, T> {
    sets: HashMap<K, SubscriberSet<T>>,
}

impl<K, T> Default for SubscriptionRegistry<K, T> {
    fn default() -> Self {
        Self {
            sets: HashMap::new(),
        }
    }
}

impl<K: std::fmt::Debug, T> std::fmt::Debug for SubscriptionRegistry<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.sets.iter()).finish()
    }
}

impl<K, T> SubscriptionRegistry<K, T>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` under `key`.
    pub fn add(&mut self, key: &K, callback: Callback<T>) -> Registration {
        if let Some(set) = self.sets.get_mut(key) {
            return if set.insert(callback) {
                Registration::Joined
            } else {
                Registration::Duplicate
            };
        }

        let mut set = SubscriberSet::default();
        set.insert(callback);
        self.sets.insert(key.clone(), set);
        Registration::NewKey
    }

    /// Remove `callback` from `key`, dropping the key once its set is empty.
    ///
    /// Returns `true` if the callback was registered.
    pub fn remove(&mut self, key: &K, callback: &Callback<T>) -> bool {
        let Some(set) = self.sets.get_mut(key) else {
            return false;
        };

        let removed = set.remove(callback);
        if set.is_empty() {
            self.sets.remove(key);
        }
        removed
    }

    /// The registration for `callback` under `key`, if present.
    #[must_use]
    pub fn subscriber(&self, key: &K, callback: &Callback<T>) -> Option<Subscriber<T>> {
        self.sets.get(key).and_then(|set| set.get(callback))
    }

    /// Snapshot of the registrations under `key`.
    #[must_use]
    pub fn subscribers(&self, key: &K) -> Vec<Subscriber<T>> {
        self.sets
            .get(key)
            .map(SubscriberSet::snapshot)
            .unwrap_or_default()
    }

    /// Number of callbacks registered under `key`.
    #[must_use]
    pub fn count(&self, key: &K) -> usize {
        self.sets.get(key).map_or(0, SubscriberSet::len)
    }

    /// Whether any callback is registered under `key`.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.sets.contains_key(key)
    }

    /// Keys with at least one callback.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.sets.keys().cloned().collect()
    }

    /// Drop every key and callback.
    pub fn clear(&mut self) {
        self.sets.clear();
    }

    /// Statistics for this registry.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            key_count: self.sets.len(),
            callback_count: self.sets.values().map(SubscriberSet::len).sum(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics for one registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Number of keys with at least one callback.
    pub key_count: usize,
    /// Total callbacks across all keys.
    pub callback_count: usize,
}

// =============================================================================
// Tests
// =============================================================================
