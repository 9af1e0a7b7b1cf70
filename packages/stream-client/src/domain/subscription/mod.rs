//! Subscription Registry
//!
//! Durable record of the subscriptions the caller wants, independent of any
//! transport lifetime. The registry is the source of truth for replay after
//! every reconnect.
//!
//! # Design
//!
//! The registry tracks:
//! - Subscription records keyed by composite identity (channel, instrument, mode)
//! - Insertion order, so replay resends requests in the order they were added
//! - A routing-key → callback map consulted by the dispatch pool
//!
//! Adding an existing key replaces its payload and callback in place; it
//! never creates a second entry. Removing a key that is not present is a
//! no-op. The final state therefore depends only on the last operation per key.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde_json::Value;

use super::envelope::{Callback, RoutingKey};

// =============================================================================
// Types
// =============================================================================

/// Composite identity of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    channel: String,
    instrument: Option<String>,
    mode: Option<String>,
}

impl SubscriptionKey {
    /// Create a key for a channel.
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            instrument: None,
            mode: None,
        }
    }

    /// Set the instrument (symbol, pair, contract).
    #[must_use]
    pub fn with_instrument(mut self, instrument: impl Into<String>) -> Self {
        self.instrument = Some(instrument.into());
        self
    }

    /// Set the subscription mode (depth, interval, ...).
    #[must_use]
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    /// Channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Instrument, if any.
    #[must_use]
    pub fn instrument(&self) -> Option<&str> {
        self.instrument.as_deref()
    }

    /// Mode, if any.
    #[must_use]
    pub fn mode(&self) -> Option<&str> {
        self.mode.as_deref()
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.channel)?;
        if let Some(instrument) = &self.instrument {
            write!(f, ".{instrument}")?;
        }
        if let Some(mode) = &self.mode {
            write!(f, ":{mode}")?;
        }
        Ok(())
    }
}

/// Wire operation for a subscription request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionOp {
    /// Start receiving a feed.
    Subscribe,
    /// Stop receiving a feed.
    Unsubscribe,
}

impl SubscriptionOp {
    /// Operation name as sent on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// A desired subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    key: SubscriptionKey,
    payload: Value,
    callback: Option<Callback>,
    private: bool,
}

impl Subscription {
    /// Create a public subscription with an opaque request payload.
    #[must_use]
    pub const fn new(key: SubscriptionKey, payload: Value) -> Self {
        Self {
            key,
            payload,
            callback: None,
            private: false,
        }
    }

    /// Attach a per-subscription callback.
    #[must_use]
    pub fn with_callback(mut self, callback: Callback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Mark the channel as authenticated (requires credentials).
    #[must_use]
    pub const fn private(mut self) -> Self {
        self.private = true;
        self
    }

    /// Identity of the subscription.
    #[must_use]
    pub const fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Opaque request payload.
    #[must_use]
    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    /// Per-subscription callback, if any.
    #[must_use]
    pub const fn callback(&self) -> Option<&Callback> {
        self.callback.as_ref()
    }

    /// Check if the channel requires authentication.
    #[must_use]
    pub const fn is_private(&self) -> bool {
        self.private
    }
}

/// Result of [`SubscriptionRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new key was stored.
    Inserted,
    /// An existing key had its payload and callback replaced.
    Replaced,
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug)]
struct Entry {
    subscription: Subscription,
    routing_key: RoutingKey,
    seq: u64,
}

#[derive(Debug, Default)]
struct Entries {
    by_key: HashMap<SubscriptionKey, Entry>,
    next_seq: u64,
}

/// Durable set of desired subscriptions plus the dispatch callback map.
///
/// Both maps sit behind reader/writer locks; reads (dispatch lookups,
/// replay snapshots) vastly outnumber writes.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<Entries>,
    callbacks: RwLock<HashMap<RoutingKey, Callback>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a subscription under its key.
    ///
    /// Re-adding an existing key replaces payload and callback but keeps its
    /// original replay position.
    pub fn add(&self, subscription: Subscription, routing_key: RoutingKey) -> AddOutcome {
        let callback = subscription.callback().cloned();
        let key = subscription.key().clone();

        let (outcome, previous_route) = {
            let mut entries = self.entries.write();
            let seq = entries.next_seq;

            match entries.by_key.get_mut(&key) {
                Some(entry) => {
                    let previous = std::mem::replace(&mut entry.routing_key, routing_key.clone());
                    entry.subscription = subscription;
                    (AddOutcome::Replaced, Some(previous))
                }
                None => {
                    entries.next_seq += 1;
                    entries.by_key.insert(
                        key,
                        Entry {
                            subscription,
                            routing_key: routing_key.clone(),
                            seq,
                        },
                    );
                    (AddOutcome::Inserted, None)
                }
            }
        };

        if let Some(previous) = previous_route
            && previous != routing_key
        {
            self.rebuild_route(&previous);
        }

        match callback {
            Some(callback) => {
                self.callbacks.write().insert(routing_key, callback);
            }
            None => self.rebuild_route(&routing_key),
        }

        outcome
    }

    /// Remove a subscription by key.
    ///
    /// Returns the removed record, or `None` if the key was not registered.
    pub fn remove(&self, key: &SubscriptionKey) -> Option<Subscription> {
        let removed = self.entries.write().by_key.remove(key)?;
        self.rebuild_route(&removed.routing_key);
        Some(removed.subscription)
    }

    /// Recompute the callback for a routing key from the remaining entries.
    fn rebuild_route(&self, routing_key: &RoutingKey) {
        let replacement = {
            let entries = self.entries.read();
            entries
                .by_key
                .values()
                .filter(|entry| &entry.routing_key == routing_key)
                .max_by_key(|entry| entry.seq)
                .and_then(|entry| entry.subscription.callback().cloned())
        };

        let mut callbacks = self.callbacks.write();
        match replacement {
            Some(callback) => {
                callbacks.insert(routing_key.clone(), callback);
            }
            None => {
                callbacks.remove(routing_key);
            }
        }
    }

    /// Look up the callback registered for a routing key.
    #[must_use]
    pub fn callback_for(&self, routing_key: &RoutingKey) -> Option<Callback> {
        self.callbacks.read().get(routing_key).cloned()
    }

    /// All stored subscriptions in replay order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Subscription> {
        let entries = self.entries.read();
        let mut ordered: Vec<&Entry> = entries.by_key.values().collect();
        ordered.sort_by_key(|entry| entry.seq);
        ordered
            .into_iter()
            .map(|entry| entry.subscription.clone())
            .collect()
    }

    /// Get a stored subscription by key.
    #[must_use]
    pub fn get(&self, key: &SubscriptionKey) -> Option<Subscription> {
        self.entries
            .read()
            .by_key
            .get(key)
            .map(|entry| entry.subscription.clone())
    }

    /// Check if a key is registered.
    #[must_use]
    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries.read().by_key.contains_key(key)
    }

    /// Number of stored subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().by_key.len()
    }

    /// Check if no subscriptions are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().by_key.is_empty()
    }

    /// Drop every subscription and callback.
    pub fn clear(&self) {
        self.entries.write().by_key.clear();
        self.callbacks.write().clear();
    }
}
