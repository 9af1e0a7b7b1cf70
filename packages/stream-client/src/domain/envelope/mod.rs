//! Inbound Envelopes
//!
//! An [`InboundEnvelope`] is the decoded form of one data frame: the routing
//! key used to pick a callback, plus the raw decoded body. Envelopes are
//! ephemeral and live for a single dispatch cycle.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use serde_json::Value;

use super::subscription::SubscriptionKey;

// =============================================================================
// Callback
// =============================================================================

type CallbackFn = dyn Fn(InboundEnvelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Business handler invoked by the dispatch pool.
///
/// Failures (returned errors and panics) are logged and counted by the
/// dispatch worker; they never reach the read path.
#[derive(Clone)]
pub struct Callback(Arc<CallbackFn>);

impl Callback {
    /// Wrap an async handler.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(InboundEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self(Arc::new(move |envelope| Box::pin(handler(envelope))))
    }

    /// Wrap a synchronous handler.
    ///
    /// The handler runs on a dispatch worker; long blocking work stalls
    /// that worker until it returns.
    pub fn from_fn<F>(handler: F) -> Self
    where
        F: Fn(InboundEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        Self(Arc::new(move |envelope| {
            let handler = Arc::clone(&handler);
            Box::pin(async move { handler(envelope) })
        }))
    }

    /// Invoke the handler.
    pub fn call(&self, envelope: InboundEnvelope) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.0)(envelope)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback(..)")
    }
}

// =============================================================================
// Routing Key
// =============================================================================

/// Identifier extracted from an inbound message to select its callback.
///
/// An empty routing key means the frame carried no recognizable channel
/// (vendor status frames, acks) and is delivered to the default callback.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct RoutingKey(String);

impl RoutingKey {
    /// Create a routing key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Routing key for frames without a channel.
    #[must_use]
    pub const fn unrouted() -> Self {
        Self(String::new())
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check if the frame carried no routing information.
    #[must_use]
    pub fn is_unrouted(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoutingKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RoutingKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&SubscriptionKey> for RoutingKey {
    /// Default mapping: `channel[.instrument]`. Frames routed with an
    /// instrument also carry the bare channel, so a subscription without an
    /// instrument still receives them.
    fn from(key: &SubscriptionKey) -> Self {
        match key.instrument() {
            Some(instrument) => Self(format!("{}.{instrument}", key.channel())),
            None => Self(key.channel().to_string()),
        }
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// A decoded data frame on its way to a callback.
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    routing_key: RoutingKey,
    channel_key: Option<RoutingKey>,
    payload: Value,
    received_at: Instant,
}

impl InboundEnvelope {
    /// Create an envelope stamped with the current instant.
    #[must_use]
    pub fn new(routing_key: RoutingKey, payload: Value) -> Self {
        Self {
            routing_key,
            channel_key: None,
            payload,
            received_at: Instant::now(),
        }
    }

    /// Attach the channel-only key used when no callback matches the full
    /// routing key.
    #[must_use]
    pub fn with_channel_key(mut self, channel_key: RoutingKey) -> Self {
        self.channel_key = Some(channel_key);
        self
    }

    /// Routing key extracted from the frame.
    #[must_use]
    pub const fn routing_key(&self) -> &RoutingKey {
        &self.routing_key
    }

    /// Channel-only key, present when the routing key names an instrument.
    #[must_use]
    pub const fn channel_key(&self) -> Option<&RoutingKey> {
        self.channel_key.as_ref()
    }

    /// Decoded body.
    #[must_use]
    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    /// Consume the envelope and return the decoded body.
    #[must_use]
    pub fn into_payload(self) -> Value {
        self.payload
    }

    /// When the read pump received the frame.
    #[must_use]
    pub const fn received_at(&self) -> Instant {
        self.received_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn routing_key_from_subscription_key() {
        let key = SubscriptionKey::new("ticker").with_instrument("BTCUSD");
        assert_eq!(RoutingKey::from(&key).as_str(), "ticker.BTCUSD");

        let bare = SubscriptionKey::new("heartbeat");
        assert_eq!(RoutingKey::from(&bare).as_str(), "heartbeat");
    }

    #[test]
    fn routing_key_ignores_mode() {
        let key = SubscriptionKey::new("book")
            .with_instrument("XBT/USD")
            .with_mode("depth-10");
        assert_eq!(RoutingKey::from(&key).as_str(), "book.XBT/USD");
    }

    #[test]
    fn unrouted_key() {
        assert!(RoutingKey::unrouted().is_unrouted());
        assert!(!RoutingKey::from("trades").is_unrouted());
    }

    #[test]
    fn envelope_accessors() {
        let envelope = InboundEnvelope::new("trades".into(), json!({"px": 1}));
        assert_eq!(envelope.routing_key().as_str(), "trades");
        assert!(envelope.channel_key().is_none());
        assert_eq!(envelope.payload()["px"], 1);
        assert_eq!(envelope.into_payload(), json!({"px": 1}));
    }
}
