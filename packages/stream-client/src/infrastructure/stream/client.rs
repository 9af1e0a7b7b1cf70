//! Stream Client
//!
//! Caller-facing handle over the connection manager.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use stream_client::{
//!     Callback, Protocol, StreamClient, StreamConfig, Subscription, SubscriptionKey, WsConnector,
//! };
//!
//! # async fn run() -> Result<(), stream_client::StreamError> {
//! let config = StreamConfig::new("wss://ws.example.com/v2");
//! let client = StreamClient::new(config, Protocol::new(), Arc::new(WsConnector))?;
//!
//! client.set_default_callback(Callback::from_fn(|envelope| {
//!     println!("{}: {}", envelope.routing_key(), envelope.payload());
//!     Ok(())
//! }));
//! client.connect().await?;
//!
//! let key = SubscriptionKey::new("ticker").with_instrument("BTCUSD");
//! client.subscribe(Subscription::new(key, json!({"symbols": ["BTCUSD"]}))).await?;
//!
//! client.close().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

use super::auth::AuthError;
use super::codec::CodecError;
use super::connection::ConnectionManager;
use super::protocol::Protocol;
use super::reconnect::ReconnectError;
use crate::application::ports::{Connector, Frame, TransportError};
use crate::domain::connection::{ConnectionState, Generation, InvalidTransition};
use crate::domain::envelope::Callback;
use crate::domain::subscription::{Subscription, SubscriptionKey};
use crate::infrastructure::config::{ConfigError, StreamConfig};
use crate::infrastructure::metrics::StatsSnapshot;

// =============================================================================
// Error Type
// =============================================================================

/// Errors surfaced by the stream client.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Initial dial failed after all retries.
    #[error("dial failed after {attempts} retries: {source}")]
    DialExhausted {
        /// Retries used.
        attempts: u32,
        /// Last dial error.
        source: TransportError,
    },

    /// Read or write failed; a reconnect has been started.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A frame could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Login or request signing failed.
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Reconnect gave up; the client is closed.
    #[error("reconnect failed: {0}")]
    ReconnectExhausted(#[from] ReconnectError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A private subscription needs credentials.
    #[error("private subscriptions require credentials")]
    MissingCredentials,

    /// No live connection.
    #[error("not connected")]
    NotConnected,

    /// The client has been closed.
    #[error("client is closed")]
    Closed,

    /// Operation not valid in the current state.
    #[error(transparent)]
    State(#[from] InvalidTransition),
}

impl StreamError {
    /// Check if the client can no longer be used.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::DialExhausted { .. } | Self::ReconnectExhausted(_) | Self::Closed
        )
    }
}

/// Receives terminal and authentication errors.
pub type ErrorCallback = Arc<dyn Fn(&StreamError) + Send + Sync>;

// =============================================================================
// Client
// =============================================================================

/// Resilient subscription stream client.
///
/// Cheap to clone; clones share one connection.
#[derive(Debug, Clone)]
pub struct StreamClient {
    manager: Arc<ConnectionManager>,
}

impl StreamClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Config`] if the configuration is invalid.
    pub fn new(
        config: StreamConfig,
        protocol: Protocol,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        Ok(Self {
            manager: ConnectionManager::new(config, protocol, connector),
        })
    }

    /// Dial the endpoint and start streaming.
    ///
    /// Blocks until the first connection is up and subscriptions registered
    /// so far have been sent. With unbounded retries this waits until a dial
    /// succeeds or the client is closed.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::DialExhausted`] when retries run out (the
    /// client is then closed).
    pub async fn connect(&self) -> Result<(), StreamError> {
        self.manager.connect().await.map(|_| ())
    }

    /// Add or replace a subscription.
    ///
    /// The request is sent immediately when connected and replayed after
    /// every reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::MissingCredentials`] for a private subscription
    /// without credentials, or the write error if sending failed.
    pub async fn subscribe(&self, subscription: Subscription) -> Result<(), StreamError> {
        self.manager.subscribe(subscription).await
    }

    /// Remove a subscription.
    ///
    /// # Errors
    ///
    /// Returns the write error if the unsubscribe request failed.
    pub async fn unsubscribe(&self, key: &SubscriptionKey) -> Result<(), StreamError> {
        self.manager.unsubscribe(key).await
    }

    /// Handle messages that have no per-subscription callback.
    pub fn set_default_callback(&self, callback: Callback) {
        self.manager.set_default_callback(Some(callback));
    }

    /// Receive terminal and authentication errors.
    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: Fn(&StreamError) + Send + Sync + 'static,
    {
        self.manager.set_error_callback(Some(Arc::new(callback)));
    }

    /// Send a frame as-is on the live connection.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::NotConnected`] unless connected.
    pub async fn send_raw(&self, frame: Frame) -> Result<(), StreamError> {
        self.manager.send_raw(frame).await
    }

    /// Force a reconnect of the current connection.
    ///
    /// Returns `false` if a reconnect is already running or the client is
    /// not connected.
    pub fn trigger_reconnect(&self) -> bool {
        self.manager.trigger_reconnect(self.manager.generation())
    }

    /// Close the client. Idempotent.
    pub async fn close(&self) {
        self.manager.close().await;
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Current generation (`0` before the first connect).
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.manager.generation()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.manager.state_receiver()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.manager.stats().snapshot()
    }

    /// Registered subscriptions in registration order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.manager.registry().snapshot()
    }
}
