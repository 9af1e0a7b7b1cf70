//! Connection Manager
//!
//! Owns the connection state machine and the generation counter, dials and
//! redials the transport, and starts the per-generation loops.
//!
//! # Lifecycle
//!
//! ```text
//! connect() ─► dial (backoff) ─► establish(gen N)
//!                                  ├─ install sink in the write serializer
//!                                  ├─ spawn read pump (gen N)
//!                                  ├─ login (optional, may await ack)
//!                                  ├─ replay subscriptions
//!                                  └─ spawn heartbeat monitor (gen N)
//!
//! read error | write error | heartbeat timeout
//!   └─► trigger_reconnect(gen N) ─► Reconnecting, cancel gen N token
//!         └─► reconnect task: retire sink, backoff, dial, establish(gen N+1)
//! ```
//!
//! A reconnect request is accepted only while `Connected` and only from the
//! current generation, so concurrent failure signals collapse into one
//! reconnect sequence. All state changes happen under one lock.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::auth::{AuthError, AuthFailurePolicy, HmacAuth};
use super::client::{ErrorCallback, StreamError};
use super::dispatch::{self, DefaultCallback, DispatchPool, DispatchQueue};
use super::heartbeat::{HeartbeatConfig, HeartbeatMonitor, Liveness, ProbeTarget};
use super::protocol::Protocol;
use super::reader::ReadPump;
use super::reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
use super::writer::{Refused, WriteFailure, WriteSerializer};
use crate::application::ports::{Connector, Frame, SplitTransport, TransportError};
use crate::domain::connection::{ConnectionEvent, ConnectionState, Generation};
use crate::domain::subscription::{Subscription, SubscriptionKey, SubscriptionOp, SubscriptionRegistry};
use crate::infrastructure::config::StreamConfig;
use crate::infrastructure::metrics::{
    ClientStats, record_dial_failure, set_connection_state, set_subscriptions,
};

// =============================================================================
// State
// =============================================================================

struct Inner {
    state: ConnectionState,
    generation: Generation,
    token: CancellationToken,
}

struct PendingLogin {
    generation: Generation,
    tx: oneshot::Sender<Result<(), AuthError>>,
}

/// Shared core behind [`super::client::StreamClient`].
pub struct ConnectionManager {
    id: Uuid,
    me: Weak<Self>,
    config: StreamConfig,
    protocol: Protocol,
    connector: Arc<dyn Connector>,

    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    policy: Mutex<ReconnectPolicy>,

    registry: Arc<SubscriptionRegistry>,
    /// Generation whose replay has completed.
    replayed: AsyncMutex<Generation>,
    pending_login: Mutex<Option<PendingLogin>>,

    writer: WriteSerializer,
    liveness: Arc<Liveness>,
    dispatch: DispatchQueue,
    pool: Mutex<Option<DispatchPool>>,
    default_callback: DefaultCallback,
    error_callback: RwLock<Option<ErrorCallback>>,

    stats: Arc<ClientStats>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("id", &self.id)
            .field("url", &self.config.url)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager. Nothing is dialed until [`Self::connect`].
    #[must_use]
    pub fn new(config: StreamConfig, protocol: Protocol, connector: Arc<dyn Connector>) -> Arc<Self> {
        let registry = Arc::new(SubscriptionRegistry::new());
        let stats = Arc::new(ClientStats::new());
        let default_callback: DefaultCallback = Arc::new(RwLock::new(None));
        let (queue, pool) = dispatch::channel(
            config.dispatch_queue_size,
            Arc::clone(&registry),
            Arc::clone(&default_callback),
            Arc::clone(&stats),
        );
        let shutdown = CancellationToken::new();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Arc::new_cyclic(|me| Self {
            id: Uuid::new_v4(),
            me: me.clone(),
            policy: Mutex::new(ReconnectPolicy::new(ReconnectConfig::from_stream_config(&config))),
            writer: WriteSerializer::new(config.write_timeout),
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                generation: Generation::NONE,
                token: shutdown.child_token(),
            }),
            state_tx,
            registry,
            replayed: AsyncMutex::new(Generation::NONE),
            pending_login: Mutex::new(None),
            liveness: Arc::new(Liveness::new()),
            dispatch: queue,
            pool: Mutex::new(Some(pool)),
            default_callback,
            error_callback: RwLock::new(None),
            stats,
            shutdown,
            tracker: TaskTracker::new(),
            config,
            protocol,
            connector,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Current generation.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.inner.lock().generation
    }

    /// Check whether `generation` has been replaced.
    #[must_use]
    pub fn is_stale(&self, generation: Generation) -> bool {
        generation.is_stale(self.generation())
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Registered subscriptions.
    #[must_use]
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Per-client counters.
    #[must_use]
    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    pub(crate) const fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub(crate) const fn dispatch(&self) -> &DispatchQueue {
        &self.dispatch
    }

    pub(crate) fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    pub(crate) fn set_default_callback(&self, callback: Option<crate::domain::envelope::Callback>) {
        *self.default_callback.write() = callback;
    }

    pub(crate) fn set_error_callback(&self, callback: Option<ErrorCallback>) {
        *self.error_callback.write() = callback;
    }

    fn connected_generation(&self) -> Option<Generation> {
        let inner = self.inner.lock();
        inner.state.is_connected().then_some(inner.generation)
    }

    fn publish(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
        set_connection_state(state);
    }

    fn report(&self, error: &StreamError) {
        let callback = self.error_callback.read().clone();
        if let Some(callback) = callback {
            callback(error);
        }
    }

    // =========================================================================
    // Connect
    // =========================================================================

    /// Dial the first connection, retrying with backoff.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::DialExhausted`] once retries are used up (the
    /// client is then closed), [`StreamError::Closed`] if the client was
    /// closed meanwhile, or [`StreamError::State`] if already connected.
    pub async fn connect(self: &Arc<Self>) -> Result<Generation, StreamError> {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_closed() {
                return Err(StreamError::Closed);
            }
            inner.state = inner.state.transition(ConnectionEvent::Connect)?;
            self.publish(inner.state);
        }

        tracing::info!(client = %self.id, url = %self.config.url, "Connecting to stream");
        self.start_dispatch();

        loop {
            match self.dial().await {
                Ok(transport) => {
                    self.policy.lock().reset();
                    return self.establish(transport).await;
                }
                Err(error) => {
                    if self.shutdown.is_cancelled() {
                        return Err(StreamError::Closed);
                    }

                    let (delay, attempts) = {
                        let mut policy = self.policy.lock();
                        (policy.next_delay(), policy.attempt_count())
                    };
                    let Some(delay) = delay else {
                        self.exhaust().await;
                        tracing::error!(client = %self.id, attempts, error = %error, "Initial dial exhausted retries");
                        return Err(StreamError::DialExhausted {
                            attempts,
                            source: error,
                        });
                    };

                    tracing::info!(
                        attempt = attempts,
                        delay_ms = delay.as_millis(),
                        "Retrying initial dial"
                    );
                    tokio::select! {
                        () = self.shutdown.cancelled() => return Err(StreamError::Closed),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn start_dispatch(&self) {
        if let Some(pool) = self.pool.lock().take() {
            pool.spawn(self.config.worker_count, &self.tracker, &self.shutdown);
        }
    }

    async fn dial(&self) -> Result<SplitTransport, TransportError> {
        self.stats.record_dial();
        tracing::debug!(url = %self.config.url, "Dialing");

        let deadline = self.config.dial_timeout;
        let result = tokio::select! {
            () = self.shutdown.cancelled() => Err(TransportError::Closed),
            result = tokio::time::timeout(deadline, self.connector.connect(&self.config.url)) => {
                result.unwrap_or(Err(TransportError::DialTimeout(deadline)))
            }
        };

        if let Err(e) = &result {
            record_dial_failure(e.kind());
            tracing::warn!(url = %self.config.url, error = %e, "Dial failed");
        }
        result
    }

    /// Bring up a new generation on a freshly dialed transport.
    async fn establish(self: &Arc<Self>, transport: SplitTransport) -> Result<Generation, StreamError> {
        let (sink, source) = transport;

        let started = {
            let mut inner = self.inner.lock();
            match inner.state.transition(ConnectionEvent::DialSucceeded) {
                Ok(next) => {
                    inner.state = next;
                    inner.generation = inner.generation.next();
                    inner.token = self.shutdown.child_token();
                    self.publish(next);
                    Some((inner.generation, inner.token.clone()))
                }
                Err(_) => None,
            }
        };

        let Some((generation, token)) = started else {
            self.writer.close_sink(sink).await;
            return Err(StreamError::Closed);
        };

        match self.writer.install(generation, sink).await {
            Ok(Some(previous)) => self.writer.close_sink(previous).await,
            Ok(None) => {}
            Err(Refused(sink)) => {
                self.writer.close_sink(sink).await;
                return Err(StreamError::Closed);
            }
        }

        self.stats.record_connect(generation);
        self.liveness.reset();
        tracing::info!(client = %self.id, %generation, "Stream connected");

        let pump = ReadPump::new(Arc::clone(self), source, generation, token.clone());
        self.tracker.spawn(pump.run());

        self.login(generation, &token).await;
        self.replay(generation).await;

        let monitor = HeartbeatMonitor::new(
            HeartbeatConfig::from_stream_config(&self.config),
            Arc::clone(&self.liveness),
            Arc::clone(self),
            generation,
            token,
        );
        self.tracker.spawn(monitor.run());

        Ok(generation)
    }

    // =========================================================================
    // Login
    // =========================================================================

    async fn login(&self, generation: Generation, token: &CancellationToken) {
        let Some(auth) = self.protocol.auth().copied() else {
            return;
        };

        let request = match self
            .protocol
            .login_request(self.config.credentials.as_ref(), chrono::Utc::now().timestamp())
        {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                self.auth_failed(generation, auth, e);
                return;
            }
        };

        let ack = auth.awaits_ack().then(|| {
            let (tx, rx) = oneshot::channel();
            *self.pending_login.lock() = Some(PendingLogin { generation, tx });
            rx
        });

        if let Err(e) = self.write(Some(generation), Frame::Text(request)).await {
            self.pending_login.lock().take();
            tracing::warn!(%generation, error = %e, "Failed to send login frame");
            return;
        }

        let Some(rx) = ack else {
            tracing::debug!(%generation, "Login sent without awaiting acknowledgement");
            return;
        };

        let timeout = self.config.login_timeout;
        let outcome = tokio::select! {
            () = token.cancelled() => Err(AuthError::Interrupted),
            result = tokio::time::timeout(timeout, rx) => match result {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(AuthError::Interrupted),
                Err(_) => Err(AuthError::Timeout(timeout)),
            },
        };

        {
            let mut pending = self.pending_login.lock();
            if pending.as_ref().is_some_and(|p| p.generation == generation) {
                pending.take();
            }
        }

        match outcome {
            Ok(()) => tracing::info!(%generation, "Login acknowledged"),
            Err(AuthError::Interrupted) => {
                tracing::debug!(%generation, "Login interrupted by reconnect");
            }
            Err(e) => self.auth_failed(generation, auth, e),
        }
    }

    fn auth_failed(&self, generation: Generation, auth: HmacAuth, error: AuthError) {
        tracing::warn!(%generation, error = %error, "Authentication failed");
        self.report(&StreamError::Auth(error));
        if auth.failure_policy() == AuthFailurePolicy::Reconnect {
            self.trigger_reconnect(generation);
        }
    }

    /// Deliver a login acknowledgement read on `generation`.
    pub(crate) fn login_result(&self, generation: Generation, result: Result<(), AuthError>) {
        let pending = {
            let mut pending = self.pending_login.lock();
            if pending.as_ref().is_some_and(|p| p.generation == generation) {
                pending.take()
            } else {
                None
            }
        };

        match (pending, result) {
            (Some(pending), result) => {
                let _ = pending.tx.send(result);
            }
            (None, Ok(())) => tracing::info!(%generation, "Login acknowledged"),
            (None, Err(e)) => {
                if let Some(auth) = self.protocol.auth().copied() {
                    self.auth_failed(generation, auth, e);
                }
            }
        }
    }

    /// Fail a pending login on `generation`. Returns `false` if none waits.
    pub(crate) fn reject_pending_login(&self, generation: Generation, error: AuthError) -> bool {
        let pending = {
            let mut pending = self.pending_login.lock();
            if pending.as_ref().is_some_and(|p| p.generation == generation) {
                pending.take()
            } else {
                None
            }
        };

        pending.is_some_and(|pending| {
            let _ = pending.tx.send(Err(error));
            true
        })
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    async fn replay(&self, generation: Generation) {
        let mut replayed = self.replayed.lock().await;
        if self.is_stale(generation) {
            return;
        }

        let subscriptions = self.registry.snapshot();
        let mut sent = 0_usize;
        for subscription in &subscriptions {
            match self
                .send_request(SubscriptionOp::Subscribe, subscription, generation)
                .await
            {
                Ok(()) => sent += 1,
                Err(StreamError::Auth(e)) => {
                    tracing::warn!(key = %subscription.key(), error = %e, "Skipping subscription during replay");
                    self.report(&StreamError::Auth(e));
                }
                Err(e) => {
                    tracing::debug!(%generation, error = %e, "Replay interrupted");
                    return;
                }
            }
        }

        *replayed = generation;
        tracing::info!(%generation, subscriptions = sent, "Subscriptions replayed");
    }

    async fn send_request(
        &self,
        op: SubscriptionOp,
        subscription: &Subscription,
        generation: Generation,
    ) -> Result<(), StreamError> {
        let request = self.protocol.encode_request(
            op,
            subscription,
            self.config.credentials.as_ref(),
            chrono::Utc::now().timestamp(),
        )?;
        self.write(Some(generation), Frame::Text(request)).await?;
        Ok(())
    }

    /// Register a subscription and send it if the connection is live.
    ///
    /// # Errors
    ///
    /// Returns an error for a private subscription without credentials, a
    /// closed client, or a failed write (the subscription is kept and sent
    /// again on replay).
    pub async fn subscribe(&self, subscription: Subscription) -> Result<(), StreamError> {
        if self.state().is_closed() {
            return Err(StreamError::Closed);
        }
        if subscription.is_private() && self.config.credentials.is_none() {
            return Err(StreamError::MissingCredentials);
        }

        let routing_key = self.protocol.routing_key(subscription.key());
        let replayed = self.replayed.lock().await;
        let outcome = self.registry.add(subscription.clone(), routing_key);
        set_subscriptions(self.registry.len());
        tracing::debug!(key = %subscription.key(), ?outcome, "Subscription registered");

        match self.connected_generation() {
            Some(generation) if *replayed == generation => {
                self.send_request(SubscriptionOp::Subscribe, &subscription, generation)
                    .await
            }
            _ => Ok(()),
        }
    }

    /// Remove a subscription and send an unsubscribe if the connection is live.
    ///
    /// # Errors
    ///
    /// Returns an error for a closed client or a failed write.
    pub async fn unsubscribe(&self, key: &SubscriptionKey) -> Result<(), StreamError> {
        if self.state().is_closed() {
            return Err(StreamError::Closed);
        }

        let replayed = self.replayed.lock().await;
        let Some(removed) = self.registry.remove(key) else {
            return Ok(());
        };
        set_subscriptions(self.registry.len());
        tracing::debug!(%key, "Subscription removed");

        match self.connected_generation() {
            Some(generation) if *replayed == generation => {
                self.send_request(SubscriptionOp::Unsubscribe, &removed, generation)
                    .await
            }
            _ => Ok(()),
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write through the serializer; transport failures trigger a reconnect.
    pub(crate) async fn write(
        &self,
        expected: Option<Generation>,
        frame: Frame,
    ) -> Result<Generation, StreamError> {
        match self.writer.write(expected, frame).await {
            Ok(generation) => Ok(generation),
            Err(WriteFailure::NotConnected | WriteFailure::Stale { .. }) => {
                Err(StreamError::NotConnected)
            }
            Err(WriteFailure::Transport { generation, error }) => {
                tracing::warn!(%generation, error = %error, "Write failed");
                self.trigger_reconnect(generation);
                Err(StreamError::Transport(error))
            }
        }
    }

    /// Send a caller-built frame on the live connection.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::NotConnected`] unless connected, or the
    /// transport error if the write fails.
    pub async fn send_raw(&self, frame: Frame) -> Result<(), StreamError> {
        if self.state().is_closed() {
            return Err(StreamError::Closed);
        }
        let generation = self.connected_generation().ok_or(StreamError::NotConnected)?;
        self.write(Some(generation), frame).await?;
        Ok(())
    }

    // =========================================================================
    // Reconnect
    // =========================================================================

    /// Request a reconnect of `from`.
    ///
    /// Only the first request for the current generation while connected
    /// starts a reconnect; every other call is a no-op returning `false`.
    pub fn trigger_reconnect(&self, from: Generation) -> bool {
        let Some(me) = self.me.upgrade() else {
            return false;
        };

        let token = {
            let mut inner = self.inner.lock();
            if inner.generation != from {
                return false;
            }
            let Ok(next) = inner.state.transition(ConnectionEvent::Failure) else {
                return false;
            };
            inner.state = next;
            self.publish(next);
            inner.token.clone()
        };

        token.cancel();
        self.stats.record_reconnect();
        tracing::warn!(client = %self.id, generation = %from, "Connection lost, reconnecting");

        self.tracker.spawn(async move { me.reconnect(from).await });
        true
    }

    async fn reconnect(self: Arc<Self>, from: Generation) {
        if let Some(sink) = self.writer.retire(from).await {
            self.writer.close_sink(sink).await;
        }

        loop {
            let (delay, attempt) = {
                let mut policy = self.policy.lock();
                (policy.next_delay(), policy.attempt_count())
            };

            let Some(delay) = delay else {
                if self.exhaust().await {
                    tracing::error!(client = %self.id, attempts = attempt, "Reconnect attempts exhausted");
                    self.report(&StreamError::ReconnectExhausted(
                        ReconnectError::MaxAttemptsExceeded(attempt),
                    ));
                }
                return;
            };

            tracing::info!(attempt, delay_ms = delay.as_millis(), "Reconnecting to stream");
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }

            if let Ok(transport) = self.dial().await {
                self.policy.lock().reset();
                if let Err(e) = self.establish(transport).await {
                    tracing::debug!(error = %e, "Reconnect abandoned");
                }
                return;
            }
            if self.shutdown.is_cancelled() {
                return;
            }
        }
    }

    /// Move to `Closed` after running out of retries.
    async fn exhaust(&self) -> bool {
        let moved = {
            let mut inner = self.inner.lock();
            match inner.state.transition(ConnectionEvent::Exhausted) {
                Ok(next) => {
                    inner.state = next;
                    self.publish(next);
                    true
                }
                Err(_) => false,
            }
        };

        self.shutdown.cancel();
        if let Some(sink) = self.writer.shutdown().await {
            self.writer.close_sink(sink).await;
        }
        moved
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Close the client and wait (bounded) for background tasks.
    pub async fn close(&self) {
        let first = {
            let mut inner = self.inner.lock();
            match inner.state.transition(ConnectionEvent::Close) {
                Ok(next) => {
                    inner.state = next;
                    self.publish(next);
                    true
                }
                Err(_) => false,
            }
        };

        self.shutdown.cancel();
        self.tracker.close();
        self.pending_login.lock().take();

        if let Some(sink) = self.writer.shutdown().await {
            self.writer.close_sink(sink).await;
        }

        if tokio::time::timeout(self.config.close_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                client = %self.id,
                timeout_ms = self.config.close_timeout.as_millis(),
                "Background tasks still running after close timeout"
            );
        }

        if first {
            tracing::info!(client = %self.id, "Stream client closed");
        }
    }
}

// =============================================================================
// Heartbeat Target
// =============================================================================

#[async_trait]
impl ProbeTarget for ConnectionManager {
    async fn send_probe(&self, generation: Generation) -> bool {
        let now = chrono::Utc::now().timestamp_millis();
        for frame in self.protocol.heartbeat().probe_frames(now) {
            if self.write(Some(generation), frame).await.is_err() {
                return false;
            }
        }
        true
    }

    fn liveness_expired(&self, generation: Generation, silence: Duration) {
        tracing::warn!(%generation, silence_ms = silence.as_millis(), "Liveness deadline passed");
        self.trigger_reconnect(generation);
    }
}
