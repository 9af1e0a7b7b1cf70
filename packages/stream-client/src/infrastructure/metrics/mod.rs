//! Stream Client Metrics
//!
//! Records client activity through the `metrics` facade. The library never
//! installs a recorder; the embedding application decides where metrics go
//! (Prometheus, StatsD, nothing).
//!
//! # Metrics Categories
//!
//! - **Frames**: inbound frames by kind, decode failures
//! - **Dispatch**: dropped messages, callback failures, callback latency
//! - **Connection**: state gauge, reconnects, dial failures
//! - **Subscriptions**: registered subscription count
//!
//! Per-client counters are also kept in [`ClientStats`] so callers can read
//! them without a recorder.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use crate::domain::connection::{ConnectionState, Generation};

// =============================================================================
// Metric Registration
// =============================================================================

/// Register descriptions for every metric the client emits.
///
/// Call once after installing a recorder.
pub fn describe_metrics() {
    describe_counter!(
        "stream_client_frames_received_total",
        "Total frames received from the transport by kind"
    );
    describe_counter!(
        "stream_client_decode_failures_total",
        "Total inbound frames that could not be decoded"
    );
    describe_counter!(
        "stream_client_messages_dropped_total",
        "Total messages dropped because the dispatch queue was full"
    );
    describe_counter!(
        "stream_client_callback_failures_total",
        "Total callback invocations that returned an error or panicked"
    );
    describe_counter!(
        "stream_client_reconnects_total",
        "Total reconnect sequences started"
    );
    describe_counter!(
        "stream_client_dial_failures_total",
        "Total failed dial attempts by error type"
    );
    describe_gauge!(
        "stream_client_connection_state",
        "Connection state (0=disconnected 1=connecting 2=connected 3=reconnecting 4=closed)"
    );
    describe_gauge!(
        "stream_client_subscriptions",
        "Number of registered subscriptions"
    );
    describe_histogram!(
        "stream_client_callback_seconds",
        "Time spent inside business callbacks"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Outcome label for a failed callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackFailure {
    /// Callback returned an error.
    Error,
    /// Callback panicked.
    Panic,
}

impl CallbackFailure {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Panic => "panic",
        }
    }
}

/// Record a frame received from the transport.
pub fn record_frame_received(kind: &'static str) {
    counter!("stream_client_frames_received_total", "kind" => kind).increment(1);
}

/// Record a frame that failed to decode.
pub fn record_decode_failure() {
    counter!("stream_client_decode_failures_total").increment(1);
}

/// Record a message dropped by the dispatch queue.
pub fn record_message_dropped() {
    counter!("stream_client_messages_dropped_total").increment(1);
}

/// Record a failed callback invocation.
pub fn record_callback_failure(failure: CallbackFailure) {
    counter!(
        "stream_client_callback_failures_total",
        "outcome" => failure.as_str()
    )
    .increment(1);
}

/// Record callback execution time.
pub fn record_callback_duration(duration: Duration) {
    histogram!("stream_client_callback_seconds").record(duration.as_secs_f64());
}

/// Record a reconnect sequence starting.
pub fn record_reconnect() {
    counter!("stream_client_reconnects_total").increment(1);
}

/// Record a failed dial attempt.
pub fn record_dial_failure(error_type: &'static str) {
    counter!(
        "stream_client_dial_failures_total",
        "error_type" => error_type
    )
    .increment(1);
}

/// Update the connection state gauge.
pub fn set_connection_state(state: ConnectionState) {
    gauge!("stream_client_connection_state").set(state.as_gauge());
}

/// Update the subscription count gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscriptions(count: usize) {
    gauge!("stream_client_subscriptions").set(count as f64);
}

// =============================================================================
// Client Stats
// =============================================================================

/// Per-client counters.
#[derive(Debug, Default)]
pub struct ClientStats {
    dials: AtomicU64,
    connects: AtomicU64,
    reconnects: AtomicU64,
    dropped: AtomicU64,
    decode_errors: AtomicU64,
    callback_errors: AtomicU64,
    generation: AtomicU64,
}

impl ClientStats {
    /// Create zeroed stats.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_dial(&self) {
        self.dials.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connect(&self, generation: Generation) {
        self.connects.fetch_add(1, Ordering::Relaxed);
        self.generation.store(generation.get(), Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        record_reconnect();
    }

    /// Count a dropped message and return the running total.
    pub(crate) fn record_drop(&self) -> u64 {
        record_message_dropped();
        self.dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
        record_decode_failure();
    }

    pub(crate) fn record_callback_error(&self, failure: CallbackFailure) {
        self.callback_errors.fetch_add(1, Ordering::Relaxed);
        record_callback_failure(failure);
    }

    /// Take a consistent-enough copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dials: self.dials.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            callback_errors: self.callback_errors.load(Ordering::Relaxed),
            generation: Generation::new(self.generation.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of [`ClientStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Dial attempts (initial and redial).
    pub dials: u64,
    /// Successful dials.
    pub connects: u64,
    /// Reconnect sequences started.
    pub reconnects: u64,
    /// Messages dropped by the dispatch queue.
    pub dropped: u64,
    /// Frames that failed to decode.
    pub decode_errors: u64,
    /// Callbacks that errored or panicked.
    pub callback_errors: u64,
    /// Generation of the most recent successful dial.
    pub generation: Generation,
}

// =============================================================================
// Tests
// =============================================================================
