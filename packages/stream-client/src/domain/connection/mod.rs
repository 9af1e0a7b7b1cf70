//! Connection State Machine
//!
//! Models the client-level lifecycle of a streaming connection:
//!
//! ```text
//! Disconnected ──connect──► Connecting ──dial ok──► Connected
//!                               ▲                      │
//!                               │                 io error / timeout
//!                               │                      ▼
//!                               └────── redial ──── Reconnecting
//!
//! any state ──close / exhausted──► Closed (terminal)
//! ```
//!
//! Only the connection manager drives transitions. Every successful dial
//! opens a new [`Generation`], which background loops capture so they can
//! retire themselves once a newer generation exists.

use std::fmt;

// =============================================================================
// Connection State
// =============================================================================

/// Current state of the streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport and no dial in progress.
    #[default]
    Disconnected,
    /// Initial dial in progress.
    Connecting,
    /// Exactly one live transport exists.
    Connected,
    /// Previous transport retired, redial with backoff in progress.
    Reconnecting,
    /// Terminal state, the client cannot be reused.
    Closed,
}

impl ConnectionState {
    /// Check if a live transport exists.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if the client has been closed.
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Get the state name used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }

    /// Numeric code used for the connection state gauge.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
            Self::Reconnecting => 3.0,
            Self::Closed => 4.0,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Transitions
// =============================================================================

/// Events that move the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Caller requested the initial connect.
    Connect,
    /// A dial (initial or redial) succeeded.
    DialSucceeded,
    /// Fatal I/O error or heartbeat timeout on the live transport.
    Failure,
    /// Dial retries exhausted.
    Exhausted,
    /// Caller requested close.
    Close,
}

/// Rejected transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition from {from} on {event:?}")]
pub struct InvalidTransition {
    /// State the machine was in.
    pub from: ConnectionState,
    /// Event that was rejected.
    pub event: ConnectionEvent,
}

impl ConnectionState {
    /// Compute the next state for an event.
    ///
    /// `Close` and `Exhausted` are accepted from every non-terminal state.
    /// `Closed` accepts nothing, so it can be neither re-entered nor exited.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] if the event is not legal in this state.
    pub const fn transition(self, event: ConnectionEvent) -> Result<Self, InvalidTransition> {
        use ConnectionEvent as E;

        let next = match (self, event) {
            (Self::Closed, _) => None,
            (_, E::Close | E::Exhausted) => Some(Self::Closed),
            (Self::Disconnected, E::Connect) => Some(Self::Connecting),
            (Self::Connecting | Self::Reconnecting, E::DialSucceeded) => Some(Self::Connected),
            (Self::Connected, E::Failure) => Some(Self::Reconnecting),
            _ => None,
        };

        match next {
            Some(state) => Ok(state),
            None => Err(InvalidTransition { from: self, event }),
        }
    }
}

// =============================================================================
// Generation
// =============================================================================

/// Identifier for one transport lifetime.
///
/// Generation `0` means "never connected". Each successful dial increments
/// the counter; a loop whose captured generation differs from the current
/// one is stale and must exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(u64);

impl Generation {
    /// The generation before any successful dial.
    pub const NONE: Self = Self(0);

    /// Create a generation from a raw counter value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw counter value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The generation following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Check if `current` has superseded this generation.
    #[must_use]
    pub const fn is_stale(self, current: Self) -> bool {
        self.0 != current.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
