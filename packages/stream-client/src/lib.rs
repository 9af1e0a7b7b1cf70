#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Stream Client - Resilient Subscription Feed
//!
//! A streaming client that keeps a subscription-based WebSocket feed alive
//! across network failures, server-side disconnects, and idle timeouts, and
//! fans received messages out to business callbacks without blocking the
//! network read path.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Connection state machine, generations, subscriptions,
//!   inbound envelopes
//!
//! - **Application**: Port definitions
//!   - `ports`: Frame transport (`Connector`, `FrameSink`, `FrameSource`)
//!
//! - **Infrastructure**: Engine and adapters
//!   - `stream`: Connection manager, heartbeat, read pump, dispatch pool,
//!     write serializer, codec, auth, protocol strategies
//!   - `transport`: WebSocket connector (tokio-tungstenite)
//!   - `config`: Client configuration and environment loading
//!   - `metrics`: Metrics facade instrumentation
//!
//! # Data Flow
//!
//! ```text
//!              ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! transport ──►│  Read Pump   │──►│ Dispatch     │──►│  callbacks   │
//!              │  (gen N)     │   │ queue+workers│   └──────────────┘
//!              └──────┬───────┘   └──────────────┘
//!                     │ error
//!                     ▼
//!              ┌──────────────┐   ┌──────────────┐
//!              │ Connection   │──►│ Subscription │── replay ──┐
//!              │ Manager      │   │ Registry     │            ▼
//!              └──────────────┘   └──────────────┘   ┌──────────────┐
//!                     ▲ timeout                       │    Write     │──► transport
//!              ┌──────┴───────┐ ── probes ──────────► │  Serializer  │
//!              │  Heartbeat   │                       └──────────────┘
//!              └──────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core stream types with no I/O.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Infrastructure layer - Stream engine and adapters.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::{ConnectionState, Generation};
pub use domain::envelope::{Callback, InboundEnvelope, RoutingKey};
pub use domain::subscription::{Subscription, SubscriptionKey};

// Ports
pub use application::ports::{Connector, Frame, FrameSink, FrameSource, TransportError};

// Configuration
pub use infrastructure::config::{ConfigError, Credentials, StreamConfig};

// Stream engine
pub use infrastructure::stream::{
    AppPing, AuthError, AuthFailurePolicy, CodecError, Decompression, ErrorCallback,
    HashAlgorithm, HeartbeatStyle, HmacAuth, JsonCodec, Protocol, RequestLayout, RoutingRules,
    SignatureEncoding, StreamClient, StreamError,
};

// Transport
pub use infrastructure::transport::WsConnector;

// Metrics
pub use infrastructure::metrics::{StatsSnapshot, describe_metrics};
