//! Infrastructure Layer - Adapters and the stream engine.
//!
//! This layer contains the stream engine built on the ports from the
//! application layer, the WebSocket adapter, configuration, and metrics.

/// Resilient stream engine (connection, heartbeat, dispatch, codec, auth).
pub mod stream;

/// WebSocket transport adapter.
pub mod transport;

/// Configuration and environment loading.
pub mod config;

/// Metrics facade instrumentation.
pub mod metrics;
