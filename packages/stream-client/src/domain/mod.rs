//! Domain Layer - Core stream types and state with no I/O.
//!
//! This layer contains the connection state machine, the durable
//! subscription registry, and the inbound envelope model. Nothing here
//! touches the network or the async runtime.

/// Connection state machine and generation tracking.
pub mod connection;

/// Inbound envelopes and routing keys.
pub mod envelope;

/// Subscription identity and the replay registry.
pub mod subscription;
