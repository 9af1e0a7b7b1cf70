//! Stream Engine
//!
//! Connection management, heartbeat, read pump, dispatch pool, and write
//! serializer, parameterized by a per-endpoint [`protocol::Protocol`].
//!
//! - **Protocol**: codec, request layout, heartbeat style, auth scheme
//! - **Codec**: JSON objects and positional arrays, gzip/deflate frames
//! - **Auth**: HMAC-SHA256/512 per-request signatures or login frame

pub mod auth;
pub mod client;
pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod heartbeat;
pub mod protocol;
pub mod reader;
pub mod reconnect;
pub mod writer;

pub use auth::{AuthError, AuthFailurePolicy, AuthMode, HashAlgorithm, HmacAuth, SignatureEncoding};
pub use client::{ErrorCallback, StreamClient, StreamError};
pub use codec::{CodecError, Decoded, Decompression, JsonCodec, RoutingRules};
pub use connection::ConnectionManager;
pub use dispatch::SubmitOutcome;
pub use heartbeat::{AppPing, HeartbeatConfig, HeartbeatStyle};
pub use protocol::{Protocol, RequestLayout};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
pub use writer::WriteFailure;
