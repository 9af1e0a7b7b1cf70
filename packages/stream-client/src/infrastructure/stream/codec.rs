//! Stream Codec Module
//!
//! Decodes inbound frames into routed envelopes and recognizes protocol
//! control traffic that must never reach business callbacks.
//!
//! # Shapes
//!
//! The first non-whitespace byte picks the decoder:
//!
//! - `{` object frames, routed by the first string found at a list of JSON
//!   pointer paths (`/channel`, `/ch`, `/topic`, `/arg/channel`), with the
//!   first instrument found (`/arg/instId`, `/instId`, `/symbol`) appended as
//!   `channel.instrument`
//! - `[` positional arrays such as `[id, data, "ticker", "XBT/USD"]`, routed
//!   from the end of the array as `channelName.pair`
//! - anything else is matched against literal heartbeat text (`pong`) or
//!   rejected as a decode failure
//!
//! # Control Frames
//!
//! | Frame                                   | Result                 |
//! |-----------------------------------------|------------------------|
//! | `pong`, `{"pong":ts}`, `{"op":"pong"}`  | heartbeat reply        |
//! | `{"event":"pong"}`, `{"event":"heartbeat"}` | heartbeat reply    |
//! | channel ending in `.pong`               | heartbeat reply        |
//! | `{"ping":ts}` / `ping`                  | answered with `{"pong":ts}` / `pong` |
//! | `{"event":"login","code":..}`           | login acknowledgement  |
//! | `{"event":"error",..}`                  | server error           |
//!
//! Binary frames are decompressed (gzip, raw deflate, or a caller function)
//! before decoding.

use std::borrow::Cow;
use std::fmt;
use std::io::Read;
use std::sync::Arc;

use flate2::read::{DeflateDecoder, GzDecoder};
use serde_json::{Map, Value};

use super::auth::AuthError;
use crate::application::ports::Frame;
use crate::domain::envelope::{InboundEnvelope, RoutingKey};

// =============================================================================
// Error Type
// =============================================================================

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Decompression failed.
    #[error("decompression failed: {0}")]
    Decompress(String),

    /// Decompressed payload was not UTF-8.
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

// =============================================================================
// Decompression
// =============================================================================

/// Caller-provided decompression function.
pub type DecompressFn = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync>;

/// How binary frames are unpacked before decoding.
#[derive(Clone, Default)]
pub enum Decompression {
    /// Binary frames carry plain UTF-8.
    #[default]
    None,
    /// Gzip-framed payloads.
    Gzip,
    /// Raw deflate payloads.
    Deflate,
    /// Custom function.
    Custom(DecompressFn),
}

impl fmt::Debug for Decompression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Gzip => f.write_str("Gzip"),
            Self::Deflate => f.write_str("Deflate"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Decompression {
    /// Unpack a binary payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decompress`] if the payload is corrupt.
    pub fn apply<'a>(&self, bytes: &'a [u8]) -> Result<Cow<'a, [u8]>, CodecError> {
        match self {
            Self::None => Ok(Cow::Borrowed(bytes)),
            Self::Gzip => read_all(GzDecoder::new(bytes)).map(Cow::Owned),
            Self::Deflate => read_all(DeflateDecoder::new(bytes)).map(Cow::Owned),
            Self::Custom(decompress) => decompress(bytes)
                .map(Cow::Owned)
                .map_err(CodecError::Decompress),
        }
    }
}

fn read_all(mut reader: impl Read) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    reader
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Decompress(e.to_string()))?;
    Ok(out)
}

// =============================================================================
// Routing
// =============================================================================

/// Where routing information lives in object frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRules {
    /// JSON pointer paths tried in order for the channel.
    pub channel_paths: Vec<String>,
    /// JSON pointer paths tried in order for the instrument, appended as
    /// `channel.instrument`.
    pub instrument_paths: Vec<String>,
}

impl Default for RoutingRules {
    fn default() -> Self {
        Self {
            channel_paths: ["/channel", "/ch", "/topic", "/arg/channel"]
                .into_iter()
                .map(String::from)
                .collect(),
            instrument_paths: ["/arg/instId", "/instId", "/symbol"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl RoutingRules {
    /// Route by a single channel path, without instruments.
    #[must_use]
    pub fn channel(path: impl Into<String>) -> Self {
        Self {
            channel_paths: vec![path.into()],
            instrument_paths: Vec::new(),
        }
    }

    /// Also look for an instrument at `path`.
    #[must_use]
    pub fn with_instrument(mut self, path: impl Into<String>) -> Self {
        self.instrument_paths.push(path.into());
        self
    }

    fn channel_of<'a>(&self, value: &'a Value) -> Option<&'a str> {
        self.channel_paths
            .iter()
            .find_map(|path| value.pointer(path).and_then(Value::as_str))
    }

    fn route_object(&self, value: &Value) -> Route {
        let Some(channel) = self.channel_of(value) else {
            return Route::unrouted();
        };

        let instrument = self
            .instrument_paths
            .iter()
            .find_map(|path| value.pointer(path).and_then(Value::as_str));

        match instrument {
            Some(instrument) => Route::instrument(channel, instrument),
            None => Route::channel(channel),
        }
    }
}

/// Routing key plus the bare channel when an instrument was appended.
struct Route {
    key: RoutingKey,
    channel: Option<RoutingKey>,
}

impl Route {
    fn unrouted() -> Self {
        Self {
            key: RoutingKey::unrouted(),
            channel: None,
        }
    }

    fn channel(channel: &str) -> Self {
        Self {
            key: RoutingKey::from(channel),
            channel: None,
        }
    }

    fn instrument(channel: &str, instrument: &str) -> Self {
        Self {
            key: RoutingKey::new(format!("{channel}.{instrument}")),
            channel: Some(RoutingKey::from(channel)),
        }
    }

    fn envelope(self, value: Value) -> InboundEnvelope {
        let envelope = InboundEnvelope::new(self.key, value);
        match self.channel {
            Some(channel) => envelope.with_channel_key(channel),
            None => envelope,
        }
    }
}

/// Route a positional array from its tail: `[.., channelName, pair]`.
fn route_array(items: &[Value]) -> Route {
    match items {
        [.., Value::String(channel), Value::String(pair)] if items.len() >= 3 => {
            Route::instrument(channel, pair)
        }
        [.., Value::String(channel)] if items.len() >= 2 => Route::channel(channel),
        _ => Route::unrouted(),
    }
}

// =============================================================================
// Decoded Frame
// =============================================================================

/// Result of decoding one inbound frame.
#[derive(Debug)]
pub enum Decoded {
    /// Business data for the dispatch pool.
    Data(InboundEnvelope),
    /// Acknowledgement of one of our probes.
    HeartbeatReply,
    /// Server-initiated ping; send the contained reply.
    ServerPing(Frame),
    /// Login acknowledgement.
    LoginAck(Result<(), AuthError>),
    /// Server-reported error; rejects a pending login, otherwise delivered.
    ServerError {
        /// Error code, if present.
        code: Option<String>,
        /// Error message.
        message: String,
        /// The frame, for delivery to the default callback.
        envelope: InboundEnvelope,
    },
}

// =============================================================================
// JSON Codec
// =============================================================================

/// JSON codec with configurable routing.
#[derive(Debug, Clone)]
pub struct JsonCodec {
    routing: RoutingRules,
    decompression: Decompression,
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonCodec {
    /// Create a codec with default routing and no decompression.
    #[must_use]
    pub fn new() -> Self {
        Self {
            routing: RoutingRules::default(),
            decompression: Decompression::None,
        }
    }

    /// Set the routing rules for object frames.
    #[must_use]
    pub fn with_routing(mut self, routing: RoutingRules) -> Self {
        self.routing = routing;
        self
    }

    /// Set binary frame decompression.
    #[must_use]
    pub fn with_decompression(mut self, decompression: Decompression) -> Self {
        self.decompression = decompression;
        self
    }

    /// Routing rules in use.
    #[must_use]
    pub const fn routing(&self) -> &RoutingRules {
        &self.routing
    }

    /// Decode a binary frame.
    ///
    /// # Errors
    ///
    /// Returns an error if decompression, UTF-8 validation, or decoding fails.
    pub fn decode_binary(&self, bytes: &[u8]) -> Result<Decoded, CodecError> {
        let unpacked = self.decompression.apply(bytes)?;
        let text = std::str::from_utf8(&unpacked)?;
        self.decode_text(text)
    }

    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is neither JSON nor a known literal.
    pub fn decode_text(&self, text: &str) -> Result<Decoded, CodecError> {
        let trimmed = text.trim();

        match trimmed.as_bytes().first() {
            Some(b'{') => {
                let value: Value = serde_json::from_str(trimmed)?;
                Ok(self.classify_object(value))
            }
            Some(b'[') => {
                let value: Value = serde_json::from_str(trimmed)?;
                let route = match &value {
                    Value::Array(items) => route_array(items),
                    _ => Route::unrouted(),
                };
                Ok(Decoded::Data(route.envelope(value)))
            }
            _ => match trimmed {
                "pong" => Ok(Decoded::HeartbeatReply),
                "ping" => Ok(Decoded::ServerPing(Frame::text("pong"))),
                _ => Err(CodecError::InvalidFormat(format!(
                    "expected JSON array or object, got: {}",
                    preview(trimmed)
                ))),
            },
        }
    }

    fn classify_object(&self, value: Value) -> Decoded {
        if value.get("pong").is_some() {
            return Decoded::HeartbeatReply;
        }

        if let Value::Object(map) = &value
            && map.len() == 1
            && let Some(ts) = map.get("ping")
        {
            let mut reply = Map::new();
            reply.insert("pong".to_string(), ts.clone());
            return Decoded::ServerPing(Frame::Text(Value::Object(reply).to_string()));
        }

        match value.get("event").and_then(Value::as_str) {
            Some("pong" | "heartbeat") => return Decoded::HeartbeatReply,
            Some("login") => return Decoded::LoginAck(login_result(&value)),
            Some("error") => {
                let code = code_of(&value);
                let message = message_of(&value);
                let envelope = InboundEnvelope::new(RoutingKey::unrouted(), value);
                return Decoded::ServerError {
                    code,
                    message,
                    envelope,
                };
            }
            _ => {}
        }

        if value.get("op").and_then(Value::as_str) == Some("pong") {
            return Decoded::HeartbeatReply;
        }

        if self
            .routing
            .channel_of(&value)
            .is_some_and(|channel| channel.ends_with(".pong"))
        {
            return Decoded::HeartbeatReply;
        }

        let route = self.routing.route_object(&value);
        Decoded::Data(route.envelope(value))
    }
}

fn code_of(value: &Value) -> Option<String> {
    match value.get("code")? {
        Value::String(code) => Some(code.clone()),
        Value::Number(code) => Some(code.to_string()),
        _ => None,
    }
}

fn message_of(value: &Value) -> String {
    ["msg", "message", "err-msg"]
        .iter()
        .find_map(|field| value.get(*field).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

fn login_result(value: &Value) -> Result<(), AuthError> {
    match code_of(value).as_deref() {
        None | Some("0") => Ok(()),
        Some(code) => Err(AuthError::Rejected {
            code: code.to_string(),
            message: message_of(value),
        }),
    }
}

fn preview(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(50)
        .map_or(text.len(), |(idx, _)| idx);
    &text[..end]
}
