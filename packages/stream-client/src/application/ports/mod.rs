//! Port Interfaces
//!
//! Defines the transport contract the stream engine is written against,
//! following the Hexagonal Architecture pattern. The WebSocket adapter in
//! `infrastructure::transport` implements it for production; tests provide
//! scripted in-memory implementations.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`Connector`]: dials a URL and yields a split sink/source pair
//! - [`FrameSink`]: the send half, owned by the write serializer
//! - [`FrameSource`]: the receive half, owned by exactly one read pump

use std::time::Duration;

use async_trait::async_trait;

// =============================================================================
// Frame
// =============================================================================

/// A discrete transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text payload.
    Text(String),
    /// Binary payload (possibly compressed).
    Binary(Vec<u8>),
    /// Transport-level ping.
    Ping(Vec<u8>),
    /// Transport-level pong.
    Pong(Vec<u8>),
    /// Close handshake.
    Close,
}

impl Frame {
    /// Create a text frame.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Short name used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Close => "close",
        }
    }

    /// Get the text payload, if this is a text frame.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

// =============================================================================
// Error Type
// =============================================================================

/// Errors raised by a frame transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Dial failed.
    #[error("dial failed: {0}")]
    Dial(String),

    /// Dial did not complete in time.
    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),

    /// Receive failed.
    #[error("read failed: {0}")]
    Read(String),

    /// Send failed.
    #[error("write failed: {0}")]
    Write(String),

    /// Send did not complete before the write deadline.
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// Peer closed the connection.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Short name used as a metric label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Dial(_) => "dial",
            Self::DialTimeout(_) => "dial_timeout",
            Self::Read(_) => "read",
            Self::Write(_) => "write",
            Self::WriteTimeout(_) => "write_timeout",
            Self::Closed => "closed",
        }
    }
}

// =============================================================================
// Ports
// =============================================================================

/// Send half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Close the transport.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Receive half of a transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` once the stream has ended.
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;
}

/// A connected transport, split into its two halves.
pub type SplitTransport = (Box<dyn FrameSink>, Box<dyn FrameSource>);

/// Dials a URL and produces a connected transport.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection.
    async fn connect(&self, url: &str) -> Result<SplitTransport, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_kind() {
        assert_eq!(Frame::text("x").kind(), "text");
        assert_eq!(Frame::Binary(vec![1]).kind(), "binary");
        assert_eq!(Frame::Close.kind(), "close");
    }

    #[test]
    fn frame_as_text() {
        assert_eq!(Frame::text("ping").as_text(), Some("ping"));
        assert_eq!(Frame::Ping(vec![]).as_text(), None);
    }

    #[test]
    fn transport_error_kind() {
        assert_eq!(TransportError::Closed.kind(), "closed");
        assert_eq!(
            TransportError::WriteTimeout(Duration::from_secs(5)).kind(),
            "write_timeout"
        );
    }

    #[tokio::test]
    async fn mock_connector_reports_dial_failure() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .returning(|_| Err(TransportError::Dial("refused".to_string())));

        let result = connector.connect("wss://example.invalid").await;
        assert!(matches!(result, Err(TransportError::Dial(_))));
    }
}
