//! WebSocket Transport
//!
//! [`Connector`] implementation over `tokio-tungstenite` with rustls. The
//! socket is split so the read pump owns the receive half while every write
//! goes through the write serializer. The dial deadline is applied by the
//! connection manager around every connector.

use std::sync::Once;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{Connector, Frame, FrameSink, FrameSource, SplitTransport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

static CRYPTO_PROVIDER: Once = Once::new();

/// Install the ring crypto provider for rustls once per process.
///
/// Ignores the error when the application already installed one.
fn install_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }
    });
}

// =============================================================================
// Connector
// =============================================================================

/// Dials `ws://` and `wss://` endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<SplitTransport, TransportError> {
        install_crypto_provider();

        let (stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Dial(e.to_string()))?;

        tracing::debug!(url, status = %response.status(), "WebSocket handshake complete");

        let (sink, source) = stream.split();
        Ok((Box::new(WsSink { sink }), Box::new(WsSource { source })))
    }
}

// =============================================================================
// Split Halves
// =============================================================================

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes.into()),
            Frame::Ping(payload) => Message::Ping(payload.into()),
            Frame::Pong(payload) => Message::Pong(payload.into()),
            Frame::Close => Message::Close(None),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }
}

struct WsSource {
    source: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            let message = match self.source.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(TransportError::Read(e.to_string()))),
            };

            let frame = match message {
                Message::Text(text) => Frame::Text(text.as_str().to_owned()),
                Message::Binary(bytes) => Frame::Binary(bytes.to_vec()),
                Message::Ping(payload) => Frame::Ping(payload.to_vec()),
                Message::Pong(payload) => Frame::Pong(payload.to_vec()),
                Message::Close(reason) => {
                    tracing::debug!(?reason, "Server sent close frame");
                    Frame::Close
                }
                Message::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }
}
