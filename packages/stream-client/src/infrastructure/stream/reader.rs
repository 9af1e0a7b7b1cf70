//! Read Pump
//!
//! One receive loop per connection generation. Every frame refreshes
//! liveness; control traffic is answered or short-circuited here and data
//! frames are handed to the dispatch pool without waiting.
//!
//! When the transport errors or ends, a current loop requests a reconnect
//! and exits. A loop whose generation has been replaced exits silently.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::auth::AuthError;
use super::codec::Decoded;
use super::connection::ConnectionManager;
use super::dispatch::SubmitOutcome;
use crate::application::ports::{Frame, FrameSource};
use crate::domain::connection::Generation;
use crate::infrastructure::metrics::record_frame_received;

/// Receive loop bound to one generation.
pub struct ReadPump {
    source: Box<dyn FrameSource>,
    frames: FrameHandler,
    cancel: CancellationToken,
}

/// Frame handling for one generation.
struct FrameHandler {
    manager: Arc<ConnectionManager>,
    generation: Generation,
}

impl ReadPump {
    pub(crate) fn new(
        manager: Arc<ConnectionManager>,
        source: Box<dyn FrameSource>,
        generation: Generation,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            frames: FrameHandler {
                manager,
                generation,
            },
            cancel,
        }
    }

    /// Receive until the transport fails or the generation is retired.
    pub async fn run(self) {
        let Self {
            mut source,
            frames,
            cancel,
        } = self;
        let generation = frames.generation;
        tracing::debug!(%generation, "Read pump started");

        let reason = loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!(%generation, "Read pump cancelled");
                    return;
                }
                next = source.recv() => next,
            };

            match next {
                Some(Ok(Frame::Close)) => {
                    record_frame_received("close");
                    break "server closed the connection".to_string();
                }
                Some(Ok(frame)) => frames.handle(frame).await,
                Some(Err(e)) => break e.to_string(),
                None => break "stream ended".to_string(),
            }
        };

        if cancel.is_cancelled() || frames.manager.is_stale(generation) {
            tracing::debug!(%generation, "Stale read pump exiting");
            return;
        }

        tracing::warn!(%generation, reason = %reason, "Read failed");
        frames.manager.trigger_reconnect(generation);
    }
}

impl FrameHandler {
    async fn handle(&self, frame: Frame) {
        self.manager.liveness().touch();
        record_frame_received(frame.kind());

        let decoded = match frame {
            Frame::Ping(payload) => {
                self.reply(Frame::Pong(payload)).await;
                return;
            }
            Frame::Pong(_) | Frame::Close => return,
            Frame::Text(text) => self.manager.protocol().codec().decode_text(&text),
            Frame::Binary(bytes) => self.manager.protocol().codec().decode_binary(&bytes),
        };

        match decoded {
            Ok(Decoded::Data(envelope)) => {
                if self.manager.dispatch().submit(envelope) == SubmitOutcome::Closed {
                    tracing::trace!(generation = %self.generation, "Dispatch closed, discarding message");
                }
            }
            Ok(Decoded::HeartbeatReply) => {
                tracing::trace!(generation = %self.generation, "Heartbeat reply");
            }
            Ok(Decoded::ServerPing(reply)) => self.reply(reply).await,
            Ok(Decoded::LoginAck(result)) => self.manager.login_result(self.generation, result),
            Ok(Decoded::ServerError {
                code,
                message,
                envelope,
            }) => {
                let rejected = AuthError::Rejected {
                    code: code.clone().unwrap_or_default(),
                    message: message.clone(),
                };
                if !self.manager.reject_pending_login(self.generation, rejected) {
                    tracing::warn!(
                        generation = %self.generation,
                        code = code.as_deref().unwrap_or_default(),
                        message = %message,
                        "Server reported an error"
                    );
                    self.manager.dispatch().submit(envelope);
                }
            }
            Err(e) => {
                self.manager.stats().record_decode_error();
                tracing::warn!(generation = %self.generation, error = %e, "Skipping undecodable frame");
            }
        }
    }

    async fn reply(&self, frame: Frame) {
        if let Err(e) = self.manager.write(Some(self.generation), frame).await {
            tracing::debug!(generation = %self.generation, error = %e, "Failed to answer ping");
        }
    }
}
