//! Write Serializer
//!
//! Single path for every outbound frame: subscription requests, login,
//! heartbeat probes, pong replies, and caller sends. The active sink lives
//! behind one async mutex, so at most one write is in flight per transport,
//! and each write is bounded by a deadline.
//!
//! The sink is tagged with the generation that installed it. Writers that
//! name a generation are refused once it has been replaced, so a stale loop
//! can never write into a newer connection.

use std::time::Duration;

use tokio::sync::Mutex;

use crate::application::ports::{Frame, FrameSink, TransportError};
use crate::domain::connection::Generation;

// =============================================================================
// Error Type
// =============================================================================

/// Why a write did not happen.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WriteFailure {
    /// No transport is installed.
    #[error("not connected")]
    NotConnected,

    /// The caller's generation has been replaced.
    #[error("generation {expected} is stale (current {current})")]
    Stale {
        /// Generation the caller was bound to.
        expected: Generation,
        /// Generation currently installed.
        current: Generation,
    },

    /// The transport failed or timed out.
    #[error("write on generation {generation} failed: {error}")]
    Transport {
        /// Generation of the failed transport.
        generation: Generation,
        /// Underlying error.
        error: TransportError,
    },
}

/// A sink handed back because the client is shutting down.
pub struct Refused(pub Box<dyn FrameSink>);

impl std::fmt::Debug for Refused {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Refused(..)")
    }
}

// =============================================================================
// Serializer
// =============================================================================

struct ActiveSink {
    generation: Generation,
    sink: Box<dyn FrameSink>,
}

#[derive(Default)]
struct Slot {
    active: Option<ActiveSink>,
    shut_down: bool,
}

/// Exclusive, deadline-bounded access to the current sink.
pub struct WriteSerializer {
    slot: Mutex<Slot>,
    write_timeout: Duration,
}

impl std::fmt::Debug for WriteSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSerializer")
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

impl WriteSerializer {
    /// Create an empty serializer.
    #[must_use]
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            write_timeout,
        }
    }

    /// Install the sink for a new generation.
    ///
    /// Any previous sink is returned for closing.
    ///
    /// # Errors
    ///
    /// Returns [`Refused`] with the sink if the serializer has been shut down.
    pub async fn install(
        &self,
        generation: Generation,
        sink: Box<dyn FrameSink>,
    ) -> Result<Option<Box<dyn FrameSink>>, Refused> {
        let mut slot = self.slot.lock().await;
        if slot.shut_down {
            return Err(Refused(sink));
        }

        let previous = slot.active.replace(ActiveSink { generation, sink });
        Ok(previous.map(|active| active.sink))
    }

    /// Write one frame.
    ///
    /// With `expected = Some(g)` the write is refused unless `g` is the
    /// installed generation. Returns the generation the frame was written on.
    ///
    /// # Errors
    ///
    /// Returns [`WriteFailure`] if nothing is installed, the generation is
    /// stale, or the transport fails or exceeds the write deadline.
    pub async fn write(
        &self,
        expected: Option<Generation>,
        frame: Frame,
    ) -> Result<Generation, WriteFailure> {
        let mut slot = self.slot.lock().await;
        let active = slot.active.as_mut().ok_or(WriteFailure::NotConnected)?;
        let generation = active.generation;

        if let Some(expected) = expected
            && expected != generation
        {
            return Err(WriteFailure::Stale {
                expected,
                current: generation,
            });
        }

        tracing::trace!(%generation, kind = frame.kind(), "Writing frame");

        match tokio::time::timeout(self.write_timeout, active.sink.send(frame)).await {
            Ok(Ok(())) => Ok(generation),
            Ok(Err(error)) => Err(WriteFailure::Transport { generation, error }),
            Err(_) => Err(WriteFailure::Transport {
                generation,
                error: TransportError::WriteTimeout(self.write_timeout),
            }),
        }
    }

    /// Take the sink if it still belongs to `generation`.
    pub async fn retire(&self, generation: Generation) -> Option<Box<dyn FrameSink>> {
        let mut slot = self.slot.lock().await;
        if slot
            .active
            .as_ref()
            .is_some_and(|active| active.generation == generation)
        {
            slot.active.take().map(|active| active.sink)
        } else {
            None
        }
    }

    /// Refuse all future installs and take the current sink.
    ///
    /// Only the first call can return a sink, so the transport is closed
    /// exactly once.
    pub async fn shutdown(&self) -> Option<Box<dyn FrameSink>> {
        let mut slot = self.slot.lock().await;
        slot.shut_down = true;
        slot.active.take().map(|active| active.sink)
    }

    /// Close a sink within the write deadline, ignoring errors.
    pub async fn close_sink(&self, mut sink: Box<dyn FrameSink>) {
        match tokio::time::timeout(self.write_timeout, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Ignoring error while closing transport"),
            Err(_) => tracing::debug!("Timed out closing transport"),
        }
    }
}
