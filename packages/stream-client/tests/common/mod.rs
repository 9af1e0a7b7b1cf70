//! Scripted in-memory transport for integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use stream_client::{
    Connector, Frame, FrameSink, FrameSource, StreamConfig, TransportError,
};

/// Server side of one fake connection.
#[derive(Clone)]
pub struct FakeConnection {
    sent: Arc<Mutex<Vec<Frame>>>,
    inbound: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    fail_writes: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
}

impl FakeConnection {
    /// Frames the client wrote on this connection.
    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().clone()
    }

    /// Text frames the client wrote that contain `needle`.
    pub fn sent_containing(&self, needle: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|frame| frame.as_text().is_some_and(|text| text.contains(needle)))
            .count()
    }

    /// Deliver a text frame to the client.
    pub fn push_text(&self, text: &str) {
        let _ = self.inbound.send(Ok(Frame::text(text)));
    }

    /// Deliver any frame to the client.
    pub fn push(&self, frame: Frame) {
        let _ = self.inbound.send(Ok(frame));
    }

    /// Make the next receive fail.
    pub fn fail_read(&self) {
        let _ = self
            .inbound
            .send(Err(TransportError::Read("connection reset by peer".to_string())));
    }

    /// Make every further write fail.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Times the client closed this connection.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

struct FakeSink {
    sent: Arc<Mutex<Vec<Frame>>>,
    fail_writes: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl FrameSink for FakeSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Write("broken pipe".to_string()));
        }
        self.sent.lock().push(frame);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeSource {
    inbound: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
}

#[async_trait]
impl FrameSource for FakeSource {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        self.inbound.recv().await
    }
}

/// Connector that hands out [`FakeConnection`]s.
#[derive(Default)]
pub struct FakeConnector {
    dials: AtomicUsize,
    fail_next: AtomicUsize,
    connections: Mutex<Vec<FakeConnection>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `count` dials.
    pub fn fail_next_dials(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Dial attempts so far.
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Connections handed out so far.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Connection number `index` (0-based).
    pub fn connection(&self, index: usize) -> FakeConnection {
        self.connections.lock()[index].clone()
    }

    /// Most recent connection.
    pub fn latest(&self) -> FakeConnection {
        self.connections
            .lock()
            .last()
            .cloned()
            .expect("no connection yet")
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        let pending_failures = self.fail_next.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.fail_next.store(pending_failures - 1, Ordering::SeqCst);
            return Err(TransportError::Dial("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let connection = FakeConnection {
            sent: Arc::new(Mutex::new(Vec::new())),
            inbound: tx,
            fail_writes: Arc::new(AtomicBool::new(false)),
            closes: Arc::new(AtomicUsize::new(0)),
        };

        let sink = FakeSink {
            sent: Arc::clone(&connection.sent),
            fail_writes: Arc::clone(&connection.fail_writes),
            closes: Arc::clone(&connection.closes),
        };
        self.connections.lock().push(connection);

        Ok((Box::new(sink), Box::new(FakeSource { inbound: rx })))
    }
}

/// Config with fast backoff and no jitter.
pub fn fast_config() -> StreamConfig {
    StreamConfig::new("wss://stream.example.test/ws")
        .with_backoff(Duration::from_millis(10), Duration::from_millis(40))
        .with_jitter_factor(0.0)
        .with_close_timeout(Duration::from_secs(1))
}

/// Poll `condition` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
