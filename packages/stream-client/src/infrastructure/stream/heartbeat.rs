//! Heartbeat Monitor
//!
//! Tracks inbound activity and sends periodic liveness probes. A connection
//! that stays silent for `interval * timeout_multiplier` is declared dead and
//! a reconnect is requested.
//!
//! Only frames consumed by the read pump refresh liveness. Sending a probe
//! never does, so a connection that is broken in one direction (writes
//! succeed, nothing comes back) still times out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::application::ports::Frame;
use crate::domain::connection::Generation;
use crate::infrastructure::config::StreamConfig;

// =============================================================================
// Configuration
// =============================================================================

/// Timing for the heartbeat monitor.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Interval between probes.
    pub interval: Duration,
    /// Silence longer than `interval * timeout_multiplier` is fatal.
    pub timeout_multiplier: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            timeout_multiplier: 2,
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration.
    #[must_use]
    pub const fn new(interval: Duration, timeout_multiplier: u32) -> Self {
        Self {
            interval,
            timeout_multiplier,
        }
    }

    /// Create configuration from [`StreamConfig`].
    #[must_use]
    pub const fn from_stream_config(config: &StreamConfig) -> Self {
        Self {
            interval: config.heartbeat_interval,
            timeout_multiplier: config.timeout_multiplier,
        }
    }

    /// Silence threshold.
    #[must_use]
    pub const fn deadline(&self) -> Duration {
        self.interval.saturating_mul(self.timeout_multiplier)
    }
}

// =============================================================================
// Probe Style
// =============================================================================

/// Application-level ping payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppPing {
    /// Fixed text, e.g. `ping`, `{"op":"ping"}`, `{"event":"ping"}`.
    Literal(String),
    /// `{"<field>": <unix millis>}`.
    Timestamped {
        /// Field carrying the timestamp.
        field: String,
    },
}

/// Which probes an endpoint expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatStyle {
    /// Send a transport-level ping frame.
    pub control_ping: bool,
    /// Send an application-level ping.
    pub app_ping: Option<AppPing>,
}

impl Default for HeartbeatStyle {
    fn default() -> Self {
        Self::control()
    }
}

impl HeartbeatStyle {
    /// Transport ping frames only.
    #[must_use]
    pub const fn control() -> Self {
        Self {
            control_ping: true,
            app_ping: None,
        }
    }

    /// Application text ping only.
    #[must_use]
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            control_ping: false,
            app_ping: Some(AppPing::Literal(text.into())),
        }
    }

    /// Application `{"<field>": ts}` ping only.
    #[must_use]
    pub fn timestamped(field: impl Into<String>) -> Self {
        Self {
            control_ping: false,
            app_ping: Some(AppPing::Timestamped {
                field: field.into(),
            }),
        }
    }

    /// Also send a transport ping frame.
    #[must_use]
    pub const fn with_control_ping(mut self) -> Self {
        self.control_ping = true;
        self
    }

    /// Frames to send for one probe.
    #[must_use]
    pub fn probe_frames(&self, now_millis: i64) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(2);

        if self.control_ping {
            frames.push(Frame::Ping(Vec::new()));
        }

        match &self.app_ping {
            Some(AppPing::Literal(text)) => frames.push(Frame::Text(text.clone())),
            Some(AppPing::Timestamped { field }) => {
                let mut body = Map::new();
                body.insert(field.clone(), Value::from(now_millis));
                frames.push(Frame::Text(Value::Object(body).to_string()));
            }
            None => {}
        }

        frames
    }
}

// =============================================================================
// Liveness
// =============================================================================

/// Last inbound activity for the current connection.
#[derive(Debug)]
pub struct Liveness {
    last_activity: RwLock<Instant>,
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    /// Create liveness state stamped now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: RwLock::new(Instant::now()),
        }
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Time since the last inbound activity.
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    /// Reset for a new connection.
    pub fn reset(&self) {
        self.touch();
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// What the monitor acts on.
#[async_trait]
pub trait ProbeTarget: Send + Sync {
    /// Send one probe on `generation`. Returns `false` if the send failed.
    async fn send_probe(&self, generation: Generation) -> bool;

    /// The connection for `generation` has been silent past the deadline.
    fn liveness_expired(&self, generation: Generation, silence: Duration);
}

/// Heartbeat loop bound to one generation.
pub struct HeartbeatMonitor<T: ?Sized> {
    config: HeartbeatConfig,
    liveness: Arc<Liveness>,
    target: Arc<T>,
    generation: Generation,
    cancel: CancellationToken,
}

impl<T: ProbeTarget + ?Sized> HeartbeatMonitor<T> {
    /// Create a monitor.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        liveness: Arc<Liveness>,
        target: Arc<T>,
        generation: Generation,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            liveness,
            target,
            generation,
            cancel,
        }
    }

    /// Run until cancelled, the deadline passes, or a probe fails.
    pub async fn run(self) {
        let start = Instant::now() + self.config.interval;
        let mut interval = tokio::time::interval_at(start, self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let deadline = self.config.deadline();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!(generation = %self.generation, "Heartbeat monitor cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let silence = self.liveness.silence();
                    if silence > deadline {
                        tracing::warn!(
                            generation = %self.generation,
                            silence_ms = silence.as_millis(),
                            deadline_ms = deadline.as_millis(),
                            "Heartbeat timeout detected"
                        );
                        self.target.liveness_expired(self.generation, silence);
                        break;
                    }

                    if !self.target.send_probe(self.generation).await {
                        tracing::debug!(generation = %self.generation, "Probe failed, stopping heartbeat");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct RecordingTarget {
        probes: AtomicUsize,
        expired: AtomicBool,
        fail_probes: bool,
    }

    #[async_trait]
    impl ProbeTarget for RecordingTarget {
        async fn send_probe(&self, _generation: Generation) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            !self.fail_probes
        }

        fn liveness_expired(&self, _generation: Generation, _silence: Duration) {
            self.expired.store(true, Ordering::SeqCst);
        }
    }

    fn monitor(
        interval_ms: u64,
        liveness: &Arc<Liveness>,
        target: &Arc<RecordingTarget>,
        cancel: &CancellationToken,
    ) -> HeartbeatMonitor<RecordingTarget> {
        HeartbeatMonitor::new(
            HeartbeatConfig::new(Duration::from_millis(interval_ms), 2),
            Arc::clone(liveness),
            Arc::clone(target),
            Generation::new(1),
            cancel.clone(),
        )
    }

    #[test]
    fn default_config_values() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.interval, Duration::from_secs(20));
        assert_eq!(config.deadline(), Duration::from_secs(40));
    }

    #[test]
    fn probe_frames_by_style() {
        assert_eq!(
            HeartbeatStyle::control().probe_frames(0),
            vec![Frame::Ping(Vec::new())]
        );
        assert_eq!(
            HeartbeatStyle::literal("ping").probe_frames(0),
            vec![Frame::text("ping")]
        );
        assert_eq!(
            HeartbeatStyle::timestamped("ping").probe_frames(1_700_000_000_000),
            vec![Frame::text(r#"{"ping":1700000000000}"#)]
        );
        assert_eq!(
            HeartbeatStyle::literal(r#"{"op":"ping"}"#)
                .with_control_ping()
                .probe_frames(0)
                .len(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_tracks_silence() {
        let liveness = Liveness::new();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(liveness.silence() >= Duration::from_secs(3));

        liveness.touch();
        assert!(liveness.silence() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_probes_while_active() {
        let liveness = Arc::new(Liveness::new());
        let target = Arc::new(RecordingTarget::default());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(monitor(1000, &liveness, &target, &cancel).run());

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            liveness.touch();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(target.probes.load(Ordering::SeqCst) >= 2);
        assert!(!target.expired.load(Ordering::SeqCst));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_expires_on_silence() {
        let liveness = Arc::new(Liveness::new());
        let target = Arc::new(RecordingTarget::default());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(monitor(1000, &liveness, &target, &cancel).run());

        // Deadline is 2s; expiry is detected on the first tick after it.
        tokio::time::timeout(Duration::from_millis(3500), handle)
            .await
            .expect("monitor should exit after expiry")
            .unwrap();

        assert!(target.expired.load(Ordering::SeqCst));
        // Probes alone never refresh liveness.
        assert_eq!(target.probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_stops_on_probe_failure() {
        let liveness = Arc::new(Liveness::new());
        let target = Arc::new(RecordingTarget {
            fail_probes: true,
            ..RecordingTarget::default()
        });
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(monitor(1000, &liveness, &target, &cancel).run());

        tokio::time::timeout(Duration::from_millis(1500), handle)
            .await
            .expect("monitor should exit after failed probe")
            .unwrap();

        assert_eq!(target.probes.load(Ordering::SeqCst), 1);
        assert!(!target.expired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn monitor_cancellation() {
        let liveness = Arc::new(Liveness::new());
        let target = Arc::new(RecordingTarget::default());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(monitor(10_000, &liveness, &target, &cancel).run());
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_millis(100), handle).await;
        assert!(result.is_ok(), "monitor should shut down on cancellation");
    }
}
