//! Capture strategies.
//!
//! Exactly two variants exist and one is picked when a session starts:
//! push follows the source's own frame emission, poll requests every frame
//! on a self-paced loop driven by the rate controller.

mod poll;
mod push;
mod registry;
#[cfg(test)]
mod tests;

pub use poll::PollStrategy;
pub use push::PushStrategy;
pub use registry::{Subscription, SubscriptionRegistry};

use crate::config::{StrategyPreference, StreamSettings};
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::performance::{FrameTiming, SharedCollector};
use crate::rate_controller::{ControllerOverrides, RateController};
use crate::source::{CaptureSource, SourceProvider};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on waiting for a strategy task to wind down after cancellation
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureStrategy {
    Push,
    Poll,
}

impl fmt::Display for CaptureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Settings that may change while a strategy runs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveSettings {
    pub quality: u8,
    pub target_fps: u32,
}

impl From<&StreamSettings> for LiveSettings {
    fn from(settings: &StreamSettings) -> Self {
        Self {
            quality: settings.quality,
            target_fps: settings.target_fps,
        }
    }
}

/// Everything a strategy needs from its session
#[derive(Clone)]
pub struct StrategyContext {
    pub session_id: String,
    pub provider: Arc<dyn SourceProvider>,
    pub settings: StreamSettings,
    pub controller: ControllerOverrides,
    pub connection: ConnectionManager,
    pub collector: SharedCollector,
    pub registry: Arc<SubscriptionRegistry>,
}

/// Counters shared between a running strategy task and its handle
#[derive(Debug)]
pub(crate) struct StrategyCounters {
    frames: AtomicU64,
    active: AtomicBool,
    effective_fps: AtomicU32,
    ack_failures: AtomicU32,
}

impl StrategyCounters {
    fn new(initial_fps: u32) -> Arc<Self> {
        Arc::new(Self {
            frames: AtomicU64::new(0),
            active: AtomicBool::new(true),
            effective_fps: AtomicU32::new(initial_fps),
            ack_failures: AtomicU32::new(0),
        })
    }

    fn frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    fn set_fps(&self, fps: u32) {
        self.effective_fps.store(fps, Ordering::Relaxed);
    }

    fn set_ack_failures(&self, failures: u32) {
        self.ack_failures.store(failures, Ordering::Relaxed);
    }

    fn finish(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl CaptureStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            CaptureStrategy::Push => "push",
            CaptureStrategy::Poll => "poll",
        }
    }

    pub fn is_supported(&self, source: &dyn CaptureSource) -> bool {
        match self {
            CaptureStrategy::Push => source.supports_screencast(),
            CaptureStrategy::Poll => true,
        }
    }

    /// Pick the strategy for a source, falling back to poll when push is
    /// unavailable
    pub fn select(preference: StrategyPreference, source: &dyn CaptureSource) -> Self {
        match preference {
            StrategyPreference::Poll => CaptureStrategy::Poll,
            StrategyPreference::Auto if CaptureStrategy::Push.is_supported(source) => {
                CaptureStrategy::Push
            }
            StrategyPreference::Auto => CaptureStrategy::Poll,
            StrategyPreference::Push if CaptureStrategy::Push.is_supported(source) => {
                CaptureStrategy::Push
            }
            StrategyPreference::Push => {
                warn!(
                    "Source {} does not support screencast, falling back to poll capture",
                    source.id()
                );
                CaptureStrategy::Poll
            }
        }
    }

    /// Spawn the strategy task for a session
    pub fn start(self, ctx: StrategyContext) -> Result<StrategyHandle> {
        let live = LiveSettings::from(&ctx.settings);
        let (settings_tx, settings_rx) = watch::channel(live);
        let token = CancellationToken::new();
        let counters = StrategyCounters::new(live.target_fps);

        info!(
            session = %ctx.session_id,
            "Starting {} capture at {} fps, quality {}",
            self, live.target_fps, live.quality
        );

        let task = match self {
            CaptureStrategy::Push => {
                let strategy =
                    PushStrategy::new(ctx, settings_rx, token.clone(), Arc::clone(&counters));
                tokio::spawn(strategy.run())
            }
            CaptureStrategy::Poll => {
                let controller = RateController::new(live.target_fps, &ctx.controller)?;
                counters.set_fps(controller.current_fps());
                let strategy = PollStrategy::new(
                    ctx,
                    controller,
                    settings_rx,
                    token.clone(),
                    Arc::clone(&counters),
                );
                tokio::spawn(strategy.run())
            }
        };

        Ok(StrategyHandle {
            kind: self,
            token,
            counters,
            settings: settings_tx,
            task: Mutex::new(Some(task)),
        })
    }
}

/// Control surface of a running strategy
pub struct StrategyHandle {
    kind: CaptureStrategy,
    token: CancellationToken,
    counters: Arc<StrategyCounters>,
    settings: watch::Sender<LiveSettings>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StrategyHandle {
    pub fn kind(&self) -> CaptureStrategy {
        self.kind
    }

    /// Cancel the strategy and wait for its in-flight work to finish.
    /// Calling it again is a no-op.
    pub async fn stop(&self) {
        self.token.cancel();
        let task = self.task.lock().take();
        let Some(mut task) = task else {
            return;
        };

        match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
            Ok(Ok(())) => debug!("{} strategy stopped", self.kind),
            Ok(Err(e)) => warn!("{} strategy task ended abnormally: {}", self.kind, e),
            Err(_) => {
                warn!(
                    "{} strategy did not stop within {:?}, aborting",
                    self.kind, STOP_TIMEOUT
                );
                task.abort();
            }
        }
        self.counters.finish();
    }

    pub fn frame_count(&self) -> u64 {
        self.counters.frames.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.counters.active.load(Ordering::SeqCst) && !self.token.is_cancelled()
    }

    /// Rate the strategy is currently aiming for
    pub fn effective_fps(&self) -> u32 {
        self.counters.effective_fps.load(Ordering::Relaxed)
    }

    /// Consecutive failed frame acknowledgments; always 0 for poll
    pub fn ack_failures(&self) -> u32 {
        self.counters.ack_failures.load(Ordering::Relaxed)
    }

    pub fn settings(&self) -> LiveSettings {
        *self.settings.borrow()
    }

    /// Applies from the next capture on
    pub fn update_quality(&self, quality: u8) {
        let quality = quality.clamp(1, 100);
        self.settings.send_if_modified(|live| {
            let changed = live.quality != quality;
            live.quality = quality;
            changed
        });
    }

    /// Applies from the next capture on
    pub fn update_target_fps(&self, target_fps: u32) {
        let target_fps = target_fps.max(1);
        self.settings.send_if_modified(|live| {
            let changed = live.target_fps != target_fps;
            live.target_fps = target_fps;
            changed
        });
    }
}

/// Sleep unless cancelled first; returns `false` on cancellation
async fn pause(token: &CancellationToken, duration: Duration) -> bool {
    if duration.is_zero() {
        return !token.is_cancelled();
    }
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

fn elapsed_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Record a frame, emit the periodic summary and forward stats when due
fn report_frame(
    collector: &SharedCollector,
    connection: &ConnectionManager,
    timing: FrameTiming,
) {
    let message = {
        let mut collector = collector.lock();
        collector.record_frame(timing);
        if collector.should_log_summary() {
            collector.log_summary();
        }
        if collector.should_emit_stats() {
            Some(collector.stats_message())
        } else {
            None
        }
    };

    let Some(message) = message else {
        return;
    };
    if !connection.is_ready() {
        return;
    }
    match serde_json::to_string(&message) {
        Ok(text) => {
            if let Err(e) = connection.send_text(text) {
                debug!("Failed to send stats message: {}", e);
            }
        }
        Err(e) => warn!("Failed to serialize stats message: {}", e),
    }
}
