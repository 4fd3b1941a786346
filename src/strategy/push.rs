use super::{
    elapsed_ms, pause, report_frame, LiveSettings, StrategyContext, StrategyCounters, Subscription,
};
use crate::error::CaptureError;
use crate::performance::{encode_frame, FrameHeader, FrameTiming};
use crate::source::{CaptureSource, ScreencastFrame, ScreencastOptions};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Why a subscription ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionExit {
    Cancelled,
    SourceChanged,
    SourceGone,
    SettingsChanged,
    StreamEnded,
}

/// Forwards frames emitted by the source, acknowledging every one of them
pub struct PushStrategy {
    ctx: StrategyContext,
    live: watch::Receiver<LiveSettings>,
    token: CancellationToken,
    counters: Arc<StrategyCounters>,
    consecutive_ack_failures: u32,
    last_send_ms: f64,
}

impl PushStrategy {
    pub(crate) fn new(
        ctx: StrategyContext,
        live: watch::Receiver<LiveSettings>,
        token: CancellationToken,
        counters: Arc<StrategyCounters>,
    ) -> Self {
        Self {
            ctx,
            live,
            token,
            counters,
            consecutive_ack_failures: 0,
            last_send_ms: 0.0,
        }
    }

    pub async fn run(mut self) {
        let session = self.ctx.session_id.clone();

        loop {
            if self.token.is_cancelled() {
                break;
            }

            let Some(source) = self.ctx.provider.current() else {
                info!(session = %session, "Capture source is gone, ending push capture");
                break;
            };

            let settings = *self.live.borrow_and_update();
            let options = ScreencastOptions {
                quality: settings.quality,
                scale: self.ctx.settings.scale,
                max_fps: settings.target_fps,
            };
            self.counters.set_fps(settings.target_fps);

            let frames = match source.start_screencast(options).await {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(session = %session, "Failed to subscribe to {}: {}", source.id(), e);
                    if !pause(&self.token, self.ctx.settings.identity_check_interval()).await {
                        break;
                    }
                    continue;
                }
            };

            self.ctx.registry.insert(
                source.id(),
                Subscription {
                    session_id: session.clone(),
                    options,
                    started_at: Utc::now(),
                },
            );
            info!(
                session = %session,
                "Subscribed to {} at quality {}, max {} fps",
                source.id(), options.quality, options.max_fps
            );

            let exit = self.forward(source.as_ref(), frames).await;
            self.unsubscribe(source.as_ref()).await;

            match exit {
                SubscriptionExit::Cancelled | SubscriptionExit::SourceGone => break,
                SubscriptionExit::SourceChanged => {
                    info!(session = %session, "Capture source changed, re-subscribing");
                }
                SubscriptionExit::SettingsChanged => {
                    debug!(session = %session, "Settings changed, re-subscribing");
                }
                SubscriptionExit::StreamEnded => {
                    warn!(session = %session, "Frame stream from {} ended", source.id());
                    if !pause(&self.token, self.ctx.settings.identity_check_interval()).await {
                        break;
                    }
                }
            }
        }

        self.counters.finish();
        info!(session = %session, "Push capture stopped");
    }

    async fn forward(
        &mut self,
        source: &dyn CaptureSource,
        mut frames: mpsc::Receiver<ScreencastFrame>,
    ) -> SubscriptionExit {
        let source_id = source.id();
        let period = self
            .ctx
            .settings
            .identity_check_interval()
            .max(Duration::from_millis(1));
        let mut identity_check = tokio::time::interval(period);
        identity_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        identity_check.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return SubscriptionExit::Cancelled,
                changed = self.live.changed() => {
                    if changed.is_err() {
                        return SubscriptionExit::Cancelled;
                    }
                    return SubscriptionExit::SettingsChanged;
                }
                _ = identity_check.tick() => {
                    match self.ctx.provider.current() {
                        None => return SubscriptionExit::SourceGone,
                        Some(current) if current.id() != source_id => {
                            return SubscriptionExit::SourceChanged;
                        }
                        Some(_) => {}
                    }
                }
                frame = frames.recv() => match frame {
                    Some(frame) => self.handle_frame(source, frame).await,
                    None => return SubscriptionExit::StreamEnded,
                }
            }
        }
    }

    async fn handle_frame(&mut self, source: &dyn CaptureSource, frame: ScreencastFrame) {
        let started = Instant::now();
        let frame_index = frame.frame_index;
        let frame_bytes = frame.data.len();
        self.counters.frame();

        if !self.ctx.connection.is_ready() {
            trace!("Connection not ready, skipping frame {}", frame_index);
            self.acknowledge(source, frame_index).await;
            report_frame(
                &self.ctx.collector,
                &self.ctx.connection,
                FrameTiming {
                    frame_bytes,
                    skipped: true,
                    total_ms: Some(elapsed_ms(started.elapsed())),
                    ..Default::default()
                },
            );
            return;
        }

        let header = FrameHeader {
            frame_id: frame_index,
            capture_ms: 0.0,
            compare_ms: 0.0,
            ws_send_ms: self.last_send_ms,
            frame_bytes,
        };

        let mut timing = FrameTiming {
            frame_bytes,
            ..Default::default()
        };
        match encode_frame(&header, &frame.data) {
            Ok(payload) => {
                let send_started = Instant::now();
                match self.ctx.connection.send_frame(payload) {
                    Ok(()) => {
                        timing.send_ms = elapsed_ms(send_started.elapsed());
                        self.last_send_ms = timing.send_ms;
                    }
                    Err(e) => {
                        debug!("Failed to forward frame {}: {}", frame_index, e);
                        timing.skipped = true;
                    }
                }
            }
            Err(e) => {
                warn!("Failed to encode frame {}: {}", frame_index, e);
                timing.skipped = true;
            }
        }
        timing.total_ms = Some(elapsed_ms(started.elapsed()));
        report_frame(&self.ctx.collector, &self.ctx.connection, timing);

        self.acknowledge(source, frame_index).await;
    }

    async fn acknowledge(&mut self, source: &dyn CaptureSource, frame_index: u64) {
        let ack_timeout = self.ctx.settings.ack_timeout();
        let details = match tokio::time::timeout(ack_timeout, source.ack_frame(frame_index)).await {
            Ok(Ok(())) => {
                self.consecutive_ack_failures = 0;
                self.counters.set_ack_failures(0);
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", ack_timeout),
        };

        let failure = CaptureError::AckFailed {
            frame_index,
            details,
        };
        self.consecutive_ack_failures += 1;
        self.counters.set_ack_failures(self.consecutive_ack_failures);
        if self.consecutive_ack_failures >= self.ctx.settings.ack_failure_threshold {
            error!(
                session = %self.ctx.session_id,
                "{} ({} in a row); the session may need restarting",
                failure, self.consecutive_ack_failures
            );
        } else {
            warn!(session = %self.ctx.session_id, "{}", failure);
        }
    }

    async fn unsubscribe(&self, source: &dyn CaptureSource) {
        if let Err(e) = source.stop_screencast().await {
            debug!("Error stopping screencast on {}: {}", source.id(), e);
        }
        self.ctx
            .registry
            .release(&source.id(), &self.ctx.session_id);
    }
}
