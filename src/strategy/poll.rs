use super::{elapsed_ms, pause, report_frame, LiveSettings, StrategyContext, StrategyCounters};
use crate::error::CaptureError;
use crate::performance::{encode_frame, FrameHeader, FrameTiming};
use crate::rate_controller::{FrameDecision, RateController};
use crate::source::{CaptureRequest, CaptureSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Self-paced capture loop driven by the rate controller
pub struct PollStrategy {
    ctx: StrategyContext,
    controller: RateController,
    live: watch::Receiver<LiveSettings>,
    settings: LiveSettings,
    token: CancellationToken,
    counters: Arc<StrategyCounters>,
    consecutive_failures: u32,
    previous_frame: Option<Vec<u8>>,
    frame_id: u64,
    last_send_ms: f64,
}

impl PollStrategy {
    pub(crate) fn new(
        ctx: StrategyContext,
        controller: RateController,
        mut live: watch::Receiver<LiveSettings>,
        token: CancellationToken,
        counters: Arc<StrategyCounters>,
    ) -> Self {
        let settings = *live.borrow_and_update();
        Self {
            ctx,
            controller,
            live,
            settings,
            token,
            counters,
            consecutive_failures: 0,
            previous_frame: None,
            frame_id: 0,
            last_send_ms: 0.0,
        }
    }

    pub async fn run(mut self) {
        let session = self.ctx.session_id.clone();
        debug!(
            session = %session,
            "Poll loop starting at {} fps ({}ms interval)",
            self.controller.current_fps(),
            self.controller.interval_ms()
        );

        loop {
            if self.token.is_cancelled() {
                break;
            }
            let loop_started = Instant::now();
            self.apply_settings();
            let interval = Duration::from_millis(self.controller.interval_ms());

            if !self.ctx.connection.is_ready() {
                trace!("Connection not ready, waiting");
                if !pause(&self.token, self.ctx.settings.not_ready_retry()).await {
                    break;
                }
                continue;
            }

            if self.consecutive_failures >= self.ctx.settings.max_consecutive_failures {
                let backoff = interval * self.ctx.settings.failure_backoff_multiplier;
                warn!(
                    session = %session,
                    "{} consecutive capture failures, backing off for {:?}",
                    self.consecutive_failures, backoff
                );
                self.consecutive_failures = 0;
                if !pause(&self.token, backoff).await {
                    break;
                }
                continue;
            }

            let Some(source) = self.ctx.provider.current() else {
                info!(session = %session, "Capture source is gone, ending poll capture");
                break;
            };

            self.capture(source.as_ref()).await;

            let interval = Duration::from_millis(self.controller.interval_ms());
            let wait = interval.saturating_sub(loop_started.elapsed());
            if !pause(&self.token, wait).await {
                break;
            }
        }

        self.counters.finish();
        info!(session = %session, "Poll capture stopped");
    }

    /// Pick up quality and target rate changes made since the last capture
    fn apply_settings(&mut self) {
        if !self.live.has_changed().unwrap_or(false) {
            return;
        }
        let next = *self.live.borrow_and_update();

        if next.target_fps != self.settings.target_fps {
            match RateController::new(next.target_fps, &self.ctx.controller) {
                Ok(controller) => {
                    info!(
                        session = %self.ctx.session_id,
                        "Target fps changed from {} to {}",
                        self.settings.target_fps, next.target_fps
                    );
                    self.controller = controller;
                    self.counters.set_fps(self.controller.current_fps());
                }
                Err(e) => {
                    warn!("Ignoring target fps {}: {}", next.target_fps, e);
                    self.settings.quality = next.quality;
                    return;
                }
            }
        }
        if next.quality != self.settings.quality {
            debug!("Capture quality changed to {}", next.quality);
        }
        self.settings = next;
    }

    async fn capture(&mut self, source: &dyn CaptureSource) {
        let request = CaptureRequest {
            quality: self.settings.quality,
            scale: self.ctx.settings.scale,
        };
        let capture_timeout = self.ctx.settings.capture_timeout();

        let started = Instant::now();
        let result = tokio::time::timeout(capture_timeout, source.capture_once(request)).await;
        let capture_ms = elapsed_ms(started.elapsed());

        let data = match result {
            Ok(Ok(data)) => data,
            Ok(Err(e)) if e.is_recoverable() => {
                self.consecutive_failures += 1;
                warn!(
                    "Capture failed ({} consecutive): {}",
                    self.consecutive_failures, e
                );
                self.record_skipped(capture_ms, 0.0, 0);
                return;
            }
            Ok(Err(e)) => {
                // Retrying at the normal rate cannot help; back off right away
                self.consecutive_failures = self.ctx.settings.max_consecutive_failures;
                warn!("Capture source cannot serve frames: {}", e);
                self.record_skipped(capture_ms, 0.0, 0);
                return;
            }
            Err(_) => {
                self.consecutive_failures += 1;
                let decision = self.controller.record_timeout(elapsed_ms(capture_timeout));
                warn!(
                    "{}, rate lowered to {} fps",
                    CaptureError::Timeout {
                        timeout: capture_timeout
                    },
                    decision.new_fps
                );
                self.counters.set_fps(decision.new_fps);
                self.record_skipped(capture_ms, 0.0, 0);
                return;
            }
        };

        self.consecutive_failures = 0;
        self.counters.frame();
        let decision = self.controller.record_capture(capture_ms);
        self.log_decision(&decision);

        let compare_started = Instant::now();
        let duplicate = self.previous_frame.as_deref() == Some(data.as_slice());
        let compare_ms = elapsed_ms(compare_started.elapsed());

        if duplicate {
            trace!("Frame unchanged, not sending");
            self.record_skipped(capture_ms, compare_ms, data.len());
            return;
        }

        self.send(data, capture_ms, compare_ms, started);
    }

    fn send(&mut self, data: Vec<u8>, capture_ms: f64, compare_ms: f64, started: Instant) {
        self.frame_id += 1;
        let frame_bytes = data.len();
        let header = FrameHeader {
            frame_id: self.frame_id,
            capture_ms,
            compare_ms,
            ws_send_ms: self.last_send_ms,
            frame_bytes,
        };

        let payload = match encode_frame(&header, &data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode frame {}: {}", self.frame_id, e);
                self.record_skipped(capture_ms, compare_ms, frame_bytes);
                return;
            }
        };

        let send_started = Instant::now();
        let mut timing = FrameTiming {
            capture_ms,
            compare_ms,
            frame_bytes,
            ..Default::default()
        };
        match self.ctx.connection.send_frame(payload) {
            Ok(()) => {
                timing.send_ms = elapsed_ms(send_started.elapsed());
                self.last_send_ms = timing.send_ms;
                self.previous_frame = Some(data);
            }
            Err(e) => {
                debug!("Failed to send frame {}: {}", self.frame_id, e);
                timing.skipped = true;
            }
        }
        timing.total_ms = Some(elapsed_ms(started.elapsed()));

        report_frame(&self.ctx.collector, &self.ctx.connection, timing);
    }

    fn record_skipped(&self, capture_ms: f64, compare_ms: f64, frame_bytes: usize) {
        report_frame(
            &self.ctx.collector,
            &self.ctx.connection,
            FrameTiming {
                capture_ms,
                compare_ms,
                frame_bytes,
                skipped: true,
                ..Default::default()
            },
        );
    }

    fn log_decision(&self, decision: &FrameDecision) {
        if !decision.adjusted {
            return;
        }
        self.counters.set_fps(decision.new_fps);
        if let Some(diagnostics) = &decision.diagnostics {
            info!(
                session = %self.ctx.session_id,
                "Rate adjusted {} -> {} fps ({}): avg capture {:.1}ms vs target {:.1}ms, ideal {:.1} fps",
                diagnostics.previous_fps,
                decision.new_fps,
                diagnostics.reason.as_str(),
                diagnostics.avg_capture_ms,
                diagnostics.target_capture_ms,
                diagnostics.ideal_fps
            );
        }
    }
}
