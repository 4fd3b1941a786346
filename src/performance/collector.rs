use super::stats::{AggregatedStats, Bottleneck, Percentiles};
use crate::config::CollectorConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

/// Collector shared between a session's strategy and the orchestrator
pub type SharedCollector = Arc<Mutex<PerformanceCollector>>;

/// Timings measured for one captured or attempted frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameTiming {
    pub capture_ms: f64,
    pub compare_ms: f64,
    pub send_ms: f64,
    /// End-to-end time; defaults to the sum of the stages when unset
    pub total_ms: Option<f64>,
    pub frame_bytes: usize,
    pub skipped: bool,
}

/// Immutable record kept in the collector window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameTimingRecord {
    pub sequence_number: u64,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub capture_duration_ms: f64,
    pub compare_duration_ms: f64,
    pub send_duration_ms: f64,
    pub total_driver_ms: f64,
    pub frame_bytes: usize,
    pub skipped: bool,
}

/// Periodic message for external dashboards
#[derive(Debug, Clone, Serialize)]
pub struct StatsMessage {
    #[serde(rename = "type")]
    pub message_type: &'static str,
    pub session_id: String,
    pub stats: AggregatedStats,
}

/// Bounded per-session history of frame timings
#[derive(Debug)]
pub struct PerformanceCollector {
    session_id: String,
    capacity: usize,
    log_interval: u64,
    stats_interval: u64,
    target_fps: f64,
    records: VecDeque<FrameTimingRecord>,
    next_sequence: u64,
    total_frames: u64,
    skipped_frames: u64,
}

impl PerformanceCollector {
    pub fn new(session_id: impl Into<String>, config: &CollectorConfig, target_fps: f64) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            session_id: session_id.into(),
            capacity,
            log_interval: config.log_interval,
            stats_interval: config.stats_interval,
            target_fps,
            records: VecDeque::with_capacity(capacity),
            next_sequence: 0,
            total_frames: 0,
            skipped_frames: 0,
        }
    }

    pub fn shared(self) -> SharedCollector {
        Arc::new(Mutex::new(self))
    }

    /// Record a frame stamped with the current wall clock
    pub fn record_frame(&mut self, timing: FrameTiming) -> u64 {
        self.record_frame_at(timing, Utc::now())
    }

    /// Record a frame with an explicit timestamp; returns its sequence number
    pub fn record_frame_at(&mut self, timing: FrameTiming, timestamp: DateTime<Utc>) -> u64 {
        self.next_sequence += 1;
        let sequence_number = self.next_sequence;

        let total_driver_ms = timing
            .total_ms
            .unwrap_or(timing.capture_ms + timing.compare_ms + timing.send_ms);

        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(FrameTimingRecord {
            sequence_number,
            session_id: self.session_id.clone(),
            timestamp,
            capture_duration_ms: timing.capture_ms,
            compare_duration_ms: timing.compare_ms,
            send_duration_ms: timing.send_ms,
            total_driver_ms,
            frame_bytes: timing.frame_bytes,
            skipped: timing.skipped,
        });

        self.total_frames += 1;
        if timing.skipped {
            self.skipped_frames += 1;
        }

        sequence_number
    }

    pub fn should_log_summary(&self) -> bool {
        self.log_interval > 0 && self.total_frames > 0 && self.total_frames % self.log_interval == 0
    }

    pub fn should_emit_stats(&self) -> bool {
        self.stats_interval > 0
            && self.total_frames > 0
            && self.total_frames % self.stats_interval == 0
    }

    /// Frame budget the bottleneck classifier measures against
    pub fn set_target_fps(&mut self, target_fps: f64) {
        self.target_fps = target_fps;
    }

    pub fn aggregated_stats(&self) -> AggregatedStats {
        if self.records.is_empty() {
            return AggregatedStats::empty(self.total_frames, self.skipped_frames, self.target_fps);
        }

        let capture: Vec<f64> = self.records.iter().map(|r| r.capture_duration_ms).collect();
        let total: Vec<f64> = self.records.iter().map(|r| r.total_driver_ms).collect();
        let capture_ms = Percentiles::from_samples(&capture);
        let total_ms = Percentiles::from_samples(&total);

        let frame_count = self.records.len();
        let window_duration_ms = match (self.records.front(), self.records.back()) {
            (Some(first), Some(last)) => (last.timestamp - first.timestamp)
                .num_microseconds()
                .map(|us| us as f64 / 1000.0)
                .unwrap_or(0.0)
                .max(0.0),
            _ => 0.0,
        };
        let actual_fps = if window_duration_ms > 0.0 {
            frame_count as f64 / window_duration_ms * 1000.0
        } else {
            0.0
        };

        let sent: Vec<&FrameTimingRecord> = self.records.iter().filter(|r| !r.skipped).collect();
        let total_bytes: u64 = sent.iter().map(|r| r.frame_bytes as u64).sum();
        let avg_frame_bytes = if sent.is_empty() {
            0.0
        } else {
            total_bytes as f64 / sent.len() as f64
        };

        AggregatedStats {
            frame_count,
            total_frames: self.total_frames,
            skipped_frames: self.skipped_frames,
            window_duration_ms,
            target_fps: self.target_fps,
            actual_fps,
            bottleneck: Bottleneck::classify(&capture_ms, &total_ms, self.target_fps),
            capture_ms,
            total_ms,
            avg_frame_bytes,
            total_bytes,
        }
    }

    pub fn stats_message(&self) -> StatsMessage {
        StatsMessage {
            message_type: "perf_stats",
            session_id: self.session_id.clone(),
            stats: self.aggregated_stats(),
        }
    }

    /// Emit the periodic summary line
    pub fn log_summary(&self) {
        let stats = self.aggregated_stats();
        info!(
            session = %self.session_id,
            "Frame stats: {} frames ({} skipped), {:.1}/{:.1} fps, capture p50={:.1}ms p90={:.1}ms, total p90={:.1}ms, avg {:.0} bytes; {}",
            stats.total_frames,
            stats.skipped_frames,
            stats.actual_fps,
            stats.target_fps,
            stats.capture_ms.p50,
            stats.capture_ms.p90,
            stats.total_ms.p90,
            stats.avg_frame_bytes,
            stats.bottleneck.message
        );
    }

    pub fn records(&self) -> impl Iterator<Item = &FrameTimingRecord> {
        self.records.iter()
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn skipped_frames(&self) -> u64 {
        self.skipped_frames
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Drop all accumulated state for an in-place restart
    pub fn reset(&mut self) {
        debug!("Resetting performance collector for session {}", self.session_id);
        self.records.clear();
        self.next_sequence = 0;
        self.total_frames = 0;
        self.skipped_frames = 0;
    }
}
