use serde::Serialize;

/// Median capture time above which the whole system is considered slow
pub const SLOW_CAPTURE_THRESHOLD_MS: f64 = 100.0;
/// Share of the frame budget p90 capture may use before capture is the bottleneck
const CAPTURE_BUDGET_SHARE: f64 = 0.8;
/// End-to-end p90 above this share of the budget hints at the network
const NETWORK_BUDGET_SHARE: f64 = 1.5;
/// Capture must stay under this share of the budget for a network verdict
const NETWORK_CAPTURE_CEILING: f64 = 0.5;

/// Distribution summary for one timing series
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BottleneckKind {
    Capture,
    Network,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bottleneck {
    pub kind: BottleneckKind,
    pub message: String,
    /// Estimated time spent outside capture, for network verdicts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_overhead_ms: Option<f64>,
}

/// Statistics derived from the collector's current window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedStats {
    pub frame_count: usize,
    pub total_frames: u64,
    pub skipped_frames: u64,
    pub window_duration_ms: f64,
    pub target_fps: f64,
    pub actual_fps: f64,
    pub capture_ms: Percentiles,
    pub total_ms: Percentiles,
    pub avg_frame_bytes: f64,
    pub total_bytes: u64,
    pub bottleneck: Bottleneck,
}

impl Percentiles {
    /// Summarise an unsorted series
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        Self {
            p50: percentile(&sorted, 0.50),
            p90: percentile(&sorted, 0.90),
            p99: percentile(&sorted, 0.99),
            max: sorted[sorted.len() - 1],
        }
    }
}

/// Linear-interpolation percentile over an ascending slice.
///
/// The rank is `p * (n - 1)`; non-integral ranks interpolate between the
/// neighbouring samples.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = p.clamp(0.0, 1.0) * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            if lower == upper {
                sorted[lower]
            } else {
                let weight = rank - lower as f64;
                sorted[lower] + (sorted[upper] - sorted[lower]) * weight
            }
        }
    }
}

impl Bottleneck {
    pub fn none() -> Self {
        Self {
            kind: BottleneckKind::None,
            message: "No significant bottleneck detected".to_string(),
            estimated_overhead_ms: None,
        }
    }

    fn no_data() -> Self {
        Self {
            kind: BottleneckKind::None,
            message: "No frames recorded yet".to_string(),
            estimated_overhead_ms: None,
        }
    }

    /// Best-effort label for which stage dominates latency
    pub fn classify(capture: &Percentiles, total: &Percentiles, target_fps: f64) -> Self {
        let budget_ms = if target_fps > 0.0 {
            1000.0 / target_fps
        } else {
            f64::INFINITY
        };

        if capture.p90 > budget_ms * CAPTURE_BUDGET_SHARE {
            return Self {
                kind: BottleneckKind::Capture,
                message: format!(
                    "p90 capture time {:.1}ms exceeds {:.0}% of the {:.1}ms frame budget",
                    capture.p90,
                    CAPTURE_BUDGET_SHARE * 100.0,
                    budget_ms
                ),
                estimated_overhead_ms: None,
            };
        }

        if capture.p50 > SLOW_CAPTURE_THRESHOLD_MS {
            return Self {
                kind: BottleneckKind::Capture,
                message: format!(
                    "median capture time {:.1}ms exceeds {:.0}ms; the host is slow overall",
                    capture.p50, SLOW_CAPTURE_THRESHOLD_MS
                ),
                estimated_overhead_ms: None,
            };
        }

        if total.p90 > budget_ms * NETWORK_BUDGET_SHARE
            && capture.p90 < budget_ms * NETWORK_CAPTURE_CEILING
        {
            let overhead = (total.p90 - capture.p90).max(0.0);
            return Self {
                kind: BottleneckKind::Network,
                message: format!(
                    "p90 end-to-end time {:.1}ms exceeds {:.0}% of the {:.1}ms frame budget while capture stays at {:.1}ms; ~{:.1}ms spent outside capture",
                    total.p90,
                    NETWORK_BUDGET_SHARE * 100.0,
                    budget_ms,
                    capture.p90,
                    overhead
                ),
                estimated_overhead_ms: Some(overhead),
            };
        }

        Self::none()
    }
}

impl AggregatedStats {
    /// Well-defined result for a collector with no records
    pub fn empty(total_frames: u64, skipped_frames: u64, target_fps: f64) -> Self {
        Self {
            frame_count: 0,
            total_frames,
            skipped_frames,
            window_duration_ms: 0.0,
            target_fps,
            actual_fps: 0.0,
            capture_ms: Percentiles::default(),
            total_ms: Percentiles::default(),
            avg_frame_bytes: 0.0,
            total_bytes: 0,
            bottleneck: Bottleneck::no_data(),
        }
    }
}
