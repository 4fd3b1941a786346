//! Adaptive frame-rate control.
//!
//! The controller watches one signal, the time spent capturing a frame, and
//! compares it with the share of the frame budget capture is allowed to use
//! (`target_utilization`). Every transition is a pure function: it takes the
//! prior [`ControllerState`] by reference and returns a fresh state inside a
//! [`FrameDecision`]. Callers own the state and must serialize access to it.

use crate::error::{PagecastError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::SystemTime;
use tracing::debug;

/// Number of capture samples the controller averages over
pub const CAPTURE_HISTORY_CAPACITY: usize = 10;

/// Fixed reduction factor applied on a capture timeout
const TIMEOUT_REDUCTION_FACTOR: f64 = 0.25;
/// Minimum FPS drop on a capture timeout
const TIMEOUT_MIN_REDUCTION: f64 = 2.0;
/// Upper bound on samples required before the first adjustment
const MIN_SAMPLES_CAP: u32 = 3;

/// Resolved controller configuration, immutable for a session
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControllerConfig {
    pub min_fps: f64,
    pub max_fps: f64,
    pub target_utilization: f64,
    pub smoothing: f64,
    pub adjustment_interval: u32,
    pub increase_threshold: f64,
    pub decrease_threshold: f64,
}

/// Partial controller configuration as supplied by callers and config files
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ControllerOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_fps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_utilization: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smoothing: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjustment_interval: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub increase_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decrease_threshold: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentDirection {
    Up,
    Down,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentReason {
    TooSlow,
    TooFast,
}

impl AdjustmentReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentReason::TooSlow => "too_slow",
            AdjustmentReason::TooFast => "too_fast",
        }
    }
}

/// Controller state owned by a single poll session
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerState {
    pub current_fps: f64,
    pub recent_captures: VecDeque<f64>,
    pub frames_since_adjustment: u32,
    pub total_frames: u64,
    pub last_adjustment: AdjustmentDirection,
    pub last_adjustment_time: Option<SystemTime>,
}

/// Why and how the rate changed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdjustmentDiagnostics {
    pub previous_fps: f64,
    pub avg_capture_ms: f64,
    pub target_capture_ms: f64,
    pub ideal_fps: f64,
    pub reason: AdjustmentReason,
}

/// Result of feeding one sample into the controller
#[derive(Debug, Clone, PartialEq)]
pub struct FrameDecision {
    pub state: ControllerState,
    pub adjusted: bool,
    pub new_fps: u32,
    pub interval_ms: u64,
    pub diagnostics: Option<AdjustmentDiagnostics>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            min_fps: 2.0,
            max_fps: 30.0,
            target_utilization: 0.7,
            smoothing: 0.25,
            adjustment_interval: 3,
            increase_threshold: 0.6,
            decrease_threshold: 1.15,
        }
    }
}

impl ControllerConfig {
    /// Merge overrides over the defaults for a controller starting at `initial_fps`.
    ///
    /// When no explicit `max_fps` is given it is raised to at least
    /// `initial_fps`. Malformed combinations are rejected here so that a
    /// running session never sees them.
    pub fn resolve(initial_fps: impl Into<f64>, overrides: &ControllerOverrides) -> Result<Self> {
        let initial_fps = initial_fps.into();
        let defaults = Self::default();

        let max_fps = match overrides.max_fps {
            Some(max_fps) => max_fps,
            None => defaults.max_fps.max(initial_fps),
        };

        let config = Self {
            min_fps: overrides.min_fps.unwrap_or(defaults.min_fps),
            max_fps,
            target_utilization: overrides
                .target_utilization
                .unwrap_or(defaults.target_utilization),
            smoothing: overrides.smoothing.unwrap_or(defaults.smoothing),
            adjustment_interval: overrides
                .adjustment_interval
                .unwrap_or(defaults.adjustment_interval),
            increase_threshold: overrides
                .increase_threshold
                .unwrap_or(defaults.increase_threshold),
            decrease_threshold: overrides
                .decrease_threshold
                .unwrap_or(defaults.decrease_threshold),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.min_fps > 0.0) || !self.min_fps.is_finite() {
            return Err(PagecastError::invalid_config(
                "controller min_fps must be a positive number",
            ));
        }
        if !self.max_fps.is_finite() || self.min_fps > self.max_fps {
            return Err(PagecastError::invalid_config(format!(
                "controller min_fps ({}) must not exceed max_fps ({})",
                self.min_fps, self.max_fps
            )));
        }
        if !(self.target_utilization > 0.0 && self.target_utilization < 1.0) {
            return Err(PagecastError::invalid_config(
                "controller target_utilization must be in (0, 1)",
            ));
        }
        if !(self.smoothing > 0.0 && self.smoothing < 1.0) {
            return Err(PagecastError::invalid_config(
                "controller smoothing must be in (0, 1)",
            ));
        }
        if self.adjustment_interval < 1 {
            return Err(PagecastError::invalid_config(
                "controller adjustment_interval must be at least 1",
            ));
        }
        if !(self.increase_threshold > 0.0
            && self.increase_threshold < 1.0
            && self.decrease_threshold > 1.0)
        {
            return Err(PagecastError::invalid_config(
                "controller thresholds must satisfy increase < 1 < decrease",
            ));
        }
        Ok(())
    }

    fn clamp(&self, fps: f64) -> f64 {
        fps.clamp(self.min_fps, self.max_fps)
    }
}

impl ControllerState {
    fn new(initial_fps: f64) -> Self {
        Self {
            current_fps: initial_fps,
            recent_captures: VecDeque::with_capacity(CAPTURE_HISTORY_CAPACITY),
            frames_since_adjustment: 0,
            total_frames: 0,
            last_adjustment: AdjustmentDirection::None,
            last_adjustment_time: None,
        }
    }

    fn push_capture(&mut self, capture_ms: f64) {
        if self.recent_captures.len() == CAPTURE_HISTORY_CAPACITY {
            self.recent_captures.pop_front();
        }
        self.recent_captures.push_back(capture_ms);
    }

    fn average_capture(&self) -> f64 {
        if self.recent_captures.is_empty() {
            return 0.0;
        }
        self.recent_captures.iter().sum::<f64>() / self.recent_captures.len() as f64
    }

    fn decision(self, adjusted: bool, diagnostics: Option<AdjustmentDiagnostics>) -> FrameDecision {
        FrameDecision {
            new_fps: current_fps(&self),
            interval_ms: interval_ms(&self),
            state: self,
            adjusted,
            diagnostics,
        }
    }
}

/// Build the initial state and resolved config for a new controller
pub fn create_controller(
    initial_fps: impl Into<f64>,
    overrides: &ControllerOverrides,
) -> Result<(ControllerState, ControllerConfig)> {
    let initial_fps = initial_fps.into();
    let config = ControllerConfig::resolve(initial_fps, overrides)?;
    let state = ControllerState::new(config.clamp(initial_fps));
    Ok((state, config))
}

/// Frame interval for the state's current rate
pub fn interval_ms(state: &ControllerState) -> u64 {
    (1000.0 / state.current_fps).floor() as u64
}

/// Current rate rounded for display and headers
pub fn current_fps(state: &ControllerState) -> u32 {
    state.current_fps.round() as u32
}

fn ideal_fps(avg_capture_ms: f64, config: &ControllerConfig) -> f64 {
    if avg_capture_ms <= 0.0 {
        return config.max_fps;
    }
    config.clamp(1000.0 / (avg_capture_ms / config.target_utilization))
}

fn target_capture_ms(fps: f64, config: &ControllerConfig) -> f64 {
    (1000.0 / fps) * config.target_utilization
}

/// Feed one capture duration into the controller
pub fn process_frame(
    state: &ControllerState,
    capture_ms: f64,
    config: &ControllerConfig,
) -> FrameDecision {
    process_frame_at(state, capture_ms, config, SystemTime::now())
}

/// [`process_frame`] with an explicit clock, for deterministic callers
pub fn process_frame_at(
    state: &ControllerState,
    capture_ms: f64,
    config: &ControllerConfig,
    now: SystemTime,
) -> FrameDecision {
    let mut next = state.clone();
    next.push_capture(capture_ms);
    next.frames_since_adjustment = next.frames_since_adjustment.saturating_add(1);
    next.total_frames += 1;

    let min_samples = config.adjustment_interval.min(MIN_SAMPLES_CAP) as usize;
    if next.frames_since_adjustment < config.adjustment_interval
        || next.recent_captures.len() < min_samples
    {
        return next.decision(false, None);
    }

    let previous_fps = next.current_fps;
    let avg_capture_ms = next.average_capture();
    let target_ms = target_capture_ms(previous_fps, config);
    let ideal = ideal_fps(avg_capture_ms, config);

    let (candidate, direction, reason) = if avg_capture_ms > target_ms * config.decrease_threshold
    {
        let stepped = previous_fps + config.smoothing * (ideal - previous_fps);
        (
            stepped.floor().max(config.min_fps),
            AdjustmentDirection::Down,
            AdjustmentReason::TooSlow,
        )
    } else if avg_capture_ms < target_ms * config.increase_threshold
        && previous_fps < config.max_fps
    {
        let stepped = previous_fps + config.smoothing * (ideal - previous_fps);
        (
            stepped.ceil().min(config.max_fps),
            AdjustmentDirection::Up,
            AdjustmentReason::TooFast,
        )
    } else {
        return next.decision(false, None);
    };

    let candidate = config.clamp(candidate);
    if candidate == previous_fps {
        return next.decision(false, None);
    }

    next.current_fps = candidate;
    next.frames_since_adjustment = 0;
    next.last_adjustment = direction;
    next.last_adjustment_time = Some(now);

    debug!(
        "Rate adjusted {:?}: {:.1} -> {:.1} fps (avg capture {:.1}ms, target {:.1}ms)",
        direction, previous_fps, candidate, avg_capture_ms, target_ms
    );

    let diagnostics = AdjustmentDiagnostics {
        previous_fps,
        avg_capture_ms,
        target_capture_ms: target_ms,
        ideal_fps: ideal,
        reason,
    };
    next.decision(true, Some(diagnostics))
}

/// Apply the immediate, ungated reduction for a capture that hit its timeout
pub fn handle_timeout(
    state: &ControllerState,
    timeout_ms: f64,
    config: &ControllerConfig,
) -> FrameDecision {
    handle_timeout_at(state, timeout_ms, config, SystemTime::now())
}

/// [`handle_timeout`] with an explicit clock
pub fn handle_timeout_at(
    state: &ControllerState,
    timeout_ms: f64,
    config: &ControllerConfig,
    now: SystemTime,
) -> FrameDecision {
    let mut next = state.clone();
    next.push_capture(timeout_ms);
    next.total_frames += 1;

    let previous_fps = next.current_fps;
    let reduction = TIMEOUT_MIN_REDUCTION.max((previous_fps * TIMEOUT_REDUCTION_FACTOR).floor());
    let candidate = config.clamp((previous_fps - reduction).max(config.min_fps));

    next.current_fps = candidate;
    next.frames_since_adjustment = 0;
    next.last_adjustment = AdjustmentDirection::Down;
    next.last_adjustment_time = Some(now);

    let avg_capture_ms = next.average_capture();
    let diagnostics = AdjustmentDiagnostics {
        previous_fps,
        avg_capture_ms,
        target_capture_ms: target_capture_ms(previous_fps, config),
        ideal_fps: ideal_fps(avg_capture_ms, config),
        reason: AdjustmentReason::TooSlow,
    };

    debug!(
        "Capture timeout ({:.0}ms): rate {:.1} -> {:.1} fps",
        timeout_ms, previous_fps, candidate
    );

    next.decision(candidate != previous_fps, Some(diagnostics))
}

/// Owned controller for a single session loop
#[derive(Debug, Clone)]
pub struct RateController {
    state: ControllerState,
    config: ControllerConfig,
}

impl RateController {
    pub fn new(initial_fps: impl Into<f64>, overrides: &ControllerOverrides) -> Result<Self> {
        let (state, config) = create_controller(initial_fps, overrides)?;
        Ok(Self { state, config })
    }

    pub fn record_capture(&mut self, capture_ms: f64) -> FrameDecision {
        let decision = process_frame(&self.state, capture_ms, &self.config);
        self.state = decision.state.clone();
        decision
    }

    pub fn record_timeout(&mut self, timeout_ms: f64) -> FrameDecision {
        let decision = handle_timeout(&self.state, timeout_ms, &self.config);
        self.state = decision.state.clone();
        decision
    }

    pub fn interval_ms(&self) -> u64 {
        interval_ms(&self.state)
    }

    pub fn current_fps(&self) -> u32 {
        current_fps(&self.state)
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }
}
