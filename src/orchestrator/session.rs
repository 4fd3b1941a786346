use crate::config::StreamSettings;
use crate::connection::ConnectionManager;
use crate::performance::SharedCollector;
use crate::strategy::{CaptureStrategy, StrategyHandle, SubscriptionRegistry};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Caller-held reference to a running session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    session_id: String,
    strategy: CaptureStrategy,
}

impl SessionHandle {
    pub(crate) fn new(session_id: String, strategy: CaptureStrategy) -> Self {
        Self {
            session_id,
            strategy,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn strategy(&self) -> CaptureStrategy {
        self.strategy
    }
}

/// Partial live update; unset fields keep their current value
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct SettingsUpdate {
    pub quality: Option<u8>,
    pub target_fps: Option<u32>,
}

/// Snapshot of a session's settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSettings {
    pub session_id: String,
    pub strategy: &'static str,
    pub quality: u8,
    pub scale: f64,
    pub target_fps: u32,
    /// Rate the strategy is currently achieving or aiming for
    pub effective_fps: u32,
    pub address: String,
    pub frame_count: u64,
    pub active: bool,
    pub started_at: DateTime<Utc>,
}

pub(crate) struct Session {
    pub(crate) id: String,
    pub(crate) strategy: StrategyHandle,
    pub(crate) connection: ConnectionManager,
    pub(crate) collector: SharedCollector,
    pub(crate) settings: Mutex<StreamSettings>,
    pub(crate) started_at: DateTime<Utc>,
    registry: Arc<SubscriptionRegistry>,
    stopped: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        id: String,
        strategy: StrategyHandle,
        connection: ConnectionManager,
        collector: SharedCollector,
        settings: StreamSettings,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            id,
            strategy,
            connection,
            collector,
            settings: Mutex::new(settings),
            started_at: Utc::now(),
            registry,
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) fn handle(&self) -> SessionHandle {
        SessionHandle::new(self.id.clone(), self.strategy.kind())
    }

    pub(crate) fn apply(&self, update: SettingsUpdate) {
        let mut settings = self.settings.lock();
        if let Some(quality) = update.quality {
            settings.quality = quality;
            self.strategy.update_quality(quality);
        }
        if let Some(target_fps) = update.target_fps {
            settings.target_fps = target_fps;
            self.strategy.update_target_fps(target_fps);
            self.collector.lock().set_target_fps(target_fps as f64);
        }
    }

    pub(crate) fn snapshot(&self) -> SessionSettings {
        let settings = self.settings.lock();
        SessionSettings {
            session_id: self.id.clone(),
            strategy: self.strategy.kind().name(),
            quality: settings.quality,
            scale: settings.scale,
            target_fps: settings.target_fps,
            effective_fps: self.strategy.effective_fps(),
            address: self.connection.address().to_string(),
            frame_count: self.strategy.frame_count(),
            active: self.strategy.is_active(),
            started_at: self.started_at,
        }
    }

    /// Stop capturing, then close the connection. Only the first call acts.
    pub(crate) async fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Session {} already stopped", self.id);
            return false;
        }

        self.strategy.stop().await;
        self.connection.close();
        let released = self.registry.release_session(&self.id);
        if released > 0 {
            debug!("Released {} leftover subscriptions for {}", released, self.id);
        }

        let total_frames = self.collector.lock().total_frames();
        info!(
            session = %self.id,
            "Session stopped after {} frames",
            total_frames
        );
        true
    }
}
