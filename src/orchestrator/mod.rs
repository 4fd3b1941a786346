//! Session orchestration: picks a strategy per source, wires it to its own
//! connection and collector, and exposes the session lifecycle.

mod session;

pub use session::{SessionHandle, SessionSettings, SettingsUpdate};

use crate::config::{PagecastConfig, StreamSettings};
use crate::connection::{ConnectionManager, Connector, WebSocketConnector};
use crate::error::{PagecastError, Result, SessionError};
use crate::performance::{AggregatedStats, PerformanceCollector};
use crate::rate_controller::ControllerConfig;
use crate::source::SourceProvider;
use crate::strategy::{CaptureStrategy, StrategyContext, SubscriptionRegistry};
use parking_lot::RwLock;
use session::Session;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub struct StreamingOrchestrator {
    config: PagecastConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<SubscriptionRegistry>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl StreamingOrchestrator {
    /// Orchestrator streaming over WebSocket connections
    pub fn new(config: PagecastConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(WebSocketConnector))
    }

    pub fn with_connector(config: PagecastConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            connector,
            registry: Arc::new(SubscriptionRegistry::new()),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &PagecastConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Start streaming from `provider`'s current source.
    ///
    /// A fresh session id is generated when none is given. Invalid settings
    /// are rejected here, before anything is spawned.
    pub async fn start(
        &self,
        session_id: Option<String>,
        settings: StreamSettings,
        provider: Arc<dyn SourceProvider>,
    ) -> Result<SessionHandle> {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut config = self.config.clone();
        config.stream = settings.clone();
        config.validate()?;

        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session_id) {
            return Err(SessionError::AlreadyRunning { session_id }.into());
        }

        let source = provider.current().ok_or_else(|| SessionError::NoSource {
            session_id: session_id.clone(),
        })?;
        let strategy = CaptureStrategy::select(settings.strategy, source.as_ref());

        let address = config.connection.session_address(&session_id);
        let connection =
            ConnectionManager::new(address, &config.connection, Arc::clone(&self.connector));
        connection.connect();

        let collector =
            PerformanceCollector::new(&session_id, &config.collector, settings.target_fps as f64)
                .shared();

        let ctx = StrategyContext {
            session_id: session_id.clone(),
            provider,
            settings: settings.clone(),
            controller: config.controller.clone(),
            connection: connection.clone(),
            collector: Arc::clone(&collector),
            registry: Arc::clone(&self.registry),
        };
        let handle = match strategy.start(ctx) {
            Ok(handle) => handle,
            Err(e) => {
                connection.close();
                return Err(e);
            }
        };

        let session = Arc::new(Session::new(
            session_id.clone(),
            handle,
            connection,
            collector,
            settings,
            Arc::clone(&self.registry),
        ));
        let handle = session.handle();
        sessions.insert(session_id.clone(), session);

        info!(
            session = %session_id,
            "Streaming session started from {} using {} capture",
            source.id(), strategy
        );
        Ok(handle)
    }

    /// Stop a session. Returns `false` when it was already stopped or unknown.
    pub async fn stop(&self, handle: &SessionHandle) -> bool {
        let session = self.sessions.write().remove(handle.session_id());
        match session {
            Some(session) => session.stop().await,
            None => {
                debug!("Stop requested for inactive session {}", handle.session_id());
                false
            }
        }
    }

    /// Stop every running session
    pub async fn stop_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.stop().await;
        }
    }

    /// Tear down sessions whose strategy ended on its own, e.g. because the
    /// source went away. Returns the ids that were removed.
    pub async fn cleanup_finished(&self) -> Vec<String> {
        let finished: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| !session.strategy.is_active())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let mut removed = Vec::with_capacity(finished.len());
        for session in finished {
            info!(session = %session.id, "Capture ended, tearing down session");
            session.stop().await;
            removed.push(session.id.clone());
        }
        removed
    }

    /// Apply a live quality and/or target rate change
    pub fn update_settings(
        &self,
        handle: &SessionHandle,
        update: SettingsUpdate,
    ) -> Result<SessionSettings> {
        if let Some(quality) = update.quality {
            if quality == 0 || quality > 100 {
                return Err(PagecastError::invalid_config(format!(
                    "quality {} is outside 1-100",
                    quality
                )));
            }
        }
        if let Some(target_fps) = update.target_fps {
            if target_fps == 0 {
                return Err(PagecastError::invalid_config("target_fps must be greater than 0"));
            }
            ControllerConfig::resolve(target_fps, &self.config.controller)?;
        }

        let session = self.session(handle)?;
        session.apply(update);
        debug!(
            session = %session.id,
            "Settings updated: quality={:?} target_fps={:?}",
            update.quality, update.target_fps
        );
        Ok(session.snapshot())
    }

    pub fn get_settings(&self, handle: &SessionHandle) -> Result<SessionSettings> {
        Ok(self.session(handle)?.snapshot())
    }

    pub fn stats(&self, handle: &SessionHandle) -> Result<AggregatedStats> {
        Ok(self.session(handle)?.collector.lock().aggregated_stats())
    }

    /// Ids of sessions whose capture is still running
    pub fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .read()
            .values()
            .filter(|session| session.strategy.is_active())
            .map(|session| session.id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn session(&self, handle: &SessionHandle) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .get(handle.session_id())
            .cloned()
            .ok_or_else(|| {
                SessionError::NotFound {
                    session_id: handle.session_id().to_string(),
                }
                .into()
            })
    }
}
