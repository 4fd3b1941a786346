use crate::source::{ScreencastOptions, SourceId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Live screencast subscription held by a session
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub session_id: String,
    pub options: ScreencastOptions,
    pub started_at: DateTime<Utc>,
}

/// Cross-session map of source to its screencast subscription.
///
/// Entries are removed explicitly when the owning session tears the
/// subscription down; nothing expires on its own.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<SourceId, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, source: SourceId, subscription: Subscription) -> Option<Subscription> {
        debug!(
            "Registering subscription on {} for session {}",
            source, subscription.session_id
        );
        let previous = self.entries.lock().insert(source.clone(), subscription);
        if let Some(previous) = &previous {
            warn!(
                "Source {} was already subscribed by session {}",
                source, previous.session_id
            );
        }
        previous
    }

    pub fn get(&self, source: &SourceId) -> Option<Subscription> {
        self.entries.lock().get(source).cloned()
    }

    pub fn contains(&self, source: &SourceId) -> bool {
        self.entries.lock().contains_key(source)
    }

    /// Remove the entry for `source` if `session_id` owns it
    pub fn release(&self, source: &SourceId, session_id: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(source) {
            Some(entry) if entry.session_id == session_id => {
                entries.remove(source);
                debug!("Released subscription on {} for session {}", source, session_id);
                true
            }
            _ => false,
        }
    }

    /// Remove every entry owned by a session; returns how many were dropped
    pub fn release_session(&self, session_id: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.session_id != session_id);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
