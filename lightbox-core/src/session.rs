//! Tracking of the single active GUI session.

use std::sync::Arc;

use parking_lot::RwLock;

/// The session id of the most recent `get_directory_files` caller.
///
/// Stamped onto preview tasks so expensive work can be abandoned when the
/// user navigates away, and consulted by the notification bus to drop
/// stale session-tagged notifications.
#[derive(Clone, Default)]
pub struct ActiveSession(Arc<RwLock<Option<String>>>);

impl ActiveSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().clone()
    }

    pub fn set(&self, session_id: impl Into<String>) {
        *self.0.write() = Some(session_id.into());
    }

    /// Clear only if the given session is still the active one, so a stale
    /// disconnect cannot wipe a newer session.
    pub fn clear_if(&self, session_id: &str) -> bool {
        let mut guard = self.0.write();
        if guard.as_deref() == Some(session_id) {
            *guard = None;
            true
        } else {
            false
        }
    }

    /// True when the supplied id matches the active session. A `None`
    /// never matches; session-less work must not rely on this check.
    pub fn matches(&self, session_id: &str) -> bool {
        self.0.read().as_deref() == Some(session_id)
    }
}

impl std::fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ActiveSession").field(&self.get()).finish()
    }
}
