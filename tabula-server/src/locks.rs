//! Per-session advisory locks.
//!
//! A chat turn holds the lock for its whole lifetime, upstream round trip
//! included, so a second request against the same session is rejected up
//! front instead of being queued behind a slow webhook.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct SessionLocks {
    held: Mutex<HashSet<String>>,
}

impl SessionLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Non-blocking acquire. `None` means another turn is in flight for
    /// this session.
    pub fn try_acquire(self: &Arc<Self>, session_id: &str) -> Option<SessionLockGuard> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.insert(session_id.to_string()) {
            Some(SessionLockGuard {
                locks: Arc::clone(self),
                session_id: session_id.to_string(),
            })
        } else {
            None
        }
    }

    fn release(&self, session_id: &str) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(session_id);
    }
}

/// Releases the session slot on drop, error paths included.
pub struct SessionLockGuard {
    locks: Arc<SessionLocks>,
    session_id: String,
}

impl SessionLockGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        self.locks.release(&self.session_id);
    }
}
