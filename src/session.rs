//! Replicated ephemeral session table.
//!
//! A mutex-guarded token map, mutated only by applied `SetSession` and
//! `DelSession` commands so that session reads served from any member are
//! deterministic. The table is process-local: it is wiped on restart and is
//! deliberately excluded from snapshots, so a leader change after a snapshot
//! installation loses all sessions and clients re-authenticate.

use std::collections::HashMap;

use parking_lot::Mutex;

/// In-memory session token store.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, String>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<String> {
        self.sessions.lock().get(key).cloned()
    }

    /// Set `key` to `value`.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.sessions.lock().insert(key.into(), value.into());
    }

    /// Delete `key`.
    pub fn delete(&self, key: &str) {
        self.sessions.lock().remove(key);
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
