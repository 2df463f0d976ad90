//! Per-key exclusion: holding the guard for one key never blocks another.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

#[derive(Clone, Default)]
pub struct KeyedLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

/// Releases its key when dropped.
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`, or `None` if someone else holds it.
    pub fn try_acquire(&self, key: &str) -> Option<KeyGuard> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(key.to_string()) {
            return None;
        }
        Some(KeyGuard {
            key: key.to_string(),
            held: Arc::clone(&self.held),
        })
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}
