// crates/memvault-vault/src/ipc/locks.rs
// Per-key_id serialization of secret-store access

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

/// Entries are pruned once the map grows past this many ids.
const PRUNE_THRESHOLD: usize = 64;

/// One async mutex per key id, created on demand.
///
/// Guards are owned so they can be moved into `spawn_blocking`: the lock is
/// held for exactly as long as the store call runs, even if the request
/// that started it has already given up.
#[derive(Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if locks.len() > PRUNE_THRESHOLD {
                // Only the map holds an idle lock.
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            locks.entry(key_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of ids currently tracked
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
