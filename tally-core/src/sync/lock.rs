// Per-resource single-writer guards and cancellation flags.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::fetch::CancelToken;
use crate::types::ResourceId;

/// At most one phase run per resource. Runs for different resources never contend.
#[derive(Debug, Default)]
pub struct ResourceLocks {
    locks: Mutex<HashMap<ResourceId, Arc<AsyncMutex<()>>>>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: ResourceId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id).or_default())
    }

    /// Take the resource's lock without waiting. `None` if a run is active.
    pub fn try_acquire(&self, id: ResourceId) -> Option<OwnedMutexGuard<()>> {
        self.slot(id).try_lock_owned().ok()
    }

    pub fn is_busy(&self, id: ResourceId) -> bool {
        self.slot(id).try_lock().is_err()
    }
}

/// Cancellation flags for in-flight runs.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<ResourceId, CancelToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh token for a new run, replacing any stale one.
    pub fn begin(&self, id: ResourceId) -> CancelToken {
        let token = CancelToken::new();
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, token.clone());
        token
    }

    /// Drop the token once its run has ended.
    pub fn finish(&self, id: ResourceId) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Request cancellation. Returns false if nothing is running.
    pub fn cancel(&self, id: ResourceId) -> bool {
        let tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        match tokens.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}
