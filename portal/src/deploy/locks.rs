//! Per-target exclusive locks
//!
//! One fair async mutex per target, shared by deployments and by container
//! mutations. Waiters are served in arrival order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::PortalError;
use crate::models::target::TargetId;

/// Holds a target's lock until dropped
#[derive(Debug)]
pub struct TargetGuard {
    target_id: TargetId,
    _guard: OwnedMutexGuard<()>,
}

impl TargetGuard {
    pub fn target_id(&self) -> TargetId {
        self.target_id
    }
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        debug!("Released lock on target {}", self.target_id);
    }
}

#[derive(Debug, Default)]
pub struct TargetLocks {
    locks: Mutex<HashMap<TargetId, Arc<tokio::sync::Mutex<()>>>>,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, target_id: TargetId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(target_id).or_default().clone()
    }

    /// Wait at most `timeout` for the lock
    pub async fn acquire(
        &self,
        target_id: TargetId,
        timeout: Duration,
    ) -> Result<TargetGuard, PortalError> {
        self.acquire_within(target_id, timeout, Instant::now()).await
    }

    /// Wait for the lock until `timeout` has elapsed since `since`
    pub async fn acquire_within(
        &self,
        target_id: TargetId,
        timeout: Duration,
        since: Instant,
    ) -> Result<TargetGuard, PortalError> {
        let lock = self.lock_for(target_id);
        match tokio::time::timeout_at(since + timeout, lock.lock_owned()).await {
            Ok(guard) => {
                debug!("Acquired lock on target {}", target_id);
                Ok(TargetGuard {
                    target_id,
                    _guard: guard,
                })
            }
            Err(_) => Err(PortalError::LockTimeout(format!(
                "timed out after {:?} waiting for target {} lock",
                timeout,
                target_id
            ))),
        }
    }

    /// Whether someone currently holds the lock of `target_id`
    pub fn is_locked(&self, target_id: TargetId) -> bool {
        let lock = {
            let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.get(&target_id).cloned()
        };
        lock.map_or(false, |lock| lock.try_lock().is_err())
    }
}
