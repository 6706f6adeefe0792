//! Per-session exclusive leases.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

/// Prune idle entries once the table grows past this many sessions.
const PRUNE_THRESHOLD: usize = 256;

/// Exclusive right to write one session's history.
///
/// Held from `begin` until the run commits or is abandoned. Dropping the
/// lease releases it.
#[derive(Debug)]
pub struct CheckpointLease {
    session_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl CheckpointLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// Hands out one lease per session id at a time. Different ids never contend.
#[derive(Debug, Default)]
pub struct LeaseTable {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the session is free, then take it.
    pub async fn acquire(&self, session_id: &str) -> CheckpointLease {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            if locks.len() > PRUNE_THRESHOLD {
                // Only the table holds an idle lock; waiters and holders keep a clone.
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(locks.entry(session_id.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;
        tracing::trace!(session_id, "lease acquired");
        CheckpointLease {
            session_id: session_id.to_string(),
            _guard: guard,
        }
    }

    /// Take the session only if nobody holds it.
    pub fn try_acquire(&self, session_id: &str) -> Option<CheckpointLease> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(session_id.to_string()).or_default())
        };
        let guard = lock.try_lock_owned().ok()?;
        Some(CheckpointLease {
            session_id: session_id.to_string(),
            _guard: guard,
        })
    }
}
