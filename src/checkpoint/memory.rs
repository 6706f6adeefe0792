use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{closed_error, CheckpointLease, CheckpointStore, LeaseTable};
use crate::error::ParleyError;
use crate::types::Message;

/// Process-local store. Histories are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    leases: LeaseTable,
    sessions: RwLock<HashMap<String, Vec<Message>>>,
    closed: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), ParleyError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn acquire(&self, session_id: &str) -> Result<CheckpointLease, ParleyError> {
        self.ensure_open()?;
        Ok(self.leases.acquire(session_id).await)
    }

    async fn load(&self, session_id: &str) -> Result<Vec<Message>, ParleyError> {
        self.ensure_open()?;
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, lease: &CheckpointLease, history: &[Message]) -> Result<(), ParleyError> {
        self.ensure_open()?;
        self.sessions
            .write()
            .await
            .insert(lease.session_id().to_string(), history.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<(), ParleyError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
