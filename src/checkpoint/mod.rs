//! Durable session history keyed by session id.
//!
//! The store is the only mutable shared resource in the system. Writers must
//! hold the session's [`CheckpointLease`], which guarantees at most one
//! active run per session.

pub mod file;
pub mod lease;
pub mod memory;

pub use file::FileCheckpointStore;
pub use lease::{CheckpointLease, LeaseTable};
pub use memory::MemoryCheckpointStore;

use async_trait::async_trait;

use crate::error::ParleyError;
use crate::types::Message;

/// Read/write contract for persisted conversation histories.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Take the exclusive write lease for a session, waiting if it is held.
    async fn acquire(&self, session_id: &str) -> Result<CheckpointLease, ParleyError>;

    /// Load a session's history. Unknown sessions yield an empty history.
    async fn load(&self, session_id: &str) -> Result<Vec<Message>, ParleyError>;

    /// Replace the persisted history of the leased session.
    async fn save(&self, lease: &CheckpointLease, history: &[Message]) -> Result<(), ParleyError>;

    /// Release resources. Later calls fail with a checkpoint error.
    async fn close(&self) -> Result<(), ParleyError>;
}

pub(crate) fn closed_error() -> ParleyError {
    ParleyError::Checkpoint("checkpoint store is closed".into())
}
