//! Session resolution and persistence around a run.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::checkpoint::{CheckpointLease, CheckpointStore};
use crate::error::ParleyError;
use crate::types::Message;

/// A session checked out for one run.
///
/// Holds the session's write lease until it is committed or abandoned, so no
/// other run can touch the same id in between.
#[derive(Debug)]
pub struct Session {
    id: String,
    history: Vec<Message>,
    is_new: bool,
    lease: CheckpointLease,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// History as persisted when the session was begun.
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Whether the id was generated for this request.
    pub fn is_new(&self) -> bool {
        self.is_new
    }
}

/// Resolves session ids, loads history before a run, persists it after.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn CheckpointStore>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Check out a session. A missing or blank id gets a fresh UUID v4.
    ///
    /// Waits while another run holds the same session.
    pub async fn begin(&self, session_id: Option<&str>) -> Result<Session, ParleyError> {
        let (id, is_new) = match session_id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => (id.to_string(), false),
            None => (Uuid::new_v4().to_string(), true),
        };
        let lease = self.store.acquire(&id).await?;
        let history = if is_new {
            Vec::new()
        } else {
            self.store.load(&id).await?
        };
        debug!(session_id = %id, is_new, messages = history.len(), "session begun");
        Ok(Session {
            id,
            history,
            is_new,
            lease,
        })
    }

    /// Append `new_messages` and write the full history back, then release
    /// the lease. Returns the persisted history.
    pub async fn commit(
        &self,
        session: Session,
        new_messages: Vec<Message>,
    ) -> Result<Vec<Message>, ParleyError> {
        let Session {
            id,
            mut history,
            lease,
            ..
        } = session;
        let appended = new_messages.len();
        history.extend(new_messages);
        self.store.save(&lease, &history).await?;
        debug!(session_id = %id, appended, total = history.len(), "session committed");
        Ok(history)
    }

    /// Release the lease without writing anything.
    pub fn abandon(&self, session: Session) {
        debug!(session_id = %session.id, "session abandoned");
    }

    /// Read a session's persisted history without taking its lease.
    pub async fn load(&self, session_id: &str) -> Result<Vec<Message>, ParleyError> {
        self.store.load(session_id).await
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use std::time::Duration;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(MemoryCheckpointStore::new()))
    }

    #[tokio::test]
    async fn missing_id_generates_a_uuid() {
        let manager = manager();
        let session = manager.begin(None).await.unwrap();
        assert!(session.is_new());
        assert!(Uuid::parse_str(session.id()).is_ok());
        assert!(session.history().is_empty());

        let blank = manager.begin(Some("  ")).await.unwrap();
        assert!(blank.is_new());
        assert_ne!(blank.id(), session.id());
    }

    #[tokio::test]
    async fn commit_appends_to_the_loaded_history() {
        let manager = manager();
        let first = manager.begin(Some("s1")).await.unwrap();
        manager
            .commit(first, vec![Message::human("hi"), Message::ai("hello")])
            .await
            .unwrap();

        let second = manager.begin(Some("s1")).await.unwrap();
        assert_eq!(second.history().len(), 2);
        let saved = manager
            .commit(second, vec![Message::human("again"), Message::ai("sure")])
            .await
            .unwrap();
        assert_eq!(saved.len(), 4);
        assert_eq!(manager.load("s1").await.unwrap(), saved);
    }

    #[tokio::test]
    async fn load_is_idempotent() {
        let manager = manager();
        let session = manager.begin(Some("s")).await.unwrap();
        manager.commit(session, vec![Message::human("q")]).await.unwrap();
        let a = manager.load("s").await.unwrap();
        let b = manager.load("s").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn abandon_writes_nothing_and_frees_the_session() {
        let manager = manager();
        let session = manager.begin(Some("s")).await.unwrap();
        manager.abandon(session);
        assert!(manager.load("s").await.unwrap().is_empty());
        let again = tokio::time::timeout(Duration::from_millis(100), manager.begin(Some("s"))).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn second_begin_waits_for_the_first_run() {
        let manager = manager();
        let held = manager.begin(Some("busy")).await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), manager.begin(Some("busy"))).await;
        assert!(blocked.is_err());
        manager.abandon(held);
    }
}
