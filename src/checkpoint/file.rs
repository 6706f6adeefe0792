//! JSON-file checkpoint store: one file per session, replaced atomically.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{closed_error, CheckpointLease, CheckpointStore, LeaseTable};
use crate::error::ParleyError;
use crate::types::Message;

const FILE_VERSION: u32 = 1;

/// File-backed store rooted at a directory.
///
/// Each save writes a temporary sibling file and renames it over the old
/// one, so a crash mid-write leaves the previous history intact.
///
/// # Example
/// ```no_run
/// use parley::checkpoint::{CheckpointStore, FileCheckpointStore};
///
/// # async fn demo() -> parley::error::Result<()> {
/// let store = FileCheckpointStore::new(FileCheckpointStore::default_dir());
/// let history = store.load("3f2b6c1e-0000-4000-8000-000000000000").await?;
/// println!("{} messages", history.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct FileCheckpointStore {
    base_dir: PathBuf,
    leases: LeaseTable,
    closed: AtomicBool,
}

impl FileCheckpointStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            leases: LeaseTable::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// `~/.parley/sessions`, or `.parley/sessions` when no home dir is known.
    pub fn default_dir() -> PathBuf {
        crate::config::default_data_dir().join("sessions")
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn session_path(&self, session_id: &str) -> Result<PathBuf, ParleyError> {
        Ok(self.base_dir.join(format!("{}.json", file_stem(session_id)?)))
    }

    fn ensure_open(&self) -> Result<(), ParleyError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn acquire(&self, session_id: &str) -> Result<CheckpointLease, ParleyError> {
        self.ensure_open()?;
        file_stem(session_id)?;
        Ok(self.leases.acquire(session_id).await)
    }

    async fn load(&self, session_id: &str) -> Result<Vec<Message>, ParleyError> {
        self.ensure_open()?;
        let path = self.session_path(session_id)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let file: SessionFile = serde_json::from_slice(&raw).map_err(|e| {
            ParleyError::Checkpoint(format!("corrupt session file {}: {e}", path.display()))
        })?;
        if file.session_id != session_id {
            return Err(ParleyError::Checkpoint(format!(
                "session file {} belongs to '{}'",
                path.display(),
                file.session_id
            )));
        }
        Ok(file.history)
    }

    async fn save(&self, lease: &CheckpointLease, history: &[Message]) -> Result<(), ParleyError> {
        self.ensure_open()?;
        let path = self.session_path(lease.session_id())?;
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let file = SessionFileRef {
            version: FILE_VERSION,
            session_id: lease.session_id(),
            saved_at: Utc::now(),
            history,
        };
        let serialized = serde_json::to_vec_pretty(&file)?;

        let tmp = path.with_extension(format!("json.tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, serialized).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        tracing::debug!(
            session_id = lease.session_id(),
            messages = history.len(),
            "session saved"
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), ParleyError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[derive(Deserialize)]
struct SessionFile {
    #[allow(dead_code)]
    version: u32,
    session_id: String,
    history: Vec<Message>,
}

#[derive(Serialize)]
struct SessionFileRef<'a> {
    version: u32,
    session_id: &'a str,
    saved_at: DateTime<Utc>,
    history: &'a [Message],
}

/// Map a session id to a file stem. Ids made of `[A-Za-z0-9_-]` are used
/// as-is; anything else is hex-encoded behind a `~`, which plain ids never
/// contain.
fn file_stem(session_id: &str) -> Result<String, ParleyError> {
    if session_id.is_empty() {
        return Err(ParleyError::InvalidArgument("session id is empty".into()));
    }
    let plain = session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if plain {
        return Ok(session_id.to_string());
    }
    let mut out = String::with_capacity(1 + session_id.len() * 2);
    out.push('~');
    for byte in session_id.bytes() {
        out.push_str(&format!("{byte:02x}"));
    }
    Ok(out)
}
