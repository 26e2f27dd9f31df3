//! Ephemeral per-session scratch directories.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};
use uuid::Uuid;

/// Opaque identifier minted once per job.
///
/// Names the workspace directory, keys the session registry and is the token
/// a client presents to attach its websocket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accepts only well-formed keys; anything else can never name a session.
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(|id| Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("unable to create workspace {}: {source}", path.display())]
    Allocation { path: PathBuf, source: io::Error },
    #[error("workspace {0} does not exist")]
    UnknownKey(SessionKey),
    #[error("workspace io on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

pub type Result<T, E = WorkspaceError> = std::result::Result<T, E>;

/// Issues and reclaims scratch directories under a single root.
#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
    live: Mutex<HashMap<SessionKey, PathBuf>>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Removes everything under the root left behind by a previous run.
    ///
    /// Must complete before the first `allocate`.
    pub async fn startup_purge(&self) {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => info!(root = %self.root.display(), "Purged stale workspaces"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(root = %self.root.display(), "No stale workspaces to purge")
            }
            Err(e) => warn!(root = %self.root.display(), error = %e, "Couldn't purge scratch root"),
        }
    }

    /// Creates a fresh directory and returns its key.
    pub async fn allocate(&self) -> Result<SessionKey> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| WorkspaceError::Allocation {
                path: self.root.clone(),
                source,
            })?;

        let key = loop {
            let key = SessionKey::generate();
            if !self.lock().contains_key(&key) {
                break key;
            }
        };
        let dir = self.root.join(key.as_str());
        // create_dir (not _all) fails on a leftover directory with the same name.
        tokio::fs::create_dir(&dir)
            .await
            .map_err(|source| WorkspaceError::Allocation {
                path: dir.clone(),
                source,
            })?;

        self.lock().insert(key.clone(), dir);
        info!(key = %key, "Allocated workspace");
        Ok(key)
    }

    /// Removes the directory recursively, then forgets the key.
    ///
    /// The key is forgotten even when removal fails, so it is never handed out
    /// or released again; `live_count` only drops once the directory is gone.
    pub async fn release(&self, key: &SessionKey) -> Result<()> {
        let dir = self.dir_for(key)?;
        let removed = tokio::fs::remove_dir_all(&dir).await;
        self.lock().remove(key);
        removed.map_err(|source| WorkspaceError::Io { path: dir, source })?;
        info!(key = %key, "Released workspace");
        Ok(())
    }

    pub fn dir_for(&self, key: &SessionKey) -> Result<PathBuf> {
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| WorkspaceError::UnknownKey(key.clone()))
    }

    pub fn path_for(&self, key: &SessionKey, filename: &str) -> Result<PathBuf> {
        Ok(self.dir_for(key)?.join(filename))
    }

    pub async fn write_file(&self, key: &SessionKey, filename: &str, content: &[u8]) -> Result<()> {
        let path = self.path_for(key, filename)?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|source| WorkspaceError::Io { path, source })
    }

    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionKey, PathBuf>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
