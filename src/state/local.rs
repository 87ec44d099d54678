//! Local file-based state backend.
//!
//! Stores `state.json` and `state.lock` in a directory, writing the state
//! through a temporary file and an atomic rename.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{HalldyllError, Result, StateError};

use super::lock::{DEFAULT_LOCK_TTL, LockInfo, generate_holder_id};
use super::store::StateBackend;
use super::types::StateSnapshot;

/// Default state directory name.
pub const STATE_DIR: &str = ".halldyll";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state backend.
#[derive(Debug)]
pub struct LocalStateBackend {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Lifetime of a lock between renewals.
    lock_ttl: Duration,
}

impl LocalStateBackend {
    /// Creates a backend storing its files in `base_dir`.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    /// Sets how long a lock lives without renewal.
    #[must_use]
    pub const fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Returns the path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StateError::local(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    /// Writes `content` to `path` via a temporary file and rename.
    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        self.ensure_dir().await?;
        let mut temp_path = path.as_os_str().to_owned();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::local(format!("Failed to create temp file: {e}")))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::local(format!("Failed to write temp file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::local(format!("Failed to sync temp file: {e}")))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| StateError::local(format!("Failed to rename temp file: {e}")))?;
        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path)
            .await
            .map_err(|e| StateError::local(format!("Failed to read lock file: {e}")))?;

        let lock_info: LockInfo = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock file: {e}")))?;

        Ok(Some(lock_info))
    }

    async fn write_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        self.write_atomic(&self.lock_path, &content).await.map_err(|e| {
            HalldyllError::State(StateError::LockFailed {
                message: e.to_string(),
            })
        })
    }

    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| {
                HalldyllError::State(StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateBackend for LocalStateBackend {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        info!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path)
            .await
            .map_err(|e| StateError::local(format!("Failed to read state file: {e}")))?;

        let state: StateSnapshot = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state file: {e}")))?;

        Ok(Some(state))
    }

    async fn save(&self, state: &StateSnapshot) -> Result<()> {
        debug!("Saving state serial {} to: {}", state.serial, self.state_path.display());

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        self.write_atomic(&self.state_path, &content).await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            debug!("Expired lock found, taking over");
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::with_ttl(&holder_id, operation, self.lock_ttl);
        self.write_lock_file(&lock_info).await?;

        info!(
            "Acquired state lock: {} (expires in {:?})",
            lock_info.lock_id, self.lock_ttl
        );

        Ok(lock_info)
    }

    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        let mut current = match self.read_lock_file().await? {
            Some(current) if current.lock_id == lock.lock_id => current,
            _ => {
                return Err(StateError::LockLost {
                    lock_id: lock.lock_id.clone(),
                }
                .into());
            }
        };

        current.refresh(self.lock_ttl);
        self.write_lock_file(&current).await?;
        debug!("Renewed state lock {} until {}", current.lock_id, current.expires_at);
        Ok(current)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        self.delete_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
