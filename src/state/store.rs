//! State store.
//!
//! [`StateBackend`] is the persistence interface implemented by the local and
//! S3 backends. [`StateStore`] sits on top of a backend and owns the
//! in-memory snapshot: every mutation is serialized by an async mutex and
//! written through before the call returns. A write is refused if the
//! persisted snapshot is no longer the one this store last loaded or saved.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError};

use super::lock::{DEFAULT_LOCK_TTL, LockInfo};
use super::types::{ActualStateRecord, HistoryEntry, StateSnapshot};

/// Trait for state persistence backends.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Loads the snapshot.
    ///
    /// Returns `None` if no state exists yet. Content that cannot be parsed
    /// is reported as corruption.
    async fn load(&self) -> Result<Option<StateSnapshot>>;

    /// Saves the snapshot.
    async fn save(&self, state: &StateSnapshot) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the state lock.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Extends a held lock by [`StateBackend::lock_ttl`].
    ///
    /// Fails with [`StateError::LockLost`] if the lock was released, forced
    /// or taken over since it was acquired.
    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` still owns it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes the lock whoever holds it.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked by an unexpired lock.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// How long a lock lives without renewal.
    fn lock_ttl(&self) -> Duration {
        DEFAULT_LOCK_TTL
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

/// Write-through store of actual resource state.
pub struct StateStore {
    /// Persistence backend.
    backend: Arc<dyn StateBackend>,
    /// Current snapshot; the mutex serializes all writes.
    snapshot: Mutex<StateSnapshot>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("backend", &self.backend.backend_type())
            .finish_non_exhaustive()
    }
}

impl StateStore {
    /// Opens the store, loading and verifying any existing snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::StateError::Corrupted`] if the persisted state
    /// cannot be trusted, or a backend error if it cannot be read.
    pub async fn open(
        backend: Arc<dyn StateBackend>,
        project: &str,
        environment: &str,
    ) -> Result<Self> {
        let snapshot = Self::load_verified(backend.as_ref())
            .await?
            .unwrap_or_else(|| {
                debug!("No existing state, starting empty");
                StateSnapshot::new(project, environment)
            });

        Ok(Self {
            backend,
            snapshot: Mutex::new(snapshot),
        })
    }

    /// Re-reads the persisted snapshot, replacing the in-memory one.
    ///
    /// Called once the state lock is held, so decisions are made against
    /// what the previous lock holder left behind. Returns true if the
    /// persisted snapshot differs from the one held in memory.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Corrupted`] if the persisted state cannot be
    /// trusted, or a backend error if it cannot be read.
    pub async fn reload(&self) -> Result<bool> {
        let mut snapshot = self.snapshot.lock().await;
        let loaded = match Self::load_verified(self.backend.as_ref()).await? {
            Some(loaded) => loaded,
            None => StateSnapshot::new(&snapshot.project, &snapshot.environment),
        };
        let changed = loaded.serial != snapshot.serial
            || (loaded.serial != 0 && loaded.lineage != snapshot.lineage);
        *snapshot = loaded;
        Ok(changed)
    }

    async fn load_verified(backend: &dyn StateBackend) -> Result<Option<StateSnapshot>> {
        let Some(snapshot) = backend.load().await? else {
            return Ok(None);
        };
        snapshot.verify()?;
        info!(
            "Loaded state serial {} with {} records",
            snapshot.serial,
            snapshot.records.len()
        );
        Ok(Some(snapshot))
    }

    /// Returns the backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    /// Gets the record at `address`.
    pub async fn get(&self, address: &str) -> Option<ActualStateRecord> {
        self.snapshot.lock().await.get(address).cloned()
    }

    /// Writes a record and persists it.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Stale`] if the persisted state moved on, or a
    /// backend error. Memory is left untouched on failure.
    pub async fn put(&self, record: ActualStateRecord) -> Result<()> {
        let mut snapshot = self.snapshot.lock().await;
        let address = record.address.clone();
        let mut next = snapshot.clone();
        next.records.insert(address.clone(), record);

        self.commit(&mut snapshot, next).await?;
        debug!("Recorded {address}");
        Ok(())
    }

    /// Removes the record at `address` and persists.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Stale`] or a backend error; the record stays in
    /// memory.
    pub async fn remove(&self, address: &str) -> Result<Option<ActualStateRecord>> {
        let mut snapshot = self.snapshot.lock().await;
        let mut next = snapshot.clone();
        let Some(previous) = next.records.remove(address) else {
            return Ok(None);
        };

        self.commit(&mut snapshot, next).await?;
        debug!("Removed record {address}");
        Ok(Some(previous))
    }

    /// Returns a copy of every record.
    pub async fn records(&self) -> BTreeMap<String, ActualStateRecord> {
        self.snapshot.lock().await.records.clone()
    }

    /// Returns a copy of the whole snapshot.
    pub async fn snapshot(&self) -> StateSnapshot {
        self.snapshot.lock().await.clone()
    }

    /// Replaces the stored outputs and persists.
    ///
    /// # Errors
    ///
    /// Returns a backend error.
    pub async fn set_outputs(&self, outputs: BTreeMap<String, Value>) -> Result<()> {
        let mut snapshot = self.snapshot.lock().await;
        let mut next = snapshot.clone();
        next.outputs = outputs;
        self.commit(&mut snapshot, next).await
    }

    /// Appends a history entry and persists.
    ///
    /// # Errors
    ///
    /// Returns a backend error.
    pub async fn add_history(&self, entry: HistoryEntry) -> Result<()> {
        let mut snapshot = self.snapshot.lock().await;
        let mut next = snapshot.clone();
        next.add_history(entry);
        self.commit(&mut snapshot, next).await
    }

    /// Seals and saves `next`, then makes it current.
    async fn commit(&self, current: &mut StateSnapshot, mut next: StateSnapshot) -> Result<()> {
        self.ensure_current(current).await?;
        next.seal()?;
        self.backend.save(&next).await?;
        *current = next;
        Ok(())
    }

    /// Checks that the persisted snapshot is still `loaded`.
    async fn ensure_current(&self, loaded: &StateSnapshot) -> Result<()> {
        let stale = |message: String| -> Result<()> {
            warn!("Refusing to overwrite state: {message}");
            Err(StateError::Stale { message }.into())
        };

        match self.backend.load().await? {
            None if loaded.serial == 0 => Ok(()),
            None => stale(format!("serial {} was removed", loaded.serial)),
            Some(persisted) if persisted.lineage != loaded.lineage => stale(format!(
                "lineage {} replaced by {}",
                loaded.lineage, persisted.lineage
            )),
            Some(persisted) if persisted.serial != loaded.serial => stale(format!(
                "serial {} advanced to {}",
                loaded.serial, persisted.serial
            )),
            Some(_) => Ok(()),
        }
    }
}
