//! State management module.
//!
//! Persists the last-known actual state of every resource keyed by address,
//! together with outputs and a bounded run history, on a local or S3 backend.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::{LocalStateBackend, STATE_DIR};
pub use lock::{DEFAULT_LOCK_TTL, LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use s3::S3StateBackend;
pub use store::{StateBackend, StateStore};
pub use types::{
    ActualStateRecord, HistoryEntry, MAX_HISTORY, Operation, STATE_VERSION, StateSnapshot,
};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::{StateBackendKind, StateConfig};
use crate::error::{ConfigError, Result};

/// Creates the backend described by the state configuration.
///
/// A relative local `path` is resolved against `base_dir`, the directory of
/// the desired-state document.
///
/// # Errors
///
/// Returns an error if the S3 backend lacks a bucket or cannot be set up.
pub async fn open_backend(config: &StateConfig, base_dir: &Path) -> Result<Arc<dyn StateBackend>> {
    let lock_ttl = config
        .lock_ttl_secs
        .map_or(DEFAULT_LOCK_TTL, Duration::from_secs);

    match config.backend {
        StateBackendKind::Local => {
            let dir = config
                .path
                .as_ref()
                .map_or_else(|| base_dir.join(STATE_DIR), |p| base_dir.join(p));
            debug!("Using local state in {}", dir.display());
            Ok(Arc::new(LocalStateBackend::with_base_dir(dir).with_lock_ttl(lock_ttl)))
        }
        StateBackendKind::S3 => {
            let bucket = config
                .bucket
                .as_deref()
                .ok_or_else(|| ConfigError::validation("S3 bucket not configured", "state.bucket"))?;
            let backend =
                S3StateBackend::new(bucket, config.prefix.as_deref(), config.region.as_deref())
                    .await?
                    .with_lock_ttl(lock_ttl);
            debug!("Using remote state at {}", backend.location());
            Ok(Arc::new(backend))
        }
    }
}
