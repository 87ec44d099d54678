//! State locking.
//!
//! A lock object stored next to the state keeps two runs from mutating the
//! same state at once. Locks expire so a crashed run cannot block forever;
//! a live run renews its lock well before the TTL runs out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: u64 = 300;

/// Default lifetime of a lock between renewals.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(LOCK_EXPIRY_SECS);

/// Information about a state lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// What the holder is doing (`apply`, `destroy`, `manual`).
    #[serde(default)]
    pub operation: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock for `holder` with the default TTL.
    #[must_use]
    pub fn new(holder: &str, operation: &str) -> Self {
        Self::with_ttl(holder, operation, DEFAULT_LOCK_TTL)
    }

    /// Creates a new lock for `holder` that expires after `ttl`.
    #[must_use]
    pub fn with_ttl(holder: &str, operation: &str, ttl: Duration) -> Self {
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            operation: operation.to_string(),
            acquired_at: Utc::now(),
            expires_at: expiry(ttl),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Pushes the expiry `ttl` into the future.
    pub fn refresh(&mut self, ttl: Duration) {
        self.expires_at = expiry(ttl);
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl)
        .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
    Utc::now() + ttl
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = Uuid::new_v4().simple().to_string();

    format!("{hostname}-{pid}-{}", &uuid[..8])
}
