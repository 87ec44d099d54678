//! S3 state backend.
//!
//! Keeps `state.json` and `state.lock` under a key prefix in an S3 (or
//! S3-compatible) bucket so a team can share one state.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{HalldyllError, Result, StateError};

use super::lock::{DEFAULT_LOCK_TTL, LockInfo, generate_holder_id};
use super::store::StateBackend;
use super::types::StateSnapshot;

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3 state backend.
#[derive(Debug)]
pub struct S3StateBackend {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
    /// Lifetime of a lock between renewals.
    lock_ttl: Duration,
}

impl S3StateBackend {
    /// Creates a backend using the ambient AWS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a backend with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    /// Sets how long a lock lives without renewal.
    #[must_use]
    pub const fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Returns the `s3://` location of the state object.
    #[must_use]
    pub fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key(STATE_KEY))
    }

    /// Gets the full S3 key for a file.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    HalldyllError::State(StateError::s3(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    HalldyllError::State(StateError::corrupted(format!(
                        "Invalid UTF-8 in S3 object: {e}"
                    )))
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(HalldyllError::State(StateError::s3(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| {
                HalldyllError::State(StateError::s3(format!("S3 put error: {e}")))
            })?;

        Ok(())
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                HalldyllError::State(StateError::s3(format!("S3 delete error: {e}")))
            })?;

        Ok(())
    }

    /// Checks if an object exists in S3.
    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(HalldyllError::State(StateError::s3(format!(
                        "S3 head error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn write_lock(&self, lock_info: &LockInfo) -> Result<()> {
        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        self.put_object(&self.key(LOCK_KEY), &content).await
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        let Some(content) = self.get_object(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };
        let lock_info = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock: {e}")))?;
        Ok(Some(lock_info))
    }
}

/// Normalises a key prefix to either empty or `path/`.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("{p}/"))
        .unwrap_or_default()
}

#[async_trait]
impl StateBackend for S3StateBackend {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        let Some(json) = self.get_object(&key).await? else {
            debug!("No state found in S3");
            return Ok(None);
        };

        let state: StateSnapshot = serde_json::from_str(&json)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state: {e}")))?;

        info!(
            "Loaded state for project: {}/{}",
            state.project, state.environment
        );
        Ok(Some(state))
    }

    async fn save(&self, state: &StateSnapshot) -> Result<()> {
        let key = self.key(STATE_KEY);
        debug!("Saving state serial {} to s3://{}/{key}", state.serial, self.bucket);

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        self.put_object(&key, &content).await
    }

    async fn exists(&self) -> Result<bool> {
        self.object_exists(&self.key(STATE_KEY)).await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock().await? {
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
        self.write_lock(&lock_info).await?;

        info!(
            "Acquired state lock: {} (expires in {:?})",
            lock_info.lock_id, self.lock_ttl
        );

        Ok(lock_info)
    }

    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        let mut current = match self.read_lock().await? {
            Some(current) if current.lock_id == lock.lock_id => current,
            _ => {
                return Err(StateError::LockLost {
                    lock_id: lock.lock_id.clone(),
                }
                .into());
            }
        };

        current.refresh(self.lock_ttl);
        self.write_lock(&current).await?;
        debug!("Renewed state lock {} until {}", current.lock_id, current.expires_at);
        Ok(current)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
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
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }

    fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_normalisation() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("/teams/infra/")), "teams/infra/");
        assert_eq!(normalize_prefix(Some("demo")), "demo/");
    }
}
