//! Provider interface.
//!
//! Providers own every resource-kind specific behaviour: they create, read,
//! update and destroy objects and publish a [`ProviderSchema`] describing the
//! kinds they serve. The engine reaches them only through [`Provider`].

mod http;
mod registry;
mod schema;

#[cfg(test)]
pub(crate) mod fake;

pub use http::HttpProvider;
pub use registry::ProviderRegistry;
pub use schema::{KindSchema, ProviderSchema, ReplaceStrategy};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderResult;
use crate::graph::Attributes;

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedResource {
    /// Provider-assigned identifier.
    pub id: String,
    /// Attributes reported by the provider, computed ones included.
    #[serde(default)]
    pub attributes: Attributes,
}

/// Result of a destroy call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// The object was deleted.
    Destroyed,
    /// The object was already gone.
    NotFound,
}

/// A provider plugin.
///
/// Implementations must be safe to call concurrently; the executor issues
/// calls for independent resources in parallel.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Returns the provider name used in logs and error messages.
    fn name(&self) -> &str;

    /// Returns the schema of the kinds this provider serves.
    fn schema(&self) -> ProviderSchema;

    /// Creates an object and returns its identifier and attributes.
    async fn create(&self, kind: &str, attributes: &Attributes) -> ProviderResult<CreatedResource>;

    /// Reads an object; `None` if it no longer exists.
    async fn read(&self, kind: &str, id: &str) -> ProviderResult<Option<Attributes>>;

    /// Updates an object in place with the changed attributes only.
    async fn update(&self, kind: &str, id: &str, changed: &Attributes) -> ProviderResult<Attributes>;

    /// Destroys an object.
    async fn destroy(&self, kind: &str, id: &str) -> ProviderResult<DestroyOutcome>;
}
