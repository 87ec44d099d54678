//! Provider registry.
//!
//! Lets several providers coexist: each resource kind is routed to the single
//! provider whose schema declares it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::config::ProviderConfig;
use crate::error::{ProviderError, Result};

use super::{HttpProvider, Provider, ProviderSchema};

/// Routes resource kinds to providers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    /// Provider by kind.
    by_kind: BTreeMap<String, Arc<dyn Provider>>,
    /// Provider name by kind.
    owners: BTreeMap<String, String>,
    /// Merged schema of all providers.
    schema: ProviderSchema,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("owners", &self.owners)
            .finish_non_exhaustive()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects to every configured HTTP provider and registers it.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider cannot be reached, its token is
    /// missing, or two providers claim the same kind.
    pub async fn from_config(configs: &[ProviderConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            let provider = HttpProvider::connect(config).await?;
            registry.register(Arc::new(provider))?;
        }
        Ok(registry)
    }

    /// Registers a provider under every kind its schema declares.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ConfigError::ConflictingProviders`] if a kind
    /// is already served.
    pub fn register(&mut self, provider: Arc<dyn Provider>) -> Result<()> {
        let schema = provider.schema();
        let kinds: Vec<String> = schema.kinds().map(String::from).collect();

        self.schema.merge(provider.name(), schema, &mut self.owners)?;
        for kind in &kinds {
            self.by_kind.insert(kind.clone(), Arc::clone(&provider));
        }

        info!("Registered provider '{}' serving {} kinds", provider.name(), kinds.len());
        Ok(())
    }

    /// Returns the provider serving a kind.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::UnknownKind`] if no provider serves it.
    pub fn for_kind(&self, kind: &str) -> std::result::Result<Arc<dyn Provider>, ProviderError> {
        self.by_kind
            .get(kind)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownKind {
                kind: kind.to_string(),
            })
    }

    /// Returns the merged schema.
    #[must_use]
    pub const fn schema(&self) -> &ProviderSchema {
        &self.schema
    }

    /// Returns the name of the provider serving a kind.
    #[must_use]
    pub fn owner(&self, kind: &str) -> Option<&str> {
        self.owners.get(kind).map(String::as_str)
    }

    /// Returns true if no provider is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty()
    }
}
