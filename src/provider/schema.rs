//! Provider schemas.
//!
//! A schema tells the engine which resource kinds a provider serves and, per
//! kind, which attribute changes force a replacement, which attributes are
//! computed by the provider, and how a replacement is ordered.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{ConfigError, Result};

/// Order of the two halves of a replacement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceStrategy {
    /// Destroy the old object, then create the new one.
    #[default]
    DestroyBeforeCreate,
    /// Create the new object, re-apply dependents, then destroy the old one.
    CreateBeforeDestroy,
}

impl fmt::Display for ReplaceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DestroyBeforeCreate => write!(f, "destroy_before_create"),
            Self::CreateBeforeDestroy => write!(f, "create_before_destroy"),
        }
    }
}

/// Schema for a single resource kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSchema {
    /// Attributes whose change requires destroy and recreate.
    #[serde(default)]
    pub replace_on_change: BTreeSet<String>,

    /// Attributes set by the provider; never compared against desired state.
    #[serde(default)]
    pub computed: BTreeSet<String>,

    /// How replacements of this kind are ordered.
    #[serde(default)]
    pub replace_strategy: ReplaceStrategy,
}

impl KindSchema {
    /// Creates an empty kind schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks attributes as requiring replacement.
    #[must_use]
    pub fn replace_on<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.replace_on_change.extend(attributes.into_iter().map(Into::into));
        self
    }

    /// Marks attributes as computed.
    #[must_use]
    pub fn computed<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.computed.extend(attributes.into_iter().map(Into::into));
        self
    }

    /// Sets the replace strategy.
    #[must_use]
    pub const fn with_strategy(mut self, strategy: ReplaceStrategy) -> Self {
        self.replace_strategy = strategy;
        self
    }
}

/// Schema of every kind one or more providers serve.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSchema {
    /// Per-kind schemas.
    #[serde(default)]
    pub kinds: BTreeMap<String, KindSchema>,
}

impl ProviderSchema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a kind.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>, schema: KindSchema) -> Self {
        self.kinds.insert(kind.into(), schema);
        self
    }

    /// Returns the schema for a kind.
    #[must_use]
    pub fn kind(&self, kind: &str) -> Option<&KindSchema> {
        self.kinds.get(kind)
    }

    /// Returns true if the kind is served.
    #[must_use]
    pub fn supports(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Returns true if changing `attribute` on `kind` forces replacement.
    #[must_use]
    pub fn requires_replacement(&self, kind: &str, attribute: &str) -> bool {
        self.kind(kind)
            .is_some_and(|k| k.replace_on_change.contains(attribute))
    }

    /// Returns true if `attribute` on `kind` is computed by the provider.
    #[must_use]
    pub fn is_computed(&self, kind: &str, attribute: &str) -> bool {
        self.kind(kind).is_some_and(|k| k.computed.contains(attribute))
    }

    /// Returns the replace strategy for a kind.
    #[must_use]
    pub fn replace_strategy(&self, kind: &str) -> ReplaceStrategy {
        self.kind(kind).map(|k| k.replace_strategy).unwrap_or_default()
    }

    /// Iterates served kinds in order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }

    /// Merges another provider's schema into this one.
    ///
    /// `owners` maps each kind already present to the provider serving it and
    /// is extended with the new kinds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ConflictingProviders`] if a kind is already
    /// served by a different provider.
    pub fn merge(
        &mut self,
        provider: &str,
        other: Self,
        owners: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        for (kind, schema) in other.kinds {
            if let Some(first) = owners.get(&kind) {
                return Err(ConfigError::ConflictingProviders {
                    kind,
                    first: first.clone(),
                    second: provider.to_string(),
                }
                .into());
            }
            owners.insert(kind.clone(), provider.to_string());
            self.kinds.insert(kind, schema);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HalldyllError;

    #[test]
    fn test_schema_queries() {
        let schema = ProviderSchema::new().with_kind(
            "vm",
            KindSchema::new()
                .replace_on(["image"])
                .computed(["public_ip"])
                .with_strategy(ReplaceStrategy::CreateBeforeDestroy),
        );

        assert!(schema.supports("vm"));
        assert!(!schema.supports("net"));
        assert!(schema.requires_replacement("vm", "image"));
        assert!(!schema.requires_replacement("vm", "size"));
        assert!(schema.is_computed("vm", "public_ip"));
        assert_eq!(schema.replace_strategy("vm"), ReplaceStrategy::CreateBeforeDestroy);
        assert_eq!(schema.replace_strategy("net"), ReplaceStrategy::DestroyBeforeCreate);
    }

    #[test]
    fn test_schema_deserializes_with_defaults() {
        let schema: ProviderSchema = serde_json::from_str(
            r#"{"kinds": {"net": {"replace_on_change": ["cidr"]}, "vm": {}}}"#,
        )
        .expect("valid schema");

        assert!(schema.requires_replacement("net", "cidr"));
        assert_eq!(schema.replace_strategy("vm"), ReplaceStrategy::DestroyBeforeCreate);
    }

    #[test]
    fn test_merge_rejects_conflicting_kinds() {
        let mut owners = BTreeMap::new();
        let mut merged = ProviderSchema::new();
        merged
            .merge("a", ProviderSchema::new().with_kind("net", KindSchema::new()), &mut owners)
            .expect("first merge");

        let result = merged.merge(
            "b",
            ProviderSchema::new().with_kind("net", KindSchema::new()),
            &mut owners,
        );
        assert!(matches!(
            result,
            Err(HalldyllError::Config(ConfigError::ConflictingProviders { .. }))
        ));
    }
}
