//! Configuration hashing for change detection.
//!
//! This module provides deterministic hashing of desired-state documents and
//! attribute maps. Hashes identify the configuration a plan was built from
//! and guard persisted state against corruption.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{HalldyllError, Result, StateError};

use super::spec::{InfraConfig, ResourceDeclaration};

/// Hasher for computing configuration hashes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire desired-state document.
    ///
    /// Resources are hashed in address order so reordering declarations in
    /// the file does not change the hash.
    #[must_use]
    pub fn hash_config(&self, config: &InfraConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update(config.project.environment.as_bytes());

        let mut resources: Vec<&ResourceDeclaration> = config.resources.iter().collect();
        resources.sort_by_key(|r| r.address());
        for resource in resources {
            hasher.update(self.hash_declaration(resource).as_bytes());
        }

        for (name, expression) in &config.outputs {
            hasher.update(name.as_bytes());
            hasher.update(expression.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single resource declaration.
    #[must_use]
    pub fn hash_declaration(&self, resource: &ResourceDeclaration) -> String {
        let mut hasher = Sha256::new();

        hasher.update(resource.kind.as_bytes());
        hasher.update(resource.name.as_bytes());

        // BTreeMap iteration and serde_json object order are both sorted.
        for (key, value) in &resource.attributes {
            hasher.update(key.as_bytes());
            hasher.update(value.to_string().as_bytes());
        }

        let mut depends_on: Vec<&String> = resource.depends_on.iter().collect();
        depends_on.sort();
        for dependency in depends_on {
            hasher.update(dependency.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of any serializable value via its JSON form.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn hash_json<T: Serialize>(&self, value: &T) -> Result<String> {
        let bytes = serde_json::to_vec(value).map_err(|e| {
            HalldyllError::State(StateError::serialization(format!(
                "Failed to serialize for hashing: {e}"
            )))
        })?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use std::collections::BTreeMap;

    fn declaration(name: &str, cidr: &str) -> ResourceDeclaration {
        let mut attributes = BTreeMap::new();
        attributes.insert(
            String::from("cidr_block"),
            serde_json::Value::String(cidr.to_string()),
        );
        ResourceDeclaration {
            kind: String::from("aws_vpc"),
            name: name.to_string(),
            attributes,
            depends_on: vec![],
        }
    }

    #[test]
    fn test_declaration_hash_deterministic() {
        let hasher = ConfigHasher::new();
        let a = declaration("main", "10.0.0.0/16");
        assert_eq!(hasher.hash_declaration(&a), hasher.hash_declaration(&a.clone()));
    }

    #[test]
    fn test_declaration_hash_changes_with_attributes() {
        let hasher = ConfigHasher::new();
        let a = declaration("main", "10.0.0.0/16");
        let b = declaration("main", "10.1.0.0/16");
        assert_ne!(hasher.hash_declaration(&a), hasher.hash_declaration(&b));
    }

    #[test]
    fn test_config_hash_ignores_declaration_order() {
        let first = r"
project:
  name: demo
resources:
  - { type: net, name: a }
  - { type: net, name: b }
";
        let second = r"
project:
  name: demo
resources:
  - { type: net, name: b }
  - { type: net, name: a }
";
        let parser = ConfigParser::new();
        let hasher = ConfigHasher::new();
        let a = parser.parse_yaml(first, None).expect("parses");
        let b = parser.parse_yaml(second, None).expect("parses");
        assert_eq!(hasher.hash_config(&a), hasher.hash_config(&b));
    }

    #[test]
    fn test_short_hash_and_match() {
        let hasher = ConfigHasher::new();
        assert_eq!(hasher.short_hash("0123456789abcdef"), "01234567");
        assert!(ConfigHasher::hashes_match("abcd", "abcd"));
        assert!(!ConfigHasher::hashes_match("abcd", "abce"));
        assert!(!ConfigHasher::hashes_match("abc", "abcd"));
    }
}
