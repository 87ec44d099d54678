//! State types for tracking provisioned resources.
//!
//! These types represent the recorded actual state of resources, used by the
//! differ and executor to converge idempotently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::config::ConfigHasher;
use crate::error::{Result, StateError};
use crate::graph::{Attributes, lookup_attribute};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of history entries kept in the snapshot.
pub const MAX_HISTORY: usize = 100;

/// The complete persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State format version.
    pub version: String,
    /// Incremented on every write.
    #[serde(default)]
    pub serial: u64,
    /// Identifies the lineage of this state across writes.
    pub lineage: Uuid,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Records keyed by resource address.
    #[serde(default)]
    pub records: BTreeMap<String, ActualStateRecord>,
    /// Output values resolved by the last successful apply.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Recent runs, oldest first.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// When the state was last written.
    pub last_updated: DateTime<Utc>,
    /// SHA-256 over the serialized records.
    #[serde(default)]
    pub checksum: String,
}

/// Last-known actual state of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActualStateRecord {
    /// Resource address (`kind.name`).
    pub address: String,
    /// Resource kind.
    pub kind: String,
    /// Provider-assigned identifier.
    pub id: String,
    /// Resolved attributes last sent to the provider.
    #[serde(default)]
    pub applied: Attributes,
    /// Attributes reported by the provider.
    #[serde(default)]
    pub attributes: Attributes,
    /// Addresses this resource depended on when applied.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Identifiers of replaced objects still awaiting destruction.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<String>,
    /// When the record last changed.
    pub last_modified: DateTime<Utc>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: Operation,
    /// Hash of the desired-state document used.
    pub config_hash: String,
    /// Addresses the run touched.
    pub resources: Vec<String>,
    /// Whether the run succeeded.
    pub success: bool,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of recorded operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Converge toward the document.
    Apply,
    /// Destroy everything recorded.
    Destroy,
    /// Re-read recorded resources from providers.
    Refresh,
    /// Manual record removal.
    StateRm,
}

impl StateSnapshot {
    /// Creates a new empty snapshot.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            serial: 0,
            lineage: Uuid::new_v4(),
            project: project.to_string(),
            environment: environment.to_string(),
            records: BTreeMap::new(),
            outputs: BTreeMap::new(),
            history: Vec::new(),
            last_updated: Utc::now(),
            checksum: String::new(),
        }
    }

    /// Computes the checksum over the records.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be serialized.
    pub fn compute_checksum(&self) -> Result<String> {
        ConfigHasher::new().hash_json(&self.records)
    }

    /// Bumps the serial and refreshes timestamp and checksum before a write.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be serialized.
    pub fn seal(&mut self) -> Result<()> {
        self.serial += 1;
        self.last_updated = Utc::now();
        self.checksum = self.compute_checksum()?;
        Ok(())
    }

    /// Verifies a freshly loaded snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::VersionMismatch`] for an unknown format and
    /// [`StateError::Corrupted`] for a checksum mismatch or a record stored
    /// under the wrong key.
    pub fn verify(&self) -> Result<()> {
        if self.version != STATE_VERSION {
            return Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: self.version.clone(),
            }
            .into());
        }

        let actual = self.compute_checksum()?;
        if !ConfigHasher::hashes_match(&actual, &self.checksum) {
            return Err(StateError::corrupted(format!(
                "checksum mismatch (expected {}, computed {})",
                self.checksum, actual
            ))
            .into());
        }

        for (key, record) in &self.records {
            if key != &record.address {
                return Err(StateError::corrupted(format!(
                    "record for {} stored under {key}",
                    record.address
                ))
                .into());
            }
        }

        Ok(())
    }

    /// Gets a record by address.
    #[must_use]
    pub fn get(&self, address: &str) -> Option<&ActualStateRecord> {
        self.records.get(address)
    }

    /// Adds or replaces a record.
    pub fn put(&mut self, record: ActualStateRecord) {
        self.records.insert(record.address.clone(), record);
    }

    /// Removes a record.
    pub fn remove(&mut self, address: &str) -> Option<ActualStateRecord> {
        self.records.remove(address)
    }

    /// Adds a history entry, dropping the oldest beyond [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Returns all recorded addresses.
    #[must_use]
    pub fn addresses(&self) -> Vec<&str> {
        self.records.keys().map(String::as_str).collect()
    }
}

impl ActualStateRecord {
    /// Creates a record stamped now.
    #[must_use]
    pub fn new(address: &str, kind: &str, id: &str) -> Self {
        Self {
            address: address.to_string(),
            kind: kind.to_string(),
            id: id.to_string(),
            applied: Attributes::new(),
            attributes: Attributes::new(),
            dependencies: BTreeSet::new(),
            deposed: Vec::new(),
            last_modified: Utc::now(),
        }
    }

    /// Sets the applied inputs.
    #[must_use]
    pub fn with_applied(mut self, applied: Attributes) -> Self {
        self.applied = applied;
        self
    }

    /// Sets the provider-reported attributes.
    #[must_use]
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Sets the recorded dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: BTreeSet<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Reads an attribute for reference resolution.
    ///
    /// `id` is the provider identifier; other names are looked up in the
    /// provider-reported attributes, then in the applied inputs.
    #[must_use]
    pub fn value(&self, attribute: &str) -> Option<Value> {
        if attribute == "id" {
            return Some(Value::String(self.id.clone()));
        }
        lookup_attribute(&self.attributes, attribute)
            .or_else(|| lookup_attribute(&self.applied, attribute))
    }

    /// Marks the record as modified now.
    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}

impl HistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: Operation, config_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: Operation,
        config_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Refresh => "refresh",
            Self::StateRm => "state rm",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HalldyllError;
    use serde_json::json;

    fn sealed_snapshot() -> StateSnapshot {
        let mut snapshot = StateSnapshot::new("demo", "dev");
        let mut attributes = Attributes::new();
        attributes.insert(String::from("public_ip"), json!("1.2.3.4"));
        snapshot.put(ActualStateRecord::new("vm.web", "vm", "i-1").with_attributes(attributes));
        snapshot.seal().expect("seals");
        snapshot
    }

    #[test]
    fn test_seal_then_verify() {
        let snapshot = sealed_snapshot();
        assert_eq!(snapshot.serial, 1);
        assert!(snapshot.verify().is_ok());
    }

    #[test]
    fn test_tampered_records_fail_verification() {
        let mut snapshot = sealed_snapshot();
        if let Some(record) = snapshot.records.get_mut("vm.web") {
            record.id = String::from("i-2");
        }
        assert!(matches!(
            snapshot.verify(),
            Err(HalldyllError::State(StateError::Corrupted { .. }))
        ));
    }

    #[test]
    fn test_misplaced_record_is_corrupt() {
        let mut snapshot = StateSnapshot::new("demo", "dev");
        snapshot
            .records
            .insert(String::from("vm.other"), ActualStateRecord::new("vm.web", "vm", "i-1"));
        snapshot.seal().expect("seals");
        assert!(matches!(
            snapshot.verify(),
            Err(HalldyllError::State(StateError::Corrupted { .. }))
        ));
    }

    #[test]
    fn test_record_value_lookup() {
        let mut applied = Attributes::new();
        applied.insert(String::from("size"), json!("small"));
        let mut reported = Attributes::new();
        reported.insert(String::from("public_ip"), json!("1.2.3.4"));
        let record = ActualStateRecord::new("vm.web", "vm", "i-1")
            .with_applied(applied)
            .with_attributes(reported);

        assert_eq!(record.value("id"), Some(json!("i-1")));
        assert_eq!(record.value("public_ip"), Some(json!("1.2.3.4")));
        assert_eq!(record.value("size"), Some(json!("small")));
        assert_eq!(record.value("missing"), None);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut snapshot = StateSnapshot::new("demo", "dev");
        for i in 0..(MAX_HISTORY + 5) {
            snapshot.add_history(HistoryEntry::new(Operation::Apply, &i.to_string(), vec![]));
        }
        assert_eq!(snapshot.history.len(), MAX_HISTORY);
        assert_eq!(snapshot.history[0].config_hash, "5");
    }
}
