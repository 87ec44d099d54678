//! Diff engine for comparing desired vs recorded state.
//!
//! Each declared resource is classified against its state record as create,
//! update in place, replace or no-op; records with no declaration become
//! destroys. References are evaluated against what is known before apply,
//! and a value that is only known after apply always counts as a change.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::fmt;
use tracing::debug;

use crate::graph::{Attributes, Reference, ResourceGraph, ResourceNode, lookup_attribute};
use crate::provider::ProviderSchema;
use crate::state::ActualStateRecord;

/// Engine for computing diffs between desired and recorded state.
#[derive(Debug, Clone, Copy)]
pub struct DiffEngine<'a> {
    /// Schema supplying replacement tables and computed attributes.
    schema: &'a ProviderSchema,
}

/// What must happen to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffAction {
    /// Not recorded yet.
    Create,
    /// Changed attributes can be updated in place.
    Update,
    /// A changed attribute requires destroy and recreate.
    Replace,
    /// Recorded but no longer declared.
    Destroy,
    /// Up to date.
    NoOp,
}

/// One changed attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub name: String,
    /// Recorded value, if any.
    pub old: Option<Value>,
    /// Desired value; `None` means known after apply. A removed attribute is
    /// `Some(Value::Null)`.
    pub new: Option<Value>,
    /// True if this change forces replacement.
    pub forces_replacement: bool,
}

/// Diff for a single resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffEntry {
    /// Resource address.
    pub address: String,
    /// Resource kind.
    pub kind: String,
    /// Classification.
    pub action: DiffAction,
    /// Attribute-level changes.
    pub changes: Vec<AttributeChange>,
    /// Current provider identifier, if recorded.
    pub current_id: Option<String>,
    /// Deposed identifiers awaiting destruction.
    pub deposed: Vec<String>,
    /// Dependencies in the desired graph.
    pub dependencies: BTreeSet<String>,
    /// Dependencies recorded when the resource was last applied.
    pub recorded_dependencies: BTreeSet<String>,
}

/// Complete diff result keyed by address.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffResult {
    /// Entries by address.
    pub entries: BTreeMap<String, DiffEntry>,
}

/// What is known about a resource's attributes before apply.
enum Known<'r> {
    /// Recorded values are current.
    Recorded(&'r ActualStateRecord),
    /// Declared values win, recorded ones fill the gaps.
    Updating {
        record: &'r ActualStateRecord,
        desired: BTreeMap<String, Option<Value>>,
    },
    /// Nothing is known until the provider answers.
    Unknown,
}

impl<'a> DiffEngine<'a> {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new(schema: &'a ProviderSchema) -> Self {
        Self { schema }
    }

    /// Computes the diff between the desired graph and recorded state.
    #[must_use]
    pub fn compute_diff(
        &self,
        graph: &ResourceGraph,
        records: &BTreeMap<String, ActualStateRecord>,
    ) -> DiffResult {
        let mut entries = BTreeMap::new();
        let mut known: BTreeMap<String, Known<'_>> = BTreeMap::new();

        for address in graph.topological_order() {
            let Some(node) = graph.node(&address) else {
                continue;
            };
            let desired = Self::resolve_known(node, &known);
            let record = records.get(&address);

            let entry = match record {
                None => {
                    debug!("{address} is not recorded, will create");
                    known.insert(address.clone(), Known::Unknown);
                    self.create_entry(node, graph, &desired)
                }
                Some(record) => {
                    let entry = self.compare(node, graph, record, &desired);
                    let state = match entry.action {
                        DiffAction::NoOp => Known::Recorded(record),
                        DiffAction::Update => Known::Updating {
                            record,
                            desired: desired.clone(),
                        },
                        _ => Known::Unknown,
                    };
                    known.insert(address.clone(), state);
                    entry
                }
            };

            debug!("{address}: {}", entry.action);
            entries.insert(address, entry);
        }

        for (address, record) in records {
            if !graph.contains(address) {
                debug!("{address} is no longer declared, will destroy");
                entries.insert(address.clone(), Self::destroy_entry(record));
            }
        }

        DiffResult { entries }
    }

    /// Forces every recorded resource to `Destroy`.
    #[must_use]
    pub fn destroy_all(records: &BTreeMap<String, ActualStateRecord>) -> DiffResult {
        DiffResult {
            entries: records
                .iter()
                .map(|(address, record)| (address.clone(), Self::destroy_entry(record)))
                .collect(),
        }
    }

    /// Resolves a node's attributes against what is known before apply.
    fn resolve_known(
        node: &ResourceNode,
        known: &BTreeMap<String, Known<'_>>,
    ) -> BTreeMap<String, Option<Value>> {
        let mut lookup = |reference: &Reference| -> Result<Option<Value>, Infallible> {
            Ok(known
                .get(&reference.address)
                .and_then(|state| state.value(&reference.attribute)))
        };

        node.attributes
            .iter()
            .map(|(name, value)| {
                let resolved = match value.resolve(&mut lookup) {
                    Ok(resolved) => resolved,
                    Err(never) => match never {},
                };
                (name.clone(), resolved)
            })
            .collect()
    }

    fn create_entry(
        &self,
        node: &ResourceNode,
        graph: &ResourceGraph,
        desired: &BTreeMap<String, Option<Value>>,
    ) -> DiffEntry {
        let changes = desired
            .iter()
            .map(|(name, new)| AttributeChange {
                name: name.clone(),
                old: None,
                new: new.clone(),
                forces_replacement: false,
            })
            .collect();

        DiffEntry {
            address: node.address.clone(),
            kind: node.kind.clone(),
            action: DiffAction::Create,
            changes,
            current_id: None,
            deposed: Vec::new(),
            dependencies: graph.dependencies(&node.address),
            recorded_dependencies: BTreeSet::new(),
        }
    }

    fn compare(
        &self,
        node: &ResourceNode,
        graph: &ResourceGraph,
        record: &ActualStateRecord,
        desired: &BTreeMap<String, Option<Value>>,
    ) -> DiffEntry {
        let names: BTreeSet<&String> = desired.keys().chain(record.applied.keys()).collect();
        let mut changes = Vec::new();

        for name in names {
            if self.schema.is_computed(&node.kind, name) {
                continue;
            }

            let old = record.applied.get(name.as_str());
            let new = match desired.get(name.as_str()) {
                Some(Some(value)) if old == Some(value) => continue,
                Some(value) => value.clone(),
                None => Some(Value::Null),
            };

            changes.push(AttributeChange {
                name: name.clone(),
                old: old.cloned(),
                new,
                forces_replacement: self.schema.requires_replacement(&node.kind, name),
            });
        }

        let action = if changes.is_empty() {
            DiffAction::NoOp
        } else if changes.iter().any(|c| c.forces_replacement) {
            DiffAction::Replace
        } else {
            DiffAction::Update
        };

        DiffEntry {
            address: node.address.clone(),
            kind: node.kind.clone(),
            action,
            changes,
            current_id: Some(record.id.clone()),
            deposed: record.deposed.clone(),
            dependencies: graph.dependencies(&node.address),
            recorded_dependencies: record.dependencies.clone(),
        }
    }

    fn destroy_entry(record: &ActualStateRecord) -> DiffEntry {
        DiffEntry {
            address: record.address.clone(),
            kind: record.kind.clone(),
            action: DiffAction::Destroy,
            changes: Vec::new(),
            current_id: Some(record.id.clone()),
            deposed: record.deposed.clone(),
            dependencies: BTreeSet::new(),
            recorded_dependencies: record.dependencies.clone(),
        }
    }
}

impl Known<'_> {
    fn value(&self, attribute: &str) -> Option<Value> {
        match self {
            Self::Recorded(record) => record.value(attribute),
            Self::Updating { record, desired } => {
                if attribute == "id" {
                    return Some(Value::String(record.id.clone()));
                }
                let root = attribute.split('.').next().unwrap_or(attribute);
                let declared = desired.get(attribute).or_else(|| desired.get(root));
                match declared {
                    Some(None) => None,
                    Some(Some(_)) => {
                        let known: Attributes = desired
                            .iter()
                            .filter_map(|(k, v)| v.clone().map(|v| (k.clone(), v)))
                            .collect();
                        lookup_attribute(&known, attribute)
                    }
                    // Dropped from the declaration: the update clears it.
                    None if record.applied.contains_key(root) => None,
                    None => record.value(attribute),
                }
            }
            Self::Unknown => None,
        }
    }
}

impl DiffResult {
    fn count(&self, action: DiffAction) -> usize {
        self.entries.values().filter(|e| e.action == action).count()
    }

    /// Number of resources to create.
    #[must_use]
    pub fn creates(&self) -> usize {
        self.count(DiffAction::Create)
    }

    /// Number of resources to update in place.
    #[must_use]
    pub fn updates(&self) -> usize {
        self.count(DiffAction::Update)
    }

    /// Number of resources to replace.
    #[must_use]
    pub fn replaces(&self) -> usize {
        self.count(DiffAction::Replace)
    }

    /// Number of resources to destroy.
    #[must_use]
    pub fn destroys(&self) -> usize {
        self.count(DiffAction::Destroy)
    }

    /// Number of unchanged resources.
    #[must_use]
    pub fn unchanged(&self) -> usize {
        self.count(DiffAction::NoOp)
    }

    /// Returns true if anything needs provider calls.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.entries
            .values()
            .any(|e| e.action != DiffAction::NoOp || !e.deposed.is_empty())
    }

    /// Returns the entry for an address.
    #[must_use]
    pub fn get(&self, address: &str) -> Option<&DiffEntry> {
        self.entries.get(address)
    }

    /// Returns the action for an address.
    #[must_use]
    pub fn action(&self, address: &str) -> Option<DiffAction> {
        self.get(address).map(|e| e.action)
    }

    /// Entries that require action.
    #[must_use]
    pub fn actionable(&self) -> Vec<&DiffEntry> {
        self.entries
            .values()
            .filter(|e| e.action != DiffAction::NoOp || !e.deposed.is_empty())
            .collect()
    }
}

impl fmt::Display for DiffAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Destroy => "destroy",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for AttributeChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let old = self.old.as_ref().map_or_else(|| String::from("(none)"), Value::to_string);
        let new = self
            .new
            .as_ref()
            .map_or_else(|| String::from("(known after apply)"), Value::to_string);
        write!(f, "{}: {old} -> {new}", self.name)?;
        if self.forces_replacement {
            write!(f, " (forces replacement)")?;
        }
        Ok(())
    }
}

impl fmt::Display for DiffEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.address, self.action)?;
        if !self.changes.is_empty() {
            let names: Vec<&str> = self.changes.iter().map(|c| c.name.as_str()).collect();
            write!(f, " ({})", names.join(", "))?;
        }
        Ok(())
    }
}
