//! Resource graph module.
//!
//! This module turns the declarations of a desired-state document into typed
//! resource nodes joined by dependency edges, and answers ordering questions
//! about them.

mod builder;
mod value;

pub use builder::GraphBuilder;
pub use value::{AttributeValue, Attributes, Reference, Segment, lookup_attribute};

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// A declared resource after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNode {
    /// Unique `kind.name` address.
    pub address: String,
    /// Resource kind tag.
    pub kind: String,
    /// Resource name within the kind.
    pub name: String,
    /// Parsed attribute values.
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Explicit `depends_on` addresses.
    pub depends_on: BTreeSet<String>,
}

/// How a dependency edge was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeOrigin {
    /// Listed in `depends_on`.
    Explicit,
    /// Found in an attribute reference.
    Reference,
}

/// A directed edge: `dependent` needs `dependency` first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DependencyEdge {
    /// The resource that depends.
    pub dependent: String,
    /// The resource depended upon.
    pub dependency: String,
    /// Where the edge came from.
    pub origin: EdgeOrigin,
}

/// The acyclic graph of desired resources.
///
/// Only [`GraphBuilder`] produces non-empty graphs, so every instance is
/// known to be acyclic and to reference only its own nodes.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: BTreeMap<String, ResourceNode>,
    edges: BTreeSet<DependencyEdge>,
    dependencies: BTreeMap<String, BTreeSet<String>>,
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl ResourceNode {
    /// Returns the addresses referenced from attribute values.
    #[must_use]
    pub fn referenced_addresses(&self) -> BTreeSet<String> {
        self.attributes
            .values()
            .flat_map(AttributeValue::references)
            .map(|r| r.address.clone())
            .collect()
    }
}

impl ResourceGraph {
    /// Returns an empty graph (used when destroying everything).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Looks up a node by address.
    #[must_use]
    pub fn node(&self, address: &str) -> Option<&ResourceNode> {
        self.nodes.get(address)
    }

    /// Iterates nodes in address order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// Returns true if the address is declared.
    #[must_use]
    pub fn contains(&self, address: &str) -> bool {
        self.nodes.contains_key(address)
    }

    /// Returns all edges in deterministic order.
    #[must_use]
    pub const fn edges(&self) -> &BTreeSet<DependencyEdge> {
        &self.edges
    }

    /// Returns the direct dependencies of an address.
    #[must_use]
    pub fn dependencies(&self, address: &str) -> BTreeSet<String> {
        self.dependencies.get(address).cloned().unwrap_or_default()
    }

    /// Returns the direct dependents of an address.
    #[must_use]
    pub fn dependents(&self, address: &str) -> BTreeSet<String> {
        self.dependents.get(address).cloned().unwrap_or_default()
    }

    /// Returns every address that transitively depends on `address`.
    #[must_use]
    pub fn descendants(&self, address: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = vec![address];

        while let Some(current) = stack.pop() {
            if let Some(children) = self.dependents.get(current) {
                for child in children {
                    if seen.insert(child.clone()) {
                        stack.push(child);
                    }
                }
            }
        }

        seen
    }

    /// Returns addresses so that every dependency precedes its dependents.
    /// Ties are broken by address.
    #[must_use]
    pub fn topological_order(&self) -> Vec<String> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .nodes
            .keys()
            .map(|address| (address.as_str(), self.dependencies.get(address).map_or(0, BTreeSet::len)))
            .collect();

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(address, _)| *address)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(current) = ready.pop_first() {
            order.push(current.to_string());
            if let Some(children) = self.dependents.get(current) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child.as_str()) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            ready.insert(child.as_str());
                        }
                    }
                }
            }
        }

        order
    }

    /// Inserts a node; used by the builder only.
    fn insert_node(&mut self, node: ResourceNode) {
        self.dependencies.entry(node.address.clone()).or_default();
        self.dependents.entry(node.address.clone()).or_default();
        self.nodes.insert(node.address.clone(), node);
    }

    /// Inserts an edge; used by the builder only.
    fn insert_edge(&mut self, edge: DependencyEdge) {
        self.dependencies
            .entry(edge.dependent.clone())
            .or_default()
            .insert(edge.dependency.clone());
        self.dependents
            .entry(edge.dependency.clone())
            .or_default()
            .insert(edge.dependent.clone());
        self.edges.insert(edge);
    }
}
