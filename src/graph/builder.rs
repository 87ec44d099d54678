//! Resource graph builder.
//!
//! Parses declarations into [`ResourceNode`]s, derives dependency edges from
//! `depends_on` lists and attribute references, and rejects unknown kinds,
//! duplicate addresses, dangling references and cycles.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info};

use crate::config::{ResourceDeclaration, is_valid_identifier};
use crate::error::{BuildError, Result};
use crate::provider::ProviderSchema;

use super::value::AttributeValue;
use super::{DependencyEdge, EdgeOrigin, ResourceGraph, ResourceNode};

/// Builds [`ResourceGraph`]s against a provider schema.
#[derive(Debug)]
pub struct GraphBuilder<'a> {
    /// Schema listing the supported resource kinds.
    schema: &'a ProviderSchema,
}

/// DFS bookkeeping for cycle detection.
#[derive(Default)]
struct CycleSearch<'g> {
    in_progress: HashSet<&'g str>,
    done: HashSet<&'g str>,
    path: Vec<&'g str>,
}

impl<'a> GraphBuilder<'a> {
    /// Creates a builder for the given schema.
    #[must_use]
    pub const fn new(schema: &'a ProviderSchema) -> Self {
        Self { schema }
    }

    /// Builds the graph.
    ///
    /// # Errors
    ///
    /// Returns a [`BuildError`] for an unsupported kind, a duplicate address,
    /// a malformed or dangling reference, or a dependency cycle.
    pub fn build(&self, declarations: &[ResourceDeclaration]) -> Result<ResourceGraph> {
        let mut graph = ResourceGraph::default();

        for declaration in declarations {
            let node = self.parse_declaration(declaration)?;
            if graph.contains(&node.address) {
                return Err(BuildError::DuplicateResourceAddress {
                    address: node.address,
                }
                .into());
            }
            graph.insert_node(node);
        }

        for edge in Self::collect_edges(&graph)? {
            graph.insert_edge(edge);
        }

        Self::detect_cycles(&graph)?;

        info!(
            "Built resource graph: {} nodes, {} edges",
            graph.len(),
            graph.edges().len()
        );
        Ok(graph)
    }

    /// Parses one declaration into a node.
    fn parse_declaration(&self, declaration: &ResourceDeclaration) -> Result<ResourceNode> {
        let address = declaration.address();

        for segment in [&declaration.kind, &declaration.name] {
            if !is_valid_identifier(segment) {
                return Err(BuildError::InvalidAddress {
                    address,
                    reason: format!("'{segment}' must use letters, digits, '_' or '-'"),
                }
                .into());
            }
        }

        if !self.schema.supports(&declaration.kind) {
            return Err(BuildError::UnsupportedResourceKind {
                address,
                kind: declaration.kind.clone(),
            }
            .into());
        }

        let mut attributes = BTreeMap::new();
        for (key, value) in &declaration.attributes {
            let parsed = AttributeValue::parse(value, &format!("{address}.{key}"))?;
            attributes.insert(key.clone(), parsed);
        }

        debug!("Parsed {address} with {} attributes", attributes.len());

        Ok(ResourceNode {
            address,
            kind: declaration.kind.clone(),
            name: declaration.name.clone(),
            attributes,
            depends_on: declaration.depends_on.iter().cloned().collect(),
        })
    }

    /// Derives explicit and reference edges, rejecting dangling targets.
    fn collect_edges(graph: &ResourceGraph) -> Result<Vec<DependencyEdge>> {
        let mut edges = Vec::new();

        for node in graph.nodes() {
            let explicit = node
                .depends_on
                .iter()
                .map(|target| (target.clone(), EdgeOrigin::Explicit));
            let implicit = node
                .referenced_addresses()
                .into_iter()
                .map(|target| (target, EdgeOrigin::Reference));

            for (target, origin) in explicit.chain(implicit) {
                if !graph.contains(&target) {
                    return Err(BuildError::UnknownReference {
                        address: node.address.clone(),
                        target,
                    }
                    .into());
                }
                edges.push(DependencyEdge {
                    dependent: node.address.clone(),
                    dependency: target,
                    origin,
                });
            }
        }

        Ok(edges)
    }

    /// Depth-first cycle detection over the dependency edges.
    fn detect_cycles(graph: &ResourceGraph) -> Result<()> {
        let adjacency: BTreeMap<&str, BTreeSet<&str>> = graph
            .nodes()
            .map(|node| {
                let targets = graph
                    .dependencies
                    .get(&node.address)
                    .map(|deps| deps.iter().map(String::as_str).collect())
                    .unwrap_or_default();
                (node.address.as_str(), targets)
            })
            .collect();

        let mut search = CycleSearch::default();
        for start in adjacency.keys() {
            if let Some(path) = search.visit(start, &adjacency) {
                return Err(BuildError::DependencyCycle { path }.into());
            }
        }
        Ok(())
    }
}

impl<'g> CycleSearch<'g> {
    /// Visits a node; returns the cycle path if a back-edge is found.
    fn visit(
        &mut self,
        node: &'g str,
        adjacency: &BTreeMap<&'g str, BTreeSet<&'g str>>,
    ) -> Option<Vec<String>> {
        if self.done.contains(node) {
            return None;
        }
        if self.in_progress.contains(node) {
            let start = self.path.iter().position(|n| *n == node).unwrap_or(0);
            let mut cycle: Vec<String> = self.path[start..].iter().map(|n| (*n).to_string()).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }

        self.in_progress.insert(node);
        self.path.push(node);

        if let Some(targets) = adjacency.get(node) {
            for target in targets {
                if let Some(cycle) = self.visit(target, adjacency) {
                    return Some(cycle);
                }
            }
        }

        self.path.pop();
        self.in_progress.remove(node);
        self.done.insert(node);
        None
    }
}
