//! Execution plan types and construction.
//!
//! Turns a diff into provider-facing steps keyed by (address, phase), wires
//! ordering edges between them and groups them into batches with Kahn's
//! algorithm. Every step's prerequisites sit in an earlier batch.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info};

use crate::error::{PlanError, Result};
use crate::graph::{ResourceGraph, ResourceNode};
use crate::provider::{ProviderSchema, ReplaceStrategy};

use super::diff::{AttributeChange, DiffAction, DiffEntry, DiffResult};

/// Phase of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    /// Create or update toward the desired attributes.
    Apply,
    /// Destroy the current or deposed object.
    Destroy,
}

/// Identifies a step. Serializes as `"address (phase)"` so it can key JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepId {
    /// Resource address.
    pub address: String,
    /// Step phase.
    pub phase: StepPhase,
}

/// Kind of provider work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Create a new object.
    Create,
    /// Update the object in place.
    Update,
    /// Destroy an object no longer declared.
    Destroy,
    /// Destroy the old object ahead of its replacement.
    DestroyForReplace,
    /// Create the replacement object.
    CreateReplacement,
    /// Destroy deposed objects left by create-before-destroy.
    DestroyDeposed,
}

/// One unit of provider-facing work.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    /// Step identifier.
    pub id: StepId,
    /// What the step does.
    pub action: StepAction,
    /// Resource kind.
    pub kind: String,
    /// Attribute changes shown to the user.
    pub changes: Vec<AttributeChange>,
    /// Desired node for apply steps.
    #[serde(skip)]
    pub node: Option<ResourceNode>,
    /// Graph dependencies recorded with the resource after apply.
    pub dependencies: BTreeSet<String>,
    /// Replace strategy in effect, for replacement steps.
    pub strategy: Option<ReplaceStrategy>,
}

/// A complete execution plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Hash of the desired-state document this plan is based on.
    pub config_hash: String,
    /// The diff the plan was built from.
    pub diff: DiffResult,
    /// Steps by identifier.
    pub steps: BTreeMap<StepId, PlanStep>,
    /// Steps each step waits for.
    pub prerequisites: BTreeMap<StepId, BTreeSet<StepId>>,
    /// Batches in execution order.
    pub batches: Vec<Vec<StepId>>,
}

/// Builds execution plans.
#[derive(Debug, Clone, Copy)]
pub struct Planner<'a> {
    schema: &'a ProviderSchema,
}

impl<'a> Planner<'a> {
    /// Creates a planner.
    #[must_use]
    pub const fn new(schema: &'a ProviderSchema) -> Self {
        Self { schema }
    }

    /// Builds a plan from a diff.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::UnresolvableReplacementOrder`] when replacements
    /// form a cycle and [`PlanError::DependencyResolutionFailed`] for any
    /// other leftover cycle.
    pub fn build(
        &self,
        diff: DiffResult,
        graph: &ResourceGraph,
        config_hash: &str,
    ) -> Result<ExecutionPlan> {
        let steps = self.steps(&diff, graph);
        let prerequisites = Self::edges(&diff, &steps);
        let batches = Self::batches(&steps, &prerequisites)?;

        info!(
            "Planned {} steps in {} batches",
            steps.len(),
            batches.len()
        );

        Ok(ExecutionPlan {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            diff,
            steps,
            prerequisites,
            batches,
        })
    }

    /// Expands diff entries into steps.
    fn steps(&self, diff: &DiffResult, graph: &ResourceGraph) -> BTreeMap<StepId, PlanStep> {
        let mut steps = BTreeMap::new();

        for entry in diff.entries.values() {
            let node = graph.node(&entry.address).cloned();
            let strategy = self.schema.replace_strategy(&entry.kind);
            let mut add = |phase: StepPhase, action: StepAction, node: Option<ResourceNode>| {
                let id = StepId::new(&entry.address, phase);
                steps.insert(
                    id.clone(),
                    PlanStep {
                        id,
                        action,
                        kind: entry.kind.clone(),
                        changes: entry.changes.clone(),
                        node,
                        dependencies: entry.dependencies.clone(),
                        strategy: (entry.action == DiffAction::Replace).then_some(strategy),
                    },
                );
            };

            match entry.action {
                DiffAction::Create => add(StepPhase::Apply, StepAction::Create, node),
                DiffAction::Update => add(StepPhase::Apply, StepAction::Update, node),
                DiffAction::Destroy => add(StepPhase::Destroy, StepAction::Destroy, None),
                DiffAction::Replace => {
                    add(StepPhase::Apply, StepAction::CreateReplacement, node);
                    let destroy = match strategy {
                        ReplaceStrategy::DestroyBeforeCreate => StepAction::DestroyForReplace,
                        ReplaceStrategy::CreateBeforeDestroy => StepAction::DestroyDeposed,
                    };
                    add(StepPhase::Destroy, destroy, None);
                }
                DiffAction::NoOp => {}
            }

            if !entry.deposed.is_empty() && entry.action != DiffAction::Destroy {
                let id = StepId::new(&entry.address, StepPhase::Destroy);
                steps.entry(id.clone()).or_insert_with(|| PlanStep {
                    id,
                    action: StepAction::DestroyDeposed,
                    kind: entry.kind.clone(),
                    changes: Vec::new(),
                    node: None,
                    dependencies: entry.dependencies.clone(),
                    strategy: None,
                });
            }
        }

        steps
    }

    /// Computes the prerequisites of every step.
    fn edges(
        diff: &DiffResult,
        steps: &BTreeMap<StepId, PlanStep>,
    ) -> BTreeMap<StepId, BTreeSet<StepId>> {
        let mut prerequisites: BTreeMap<StepId, BTreeSet<StepId>> =
            steps.keys().map(|id| (id.clone(), BTreeSet::new())).collect();
        let mut add_edge = |before: StepId, after: StepId| {
            if before != after {
                if let Some(set) = prerequisites.get_mut(&after) {
                    set.insert(before);
                }
            }
        };

        for step in steps.values() {
            let address = &step.id.address;
            match step.id.phase {
                StepPhase::Apply => {
                    for dependency in Self::nearest(diff, address, steps, StepPhase::Apply) {
                        let dep_apply = StepId::new(&dependency, StepPhase::Apply);
                        let dep_destroy = StepId::new(&dependency, StepPhase::Destroy);
                        if steps
                            .get(&dep_destroy)
                            .is_some_and(|s| s.action == StepAction::DestroyDeposed)
                        {
                            // Dependents move off the deposed object first.
                            add_edge(step.id.clone(), dep_destroy);
                        }
                        add_edge(dep_apply, step.id.clone());
                    }
                }
                StepPhase::Destroy => {
                    for dependency in Self::nearest(diff, address, steps, StepPhase::Destroy) {
                        add_edge(step.id.clone(), StepId::new(&dependency, StepPhase::Destroy));
                    }

                    let own_apply = StepId::new(address, StepPhase::Apply);
                    match step.action {
                        StepAction::DestroyForReplace => {
                            add_edge(step.id.clone(), own_apply);
                        }
                        StepAction::DestroyDeposed => {
                            if steps.contains_key(&own_apply) {
                                add_edge(own_apply, step.id.clone());
                            }
                        }
                        StepAction::Destroy => {
                            for other in diff.entries.values() {
                                let other_apply = StepId::new(&other.address, StepPhase::Apply);
                                if other.recorded_dependencies.contains(address)
                                    && steps.contains_key(&other_apply)
                                {
                                    add_edge(other_apply, step.id.clone());
                                }
                            }
                        }
                        StepAction::Create | StepAction::Update | StepAction::CreateReplacement => {}
                    }
                }
            }
        }

        prerequisites
    }

    /// Finds the nearest dependencies of `address` that have a step in
    /// `phase`, walking through addresses without one.
    ///
    /// Apply ordering follows desired dependencies; destroy ordering follows
    /// the dependencies recorded when the objects were created.
    fn nearest(
        diff: &DiffResult,
        address: &str,
        steps: &BTreeMap<StepId, PlanStep>,
        phase: StepPhase,
    ) -> BTreeSet<String> {
        let next = |addr: &str| -> BTreeSet<String> {
            diff.get(addr)
                .map(|entry: &DiffEntry| match phase {
                    StepPhase::Apply => entry.dependencies.clone(),
                    StepPhase::Destroy => entry.recorded_dependencies.clone(),
                })
                .unwrap_or_default()
        };

        let mut found = BTreeSet::new();
        let mut seen = BTreeSet::new();
        let mut stack: Vec<String> = next(address).into_iter().collect();

        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if steps.contains_key(&StepId::new(&current, phase)) {
                found.insert(current);
            } else {
                stack.extend(next(&current));
            }
        }

        found
    }

    /// Groups steps into batches with Kahn's algorithm.
    fn batches(
        steps: &BTreeMap<StepId, PlanStep>,
        prerequisites: &BTreeMap<StepId, BTreeSet<StepId>>,
    ) -> Result<Vec<Vec<StepId>>> {
        let mut in_degree: BTreeMap<&StepId, usize> = prerequisites
            .iter()
            .map(|(id, before)| (id, before.len()))
            .collect();
        let mut dependents: BTreeMap<&StepId, Vec<&StepId>> = BTreeMap::new();
        for (id, before) in prerequisites {
            for prerequisite in before {
                dependents.entry(prerequisite).or_default().push(id);
            }
        }

        let mut batches = Vec::new();
        let mut ready: Vec<&StepId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        while !ready.is_empty() {
            ready.sort();
            let mut next = Vec::new();
            for id in &ready {
                in_degree.remove(*id);
                for dependent in dependents.get(*id).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(*dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(*dependent);
                        }
                    }
                }
            }
            debug!("Batch {}: {} steps", batches.len(), ready.len());
            batches.push(ready.iter().map(|id| (*id).clone()).collect());
            ready = next;
        }

        if in_degree.is_empty() {
            return Ok(batches);
        }

        let stuck: Vec<&StepId> = in_degree.keys().copied().collect();
        let names: Vec<String> = stuck.iter().map(ToString::to_string).collect();
        let involves_replacement = stuck.iter().any(|id| {
            steps.get(*id).is_some_and(|s| {
                matches!(
                    s.action,
                    StepAction::DestroyForReplace
                        | StepAction::CreateReplacement
                        | StepAction::DestroyDeposed
                )
            })
        });

        if involves_replacement {
            Err(PlanError::UnresolvableReplacementOrder { steps: names }.into())
        } else {
            Err(PlanError::DependencyResolutionFailed {
                message: format!("steps left unordered: {}", names.join(", ")),
            }
            .into())
        }
    }
}

impl StepId {
    /// Creates a step identifier.
    #[must_use]
    pub fn new(address: &str, phase: StepPhase) -> Self {
        Self {
            address: address.to_string(),
            phase,
        }
    }
}

impl ExecutionPlan {
    /// Returns true if the plan has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Returns the number of steps performing `action`.
    #[must_use]
    pub fn count(&self, action: StepAction) -> usize {
        self.steps.values().filter(|s| s.action == action).count()
    }

    /// Returns the step with the given identifier.
    #[must_use]
    pub fn step(&self, id: &StepId) -> Option<&PlanStep> {
        self.steps.get(id)
    }

    /// Returns the prerequisites of a step.
    #[must_use]
    pub fn prerequisites_of(&self, id: &StepId) -> impl Iterator<Item = &StepId> {
        self.prerequisites.get(id).into_iter().flatten()
    }

    /// Returns the index of the batch containing a step.
    #[must_use]
    pub fn batch_of(&self, id: &StepId) -> Option<usize> {
        self.batches.iter().position(|batch| batch.contains(id))
    }

    /// Returns every address the plan touches.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self.steps.keys().map(|id| id.address.as_str()).collect();
        set.into_iter().map(String::from).collect()
    }
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.phase)
    }
}

impl Serialize for StepId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
            Self::DestroyForReplace => "destroy (replace)",
            Self::CreateReplacement => "create (replace)",
            Self::DestroyDeposed => "destroy deposed",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.id.address)
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.steps.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(
            f,
            "Execution plan ({} steps, {} batches):",
            self.steps.len(),
            self.batches.len()
        )?;
        for (index, batch) in self.batches.iter().enumerate() {
            writeln!(f, "  batch {}:", index + 1)?;
            for id in batch {
                if let Some(step) = self.steps.get(id) {
                    writeln!(f, "    {step}")?;
                    for change in &step.changes {
                        writeln!(f, "      {change}")?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDeclaration;
    use crate::error::HalldyllError;
    use crate::graph::GraphBuilder;
    use crate::planner::DiffEngine;
    use crate::provider::KindSchema;
    use crate::state::ActualStateRecord;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::{Map, Value, json};

    fn schema(vm_strategy: ReplaceStrategy, net_strategy: ReplaceStrategy) -> ProviderSchema {
        ProviderSchema::new()
            .with_kind(
                "net",
                KindSchema::new().replace_on(["cidr"]).with_strategy(net_strategy),
            )
            .with_kind(
                "vm",
                KindSchema::new()
                    .replace_on(["image", "subnet"])
                    .with_strategy(vm_strategy),
            )
            .with_kind("dns", KindSchema::new())
    }

    fn default_schema() -> ProviderSchema {
        schema(ReplaceStrategy::DestroyBeforeCreate, ReplaceStrategy::DestroyBeforeCreate)
    }

    fn decl(kind: &str, name: &str, attributes: serde_json::Value, depends_on: &[&str]) -> ResourceDeclaration {
        ResourceDeclaration {
            kind: kind.to_string(),
            name: name.to_string(),
            attributes: attributes
                .as_object()
                .map(|m| m.clone().into_iter().collect())
                .unwrap_or_default(),
            depends_on: depends_on.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    fn record(address: &str, id: &str, applied: serde_json::Value, deps: &[&str]) -> ActualStateRecord {
        let kind = address.split('.').next().unwrap_or_default();
        ActualStateRecord::new(address, kind, id)
            .with_applied(
                applied
                    .as_object()
                    .map(|m| m.clone().into_iter().collect())
                    .unwrap_or_default(),
            )
            .with_dependencies(deps.iter().map(|s| (*s).to_string()).collect())
    }

    fn plan(
        schema: &ProviderSchema,
        declarations: &[ResourceDeclaration],
        records: Vec<ActualStateRecord>,
    ) -> Result<ExecutionPlan> {
        let graph = GraphBuilder::new(schema).build(declarations)?;
        let records: BTreeMap<_, _> = records.into_iter().map(|r| (r.address.clone(), r)).collect();
        let diff = DiffEngine::new(schema).compute_diff(&graph, &records);
        Planner::new(schema).build(diff, &graph, "hash")
    }

    fn apply(address: &str) -> StepId {
        StepId::new(address, StepPhase::Apply)
    }

    fn destroy(address: &str) -> StepId {
        StepId::new(address, StepPhase::Destroy)
    }

    fn assert_prerequisites_precede(plan: &ExecutionPlan) {
        for (id, before) in &plan.prerequisites {
            let batch = plan.batch_of(id).expect("step batched");
            for prerequisite in before {
                assert!(plan.batch_of(prerequisite).expect("batched") < batch);
            }
        }
    }

    fn network_and_compute(cidr: &str, image: &str) -> Vec<ResourceDeclaration> {
        vec![
            decl("net", "n", json!({"cidr": cidr}), &[]),
            decl("vm", "c", json!({"image": image, "subnet": "${net.n.id}"}), &[]),
        ]
    }

    #[test]
    fn test_fresh_network_and_compute_batches() {
        let schema = default_schema();
        let plan = plan(&schema, &network_and_compute("10.0.0.0/16", "ubuntu"), vec![])
            .expect("plans");

        assert_eq!(plan.batches, vec![vec![apply("net.n")], vec![apply("vm.c")]]);
        assert_eq!(plan.count(StepAction::Create), 2);
    }

    #[test]
    fn test_plan_serializes_with_string_step_keys() {
        let schema = default_schema();
        let plan = plan(&schema, &network_and_compute("10.0.0.0/16", "ubuntu"), vec![])
            .expect("plans");

        let value = serde_json::to_value(&plan).expect("plan serializes");
        assert_eq!(value["batches"][1][0], json!("vm.c (apply)"));
        assert_eq!(value["steps"]["net.n (apply)"]["action"], json!("create"));
        assert_eq!(
            value["prerequisites"]["vm.c (apply)"],
            json!(["net.n (apply)"])
        );
    }

    #[test]
    fn test_independent_steps_share_a_batch() {
        let schema = default_schema();
        let plan = plan(
            &schema,
            &[
                decl("net", "a", json!({}), &[]),
                decl("net", "b", json!({}), &[]),
                decl("vm", "c", json!({}), &["net.a", "net.b"]),
            ],
            vec![],
        )
        .expect("plans");

        assert_eq!(plan.batches[0], vec![apply("net.a"), apply("net.b")]);
        assert_eq!(plan.batches[1], vec![apply("vm.c")]);
        assert_prerequisites_precede(&plan);
    }

    #[test]
    fn test_noop_plan_is_empty() {
        let schema = default_schema();
        let plan = plan(
            &schema,
            &network_and_compute("10.0.0.0/16", "ubuntu"),
            vec![
                record("net.n", "n-1", json!({"cidr": "10.0.0.0/16"}), &[]),
                record("vm.c", "c-1", json!({"image": "ubuntu", "subnet": "n-1"}), &["net.n"]),
            ],
        )
        .expect("plans");

        assert!(plan.is_empty());
        assert_eq!(plan.to_string(), "No changes required");
    }

    #[test]
    fn test_destroy_before_create_replacement() {
        let schema = default_schema();
        let plan = plan(
            &schema,
            &network_and_compute("10.0.0.0/16", "debian"),
            vec![
                record("net.n", "n-1", json!({"cidr": "10.0.0.0/16"}), &[]),
                record("vm.c", "c-1", json!({"image": "ubuntu", "subnet": "n-1"}), &["net.n"]),
            ],
        )
        .expect("plans");

        assert_eq!(plan.diff.action("net.n"), Some(DiffAction::NoOp));
        assert_eq!(plan.batches, vec![vec![destroy("vm.c")], vec![apply("vm.c")]]);
        assert_eq!(
            plan.step(&destroy("vm.c")).map(|s| s.action),
            Some(StepAction::DestroyForReplace)
        );
    }

    #[test]
    fn test_replaced_dependency_reapplies_dependents_after_create() {
        let schema = schema(ReplaceStrategy::DestroyBeforeCreate, ReplaceStrategy::CreateBeforeDestroy);
        let plan = plan(
            &schema,
            &[
                decl("net", "n", json!({"cidr": "10.1.0.0/16"}), &[]),
                decl("dns", "d", json!({"target": "${net.n.id}"}), &[]),
            ],
            vec![
                record("net.n", "n-1", json!({"cidr": "10.0.0.0/16"}), &[]),
                record("dns.d", "d-1", json!({"target": "n-1"}), &["net.n"]),
            ],
        )
        .expect("plans");

        assert_eq!(plan.diff.action("dns.d"), Some(DiffAction::Update));
        assert_eq!(
            plan.batches,
            vec![vec![apply("net.n")], vec![apply("dns.d")], vec![destroy("net.n")]]
        );
    }

    #[test]
    fn test_destroy_order_reverses_dependencies_through_noop() {
        let schema = default_schema();
        let plan = plan(
            &schema,
            &[decl("net", "keep", json!({}), &[])],
            vec![
                record("net.keep", "k-1", json!({}), &[]),
                record("net.base", "b-1", json!({}), &[]),
                record("dns.mid", "m-1", json!({}), &["net.base"]),
                record("vm.top", "t-1", json!({}), &["dns.mid"]),
            ],
        )
        .expect("plans");

        assert_eq!(
            plan.batches,
            vec![vec![destroy("vm.top")], vec![destroy("dns.mid")], vec![destroy("net.base")]]
        );
    }

    #[test]
    fn test_apply_edges_pass_through_noop() {
        let schema = default_schema();
        let plan = plan(
            &schema,
            &[
                decl("net", "a", json!({"cidr": "x"}), &[]),
                decl("dns", "b", json!({}), &["net.a"]),
                decl("vm", "c", json!({}), &["dns.b"]),
            ],
            vec![
                record("net.a", "a-1", json!({"cidr": "y"}), &[]),
                record("dns.b", "b-1", json!({}), &["net.a"]),
            ],
        )
        .expect("plans");

        assert_eq!(plan.diff.action("dns.b"), Some(DiffAction::NoOp));
        assert!(plan.prerequisites[&apply("vm.c")].contains(&apply("net.a")));
        assert_prerequisites_precede(&plan);
    }

    #[test]
    fn test_orphan_destroyed_after_dependent_moves_away() {
        let schema = default_schema();
        let plan = plan(
            &schema,
            &[decl("dns", "d", json!({"target": "static"}), &[])],
            vec![
                record("net.old", "o-1", json!({}), &[]),
                record("dns.d", "d-1", json!({"target": "o-1"}), &["net.old"]),
            ],
        )
        .expect("plans");

        assert_eq!(plan.batches, vec![vec![apply("dns.d")], vec![destroy("net.old")]]);
    }

    #[test]
    fn test_mixed_strategies_cycle_is_unresolvable() {
        let schema = schema(ReplaceStrategy::CreateBeforeDestroy, ReplaceStrategy::DestroyBeforeCreate);
        let result = plan(
            &schema,
            &network_and_compute("10.1.0.0/16", "ubuntu"),
            vec![
                record("net.n", "n-1", json!({"cidr": "10.0.0.0/16"}), &[]),
                record("vm.c", "c-1", json!({"image": "ubuntu", "subnet": "n-1"}), &["net.n"]),
            ],
        );

        assert!(matches!(
            result,
            Err(HalldyllError::Plan(PlanError::UnresolvableReplacementOrder { .. }))
        ));
    }

    #[test]
    fn test_deposed_cleanup_step() {
        let schema = default_schema();
        let mut rec = record("net.n", "n-2", json!({"cidr": "10.0.0.0/16"}), &[]);
        rec.deposed.push(String::from("n-1"));
        let plan = plan(
            &schema,
            &[decl("net", "n", json!({"cidr": "10.0.0.0/16"}), &[])],
            vec![rec],
        )
        .expect("plans");

        assert_eq!(plan.batches, vec![vec![destroy("net.n")]]);
        assert_eq!(plan.count(StepAction::DestroyDeposed), 1);
    }

    const KINDS: [&str; 3] = ["net", "vm", "dns"];

    /// A random acyclic document with recorded state for some of it.
    struct GeneratedDag {
        declarations: Vec<ResourceDeclaration>,
        records: Vec<ActualStateRecord>,
        /// `(dependency, dependent)` pairs.
        edges: Vec<(String, String)>,
    }

    /// Edges only point from lower to higher index, so the result is acyclic.
    fn generate_dag(rng: &mut StdRng) -> GeneratedDag {
        let size = rng.gen_range(2..=12);
        let addresses: Vec<String> = (0..size)
            .map(|i| format!("{}.r{i}", KINDS[rng.gen_range(0..KINDS.len())]))
            .collect();

        let mut dag = GeneratedDag {
            declarations: Vec::new(),
            records: Vec::new(),
            edges: Vec::new(),
        };

        for (i, address) in addresses.iter().enumerate() {
            let mut attributes = Map::new();
            let mut applied = Map::new();
            let mut depends_on = Vec::new();
            let mut recorded_dependencies = Vec::new();

            attributes.insert(String::from("size"), json!("small"));
            let recorded_size = if rng.gen_bool(0.3) { "large" } else { "small" };
            applied.insert(String::from("size"), json!(recorded_size));

            for (j, dependency) in addresses[..i].iter().enumerate() {
                if !rng.gen_bool(0.3) {
                    continue;
                }
                if rng.gen_bool(0.5) {
                    let name = format!("ref{j}");
                    attributes.insert(name.clone(), json!(format!("${{{dependency}.id}}")));
                    applied.insert(name, json!(format!("id-{j}")));
                } else {
                    depends_on.push(dependency.as_str());
                }
                recorded_dependencies.push(dependency.as_str());
                dag.edges.push((dependency.clone(), address.clone()));
            }

            let (kind, name) = address.split_once('.').expect("generated address");
            dag.declarations
                .push(decl(kind, name, Value::Object(attributes), &depends_on));
            if rng.gen_bool(0.6) {
                dag.records.push(record(
                    address,
                    &format!("id-{i}"),
                    Value::Object(applied),
                    &recorded_dependencies,
                ));
            }
        }

        dag
    }

    #[test]
    fn test_generated_graphs_respect_every_edge() {
        let schema = default_schema();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut ordered_edges = 0;

        for _ in 0..200 {
            let dag = generate_dag(&mut rng);

            let forward = plan(&schema, &dag.declarations, dag.records.clone())
                .expect("acyclic document plans");
            assert_prerequisites_precede(&forward);
            for (dependency, dependent) in &dag.edges {
                let pair = (
                    forward.batch_of(&apply(dependency)),
                    forward.batch_of(&apply(dependent)),
                );
                if let (Some(before), Some(after)) = pair {
                    assert!(before < after, "{dependency} must apply before {dependent}");
                    ordered_edges += 1;
                }
            }

            let records: BTreeMap<_, _> = dag
                .records
                .iter()
                .map(|r| (r.address.clone(), r.clone()))
                .collect();
            let teardown = Planner::new(&schema)
                .build(DiffEngine::destroy_all(&records), &ResourceGraph::empty(), "hash")
                .expect("teardown plans");
            assert_prerequisites_precede(&teardown);
            for (dependency, dependent) in &dag.edges {
                let pair = (
                    teardown.batch_of(&destroy(dependent)),
                    teardown.batch_of(&destroy(dependency)),
                );
                if let (Some(before), Some(after)) = pair {
                    assert!(before < after, "{dependent} must be destroyed before {dependency}");
                    ordered_edges += 1;
                }
            }
        }

        assert!(ordered_edges > 100);
    }
}
