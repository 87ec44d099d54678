//! Reconciler for converging actual state toward the desired-state document.
//!
//! Ties the pieces together: build the graph, diff it against recorded state,
//! plan, execute under the state lock, then record history and outputs. Also
//! hosts the read-only flows: refresh and drift detection.
//!
//! Every mutating flow re-reads state once the lock is held and keeps the
//! lock renewed until it finishes.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, InfraConfig};
use crate::error::{BuildError, HalldyllError, ProviderError, ReconcileError, Result, StateError};
use crate::graph::{AttributeValue, GraphBuilder, Reference, ResourceGraph};
use crate::planner::{
    AttributeChange, DiffEngine, ExecutionPlan, ExecutionReport, ExecutorOptions, PlanExecutor,
    PlanStatus, Planner,
};
use crate::provider::ProviderRegistry;
use crate::state::{
    ActualStateRecord, HistoryEntry, LockInfo, Operation, StateBackend, StateStore,
    generate_holder_id,
};

/// Shortest pause between lock renewals.
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

/// What a plan converges toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    /// The desired-state document.
    Apply,
    /// Nothing: every recorded resource is destroyed.
    Destroy,
}

/// Reconciliation engine.
#[derive(Debug)]
pub struct Reconciler {
    /// Desired-state document.
    config: InfraConfig,
    /// Providers by kind.
    registry: Arc<ProviderRegistry>,
    /// Recorded actual state.
    store: Arc<StateStore>,
    /// Document hasher.
    hasher: ConfigHasher,
}

/// A state lock held by this process, renewed in the background.
struct HeldLock {
    lock: LockInfo,
    stop: watch::Sender<bool>,
    renewer: JoinHandle<()>,
}

/// Result of an apply or destroy run.
#[derive(Debug, Serialize)]
pub struct ApplyResult {
    /// Resources created.
    pub created: usize,
    /// Resources updated in place.
    pub updated: usize,
    /// Resources replaced.
    pub replaced: usize,
    /// Resources destroyed.
    pub destroyed: usize,
    /// Resources left unchanged.
    pub unchanged: usize,
    /// Executor report.
    pub report: ExecutionReport,
    /// Outputs resolved after a successful run.
    pub outputs: BTreeMap<String, Value>,
    /// Outputs that could not be resolved.
    pub output_errors: Vec<String>,
}

/// Result of a refresh.
#[derive(Debug, Default, Serialize)]
pub struct RefreshReport {
    /// Records whose provider attributes changed.
    pub updated: Vec<String>,
    /// Records dropped because the object no longer exists.
    pub removed: Vec<String>,
    /// Records left as they were.
    pub unchanged: Vec<String>,
    /// Records that could not be read, with the reason.
    pub errors: Vec<(String, String)>,
}

/// How a recorded resource drifted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Drift {
    /// The object no longer exists.
    Missing,
    /// Applied attributes no longer match what the provider reports.
    Changed {
        /// Changed attributes, old being the applied value.
        changes: Vec<AttributeChange>,
    },
}

/// Report of drift detection.
#[derive(Debug, Default, Serialize)]
pub struct DriftReport {
    /// Drift by address.
    pub drifted: BTreeMap<String, Drift>,
    /// Number of records checked.
    pub checked: usize,
    /// Records that could not be read, with the reason.
    pub errors: Vec<(String, String)>,
}

impl Reconciler {
    /// Creates a reconciler.
    #[must_use]
    pub const fn new(
        config: InfraConfig,
        registry: Arc<ProviderRegistry>,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            hasher: ConfigHasher::new(),
        }
    }

    /// Returns the desired-state document.
    #[must_use]
    pub const fn config(&self) -> &InfraConfig {
        &self.config
    }

    /// Returns the state store.
    #[must_use]
    pub const fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Builds the resource graph and checks output references against it.
    ///
    /// # Errors
    ///
    /// Returns a [`BuildError`] if the document does not form a valid graph.
    pub fn build_graph(&self) -> Result<ResourceGraph> {
        let graph = GraphBuilder::new(self.registry.schema()).build(&self.config.resources)?;

        for (name, expression) in &self.config.outputs {
            let location = format!("outputs.{name}");
            let value = AttributeValue::parse_string(expression, &location)?;
            for reference in value.references() {
                if !graph.contains(&reference.address) {
                    return Err(BuildError::UnknownReference {
                        address: location,
                        target: reference.address.clone(),
                    }
                    .into());
                }
            }
        }

        Ok(graph)
    }

    /// Computes an execution plan.
    ///
    /// # Errors
    ///
    /// Returns a build or plan error; no provider is called.
    pub async fn plan(&self, mode: PlanMode) -> Result<ExecutionPlan> {
        let records = self.store.records().await;
        let schema = self.registry.schema();
        let config_hash = self.hasher.hash_config(&self.config);

        let (graph, diff) = match mode {
            PlanMode::Apply => {
                let graph = self.build_graph()?;
                let diff = DiffEngine::new(schema).compute_diff(&graph, &records);
                (graph, diff)
            }
            PlanMode::Destroy => (ResourceGraph::empty(), DiffEngine::destroy_all(&records)),
        };

        info!(
            "Diff: {} creates, {} updates, {} replaces, {} destroys, {} unchanged",
            diff.creates(),
            diff.updates(),
            diff.replaces(),
            diff.destroys(),
            diff.unchanged()
        );

        Planner::new(schema).build(diff, &graph, &config_hash)
    }

    /// Plans and executes under the state lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held elsewhere or planning fails.
    /// Provider failures do not error; they are in the returned report.
    pub async fn apply(&self, mode: PlanMode, cancel: watch::Receiver<bool>) -> Result<ApplyResult> {
        let operation = match mode {
            PlanMode::Apply => Operation::Apply,
            PlanMode::Destroy => Operation::Destroy,
        };
        let held = self.lock(&operation.to_string()).await?;

        let result = match self.plan(mode).await {
            Ok(plan) => self.execute(&plan, operation, cancel).await,
            Err(e) => Err(e),
        };

        self.unlock(held).await;
        result
    }

    /// Executes an already computed plan. The caller holds the state lock.
    async fn execute(
        &self,
        plan: &ExecutionPlan,
        operation: Operation,
        cancel: watch::Receiver<bool>,
    ) -> Result<ApplyResult> {
        let options = ExecutorOptions::from(&self.config.execution);
        let executor = PlanExecutor::new(Arc::clone(&self.registry), Arc::clone(&self.store), options);

        if plan.is_empty() {
            info!("No changes required, state is converged");
        } else {
            debug!("{plan}");
        }
        let report = executor.execute(plan, cancel).await;

        let addresses = report.affected_addresses();
        let entry = match report.status {
            PlanStatus::Succeeded => HistoryEntry::new(operation, &plan.config_hash, addresses),
            status => {
                let failures = report.failures();
                let summary = if failures.is_empty() {
                    format!("run {status}")
                } else {
                    failures
                        .iter()
                        .map(|(id, message)| format!("{id}: {message}"))
                        .collect::<Vec<_>>()
                        .join("; ")
                };
                HistoryEntry::failed(operation, &plan.config_hash, addresses, &summary)
            }
        };
        if let Err(e) = self.store.add_history(entry).await {
            error!("Failed to record history: {e}");
        }

        let mut outputs = BTreeMap::new();
        let mut output_errors = Vec::new();
        if report.is_success() {
            let resolved = match operation {
                Operation::Destroy => Ok(BTreeMap::new()),
                _ => self.resolve_outputs().await,
            };
            match resolved {
                Ok(values) => {
                    self.store.set_outputs(values.clone()).await?;
                    outputs = values;
                }
                Err(e) => {
                    warn!("{e}");
                    output_errors.push(e.to_string());
                }
            }
        }

        Ok(ApplyResult {
            created: plan.diff.creates(),
            updated: plan.diff.updates(),
            replaced: plan.diff.replaces(),
            destroyed: plan.diff.destroys(),
            unchanged: plan.diff.unchanged(),
            report,
            outputs,
            output_errors,
        })
    }

    /// Resolves every output against the current records.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::OutputUnresolved`] for the first output that
    /// references a missing resource or attribute.
    pub async fn resolve_outputs(&self) -> Result<BTreeMap<String, Value>> {
        let records = self.store.records().await;
        let mut outputs = BTreeMap::new();

        for (name, expression) in &self.config.outputs {
            let value = AttributeValue::parse_string(expression, &format!("outputs.{name}"))?;
            let mut lookup = |reference: &Reference| -> Result<Option<Value>> {
                let record = records.get(&reference.address).ok_or_else(|| {
                    ReconcileError::OutputUnresolved {
                        name: name.clone(),
                        reason: format!("{} is not recorded", reference.address),
                    }
                })?;
                let value = record.value(&reference.attribute).ok_or_else(|| {
                    ReconcileError::OutputUnresolved {
                        name: name.clone(),
                        reason: format!("{reference} has no value"),
                    }
                })?;
                Ok(Some(value))
            };
            if let Some(resolved) = value.resolve(&mut lookup)? {
                debug!("Output {name} = {resolved}");
                outputs.insert(name.clone(), resolved);
            }
        }

        Ok(outputs)
    }

    /// Re-reads every recorded resource and updates or drops its record.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken or state cannot be
    /// written. Read failures are reported per record.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let held = self.lock(&Operation::Refresh.to_string()).await?;
        let result = self.refresh_locked().await;
        self.unlock(held).await;
        result
    }

    async fn refresh_locked(&self) -> Result<RefreshReport> {
        let mut report = RefreshReport::default();

        for (address, mut record) in self.store.records().await {
            match self.read(&record).await {
                Ok(Some(attributes)) if attributes == record.attributes => {
                    report.unchanged.push(address);
                }
                Ok(Some(attributes)) => {
                    info!("Refreshed {address}");
                    record.attributes = attributes;
                    record.touch();
                    self.store.put(record).await?;
                    report.updated.push(address);
                }
                Ok(None) => {
                    warn!("{address} ({}) no longer exists, dropping record", record.id);
                    self.store.remove(&address).await?;
                    report.removed.push(address);
                }
                Err(e) => {
                    error!("Failed to read {address}: {e}");
                    report.errors.push((address, e.to_string()));
                }
            }
        }

        let entry = HistoryEntry::new(
            Operation::Refresh,
            &self.hasher.hash_config(&self.config),
            report.updated.iter().chain(&report.removed).cloned().collect(),
        );
        self.store.add_history(entry).await?;

        Ok(report)
    }

    /// Compares recorded state with what providers report, without writing.
    ///
    /// # Errors
    ///
    /// Never fails on provider errors; they are reported per record.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        let schema = self.registry.schema();
        let mut report = DriftReport::default();

        for (address, record) in self.store.records().await {
            report.checked += 1;
            match self.read(&record).await {
                Ok(None) => {
                    report.drifted.insert(address, Drift::Missing);
                }
                Ok(Some(reported)) => {
                    let changes: Vec<AttributeChange> = record
                        .applied
                        .iter()
                        .filter(|(name, _)| !schema.is_computed(&record.kind, name))
                        .filter_map(|(name, applied)| {
                            let current = reported.get(name)?;
                            (current != applied).then(|| AttributeChange {
                                name: name.clone(),
                                old: Some(applied.clone()),
                                new: Some(current.clone()),
                                forces_replacement: schema.requires_replacement(&record.kind, name),
                            })
                        })
                        .collect();
                    if !changes.is_empty() {
                        report.drifted.insert(address, Drift::Changed { changes });
                    }
                }
                Err(e) => report.errors.push((address, e.to_string())),
            }
        }

        info!(
            "Drift check: {} of {} records drifted",
            report.drifted.len(),
            report.checked
        );
        Ok(report)
    }

    /// Removes a record without touching the provider.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotRecorded`] if there is no such record.
    pub async fn forget(&self, address: &str) -> Result<ActualStateRecord> {
        let held = self.lock(&Operation::StateRm.to_string()).await?;
        let result = match self.store.remove(address).await {
            Ok(Some(record)) => {
                let entry = HistoryEntry::new(
                    Operation::StateRm,
                    &self.hasher.hash_config(&self.config),
                    vec![address.to_string()],
                );
                self.store.add_history(entry).await.map(|()| record)
            }
            Ok(None) => Err(StateError::NotRecorded {
                address: address.to_string(),
            }
            .into()),
            Err(e) => Err(e),
        };
        self.unlock(held).await;
        result
    }

    async fn read(&self, record: &ActualStateRecord) -> Result<Option<crate::graph::Attributes>> {
        let provider = self.registry.for_kind(&record.kind)?;
        let deadline = self.config.execution.operation_timeout();
        match tokio::time::timeout(deadline, provider.read(&record.kind, &record.id)).await {
            Ok(result) => result.map_err(HalldyllError::from),
            Err(_) => Err(ProviderError::Timeout {
                operation: format!("read {}", record.address),
                after: deadline,
            }
            .into()),
        }
    }

    /// Takes the state lock, reloads state under it and starts renewal.
    async fn lock(&self, operation: &str) -> Result<HeldLock> {
        let lock = self.acquire(operation).await?;

        match self.store.reload().await {
            Ok(true) => warn!("State was changed by another run, planning against the latest"),
            Ok(false) => {}
            Err(e) => {
                self.release(&lock).await;
                return Err(e);
            }
        }

        let (stop, stopped) = watch::channel(false);
        let renewer = spawn_renewal(Arc::clone(self.store.backend()), lock.clone(), stopped);
        Ok(HeldLock { lock, stop, renewer })
    }

    async fn acquire(&self, operation: &str) -> Result<LockInfo> {
        let backend = self.store.backend();
        let holder = generate_holder_id();
        let mut attempt = 0;
        loop {
            match backend.acquire_lock(&holder, operation).await {
                Ok(lock) => return Ok(lock),
                Err(e) if e.is_retryable() && attempt < 2 => {
                    attempt += 1;
                    let delay = e.retry_delay_secs().unwrap_or(1);
                    warn!("Lock attempt {attempt} failed: {e}, retrying in {delay}s");
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn unlock(&self, held: HeldLock) {
        let HeldLock { lock, stop, renewer } = held;
        let _ = stop.send(true);
        if let Err(e) = renewer.await {
            warn!("Lock renewal task ended abnormally: {e}");
        }
        self.release(&lock).await;
    }

    async fn release(&self, lock: &LockInfo) {
        if let Err(e) = self.store.backend().release_lock(&lock.lock_id).await {
            error!("Failed to release state lock {}: {e}", lock.lock_id);
        }
    }
}

/// Renews `lock` every third of the backend's TTL until `stop` fires.
fn spawn_renewal(
    backend: Arc<dyn StateBackend>,
    mut lock: LockInfo,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let interval = (backend.lock_ttl() / 3).max(MIN_RENEW_INTERVAL);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                () = tokio::time::sleep(interval) => {
                    match backend.renew_lock(&lock).await {
                        Ok(renewed) => lock = renewed,
                        Err(e @ HalldyllError::State(StateError::LockLost { .. })) => {
                            error!("{e}, stopping renewal");
                            break;
                        }
                        Err(e) => warn!("Failed to renew state lock {}: {e}", lock.lock_id),
                    }
                }
            }
        }
    })
}

impl ApplyResult {
    /// Returns true if the run succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.report.is_success()
    }
}

impl DriftReport {
    /// Returns true if nothing drifted and every record was read.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.drifted.is_empty() && self.errors.is_empty()
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.drifted.is_empty() {
            write!(f, "No drift detected ({} records checked)", self.checked)?;
        } else {
            writeln!(f, "Drift detected:")?;
            for (address, drift) in &self.drifted {
                match drift {
                    Drift::Missing => writeln!(f, "  - {address}: missing")?,
                    Drift::Changed { changes } => {
                        writeln!(f, "  - {address}:")?;
                        for change in changes {
                            writeln!(f, "      {change}")?;
                        }
                    }
                }
            }
        }
        for (address, message) in &self.errors {
            write!(f, "\n  ! {address}: {message}")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ApplyResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Run {}:", self.report.status)?;
        writeln!(f, "  Created: {}", self.created)?;
        writeln!(f, "  Updated: {}", self.updated)?;
        writeln!(f, "  Replaced: {}", self.replaced)?;
        writeln!(f, "  Destroyed: {}", self.destroyed)?;
        writeln!(f, "  Unchanged: {}", self.unchanged)?;

        let failures = self.report.failures();
        if !failures.is_empty() {
            writeln!(f, "  Errors:")?;
            for (id, message) in failures {
                writeln!(f, "    - {id}: {message}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ExecutionConfig, ProjectConfig, ResourceDeclaration, StateBackendKind, StateConfig,
    };
    use crate::provider::fake::FakeProvider;
    use crate::provider::{KindSchema, ProviderSchema};
    use crate::state::{DEFAULT_LOCK_TTL, LocalStateBackend};
    use serde_json::json;
    use tempfile::TempDir;

    struct Harness {
        provider: Arc<FakeProvider>,
        reconciler: Reconciler,
        dir: TempDir,
    }

    fn decl(kind: &str, name: &str, attributes: Value) -> ResourceDeclaration {
        ResourceDeclaration {
            kind: kind.to_string(),
            name: name.to_string(),
            attributes: attributes
                .as_object()
                .map(|m| m.clone().into_iter().collect())
                .unwrap_or_default(),
            depends_on: vec![],
        }
    }

    fn document(image: &str) -> InfraConfig {
        InfraConfig {
            project: ProjectConfig {
                name: String::from("demo"),
                environment: String::from("dev"),
            },
            state: StateConfig {
                backend: StateBackendKind::Local,
                ..StateConfig::default()
            },
            providers: vec![],
            execution: ExecutionConfig::default(),
            resources: vec![
                decl("net", "n", json!({"cidr": "10.0.0.0/16"})),
                decl("vm", "c", json!({"image": image, "subnet": "${net.n.id}"})),
            ],
            outputs: BTreeMap::from([(
                String::from("public_ip"),
                String::from("${vm.c.public_ip}"),
            )]),
        }
    }

    /// A reconciler on the state in `dir`, talking to `provider`.
    async fn reconciler_on(
        dir: &std::path::Path,
        lock_ttl: Duration,
        provider: Arc<FakeProvider>,
        config: InfraConfig,
    ) -> Reconciler {
        let backend: Arc<dyn StateBackend> =
            Arc::new(LocalStateBackend::with_base_dir(dir).with_lock_ttl(lock_ttl));
        let store = Arc::new(StateStore::open(backend, "demo", "dev").await.expect("store"));
        let mut registry = ProviderRegistry::new();
        registry.register(provider).expect("registers");
        Reconciler::new(config, Arc::new(registry), store)
    }

    async fn harness_with_ttl(
        dir: TempDir,
        provider: Arc<FakeProvider>,
        config: InfraConfig,
        lock_ttl: Duration,
    ) -> Harness {
        let reconciler = reconciler_on(dir.path(), lock_ttl, provider.clone(), config).await;
        Harness {
            provider,
            reconciler,
            dir,
        }
    }

    async fn harness_in(dir: TempDir, provider: Arc<FakeProvider>, config: InfraConfig) -> Harness {
        harness_with_ttl(dir, provider, config, DEFAULT_LOCK_TTL).await
    }

    fn fake_provider() -> Arc<FakeProvider> {
        let schema = ProviderSchema::new()
            .with_kind("net", KindSchema::new().replace_on(["cidr"]))
            .with_kind(
                "vm",
                KindSchema::new()
                    .replace_on(["image", "subnet"])
                    .computed(["public_ip"]),
            );
        Arc::new(FakeProvider::new(schema))
    }

    async fn harness(config: InfraConfig) -> Harness {
        harness_in(TempDir::new().expect("temp dir"), fake_provider(), config).await
    }

    fn no_cancel() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn test_apply_records_outputs_and_releases_lock() {
        let h = harness(document("ubuntu")).await;
        let result = h
            .reconciler
            .apply(PlanMode::Apply, no_cancel())
            .await
            .expect("apply runs");

        assert!(result.is_success());
        assert_eq!(result.created, 2);
        let vm = h.reconciler.store().get("vm.c").await.expect("recorded");
        assert_eq!(
            result.outputs.get("public_ip"),
            Some(&json!(format!("{}-public_ip", vm.id)))
        );

        let snapshot = h.reconciler.store().snapshot().await;
        assert_eq!(snapshot.outputs, result.outputs);
        assert_eq!(snapshot.history.len(), 1);
        assert!(snapshot.history[0].success);
        assert!(!h.reconciler.store().backend().is_locked().await.expect("lock check"));
    }

    #[tokio::test]
    async fn test_converged_document_plans_nothing() {
        let h = harness(document("ubuntu")).await;
        h.reconciler
            .apply(PlanMode::Apply, no_cancel())
            .await
            .expect("apply runs");
        h.provider.clear_calls();

        let plan = h.reconciler.plan(PlanMode::Apply).await.expect("plans");
        assert!(plan.is_empty());
        assert_eq!(plan.diff.unchanged(), 2);

        let result = h
            .reconciler
            .apply(PlanMode::Apply, no_cancel())
            .await
            .expect("apply runs");
        assert!(result.is_success());
        assert_eq!(h.provider.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let h = harness(document("ubuntu")).await;
        h.reconciler
            .apply(PlanMode::Apply, no_cancel())
            .await
            .expect("apply runs");
        let Harness { provider, dir, .. } = h;

        let h = harness_in(dir, provider, document("ubuntu")).await;
        let plan = h.reconciler.plan(PlanMode::Apply).await.expect("plans");
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() {
        let h = harness(document("ubuntu")).await;
        h.reconciler
            .apply(PlanMode::Apply, no_cancel())
            .await
            .expect("apply runs");

        let result = h
            .reconciler
            .apply(PlanMode::Destroy, no_cancel())
            .await
            .expect("destroy runs");

        assert!(result.is_success());
        assert_eq!(result.destroyed, 2);
        assert_eq!(h.provider.object_count(), 0);
        let snapshot = h.reconciler.store().snapshot().await;
        assert!(snapshot.records.is_empty());
        assert!(snapshot.outputs.is_empty());
        let calls = h.provider.calls();
        let vm_destroy = calls.iter().position(|c| c.starts_with("destroy:vm")).expect("vm destroyed");
        let net_destroy = calls.iter().position(|c| c.starts_with("destroy:net")).expect("net destroyed");
        assert!(vm_destroy < net_destroy);
    }

    #[tokio::test]
    async fn test_cycle_fails_before_any_call() {
        let mut config = document("ubuntu");
        config.resources = vec![
            decl("net", "a", json!({"peer": "${net.b.id}"})),
            decl("net", "b", json!({"peer": "${net.a.id}"})),
        ];
        config.outputs.clear();
        let h = harness(config).await;

        let result = h.reconciler.apply(PlanMode::Apply, no_cancel()).await;

        assert!(matches!(
            result,
            Err(HalldyllError::Build(BuildError::DependencyCycle { .. }))
        ));
        assert!(h.provider.calls().is_empty());
        assert!(!h.reconciler.store().backend().is_locked().await.expect("lock check"));
    }

    #[tokio::test]
    async fn test_output_naming_undeclared_resource_is_rejected() {
        let mut config = document("ubuntu");
        config
            .outputs
            .insert(String::from("dns"), String::from("${dns.missing.name}"));
        let h = harness(config).await;

        assert!(matches!(
            h.reconciler.build_graph(),
            Err(HalldyllError::Build(BuildError::UnknownReference { .. }))
        ));
    }

    #[tokio::test]
    async fn test_held_lock_blocks_apply() {
        let h = harness(document("ubuntu")).await;
        h.reconciler
            .store()
            .backend()
            .acquire_lock("someone-else", "apply")
            .await
            .expect("lock");

        let result = h.reconciler.apply(PlanMode::Apply, no_cancel()).await;

        assert!(matches!(
            result,
            Err(HalldyllError::State(StateError::LockedByOther { .. }))
        ));
        assert!(h.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_runs_see_state_written_by_another_process() {
        let h = harness(document("ubuntu")).await;
        let other = reconciler_on(
            h.dir.path(),
            DEFAULT_LOCK_TTL,
            h.provider.clone(),
            document("ubuntu"),
        )
        .await;

        h.reconciler
            .apply(PlanMode::Apply, no_cancel())
            .await
            .expect("apply runs");
        h.provider.clear_calls();

        let result = other
            .apply(PlanMode::Apply, no_cancel())
            .await
            .expect("second apply runs");
        assert!(result.is_success());
        assert_eq!(result.created, 0);
        assert_eq!(result.unchanged, 2);
        assert_eq!(h.provider.mutation_count(), 0);
        assert_eq!(h.provider.object_count(), 2);
        assert_eq!(other.store().snapshot().await.history.len(), 2);

        let forgotten = h.reconciler.forget("vm.c").await;
        assert!(forgotten.is_ok());
        assert!(matches!(
            other.forget("vm.c").await,
            Err(HalldyllError::State(StateError::NotRecorded { .. }))
        ));
    }

    #[tokio::test]
    async fn test_lock_is_renewed_during_long_apply() {
        let mut config = document("ubuntu");
        config.resources = vec![decl("net", "slow", json!({"delay_ms": 600}))];
        config.outputs.clear();
        let h = harness_with_ttl(
            TempDir::new().expect("temp dir"),
            fake_provider(),
            config,
            Duration::from_millis(150),
        )
        .await;
        let competitor = LocalStateBackend::with_base_dir(h.dir.path());

        let contender = async {
            tokio::time::sleep(Duration::from_millis(350)).await;
            competitor.acquire_lock("someone-else", "apply").await
        };
        let (result, contended) = tokio::join!(
            h.reconciler.apply(PlanMode::Apply, no_cancel()),
            contender
        );

        assert!(result.expect("apply runs").is_success());
        assert!(matches!(
            contended,
            Err(HalldyllError::State(StateError::LockedByOther { .. }))
        ));
        assert!(!h.reconciler.store().backend().is_locked().await.expect("lock check"));
    }

    #[tokio::test]
    async fn test_refresh_drops_vanished_and_updates_changed() {
        let mut config = document("ubuntu");
        config.resources.push(decl("net", "spare", json!({})));
        let h = harness(config).await;
        h.reconciler
            .apply(PlanMode::Apply, no_cancel())
            .await
            .expect("apply runs");
        let vm = h.reconciler.store().get("vm.c").await.expect("recorded");
        let spare = h.reconciler.store().get("net.spare").await.expect("recorded");
        h.provider.forget("net", &spare.id);
        h.provider.tamper("vm", &vm.id, "public_ip", json!("9.9.9.9"));

        let report = h.reconciler.refresh().await.expect("refresh runs");

        assert_eq!(report.removed, vec![String::from("net.spare")]);
        assert_eq!(report.updated, vec![String::from("vm.c")]);
        assert!(h.reconciler.store().get("net.spare").await.is_none());
        let vm = h.reconciler.store().get("vm.c").await.expect("recorded");
        assert_eq!(vm.attributes.get("public_ip"), Some(&json!("9.9.9.9")));
    }

    #[tokio::test]
    async fn test_drift_reports_without_writing() {
        let h = harness(document("ubuntu")).await;
        h.reconciler
            .apply(PlanMode::Apply, no_cancel())
            .await
            .expect("apply runs");
        let vm = h.reconciler.store().get("vm.c").await.expect("recorded");
        h.provider.tamper("vm", &vm.id, "image", json!("debian"));
        h.provider.tamper("vm", &vm.id, "public_ip", json!("9.9.9.9"));
        let serial = h.reconciler.store().snapshot().await.serial;

        let report = h.reconciler.check_drift().await.expect("drift runs");

        assert!(!report.is_converged());
        match report.drifted.get("vm.c") {
            Some(Drift::Changed { changes }) => {
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].name, "image");
                assert!(changes[0].forces_replacement);
            }
            other => panic!("unexpected drift: {other:?}"),
        }
        assert!(!report.drifted.contains_key("net.n"));
        assert_eq!(h.reconciler.store().snapshot().await.serial, serial);
    }

    #[tokio::test]
    async fn test_forget_removes_record_only() {
        let h = harness(document("ubuntu")).await;
        h.reconciler
            .apply(PlanMode::Apply, no_cancel())
            .await
            .expect("apply runs");

        let record = h.reconciler.forget("vm.c").await.expect("forgets");
        assert_eq!(record.address, "vm.c");
        assert!(h.provider.object(&record.kind, &record.id).is_some());
        assert!(matches!(
            h.reconciler.forget("vm.c").await,
            Err(HalldyllError::State(StateError::NotRecorded { .. }))
        ));
    }
}
