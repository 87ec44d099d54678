//! Plan executor.
//!
//! Runs a plan batch by batch. Steps inside a batch run concurrently up to the
//! configured parallelism; a step whose prerequisite failed or was skipped is
//! skipped. Every success is written through the state store before the step
//! is marked done, so an interrupted run leaves state matching what was
//! provisioned.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{ExecutionConfig, FailurePolicy};
use crate::error::{
    HalldyllError, ProviderError, ProviderErrorKind, ProviderResult, ReconcileError, Result,
    StateError,
};
use crate::graph::{Attributes, Reference, ResourceNode};
use crate::provider::{DestroyOutcome, Provider, ProviderRegistry, ReplaceStrategy};
use crate::state::{ActualStateRecord, StateStore};

use super::plan::{ExecutionPlan, PlanStep, StepAction, StepId};

/// Executor tuning.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorOptions {
    /// Maximum concurrent provider calls.
    pub parallelism: usize,
    /// Deadline for a single provider call.
    pub operation_timeout: Duration,
    /// Behaviour after a failed step.
    pub failure_policy: FailurePolicy,
}

/// Status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Not started.
    Pending,
    /// Provider call in flight.
    Running,
    /// Finished and recorded.
    Succeeded,
    /// Provider or state error.
    Failed,
    /// Not attempted because a prerequisite did not succeed.
    Skipped,
}

/// Overall result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Every step succeeded.
    Succeeded,
    /// At least one step failed or was skipped.
    Failed,
    /// Cancellation stopped the run before every step started.
    Cancelled,
}

/// Outcome of one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    /// Final status.
    pub status: NodeStatus,
    /// Error message for failed or skipped steps.
    pub error: Option<String>,
    /// Classification of a provider failure.
    pub error_kind: Option<ProviderErrorKind>,
}

/// Result of executing a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// Overall status.
    pub status: PlanStatus,
    /// Outcome of every step.
    pub outcomes: BTreeMap<StepId, StepOutcome>,
    /// Wall-clock duration.
    pub duration: Duration,
}

/// Executes plans against providers.
#[derive(Debug, Clone)]
pub struct PlanExecutor {
    runner: StepRunner,
    options: ExecutorOptions,
}

/// Performs single steps; cloned into every spawned task.
#[derive(Debug, Clone)]
struct StepRunner {
    registry: Arc<ProviderRegistry>,
    store: Arc<StateStore>,
    timeout: Duration,
}

impl PlanExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<StateStore>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            runner: StepRunner {
                registry,
                store,
                timeout: options.operation_timeout,
            },
            options,
        }
    }

    /// Executes a plan.
    ///
    /// Setting `cancel` to `true` stops new steps from starting; steps already
    /// in flight finish and are recorded. Steps never started stay `Pending`.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        cancel: watch::Receiver<bool>,
    ) -> ExecutionReport {
        let started = Instant::now();
        let mut outcomes: BTreeMap<StepId, StepOutcome> = plan
            .steps
            .keys()
            .map(|id| (id.clone(), StepOutcome::pending()))
            .collect();

        info!(
            "Executing plan: {} steps in {} batches (parallelism {})",
            plan.step_count(),
            plan.batches.len(),
            self.options.parallelism
        );

        let semaphore = Arc::new(Semaphore::new(self.options.parallelism.max(1)));
        let mut cancelled = false;
        let mut halted = false;

        for (index, batch) in plan.batches.iter().enumerate() {
            if *cancel.borrow() {
                warn!("Cancellation requested, not starting batch {}", index + 1);
                cancelled = true;
                break;
            }

            debug!("Starting batch {} ({} steps)", index + 1, batch.len());
            let mut tasks = JoinSet::new();

            for id in batch {
                if halted {
                    outcomes.insert(id.clone(), StepOutcome::skipped("halted after earlier failure"));
                    continue;
                }

                let blocked = plan.prerequisites_of(id).find(|p| {
                    outcomes
                        .get(*p)
                        .is_some_and(|o| matches!(o.status, NodeStatus::Failed | NodeStatus::Skipped))
                });
                if let Some(prerequisite) = blocked {
                    warn!("Skipping {id}: prerequisite {prerequisite} did not succeed");
                    outcomes.insert(
                        id.clone(),
                        StepOutcome::skipped(&format!("prerequisite {prerequisite} did not succeed")),
                    );
                    continue;
                }

                let Some(step) = plan.step(id).cloned() else {
                    continue;
                };
                outcomes.insert(id.clone(), StepOutcome::running());

                let runner = self.runner.clone();
                let semaphore = Arc::clone(&semaphore);
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return (step.id, None);
                    };
                    if *cancel.borrow() {
                        return (step.id, None);
                    }
                    let result = runner.run(&step).await;
                    (step.id, Some(result))
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((id, Some(Ok(())))) => {
                        outcomes.insert(id, StepOutcome::succeeded());
                    }
                    Ok((id, Some(Err(e)))) => {
                        error!("{id} failed: {e}");
                        outcomes.insert(id, StepOutcome::failed(&e));
                    }
                    Ok((id, None)) => {
                        debug!("{id} not started");
                        cancelled = true;
                        outcomes.insert(id, StepOutcome::pending());
                    }
                    Err(e) => error!("Step task aborted: {e}"),
                }
            }

            for id in batch {
                if let Some(outcome) = outcomes.get_mut(id) {
                    if outcome.status == NodeStatus::Running {
                        *outcome = StepOutcome::failed(&HalldyllError::internal("task panicked"));
                    }
                }
            }

            let batch_failed = batch.iter().any(|id| {
                outcomes
                    .get(id)
                    .is_some_and(|o| o.status == NodeStatus::Failed)
            });
            if batch_failed && self.options.failure_policy == FailurePolicy::Halt && !halted {
                warn!("Halting after failure in batch {}", index + 1);
                halted = true;
            }
        }

        let status = if cancelled {
            PlanStatus::Cancelled
        } else if outcomes.values().all(|o| o.status == NodeStatus::Succeeded) {
            PlanStatus::Succeeded
        } else {
            PlanStatus::Failed
        };

        let report = ExecutionReport {
            status,
            outcomes,
            duration: started.elapsed(),
        };
        info!(
            "Execution {:?}: {} succeeded, {} failed, {} skipped, {} pending",
            report.status,
            report.count(NodeStatus::Succeeded),
            report.count(NodeStatus::Failed),
            report.count(NodeStatus::Skipped),
            report.count(NodeStatus::Pending)
        );
        report
    }
}

impl StepRunner {
    async fn run(&self, step: &PlanStep) -> Result<()> {
        let address = step.id.address.as_str();
        match step.action {
            StepAction::Create | StepAction::CreateReplacement => self.create(step).await,
            StepAction::Update => self.update(step).await,
            StepAction::Destroy | StepAction::DestroyForReplace => {
                let Some(record) = self.store.get(address).await else {
                    debug!("{address} already absent from state");
                    return Ok(());
                };
                let provider = self.registry.for_kind(&record.kind)?;
                let record = self.destroy_deposed(&provider, record).await?;
                self.destroy_object(&provider, &record.kind, address, &record.id)
                    .await?;
                self.store.remove(address).await?;
                info!("Destroyed {address}");
                Ok(())
            }
            StepAction::DestroyDeposed => {
                let Some(record) = self.store.get(address).await else {
                    return Ok(());
                };
                let provider = self.registry.for_kind(&record.kind)?;
                self.destroy_deposed(&provider, record).await.map(|_| ())
            }
        }
    }

    async fn create(&self, step: &PlanStep) -> Result<()> {
        let address = step.id.address.as_str();
        let node = step
            .node
            .as_ref()
            .ok_or_else(|| HalldyllError::internal(format!("apply step for {address} has no node")))?;
        let desired = self.resolve(node).await?;
        let provider = self.registry.for_kind(&step.kind)?;

        info!("Creating {address}");
        let created = self
            .call("create", address, provider.create(&step.kind, &desired))
            .await?;

        let mut record = ActualStateRecord::new(address, &step.kind, &created.id)
            .with_applied(desired)
            .with_attributes(created.attributes)
            .with_dependencies(step.dependencies.clone());

        if step.strategy == Some(ReplaceStrategy::CreateBeforeDestroy) {
            if let Some(previous) = self.store.get(address).await {
                record.deposed = previous.deposed;
                record.deposed.push(previous.id);
            }
        }

        self.store.put(record).await?;
        info!("Created {address} ({})", created.id);
        Ok(())
    }

    async fn update(&self, step: &PlanStep) -> Result<()> {
        let address = step.id.address.as_str();
        let node = step
            .node
            .as_ref()
            .ok_or_else(|| HalldyllError::internal(format!("apply step for {address} has no node")))?;
        let mut record = self.store.get(address).await.ok_or_else(|| StateError::NotRecorded {
            address: address.to_string(),
        })?;
        let desired = self.resolve(node).await?;

        let mut changed: Attributes = desired
            .iter()
            .filter(|(name, value)| record.applied.get(*name) != Some(*value))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        for name in record.applied.keys() {
            if !desired.contains_key(name) {
                changed.insert(name.clone(), Value::Null);
            }
        }

        if changed.is_empty() {
            debug!("{address} already matches after resolution");
        } else {
            info!("Updating {address} ({} attributes)", changed.len());
            let provider = self.registry.for_kind(&step.kind)?;
            record.attributes = self
                .call("update", address, provider.update(&step.kind, &record.id, &changed))
                .await?;
        }

        record.applied = desired;
        record.dependencies.clone_from(&step.dependencies);
        record.touch();
        self.store.put(record).await?;
        Ok(())
    }

    /// Destroys every deposed object of a record, keeping the ones that fail.
    async fn destroy_deposed(
        &self,
        provider: &Arc<dyn Provider>,
        mut record: ActualStateRecord,
    ) -> Result<ActualStateRecord> {
        if record.deposed.is_empty() {
            return Ok(record);
        }

        let mut failure = None;
        let mut kept = Vec::new();
        for id in std::mem::take(&mut record.deposed) {
            if failure.is_some() {
                kept.push(id);
                continue;
            }
            if let Err(e) = self
                .destroy_object(provider, &record.kind, &record.address, &id)
                .await
            {
                failure = Some(e);
                kept.push(id);
            }
        }

        record.deposed = kept;
        record.touch();
        self.store.put(record.clone()).await?;

        match failure {
            Some(e) => Err(e),
            None => Ok(record),
        }
    }

    async fn destroy_object(
        &self,
        provider: &Arc<dyn Provider>,
        kind: &str,
        address: &str,
        id: &str,
    ) -> Result<()> {
        info!("Destroying {address} ({id})");
        match self.call("destroy", address, provider.destroy(kind, id)).await {
            Ok(DestroyOutcome::Destroyed) => Ok(()),
            Ok(DestroyOutcome::NotFound)
            | Err(HalldyllError::Provider(ProviderError::NotFound { .. })) => {
                warn!("{address} ({id}) was already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Resolves a node's attributes against the records written so far.
    async fn resolve(&self, node: &ResourceNode) -> Result<Attributes> {
        let records = self.store.records().await;
        let mut lookup = |reference: &Reference| -> Result<Option<Value>> {
            let unresolved = |reason: &str| ReconcileError::UnresolvedReference {
                address: node.address.clone(),
                reference: reference.to_string(),
                reason: reason.to_string(),
            };
            let record = records
                .get(&reference.address)
                .ok_or_else(|| unresolved("resource is not recorded"))?;
            let value = record
                .value(&reference.attribute)
                .ok_or_else(|| unresolved("attribute was not reported"))?;
            Ok(Some(value))
        };

        let mut resolved = Attributes::new();
        for (name, value) in &node.attributes {
            if let Some(value) = value.resolve(&mut lookup)? {
                resolved.insert(name.clone(), value);
            }
        }
        Ok(resolved)
    }

    /// Runs one provider call under the operation deadline.
    async fn call<T, F>(&self, operation: &str, address: &str, call: F) -> Result<T>
    where
        F: Future<Output = ProviderResult<T>> + Send,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(HalldyllError::from),
            Err(_) => Err(ProviderError::Timeout {
                operation: format!("{operation} {address}"),
                after: self.timeout,
            }
            .into()),
        }
    }
}

impl From<&ExecutionConfig> for ExecutorOptions {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            parallelism: config.parallelism,
            operation_timeout: config.operation_timeout(),
            failure_policy: config.failure_policy,
        }
    }
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::from(&ExecutionConfig::default())
    }
}

impl StepOutcome {
    const fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            error: None,
            error_kind: None,
        }
    }

    const fn running() -> Self {
        Self {
            status: NodeStatus::Running,
            error: None,
            error_kind: None,
        }
    }

    const fn succeeded() -> Self {
        Self {
            status: NodeStatus::Succeeded,
            error: None,
            error_kind: None,
        }
    }

    fn failed(error: &HalldyllError) -> Self {
        let error_kind = match error {
            HalldyllError::Provider(e) => Some(e.kind()),
            _ => None,
        };
        Self {
            status: NodeStatus::Failed,
            error: Some(error.to_string()),
            error_kind,
        }
    }

    fn skipped(reason: &str) -> Self {
        Self {
            status: NodeStatus::Skipped,
            error: Some(reason.to_string()),
            error_kind: None,
        }
    }
}

impl ExecutionReport {
    /// Number of steps with `status`.
    #[must_use]
    pub fn count(&self, status: NodeStatus) -> usize {
        self.outcomes.values().filter(|o| o.status == status).count()
    }

    /// Returns true if every step succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == PlanStatus::Succeeded
    }

    /// Returns the outcome of a step.
    #[must_use]
    pub fn outcome(&self, id: &StepId) -> Option<&StepOutcome> {
        self.outcomes.get(id)
    }

    /// Addresses whose steps succeeded.
    #[must_use]
    pub fn affected_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .outcomes
            .iter()
            .filter(|(_, o)| o.status == NodeStatus::Succeeded)
            .map(|(id, _)| id.address.clone())
            .collect();
        addresses.dedup();
        addresses
    }

    /// Failed steps with their messages.
    #[must_use]
    pub fn failures(&self) -> Vec<(&StepId, &str)> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.status == NodeStatus::Failed)
            .map(|(id, o)| (id, o.error.as_deref().unwrap_or("unknown error")))
            .collect()
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}
