//! Desired-state document types for the provisioning engine.
//!
//! This module defines all the structs that map to the `halldyll.infra.yaml` file.
//! These types are declarative and fully describe the desired state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// The root configuration structure: the desired-state document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InfraConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider plugins serving the declared resource kinds.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Executor tuning.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Resource declarations.
    #[serde(default)]
    pub resources: Vec<ResourceDeclaration>,
    /// Named outputs, each a `${address.attribute}` expression.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackendKind,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
    /// Seconds a state lock lives without renewal.
    #[serde(default)]
    pub lock_ttl_secs: Option<u64>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackendKind {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Connection settings for one provider plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Provider name, used in logs and conflict reports.
    pub name: String,
    /// Base URL of the provider plugin endpoint.
    pub endpoint: String,
    /// Environment variable holding the bearer token.
    #[serde(default)]
    pub token_env: Option<String>,
    /// HTTP request timeout in seconds.
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

/// Executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum concurrent provider calls within a batch.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Deadline for a single provider call in seconds.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
    /// What to do after a step fails.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

/// Behaviour of the executor after a failed step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Keep running steps that do not depend on the failure.
    #[default]
    Continue,
    /// Stop scheduling new batches once a batch contains a failure.
    Halt,
}

/// A single resource declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceDeclaration {
    /// Resource kind, e.g. `aws_vpc`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Name unique within the kind.
    pub name: String,
    /// Attribute values; strings may embed `${kind.name.attribute}` references.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Explicit dependency addresses.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            operation_timeout_secs: default_operation_timeout(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

// Default value functions

const fn default_parallelism() -> usize {
    10
}

const fn default_operation_timeout() -> u64 {
    600
}

const fn default_provider_timeout() -> u64 {
    30
}

fn default_environment() -> String {
    String::from("dev")
}

impl ResourceDeclaration {
    /// Returns the `kind.name` address of this declaration.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}.{}", self.kind, self.name)
    }
}

impl ExecutionConfig {
    /// Returns the per-call provider deadline.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Halt => write!(f, "halt"),
        }
    }
}
