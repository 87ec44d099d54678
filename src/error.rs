//! Error types for the Halldyll provisioning engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, graph building, state management, provider calls,
//! planning, and reconciliation.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for the Halldyll provisioning engine.
#[derive(Debug, Error)]
pub enum HalldyllError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph build errors.
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Two providers claim the same resource kind.
    #[error("Resource kind '{kind}' is served by both '{first}' and '{second}'")]
    ConflictingProviders {
        /// The contested resource kind.
        kind: String,
        /// Provider registered first.
        first: String,
        /// Provider registered second.
        second: String,
    },
}

/// Errors raised while building the resource graph.
///
/// All of them are fatal and abort before any provider call.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The resource kind is not declared by any registered provider.
    #[error("Unsupported resource kind '{kind}' for {address}")]
    UnsupportedResourceKind {
        /// Address of the offending declaration.
        address: String,
        /// The unknown kind.
        kind: String,
    },

    /// Two declarations share an address.
    #[error("Duplicate resource address: {address}")]
    DuplicateResourceAddress {
        /// The duplicated address.
        address: String,
    },

    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    DependencyCycle {
        /// Addresses around the cycle, first address repeated at the end.
        path: Vec<String>,
    },

    /// A reference or `depends_on` entry names an unknown resource.
    #[error("{address} references unknown resource '{target}'")]
    UnknownReference {
        /// Address of the referencing resource.
        address: String,
        /// The missing target.
        target: String,
    },

    /// A `${...}` expression could not be parsed.
    #[error("Invalid reference '{expression}' in {location}")]
    InvalidReference {
        /// Where the expression was found.
        location: String,
        /// The raw expression.
        expression: String,
    },

    /// A resource kind or name is malformed.
    #[error("Invalid resource address '{address}': {reason}")]
    InvalidAddress {
        /// The rejected address.
        address: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted. Never recovered from silently.
    #[error("State store is corrupt: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Local filesystem backend error.
    #[error("Local state backend error: {message}")]
    LocalError {
        /// Description of the filesystem error.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },

    /// No record exists at the address.
    #[error("No resource recorded at {address}")]
    NotRecorded {
        /// The missing address.
        address: String,
    },

    /// The lock was taken over or removed while held.
    #[error("State lock {lock_id} is no longer held")]
    LockLost {
        /// Identifier of the lost lock.
        lock_id: String,
    },

    /// The persisted state moved on since this process loaded it.
    #[error("State changed since it was loaded: {message}")]
    Stale {
        /// What differs from the loaded snapshot.
        message: String,
    },
}

/// Coarse classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// The call exceeded its deadline.
    Timeout,
    /// The provider refused the request.
    Rejected,
    /// The object does not exist.
    NotFound,
    /// The request conflicts with existing provider-side state.
    Conflict,
    /// Transport failure or malformed answer.
    Transport,
}

/// Errors returned by provider plugins.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The call did not finish in time.
    #[error("Provider call {operation} timed out after {}s", after.as_secs())]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Configured deadline.
        after: Duration,
    },

    /// The provider rejected the request.
    #[error("Provider rejected request ({status}): {message}")]
    Rejected {
        /// HTTP-style status code, 0 when not applicable.
        status: u16,
        /// Message from the provider.
        message: String,
    },

    /// The object was not found.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Provider identifier.
        id: String,
    },

    /// The request conflicts with provider-side state.
    #[error("Conflict: {message}")]
    Conflict {
        /// Message from the provider.
        message: String,
    },

    /// Rate limited.
    #[error("Provider rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Authentication failed.
    #[error("Provider authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// Network error.
    #[error("Network error communicating with provider: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from the provider.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// No provider serves the resource kind.
    #[error("No provider registered for kind '{kind}'")]
    UnknownKind {
        /// The unserved kind.
        kind: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Replacements form a cycle that identifier substitution cannot break.
    #[error("Unresolvable replacement order between: {}", steps.join(", "))]
    UnresolvableReplacementOrder {
        /// Steps caught in the cycle.
        steps: Vec<String>,
    },

    /// Dependency resolution failed.
    #[error("Failed to resolve dependencies: {message}")]
    DependencyResolutionFailed {
        /// Description of the dependency issue.
        message: String,
    },
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// An attribute reference could not be resolved at execution time.
    #[error("Cannot resolve {reference} for {address}: {reason}")]
    UnresolvedReference {
        /// Address being applied.
        address: String,
        /// The reference expression.
        reference: String,
        /// Why resolution failed.
        reason: String,
    },

    /// An output expression could not be resolved.
    #[error("Cannot resolve output '{name}': {reason}")]
    OutputUnresolved {
        /// Output name.
        name: String,
        /// Why resolution failed.
        reason: String,
    },

    /// Reconciliation was aborted.
    #[error("Reconciliation aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for Halldyll operations.
pub type Result<T> = std::result::Result<T, HalldyllError>;

/// Result type returned by provider plugins.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

impl HalldyllError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(err) => err.is_retryable(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(ProviderError::RateLimited { retry_after_secs }) => {
                Some(*retry_after_secs)
            }
            Self::Provider(ProviderError::NetworkError { .. }) => Some(5),
            Self::State(StateError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a local backend error with the given message.
    #[must_use]
    pub fn local(message: impl Into<String>) -> Self {
        Self::LocalError {
            message: message.into(),
        }
    }

    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    /// Returns true if the call may succeed when retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::NetworkError { .. })
    }

    /// Returns the coarse classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ProviderErrorKind {
        match self {
            Self::Timeout { .. } => ProviderErrorKind::Timeout,
            Self::Rejected { .. }
            | Self::AuthenticationFailed { .. }
            | Self::UnknownKind { .. } => ProviderErrorKind::Rejected,
            Self::NotFound { .. } => ProviderErrorKind::NotFound,
            Self::Conflict { .. } => ProviderErrorKind::Conflict,
            Self::RateLimited { .. }
            | Self::NetworkError { .. }
            | Self::InvalidResponse { .. } => ProviderErrorKind::Transport,
        }
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Rejected => "rejected",
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::Transport => "transport",
        };
        write!(f, "{s}")
    }
}
