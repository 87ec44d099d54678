//! Configuration module for the Halldyll provisioning engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `halldyll.infra.yaml`
//! - Validation of configuration values
//! - Computing configuration hashes for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    ExecutionConfig, FailurePolicy, InfraConfig, ProjectConfig, ProviderConfig,
    ResourceDeclaration, StateBackendKind, StateConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub(crate) use validator::is_valid_identifier;
pub use hash::ConfigHasher;
