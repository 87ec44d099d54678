//! Configuration validation for desired-state documents.
//!
//! This module checks the structural settings of a document (project, state
//! backend, providers, execution tuning, naming) before the graph builder
//! looks at resource semantics.

use crate::error::{ConfigError, HalldyllError, Result};
use crate::graph::AttributeValue;
use std::collections::HashSet;
use tracing::debug;

use super::spec::{
    ExecutionConfig, InfraConfig, ProjectConfig, ProviderConfig, ResourceDeclaration,
    StateBackendKind, StateConfig,
};

/// Validator for desired-state documents.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

/// Upper bound above which a parallelism setting earns a warning.
const HIGH_PARALLELISM: usize = 64;

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a desired-state document.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails.
    pub fn validate(&self, config: &InfraConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(HalldyllError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Runs every check and collects all errors and warnings.
    #[must_use]
    pub fn check(&self, config: &InfraConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_providers(&config.providers, &mut result);
        Self::validate_execution(&config.execution, &mut result);
        Self::validate_resources(&config.resources, &config.providers, &mut result);
        Self::validate_outputs(config, &mut result);

        result
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_project_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackendKind::S3 => {
                if state.bucket.as_deref().is_none_or(str::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackendKind::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }

        if state.lock_ttl_secs == Some(0) {
            result.error("state.lock_ttl_secs", "Lock TTL must be at least one second");
        }
    }

    /// Validates provider plugin settings.
    fn validate_providers(providers: &[ProviderConfig], result: &mut ValidationResult) {
        let mut seen = HashSet::new();

        for (i, provider) in providers.iter().enumerate() {
            let prefix = format!("providers[{i}]");

            if !seen.insert(provider.name.as_str()) {
                result.error(
                    format!("{prefix}.name"),
                    format!("Duplicate provider name: {}", provider.name),
                );
            }

            if !(provider.endpoint.starts_with("http://")
                || provider.endpoint.starts_with("https://"))
            {
                result.error(
                    format!("{prefix}.endpoint"),
                    format!(
                        "Provider endpoint must be an http(s) URL: {}",
                        provider.endpoint
                    ),
                );
            } else if provider.endpoint.starts_with("http://")
                && !provider.endpoint.contains("127.0.0.1")
                && !provider.endpoint.contains("localhost")
            {
                result.warnings.push(format!(
                    "{prefix}.endpoint: plain http to a remote host sends the token unencrypted"
                ));
            }

            if provider.timeout_secs == 0 {
                result.error(
                    format!("{prefix}.timeout_secs"),
                    "Provider timeout must be at least 1 second",
                );
            }
        }
    }

    /// Validates executor tuning.
    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if execution.parallelism == 0 {
            result.error("execution.parallelism", "Parallelism must be at least 1");
        } else if execution.parallelism > HIGH_PARALLELISM {
            result.warnings.push(format!(
                "execution.parallelism: {} concurrent provider calls may trip rate limits",
                execution.parallelism
            ));
        }

        if execution.operation_timeout_secs == 0 {
            result.error(
                "execution.operation_timeout_secs",
                "Operation timeout must be at least 1 second",
            );
        }
    }

    /// Validates resource naming. Kind support, duplicates and references are
    /// checked by the graph builder.
    fn validate_resources(
        resources: &[ResourceDeclaration],
        providers: &[ProviderConfig],
        result: &mut ValidationResult,
    ) {
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in configuration"));
            return;
        }

        if providers.is_empty() {
            result.error(
                "providers",
                "Resources are declared but no provider is configured",
            );
        }

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !is_valid_identifier(&resource.kind) {
                result.error(
                    format!("{prefix}.type"),
                    format!(
                        "Resource type '{}' is invalid. Use letters, digits, '_' or '-'.",
                        resource.kind
                    ),
                );
            }

            if !is_valid_identifier(&resource.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Resource name '{}' is invalid. Use letters, digits, '_' or '-'.",
                        resource.name
                    ),
                );
            }

            if resource.attributes.contains_key("id") {
                result.error(
                    format!("{prefix}.attributes.id"),
                    "'id' is assigned by the provider and cannot be declared",
                );
            }
        }
    }

    /// Validates that every output is a single reference expression.
    fn validate_outputs(config: &InfraConfig, result: &mut ValidationResult) {
        for (name, expression) in &config.outputs {
            let field = format!("outputs.{name}");
            match AttributeValue::parse_string(expression, &field) {
                Ok(AttributeValue::Reference(_) | AttributeValue::Interpolated(_)) => {}
                Ok(_) => result.warnings.push(format!(
                    "{field}: output has no reference and will always be the literal text"
                )),
                Err(e) => result.error(field, e.to_string()),
            }
        }
    }
}

/// Validates that a project name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_project_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    for c in chars {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' {
            return false;
        }
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Validates a resource kind or name segment.
pub(crate) fn is_valid_identifier(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl ValidationResult {
    /// Records an error for a field.
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> InfraConfig {
        ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("test yaml parses")
    }

    #[test]
    fn test_valid_project_name() {
        assert!(is_valid_project_name("web-stack"));
        assert!(is_valid_project_name("a1"));
        assert!(!is_valid_project_name(""));
        assert!(!is_valid_project_name("Web"));
        assert!(!is_valid_project_name("1web"));
        assert!(!is_valid_project_name("web-"));
        assert!(!is_valid_project_name("web--stack"));
    }

    #[test]
    fn test_identifier_allows_underscores() {
        assert!(is_valid_identifier("aws_vpc"));
        assert!(is_valid_identifier("main-1"));
        assert!(!is_valid_identifier("a.b"));
        assert!(!is_valid_identifier(""));
    }

    #[test]
    fn test_resources_without_provider_rejected() {
        let config = parse(
            r"
project:
  name: demo
resources:
  - type: net
    name: a
",
        );
        let err = ConfigValidator::new().validate(&config).expect_err("must fail");
        assert!(err.to_string().contains("no provider"));
    }

    #[test]
    fn test_s3_backend_requires_bucket() {
        let config = parse(
            r"
project:
  name: demo
state:
  backend: s3
",
        );
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_zero_lock_ttl_rejected() {
        let config = parse(
            r"
project:
  name: demo
state:
  lock_ttl_secs: 0
",
        );
        let err = ConfigValidator::new().validate(&config).expect_err("must fail");
        assert!(err.to_string().contains("Lock TTL"));
    }

    #[test]
    fn test_declared_id_rejected() {
        let config = parse(
            r"
project:
  name: demo
providers:
  - name: local
    endpoint: http://127.0.0.1:9400
resources:
  - type: net
    name: a
    attributes:
      id: fixed
",
        );
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let config = parse(
            r"
project:
  name: demo
execution:
  parallelism: 0
",
        );
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_literal_output_warns() {
        let config = parse(
            r"
project:
  name: demo
outputs:
  greeting: hello
",
        );
        let result = ConfigValidator::new().validate(&config).expect("valid");
        assert!(result.warnings.iter().any(|w| w.contains("outputs.greeting")));
    }

    #[test]
    fn test_check_collects_every_error() {
        let config = parse(
            r"
project:
  name: Bad-Name
state:
  backend: s3
execution:
  parallelism: 0
",
        );
        let result = ConfigValidator::new().check(&config);
        assert!(!result.is_valid());
        assert!(result.errors.len() >= 3);
    }
}
