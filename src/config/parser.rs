//! Configuration parser for loading desired-state documents.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, HalldyllError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::InfraConfig;

/// Configuration parser for loading the desired-state document.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML (or JSON) file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<InfraConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(HalldyllError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            HalldyllError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<InfraConfig> {
        debug!("Parsing YAML configuration");

        let config: InfraConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            HalldyllError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed {} resource declarations for project: {}",
            config.resources.len(),
            config.project.name
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `HALLDYLL_<SECTION>_<KEY>` (e.g., `HALLDYLL_PROJECT_NAME`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if an
    /// override holds an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<InfraConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config)?;
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(config: &mut InfraConfig) -> Result<()> {
        if let Ok(name) = std::env::var("HALLDYLL_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Ok(env) = std::env::var("HALLDYLL_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Ok(bucket) = std::env::var("HALLDYLL_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("HALLDYLL_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Ok(parallelism) = std::env::var("HALLDYLL_PARALLELISM") {
            debug!("Overriding execution.parallelism from environment");
            config.execution.parallelism = parallelism.parse().map_err(|_| {
                HalldyllError::Config(ConfigError::validation(
                    format!("HALLDYLL_PARALLELISM must be a positive integer, got '{parallelism}'"),
                    "execution.parallelism",
                ))
            })?;
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                HalldyllError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Reads a provider token from the named environment variable.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is not set.
    pub fn get_token(var: &str) -> Result<String> {
        std::env::var(var).map_err(|_| {
            HalldyllError::Config(ConfigError::MissingEnvVar {
                name: var.to_string(),
            })
        })
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "halldyll.infra.yaml",
    "halldyll.infra.yml",
    "halldyll.infra.json",
    "infra.yaml",
];

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(HalldyllError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FailurePolicy, StateBackendKind};

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
";
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).expect("minimal config parses");

        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackendKind::Local);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
project:
  name: web-stack
  environment: prod

state:
  backend: s3
  bucket: halldyll-state
  prefix: web-stack/prod

providers:
  - name: aws
    endpoint: http://127.0.0.1:9400
    token_env: AWS_PROVIDER_TOKEN

execution:
  parallelism: 4
  failure_policy: halt

resources:
  - type: aws_vpc
    name: main
    attributes:
      cidr_block: 10.0.0.0/16
  - type: aws_subnet
    name: public
    attributes:
      vpc_id: ${aws_vpc.main.id}
      cidr_block: 10.0.1.0/24
      map_public_ip_on_launch: true
  - type: aws_instance
    name: web
    depends_on: [aws_subnet.public]
    attributes:
      ami: ami-0c55b159cbfafe1f0
      instance_type: t2.micro
      subnet_id: ${aws_subnet.public.id}

outputs:
  public_ip: ${aws_instance.web.public_ip}
"#;
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).expect("full config parses");

        assert_eq!(config.project.name, "web-stack");
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.execution.parallelism, 4);
        assert_eq!(config.execution.failure_policy, FailurePolicy::Halt);
        assert_eq!(config.resources.len(), 3);
        assert_eq!(config.resources[2].depends_on, vec!["aws_subnet.public"]);
        assert_eq!(
            config.resources[1].attributes.get("map_public_ip_on_launch"),
            Some(&serde_json::Value::Bool(true))
        );
        assert_eq!(config.outputs.len(), 1);
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let parser = ConfigParser::new();
        let result = parser.parse_yaml("project: [unterminated", None);
        assert!(matches!(
            result,
            Err(HalldyllError::Config(ConfigError::ParseError { .. }))
        ));
    }

    #[test]
    fn test_init_template_is_valid() {
        let template = include_str!("../../templates/halldyll.infra.yaml");
        let config = ConfigParser::new()
            .parse_yaml(template, None)
            .expect("template parses");

        let result = crate::config::ConfigValidator::new()
            .validate(&config)
            .expect("template validates");
        assert!(result.is_valid());
        assert_eq!(config.resources.len(), 4);
    }

    #[test]
    fn test_find_config_file_in_parent() {
        let temp = tempfile::TempDir::new().expect("temp dir");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("nested dirs");
        std::fs::write(temp.path().join("halldyll.infra.yaml"), "project:\n  name: x\n")
            .expect("write config");

        let found = find_config_file(&nested).expect("config found");
        assert_eq!(found, temp.path().join("halldyll.infra.yaml"));
    }
}
