//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Halldyll - Declarative infrastructure provisioning.
#[derive(Parser, Debug)]
#[command(name = "halldyll")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the desired-state document.
    #[arg(short, long, global = true, env = "HALLDYLL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new project.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the desired-state document.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Compute and display the execution plan.
    Plan {
        /// Show attribute-level changes.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Converge actual state toward the document.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Override the configured parallelism.
        #[arg(long, env = "HALLDYLL_PARALLELISM")]
        parallelism: Option<usize>,

        /// Stop scheduling new batches after the first failure.
        #[arg(long)]
        halt_on_error: bool,
    },

    /// Destroy every recorded resource.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Re-read recorded resources from their providers and update state.
    Refresh,

    /// Check for drift between recorded state and providers.
    Drift,

    /// Show output values from the last successful apply.
    Output {
        /// Output name (shows all outputs if not specified).
        name: Option<String>,
    },

    /// Manage state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the state summary.
    Show,

    /// List recorded resources.
    List,

    /// Remove a record without destroying the resource.
    Rm {
        /// Resource address (`kind.name`).
        address: String,
    },

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock (dangerous).
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state_rm() {
        let cli = Cli::try_parse_from(["halldyll", "state", "rm", "vm.web"]).expect("parses");
        match cli.command {
            Commands::State {
                command: StateCommands::Rm { address },
            } => assert_eq!(address, "vm.web"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["halldyll", "plan", "--output", "json", "-v"]).expect("parses");
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(cli.verbose);
    }

    #[test]
    fn test_apply_flags() {
        let cli = Cli::try_parse_from(["halldyll", "apply", "-y", "--parallelism", "2", "--halt-on-error"])
            .expect("parses");
        match cli.command {
            Commands::Apply {
                yes,
                parallelism,
                halt_on_error,
            } => {
                assert!(yes);
                assert_eq!(parallelism, Some(2));
                assert!(halt_on_error);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
