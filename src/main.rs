//! Halldyll CLI entrypoint.
//!
//! This is the main entrypoint for the halldyll command-line tool.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use halldyll_provision::cli::{Cli, Commands, OutputFormatter, StateCommands};
use halldyll_provision::config::{
    ConfigParser, ConfigValidator, FailurePolicy, InfraConfig, find_config_file,
};
use halldyll_provision::error::{ConfigError, HalldyllError, ReconcileError, Result};
use halldyll_provision::provider::ProviderRegistry;
use halldyll_provision::reconciler::{ApplyResult, PlanMode, Reconciler};
use halldyll_provision::state::{STATE_DIR, StateStore, generate_holder_id, open_backend};

use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. `RUST_LOG` takes precedence over `--verbose`.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Plan { detailed } => cmd_plan(config, detailed, &formatter).await,
        Commands::Apply {
            yes,
            parallelism,
            halt_on_error,
        } => cmd_apply(config, yes, parallelism, halt_on_error, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(config, yes, &formatter).await,
        Commands::Refresh => cmd_refresh(config, &formatter).await,
        Commands::Drift => cmd_drift(config, &formatter).await,
        Commands::Output { name } => cmd_output(config, name.as_deref(), &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new Halldyll project in: {}", path.display());

    let config_path = path.join("halldyll.infra.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    let config_template = include_str!("../templates/halldyll.infra.yaml");
    std::fs::write(&config_path, config_template)?;
    eprintln!("Created: {}", config_path.display());

    let env_template = include_str!("../templates/.env.example");
    std::fs::write(&env_path, env_template)?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let has_env = existing.lines().any(|l| l.trim() == ".env");
        let has_state = existing.contains(STATE_DIR);
        if !has_env || !has_state {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Halldyll")?;
            if !has_env {
                writeln!(file, ".env")?;
            }
            if !has_state {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and set your provider tokens");
    eprintln!("  2. Edit halldyll.infra.yaml to declare your resources");
    eprintln!("  3. Run 'halldyll validate' to check the document");
    eprintln!("  4. Run 'halldyll plan' to see what will change");
    eprintln!("  5. Run 'halldyll apply' to converge");

    Ok(())
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let result = ConfigValidator::new().check(&config);
    println!("{}", formatter.format_validation(&result, show_warnings));

    if let Some(first) = result.errors.first() {
        return Err(ConfigError::validation(first.message.clone(), first.field.clone()).into());
    }

    if !formatter.is_json() {
        eprintln!("\nConfiguration summary:");
        eprintln!("  Project: {}", config.project.name);
        eprintln!("  Environment: {}", config.project.environment);
        eprintln!("  Providers: {}", config.providers.len());
        eprintln!("  Resources: {}", config.resources.len());
        eprintln!("  Outputs: {}", config.outputs.len());
        eprintln!("  Warnings: {}", result.warning_count());
    }

    Ok(())
}

/// Show the execution plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let reconciler = load_reconciler(config_path, true).await?;
    let plan = reconciler.plan(PlanMode::Apply).await?;
    println!("{}", formatter.format_plan(&plan, detailed));
    Ok(())
}

/// Apply the desired-state document.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    parallelism: Option<usize>,
    halt_on_error: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (mut config, config_file) = load_config(config_path)?;
    if let Some(parallelism) = parallelism {
        debug!("Parallelism overridden to {parallelism}");
        config.execution.parallelism = parallelism.max(1);
    }
    if halt_on_error {
        config.execution.failure_policy = FailurePolicy::Halt;
    }
    let reconciler = connect(config, &config_file, true).await?;

    let plan = reconciler.plan(PlanMode::Apply).await?;
    if plan.is_empty() {
        eprintln!("{}", formatter.success("No changes to apply."));
        return Ok(());
    }

    if !formatter.is_json() {
        eprintln!("{}", formatter.format_plan(&plan, false));
    }

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(());
    }

    let result = reconciler.apply(PlanMode::Apply, cancel_on_ctrl_c()).await?;
    finish(&result, formatter)
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let reconciler = load_reconciler(config_path, true).await?;

    let plan = reconciler.plan(PlanMode::Destroy).await?;
    if plan.is_empty() {
        eprintln!("{}", formatter.success("No resources to destroy."));
        return Ok(());
    }

    eprintln!("The following resources will be destroyed:");
    for address in plan.addresses() {
        let id = reconciler
            .store()
            .get(&address)
            .await
            .map(|r| r.id)
            .unwrap_or_default();
        eprintln!("  - {address} ({id})");
    }

    if !auto_approve
        && !confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            "destroy",
        )?
    {
        eprintln!("Destruction cancelled.");
        return Ok(());
    }

    let result = reconciler.apply(PlanMode::Destroy, cancel_on_ctrl_c()).await?;
    finish(&result, formatter)
}

/// Re-read recorded resources and update state.
async fn cmd_refresh(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let reconciler = load_reconciler(config_path, true).await?;
    let report = reconciler.refresh().await?;
    println!("{}", formatter.format_refresh(&report));

    if report.errors.is_empty() {
        Ok(())
    } else {
        Err(ReconcileError::Aborted {
            reason: format!("{} resources could not be read", report.errors.len()),
        }
        .into())
    }
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let reconciler = load_reconciler(config_path, true).await?;
    let report = reconciler.check_drift().await?;
    println!("{}", formatter.format_drift(&report));
    Ok(())
}

/// Show output values.
async fn cmd_output(
    config_path: Option<&PathBuf>,
    name: Option<&str>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let reconciler = load_reconciler(config_path, false).await?;
    let outputs = reconciler.store().snapshot().await.outputs;

    match name {
        Some(name) => {
            let value = outputs.get(name).ok_or_else(|| ReconcileError::OutputUnresolved {
                name: name.to_string(),
                reason: String::from("not recorded, run 'halldyll apply' first"),
            })?;
            if formatter.is_json() {
                let single = BTreeMap::from([(name.to_string(), value.clone())]);
                println!("{}", formatter.format_outputs(&single));
            } else {
                println!("{}", OutputFormatter::display_value(value));
            }
        }
        None if outputs.is_empty() && !formatter.is_json() => {
            eprintln!("No outputs recorded.");
        }
        None => println!("{}", formatter.format_outputs(&outputs)),
    }

    Ok(())
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let reconciler = load_reconciler(config_path, false).await?;
    let store = reconciler.store();

    match command {
        StateCommands::Show => {
            println!("{}", formatter.format_state(&store.snapshot().await));
        }
        StateCommands::List => {
            println!("{}", formatter.format_records(&store.records().await));
        }
        StateCommands::Rm { address } => {
            let record = reconciler.forget(&address).await?;
            eprintln!(
                "{}",
                formatter.success(&format!(
                    "Removed {address} ({}) from state; the object itself was not destroyed.",
                    record.id
                ))
            );
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.backend().acquire_lock(&holder, "manual").await?;
            println!("{}", formatter.format_lock(&lock));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.backend().force_unlock().await?;
                eprintln!("{}", formatter.warning("State forcefully unlocked."));
            } else if let Some(id) = lock_id {
                store.backend().release_lock(&id).await?;
                eprintln!("{}", formatter.success("State unlocked."));
            } else {
                match store.backend().get_lock_info().await? {
                    Some(lock) => eprintln!("{}", formatter.format_lock(&lock)),
                    None => eprintln!("State is not locked."),
                }
                eprintln!("Please provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads the desired-state document with `.env` and environment overrides.
fn load_config(config_path: Option<&PathBuf>) -> Result<(InfraConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(base_dir(&config_file));
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    Ok((config, config_file))
}

/// Loads and validates the document, then wires up state and providers.
async fn load_reconciler(config_path: Option<&PathBuf>, with_providers: bool) -> Result<Reconciler> {
    let (config, config_file) = load_config(config_path)?;
    connect(config, &config_file, with_providers).await
}

/// Opens state and, when asked, connects to every configured provider.
async fn connect(config: InfraConfig, config_file: &Path, with_providers: bool) -> Result<Reconciler> {
    ConfigValidator::new().validate(&config)?;

    let backend = open_backend(&config.state, base_dir(config_file)).await?;
    let store = StateStore::open(backend, &config.project.name, &config.project.environment).await?;

    let registry = if with_providers {
        ProviderRegistry::from_config(&config.providers).await?
    } else {
        ProviderRegistry::new()
    };

    Ok(Reconciler::new(config, Arc::new(registry), Arc::new(store)))
}

/// Directory holding the document.
fn base_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Prompts on stderr and compares the answer.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Flips the returned receiver on the first Ctrl-C.
fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, letting in-flight steps finish");
            let _ = tx.send(true);
        }
    });
    rx
}

/// Prints a run result and turns a failed or cancelled run into an error.
fn finish(result: &ApplyResult, formatter: &OutputFormatter) -> Result<()> {
    println!("{}", formatter.format_apply(result));

    if result.is_success() {
        Ok(())
    } else {
        Err(HalldyllError::Reconcile(ReconcileError::Aborted {
            reason: format!("run {}", result.report.status),
        }))
    }
}
