//! imageprep - Main entry point
//!
//! Two-phase start: relocate off unstable storage first, then build the
//! configuration, state store and services and run the pipeline.

mod cli;

use anyhow::{bail, Context};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::cli::{Cli, Commands};
use imageprep::cancel::CancelToken;
use imageprep::config::RunConfig;
use imageprep::execution_state::StateStore;
use imageprep::inventory::{InventoryProvider, ProbeTargets, SystemInventory};
use imageprep::orchestrator::{Orchestrator, RecoveryPlan, RunContext, Services};
use imageprep::process_guard::{init_signal_handlers, is_process_alive};
use imageprep::resilience::CleanupGuard;
use imageprep::resilience;
use imageprep::types::TaskSelection;

/// Initialize the logger: RUST_LOG overrides, stderr so stdout stays for results
fn init_logger(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Main application entry point
fn main() {
    let cli = Cli::parse_args();
    init_logger(cli.verbose);
    debug!("CLI arguments parsed");

    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let cache_root = cli.cache_root;
    match cli.command {
        Commands::Run {
            config,
            tasks,
            dry_run,
            no_relaunch,
        } => run(config.as_deref(), cache_root, tasks.as_deref(), dry_run, no_relaunch),
        Commands::Status { config } => status(&load_config(config.as_deref(), cache_root)?),
        Commands::Abandon { config } => abandon(&load_config(config.as_deref(), cache_root)?),
        Commands::Validate { config } => validate(&config),
        Commands::Inventory { config } => inventory(&load_config(config.as_deref(), cache_root)?),
    }
}

fn load_config(path: Option<&Path>, cache_root: Option<PathBuf>) -> anyhow::Result<RunConfig> {
    let mut config = RunConfig::load_or_default(path).context("Failed to load configuration")?;
    if let Some(root) = cache_root {
        config.cache_root = root;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn run(
    config_path: Option<&Path>,
    cache_root: Option<PathBuf>,
    tasks: Option<&str>,
    dry_run: bool,
    no_relaunch: bool,
) -> anyhow::Result<i32> {
    let config = load_config(config_path, cache_root)?;

    let store = StateStore::new(&config.cache_root);

    // Phase 1: get off unstable storage before anything else touches the disk.
    // A copy that a live run is using is never replaced.
    let mut relocation = config.resilience.clone();
    relocation.enabled &= !no_relaunch && !dry_run;
    let launch = resilience::bootstrap(&relocation, &config.cache_root, &store);
    let _cleanup = CleanupGuard::new(launch, config.cache_root.clone(), store.clone());

    // Phase 2
    if let Some(owner) = store.foreign_owner() {
        bail!("another imageprep run (PID {}) is in progress", owner);
    }

    let cancel = CancelToken::new();
    if let Err(e) = init_signal_handlers(&cancel) {
        warn!("Failed to initialize signal handlers: {}", e);
    }

    let selection = match tasks {
        Some(list) => TaskSelection::parse_list(list).map_err(anyhow::Error::msg)?,
        None => config.default_selection(),
    };
    if selection.is_empty() {
        bail!("no tasks selected");
    }

    let recovery = RecoveryPlan::detect(&store, config.freshness_window(), Utc::now());
    if dry_run {
        info!("Dry run: external commands are logged, not executed");
    }

    let services = Services::system(&config, dry_run);
    let mut orchestrator = Orchestrator::new(RunContext::new(config, services), recovery);
    let summary = orchestrator.run_all(&selection, &cancel, &mut |event| println!("{}", event));

    println!();
    print!("{}", summary);
    Ok(summary.exit_code())
}

fn status(config: &RunConfig) -> anyhow::Result<i32> {
    let app_dir = config.cache_root.join(resilience::APP_DIR_NAME);
    if let Some(origin) = resilience::read_origin_marker(&app_dir) {
        println!(
            "Local copy:       {:?} (from {:?}, {})",
            app_dir, origin.original_path, origin.copied_at
        );
    }

    let store = StateStore::new(&config.cache_root);
    let Some(state) = store.load() else {
        println!("No persisted run state at {:?}", store.path());
        return Ok(0);
    };

    let completed: Vec<String> = state
        .selection()
        .iter()
        .filter(|t| state.is_task_completed(*t))
        .map(|t| t.to_string())
        .collect();
    let recoverable = state.is_recoverable(Utc::now(), config.freshness_window());

    println!("State document:   {:?}", store.path());
    println!("Started:          {}", state.start_time);
    println!("Last update:      {}", state.last_update_time);
    println!("Running:          {}", state.is_running);
    println!("Complete:         {}", state.is_complete);
    println!("Selected tasks:   {}", state.selection());
    println!("Completed tasks:  {}", completed.join(", "));
    println!("Driver phase:     {:?}", state.driver_update.phase);
    println!("Restart required: {}", state.requires_restart);
    if let Some(message) = &state.error_message {
        println!("Stopped:          {}", message);
    }
    if let Some(pid) = store.owner_pid() {
        let note = if is_process_alive(pid) { "" } else { " (exited)" };
        println!("Owner PID:        {}{}", pid, note);
    }
    println!(
        "Recoverable:      {}",
        if recoverable { "yes, the next run resumes it" } else { "no" }
    );

    if !state.log.is_empty() {
        println!("\nRecent log:");
        let skip = state.log.len().saturating_sub(10);
        for line in state.log.iter().skip(skip) {
            println!("  {}", line);
        }
    }
    Ok(0)
}

fn abandon(config: &RunConfig) -> anyhow::Result<i32> {
    let store = StateStore::new(&config.cache_root);
    if let Some(owner) = store.foreign_owner() {
        bail!("run is still in progress in PID {}; stop it first", owner);
    }
    if store.load().is_none() {
        println!("No persisted run state to abandon");
        return Ok(0);
    }
    store.clear();
    info!("Abandoned persisted run state at {:?}", store.path());
    println!("✓ Persisted run state removed");
    Ok(0)
}

fn validate(path: &Path) -> anyhow::Result<i32> {
    info!("Validating configuration file: {:?}", path);
    let config = match RunConfig::load_from_file(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Failed to load configuration file: {:#}", e);
            return Ok(1);
        }
    };
    match config.validate() {
        Ok(()) => {
            println!("✓ Configuration file is valid: {:?}", path);
            Ok(0)
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed: {:#}", e);
            Ok(1)
        }
    }
}

fn inventory(config: &RunConfig) -> anyhow::Result<i32> {
    let provider = SystemInventory::new(
        config.inventory.activation_probe.clone(),
        config.inventory.domain_probe.clone(),
        std::time::Duration::from_secs(config.inventory.probe_timeout_secs),
    );
    let targets = ProbeTargets::from_compliance(&config.compliance);
    let snapshot = provider.snapshot(&targets, &CancelToken::new());
    print!("{}", snapshot);
    Ok(0)
}
