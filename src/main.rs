use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::fs;
use std::sync::Arc;

use lumen_manager::events::LifecycleEvent;
use lumen_manager::install::{InstallerConfig, IsolatedInstaller, RegistryPackageFetcher};
use lumen_manager::lifecycle::{LifecycleManager, PluginContext, PluginHandle};
use lumen_manager::registry::{PluginRegistry, PluginState};
use lumen_manager::security::SecurityPolicy;
use lumen_manager::workspace::{WorkspaceBinding, DEFAULT_WORKSPACE};
use lumen_manager::{paths, progress};

#[derive(Parser)]
#[command(name = "lumen")]
#[command(about = "LUMEN - device management platform plugin manager")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Increase output verbosity (show debug messages)
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Suppress progress output
    #[arg(short = 'q', long = "quiet", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan all plugin roots and report what changed
    Discover,

    /// Inspect and manage plugins
    Plugin {
        #[command(subcommand)]
        command: PluginCommands,
    },

    /// Inspect and switch workspaces
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },
}

#[derive(Subcommand)]
enum PluginCommands {
    /// List discovered plugins and their life-cycle states
    List,

    /// Show a plugin's manifest details, requirements, and changelog
    Info { id: String },

    /// Validate a plugin's manifest without enabling it
    Validate { id: String },

    /// Enable a plugin: validate, screen requirements, install dependencies
    Enable { id: String },

    /// Disable a plugin and remove it from the active workspace
    Disable { id: String },
}

#[derive(Subcommand)]
enum WorkspaceCommands {
    /// List all workspaces
    List,

    /// Show the active workspace and its enabled plugins
    Current,

    /// Switch to a workspace: unload everything, start its enabled set
    Switch { name: String },
}

/// Built-in plugins ship inside the host binary; their factories are the
/// process-start population of the entry-point registry. Third-party entry
/// points are registered by the packages that provide them.
struct BuiltinPlugin {
    name: &'static str,
}

impl PluginHandle for BuiltinPlugin {
    fn initialize(&mut self, ctx: &mut PluginContext<'_>) -> Result<()> {
        log::debug!(
            "builtin plugin '{}' initializing for '{}'",
            self.name,
            ctx.plugin_id()
        );
        Ok(())
    }

    fn shutdown(&mut self) {
        log::debug!("builtin plugin '{}' shut down", self.name);
    }
}

fn register_builtin_factories(manager: &mut LifecycleManager) {
    for name in ["device_inventory", "net_scanner", "command_runner", "config_templates"] {
        manager.register_factory(&format!("lumen_builtin::{}", name), move || {
            Box::new(BuiltinPlugin { name })
        });
    }
}

fn active_workspace_file() -> Result<std::path::PathBuf> {
    Ok(paths::lumen_dir()?.join("active_workspace"))
}

fn read_active_workspace() -> String {
    active_workspace_file()
        .ok()
        .and_then(|p| fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_WORKSPACE.to_string())
}

fn write_active_workspace(name: &str) -> Result<()> {
    let path = active_workspace_file()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, name).context("failed to record active workspace")?;
    Ok(())
}

fn build_manager(workspace: &str) -> Result<LifecycleManager> {
    let binding = WorkspaceBinding::open(paths::workspaces_dir()?, workspace)?;
    let registry = PluginRegistry::with_standard_roots(workspace)?;
    let installer = Arc::new(IsolatedInstaller::new(
        Arc::new(RegistryPackageFetcher::new()),
        InstallerConfig::default(),
    ));

    let mut manager = LifecycleManager::new(
        registry,
        installer,
        SecurityPolicy::default(),
        binding,
    )
    .with_journal(paths::install_log_path()?);

    register_builtin_factories(&mut manager);
    Ok(manager)
}

fn state_marker(state: PluginState) -> ColoredString {
    match state {
        PluginState::Running | PluginState::Enabled => progress::STATUS_SUCCESS.green(),
        PluginState::Error => progress::STATUS_ERROR.red(),
        PluginState::Disabled => progress::STATUS_WARNING.yellow(),
        _ => progress::STATUS_INFO.cyan(),
    }
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();
    progress::set_quiet(cli.quiet);

    if let Err(e) = run(cli) {
        eprintln!("{} {:#}", progress::STATUS_ERROR.red(), e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let workspace = read_active_workspace();
    let mut manager = build_manager(&workspace)?;
    let discovery = manager.discover()?;

    match cli.command {
        Commands::Discover => {
            let report = discovery;
            println!(
                "{} {} plugin(s) discovered ({} new, {} removed)",
                progress::STATUS_SUCCESS.green(),
                report.total,
                report.added.len(),
                report.removed.len()
            );
            for id in &report.added {
                println!("  {} {}", "+".green(), id);
            }
            for id in &report.removed {
                println!("  {} {}", "-".red(), id);
            }
        }

        Commands::Plugin { command } => run_plugin_command(&mut manager, command)?,

        Commands::Workspace { command } => run_workspace_command(&mut manager, command)?,
    }

    Ok(())
}

fn run_plugin_command(manager: &mut LifecycleManager, command: PluginCommands) -> Result<()> {
    match command {
        PluginCommands::List => {
            let records = manager.registry().records();
            if records.is_empty() {
                println!("{} No plugins discovered", progress::STATUS_INFO.cyan());
                return Ok(());
            }
            println!(
                "Plugins in workspace {}:\n",
                manager.workspace().name.yellow()
            );
            for record in records {
                println!(
                    "{} {:<24} v{:<10} {:<10} ({})",
                    state_marker(record.state),
                    record.manifest.id,
                    record.manifest.version,
                    record.state.to_string(),
                    record.root
                );
                if record.state == PluginState::Error {
                    if let Some(error) = &record.last_error {
                        println!("      {} {}", "last error:".red(), error);
                    }
                }
            }
        }

        PluginCommands::Info { id } => {
            let record = manager
                .registry()
                .get(&id)
                .with_context(|| format!("plugin '{}' not found", id))?;
            let m = &record.manifest;
            println!("{} v{} ({})", m.name.bold(), m.version, m.id);
            if let Some(description) = &m.description {
                println!("  {}", description);
            }
            if let Some(author) = &m.author {
                println!("  Author: {}", author);
            }
            println!("  State: {}", record.state);
            println!("  Entry point: {}", m.entry_point);
            println!("  Directory: {}", record.plugin_dir.display());
            if !m.dependencies.is_empty() {
                println!("  Plugin dependencies:");
                for dep in &m.dependencies {
                    println!("    • {} {}", dep.id, dep.version);
                }
            }
            if !m.requirements.python.is_empty() {
                println!("  Python requirements:");
                for req in &m.requirements.python {
                    println!("    • {}", req);
                }
            }
            if !m.requirements.system.is_empty() {
                println!("  System requirements:");
                for req in &m.requirements.system {
                    println!("    • {}", req);
                }
            }
            if !record.warnings.is_empty() {
                println!("  Warnings:");
                for warning in &record.warnings {
                    println!("    {} {}", progress::STATUS_WARNING.yellow(), warning);
                }
            }
            if let Some(error) = &record.last_error {
                println!("  Last error: {}", error.red());
            }
            if !m.changelog.is_empty() {
                println!("  Changelog:");
                for entry in &m.changelog {
                    println!("    v{} ({})", entry.version, entry.date);
                    for change in &entry.changes {
                        println!("      - {}", change);
                    }
                }
            }
        }

        PluginCommands::Validate { id } => match manager.validate(&id) {
            Ok(()) => println!("{} Manifest for '{}' is valid", progress::STATUS_SUCCESS.green(), id),
            Err(e) => {
                println!("{} {}", progress::STATUS_ERROR.red(), e);
                std::process::exit(1);
            }
        },

        PluginCommands::Enable { id } => {
            let pb = progress::install_progress_bar(100, &format!("Enabling {}", id));
            let pb_events = pb.clone();
            manager.events_mut().subscribe(move |event| {
                if let LifecycleEvent::InstallProgress { percent, message, .. } = event {
                    pb_events.set_position(*percent as u64);
                    pb_events.set_message(message.clone());
                }
            });

            match manager.enable(&id) {
                Ok(()) => {
                    progress::finish_success(&pb, &format!("Enabled {}", id));
                    if let Some(record) = manager.registry().get(&id) {
                        for warning in &record.warnings {
                            println!("  {} {}", progress::STATUS_WARNING.yellow(), warning);
                        }
                    }
                }
                Err(e) => {
                    progress::finish_error(&pb, &format!("Failed to enable {}", id));
                    return Err(e.into());
                }
            }
        }

        PluginCommands::Disable { id } => {
            manager.disable(&id)?;
            println!("{} Disabled {}", progress::STATUS_SUCCESS.green(), id);
        }
    }

    Ok(())
}

fn run_workspace_command(
    manager: &mut LifecycleManager,
    command: WorkspaceCommands,
) -> Result<()> {
    match command {
        WorkspaceCommands::List => {
            let active = manager.workspace().name.clone();
            for name in manager.workspaces()? {
                if name == active {
                    println!("{} {} (active)", "*".green(), name.yellow());
                } else {
                    println!("  {}", name);
                }
            }
        }

        WorkspaceCommands::Current => {
            let config = manager.workspace();
            println!("Workspace: {}", config.name.yellow());
            if let Some(description) = &config.description {
                println!("  {}", description);
            }
            if config.enabled_plugins.is_empty() {
                println!("  No plugins enabled");
            } else {
                println!("  Enabled plugins:");
                for id in &config.enabled_plugins {
                    println!("    • {}", id);
                }
            }
        }

        WorkspaceCommands::Switch { name } => {
            let report = manager.switch_workspace(&name)?;
            write_active_workspace(&name)?;
            println!(
                "{} Switched to '{}': {} unloaded, {} started",
                progress::STATUS_SUCCESS.green(),
                name,
                report.unloaded.len(),
                report.started.len()
            );
            for id in &report.skipped {
                println!(
                    "  {} enabled plugin '{}' is not discovered, skipped",
                    progress::STATUS_WARNING.yellow(),
                    id
                );
            }
            for (id, error) in &report.failed {
                println!("  {} '{}' failed to start: {}", progress::STATUS_ERROR.red(), id, error);
            }
        }
    }

    Ok(())
}
