use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use repo_sync::config::LoggingConfig;
use repo_sync::health::CheckResult;
use repo_sync::repository::{SuiteTopology, VersionTopology};
use repo_sync::{
    Config, HealthCheck, RepositoryDescriptor, RepositorySyncOrchestrator, RsyncTool, RunSummary,
    Topology, TransferExecutor, TransferOptions,
};

/// Exit status after Ctrl+C
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "repo-sync")]
#[command(about = "Selective APT/DNF repository mirroring driven by rsync")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },

    /// Mirror the configured repositories
    Sync {
        /// Sync only the named repository (repeatable)
        #[arg(long = "repo", value_name = "NAME")]
        repos: Vec<String>,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the metadata transfers a sync would run, without running them
    Plan {
        /// Plan only the named repository (repeatable)
        #[arg(long = "repo", value_name = "NAME")]
        repos: Vec<String>,
    },

    /// List configured repositories and their coordinates
    List,

    /// System health check and diagnostics
    Doctor,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tokio::select! {
        result = run(cli) => match result {
            Ok(code) => code,
            Err(e) => {
                eprintln!("❌ Error: {:#}", e);
                ExitCode::FAILURE
            }
        },
        _ = wait_for_interrupt() => {
            warn!("Interrupted, stopping");
            eprintln!("\n⚠️  Interrupted");
            ExitCode::from(EXIT_INTERRUPTED)
        }
    }
}

/// Resolves on Ctrl+C; never resolves if the handler cannot be installed
async fn wait_for_interrupt() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    if let Commands::Init { force } = cli.command {
        init_logging(cli.verbose, &LoggingConfig::default())?;
        return cmd_init(cli.config.as_deref(), force);
    }

    let (config, created) = load_config(cli.config.as_deref())?;
    init_logging(cli.verbose, &config.logging)?;
    info!("Starting repo-sync v{}", env!("CARGO_PKG_VERSION"));

    if created {
        let path = Config::default_config_path()?;
        println!("📝 Created default configuration at {}", path.display());
        println!("   Edit it to select the repositories to mirror, then run 'repo-sync sync'");
    }

    match cli.command {
        Commands::Init { force } => cmd_init(cli.config.as_deref(), force),
        Commands::Sync { .. } if created => Ok(ExitCode::SUCCESS),
        Commands::Sync { repos, json } => cmd_sync(&config, &repos, json).await,
        Commands::Plan { repos } => cmd_plan(&config, &repos),
        Commands::List => cmd_list(&config),
        Commands::Doctor => cmd_doctor(&config).await,
    }
}

/// Initialize logging: RUST_LOG wins, then --verbose, then the configured level
fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("Invalid log level: {}", logging.level))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "full" {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    } else {
        registry
            .with(fmt::layer().compact().with_target(false).with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&Path>) -> Result<(Config, bool)> {
    match config_path {
        Some(path) => Ok((Config::load(path)?, false)),
        None => Config::load_or_create(),
    }
}

/// Validated descriptors, restricted to `names` when any are given
fn select_repositories(config: &Config, names: &[String]) -> Result<Vec<RepositoryDescriptor>> {
    let descriptors = config.descriptors().context("Invalid configuration")?;
    if names.is_empty() {
        return Ok(descriptors);
    }

    let unknown: Vec<&str> = names
        .iter()
        .filter(|name| !descriptors.iter().any(|d| &d.name == *name))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        let known: Vec<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();
        bail!(
            "Unknown repository: {} (configured: {})",
            unknown.join(", "),
            known.join(", ")
        );
    }

    Ok(descriptors
        .into_iter()
        .filter(|d| names.contains(&d.name))
        .collect())
}

fn orchestrator(config: &Config) -> Result<RepositorySyncOrchestrator> {
    let tool = Arc::new(RsyncTool::new(&config.transfer.program));
    let executor = TransferExecutor::new(tool, TransferOptions::from(&config.transfer));
    Ok(RepositorySyncOrchestrator::new(config.base_dir(), executor, config.retry_policy()?))
}

/// Write the default configuration
fn cmd_init(config_path: Option<&Path>, force: bool) -> Result<ExitCode> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => Config::default_config_path()?,
    };

    if path.exists() && !force {
        bail!(
            "Configuration already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
    }
    Config::default().save(&path)?;

    println!("✅ Configuration written to {}", path.display());
    println!("   Next: edit the repository list and run 'repo-sync sync'");
    Ok(ExitCode::SUCCESS)
}

/// Sync repositories according to configuration
async fn cmd_sync(config: &Config, names: &[String], json: bool) -> Result<ExitCode> {
    let repositories = select_repositories(config, names)?;

    let health = HealthCheck::run(config).await;
    if !health.all_passed() {
        for check in health.errors() {
            error!("{}", check.message);
            if let Some(details) = &check.details {
                error!("  {}", details);
            }
        }
        bail!("Preflight checks failed, nothing was transferred");
    }

    let base_dir = config.base_dir();
    std::fs::create_dir_all(&base_dir)
        .with_context(|| format!("Failed to create base directory: {}", base_dir.display()))?;

    let summary = orchestrator(config)?.run(&repositories).await;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialize run summary")?
        );
    } else {
        print_summary(&summary);
    }

    Ok(if summary.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_summary(summary: &RunSummary) {
    println!("\n🎉 Synchronization Complete!");
    println!("   ✅ Succeeded: {}", summary.succeeded);
    println!("   ❌ Failed: {}", summary.failed);
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    for outcome in &summary.outcomes {
        let icon = if outcome.succeeded() { "✅" } else { "❌" };
        println!(
            "   {} {} ({}): {} artifacts, {} phases, {:.1}s",
            icon,
            outcome.name,
            outcome.kind,
            outcome.artifacts_required,
            outcome.phases_completed,
            outcome.duration.as_secs_f64()
        );
        if let Some(error) = &outcome.error {
            println!("      {}", error);
        }
    }
}

/// Print metadata transfer commands
fn cmd_plan(config: &Config, names: &[String]) -> Result<ExitCode> {
    let repositories = select_repositories(config, names)?;
    let orchestrator = orchestrator(config)?;

    for repo in &repositories {
        println!("# {} ({})", repo.name, repo.kind());
        for line in orchestrator.plan(repo) {
            println!("{}", line);
        }
        println!();
    }

    Ok(ExitCode::SUCCESS)
}

/// List configured repositories
fn cmd_list(config: &Config) -> Result<ExitCode> {
    let repositories = config.descriptors().context("Invalid configuration")?;

    println!("Repositories ({}):", repositories.len());
    for repo in &repositories {
        println!("📁 {} [{}]", repo.name, repo.kind());
        println!("   🔗 {}", repo.url);
        match &repo.topology {
            Topology::Suites(topology) => print_suites(topology),
            Topology::Versions(topology) => print_versions(topology),
        }
        println!();
    }

    Ok(ExitCode::SUCCESS)
}

fn print_suites(topology: &SuiteTopology) {
    println!("   Suites: {}", topology.suites.join(", "));
    println!("   Components: {}", topology.components.join(", "));
    println!("   Architectures: {}", topology.architectures.join(", "));
    if topology.include_source {
        println!("   Sources: yes");
    }
}

fn print_versions(topology: &VersionTopology) {
    for coordinate in topology.coordinates() {
        println!("   {}", coordinate.path);
    }
}

/// System health check and diagnostics
async fn cmd_doctor(config: &Config) -> Result<ExitCode> {
    let health = HealthCheck::run(config).await;
    print_health_report(&health);
    Ok(if health.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning { "⚠️ " } else { "✅" }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 repo-sync System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}
