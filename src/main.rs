use std::path::{Path, PathBuf};

use clap::Parser;
use stale_sweeper::{
    config::SweeperConfig,
    observability,
    retention::{RetentionJob, build_retention_job},
};

/// Config file picked up from the working directory when `--config` is not given.
const DEFAULT_CONFIG_FILE: &str = "stale-sweeper.toml";

/// CLI arguments for the stale sweeper
#[derive(Parser, Debug)]
#[command(version, about = "Cluster-coordinated stale record sweeper", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (defaults to ./stale-sweeper.toml if it exists,
    /// otherwise built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run the retention schedule until interrupted (default)
    Serve,
    /// Run a single purge pass now, ignoring the schedule
    RunOnce {
        /// Log what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },
    /// Print when the schedule fires next
    NextRun,
    /// Show enabled compile-time features
    Features,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Some(Command::RunOnce { dry_run }) => {
            run_once(args.config.as_deref(), dry_run).await;
        }
        Some(Command::NextRun) => {
            run_next_run(args.config.as_deref()).await;
        }
        Some(Command::Features) => {
            run_features();
        }
        Some(Command::Serve) | None => {
            run_server(args.config.as_deref()).await;
        }
    }
}

/// Resolve the config path. `None` means run with built-in defaults.
fn resolve_config_path(explicit_path: Option<&str>) -> Result<Option<PathBuf>, String> {
    if let Some(path) = explicit_path {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(format!("Config file not found: {}", path.display()));
        }
        return Ok(Some(path));
    }

    let cwd_config = PathBuf::from(DEFAULT_CONFIG_FILE);
    if cwd_config.exists() {
        return Ok(Some(cwd_config));
    }

    Ok(None)
}

/// Load configuration or exit the process.
fn load_config(explicit_path: Option<&str>) -> (SweeperConfig, Option<PathBuf>) {
    let config_path = match resolve_config_path(explicit_path) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let config = match &config_path {
        Some(path) => match SweeperConfig::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config from {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => SweeperConfig::default(),
    };

    (config, config_path)
}

fn init_observability(config: &SweeperConfig) {
    if let Err(e) = observability::init_tracing(&config.observability.logging) {
        eprintln!("Failed to initialize tracing: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = observability::metrics::init_metrics(&config.observability.metrics) {
        tracing::warn!(error = %e, "Failed to initialize metrics");
    }
}

async fn build_job_or_exit(config: &SweeperConfig) -> RetentionJob {
    match build_retention_job(config).await {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(error = %e, "Failed to set up retention job");
            std::process::exit(1);
        }
    }
}

/// Run the retention schedule
async fn run_server(explicit_config_path: Option<&str>) {
    let (config, config_path) = load_config(explicit_config_path);
    init_observability(&config);

    tracing::info!(
        config_file = %config_path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<defaults>".to_string()),
        "Starting stale sweeper"
    );

    let job = build_job_or_exit(&config).await;

    // Invalid settings leave the job stopped until a reload fixes them
    if let Err(e) = job.start() {
        tracing::error!(error = %e, "Retention job not started");
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    #[cfg(unix)]
    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .expect("failed to install SIGHUP handler");

    loop {
        #[cfg(unix)]
        let reload = hangup.recv();
        #[cfg(not(unix))]
        let reload = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = &mut shutdown => break,
            Some(()) = reload => reload_config(&job, config_path.as_deref()).await,
        }
    }

    tracing::info!("Shutdown signal received, stopping retention job...");

    let stop_timeout = job.config().stop_timeout();
    match job.stop(stop_timeout).await {
        Ok(()) => tracing::info!("Shutdown complete"),
        Err(e) => tracing::warn!(error = %e, "Retention run did not stop cleanly"),
    }
}

/// Re-read the config file and apply its `[retention]` section. Cache and
/// database changes need a restart.
async fn reload_config(job: &RetentionJob, config_path: Option<&Path>) {
    let Some(path) = config_path else {
        tracing::warn!("Reload requested but no config file is in use");
        return;
    };

    let config = match SweeperConfig::from_file(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(
                error = %e,
                config_file = %path.display(),
                "Failed to reload config, keeping current settings"
            );
            return;
        }
    };

    tracing::info!(config_file = %path.display(), "Reloading retention settings");
    if let Err(e) = job.on_configuration_change(config.retention).await {
        tracing::error!(error = %e, "Retention job stopped after configuration change");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Run one purge pass under the cluster lease and print the totals.
async fn run_once(explicit_config_path: Option<&str>, dry_run: bool) {
    let (mut config, _) = load_config(explicit_config_path);
    if dry_run {
        config.retention.safety.dry_run = true;
    }
    init_observability(&config);

    let job = build_job_or_exit(&config).await;

    let outcome = match job.run_now().await {
        Ok(Some(outcome)) => outcome,
        Ok(None) => {
            eprintln!("A retention run is already in progress");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Cannot run retention: {e}");
            std::process::exit(1);
        }
    };

    let results = &outcome.results;
    if config.retention.safety.dry_run {
        println!("Would delete: {}", results.dry_run_matches);
    } else {
        println!("Deleted:        {}", results.items_deleted);
        println!("Failed batches: {}", results.failed_batches);
    }
    println!("Exit:           {}", results.exit_reason);
    println!("Duration:       {:.1}s", results.duration.as_secs_f64());

    if let Some(e) = outcome.error {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Print the next scheduled run.
async fn run_next_run(explicit_config_path: Option<&str>) {
    let (config, _) = load_config(explicit_config_path);
    init_observability(&config);

    let job = build_job_or_exit(&config).await;
    match job.next_scheduled_run().await {
        Ok(Some(next)) => println!("{}", next.to_rfc3339()),
        Ok(None) => println!("Retention job is disabled"),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Print enabled compile-time features.
fn run_features() {
    let version = env!("CARGO_PKG_VERSION");

    let features: &[(&str, &str, bool)] = &[
        ("server", "Runtime", cfg!(feature = "server")),
        (
            "database-sqlite",
            "Databases",
            cfg!(feature = "database-sqlite"),
        ),
        ("redis", "Infrastructure", cfg!(feature = "redis")),
        ("prometheus", "Infrastructure", cfg!(feature = "prometheus")),
    ];

    let profile = if cfg!(feature = "full") {
        "full"
    } else {
        "custom"
    };

    println!("stale-sweeper v{version}\n");
    println!("Build profile: {profile}");
    match profile {
        "full" => println!("  (full = server + database-sqlite, redis, prometheus)\n"),
        _ => println!(),
    }

    println!("Compile-time features:");

    let mut current_group = "";
    for &(name, group, enabled) in features {
        if group != current_group {
            if !current_group.is_empty() {
                println!();
            }
            println!("  {group}:");
            current_group = group;
        }
        let status = if enabled { "enabled" } else { "disabled" };
        println!("    {name:<32} {status}");
    }
}
