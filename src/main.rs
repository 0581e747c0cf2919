//! SyncMesh - Trigger-based Multi-Master Replication Daemon
//!
//! Polls the change log of every registered node and replays captured
//! changes on all the others.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use syncmesh::api::StatusServer;
use syncmesh::config::SyncMeshConfig;
use syncmesh::error::Result;
use syncmesh::provider::PoolProvider;
use syncmesh::registry::{CredentialCipher, SqliteRegistry};
use syncmesh::replication::{
    sink_from_config, AlertDispatcher, EngineSettings, RecoveryJob, RecoverySettings, StatusBoard, SyncEngine,
};

/// SyncMesh - Trigger-based Multi-Master Replication
#[derive(Parser)]
#[command(name = "syncmesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "syncmesh.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to the config file's
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the replication daemon
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "syncmesh.toml")]
        output: PathBuf,

        /// Replication worker login
        #[arg(long, default_value = "dbsyncer")]
        worker: String,
    },

    /// Validate configuration file
    Validate,

    /// Show configuration summary
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file_logging = SyncMeshConfig::from_file(&cli.config).ok().map(|c| c.logging);
    let level = cli
        .log_level
        .clone()
        .or_else(|| file_logging.as_ref().map(|l| l.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let compact = file_logging.map(|l| l.format == "compact").unwrap_or(false);
    init_logging(&level, compact);

    match cli.command {
        Commands::Start => run_start(&cli.config).await,
        Commands::Init { output, worker } => run_init(output, worker),
        Commands::Validate => run_validate(&cli.config),
        Commands::Info => run_info(&cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, compact: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if compact {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Run the engine, the recovery job and the status API until Ctrl+C
async fn run_start(config_path: &Path) -> Result<()> {
    let config = SyncMeshConfig::from_file(config_path)?;
    tracing::info!("Starting SyncMesh v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Replication worker: {}", config.worker.username);

    if let Some(parent) = config.registry.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let registry = Arc::new(SqliteRegistry::open(
        &config.registry.path,
        CredentialCipher::new(&config.security.secret),
    )?);
    tracing::info!("Node registry: {}", config.registry.path.display());

    let provider = Arc::new(PoolProvider::new(registry.clone(), &config));
    let (alerts, alert_task) = AlertDispatcher::spawn(sink_from_config(&config.alert)?, config.alert.queue_size);
    let status = Arc::new(StatusBoard::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine = SyncEngine::new(
        registry.clone(),
        provider.clone(),
        alerts,
        EngineSettings::from_config(&config),
    )
    .with_shutdown(shutdown_rx.clone());

    let recovery = RecoveryJob::new(
        registry.clone(),
        provider.clone(),
        registry.clone(),
        RecoverySettings::from_config(&config),
    )
    .with_shutdown(shutdown_rx.clone());
    tracing::info!("Recovery schedule: {}", recovery.current_cron().await);

    let server = StatusServer::new(config.api.clone(), status.clone());

    let engine_handle = tokio::spawn({
        let status = status.clone();
        async move { engine.run(status).await }
    });
    let recovery_handle = tokio::spawn({
        let status = status.clone();
        async move { recovery.run(status).await }
    });
    let api_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            if let Err(e) = server.start(shutdown_rx).await {
                tracing::error!("HTTP status API error: {}", e);
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    for (name, handle) in [("engine", engine_handle), ("recovery", recovery_handle), ("api", api_handle)] {
        if let Err(e) = handle.await {
            tracing::error!("{} task ended abnormally: {}", name, e);
        }
    }

    // the engine owned the last dispatcher, so the queue is closed and drains
    if let Err(e) = alert_task.await {
        tracing::error!("Alert task ended abnormally: {}", e);
    }
    provider.close_all().await;

    tracing::info!("SyncMesh shutdown complete");
    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, worker: String) -> Result<()> {
    let config_content = format!(
        r#"# SyncMesh Configuration
# Generated configuration file

[worker]
# Login used for every replicated write. Capture triggers ignore changes
# made by this user, so it must match the generated triggers.
username = "{worker}"
password = "changeme"
batch_size = 100
poll_interval_ms = 5000
query_timeout_secs = 30
version_column = "sync_version"
change_log_table = "sync_event"

[registry]
path = "/var/lib/syncmesh/registry.db"

[security]
# Encrypts node passwords in the registry. Changing it makes stored
# passwords unreadable.
secret = "change-this-secret"

[pool]
max_connections = 4
connect_timeout_secs = 10

[recovery]
# Used until `syncctl cron set` stores another schedule
default_cron = "0 0 1 * * ?"
window_hours = 24

[alert]
# webhook_url = "https://alerts.example.com/syncmesh"
timeout_secs = 10
queue_size = 256

[api]
enabled = true
bind_address = "0.0.0.0:8090"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to set the worker password and encryption secret.");
    println!("Then start with: syncmesh start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: &Path) -> Result<()> {
    match SyncMeshConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Worker:          {}", config.worker.username);
            println!("  Registry:        {}", config.registry.path.display());
            println!("  Recovery cron:   {}", config.recovery.default_cron);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show configuration summary
fn run_info(config_path: &Path) -> Result<()> {
    let config = SyncMeshConfig::from_file(config_path)?;

    println!("SyncMesh Configuration");
    println!("======================");
    println!();
    println!("Worker:");
    println!("  Login:          {}", config.worker.username);
    println!("  Batch Size:     {}", config.worker.batch_size);
    println!("  Poll Interval:  {} ms", config.worker.poll_interval_ms);
    println!("  Query Timeout:  {} s", config.worker.query_timeout_secs);
    println!("  Version Column: {}", config.worker.version_column);
    println!("  Change Log:     {}", config.worker.change_log_table);
    println!();
    println!("Registry:         {}", config.registry.path.display());
    println!(
        "Pool:             {} connections, {} s connect timeout",
        config.pool.max_connections,
        config.pool.connect_timeout_secs
    );
    println!();
    println!("Recovery:");
    println!("  Default Cron:   {}", config.recovery.default_cron);
    println!("  Window:         {} h", config.recovery.window_hours);
    println!();
    println!("Alerts:           {}", config.alert.webhook_url.as_deref().unwrap_or("(log only)"));
    let api = if config.api.enabled {
        config.api.bind_address.as_str()
    } else {
        "(disabled)"
    };
    println!("Status API:       {}", api);

    Ok(())
}
