//! SyncCtl - Operator tooling for SyncMesh
//!
//! Usage:
//!   syncctl node list              - Show registered nodes
//!   syncctl events stats <node>    - Change log counts for a node
//!   syncctl triggers --dialect X   - Generate capture triggers from DDL
//!   syncctl sync                   - Run one poll cycle now

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use syncmesh::admin::SyncAdmin;
use syncmesh::changelog::EventStatus;
use syncmesh::config::SyncMeshConfig;
use syncmesh::dialect::DatabaseKind;
use syncmesh::provider::PoolProvider;
use syncmesh::registry::{CredentialCipher, NewNode, SqliteRegistry};
use syncmesh::replication::{
    sink_from_config, AlertDispatcher, EngineSettings, RecoveryJob, RecoverySettings, SyncEngine,
};
use syncmesh::trigger::{generate_triggers, TriggerOptions};

/// SyncMesh Control Tool
#[derive(Parser)]
#[command(name = "syncctl")]
#[command(version, about = "Manage SyncMesh nodes, change logs and triggers", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "syncmesh.toml")]
    config: PathBuf,

    /// Log level for operations that talk to nodes
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage registered nodes
    Node {
        #[command(subcommand)]
        action: NodeCommand,
    },
    /// Inspect and repair change logs
    Events {
        #[command(subcommand)]
        action: EventsCommand,
    },
    /// Show or change the recovery schedule
    Cron {
        #[command(subcommand)]
        action: CronCommand,
    },
    /// Generate capture triggers from CREATE TABLE statements
    Triggers {
        /// Target database kind (mysql, oracle, postgresql, sql_server)
        #[arg(short, long)]
        dialect: String,
        /// DDL file (reads stdin when omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one poll cycle now
    Sync,
    /// Run one recovery sweep now
    Recover,
}

#[derive(Subcommand)]
enum NodeCommand {
    /// Register a node
    Add {
        #[arg(long)]
        name: String,
        /// Database kind (mysql, oracle, postgresql, sql_server)
        #[arg(long)]
        kind: String,
        #[arg(long)]
        host: String,
        /// Defaults to the kind's standard port
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        database: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
    /// List registered nodes
    List,
    /// Include a node in replication
    Enable { id: i64 },
    /// Exclude a node from replication
    Disable { id: i64 },
    /// Remove a node from the registry
    Remove { id: i64 },
    /// Check that a node accepts connections
    Test { id: i64 },
    /// List a node's user tables
    Tables { id: i64 },
}

#[derive(Subcommand)]
enum EventsCommand {
    /// Pending/success/failed counts
    Stats { node: i64 },
    /// Page through change records, newest first
    List {
        node: i64,
        /// Only records in this status (pending, success, failed)
        #[arg(short, long)]
        status: Option<String>,
        #[arg(short, long, default_value_t = 1)]
        page: u64,
        #[arg(long, default_value_t = 20)]
        size: u64,
    },
    /// Put a record back to pending
    Retry { node: i64, event: i64 },
    /// Mark a record done without replaying it
    Skip { node: i64, event: i64 },
}

#[derive(Subcommand)]
enum CronCommand {
    /// Show the schedule in effect
    Get,
    /// Store a new schedule
    Set { expression: String },
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.as_str().into());
    tracing_subscriber::fmt().with_env_filter(env_filter).with_writer(std::io::stderr).init();

    let result = match &cli.command {
        Commands::Node { action } => node_command(&cli.config, action).await,
        Commands::Events { action } => events_command(&cli.config, action).await,
        Commands::Cron { action } => cron_command(&cli.config, action).await,
        Commands::Triggers { dialect, input, json } => triggers(&cli.config, dialect, input.as_deref(), *json),
        Commands::Sync => sync_once(&cli.config).await,
        Commands::Recover => recover_once(&cli.config).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

// ============ Setup ============

struct Session {
    config: SyncMeshConfig,
    registry: Arc<SqliteRegistry>,
    provider: Arc<PoolProvider>,
}

fn load(config_path: &Path) -> anyhow::Result<Session> {
    let config = SyncMeshConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let registry = Arc::new(
        SqliteRegistry::open(&config.registry.path, CredentialCipher::new(&config.security.secret))
            .with_context(|| format!("opening registry {}", config.registry.path.display()))?,
    );
    let provider = Arc::new(PoolProvider::new(registry.clone(), &config));
    Ok(Session {
        config,
        registry,
        provider,
    })
}

impl Session {
    fn admin(&self) -> SyncAdmin {
        SyncAdmin::new(
            self.provider.clone(),
            self.config.worker.change_log_table.clone(),
            self.config.query_timeout(),
        )
    }

    fn recovery(&self) -> RecoveryJob {
        RecoveryJob::new(
            self.registry.clone(),
            self.provider.clone(),
            self.registry.clone(),
            RecoverySettings::from_config(&self.config),
        )
    }
}

// ============ Commands ============

async fn node_command(config_path: &Path, action: &NodeCommand) -> anyhow::Result<()> {
    let ctx = load(config_path)?;

    match action {
        NodeCommand::Add {
            name,
            kind,
            host,
            port,
            database,
            username,
            password,
        } => {
            let node = ctx
                .registry
                .add_node(NewNode {
                    name: name.clone(),
                    kind: DatabaseKind::from_code(kind)?,
                    host: host.clone(),
                    port: *port,
                    database: database.clone(),
                    username: username.clone(),
                    password: password.clone(),
                })
                .await?;
            println!("Registered node {} ({}) at {}", node.id, node.name, node.url());
        }
        NodeCommand::List => {
            let nodes = ctx.registry.list_nodes().await?;
            println!("{:<6} {:<20} {:<12} {:<40} {:<8}", "ID", "NAME", "KIND", "URL", "ENABLED");
            println!("{}", "-".repeat(90));
            for node in nodes {
                println!(
                    "{:<6} {:<20} {:<12} {:<40} {:<8}",
                    node.id,
                    node.name,
                    node.kind.code(),
                    node.url(),
                    if node.enabled { "yes" } else { "no" }
                );
            }
        }
        NodeCommand::Enable { id } => {
            ctx.registry.set_enabled(*id, true).await?;
            println!("Node {} enabled", id);
        }
        NodeCommand::Disable { id } => {
            ctx.registry.set_enabled(*id, false).await?;
            println!("Node {} disabled", id);
        }
        NodeCommand::Remove { id } => {
            ctx.registry.remove_node(*id).await?;
            println!("Node {} removed", id);
        }
        NodeCommand::Test { id } => {
            ctx.admin().test_connection(*id).await?;
            println!("✓ Node {} is reachable", id);
        }
        NodeCommand::Tables { id } => {
            for table in ctx.admin().list_tables(*id).await? {
                println!("{}", table);
            }
        }
    }

    ctx.provider.close_all().await;
    Ok(())
}

async fn events_command(config_path: &Path, action: &EventsCommand) -> anyhow::Result<()> {
    let ctx = load(config_path)?;
    let admin = ctx.admin();

    match action {
        EventsCommand::Stats { node } => {
            let stats = admin.stats(*node).await?;
            println!("Pending:  {}", stats.pending);
            println!("Success:  {}", stats.success);
            println!("Failed:   {}", stats.failed);
            println!("Total:    {}", stats.total);
        }
        EventsCommand::List {
            node,
            status,
            page,
            size,
        } => {
            let status = status
                .as_deref()
                .map(str::parse::<EventStatus>)
                .transpose()?;
            let records = admin.list_events(*node, status, *page, *size).await?;
            println!(
                "{:<8} {:<20} {:<8} {:<16} {:<8} {:<20} {}",
                "ID", "TABLE", "OP", "KEY", "STATUS", "CAPTURED", "ERROR"
            );
            println!("{}", "-".repeat(100));
            for record in records {
                println!(
                    "{:<8} {:<20} {:<8} {:<16} {:<8} {:<20} {}",
                    record.id,
                    record.table_name.as_deref().unwrap_or("-"),
                    record.op_type.as_deref().unwrap_or("-"),
                    record.pk_value.as_deref().unwrap_or("-"),
                    record.status.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                    record.op_time.map(|t| t.to_string()).unwrap_or_else(|| "-".into()),
                    record.error_msg.as_deref().unwrap_or("")
                );
            }
        }
        EventsCommand::Retry { node, event } => {
            admin.retry(*node, *event).await?;
            println!("Event {} queued for retry", event);
        }
        EventsCommand::Skip { node, event } => {
            admin.skip(*node, *event).await?;
            println!("Event {} marked as skipped", event);
        }
    }

    ctx.provider.close_all().await;
    Ok(())
}

async fn cron_command(config_path: &Path, action: &CronCommand) -> anyhow::Result<()> {
    let ctx = load(config_path)?;
    let recovery = ctx.recovery();

    match action {
        CronCommand::Get => {
            println!("{}", recovery.current_cron().await);
            if let Some(next) = recovery.next_run_after(&chrono::Local::now()).await? {
                println!("Next sweep: {}", next.format("%Y-%m-%d %H:%M:%S"));
            }
        }
        CronCommand::Set { expression } => {
            recovery.set_sync_cron(expression).await?;
            println!("Recovery schedule set to '{}'", expression.trim());
        }
    }
    Ok(())
}

fn triggers(config_path: &Path, dialect: &str, input: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let kind = DatabaseKind::from_code(dialect)?;

    // worker identity comes from the config when one is present
    let options = if config_path.exists() {
        TriggerOptions::from_config(&SyncMeshConfig::from_file(config_path)?)
    } else {
        TriggerOptions::default()
    };

    let ddl = match input {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };

    let generated = generate_triggers(&ddl, kind, &options)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&generated)?);
        return Ok(());
    }

    print!("{}", generated.source);
    for skipped in &generated.skipped {
        eprintln!("skipped: {} ({})", skipped.fragment, skipped.reason);
    }
    if generated.tables.is_empty() {
        bail!("no triggers generated");
    }
    Ok(())
}

async fn sync_once(config_path: &Path) -> anyhow::Result<()> {
    let ctx = load(config_path)?;
    let (alerts, alert_task) = AlertDispatcher::spawn(sink_from_config(&ctx.config.alert)?, ctx.config.alert.queue_size);

    let engine = SyncEngine::new(
        ctx.registry.clone(),
        ctx.provider.clone(),
        alerts,
        EngineSettings::from_config(&ctx.config),
    );
    let report = engine.run_poll_cycle().await?;
    drop(engine);
    alert_task.await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    ctx.provider.close_all().await;
    Ok(())
}

async fn recover_once(config_path: &Path) -> anyhow::Result<()> {
    let ctx = load(config_path)?;
    let report = ctx.recovery().run_recovery_sweep().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    ctx.provider.close_all().await;
    Ok(())
}
