//! Recovery Job
//!
//! On a cron schedule, puts recently failed change records back to pending
//! so the next poll cycle retries them.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::Instrument;

use super::StatusBoard;
use crate::changelog::ChangeLog;
use crate::config::SyncMeshConfig;
use crate::error::{Error, Result};
use crate::executor::QueryOptions;
use crate::provider::{ConnectionProvider, Role};
use crate::registry::{ConfigStore, NodeDescriptor, NodeRegistry, SYNC_CRON_KEY};

/// Parse a cron expression.
///
/// Accepts the six-field form with seconds, Spring-style `?` for "no
/// specific value", and plain five-field crontab lines.
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let normalized = expr.trim().replace('?', "*");
    let normalized = match normalized.split_whitespace().count() {
        5 => format!("0 {}", normalized),
        _ => normalized,
    };
    Schedule::from_str(&normalized).map_err(|e| Error::Config(format!("Invalid cron expression '{}': {}", expr, e)))
}

/// Tuning taken from `[recovery]` and `[worker]`
#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub default_cron: String,
    pub window: chrono::Duration,
    pub change_log_table: String,
    pub query_timeout: Duration,
}

impl RecoverySettings {
    pub fn from_config(config: &SyncMeshConfig) -> Self {
        Self {
            default_cron: config.recovery.default_cron.clone(),
            window: config.recovery_window(),
            change_log_table: config.worker.change_log_table.clone(),
            query_timeout: config.query_timeout(),
        }
    }
}

/// Outcome for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSweep {
    pub node_id: i64,
    pub node_name: String,
    pub reset: u64,
    pub error: Option<String>,
}

/// Outcome of one sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub window_start: NaiveDateTime,
    pub nodes: Vec<NodeSweep>,
    pub total_reset: u64,
}

impl SweepReport {
    /// Names of nodes the sweep could not reach
    pub fn failed_nodes(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.error.is_some())
            .map(|n| n.node_name.as_str())
            .collect()
    }
}

pub struct RecoveryJob {
    registry: Arc<dyn NodeRegistry>,
    provider: Arc<dyn ConnectionProvider>,
    store: Arc<dyn ConfigStore>,
    settings: RecoverySettings,
    shutdown: watch::Receiver<bool>,
}

impl RecoveryJob {
    pub fn new(
        registry: Arc<dyn NodeRegistry>,
        provider: Arc<dyn ConnectionProvider>,
        store: Arc<dyn ConfigStore>,
        settings: RecoverySettings,
    ) -> Self {
        let (_, shutdown) = watch::channel(false);
        Self {
            registry,
            provider,
            store,
            settings,
            shutdown,
        }
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Schedule from `sync.cron`, or the configured default when the key
    /// is absent or unparsable
    pub async fn current_schedule(&self) -> Result<Schedule> {
        match self.store.get(SYNC_CRON_KEY).await {
            Ok(Some(expr)) => match parse_cron(&expr) {
                Ok(schedule) => return Ok(schedule),
                Err(e) => tracing::warn!("Ignoring stored {}: {}", SYNC_CRON_KEY, e),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!("Could not read {}: {}", SYNC_CRON_KEY, e),
        }
        parse_cron(&self.settings.default_cron)
    }

    /// The expression currently in effect
    pub async fn current_cron(&self) -> String {
        match self.store.get(SYNC_CRON_KEY).await {
            Ok(Some(expr)) if parse_cron(&expr).is_ok() => expr,
            _ => self.settings.default_cron.clone(),
        }
    }

    /// Validate and store a new schedule
    pub async fn set_sync_cron(&self, expr: &str) -> Result<()> {
        parse_cron(expr)?;
        self.store.upsert(SYNC_CRON_KEY, expr.trim()).await?;
        tracing::info!("Recovery schedule set to '{}'", expr.trim());
        Ok(())
    }

    pub async fn next_run_after(&self, after: &DateTime<Local>) -> Result<Option<DateTime<Local>>> {
        Ok(self.current_schedule().await?.after(after).next())
    }

    /// Sweep using the local wall clock
    pub async fn run_recovery_sweep(&self) -> Result<SweepReport> {
        self.run_sweep_at(Local::now().naive_local()).await
    }

    /// Reset failures captured within the window ending at `now`
    pub async fn run_sweep_at(&self, now: NaiveDateTime) -> Result<SweepReport> {
        let window_start = now - self.settings.window;
        let nodes = self.registry.list_enabled().await?;

        let mut report = SweepReport {
            window_start,
            nodes: Vec::with_capacity(nodes.len()),
            total_reset: 0,
        };

        for node in &nodes {
            let span = tracing::info_span!("recover", node = %node.name);
            let outcome = match self.reset_node(node, window_start).instrument(span).await {
                Ok(reset) => {
                    if reset > 0 {
                        tracing::info!("Reset {} failed records on {}", reset, node.name);
                    }
                    report.total_reset += reset;
                    NodeSweep {
                        node_id: node.id,
                        node_name: node.name.clone(),
                        reset,
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::error!("Recovery sweep failed on {}: {}", node.name, e);
                    NodeSweep {
                        node_id: node.id,
                        node_name: node.name.clone(),
                        reset: 0,
                        error: Some(e.to_string()),
                    }
                }
            };
            report.nodes.push(outcome);
        }

        tracing::info!(
            "Recovery sweep since {} reset {} records across {} nodes",
            window_start,
            report.total_reset,
            report.nodes.len()
        );
        Ok(report)
    }

    async fn reset_node(&self, node: &NodeDescriptor, window_start: NaiveDateTime) -> Result<u64> {
        let handle = self.provider.connect(node.id, Role::Worker).await?;
        let log = ChangeLog::new(
            node.id,
            handle,
            &self.settings.change_log_table,
            QueryOptions::new(self.settings.query_timeout),
        )?;
        log.reset_failed_since(window_start).await
    }

    /// Sleep until each scheduled instant and sweep, until shutdown
    pub async fn run(&self, status: Arc<StatusBoard>) {
        let mut shutdown = self.shutdown.clone();
        tracing::info!("Recovery job started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = Local::now();
            let next = match self.next_run_after(&now).await {
                Ok(Some(next)) => next,
                Ok(None) => {
                    tracing::warn!("Recovery schedule has no future run");
                    let _ = shutdown.changed().await;
                    break;
                }
                Err(e) => {
                    tracing::error!("No usable recovery schedule: {}", e);
                    let _ = shutdown.changed().await;
                    break;
                }
            };
            let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
            tracing::debug!("Next recovery sweep at {}", next);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    match self.run_recovery_sweep().await {
                        Ok(report) => status.record_sweep(report).await,
                        Err(e) => tracing::error!("Recovery sweep failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Recovery job stopped");
    }
}
