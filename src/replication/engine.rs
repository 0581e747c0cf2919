//! Synchronization Engine
//!
//! Polls every enabled node's change log and replays pending records on
//! all other enabled nodes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::Instrument;
use uuid::Uuid;

use super::alert::{AlertDispatcher, ConflictAlert};
use super::apply::apply_change;
use super::StatusBoard;
use crate::changelog::{ChangeLog, ChangeRecord, Operation};
use crate::config::SyncMeshConfig;
use crate::error::{Error, Result};
use crate::executor::{statement, QueryOptions, RowData, SqlHandle};
use crate::provider::{ConnectionProvider, Role};
use crate::registry::{NodeDescriptor, NodeRegistry};

/// Failure message for records missing required fields
pub const INVALID_EVENT: &str = "invalid event data";

/// Engine tuning taken from `[worker]`
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub query_timeout: Duration,
    pub version_column: String,
    pub change_log_table: String,
}

impl EngineSettings {
    pub fn from_config(config: &SyncMeshConfig) -> Self {
        Self {
            batch_size: config.worker.batch_size,
            poll_interval: config.poll_interval(),
            query_timeout: config.query_timeout(),
            version_column: config.worker.version_column.clone(),
            change_log_table: config.worker.change_log_table.clone(),
        }
    }
}

/// Outcome of one source within a cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReport {
    pub node_id: i64,
    pub node_name: String,
    pub fetched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub conflicts: usize,
    /// Set when the source could not be processed at all
    pub error: Option<String>,
}

/// Outcome of one poll cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
}

impl CycleReport {
    pub fn succeeded(&self) -> usize {
        self.sources.iter().map(|s| s.succeeded).sum()
    }

    pub fn failed(&self) -> usize {
        self.sources.iter().map(|s| s.failed).sum()
    }

    pub fn conflicts(&self) -> usize {
        self.sources.iter().map(|s| s.conflicts).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RecordOutcome {
    Success,
    Failed { message: String, conflicts: usize },
}

impl RecordOutcome {
    fn failed(message: impl Into<String>) -> Self {
        RecordOutcome::Failed {
            message: message.into(),
            conflicts: 0,
        }
    }
}

/// The replication poll loop
pub struct SyncEngine {
    registry: Arc<dyn NodeRegistry>,
    provider: Arc<dyn ConnectionProvider>,
    alerts: AlertDispatcher,
    settings: EngineSettings,
    shutdown: watch::Receiver<bool>,
}

impl SyncEngine {
    pub fn new(
        registry: Arc<dyn NodeRegistry>,
        provider: Arc<dyn ConnectionProvider>,
        alerts: AlertDispatcher,
        settings: EngineSettings,
    ) -> Self {
        let (_, shutdown) = watch::channel(false);
        Self {
            registry,
            provider,
            alerts,
            settings,
            shutdown,
        }
    }

    /// Stop picking up records or sources once `shutdown` turns true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn opts(&self) -> QueryOptions {
        QueryOptions::new(self.settings.query_timeout)
    }

    /// Run cycles with a fixed delay between them until shutdown
    pub async fn run(&self, status: Arc<StatusBoard>) {
        let mut shutdown = self.shutdown.clone();
        tracing::info!(
            "Sync engine started (batch size {}, poll interval {:?})",
            self.settings.batch_size,
            self.settings.poll_interval
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_poll_cycle().await {
                Ok(report) => status.record_cycle(report).await,
                Err(e) => tracing::error!("Poll cycle failed: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Sync engine stopped");
    }

    /// Process one bounded batch from every enabled node
    pub async fn run_poll_cycle(&self) -> Result<CycleReport> {
        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();

        async {
            let nodes = self.registry.list_enabled().await?;
            if nodes.is_empty() {
                tracing::debug!("No enabled nodes");
            }

            let mut sources = Vec::with_capacity(nodes.len());
            for source in &nodes {
                if self.stopping() {
                    tracing::info!("Shutdown requested, ending cycle early");
                    break;
                }
                let span = tracing::info_span!("source", source = %source.name);
                sources.push(self.process_source(source, &nodes).instrument(span).await);
            }

            let report = CycleReport {
                cycle_id,
                started_at,
                finished_at: Utc::now(),
                sources,
            };
            if report.succeeded() + report.failed() > 0 {
                tracing::info!(
                    "Cycle complete: {} succeeded, {} failed, {} conflicts",
                    report.succeeded(),
                    report.failed(),
                    report.conflicts()
                );
            }
            Ok(report)
        }
        .instrument(tracing::info_span!("cycle", cycle = %cycle_id))
        .await
    }

    async fn process_source(&self, source: &NodeDescriptor, nodes: &[NodeDescriptor]) -> SourceReport {
        let mut report = SourceReport {
            node_id: source.id,
            node_name: source.name.clone(),
            ..SourceReport::default()
        };

        if let Err(e) = self.drain_source(source, nodes, &mut report).await {
            tracing::error!("Source {} failed: {}", source.name, e);
            report.error = Some(e.to_string());
        }
        report
    }

    async fn drain_source(
        &self,
        source: &NodeDescriptor,
        nodes: &[NodeDescriptor],
        report: &mut SourceReport,
    ) -> Result<()> {
        let handle = self.provider.connect(source.id, Role::Worker).await?;
        let log = ChangeLog::new(source.id, Arc::clone(&handle), &self.settings.change_log_table, self.opts())?;

        let records = log.select_pending(self.settings.batch_size).await?;
        report.fetched = records.len();
        if records.is_empty() {
            return Ok(());
        }
        tracing::debug!("Fetched {} pending records", records.len());

        let targets: Vec<&NodeDescriptor> = nodes.iter().filter(|n| n.id != source.id).collect();

        for record in &records {
            if self.stopping() {
                tracing::info!("Shutdown requested, leaving remaining records pending");
                break;
            }

            let span = tracing::debug_span!("event", event_id = record.id);
            let outcome = self
                .process_record(source, handle.as_ref(), record, &targets)
                .instrument(span)
                .await;

            match outcome {
                RecordOutcome::Success => {
                    log.mark_success(record.id).await?;
                    report.succeeded += 1;
                }
                RecordOutcome::Failed { message, conflicts } => {
                    log.mark_failed(record.id, &message).await?;
                    report.failed += 1;
                    report.conflicts += conflicts;
                }
            }
        }

        Ok(())
    }

    async fn process_record(
        &self,
        source: &NodeDescriptor,
        source_handle: &dyn SqlHandle,
        record: &ChangeRecord,
        targets: &[&NodeDescriptor],
    ) -> RecordOutcome {
        match self.replicate(source, source_handle, record, targets).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("System error on event {}: {}", record.id, e);
                RecordOutcome::failed(format!("system error: {}", e))
            }
        }
    }

    async fn replicate(
        &self,
        source: &NodeDescriptor,
        source_handle: &dyn SqlHandle,
        record: &ChangeRecord,
        targets: &[&NodeDescriptor],
    ) -> Result<RecordOutcome> {
        let Some((table, op_type, pk_column, pk_value)) = record.required_fields() else {
            tracing::warn!("Event {} is missing required fields", record.id);
            return Ok(RecordOutcome::failed(INVALID_EVENT));
        };

        let needs_row = Operation::parse(op_type).map(|op| op.needs_row()).unwrap_or(false);
        let row = if needs_row {
            match self.fetch_source_row(source_handle, table, pk_column, pk_value).await? {
                Some(row) => Some(row),
                None => {
                    tracing::warn!("{}.{} no longer exists on {}", table, pk_value, source.name);
                    let missing = Error::SourceRowMissing {
                        table: table.to_string(),
                        pk_value: pk_value.to_string(),
                    };
                    return Ok(RecordOutcome::failed(missing.to_string()));
                }
            }
        } else {
            None
        };

        let results = join_all(
            targets
                .iter()
                .map(|target| self.apply_to_target(target, record, row.as_ref())),
        )
        .await;

        let mut failures = Vec::new();
        let mut conflicts = 0;
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(affected) => {
                    tracing::debug!("Applied {} {}.{} to {} ({} rows)", op_type, table, pk_value, target.name, affected);
                }
                Err(e) => {
                    if let Error::Conflict {
                        event_version,
                        target_version,
                        ..
                    } = &e
                    {
                        conflicts += 1;
                        tracing::warn!("Conflict on {} for {}.{}: {}", target.name, table, pk_value, e);
                        self.alerts.notify_conflict(ConflictAlert {
                            source: source.name.clone(),
                            target: target.name.clone(),
                            table: table.to_string(),
                            pk_value: pk_value.to_string(),
                            message: e.to_string(),
                            event_version: Some(*event_version),
                            target_version: Some(*target_version),
                            detected_at: Utc::now(),
                        });
                    } else {
                        tracing::warn!("Apply to {} failed for {}.{}: {}", target.name, table, pk_value, e);
                    }
                    failures.push(format!("table={}, target={}, error={}", table, target.name, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(RecordOutcome::Success)
        } else {
            Ok(RecordOutcome::Failed {
                message: failures.join("; "),
                conflicts,
            })
        }
    }

    async fn fetch_source_row(
        &self,
        source_handle: &dyn SqlHandle,
        table: &str,
        pk_column: &str,
        pk_value: &str,
    ) -> Result<Option<RowData>> {
        let stmt = statement::select_row(source_handle.kind(), table, pk_column, pk_value)?;
        let rows = source_handle
            .query(&stmt.sql, &stmt.params, &self.opts().with_max_rows(1))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn apply_to_target(
        &self,
        target: &NodeDescriptor,
        record: &ChangeRecord,
        row: Option<&RowData>,
    ) -> Result<u64> {
        let handle = self.provider.connect(target.id, Role::Worker).await?;
        apply_change(handle.as_ref(), record, row, &self.settings.version_column, &self.opts()).await
    }
}
