//! Replication Module
//!
//! The poll-driven sync engine, the per-target apply protocol, the cron
//! recovery sweep and conflict alerting.

pub mod alert;
pub mod apply;
mod engine;
mod recovery;

pub use alert::{sink_from_config, AlertDispatcher, AlertSink, ConflictAlert, LogAlertSink, WebhookAlertSink};
pub use apply::{apply_change, check_conflict, upsert};
pub use engine::{CycleReport, EngineSettings, SourceReport, SyncEngine, INVALID_EVENT};
pub use recovery::{parse_cron, NodeSweep, RecoveryJob, RecoverySettings, SweepReport};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Latest reports, as served by the status API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub last_cycle: Option<CycleReport>,
    pub last_sweep: Option<SweepReport>,
}

/// Shared holder of the most recent cycle and sweep reports
#[derive(Debug, Default)]
pub struct StatusBoard {
    inner: RwLock<StatusSnapshot>,
}

impl StatusBoard {
    pub async fn record_cycle(&self, report: CycleReport) {
        self.inner.write().await.last_cycle = Some(report);
    }

    pub async fn record_sweep(&self, report: SweepReport) {
        self.inner.write().await.last_sweep = Some(report);
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        self.inner.read().await.clone()
    }
}
