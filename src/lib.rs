//! SyncMesh - Trigger-based Multi-Master Database Replication
//!
//! Keeps several independent relational databases in sync without a
//! central coordinator. Generated triggers on every node append captured
//! row changes to a local change log; the sync engine polls those logs and
//! replays each change on every other node.
//!
//! # Architecture
//!
//! Each row carries a version counter that the triggers bump on user
//! updates. A replayed UPDATE is refused on a target whose row is already
//! newer, and the refusal is reported as a conflict. Writes made by the
//! replication worker login are never captured, so replays do not echo.
//!
//! # Features
//!
//! - Capture trigger generation for MySQL, Oracle, PostgreSQL and SQL Server
//! - Poll-driven replay with per-target conflict detection
//! - Cron-driven recovery of recently failed changes
//! - Conflict alerts to the log or a webhook
//! - Encrypted node registry and operator tooling

pub mod admin;
pub mod api;
pub mod changelog;
pub mod config;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod provider;
pub mod registry;
pub mod replication;
pub mod trigger;

#[cfg(test)]
pub(crate) mod testing;

pub use config::SyncMeshConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::changelog::{ChangeLog, ChangeRecord, EventStatus, Operation};
    pub use crate::config::SyncMeshConfig;
    pub use crate::dialect::DatabaseKind;
    pub use crate::error::{Error, Result};
    pub use crate::executor::{QueryOptions, RowData, SqlHandle, Value};
    pub use crate::provider::{ConnectionProvider, PoolProvider, Role};
    pub use crate::registry::{ConfigStore, NodeDescriptor, NodeRegistry, SqliteRegistry};
    pub use crate::replication::{CycleReport, RecoveryJob, SweepReport, SyncEngine};
    pub use crate::trigger::{generate_triggers, TriggerOptions};
}
