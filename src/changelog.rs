//! Change Log Store
//!
//! Per-node table of captured row changes. Rows are written by the capture
//! triggers and only ever change status afterwards; nothing is deleted.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dialect::{is_safe_identifier, DatabaseKind};
use crate::error::{Error, Result};
use crate::executor::{QueryOptions, RowData, SqlHandle, Value};

/// Longest error message persisted before truncation
pub const MAX_ERROR_LEN: usize = 500;

/// Error message written by an administrative skip
pub const SKIPPED_MESSAGE: &str = "[skipped by administrator]";

const RECORD_COLUMNS: &str =
    "id, table_name, op_type, pk_column_name, pk_value, status, op_time, source_db_type, error_msg, data_version";

/// Processing status of a change record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventStatus {
    Pending,
    Success,
    Failed,
}

impl EventStatus {
    /// Integer code stored in the `status` column
    pub fn code(&self) -> i64 {
        match self {
            EventStatus::Pending => 0,
            EventStatus::Success => 1,
            EventStatus::Failed => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(EventStatus::Pending),
            1 => Some(EventStatus::Success),
            2 => Some(EventStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventStatus::Pending => f.write_str("PENDING"),
            EventStatus::Success => f.write_str("SUCCESS"),
            EventStatus::Failed => f.write_str("FAILED"),
        }
    }
}

impl std::str::FromStr for EventStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" | "0" => Ok(EventStatus::Pending),
            "SUCCESS" | "1" => Ok(EventStatus::Success),
            "FAILED" | "FAIL" | "2" => Ok(EventStatus::Failed),
            other => Err(Error::Validation(format!("Unknown event status: {}", other))),
        }
    }
}

/// Captured row operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    /// Parse the `op_type` column (case-insensitive)
    pub fn parse(op: &str) -> Result<Self> {
        match op.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Operation::Insert),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            _ => Err(Error::UnknownOperation(op.to_string())),
        }
    }

    /// Whether replay needs the current source row
    pub fn needs_row(&self) -> bool {
        matches!(self, Operation::Insert | Operation::Update)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

/// One row of the change log.
///
/// Fields the triggers fill are optional here so malformed rows can be
/// loaded and rejected instead of failing the whole batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: i64,
    pub table_name: Option<String>,
    pub op_type: Option<String>,
    pub pk_column_name: Option<String>,
    pub pk_value: Option<String>,
    pub status: Option<EventStatus>,
    pub op_time: Option<chrono::NaiveDateTime>,
    pub source_db_type: Option<String>,
    pub error_msg: Option<String>,
    pub data_version: Option<i64>,
}

impl ChangeRecord {
    fn from_row(row: &RowData) -> Result<Self> {
        let text = |column: &str| {
            row.get(column)
                .and_then(Value::as_text)
                .filter(|s| !s.trim().is_empty())
        };

        let id = row
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::QueryExecution("Change record without id".into()))?;

        Ok(Self {
            id,
            table_name: text("table_name"),
            op_type: text("op_type"),
            pk_column_name: text("pk_column_name"),
            pk_value: row.get("pk_value").and_then(Value::as_text),
            status: row
                .get("status")
                .and_then(Value::as_i64)
                .and_then(EventStatus::from_code),
            op_time: row.get("op_time").and_then(as_datetime),
            source_db_type: text("source_db_type"),
            error_msg: text("error_msg"),
            data_version: row.get("data_version").and_then(Value::as_i64),
        })
    }

    /// Fields every replay needs, or `None` if any is missing
    pub fn required_fields(&self) -> Option<(&str, &str, &str, &str)> {
        Some((
            self.table_name.as_deref()?,
            self.op_type.as_deref()?,
            self.pk_column_name.as_deref()?,
            self.pk_value.as_deref().filter(|v| !v.is_empty())?,
        ))
    }
}

fn as_datetime(value: &Value) -> Option<chrono::NaiveDateTime> {
    match value {
        Value::DateTime(t) => Some(*t),
        Value::Timestamp(t) => Some(t.naive_utc()),
        Value::String(s) => chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok(),
        _ => None,
    }
}

/// Cut a message down to [`MAX_ERROR_LEN`] characters plus an ellipsis
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_LEN) {
        Some((cut, _)) => format!("{}...", &message[..cut]),
        None => message.to_string(),
    }
}

/// Per-status counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStats {
    pub pending: u64,
    pub success: u64,
    pub failed: u64,
    pub total: u64,
}

/// Change log of one node, accessed through that node's SQL handle
pub struct ChangeLog {
    node_id: i64,
    handle: Arc<dyn SqlHandle>,
    table: String,
    opts: QueryOptions,
}

impl ChangeLog {
    pub fn new(node_id: i64, handle: Arc<dyn SqlHandle>, table: &str, opts: QueryOptions) -> Result<Self> {
        if !is_safe_identifier(table) {
            return Err(Error::Config(format!("Invalid change log table name: {}", table)));
        }
        Ok(Self {
            node_id,
            handle,
            table: table.to_string(),
            opts,
        })
    }

    fn kind(&self) -> DatabaseKind {
        self.handle.kind()
    }

    /// Oldest pending records first
    pub async fn select_pending(&self, limit: usize) -> Result<Vec<ChangeRecord>> {
        let base = format!(
            "SELECT {} FROM {} WHERE status = {} ORDER BY id ASC",
            RECORD_COLUMNS,
            self.table,
            self.kind().placeholder(1)
        );
        let sql = self.kind().paginate(&base, 0, limit as u64);
        let rows = self
            .handle
            .query(&sql, &[Value::Int(EventStatus::Pending.code())], &self.opts.with_max_rows(limit))
            .await?;
        rows.iter().map(ChangeRecord::from_row).collect()
    }

    pub async fn mark_success(&self, id: i64) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = {}, error_msg = NULL WHERE id = {}",
            self.table,
            self.kind().placeholder(1),
            self.kind().placeholder(2)
        );
        self.handle
            .execute(&sql, &[Value::Int(EventStatus::Success.code()), Value::Int(id)], &self.opts)
            .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: i64, message: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = {}, error_msg = {} WHERE id = {}",
            self.table,
            self.kind().placeholder(1),
            self.kind().placeholder(2),
            self.kind().placeholder(3)
        );
        let params = [
            Value::Int(EventStatus::Failed.code()),
            Value::String(truncate_error(message)),
            Value::Int(id),
        ];
        self.handle.execute(&sql, &params, &self.opts).await?;
        Ok(())
    }

    /// Failed records captured after `window_start` go back to pending
    pub async fn reset_failed_since(&self, window_start: chrono::NaiveDateTime) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET status = {}, error_msg = NULL WHERE status = {} AND op_time > {}",
            self.table,
            self.kind().placeholder(1),
            self.kind().placeholder(2),
            self.kind().placeholder(3)
        );
        let params = [
            Value::Int(EventStatus::Pending.code()),
            Value::Int(EventStatus::Failed.code()),
            Value::DateTime(window_start),
        ];
        self.handle.execute(&sql, &params, &self.opts).await
    }

    /// Put one record back to pending
    pub async fn retry(&self, id: i64) -> Result<()> {
        let sql = format!(
            "SELECT COUNT(*) AS cnt FROM {} WHERE id = {}",
            self.table,
            self.kind().placeholder(1)
        );
        let rows = self.handle.query(&sql, &[Value::Int(id)], &self.opts).await?;
        let count = rows
            .first()
            .and_then(|r| r.get_index(0))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        if count == 0 {
            return Err(Error::EventNotFound {
                node_id: self.node_id,
                event_id: id,
            });
        }

        let sql = format!(
            "UPDATE {} SET status = {}, error_msg = NULL WHERE id = {}",
            self.table,
            self.kind().placeholder(1),
            self.kind().placeholder(2)
        );
        self.handle
            .execute(&sql, &[Value::Int(EventStatus::Pending.code()), Value::Int(id)], &self.opts)
            .await?;
        Ok(())
    }

    /// Mark one record done without replaying it
    pub async fn skip(&self, id: i64) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = {}, error_msg = {} WHERE id = {}",
            self.table,
            self.kind().placeholder(1),
            self.kind().placeholder(2),
            self.kind().placeholder(3)
        );
        let params = [
            Value::Int(EventStatus::Success.code()),
            Value::from(SKIPPED_MESSAGE),
            Value::Int(id),
        ];
        let changed = self.handle.execute(&sql, &params, &self.opts).await?;
        if changed == 0 {
            return Err(Error::EventNotFound {
                node_id: self.node_id,
                event_id: id,
            });
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<EventStats> {
        // COUNT(CASE ...) stays an integer on every dialect, SUM does not
        let sql = format!(
            "SELECT COUNT(*) AS total, \
             COUNT(CASE WHEN status = 0 THEN 1 END) AS pending, \
             COUNT(CASE WHEN status = 1 THEN 1 END) AS success, \
             COUNT(CASE WHEN status = 2 THEN 1 END) AS failed \
             FROM {}",
            self.table
        );
        let rows = self.handle.query(&sql, &[], &self.opts).await?;
        let Some(row) = rows.first() else {
            return Ok(EventStats::default());
        };
        let count = |column: &str| row.get(column).and_then(Value::as_i64).unwrap_or(0).max(0) as u64;

        Ok(EventStats {
            pending: count("pending"),
            success: count("success"),
            failed: count("failed"),
            total: count("total"),
        })
    }

    /// Newest records first. `page` starts at 1.
    pub async fn list(&self, status: Option<EventStatus>, page: u64, size: u64) -> Result<Vec<ChangeRecord>> {
        let size = size.clamp(1, 1000);
        let offset = page.saturating_sub(1) * size;

        let mut params = Vec::new();
        let mut base = format!("SELECT {} FROM {}", RECORD_COLUMNS, self.table);
        if let Some(status) = status {
            params.push(Value::Int(status.code()));
            base.push_str(&format!(" WHERE status = {}", self.kind().placeholder(1)));
        }
        base.push_str(" ORDER BY id DESC");

        let sql = self.kind().paginate(&base, offset, size);
        let rows = self
            .handle
            .query(&sql, &params, &self.opts.with_max_rows(size as usize))
            .await?;
        rows.iter().map(ChangeRecord::from_row).collect()
    }
}
