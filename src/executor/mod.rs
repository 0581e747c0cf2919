//! Database Executor Module
//!
//! Live SQL handles for the node databases. Every replicated read and
//! write goes through [`SqlHandle`], whatever the database family.

mod mysql;
mod postgres;
#[cfg(test)]
pub(crate) mod sqlite;
pub mod statement;
mod value;

use std::time::Duration;

use async_trait::async_trait;

use crate::dialect::DatabaseKind;
use crate::error::Result;

pub use mysql::MySqlExecutor;
pub use postgres::PostgresExecutor;
pub use value::{RowData, Value};

/// Per-call query limits.
///
/// Passed by value to every statement; handles never keep limits of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// Stop reading after this many rows
    pub max_rows: Option<usize>,
    /// Upper bound for the whole statement
    pub timeout: Duration,
}

impl QueryOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            max_rows: None,
            timeout,
        }
    }

    /// Same timeout, limited to `max_rows` rows
    pub fn with_max_rows(self, max_rows: usize) -> Self {
        Self {
            max_rows: Some(max_rows),
            ..self
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// An open connection (or pool) to one node database
#[async_trait]
pub trait SqlHandle: Send + Sync {
    /// Database family, used for placeholder and pagination syntax
    fn kind(&self) -> DatabaseKind;

    /// Run a row-returning statement
    async fn query(&self, sql: &str, params: &[Value], opts: &QueryOptions) -> Result<Vec<RowData>>;

    /// Run a statement and return the affected row count
    async fn execute(&self, sql: &str, params: &[Value], opts: &QueryOptions) -> Result<u64>;

    /// Check if connection is healthy
    async fn health_check(&self) -> Result<bool>;

    /// Release the underlying connections
    async fn close(&self);
}

/// Shorten a statement for log and error messages
pub(crate) fn preview(sql: &str) -> &str {
    match sql.char_indices().nth(80) {
        Some((i, _)) => &sql[..i],
        None => sql,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_options() {
        let opts = QueryOptions::new(Duration::from_secs(5)).with_max_rows(10);
        assert_eq!(opts.max_rows, Some(10));
        assert_eq!(opts.timeout_ms(), 5000);
        assert_eq!(QueryOptions::default().max_rows, None);
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview("SELECT 1"), "SELECT 1");
        let long = "x".repeat(200);
        assert_eq!(preview(&long).len(), 80);
    }
}
