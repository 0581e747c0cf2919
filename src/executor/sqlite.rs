//! In-memory SQLite handle for tests.
//!
//! Reports itself as MySQL: `?` placeholders and plain key predicates are
//! valid SQLite, so the replication code runs unchanged against it.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::Connection;
use tokio::sync::Mutex;

use super::{QueryOptions, RowData, SqlHandle, Value};
use crate::dialect::DatabaseKind;
use crate::error::{Error, Result};

pub(crate) struct SqliteExecutor {
    conn: Mutex<Connection>,
    executed: std::sync::Mutex<Vec<String>>,
    offline: AtomicBool,
}

impl SqliteExecutor {
    pub fn in_memory() -> Self {
        Self {
            conn: Mutex::new(Connection::open_in_memory().expect("open in-memory sqlite")),
            executed: std::sync::Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Run fixture SQL directly, bypassing the statement log
    pub async fn setup(&self, sql: &str) {
        self.conn.lock().await.execute_batch(sql).expect("fixture sql");
    }

    /// Every statement run through the handle so far
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    /// Make every later statement fail like a dropped connection
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn record(&self, sql: &str) -> Result<()> {
        self.executed.lock().unwrap().push(sql.to_string());
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::QueryExecution("connection refused".into()));
        }
        Ok(())
    }
}

fn to_sqlite(value: &Value) -> SqliteValue {
    match value {
        Value::Null => SqliteValue::Null,
        Value::Bool(b) => SqliteValue::Integer(*b as i64),
        Value::Int(i) => SqliteValue::Integer(*i),
        Value::UInt(u) => SqliteValue::Integer(*u as i64),
        Value::Float(f) => SqliteValue::Real(*f),
        Value::String(s) => SqliteValue::Text(s.clone()),
        Value::Bytes(b) => SqliteValue::Blob(b.clone()),
        Value::DateTime(t) => SqliteValue::Text(t.format("%Y-%m-%d %H:%M:%S").to_string()),
        other => SqliteValue::Text(other.to_string()),
    }
}

fn from_sqlite(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

#[async_trait]
impl SqlHandle for SqliteExecutor {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::MySql
    }

    async fn query(&self, sql: &str, params: &[Value], opts: &QueryOptions) -> Result<Vec<RowData>> {
        self.record(sql)?;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(sql)?;
        let names: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let bound: Vec<SqliteValue> = params.iter().map(to_sqlite).collect();

        let mut rows = stmt.query(rusqlite::params_from_iter(bound))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            if opts.max_rows.is_some_and(|max| out.len() >= max) {
                break;
            }
            let mut data = RowData::new();
            for (i, name) in names.iter().enumerate() {
                data.push(name.clone(), from_sqlite(row.get_ref(i)?));
            }
            out.push(data);
        }
        Ok(out)
    }

    async fn execute(&self, sql: &str, params: &[Value], _opts: &QueryOptions) -> Result<u64> {
        self.record(sql)?;
        let conn = self.conn.lock().await;
        let bound: Vec<SqliteValue> = params.iter().map(to_sqlite).collect();
        let changed = conn.execute(sql, rusqlite::params_from_iter(bound))?;
        Ok(changed as u64)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.offline.load(Ordering::SeqCst))
    }

    async fn close(&self) {}
}
