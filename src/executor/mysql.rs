//! MySQL Executor
//!
//! Runs replicated statements against MySQL and MariaDB nodes.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use rust_decimal::Decimal;
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlPoolOptions, MySqlRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Column, MySql, MySqlPool, Row, TypeInfo};

use super::{preview, QueryOptions, RowData, SqlHandle, Value};
use crate::dialect::DatabaseKind;
use crate::error::{Error, Result};

/// MySQL executor backed by a connection pool
pub struct MySqlExecutor {
    pool: MySqlPool,
}

impl MySqlExecutor {
    /// Connect a pool to `url` as `username`
    pub async fn connect(
        url: &str,
        username: &str,
        password: &str,
        max_connections: u32,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let options = MySqlConnectOptions::from_str(url)?
            .username(username)
            .password(password);

        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SqlHandle for MySqlExecutor {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::MySql
    }

    async fn query(&self, sql: &str, params: &[Value], opts: &QueryOptions) -> Result<Vec<RowData>> {
        if opts.max_rows == Some(0) {
            return Ok(Vec::new());
        }
        tracing::debug!("Query: {}", preview(sql));

        let fetch = async {
            let mut stream = bind_all(sqlx::query(sql), params).fetch(&self.pool);
            let mut rows = Vec::new();
            while let Some(row) = stream.try_next().await.map_err(|e| failed(sql, e))? {
                rows.push(decode_row(&row)?);
                if opts.max_rows.is_some_and(|max| rows.len() >= max) {
                    break;
                }
            }
            Ok::<_, Error>(rows)
        };

        tokio::time::timeout(opts.timeout, fetch)
            .await
            .map_err(|_| Error::Timeout(opts.timeout_ms()))?
    }

    async fn execute(&self, sql: &str, params: &[Value], opts: &QueryOptions) -> Result<u64> {
        tracing::debug!("Executing: {}", preview(sql));

        let result = tokio::time::timeout(
            opts.timeout,
            bind_all(sqlx::query(sql), params).execute(&self.pool),
        )
        .await
        .map_err(|_| Error::Timeout(opts.timeout_ms()))?
        .map_err(|e| failed(sql, e))?;

        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<bool> {
        let result: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(result.0 == 1)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn failed(sql: &str, e: sqlx::Error) -> Error {
    Error::QueryExecution(format!("Failed to execute '{}...': {}", preview(sql), e))
}

fn bind_all<'q>(
    mut query: Query<'q, MySql, MySqlArguments>,
    params: &'q [Value],
) -> Query<'q, MySql, MySqlArguments> {
    for value in params {
        query = match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Int(i) => query.bind(*i),
            Value::UInt(u) => query.bind(*u),
            Value::Float(f) => query.bind(*f),
            Value::Decimal(d) => query.bind(*d),
            Value::String(s) => query.bind(s.as_str()),
            Value::Bytes(b) => query.bind(b.as_slice()),
            Value::Uuid(u) => query.bind(u.to_string()),
            Value::Timestamp(t) => query.bind(*t),
            Value::DateTime(t) => query.bind(*t),
            Value::Date(d) => query.bind(*d),
            Value::Time(t) => query.bind(*t),
            Value::Json(j) => query.bind(j.to_string()),
        };
    }
    query
}

macro_rules! decode_as {
    ($row:expr, $idx:expr, $ty:ty, $wrap:expr) => {
        if let Ok(v) = $row.try_get::<Option<$ty>, _>($idx) {
            return Ok(v.map($wrap).unwrap_or(Value::Null));
        }
    };
}

fn decode_row(row: &MySqlRow) -> Result<RowData> {
    let mut data = RowData::new();
    for (index, column) in row.columns().iter().enumerate() {
        data.push(column.name(), decode_column(row, index)?);
    }
    Ok(data)
}

fn decode_column(row: &MySqlRow, index: usize) -> Result<Value> {
    let type_name = row.column(index).type_info().name();

    if type_name == "DECIMAL" {
        return row
            .try_get::<Option<Decimal>, _>(index)
            .map(|v| v.map(Value::Decimal).unwrap_or(Value::Null))
            .map_err(|e| Error::QueryExecution(format!("Cannot decode DECIMAL column {}: {}", row.column(index).name(), e)));
    }

    if matches!(type_name, "ENUM" | "SET") {
        return row
            .try_get_unchecked::<Option<String>, _>(index)
            .map(|v| v.map(Value::String).unwrap_or(Value::Null))
            .map_err(|e| Error::QueryExecution(format!("Cannot decode {} column: {}", type_name, e)));
    }

    decode_as!(row, index, i64, Value::Int);
    decode_as!(row, index, u64, Value::UInt);
    decode_as!(row, index, f64, Value::Float);
    decode_as!(row, index, f32, |v: f32| Value::Float(v as f64));
    decode_as!(row, index, String, Value::String);
    decode_as!(row, index, chrono::NaiveDateTime, Value::DateTime);
    decode_as!(row, index, chrono::NaiveDate, Value::Date);
    decode_as!(row, index, chrono::NaiveTime, Value::Time);
    decode_as!(row, index, Json<serde_json::Value>, |v: Json<serde_json::Value>| Value::Json(v.0));
    decode_as!(row, index, Vec<u8>, Value::Bytes);

    Err(Error::QueryExecution(format!(
        "Unsupported column type {} for column {}",
        type_name,
        row.column(index).name()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_executor() -> MySqlExecutor {
        let options = MySqlConnectOptions::new()
            .host("127.0.0.1")
            .port(1)
            .username("dbsyncer");
        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_millis(500))
            .connect_lazy_with(options);
        MySqlExecutor::from_pool(pool)
    }

    #[tokio::test]
    async fn test_kind_and_unreachable_node() {
        let executor = unreachable_executor();
        assert_eq!(executor.kind(), DatabaseKind::MySql);
        assert!(executor.health_check().await.is_err());

        let err = executor
            .execute("DELETE FROM users WHERE id = ?", &[Value::Int(1)], &QueryOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_zero_row_limit_skips_round_trip() {
        let executor = unreachable_executor();
        let opts = QueryOptions::default().with_max_rows(0);
        let rows = executor.query("SELECT * FROM users", &[], &opts).await.unwrap();
        assert!(rows.is_empty());
    }
}
