//! PostgreSQL Executor

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Column, PgPool, Postgres, Row, TypeInfo};

use super::{preview, QueryOptions, RowData, SqlHandle, Value};
use crate::dialect::DatabaseKind;
use crate::error::{Error, Result};

/// PostgreSQL executor backed by a connection pool
pub struct PostgresExecutor {
    pool: PgPool,
}

impl PostgresExecutor {
    /// Connect a pool to `url` as `username`
    pub async fn connect(
        url: &str,
        username: &str,
        password: &str,
        max_connections: u32,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let options = PgConnectOptions::from_str(url)?
            .username(username)
            .password(password);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SqlHandle for PostgresExecutor {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Postgres
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
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for value in params {
        query = match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Int(i) => query.bind(*i),
            // No unsigned types in postgres
            Value::UInt(u) => match i64::try_from(*u) {
                Ok(i) => query.bind(i),
                Err(_) => query.bind(u.to_string()),
            },
            Value::Float(f) => query.bind(*f),
            Value::Decimal(d) => query.bind(*d),
            Value::String(s) => query.bind(s.as_str()),
            Value::Bytes(b) => query.bind(b.as_slice()),
            Value::Uuid(u) => query.bind(*u),
            Value::Timestamp(t) => query.bind(*t),
            Value::DateTime(t) => query.bind(*t),
            Value::Date(d) => query.bind(*d),
            Value::Time(t) => query.bind(*t),
            Value::Json(j) => query.bind(Json(j.clone())),
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

fn decode_row(row: &PgRow) -> Result<RowData> {
    let mut data = RowData::new();
    for (index, column) in row.columns().iter().enumerate() {
        data.push(column.name(), decode_column(row, index)?);
    }
    Ok(data)
}

fn decode_column(row: &PgRow, index: usize) -> Result<Value> {
    let type_name = row.column(index).type_info().name();

    if type_name == "NUMERIC" {
        return row
            .try_get::<Option<Decimal>, _>(index)
            .map(|v| v.map(Value::Decimal).unwrap_or(Value::Null))
            .map_err(|e| Error::QueryExecution(format!("Cannot decode NUMERIC column {}: {}", row.column(index).name(), e)));
    }

    decode_as!(row, index, bool, Value::Bool);
    decode_as!(row, index, i16, |v: i16| Value::Int(v as i64));
    decode_as!(row, index, i32, |v: i32| Value::Int(v as i64));
    decode_as!(row, index, i64, Value::Int);
    decode_as!(row, index, f32, |v: f32| Value::Float(v as f64));
    decode_as!(row, index, f64, Value::Float);
    decode_as!(row, index, String, Value::String);
    decode_as!(row, index, chrono::NaiveDateTime, Value::DateTime);
    decode_as!(row, index, chrono::DateTime<chrono::Utc>, Value::Timestamp);
    decode_as!(row, index, chrono::NaiveDate, Value::Date);
    decode_as!(row, index, chrono::NaiveTime, Value::Time);
    decode_as!(row, index, uuid::Uuid, Value::Uuid);
    decode_as!(row, index, Json<serde_json::Value>, |v: Json<serde_json::Value>| Value::Json(v.0));
    decode_as!(row, index, Vec<u8>, Value::Bytes);

    Err(Error::QueryExecution(format!(
        "Unsupported column type {} for column {}",
        type_name,
        row.column(index).name()
    )))
}
