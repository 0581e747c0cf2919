//! Database Dialects
//!
//! Per-kind metadata for every database family a node can run on. All
//! dialect differences are data on [`Dialect`]; callers format URLs,
//! placeholders and pagination through the generic routines below.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Database family of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatabaseKind {
    #[serde(rename = "MYSQL", alias = "mysql")]
    MySql,
    #[serde(rename = "ORACLE", alias = "oracle")]
    Oracle,
    #[serde(rename = "POSTGRESQL", alias = "postgresql", alias = "postgres")]
    Postgres,
    #[serde(rename = "SQL_SERVER", alias = "sql_server", alias = "sqlserver")]
    SqlServer,
}

/// How a query is limited to one page of rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    /// `LIMIT n OFFSET m`
    LimitOffset,
    /// `OFFSET m ROWS FETCH NEXT n ROWS ONLY`
    OffsetFetch,
}

/// Bind parameter syntax
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// `?`
    Question,
    /// `$1`, `$2`, ...
    Dollar,
    /// `:1`, `:2`, ...
    Colon,
    /// `@P1`, `@P2`, ...
    AtP,
}

/// Static description of one database family
#[derive(Debug)]
pub struct Dialect {
    /// Stable code stored in `source_db_type`
    pub code: &'static str,
    pub description: &'static str,
    /// Driver identity (URL scheme)
    pub driver: &'static str,
    /// Connection URL with `{host}`, `{port}` and `{database}` slots
    pub url_template: &'static str,
    pub default_port: u16,
    /// Lists user tables; first column is the table name
    pub table_list_query: &'static str,
    pub pagination: Pagination,
    pub placeholder: Placeholder,
    /// Wraps a column so it compares against a bound text value.
    /// `{col}` is the column, `{param}` the placeholder.
    pub text_compare: &'static str,
    /// Whether the connection provider can open this kind at runtime
    pub runtime_driver: bool,
}

static MYSQL: Dialect = Dialect {
    code: "MYSQL",
    description: "MySQL / MariaDB",
    driver: "mysql",
    url_template: "mysql://{host}:{port}/{database}",
    default_port: 3306,
    table_list_query: "SHOW TABLES",
    pagination: Pagination::LimitOffset,
    placeholder: Placeholder::Question,
    text_compare: "{col} = {param}",
    runtime_driver: true,
};

static ORACLE: Dialect = Dialect {
    code: "ORACLE",
    description: "Oracle Database",
    driver: "oracle",
    url_template: "oracle://{host}:{port}/{database}",
    default_port: 1521,
    table_list_query: "SELECT TABLE_NAME FROM USER_TABLES",
    pagination: Pagination::OffsetFetch,
    placeholder: Placeholder::Colon,
    text_compare: "TO_CHAR({col}) = {param}",
    runtime_driver: false,
};

static POSTGRES: Dialect = Dialect {
    code: "POSTGRESQL",
    description: "PostgreSQL",
    driver: "postgres",
    url_template: "postgres://{host}:{port}/{database}",
    default_port: 5432,
    table_list_query: "SELECT tablename FROM pg_tables WHERE schemaname = 'public'",
    pagination: Pagination::LimitOffset,
    placeholder: Placeholder::Dollar,
    text_compare: "CAST({col} AS TEXT) = {param}",
    runtime_driver: true,
};

static SQL_SERVER: Dialect = Dialect {
    code: "SQL_SERVER",
    description: "Microsoft SQL Server",
    driver: "mssql",
    url_template: "mssql://{host}:{port}/{database}",
    default_port: 1433,
    table_list_query: "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_TYPE = 'BASE TABLE'",
    pagination: Pagination::OffsetFetch,
    placeholder: Placeholder::AtP,
    text_compare: "CAST({col} AS NVARCHAR(255)) = {param}",
    runtime_driver: false,
};

impl DatabaseKind {
    /// All supported kinds
    pub const ALL: [DatabaseKind; 4] = [
        DatabaseKind::MySql,
        DatabaseKind::Oracle,
        DatabaseKind::Postgres,
        DatabaseKind::SqlServer,
    ];

    /// Static descriptor for this kind
    pub fn dialect(&self) -> &'static Dialect {
        match self {
            DatabaseKind::MySql => &MYSQL,
            DatabaseKind::Oracle => &ORACLE,
            DatabaseKind::Postgres => &POSTGRES,
            DatabaseKind::SqlServer => &SQL_SERVER,
        }
    }

    /// Stable code, e.g. `MYSQL`
    pub fn code(&self) -> &'static str {
        self.dialect().code
    }

    /// Parse a stored code (case-insensitive)
    pub fn from_code(code: &str) -> Result<Self> {
        let code = code.trim();
        Self::ALL
            .into_iter()
            .find(|k| {
                k.code().eq_ignore_ascii_case(code) || k.dialect().driver.eq_ignore_ascii_case(code)
            })
            .ok_or_else(|| Error::Config(format!("Unsupported database kind: {}", code)))
    }

    /// Build the connection URL for a node
    pub fn format_url(&self, host: &str, port: u16, database: &str) -> String {
        self.dialect()
            .url_template
            .replace("{host}", host)
            .replace("{port}", &port.to_string())
            .replace("{database}", database)
    }

    /// Render the `n`th (1-based) bind placeholder
    pub fn placeholder(&self, n: usize) -> String {
        match self.dialect().placeholder {
            Placeholder::Question => "?".to_string(),
            Placeholder::Dollar => format!("${}", n),
            Placeholder::Colon => format!(":{}", n),
            Placeholder::AtP => format!("@P{}", n),
        }
    }

    /// Predicate comparing `column` to the `n`th placeholder bound as text
    pub fn text_predicate(&self, column: &str, n: usize) -> String {
        self.dialect()
            .text_compare
            .replace("{col}", column)
            .replace("{param}", &self.placeholder(n))
    }

    /// Append this dialect's pagination clause. `sql` must already be ordered.
    pub fn paginate(&self, sql: &str, offset: u64, limit: u64) -> String {
        match self.dialect().pagination {
            Pagination::LimitOffset => format!("{} LIMIT {} OFFSET {}", sql, limit, offset),
            Pagination::OffsetFetch => {
                format!("{} OFFSET {} ROWS FETCH NEXT {} ROWS ONLY", sql, offset, limit)
            }
        }
    }
}

impl std::fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl std::str::FromStr for DatabaseKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_code(s)
    }
}

/// Check that `name` is a plain SQL identifier (optionally schema-qualified).
///
/// Identifiers are spliced into statement text, so anything outside
/// `[A-Za-z0-9_$.]` (or starting with a digit) is rejected.
pub fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && !name.starts_with(|c: char| c.is_ascii_digit() || c == '.')
        && !name.ends_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_url() {
        assert_eq!(
            DatabaseKind::MySql.format_url("10.0.0.5", 3306, "shop"),
            "mysql://10.0.0.5:3306/shop"
        );
        assert_eq!(
            DatabaseKind::Postgres.format_url("db", 5433, "app"),
            "postgres://db:5433/app"
        );
    }

    #[test]
    fn test_from_code() {
        assert_eq!(DatabaseKind::from_code("mysql").unwrap(), DatabaseKind::MySql);
        assert_eq!(DatabaseKind::from_code("POSTGRESQL").unwrap(), DatabaseKind::Postgres);
        assert_eq!(DatabaseKind::from_code("postgres").unwrap(), DatabaseKind::Postgres);
        assert_eq!(DatabaseKind::from_code("sql_server").unwrap(), DatabaseKind::SqlServer);
        assert!(DatabaseKind::from_code("db2").is_err());

        for kind in DatabaseKind::ALL {
            assert_eq!(DatabaseKind::from_code(kind.code()).unwrap(), kind);
        }
    }

    #[test]
    fn test_placeholders_and_predicates() {
        assert_eq!(DatabaseKind::MySql.placeholder(3), "?");
        assert_eq!(DatabaseKind::Postgres.placeholder(3), "$3");
        assert_eq!(DatabaseKind::Oracle.placeholder(2), ":2");
        assert_eq!(DatabaseKind::SqlServer.placeholder(1), "@P1");

        assert_eq!(DatabaseKind::MySql.text_predicate("id", 1), "id = ?");
        assert_eq!(DatabaseKind::Postgres.text_predicate("id", 2), "CAST(id AS TEXT) = $2");
    }

    #[test]
    fn test_paginate() {
        let base = "SELECT * FROM sync_event ORDER BY id DESC";
        assert_eq!(
            DatabaseKind::Postgres.paginate(base, 20, 10),
            "SELECT * FROM sync_event ORDER BY id DESC LIMIT 10 OFFSET 20"
        );
        assert_eq!(
            DatabaseKind::SqlServer.paginate(base, 20, 10),
            "SELECT * FROM sync_event ORDER BY id DESC OFFSET 20 ROWS FETCH NEXT 10 ROWS ONLY"
        );
    }

    #[test]
    fn test_serde_codes() {
        let json = serde_json::to_string(&DatabaseKind::SqlServer).unwrap();
        assert_eq!(json, "\"SQL_SERVER\"");
        let kind: DatabaseKind = serde_json::from_str("\"postgres\"").unwrap();
        assert_eq!(kind, DatabaseKind::Postgres);
    }

    #[test]
    fn test_safe_identifier() {
        assert!(is_safe_identifier("users"));
        assert!(is_safe_identifier("public.order_items"));
        assert!(is_safe_identifier("sync_version"));
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier("1users"));
        assert!(!is_safe_identifier("users; DROP TABLE x"));
        assert!(!is_safe_identifier("name'--"));
        assert!(!is_safe_identifier("schema."));
    }
}
