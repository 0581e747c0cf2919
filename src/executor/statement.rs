//! Row-level statement builders
//!
//! Values are always bound as parameters. Table and column names are
//! spliced into the text, so every identifier is checked first.

use super::{RowData, Value};
use crate::dialect::{is_safe_identifier, DatabaseKind};
use crate::error::{Error, Result};

/// SQL text plus its bind parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Collects parameters and renders placeholders in order
struct Binder {
    kind: DatabaseKind,
    params: Vec<Value>,
}

impl Binder {
    fn new(kind: DatabaseKind) -> Self {
        Self {
            kind,
            params: Vec::new(),
        }
    }

    /// NULL is written as a keyword so postgres never sees an untyped text NULL
    fn bind(&mut self, value: &Value) -> String {
        if value.is_null() {
            return "NULL".to_string();
        }
        self.params.push(value.clone());
        self.kind.placeholder(self.params.len())
    }

    fn key_predicate(&mut self, pk_column: &str, pk_value: &str) -> String {
        self.params.push(Value::String(pk_value.to_string()));
        self.kind.text_predicate(pk_column, self.params.len())
    }

    fn finish(self, sql: String) -> Statement {
        Statement {
            sql,
            params: self.params,
        }
    }
}

fn check_identifier(name: &str) -> Result<()> {
    if is_safe_identifier(name) {
        Ok(())
    } else {
        Err(Error::Validation(format!("Invalid identifier: {:?}", name)))
    }
}

/// `SELECT *` for one row by primary key
pub fn select_row(kind: DatabaseKind, table: &str, pk_column: &str, pk_value: &str) -> Result<Statement> {
    check_identifier(table)?;
    check_identifier(pk_column)?;

    let mut binder = Binder::new(kind);
    let predicate = binder.key_predicate(pk_column, pk_value);
    Ok(binder.finish(format!("SELECT * FROM {} WHERE {}", table, predicate)))
}

/// Read only the version column of one row
pub fn select_version(
    kind: DatabaseKind,
    table: &str,
    pk_column: &str,
    version_column: &str,
    pk_value: &str,
) -> Result<Statement> {
    check_identifier(table)?;
    check_identifier(pk_column)?;
    check_identifier(version_column)?;

    let mut binder = Binder::new(kind);
    let predicate = binder.key_predicate(pk_column, pk_value);
    Ok(binder.finish(format!(
        "SELECT {} FROM {} WHERE {}",
        version_column, table, predicate
    )))
}

/// UPDATE every non-key column of `row`.
///
/// Returns `None` when the row has nothing besides the key.
pub fn update_row(
    kind: DatabaseKind,
    table: &str,
    pk_column: &str,
    pk_value: &str,
    row: &RowData,
) -> Result<Option<Statement>> {
    check_identifier(table)?;
    check_identifier(pk_column)?;

    let mut binder = Binder::new(kind);
    let mut assignments = Vec::new();
    for (column, value) in row.iter().filter(|(c, _)| !c.eq_ignore_ascii_case(pk_column)) {
        check_identifier(column)?;
        assignments.push(format!("{} = {}", column, binder.bind(value)));
    }

    if assignments.is_empty() {
        return Ok(None);
    }

    let predicate = binder.key_predicate(pk_column, pk_value);
    Ok(Some(binder.finish(format!(
        "UPDATE {} SET {} WHERE {}",
        table,
        assignments.join(", "),
        predicate
    ))))
}

/// INSERT every column of `row`
pub fn insert_row(kind: DatabaseKind, table: &str, row: &RowData) -> Result<Statement> {
    check_identifier(table)?;
    if row.is_empty() {
        return Err(Error::Validation(format!("Nothing to insert into {}", table)));
    }

    let mut binder = Binder::new(kind);
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());
    for (column, value) in row.iter() {
        check_identifier(column)?;
        columns.push(column);
        values.push(binder.bind(value));
    }

    Ok(binder.finish(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        values.join(", ")
    )))
}

/// DELETE one row by primary key
pub fn delete_row(kind: DatabaseKind, table: &str, pk_column: &str, pk_value: &str) -> Result<Statement> {
    check_identifier(table)?;
    check_identifier(pk_column)?;

    let mut binder = Binder::new(kind);
    let predicate = binder.key_predicate(pk_column, pk_value);
    Ok(binder.finish(format!("DELETE FROM {} WHERE {}", table, predicate)))
}
