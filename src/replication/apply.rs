//! Conflict detection and apply
//!
//! Replays one change record against one target node.

use crate::changelog::{ChangeRecord, Operation};
use crate::error::{Error, Result};
use crate::executor::statement;
use crate::executor::{QueryOptions, RowData, SqlHandle};

/// Replay `record` on `target`.
///
/// `row` is the current source row for INSERT and UPDATE. Returns the
/// affected row count reported by the target.
pub async fn apply_change(
    target: &dyn SqlHandle,
    record: &ChangeRecord,
    row: Option<&RowData>,
    version_column: &str,
    opts: &QueryOptions,
) -> Result<u64> {
    let (table, op_type, pk_column, pk_value) = record
        .required_fields()
        .ok_or_else(|| Error::Validation("invalid event data".into()))?;

    match Operation::parse(op_type)? {
        Operation::Update => {
            check_conflict(target, record, version_column, opts).await?;
            let row = row.ok_or_else(|| Error::Internal(format!("No source row for {}.{}", table, pk_value)))?;
            upsert(target, table, pk_column, pk_value, row, opts).await
        }
        Operation::Insert => {
            let row = row.ok_or_else(|| Error::Internal(format!("No source row for {}.{}", table, pk_value)))?;
            upsert(target, table, pk_column, pk_value, row, opts).await
        }
        Operation::Delete => {
            let stmt = statement::delete_row(target.kind(), table, pk_column, pk_value)?;
            let deleted = target.execute(&stmt.sql, &stmt.params, opts).await?;
            if deleted == 0 {
                tracing::debug!("{}.{} already absent on target", table, pk_value);
            }
            Ok(deleted)
        }
    }
}

/// Fail with [`Error::Conflict`] when the target row is newer than the event.
///
/// A missing target row is not a conflict. A record without a captured
/// version cannot be compared and fails validation.
pub async fn check_conflict(
    target: &dyn SqlHandle,
    record: &ChangeRecord,
    version_column: &str,
    opts: &QueryOptions,
) -> Result<()> {
    let (table, _, pk_column, pk_value) = record
        .required_fields()
        .ok_or_else(|| Error::Validation("invalid event data".into()))?;

    let event_version = record.data_version.ok_or_else(|| {
        Error::Validation(format!("Change record {} has no data version", record.id))
    })?;

    let stmt = statement::select_version(target.kind(), table, pk_column, version_column, pk_value)?;
    let rows = target
        .query(&stmt.sql, &stmt.params, &opts.with_max_rows(1))
        .await?;

    let Some(current) = rows.first() else {
        return Ok(());
    };

    match current.get_index(0).and_then(|v| v.as_i64()) {
        Some(target_version) if target_version > event_version => Err(Error::Conflict {
            table: table.to_string(),
            pk_value: pk_value.to_string(),
            event_version,
            target_version,
        }),
        _ => Ok(()),
    }
}

/// UPDATE, then INSERT when nothing matched, then UPDATE once more if the
/// INSERT lost a race with a concurrent writer.
pub async fn upsert(
    target: &dyn SqlHandle,
    table: &str,
    pk_column: &str,
    pk_value: &str,
    row: &RowData,
    opts: &QueryOptions,
) -> Result<u64> {
    let kind = target.kind();

    let Some(update) = statement::update_row(kind, table, pk_column, pk_value, row)? else {
        return Ok(1);
    };

    let updated = target.execute(&update.sql, &update.params, opts).await?;
    if updated > 0 {
        return Ok(updated);
    }

    let insert = statement::insert_row(kind, table, row)?;
    match target.execute(&insert.sql, &insert.params, opts).await {
        Ok(inserted) => Ok(inserted),
        Err(e) => {
            tracing::debug!("Insert into {} failed ({}), retrying update", table, e);
            target.execute(&update.sql, &update.params, opts).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::sqlite::SqliteExecutor;
    use crate::executor::Value;
    use crate::testing::{record, users_fixture};

    fn user_row(id: i64, name: &str, version: i64) -> RowData {
        vec![
            ("id", Value::Int(id)),
            ("name", Value::from(name)),
            ("sync_version", Value::Int(version)),
        ]
        .into_iter()
        .collect()
    }

    async fn read_user(target: &SqliteExecutor, id: i64) -> Option<(String, i64)> {
        let rows = target
            .query(
                "SELECT name, sync_version FROM users WHERE id = ?",
                &[Value::Int(id)],
                &QueryOptions::default(),
            )
            .await
            .unwrap();
        rows.first().map(|r| {
            (
                r.get("name").unwrap().as_text().unwrap(),
                r.get("sync_version").unwrap().as_i64().unwrap(),
            )
        })
    }

    #[tokio::test]
    async fn test_insert_creates_row() {
        let target = users_fixture().await;
        let rec = record(1, "users", "INSERT", "7", Some(1));
        let row = user_row(7, "Ada", 1);

        apply_change(&target, &rec, Some(&row), "sync_version", &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(read_user(&target, 7).await, Some(("Ada".to_string(), 1)));
    }

    #[tokio::test]
    async fn test_insert_twice_is_idempotent() {
        let target = users_fixture().await;
        let rec = record(1, "users", "INSERT", "7", Some(1));
        let row = user_row(7, "Ada", 1);
        let opts = QueryOptions::default();

        apply_change(&target, &rec, Some(&row), "sync_version", &opts).await.unwrap();
        apply_change(&target, &rec, Some(&row), "sync_version", &opts).await.unwrap();

        let count = target
            .query("SELECT COUNT(*) AS n FROM users", &[], &opts)
            .await
            .unwrap()[0]
            .get("n")
            .unwrap()
            .as_i64();
        assert_eq!(count, Some(1));
        assert_eq!(read_user(&target, 7).await, Some(("Ada".to_string(), 1)));

        // second apply went UPDATE only, never a second INSERT
        let inserts = target.executed().iter().filter(|s| s.starts_with("INSERT")).count();
        assert_eq!(inserts, 1);
    }

    #[tokio::test]
    async fn test_update_with_newer_target_is_conflict() {
        let target = users_fixture().await;
        target.setup("INSERT INTO users (id, name, sync_version) VALUES (7, 'Target', 7)").await;

        let rec = record(1, "users", "UPDATE", "7", Some(5));
        let err = apply_change(&target, &rec, Some(&user_row(7, "Source", 5)), "sync_version", &QueryOptions::default())
            .await
            .unwrap_err();

        match err {
            Error::Conflict { event_version, target_version, ref table, ref pk_value } => {
                assert_eq!((event_version, target_version), (5, 7));
                assert_eq!(table, "users");
                assert_eq!(pk_value, "7");
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(read_user(&target, 7).await, Some(("Target".to_string(), 7)));
    }

    #[tokio::test]
    async fn test_update_with_equal_or_older_target_applies() {
        let target = users_fixture().await;
        target.setup("INSERT INTO users (id, name, sync_version) VALUES (7, 'Old', 4)").await;
        let opts = QueryOptions::default();

        let rec = record(1, "users", "UPDATE", "7", Some(5));
        apply_change(&target, &rec, Some(&user_row(7, "New", 5)), "sync_version", &opts)
            .await
            .unwrap();
        assert_eq!(read_user(&target, 7).await, Some(("New".to_string(), 5)));

        // equal versions are not a conflict
        let rec = record(2, "users", "UPDATE", "7", Some(5));
        apply_change(&target, &rec, Some(&user_row(7, "Again", 5)), "sync_version", &opts)
            .await
            .unwrap();
        assert_eq!(read_user(&target, 7).await, Some(("Again".to_string(), 5)));
    }

    #[tokio::test]
    async fn test_update_of_missing_target_row_inserts() {
        let target = users_fixture().await;
        let rec = record(1, "users", "UPDATE", "9", Some(3));
        apply_change(&target, &rec, Some(&user_row(9, "Fresh", 3)), "sync_version", &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(read_user(&target, 9).await, Some(("Fresh".to_string(), 3)));
    }

    #[tokio::test]
    async fn test_update_without_version_is_validation_error() {
        let target = users_fixture().await;
        let rec = record(1, "users", "UPDATE", "7", None);
        let err = apply_change(&target, &rec, Some(&user_row(7, "x", 1)), "sync_version", &QueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(!err.is_conflict());
    }

    #[tokio::test]
    async fn test_delete_missing_row_is_ok() {
        let target = users_fixture().await;
        target.setup("INSERT INTO users (id, name, sync_version) VALUES (1, 'A', 1)").await;
        let opts = QueryOptions::default();

        let rec = record(1, "users", "DELETE", "404", Some(1));
        assert_eq!(apply_change(&target, &rec, None, "sync_version", &opts).await.unwrap(), 0);

        let rec = record(2, "users", "DELETE", "1", Some(1));
        assert_eq!(apply_change(&target, &rec, None, "sync_version", &opts).await.unwrap(), 1);
        assert!(read_user(&target, 1).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let target = users_fixture().await;
        let rec = record(1, "users", "TRUNCATE", "1", Some(1));
        let err = apply_change(&target, &rec, None, "sync_version", &QueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownOperation(ref op) if op == "TRUNCATE"));
        assert!(target.executed().is_empty());
    }

    #[tokio::test]
    async fn test_key_only_row_issues_no_sql() {
        let target = users_fixture().await;
        let row: RowData = vec![("id", Value::Int(1))].into_iter().collect();
        let affected = upsert(&target, "users", "id", "1", &row, &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(affected, 1);
        assert!(target.executed().is_empty());
    }

    #[tokio::test]
    async fn test_failed_insert_falls_back_to_update() {
        let target = users_fixture().await;
        // key text the UPDATE cannot match while the INSERT collides with row 7
        target.setup("INSERT INTO users (id, name, sync_version) VALUES (7, 'Old', 1)").await;
        let row = user_row(7, "New", 2);
        let opts = QueryOptions::default();

        let result = upsert(&target, "users", "id", "07x", &row, &opts).await;
        assert!(result.is_ok());
        let statements = target.executed();
        assert_eq!(statements.len(), 3);
        assert!(statements[0].starts_with("UPDATE"));
        assert!(statements[1].starts_with("INSERT"));
        assert!(statements[2].starts_with("UPDATE"));
    }

    #[tokio::test]
    async fn test_decimal_columns_replay_exactly() {
        let target = users_fixture().await;
        target
            .setup("CREATE TABLE ledger (id INTEGER PRIMARY KEY, amount TEXT, sync_version INTEGER)")
            .await;

        let amount: rust_decimal::Decimal = "123456789012345678.91".parse().unwrap();
        let row: RowData = vec![
            ("id", Value::Int(3)),
            ("amount", Value::Decimal(amount)),
            ("sync_version", Value::Int(1)),
        ]
        .into_iter()
        .collect();
        let opts = QueryOptions::default();

        apply_change(&target, &record(1, "ledger", "INSERT", "3", Some(1)), Some(&row), "sync_version", &opts)
            .await
            .unwrap();

        let stored = target
            .query("SELECT amount FROM ledger WHERE id = 3", &[], &opts)
            .await
            .unwrap()[0]
            .get("amount")
            .and_then(Value::as_text);
        assert_eq!(stored.as_deref(), Some("123456789012345678.91"));
    }
}
