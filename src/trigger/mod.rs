//! Trigger Generator
//!
//! Turns a CREATE TABLE script into capture triggers for one database
//! kind. Statements that cannot be turned into triggers are reported back
//! rather than dropped.

mod ddl;
mod templates;

pub use ddl::{parse_create_table, split_statements, SkipReason, TableDef};

use serde::Serialize;

use crate::config::SyncMeshConfig;
use crate::dialect::{is_safe_identifier, DatabaseKind};
use crate::error::{Error, Result};

/// Names baked into the generated trigger text
#[derive(Debug, Clone)]
pub struct TriggerOptions {
    /// Login whose writes the triggers ignore
    pub worker_user: String,
    pub version_column: String,
    pub change_log_table: String,
}

impl Default for TriggerOptions {
    fn default() -> Self {
        Self {
            worker_user: "dbsyncer".to_string(),
            version_column: "sync_version".to_string(),
            change_log_table: "sync_event".to_string(),
        }
    }
}

impl TriggerOptions {
    pub fn from_config(config: &SyncMeshConfig) -> Self {
        Self {
            worker_user: config.worker.username.clone(),
            version_column: config.worker.version_column.clone(),
            change_log_table: config.worker.change_log_table.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.worker_user.trim().is_empty() {
            return Err(Error::Validation("worker user must not be empty".into()));
        }
        for name in [&self.version_column, &self.change_log_table] {
            if !is_safe_identifier(name) {
                return Err(Error::Validation(format!("Invalid identifier: {}", name)));
            }
        }
        Ok(())
    }
}

/// A table that received triggers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerTable {
    pub table: String,
    pub pk_column: String,
    /// Key had more than one column; only `pk_column` is captured
    pub composite_key: bool,
}

/// A statement that produced no trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFragment {
    /// Start of the statement, whitespace collapsed
    pub fragment: String,
    #[serde(serialize_with = "serialize_reason")]
    pub reason: SkipReason,
}

fn serialize_reason<S: serde::Serializer>(reason: &SkipReason, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(reason)
}

impl SkippedFragment {
    fn new(statement: &str, reason: SkipReason) -> Self {
        let collapsed = statement.split_whitespace().collect::<Vec<_>>().join(" ");
        let fragment = match collapsed.char_indices().nth(60) {
            Some((cut, _)) => format!("{}...", &collapsed[..cut]),
            None => collapsed,
        };
        Self { fragment, reason }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedTriggers {
    pub kind: DatabaseKind,
    /// Script to run on the node
    pub source: String,
    pub tables: Vec<TriggerTable>,
    pub skipped: Vec<SkippedFragment>,
}

/// Generate capture triggers for every CREATE TABLE in `ddl`
pub fn generate_triggers(ddl: &str, kind: DatabaseKind, options: &TriggerOptions) -> Result<GeneratedTriggers> {
    options.validate()?;

    let mut blocks = Vec::new();
    let mut tables = Vec::new();
    let mut skipped = Vec::new();

    for statement in split_statements(ddl) {
        let def = match parse_create_table(&statement) {
            Ok(def) => def,
            Err(reason) => {
                tracing::debug!("Skipping DDL fragment: {}", reason);
                skipped.push(SkippedFragment::new(&statement, reason));
                continue;
            }
        };

        if !is_safe_identifier(&def.name) {
            skipped.push(SkippedFragment::new(&statement, SkipReason::UnsupportedIdentifier(def.name)));
            continue;
        }

        let Some(pk) = def.primary_key.first() else {
            tracing::warn!("Table {} has no primary key, no trigger generated", def.name);
            blocks.push(format!("-- [WARN] table {} has no primary key; no trigger generated", def.name));
            skipped.push(SkippedFragment::new(&statement, SkipReason::NoPrimaryKey));
            continue;
        };

        if !is_safe_identifier(pk) {
            skipped.push(SkippedFragment::new(&statement, SkipReason::UnsupportedIdentifier(pk.clone())));
            continue;
        }

        let composite_key = def.primary_key.len() > 1;
        let mut block = String::new();
        if composite_key {
            block.push_str(&format!(
                "-- [NOTE] {} has a composite primary key ({}); changes are keyed on {} only\n",
                def.name,
                def.primary_key.join(", "),
                pk
            ));
        }
        block.push_str(&templates::render(kind, &def.name, pk, options));
        blocks.push(block);

        tables.push(TriggerTable {
            table: def.name.clone(),
            pk_column: pk.clone(),
            composite_key,
        });
    }

    let mut source = String::new();
    if kind == DatabaseKind::Postgres && !tables.is_empty() {
        source.push_str(&templates::postgres_functions(options));
        source.push_str("\n\n");
    }
    source.push_str(&blocks.join("\n\n"));
    if !source.is_empty() {
        source.push('\n');
    }

    Ok(GeneratedTriggers {
        kind,
        source,
        tables,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const USERS: &str = "CREATE TABLE users (user_id BIGINT PRIMARY KEY, name VARCHAR(64), sync_version INT DEFAULT 0);";

    fn options() -> TriggerOptions {
        TriggerOptions {
            worker_user: "replicator".to_string(),
            version_column: "row_ver".to_string(),
            change_log_table: "change_log".to_string(),
        }
    }

    #[test]
    fn test_every_dialect_references_key_and_version() {
        for kind in DatabaseKind::ALL {
            let out = generate_triggers(USERS, kind, &options()).unwrap();
            assert_eq!(
                out.tables,
                vec![TriggerTable {
                    table: "users".into(),
                    pk_column: "user_id".into(),
                    composite_key: false,
                }]
            );
            assert!(out.skipped.is_empty());
            assert!(out.source.contains("user_id"), "{:?}", kind);
            assert!(out.source.contains("row_ver"), "{:?}", kind);
            assert!(out.source.contains("change_log"), "{:?}", kind);
            assert!(out.source.contains(kind.code()), "{:?}", kind);
            assert!(!out.source.contains("INTO sync_event"), "{:?}", kind);
        }
    }

    #[test]
    fn test_worker_identity_guards() {
        let mysql = generate_triggers(USERS, DatabaseKind::MySql, &options()).unwrap().source;
        assert!(mysql.starts_with("-- [MySQL]"));
        assert!(mysql.contains("SUBSTRING_INDEX(USER(), '@', 1) != 'replicator'"));
        assert!(mysql.contains("SET NEW.row_ver = OLD.row_ver + 1;"));
        assert!(mysql.contains("CAST(OLD.user_id AS CHAR)"));
        assert!(mysql.trim_end().ends_with("DELIMITER ;"));
        assert_eq!(mysql.matches("CREATE TRIGGER").count(), 4);

        let oracle = generate_triggers(USERS, DatabaseKind::Oracle, &options()).unwrap().source;
        assert!(oracle.contains("UPPER('replicator')"));
        assert!(oracle.contains(":NEW.row_ver := :OLD.row_ver + 1;"));

        let sqlserver = generate_triggers(USERS, DatabaseKind::SqlServer, &options()).unwrap().source;
        assert!(sqlserver.contains("SUSER_NAME() <> 'replicator'"));
        // only re-entry of this trigger is suppressed, not DML from other triggers
        assert!(sqlserver.contains("IF TRIGGER_NESTLEVEL(@@PROCID) > 1 RETURN;"));
        assert!(!sqlserver.contains("TRIGGER_NESTLEVEL()"));
        assert!(sqlserver.contains("ISNULL(d.row_ver, 0) + 1"));
    }

    #[test]
    fn test_postgres_functions_emitted_once() {
        let ddl = format!("{} CREATE TABLE orders (id SERIAL PRIMARY KEY, total NUMERIC(10,2));", USERS);
        let out = generate_triggers(&ddl, DatabaseKind::Postgres, &options()).unwrap();
        assert_eq!(out.tables.len(), 2);
        assert_eq!(out.source.matches("CREATE OR REPLACE FUNCTION increment_version").count(), 1);
        assert_eq!(out.source.matches("CREATE OR REPLACE FUNCTION notify_sync_event").count(), 1);
        assert!(out.source.contains("EXECUTE FUNCTION notify_sync_event('user_id');"));
        assert!(out.source.contains("EXECUTE FUNCTION notify_sync_event('id');"));
        assert!(out.source.contains("CURRENT_USER = 'replicator'"));
    }

    #[test]
    fn test_no_primary_key_yields_only_warning() {
        for kind in DatabaseKind::ALL {
            let out = generate_triggers("CREATE TABLE audit (msg TEXT, at TIMESTAMP)", kind, &options()).unwrap();
            assert!(out.tables.is_empty());
            assert_eq!(out.skipped.len(), 1);
            assert_eq!(out.skipped[0].reason, SkipReason::NoPrimaryKey);
            assert!(out.source.contains("[WARN]"));
            assert!(out.source.contains("audit"));
            assert!(!out.source.contains("CREATE TRIGGER"));
            assert!(!out.source.contains("CREATE OR ALTER TRIGGER"));
            assert!(!out.source.contains("FUNCTION"));
        }
    }

    #[test]
    fn test_composite_key_is_noted() {
        let out = generate_triggers(
            "CREATE TABLE line_items (order_id INT, line_no INT, PRIMARY KEY (order_id, line_no))",
            DatabaseKind::MySql,
            &options(),
        )
        .unwrap();
        assert!(out.tables[0].composite_key);
        assert_eq!(out.tables[0].pk_column, "order_id");
        assert!(out.source.contains("[NOTE]"));
    }

    #[test]
    fn test_skips_are_reported() {
        let ddl = "
            CREATE INDEX idx_name ON users (name);
            CREATE TABLE \"odd name\" (id INT PRIMARY KEY);
            CREATE TABLE broken (id INT PRIMARY KEY;
            CREATE TABLE ok_table (id INT PRIMARY KEY);
        ";
        let out = generate_triggers(ddl, DatabaseKind::MySql, &options()).unwrap();
        assert_eq!(out.tables.len(), 1);
        assert_eq!(out.tables[0].table, "ok_table");

        let reasons: Vec<&SkipReason> = out.skipped.iter().map(|s| &s.reason).collect();
        assert_eq!(reasons[0], &SkipReason::NotCreateTable);
        assert_eq!(reasons[1], &SkipReason::UnsupportedIdentifier("odd name".into()));
        assert!(matches!(reasons[2], SkipReason::Malformed(_)));
        assert!(out.skipped[0].fragment.starts_with("CREATE INDEX idx_name"));
    }

    #[test]
    fn test_worker_quote_is_escaped() {
        let options = TriggerOptions {
            worker_user: "o'brien".into(),
            ..TriggerOptions::default()
        };
        let out = generate_triggers(USERS, DatabaseKind::MySql, &options).unwrap();
        assert!(out.source.contains("'o''brien'"));
    }

    #[test]
    fn test_rejects_bad_options() {
        let options = TriggerOptions {
            version_column: "ver; DROP".into(),
            ..TriggerOptions::default()
        };
        assert!(matches!(
            generate_triggers(USERS, DatabaseKind::MySql, &options),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_empty_input() {
        let out = generate_triggers("  -- nothing here\n", DatabaseKind::Postgres, &TriggerOptions::default()).unwrap();
        assert!(out.source.is_empty());
        assert!(out.tables.is_empty());
        assert!(out.skipped.is_empty());
    }
}
