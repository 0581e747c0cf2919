//! Per-dialect capture trigger text
//!
//! Every dialect does the same two things for a table: bump the version
//! column on user updates, and append a change record for every user
//! insert, update and delete. Writes made by the worker login are ignored
//! so replayed changes are never captured again.

use super::TriggerOptions;
use crate::dialect::DatabaseKind;

const LOG_COLUMNS: &str =
    "table_name, op_type, pk_column_name, pk_value, status, op_time, source_db_type, data_version";

/// Escape a value for use inside a single-quoted SQL literal
fn literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// Triggers for one table
pub fn render(kind: DatabaseKind, table: &str, pk: &str, options: &TriggerOptions) -> String {
    match kind {
        DatabaseKind::MySql => mysql(table, pk, options),
        DatabaseKind::Oracle => oracle(table, pk, options),
        DatabaseKind::Postgres => postgres(table, pk),
        DatabaseKind::SqlServer => sql_server(table, pk, options),
    }
}

fn mysql(table: &str, pk: &str, options: &TriggerOptions) -> String {
    let worker = literal(&options.worker_user);
    let ver = &options.version_column;
    let guard = format!("SUBSTRING_INDEX(USER(), '@', 1) != '{}'", worker);

    let capture = |suffix: &str, timing: &str, op: &str, row: &str| {
        format!(
            "DROP TRIGGER IF EXISTS trg_{table}_{suffix} $$\n\
             CREATE TRIGGER trg_{table}_{suffix} AFTER {timing} ON {table} FOR EACH ROW BEGIN\n\
             \x20   IF {guard} THEN\n\
             \x20       INSERT INTO {log} ({LOG_COLUMNS})\n\
             \x20       VALUES ('{table}', '{op}', '{pk}', CAST({row}.{pk} AS CHAR), 0, NOW(), '{code}', {row}.{ver});\n\
             \x20   END IF;\n\
             END $$\n",
            log = options.change_log_table,
            code = DatabaseKind::MySql.code(),
        )
    };

    format!(
        "-- [MySQL] {table}: version maintenance\n\
         DELIMITER $$\n\
         DROP TRIGGER IF EXISTS trg_{table}_before_update $$\n\
         CREATE TRIGGER trg_{table}_before_update BEFORE UPDATE ON {table} FOR EACH ROW BEGIN\n\
         \x20   IF {guard} THEN\n\
         \x20       SET NEW.{ver} = OLD.{ver} + 1;\n\
         \x20   END IF;\n\
         END $$\n\
         \n\
         -- [MySQL] {table}: change capture\n\
         {insert}\n\
         {update}\n\
         {delete}\
         DELIMITER ;",
        insert = capture("insert", "INSERT", "INSERT", "NEW"),
        update = capture("update", "UPDATE", "UPDATE", "NEW"),
        delete = capture("delete", "DELETE", "DELETE", "OLD"),
    )
}

fn oracle(table: &str, pk: &str, options: &TriggerOptions) -> String {
    let worker = literal(&options.worker_user);
    let ver = &options.version_column;

    format!(
        "-- [Oracle] {table}: version maintenance\n\
         CREATE OR REPLACE TRIGGER trg_{table}_ver\n\
         BEFORE UPDATE ON {table} FOR EACH ROW\n\
         DECLARE\n\
         \x20   v_user VARCHAR2(128);\n\
         BEGIN\n\
         \x20   SELECT SYS_CONTEXT('USERENV', 'SESSION_USER') INTO v_user FROM DUAL;\n\
         \x20   IF v_user != UPPER('{worker}') THEN\n\
         \x20       :NEW.{ver} := :OLD.{ver} + 1;\n\
         \x20   END IF;\n\
         END;\n\
         /\n\
         \n\
         -- [Oracle] {table}: change capture\n\
         CREATE OR REPLACE TRIGGER trg_{table}_sync\n\
         AFTER INSERT OR UPDATE OR DELETE ON {table} FOR EACH ROW\n\
         DECLARE\n\
         \x20   v_op VARCHAR2(10);\n\
         \x20   v_pk VARCHAR2(255);\n\
         \x20   v_ver NUMBER;\n\
         \x20   v_user VARCHAR2(128);\n\
         BEGIN\n\
         \x20   SELECT SYS_CONTEXT('USERENV', 'SESSION_USER') INTO v_user FROM DUAL;\n\
         \x20   IF v_user != UPPER('{worker}') THEN\n\
         \x20       IF INSERTING THEN\n\
         \x20           v_op := 'INSERT'; v_pk := TO_CHAR(:NEW.{pk}); v_ver := :NEW.{ver};\n\
         \x20       ELSIF UPDATING THEN\n\
         \x20           v_op := 'UPDATE'; v_pk := TO_CHAR(:NEW.{pk}); v_ver := :NEW.{ver};\n\
         \x20       ELSE\n\
         \x20           v_op := 'DELETE'; v_pk := TO_CHAR(:OLD.{pk}); v_ver := :OLD.{ver};\n\
         \x20       END IF;\n\
         \x20       INSERT INTO {log} ({LOG_COLUMNS})\n\
         \x20       VALUES ('{table}', v_op, '{pk}', v_pk, 0, SYSDATE, '{code}', v_ver);\n\
         \x20   END IF;\n\
         END;\n\
         /",
        log = options.change_log_table,
        code = DatabaseKind::Oracle.code(),
    )
}

/// Shared trigger functions, emitted once ahead of the per-table bindings
pub fn postgres_functions(options: &TriggerOptions) -> String {
    let worker = literal(&options.worker_user);
    let ver = &options.version_column;

    format!(
        "-- [PostgreSQL] shared version maintenance function\n\
         CREATE OR REPLACE FUNCTION increment_version() RETURNS TRIGGER AS $$\n\
         BEGIN\n\
         \x20   IF CURRENT_USER != '{worker}' THEN\n\
         \x20       NEW.{ver} := OLD.{ver} + 1;\n\
         \x20   END IF;\n\
         \x20   RETURN NEW;\n\
         END;\n\
         $$ LANGUAGE plpgsql;\n\
         \n\
         -- [PostgreSQL] shared change capture function; TG_ARGV[0] is the key column\n\
         CREATE OR REPLACE FUNCTION notify_sync_event() RETURNS TRIGGER AS $$\n\
         DECLARE\n\
         \x20   pk_col_name VARCHAR;\n\
         \x20   current_pk_value VARCHAR;\n\
         \x20   current_version BIGINT;\n\
         BEGIN\n\
         \x20   IF CURRENT_USER = '{worker}' THEN\n\
         \x20       RETURN NULL;\n\
         \x20   END IF;\n\
         \x20   pk_col_name := TG_ARGV[0];\n\
         \x20   IF (TG_OP = 'DELETE') THEN\n\
         \x20       EXECUTE format('SELECT ($1).%I::text, ($1).%I', pk_col_name, '{ver}')\n\
         \x20           INTO current_pk_value, current_version USING OLD;\n\
         \x20   ELSE\n\
         \x20       EXECUTE format('SELECT ($1).%I::text, ($1).%I', pk_col_name, '{ver}')\n\
         \x20           INTO current_pk_value, current_version USING NEW;\n\
         \x20   END IF;\n\
         \x20   INSERT INTO {log} ({LOG_COLUMNS})\n\
         \x20   VALUES (TG_TABLE_NAME, TG_OP, pk_col_name, current_pk_value, 0, NOW(), '{code}', current_version);\n\
         \x20   RETURN NULL;\n\
         END;\n\
         $$ LANGUAGE plpgsql;",
        log = options.change_log_table,
        code = DatabaseKind::Postgres.code(),
    )
}

fn postgres(table: &str, pk: &str) -> String {
    format!(
        "-- [PostgreSQL] {table}: trigger bindings\n\
         DROP TRIGGER IF EXISTS trg_{table}_ver ON {table};\n\
         CREATE TRIGGER trg_{table}_ver BEFORE UPDATE ON {table}\n\
         FOR EACH ROW EXECUTE FUNCTION increment_version();\n\
         \n\
         DROP TRIGGER IF EXISTS trg_{table}_sync ON {table};\n\
         CREATE TRIGGER trg_{table}_sync AFTER INSERT OR UPDATE OR DELETE ON {table}\n\
         FOR EACH ROW EXECUTE FUNCTION notify_sync_event('{pk}');"
    )
}

/// SQL Server has no BEFORE triggers, so one AFTER trigger bumps the
/// version itself. Its own UPDATE re-enters the trigger; the nesting guard
/// stops that.
fn sql_server(table: &str, pk: &str, options: &TriggerOptions) -> String {
    let worker = literal(&options.worker_user);
    let ver = &options.version_column;

    format!(
        "-- [SQL Server] {table}: version maintenance and change capture\n\
         CREATE OR ALTER TRIGGER trg_{table}_sync ON {table}\n\
         AFTER INSERT, UPDATE, DELETE\n\
         AS\n\
         BEGIN\n\
         \x20   IF TRIGGER_NESTLEVEL(@@PROCID) > 1 RETURN;\n\
         \x20   SET NOCOUNT ON;\n\
         \x20   IF SUSER_NAME() <> '{worker}'\n\
         \x20   BEGIN\n\
         \x20       IF EXISTS (SELECT * FROM inserted) AND EXISTS (SELECT * FROM deleted)\n\
         \x20       BEGIN\n\
         \x20           UPDATE t\n\
         \x20           SET t.{ver} = ISNULL(d.{ver}, 0) + 1\n\
         \x20           FROM {table} t\n\
         \x20           INNER JOIN deleted d ON t.{pk} = d.{pk}\n\
         \x20           INNER JOIN inserted i ON t.{pk} = i.{pk};\n\
         \n\
         \x20           INSERT INTO {log} ({LOG_COLUMNS})\n\
         \x20           SELECT '{table}', 'UPDATE', '{pk}', CAST(i.{pk} AS VARCHAR(255)), 0, GETDATE(), '{code}', ISNULL(d.{ver}, 0) + 1\n\
         \x20           FROM inserted i JOIN deleted d ON i.{pk} = d.{pk};\n\
         \x20       END\n\
         \x20       ELSE IF EXISTS (SELECT * FROM inserted)\n\
         \x20       BEGIN\n\
         \x20           INSERT INTO {log} ({LOG_COLUMNS})\n\
         \x20           SELECT '{table}', 'INSERT', '{pk}', CAST(i.{pk} AS VARCHAR(255)), 0, GETDATE(), '{code}', i.{ver}\n\
         \x20           FROM inserted i;\n\
         \x20       END\n\
         \x20       ELSE IF EXISTS (SELECT * FROM deleted)\n\
         \x20       BEGIN\n\
         \x20           INSERT INTO {log} ({LOG_COLUMNS})\n\
         \x20           SELECT '{table}', 'DELETE', '{pk}', CAST(d.{pk} AS VARCHAR(255)), 0, GETDATE(), '{code}', d.{ver}\n\
         \x20           FROM deleted d;\n\
         \x20       END\n\
         \x20   END\n\
         END;",
        log = options.change_log_table,
        code = DatabaseKind::SqlServer.code(),
    )
}
