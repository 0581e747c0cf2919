//! Shared test fixtures: in-memory node databases, a fixed registry and a
//! provider that hands out those databases while recording every connect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::changelog::{ChangeRecord, EventStatus};
use crate::dialect::DatabaseKind;
use crate::error::{Error, Result};
use crate::executor::sqlite::SqliteExecutor;
use crate::executor::SqlHandle;
use crate::provider::{ConnectionProvider, Role};
use crate::registry::{ConfigStore, Credentials, NodeDescriptor, NodeRegistry};

pub const CHANGE_LOG_DDL: &str = r#"
CREATE TABLE sync_event (
    id INTEGER PRIMARY KEY,
    table_name TEXT,
    op_type TEXT,
    pk_column_name TEXT,
    pk_value TEXT,
    status INTEGER NOT NULL DEFAULT 0,
    op_time DATETIME,
    source_db_type TEXT,
    error_msg TEXT,
    data_version INTEGER
);
"#;

pub const USERS_DDL: &str = r#"
CREATE TABLE users (
    id INTEGER PRIMARY KEY,
    name TEXT,
    email TEXT,
    sync_version INTEGER NOT NULL DEFAULT 0
);
"#;

/// Node database holding an empty change log
pub async fn change_log_fixture() -> SqliteExecutor {
    let db = SqliteExecutor::in_memory();
    db.setup(CHANGE_LOG_DDL).await;
    db
}

/// Node database holding an empty `users` table
pub async fn users_fixture() -> SqliteExecutor {
    let db = SqliteExecutor::in_memory();
    db.setup(USERS_DDL).await;
    db
}

/// Node database with both tables
pub async fn node_fixture() -> Arc<SqliteExecutor> {
    let db = SqliteExecutor::in_memory();
    db.setup(CHANGE_LOG_DDL).await;
    db.setup(USERS_DDL).await;
    Arc::new(db)
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_event(
    db: &SqliteExecutor,
    id: i64,
    table: &str,
    op: &str,
    pk_value: &str,
    status: i64,
    op_time: &str,
    version: Option<i64>,
) {
    let version = version.map(|v| v.to_string()).unwrap_or_else(|| "NULL".to_string());
    db.setup(&format!(
        "INSERT INTO sync_event (id, table_name, op_type, pk_column_name, pk_value, status, op_time, source_db_type, data_version) \
         VALUES ({}, '{}', '{}', 'id', '{}', {}, '{}', 'MYSQL', {})",
        id, table, op, pk_value, status, op_time, version
    ))
    .await;
}

/// In-memory change record keyed on `id`
pub fn record(id: i64, table: &str, op: &str, pk_value: &str, version: Option<i64>) -> ChangeRecord {
    ChangeRecord {
        id,
        table_name: Some(table.to_string()),
        op_type: Some(op.to_string()),
        pk_column_name: Some("id".to_string()),
        pk_value: Some(pk_value.to_string()),
        status: Some(EventStatus::Pending),
        op_time: None,
        source_db_type: Some("MYSQL".to_string()),
        error_msg: None,
        data_version: version,
    }
}

pub fn node(id: i64, name: &str, enabled: bool) -> NodeDescriptor {
    NodeDescriptor {
        id,
        name: name.to_string(),
        kind: DatabaseKind::MySql,
        host: format!("{}.local", name),
        port: 3306,
        database: "app".to_string(),
        username: "app".to_string(),
        enabled,
        deleted: false,
    }
}

/// Registry over a fixed node list
pub struct StaticRegistry {
    nodes: Vec<NodeDescriptor>,
}

impl StaticRegistry {
    pub fn new(nodes: Vec<NodeDescriptor>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl NodeRegistry for StaticRegistry {
    async fn list_enabled(&self) -> Result<Vec<NodeDescriptor>> {
        Ok(self
            .nodes
            .iter()
            .filter(|n| n.enabled && !n.deleted)
            .cloned()
            .collect())
    }

    async fn get_node(&self, id: i64) -> Result<Option<NodeDescriptor>> {
        Ok(self.nodes.iter().find(|n| n.id == id && !n.deleted).cloned())
    }

    async fn decrypted_credentials(&self, id: i64) -> Result<Credentials> {
        let node = self.get_node(id).await?.ok_or(Error::NodeNotFound(id))?;
        Ok(Credentials {
            username: node.username,
            password: "secret".to_string(),
        })
    }
}

/// Provider handing out fixture databases by node id
#[derive(Default)]
pub struct FixtureProvider {
    nodes: HashMap<i64, Arc<SqliteExecutor>>,
    connects: Mutex<Vec<(i64, Role)>>,
}

impl FixtureProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, id: i64, db: Arc<SqliteExecutor>) -> Self {
        self.nodes.insert(id, db);
        self
    }

    /// Node ids connected to so far, in order
    pub fn connected_nodes(&self) -> Vec<i64> {
        self.connects.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }

    pub fn connects(&self) -> Vec<(i64, Role)> {
        self.connects.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionProvider for FixtureProvider {
    async fn connect(&self, node_id: i64, role: Role) -> Result<Arc<dyn SqlHandle>> {
        self.connects.lock().unwrap().push((node_id, role));
        let db = self.nodes.get(&node_id).ok_or(Error::NodeNotFound(node_id))?;
        Ok(Arc::clone(db) as Arc<dyn SqlHandle>)
    }
}

/// Config store over a map
#[derive(Default)]
pub struct MemoryConfigStore {
    values: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn upsert(&self, key: &str, value: &str) -> Result<()> {
        self.values.lock().unwrap().insert(key.to_string(), value.to_string());
        Ok(())
    }
}
