//! SQLite Node Registry
//!
//! Persistent storage for node descriptors and system configuration.
//! Passwords are encrypted before they reach disk.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::{ConfigStore, CredentialCipher, Credentials, NewNode, NodeDescriptor, NodeRegistry};
use crate::dialect::DatabaseKind;
use crate::error::{Error, Result};

const NODE_COLUMNS: &str = "id, name, kind, host, port, database_name, username, enabled, deleted";

/// Registry backed by a local SQLite file
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
    cipher: CredentialCipher,
}

impl SqliteRegistry {
    /// Create or open the registry database
    pub fn open(path: &Path, cipher: CredentialCipher) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?, cipher)
    }

    /// Registry that lives only as long as the process
    pub fn in_memory(cipher: CredentialCipher) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, cipher)
    }

    fn init(conn: Connection, cipher: CredentialCipher) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                database_name TEXT NOT NULL,
                username TEXT NOT NULL,
                password_enc TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_live_name
                ON nodes(name) WHERE deleted = 0;

            CREATE TABLE IF NOT EXISTS system_config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    /// Register a node. The password is encrypted before storage.
    pub async fn add_node(&self, node: NewNode) -> Result<NodeDescriptor> {
        for (field, value) in [
            ("name", &node.name),
            ("host", &node.host),
            ("database", &node.database),
            ("username", &node.username),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Validation(format!("Node {} is required", field)));
            }
        }
        let port = node.port.unwrap_or(node.kind.dialect().default_port);
        if port == 0 {
            return Err(Error::Validation("Node port must be non-zero".into()));
        }

        let password_enc = self.cipher.encrypt(&node.password).map_err(Error::Internal)?;

        let conn = self.conn.lock().await;
        let taken: i64 = conn.query_row(
            "SELECT COUNT(*) FROM nodes WHERE name = ?1 AND deleted = 0",
            params![node.name],
            |row| row.get(0),
        )?;
        if taken > 0 {
            return Err(Error::DuplicateNode(node.name));
        }

        conn.execute(
            r#"
            INSERT INTO nodes (name, kind, host, port, database_name, username, password_enc)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                node.name,
                node.kind.code(),
                node.host,
                port,
                node.database,
                node.username,
                password_enc
            ],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!("Registered node {} ({}) as id {}", node.name, node.kind, id);

        Ok(NodeDescriptor {
            id,
            name: node.name,
            kind: node.kind,
            host: node.host,
            port,
            database: node.database,
            username: node.username,
            enabled: true,
            deleted: false,
        })
    }

    /// Enable or disable a node
    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE nodes SET enabled = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2 AND deleted = 0",
            params![enabled, id],
        )?;
        if changed == 0 {
            return Err(Error::NodeNotFound(id));
        }
        Ok(())
    }

    /// Soft delete a node; its name becomes available again
    pub async fn remove_node(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE nodes SET deleted = 1, enabled = 0, updated_at = CURRENT_TIMESTAMP WHERE id = ?1 AND deleted = 0",
            params![id],
        )?;
        if changed == 0 {
            return Err(Error::NodeNotFound(id));
        }
        tracing::info!("Removed node {}", id);
        Ok(())
    }

    /// All non-deleted nodes, enabled or not
    pub async fn list_nodes(&self) -> Result<Vec<NodeDescriptor>> {
        self.select_nodes("deleted = 0").await
    }

    async fn select_nodes(&self, filter: &str) -> Result<Vec<NodeDescriptor>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM nodes WHERE {} ORDER BY id",
            NODE_COLUMNS, filter
        ))?;
        let rows = stmt
            .query_map([], NodeRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(NodeRow::into_descriptor).collect()
    }
}

/// Raw registry row before the kind code is parsed
struct NodeRow {
    id: i64,
    name: String,
    kind: String,
    host: String,
    port: u16,
    database: String,
    username: String,
    enabled: bool,
    deleted: bool,
}

impl NodeRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            kind: row.get(2)?,
            host: row.get(3)?,
            port: row.get(4)?,
            database: row.get(5)?,
            username: row.get(6)?,
            enabled: row.get(7)?,
            deleted: row.get(8)?,
        })
    }

    fn into_descriptor(self) -> Result<NodeDescriptor> {
        Ok(NodeDescriptor {
            id: self.id,
            name: self.name,
            kind: DatabaseKind::from_code(&self.kind)?,
            host: self.host,
            port: self.port,
            database: self.database,
            username: self.username,
            enabled: self.enabled,
            deleted: self.deleted,
        })
    }
}

#[async_trait]
impl NodeRegistry for SqliteRegistry {
    async fn list_enabled(&self) -> Result<Vec<NodeDescriptor>> {
        self.select_nodes("enabled = 1 AND deleted = 0").await
    }

    async fn get_node(&self, id: i64) -> Result<Option<NodeDescriptor>> {
        let row = {
            let conn = self.conn.lock().await;
            conn.query_row(
                &format!("SELECT {} FROM nodes WHERE id = ?1 AND deleted = 0", NODE_COLUMNS),
                params![id],
                NodeRow::from_row,
            )
            .optional()?
        };
        row.map(NodeRow::into_descriptor).transpose()
    }

    async fn decrypted_credentials(&self, id: i64) -> Result<Credentials> {
        let stored: Option<(String, String)> = {
            let conn = self.conn.lock().await;
            conn.query_row(
                "SELECT username, password_enc FROM nodes WHERE id = ?1 AND deleted = 0",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };

        let (username, password_enc) = stored.ok_or(Error::NodeNotFound(id))?;
        let password = self
            .cipher
            .decrypt(&password_enc)
            .map_err(|reason| Error::Credentials { node_id: id, reason })?;

        Ok(Credentials { username, password })
    }
}

#[async_trait]
impl ConfigStore for SqliteRegistry {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row(
                "SELECT value FROM system_config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn upsert(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO system_config (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
            params![key, value],
        )?;
        Ok(())
    }
}
