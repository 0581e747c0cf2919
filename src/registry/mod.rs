//! Node Registry Module
//!
//! Node descriptors, their credentials and the flat system config store.

mod crypto;
mod store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dialect::DatabaseKind;
use crate::error::Result;

pub use crypto::CredentialCipher;
pub use store::SqliteRegistry;

/// Config store key holding the recovery job cron expression
pub const SYNC_CRON_KEY: &str = "sync.cron";

/// A registered node database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: i64,
    /// Display name, unique among non-deleted nodes
    pub name: String,
    pub kind: DatabaseKind,
    pub host: String,
    pub port: u16,
    pub database: String,
    /// Owner login
    pub username: String,
    pub enabled: bool,
    pub deleted: bool,
}

impl NodeDescriptor {
    /// Connection URL without credentials
    pub fn url(&self) -> String {
        self.kind.format_url(&self.host, self.port, &self.database)
    }
}

/// A node to register
#[derive(Debug, Clone, Deserialize)]
pub struct NewNode {
    pub name: String,
    pub kind: DatabaseKind,
    pub host: String,
    /// Defaults to the dialect's port
    pub port: Option<u16>,
    pub database: String,
    pub username: String,
    pub password: String,
}

/// Login credentials, decrypted in memory only
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Read access to registered nodes
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Enabled, non-deleted nodes ordered by id
    async fn list_enabled(&self) -> Result<Vec<NodeDescriptor>>;

    /// A non-deleted node
    async fn get_node(&self, id: i64) -> Result<Option<NodeDescriptor>>;

    /// Owner credentials of a node with the password decrypted
    async fn decrypted_credentials(&self, id: i64) -> Result<Credentials>;
}

/// Flat key/value system configuration
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace `key`
    async fn upsert(&self, key: &str, value: &str) -> Result<()>;

    /// Value of `key`, or `default` when unset
    async fn get_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self.get(key).await?.unwrap_or_else(|| default.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials {
            username: "app".into(),
            password: "hunter2".into(),
        };
        let debug = format!("{:?}", creds);
        assert!(debug.contains("app"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_descriptor_url() {
        let node = NodeDescriptor {
            id: 1,
            name: "east".into(),
            kind: DatabaseKind::Postgres,
            host: "db-east".into(),
            port: 5432,
            database: "shop".into(),
            username: "app".into(),
            enabled: true,
            deleted: false,
        };
        assert_eq!(node.url(), "postgres://db-east:5432/shop");
    }
}
