//! Connection Provider
//!
//! Opens SQL handles to registered nodes, either as the node owner or as the
//! replication worker whose writes the capture triggers ignore.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::SyncMeshConfig;
use crate::dialect::DatabaseKind;
use crate::error::{Error, Result};
use crate::executor::{MySqlExecutor, PostgresExecutor, SqlHandle};
use crate::registry::{Credentials, NodeDescriptor, NodeRegistry};

/// Identity a handle is opened under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The node's own stored credentials
    Owner,
    /// The configured replication worker login
    Worker,
}

/// Resolves a node id to a live SQL handle
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn connect(&self, node_id: i64, role: Role) -> Result<Arc<dyn SqlHandle>>;
}

struct CachedHandle {
    fingerprint: String,
    handle: Arc<dyn SqlHandle>,
}

/// Provider keeping one pool per node and role.
///
/// A cached pool is reused while the node's URL and credentials are
/// unchanged; edits to the node replace it on the next connect.
pub struct PoolProvider {
    registry: Arc<dyn NodeRegistry>,
    worker: Credentials,
    max_connections: u32,
    connect_timeout: Duration,
    cache: Mutex<HashMap<(i64, Role), CachedHandle>>,
}

impl PoolProvider {
    pub fn new(registry: Arc<dyn NodeRegistry>, config: &SyncMeshConfig) -> Self {
        Self {
            registry,
            worker: Credentials {
                username: config.worker.username.clone(),
                password: config.worker.password.clone(),
            },
            max_connections: config.pool.max_connections,
            connect_timeout: config.connect_timeout(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Login used for the worker role
    pub fn worker_username(&self) -> &str {
        &self.worker.username
    }

    async fn resolve(&self, node_id: i64, role: Role) -> Result<(NodeDescriptor, Credentials)> {
        let node = self
            .registry
            .get_node(node_id)
            .await?
            .ok_or(Error::NodeNotFound(node_id))?;

        if !node.kind.dialect().runtime_driver {
            return Err(Error::UnsupportedDialect(node.kind.code().to_string()));
        }

        let credentials = match role {
            Role::Owner => self.registry.decrypted_credentials(node_id).await?,
            Role::Worker => self.worker.clone(),
        };

        Ok((node, credentials))
    }

    async fn open(&self, node: &NodeDescriptor, credentials: &Credentials) -> Result<Arc<dyn SqlHandle>> {
        let url = node.url();
        tracing::debug!("Opening pool to node {} at {} as {}", node.name, url, credentials.username);

        let handle: Arc<dyn SqlHandle> = match node.kind {
            DatabaseKind::MySql => Arc::new(
                MySqlExecutor::connect(
                    &url,
                    &credentials.username,
                    &credentials.password,
                    self.max_connections,
                    self.connect_timeout,
                )
                .await?,
            ),
            DatabaseKind::Postgres => Arc::new(
                PostgresExecutor::connect(
                    &url,
                    &credentials.username,
                    &credentials.password,
                    self.max_connections,
                    self.connect_timeout,
                )
                .await?,
            ),
            other => return Err(Error::UnsupportedDialect(other.code().to_string())),
        };
        Ok(handle)
    }

    /// Drop cached pools of a node
    pub async fn invalidate(&self, node_id: i64) {
        let removed: Vec<CachedHandle> = {
            let mut cache = self.cache.lock().await;
            [Role::Owner, Role::Worker]
                .iter()
                .filter_map(|role| cache.remove(&(node_id, *role)))
                .collect()
        };
        for cached in removed {
            cached.handle.close().await;
        }
    }

    /// Close every cached pool
    pub async fn close_all(&self) {
        let drained: Vec<CachedHandle> = self.cache.lock().await.drain().map(|(_, v)| v).collect();
        for cached in drained {
            cached.handle.close().await;
        }
    }
}

fn fingerprint(node: &NodeDescriptor, credentials: &Credentials) -> String {
    let mut hasher = Sha256::new();
    hasher.update(node.url().as_bytes());
    hasher.update([0]);
    hasher.update(credentials.username.as_bytes());
    hasher.update([0]);
    hasher.update(credentials.password.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl ConnectionProvider for PoolProvider {
    async fn connect(&self, node_id: i64, role: Role) -> Result<Arc<dyn SqlHandle>> {
        let (node, credentials) = self.resolve(node_id, role).await?;
        let fingerprint = fingerprint(&node, &credentials);

        if let Some(cached) = self.cache.lock().await.get(&(node_id, role)) {
            if cached.fingerprint == fingerprint {
                return Ok(Arc::clone(&cached.handle));
            }
        }

        // Connect without holding the cache lock so one slow node does not
        // stall handles to the others.
        let handle = self.open(&node, &credentials).await?;

        let replaced = self.cache.lock().await.insert(
            (node_id, role),
            CachedHandle {
                fingerprint,
                handle: Arc::clone(&handle),
            },
        );
        if let Some(old) = replaced {
            if !Arc::ptr_eq(&old.handle, &handle) {
                old.handle.close().await;
            }
        }

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CredentialCipher, NewNode, SqliteRegistry};

    const CONFIG: &str = r#"
[worker]
username = "replicator"
password = "worker-pass"

[security]
secret = "test-secret"

[pool]
connect_timeout_secs = 1
"#;

    async fn setup() -> (Arc<SqliteRegistry>, PoolProvider) {
        let config = SyncMeshConfig::from_str(CONFIG).unwrap();
        let registry = Arc::new(SqliteRegistry::in_memory(CredentialCipher::new("test-secret")).unwrap());
        let provider = PoolProvider::new(registry.clone(), &config);
        (registry, provider)
    }

    fn new_node(name: &str, kind: DatabaseKind) -> NewNode {
        NewNode {
            name: name.to_string(),
            kind,
            host: "127.0.0.1".to_string(),
            port: Some(1),
            database: "shop".to_string(),
            username: "app".to_string(),
            password: "app-pass".to_string(),
        }
    }

    #[tokio::test]
    async fn test_unknown_node_fails_fast() {
        let (_, provider) = setup().await;
        let err = provider.connect(42, Role::Worker).await.err().unwrap();
        assert!(matches!(err, Error::NodeNotFound(42)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_no_runtime_driver() {
        let (registry, provider) = setup().await;
        let node = registry.add_node(new_node("legacy", DatabaseKind::Oracle)).await.unwrap();
        let err = provider.connect(node.id, Role::Owner).await.err().unwrap();
        assert!(matches!(err, Error::UnsupportedDialect(ref k) if k == "ORACLE"));
    }

    #[tokio::test]
    async fn test_worker_role_uses_configured_identity() {
        let (registry, provider) = setup().await;
        let node = registry.add_node(new_node("east", DatabaseKind::MySql)).await.unwrap();

        let (_, worker) = provider.resolve(node.id, Role::Worker).await.unwrap();
        assert_eq!(worker.username, "replicator");
        assert_eq!(provider.worker_username(), "replicator");

        let (_, owner) = provider.resolve(node.id, Role::Owner).await.unwrap();
        assert_eq!(owner.username, "app");
        assert_eq!(owner.password, "app-pass");
    }

    #[tokio::test]
    async fn test_unreachable_node_is_transient() {
        let (registry, provider) = setup().await;
        let node = registry.add_node(new_node("east", DatabaseKind::MySql)).await.unwrap();
        let err = provider.connect(node.id, Role::Worker).await.err().unwrap();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_fingerprint_tracks_credentials() {
        let node = NodeDescriptor {
            id: 1,
            name: "east".into(),
            kind: DatabaseKind::MySql,
            host: "h".into(),
            port: 3306,
            database: "d".into(),
            username: "app".into(),
            enabled: true,
            deleted: false,
        };
        let a = Credentials { username: "u".into(), password: "p1".into() };
        let b = Credentials { username: "u".into(), password: "p2".into() };
        assert_eq!(fingerprint(&node, &a), fingerprint(&node, &a));
        assert_ne!(fingerprint(&node, &a), fingerprint(&node, &b));
    }
}
