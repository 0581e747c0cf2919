//! SyncMesh Configuration
//!
//! This module provides configuration structures for the SyncMesh
//! replication daemon and its operator tooling.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::dialect::is_safe_identifier;

/// Main SyncMesh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMeshConfig {
    /// Replication worker identity and engine tuning
    pub worker: WorkerConfig,

    /// Local node registry
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Credential encryption
    pub security: SecurityConfig,

    /// Per-node connection pools
    #[serde(default)]
    pub pool: PoolConfig,

    /// Periodic recovery of failed events
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Conflict alerting
    #[serde(default)]
    pub alert: AlertConfig,

    /// Status API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Replication worker configuration
///
/// The username here is the login the capture triggers compare against.
/// The same value feeds the connection provider and the trigger generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Database login used for every replicated write
    #[serde(default = "default_worker_user")]
    pub username: String,

    /// Password of the worker login
    #[serde(default)]
    pub password: String,

    /// Maximum pending events fetched per source per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Delay between poll cycles in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Timeout for a single statement in seconds
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,

    /// Per-row version counter column present on every replicated table
    #[serde(default = "default_version_column")]
    pub version_column: String,

    /// Change log table written by the capture triggers
    #[serde(default = "default_change_log_table")]
    pub change_log_table: String,
}

/// Node registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Path of the registry database file
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
}

/// Credential encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Secret the node password encryption key is derived from
    pub secret: String,
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum connections per node and role
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Recovery job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Cron expression used when none is stored in the config store
    #[serde(default = "default_cron")]
    pub default_cron: String,

    /// Failed events captured within this many hours are retried
    #[serde(default = "default_window_hours")]
    pub window_hours: u64,
}

/// Alert configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Webhook receiving conflict alerts as JSON (log only when unset)
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Webhook request timeout in seconds
    #[serde(default = "default_alert_timeout")]
    pub timeout_secs: u64,

    /// Alerts buffered before new ones are dropped
    #[serde(default = "default_alert_queue")]
    pub queue_size: usize,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP status API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_worker_user() -> String {
    "dbsyncer".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_query_timeout() -> u64 {
    30
}

fn default_version_column() -> String {
    "sync_version".to_string()
}

fn default_change_log_table() -> String {
    "sync_event".to_string()
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("/var/lib/syncmesh/registry.db")
}

fn default_max_connections() -> u32 {
    4
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_cron() -> String {
    "0 0 1 * * ?".to_string()
}

fn default_window_hours() -> u64 {
    24
}

fn default_alert_timeout() -> u64 {
    10
}

fn default_alert_queue() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            default_cron: default_cron(),
            window_hours: default_window_hours(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_alert_timeout(),
            queue_size: default_alert_queue(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl SyncMeshConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: SyncMeshConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.worker.username.trim().is_empty() {
            return Err(crate::Error::Config("worker.username cannot be empty".into()));
        }

        if self.worker.batch_size == 0 {
            return Err(crate::Error::Config("worker.batch_size must be at least 1".into()));
        }

        if self.worker.poll_interval_ms == 0 {
            return Err(crate::Error::Config("worker.poll_interval_ms must be at least 1".into()));
        }

        if !is_safe_identifier(&self.worker.version_column) {
            return Err(crate::Error::Config(format!(
                "worker.version_column is not a valid identifier: {}",
                self.worker.version_column
            )));
        }

        if !is_safe_identifier(&self.worker.change_log_table) {
            return Err(crate::Error::Config(format!(
                "worker.change_log_table is not a valid identifier: {}",
                self.worker.change_log_table
            )));
        }

        if self.security.secret.is_empty() {
            return Err(crate::Error::Config("security.secret cannot be empty".into()));
        }

        crate::replication::parse_cron(&self.recovery.default_cron)?;

        Ok(())
    }

    /// Get poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker.poll_interval_ms)
    }

    /// Get statement timeout as Duration
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.query_timeout_secs)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.pool.connect_timeout_secs)
    }

    /// Get the recovery window as a chrono duration
    pub fn recovery_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.recovery.window_hours as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[worker]
username = "replicator"
password = "worker-secret"
batch_size = 50
poll_interval_ms = 2000

[registry]
path = "/tmp/syncmesh/registry.db"

[security]
secret = "root-key"

[recovery]
default_cron = "0 */15 * * * ?"
window_hours = 12
"#;

    #[test]
    fn test_parse_config() {
        let config = SyncMeshConfig::from_str(SAMPLE).unwrap();
        assert_eq!(config.worker.username, "replicator");
        assert_eq!(config.worker.batch_size, 50);
        assert_eq!(config.worker.version_column, "sync_version");
        assert_eq!(config.worker.change_log_table, "sync_event");
        assert_eq!(config.poll_interval(), Duration::from_millis(2000));
        assert_eq!(config.recovery.window_hours, 12);
        assert_eq!(config.recovery_window(), chrono::Duration::hours(12));
        assert!(config.api.enabled);
        assert!(config.alert.webhook_url.is_none());
    }

    #[test]
    fn test_defaults() {
        let config = SyncMeshConfig::from_str("[worker]\n[security]\nsecret = \"k\"\n").unwrap();
        assert_eq!(config.worker.username, "dbsyncer");
        assert_eq!(config.worker.batch_size, 100);
        assert_eq!(config.recovery.default_cron, "0 0 1 * * ?");
        assert_eq!(config.pool.max_connections, 4);
    }

    #[test]
    fn test_rejects_invalid() {
        let empty_secret = "[worker]\n[security]\nsecret = \"\"\n";
        assert!(SyncMeshConfig::from_str(empty_secret).is_err());

        let zero_batch = "[worker]\nbatch_size = 0\n[security]\nsecret = \"k\"\n";
        assert!(SyncMeshConfig::from_str(zero_batch).is_err());

        let bad_column = "[worker]\nversion_column = \"v; drop\"\n[security]\nsecret = \"k\"\n";
        assert!(SyncMeshConfig::from_str(bad_column).is_err());

        let bad_cron = "[worker]\n[security]\nsecret = \"k\"\n[recovery]\ndefault_cron = \"whenever\"\n";
        assert!(SyncMeshConfig::from_str(bad_cron).is_err());
    }
}
