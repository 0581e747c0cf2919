//! Operator actions on a node's change log and schema
//!
//! Reads run under the node owner's login; status changes run as the
//! worker so the capture triggers never see them.

use std::sync::Arc;
use std::time::Duration;

use crate::changelog::{ChangeLog, ChangeRecord, EventStats, EventStatus};
use crate::error::{Error, Result};
use crate::executor::{QueryOptions, RowData, SqlHandle};
use crate::provider::{ConnectionProvider, Role};

pub struct SyncAdmin {
    provider: Arc<dyn ConnectionProvider>,
    change_log_table: String,
    query_timeout: Duration,
}

impl SyncAdmin {
    pub fn new(provider: Arc<dyn ConnectionProvider>, change_log_table: impl Into<String>, query_timeout: Duration) -> Self {
        Self {
            provider,
            change_log_table: change_log_table.into(),
            query_timeout,
        }
    }

    async fn change_log(&self, node_id: i64, role: Role) -> Result<ChangeLog> {
        let handle = self.provider.connect(node_id, role).await?;
        ChangeLog::new(node_id, handle, &self.change_log_table, QueryOptions::new(self.query_timeout))
    }

    pub async fn stats(&self, node_id: i64) -> Result<EventStats> {
        self.change_log(node_id, Role::Owner).await?.stats().await
    }

    /// One page of records, newest first
    pub async fn list_events(
        &self,
        node_id: i64,
        status: Option<EventStatus>,
        page: u64,
        size: u64,
    ) -> Result<Vec<ChangeRecord>> {
        self.change_log(node_id, Role::Owner).await?.list(status, page, size).await
    }

    /// Queue a record for another replay
    pub async fn retry(&self, node_id: i64, event_id: i64) -> Result<()> {
        self.change_log(node_id, Role::Worker).await?.retry(event_id).await?;
        tracing::info!("Event {} on node {} queued for retry", event_id, node_id);
        Ok(())
    }

    /// Mark a record done without replaying it
    pub async fn skip(&self, node_id: i64, event_id: i64) -> Result<()> {
        self.change_log(node_id, Role::Worker).await?.skip(event_id).await?;
        tracing::info!("Event {} on node {} skipped", event_id, node_id);
        Ok(())
    }

    /// User tables on the node, without the change log itself
    pub async fn list_tables(&self, node_id: i64) -> Result<Vec<String>> {
        let handle = self.provider.connect(node_id, Role::Owner).await?;
        let sql = handle.kind().dialect().table_list_query;
        let rows = handle.query(sql, &[], &QueryOptions::new(self.query_timeout)).await?;
        Ok(table_names(&rows, &self.change_log_table))
    }

    /// Open the node as its owner and run a health check
    pub async fn test_connection(&self, node_id: i64) -> Result<()> {
        let handle = self.provider.connect(node_id, Role::Owner).await?;
        if handle.health_check().await? {
            Ok(())
        } else {
            Err(Error::QueryExecution(format!("Health check failed for node {}", node_id)))
        }
    }
}

fn table_names(rows: &[RowData], change_log_table: &str) -> Vec<String> {
    rows.iter()
        .filter_map(|row| row.get_index(0).and_then(|v| v.as_text()))
        .filter(|name| !name.eq_ignore_ascii_case(change_log_table))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Value;
    use crate::testing::{insert_event, node_fixture, FixtureProvider};

    fn admin(provider: FixtureProvider) -> SyncAdmin {
        SyncAdmin::new(Arc::new(provider), "sync_event", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_stats_and_list() {
        let db = node_fixture().await;
        insert_event(&db, 1, "users", "INSERT", "1", 1, "2024-05-01 10:00:00", Some(1)).await;
        insert_event(&db, 2, "users", "UPDATE", "1", 2, "2024-05-01 10:01:00", Some(2)).await;
        insert_event(&db, 3, "users", "DELETE", "1", 0, "2024-05-01 10:02:00", Some(2)).await;

        let admin = admin(FixtureProvider::new().with_node(1, db));
        let stats = admin.stats(1).await.unwrap();
        assert_eq!((stats.pending, stats.success, stats.failed, stats.total), (1, 1, 1, 3));

        let failed = admin.list_events(1, Some(EventStatus::Failed), 1, 20).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, 2);

        let all = admin.list_events(1, None, 1, 2).await.unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 2]);
    }

    #[tokio::test]
    async fn test_retry_and_skip_use_worker() {
        let db = node_fixture().await;
        insert_event(&db, 5, "users", "UPDATE", "1", 2, "2024-05-01 10:00:00", Some(2)).await;
        let provider = Arc::new(FixtureProvider::new().with_node(1, db));
        let admin = SyncAdmin::new(provider.clone(), "sync_event", Duration::from_secs(5));

        admin.retry(1, 5).await.unwrap();
        assert_eq!(admin.stats(1).await.unwrap().pending, 1);

        admin.skip(1, 5).await.unwrap();
        assert_eq!(admin.stats(1).await.unwrap().success, 1);

        assert!(matches!(
            admin.retry(1, 404).await,
            Err(Error::EventNotFound { node_id: 1, event_id: 404 })
        ));
        assert!(matches!(admin.skip(1, 404).await, Err(Error::EventNotFound { .. })));

        let roles: Vec<Role> = provider.connects().into_iter().map(|(_, role)| role).collect();
        assert_eq!(&roles[..3], &[Role::Worker, Role::Owner, Role::Worker]);
    }

    #[tokio::test]
    async fn test_connection_check() {
        let db = node_fixture().await;
        let admin = admin(FixtureProvider::new().with_node(1, db.clone()));

        assert!(admin.test_connection(1).await.is_ok());
        db.set_offline(true);
        assert!(admin.test_connection(1).await.is_err());
        assert!(matches!(admin.test_connection(2).await, Err(Error::NodeNotFound(2))));
    }

    #[test]
    fn test_change_log_is_hidden_from_tables() {
        let rows: Vec<RowData> = ["users", "SYNC_EVENT", "orders"]
            .iter()
            .map(|name| vec![("Tables_in_shop", Value::from(*name))].into_iter().collect())
            .collect();
        assert_eq!(table_names(&rows, "sync_event"), vec!["users", "orders"]);
    }
}
