//! Conflict Alerts
//!
//! The engine hands alerts to a bounded queue and moves on. A background
//! task delivers them; delivery errors are logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::AlertConfig;
use crate::error::{Error, Result};

/// A detected write conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictAlert {
    pub source: String,
    pub target: String,
    pub table: String,
    pub pk_value: String,
    pub message: String,
    pub event_version: Option<i64>,
    pub target_version: Option<i64>,
    pub detected_at: chrono::DateTime<chrono::Utc>,
}

/// Operator notification channel
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify_conflict(&self, alert: &ConflictAlert) -> Result<()>;
}

/// Writes alerts to the log
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify_conflict(&self, alert: &ConflictAlert) -> Result<()> {
        tracing::warn!(
            source = %alert.source,
            target = %alert.target,
            table = %alert.table,
            pk = %alert.pk_value,
            "Replication conflict: {}",
            alert.message
        );
        Ok(())
    }
}

/// POSTs alerts as JSON
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Alert(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify_conflict(&self, alert: &ConflictAlert) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| Error::Alert(format!("Webhook request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Alert(format!("Webhook returned {}", response.status())));
        }
        Ok(())
    }
}

/// Build the sink described by the config
pub fn sink_from_config(config: &AlertConfig) -> Result<Arc<dyn AlertSink>> {
    match &config.webhook_url {
        Some(url) => Ok(Arc::new(WebhookAlertSink::new(
            url.clone(),
            Duration::from_secs(config.timeout_secs),
        )?)),
        None => Ok(Arc::new(LogAlertSink)),
    }
}

/// Non-blocking handle for queueing alerts
#[derive(Clone)]
pub struct AlertDispatcher {
    tx: mpsc::Sender<ConflictAlert>,
}

impl AlertDispatcher {
    /// Dispatcher plus the receiving end of its queue
    pub fn channel(queue_size: usize) -> (Self, mpsc::Receiver<ConflictAlert>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        (Self { tx }, rx)
    }

    /// Dispatcher with a delivery task draining into `sink`.
    /// The task ends once every dispatcher clone is dropped.
    pub fn spawn(sink: Arc<dyn AlertSink>, queue_size: usize) -> (Self, JoinHandle<()>) {
        let (dispatcher, rx) = Self::channel(queue_size);
        let task = tokio::spawn(deliver(rx, sink));
        (dispatcher, task)
    }

    /// Queue an alert. Never waits; a full queue drops it.
    pub fn notify_conflict(&self, alert: ConflictAlert) {
        if let Err(e) = self.tx.try_send(alert) {
            let alert = match e {
                mpsc::error::TrySendError::Full(a) | mpsc::error::TrySendError::Closed(a) => a,
            };
            tracing::warn!(
                "Dropping conflict alert for {}.{} on {}: queue unavailable",
                alert.table,
                alert.pk_value,
                alert.target
            );
        }
    }
}

async fn deliver(mut rx: mpsc::Receiver<ConflictAlert>, sink: Arc<dyn AlertSink>) {
    while let Some(alert) = rx.recv().await {
        if let Err(e) = sink.notify_conflict(&alert).await {
            tracing::error!("Failed to deliver conflict alert for {}.{}: {}", alert.table, alert.pk_value, e);
        }
    }
    tracing::debug!("Alert delivery stopped");
}
