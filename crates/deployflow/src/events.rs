//! Structured deployment logs and their live mirror.
//!
//! Every entry is appended to the store (the durable record) and then
//! published on `deployment:<id>`. Publishing is best-effort: subscribers that
//! miss an event can always re-read the log table.

use crate::clients::ClientError;
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogPhase {
    Clone,
    Build,
    Push,
    Deploy,
    Rollback,
}

impl LogPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogPhase::Clone => "clone",
            LogPhase::Build => "build",
            LogPhase::Push => "push",
            LogPhase::Deploy => "deploy",
            LogPhase::Rollback => "rollback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clone" => Some(LogPhase::Clone),
            "build" => Some(LogPhase::Build),
            "push" => Some(LogPhase::Push),
            "deploy" => Some(LogPhase::Deploy),
            "rollback" => Some(LogPhase::Rollback),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentLogEntry {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub phase: LogPhase,
    pub level: LogLevel,
    pub message: String,
    pub metadata: Value,
}

pub fn channel_name(deployment_id: Uuid) -> String {
    format!("deployment:{deployment_id}")
}

/// Fan-out for live log subscribers.
#[async_trait]
pub trait LiveChannel: Send + Sync {
    async fn publish(&self, channel: &str, payload: &Value) -> Result<(), ClientError>;
}

/// Publishes through Postgres `NOTIFY`, so any process listening on the
/// channel (typically the HTTP layer's websocket bridge) sees the event.
#[derive(Clone)]
pub struct PgNotifyChannel {
    pool: PgPool,
}

impl PgNotifyChannel {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LiveChannel for PgNotifyChannel {
    async fn publish(&self, channel: &str, payload: &Value) -> Result<(), ClientError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(())
    }
}

/// In-process channel; used when the worker embeds its own subscribers.
#[derive(Clone)]
pub struct BroadcastChannel {
    tx: broadcast::Sender<(String, Value)>,
}

impl BroadcastChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, Value)> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl LiveChannel for BroadcastChannel {
    async fn publish(&self, channel: &str, payload: &Value) -> Result<(), ClientError> {
        // No receivers is not an error worth reporting.
        let _ = self.tx.send((channel.to_string(), payload.clone()));
        Ok(())
    }
}

/// Writes log entries for one deployment.
#[derive(Clone)]
pub struct DeploymentLogger {
    store: Arc<dyn Store>,
    live: Arc<dyn LiveChannel>,
    deployment_id: Uuid,
}

impl DeploymentLogger {
    pub fn new(store: Arc<dyn Store>, live: Arc<dyn LiveChannel>, deployment_id: Uuid) -> Self {
        Self {
            store,
            live,
            deployment_id,
        }
    }

    pub async fn log(&self, phase: LogPhase, level: LogLevel, message: &str, metadata: Value) {
        let entry = DeploymentLogEntry {
            id: Uuid::new_v4(),
            deployment_id: self.deployment_id,
            timestamp: Utc::now(),
            phase,
            level,
            message: message.to_string(),
            metadata,
        };

        match level {
            LogLevel::Info => {
                tracing::info!(deployment_id = %self.deployment_id, phase = phase.as_str(), "{message}")
            }
            LogLevel::Warn => {
                tracing::warn!(deployment_id = %self.deployment_id, phase = phase.as_str(), "{message}")
            }
            LogLevel::Error => {
                tracing::error!(deployment_id = %self.deployment_id, phase = phase.as_str(), "{message}")
            }
        }

        if let Err(e) = self.store.append_log(&entry).await {
            tracing::warn!(deployment_id = %self.deployment_id, error = %e, "failed to persist deployment log");
        }

        let payload = serde_json::to_value(&entry).unwrap_or_else(|_| json!({}));
        if let Err(e) = self
            .live
            .publish(&channel_name(self.deployment_id), &payload)
            .await
        {
            tracing::debug!(deployment_id = %self.deployment_id, error = %e, "live publish dropped");
        }
    }

    pub async fn info(&self, phase: LogPhase, message: &str) {
        self.log(phase, LogLevel::Info, message, json!({})).await
    }

    pub async fn info_with(&self, phase: LogPhase, message: &str, metadata: Value) {
        self.log(phase, LogLevel::Info, message, metadata).await
    }

    pub async fn warn(&self, phase: LogPhase, message: &str) {
        self.log(phase, LogLevel::Warn, message, json!({})).await
    }

    pub async fn error(&self, phase: LogPhase, message: &str) {
        self.log(phase, LogLevel::Error, message, json!({})).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn log_is_persisted_and_mirrored() {
        let store = Arc::new(MemoryStore::new());
        let live = Arc::new(BroadcastChannel::new(16));
        let mut rx = live.subscribe();
        let deployment_id = Uuid::new_v4();

        let logger = DeploymentLogger::new(store.clone(), live.clone(), deployment_id);
        logger
            .info_with(LogPhase::Build, "building image", json!({ "step": 1 }))
            .await;

        let logs = store.list_logs(deployment_id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].phase, LogPhase::Build);
        assert_eq!(logs[0].metadata["step"], 1);

        let (channel, payload) = rx.recv().await.unwrap();
        assert_eq!(channel, format!("deployment:{deployment_id}"));
        assert_eq!(payload["message"], "building image");
        assert_eq!(payload["level"], "info");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let live = BroadcastChannel::new(4);
        live.publish("deployment:x", &json!({})).await.unwrap();
    }
}
