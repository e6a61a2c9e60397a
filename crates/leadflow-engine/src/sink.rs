//! Outbound sinks: reviewer notifications and approved actions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::approval::ReviewRequest;
use crate::error::AgentError;
use crate::instance::InstanceId;

/// Delivery failures reported by a sink
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SinkError {
    /// Temporary; dispatch is retried
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    /// Permanent
    #[error("sink rejected the request: {0}")]
    Rejected(String),
}

impl From<SinkError> for AgentError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::Unavailable(msg) => AgentError::Transient(msg),
            SinkError::Rejected(msg) => AgentError::Fatal(msg),
        }
    }
}

/// An approved side effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub instance_id: InstanceId,
    pub stage: String,
    /// Same key for every attempt of the same stage visit
    pub idempotency_key: String,
    pub payload: Value,
    /// Outputs of the stages the action carries, by stage name
    pub body: BTreeMap<String, Value>,
}

/// Acknowledgement of a delivered action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub delivery_id: String,
    pub delivered_at: DateTime<Utc>,
}

/// Reviewer channel
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, request: &ReviewRequest) -> Result<(), SinkError>;
}

/// Downstream system receiving approved actions
#[async_trait]
pub trait ActionSink: Send + Sync {
    /// Deliver an action; implementations must honor the idempotency key
    async fn dispatch(&self, action: &ActionRequest) -> Result<DeliveryReceipt, SinkError>;
}

/// Notification sink that only logs
#[derive(Debug, Default, Clone)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, request: &ReviewRequest) -> Result<(), SinkError> {
        info!(
            instance = %request.instance_id,
            deadline = ?request.deadline,
            "review requested: {}",
            request.summary
        );
        Ok(())
    }
}

/// Action sink that only logs
#[derive(Debug, Default, Clone)]
pub struct LogActionSink;

#[async_trait]
impl ActionSink for LogActionSink {
    async fn dispatch(&self, action: &ActionRequest) -> Result<DeliveryReceipt, SinkError> {
        info!(
            instance = %action.instance_id,
            key = %action.idempotency_key,
            parts = ?action.body.keys().collect::<Vec<_>>(),
            "action dispatched"
        );
        Ok(DeliveryReceipt {
            delivery_id: action.idempotency_key.clone(),
            delivered_at: Utc::now(),
        })
    }
}

/// Notification sink that records requests
#[derive(Debug, Default)]
pub struct MemoryNotificationSink {
    requests: Mutex<Vec<ReviewRequest>>,
}

impl MemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn requests(&self) -> Vec<ReviewRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn notify(&self, request: &ReviewRequest) -> Result<(), SinkError> {
        self.requests.lock().await.push(request.clone());
        Ok(())
    }
}

/// Action sink that records deliveries, deduplicated by idempotency key
#[derive(Debug, Default)]
pub struct MemoryActionSink {
    delivered: Mutex<BTreeMap<String, (ActionRequest, DeliveryReceipt)>>,
    /// Calls to `dispatch`, including duplicates
    calls: Mutex<u32>,
}

impl MemoryActionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn actions(&self) -> Vec<ActionRequest> {
        self.delivered
            .lock()
            .await
            .values()
            .map(|(action, _)| action.clone())
            .collect()
    }

    pub async fn calls(&self) -> u32 {
        *self.calls.lock().await
    }
}

#[async_trait]
impl ActionSink for MemoryActionSink {
    async fn dispatch(&self, action: &ActionRequest) -> Result<DeliveryReceipt, SinkError> {
        *self.calls.lock().await += 1;
        let mut delivered = self.delivered.lock().await;
        let (_, receipt) = delivered
            .entry(action.idempotency_key.clone())
            .or_insert_with(|| {
                (
                    action.clone(),
                    DeliveryReceipt {
                        delivery_id: format!("delivery-{}", action.idempotency_key),
                        delivered_at: Utc::now(),
                    },
                )
            });
        Ok(receipt.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(key: &str) -> ActionRequest {
        ActionRequest {
            instance_id: InstanceId::new("lead-1"),
            stage: "dispatch".into(),
            idempotency_key: key.into(),
            payload: json!({"email": "a@b.com"}),
            body: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_memory_action_sink_deduplicates() {
        let sink = MemoryActionSink::new();
        let first = sink.dispatch(&action("lead-1:dispatch:1")).await.unwrap();
        let again = sink.dispatch(&action("lead-1:dispatch:1")).await.unwrap();
        sink.dispatch(&action("lead-2:dispatch:1")).await.unwrap();

        assert_eq!(first, again);
        assert_eq!(sink.actions().await.len(), 2);
        assert_eq!(sink.calls().await, 3);
    }

    #[tokio::test]
    async fn test_log_sinks_ack() {
        let receipt = LogActionSink.dispatch(&action("k")).await.unwrap();
        assert_eq!(receipt.delivery_id, "k");

        let request = ReviewRequest {
            instance_id: InstanceId::new("lead-1"),
            stage: "approval".into(),
            score: Some(65.0),
            threshold: 90,
            deadline: None,
            summary: "Acme: score 65".into(),
        };
        assert!(LogNotificationSink.notify(&request).await.is_ok());
    }

    #[test]
    fn test_sink_error_mapping() {
        assert!(AgentError::from(SinkError::Unavailable("503".into())).is_transient());
        assert!(!AgentError::from(SinkError::Rejected("bad address".into())).is_transient());
    }
}
