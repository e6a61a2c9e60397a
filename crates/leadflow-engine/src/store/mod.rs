//! Checkpoint store
//!
//! Every committed transition is an immutable [`Checkpoint`] appended to the
//! instance's log. The store enforces the optimistic lock: a checkpoint is
//! accepted only when its version is exactly one past the latest stored
//! version. The current state of an instance is [`replay`] of its log.
//!
//! # Backends
//!
//! - [`MemoryCheckpointStore`]: in-process, for tests and short-lived runs
//! - [`FileCheckpointStore`]: one directory per instance, one file per
//!   version, optional zstd compression

mod file;

pub use file::FileCheckpointStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::approval::{ApprovalState, ApprovalTicket};
use crate::error::EngineError;
use crate::instance::{InstanceId, InstanceStatus, StageResult, WorkflowInstance};
use crate::negotiation::{AuctionResult, Settlement};

/// What a committed transition did, for the audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    Created,
    StageCommitted {
        stage: String,
        agent: Option<String>,
    },
    FanIn {
        stage: String,
        absent: Vec<String>,
    },
    AuctionSettled {
        stage: String,
        auction: AuctionResult,
        settlement: Settlement,
    },
    AuctionFallback {
        stage: String,
        error: String,
        degraded: Option<String>,
    },
    SkippedForward {
        stage: String,
        reason: String,
    },
    ApprovalRequested {
        stage: String,
        deadline: Option<DateTime<Utc>>,
    },
    ApprovalResolved {
        stage: String,
        state: ApprovalState,
        decided_by: Option<String>,
    },
    Dispatched {
        stage: String,
        idempotency_key: String,
    },
    Failed {
        stage: Option<String>,
        error: String,
    },
    Cancelled {
        reason: String,
    },
}

impl Transition {
    pub fn kind(&self) -> &'static str {
        match self {
            Transition::Created => "created",
            Transition::StageCommitted { .. } => "stage_committed",
            Transition::FanIn { .. } => "fan_in",
            Transition::AuctionSettled { .. } => "auction_settled",
            Transition::AuctionFallback { .. } => "auction_fallback",
            Transition::SkippedForward { .. } => "skipped_forward",
            Transition::ApprovalRequested { .. } => "approval_requested",
            Transition::ApprovalResolved { .. } => "approval_resolved",
            Transition::Dispatched { .. } => "dispatched",
            Transition::Failed { .. } => "failed",
            Transition::Cancelled { .. } => "cancelled",
        }
    }
}

/// Immutable snapshot written by one committed transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub instance_id: InstanceId,
    pub version: u64,
    pub status: InstanceStatus,
    pub stage_results: BTreeMap<String, StageResult>,
    pub budget_remaining: f64,
    pub visit_counts: BTreeMap<String, u32>,
    pub cursor: Option<String>,
    pub reason: Option<String>,
    pub approval: Option<ApprovalTicket>,
    /// Only on the genesis checkpoint; the payload never changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub transition: Transition,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// Snapshot `instance` as committed by `transition`
    pub fn snapshot(instance: &WorkflowInstance, transition: Transition) -> Self {
        Self {
            instance_id: instance.id.clone(),
            version: instance.version,
            status: instance.status,
            stage_results: instance.stage_results.clone(),
            budget_remaining: instance.budget_remaining,
            visit_counts: instance.visit_counts.clone(),
            cursor: instance.cursor.clone(),
            reason: instance.reason.clone(),
            approval: instance.approval.clone(),
            payload: (instance.version == 1).then(|| instance.payload.clone()),
            transition,
            timestamp: instance.updated_at,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.version == 1
    }
}

/// Fold one checkpoint onto the state reconstructed so far
fn fold(state: Option<WorkflowInstance>, checkpoint: &Checkpoint) -> Result<WorkflowInstance, EngineError> {
    let id = &checkpoint.instance_id;
    let (payload, created_at) = match state {
        None => {
            if !checkpoint.is_genesis() {
                return Err(EngineError::corrupt_chain(
                    id,
                    format!("chain starts at version {}", checkpoint.version),
                ));
            }
            let payload = checkpoint
                .payload
                .clone()
                .ok_or_else(|| EngineError::corrupt_chain(id, "genesis checkpoint without payload"))?;
            (payload, checkpoint.timestamp)
        }
        Some(previous) => {
            if previous.id != *id {
                return Err(EngineError::corrupt_chain(
                    id,
                    format!("checkpoint belongs to {}", previous.id),
                ));
            }
            if checkpoint.version != previous.version + 1 {
                return Err(EngineError::corrupt_chain(
                    id,
                    format!(
                        "version {} follows version {}",
                        checkpoint.version, previous.version
                    ),
                ));
            }
            (previous.payload, previous.created_at)
        }
    };

    Ok(WorkflowInstance {
        id: id.clone(),
        payload,
        stage_results: checkpoint.stage_results.clone(),
        status: checkpoint.status,
        budget_remaining: checkpoint.budget_remaining,
        version: checkpoint.version,
        visit_counts: checkpoint.visit_counts.clone(),
        cursor: checkpoint.cursor.clone(),
        reason: checkpoint.reason.clone(),
        approval: checkpoint.approval.clone(),
        created_at,
        updated_at: checkpoint.timestamp,
    })
}

/// Reconstruct an instance from its ordered checkpoint chain.
///
/// Pure: no agent, auction or store access. `None` for an empty chain.
pub fn replay(chain: &[Checkpoint]) -> Result<Option<WorkflowInstance>, EngineError> {
    chain
        .iter()
        .try_fold(None, |state, checkpoint| fold(state, checkpoint).map(Some))
}

/// Append-only checkpoint log
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint.
    ///
    /// Fails with [`EngineError::OptimisticLockConflict`] unless
    /// `checkpoint.version` is the latest stored version plus one.
    async fn append(&self, checkpoint: &Checkpoint) -> Result<(), EngineError>;

    /// All checkpoints of an instance, oldest first
    async fn chain(&self, id: &InstanceId) -> Result<Vec<Checkpoint>, EngineError>;

    /// Latest stored version, `None` for unknown instances
    async fn latest_version(&self, id: &InstanceId) -> Result<Option<u64>, EngineError>;

    /// Every known instance id, sorted
    async fn instances(&self) -> Result<Vec<InstanceId>, EngineError>;

    /// Checkpoints with `from <= timestamp < to`, across all instances
    async fn range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Checkpoint>, EngineError> {
        let mut found = Vec::new();
        for id in self.instances().await? {
            found.extend(
                self.chain(&id)
                    .await?
                    .into_iter()
                    .filter(|c| c.timestamp >= from && c.timestamp < to),
            );
        }
        found.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
                .then_with(|| a.version.cmp(&b.version))
        });
        Ok(found)
    }

    /// Current state of an instance
    async fn load(&self, id: &InstanceId) -> Result<WorkflowInstance, EngineError> {
        let chain = self.chain(id).await?;
        replay(&chain)?.ok_or_else(|| EngineError::InstanceNotFound(id.clone()))
    }
}

/// In-memory checkpoint store
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    logs: RwLock<HashMap<InstanceId, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn append(&self, checkpoint: &Checkpoint) -> Result<(), EngineError> {
        let mut logs = self.logs.write().await;
        let log = logs.entry(checkpoint.instance_id.clone()).or_default();
        let latest = log.last().map(|c| c.version).unwrap_or(0);
        if checkpoint.version != latest + 1 {
            return Err(EngineError::conflict(
                &checkpoint.instance_id,
                checkpoint.version.saturating_sub(1),
                latest,
            ));
        }
        log.push(checkpoint.clone());
        Ok(())
    }

    async fn chain(&self, id: &InstanceId) -> Result<Vec<Checkpoint>, EngineError> {
        Ok(self.logs.read().await.get(id).cloned().unwrap_or_default())
    }

    async fn latest_version(&self, id: &InstanceId) -> Result<Option<u64>, EngineError> {
        Ok(self
            .logs
            .read()
            .await
            .get(id)
            .and_then(|log| log.last())
            .map(|c| c.version))
    }

    async fn instances(&self) -> Result<Vec<InstanceId>, EngineError> {
        let logs = self.logs.read().await;
        let mut ids: Vec<InstanceId> = logs
            .iter()
            .filter(|(_, log)| !log.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// Store backend selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    File {
        path: PathBuf,
        #[serde(default)]
        compression: bool,
    },
}

/// Create a checkpoint store from configuration
pub fn create_store(config: &StoreConfig) -> Arc<dyn CheckpointStore> {
    match config {
        StoreConfig::Memory => Arc::new(MemoryCheckpointStore::new()),
        StoreConfig::File { path, compression } => {
            Arc::new(FileCheckpointStore::new(path.clone(), *compression))
        }
    }
}
