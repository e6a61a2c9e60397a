//! Error types for the workflow engine
//!
//! Three layers: [`AgentError`] is what a single agent invocation returns,
//! [`AuctionError`] is what the negotiation coordinator returns, and
//! [`EngineError`] is what the executor surfaces to callers.

use thiserror::Error;

use crate::graph::GraphBuildError;
use crate::instance::InstanceId;

/// Errors returned by an agent invocation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    /// Temporary failure; the stage retry policy applies
    #[error("transient: {0}")]
    Transient(String),

    /// Permanent failure; retrying will not help
    #[error("fatal: {0}")]
    Fatal(String),

    /// Agent did not answer within its time budget
    #[error("agent {0} timed out")]
    Timeout(String),

    /// The owning instance was cancelled while the agent ran
    #[error("cancelled")]
    Cancelled,
}

impl AgentError {
    /// Create a transient error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Create a fatal error
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Whether the retry policy applies to this error
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Transient(_) | AgentError::Timeout(_))
    }
}

/// Auction outcomes that block a win
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AuctionError {
    /// No valid bid arrived before the deadline
    #[error("no bids for task {task}")]
    NoBids { task: String },

    /// Clearing price exceeds the instance budget
    #[error("budget exceeded: clearing price {required:.4} > remaining {remaining:.4}")]
    BudgetExceeded { required: f64, remaining: f64 },

    /// Winning bid does not meet the task minimum
    #[error("quality {quality} below minimum {minimum} for task {task}")]
    QualityBelowThreshold {
        task: String,
        quality: u8,
        minimum: u8,
    },
}

impl AuctionError {
    /// Short machine-readable code, used as the instance reason
    pub fn code(&self) -> &'static str {
        match self {
            AuctionError::NoBids { .. } => "no_bids",
            AuctionError::BudgetExceeded { .. } => "budget_exhausted",
            AuctionError::QualityBelowThreshold { .. } => "quality_below_threshold",
        }
    }
}

/// Errors that can occur while driving workflow instances
#[derive(Debug, Error)]
pub enum EngineError {
    /// Stage failed permanently or exhausted its retries
    #[error("stage {stage} failed after {attempts} attempt(s): {message}")]
    StageFailure {
        stage: String,
        attempts: u32,
        message: String,
    },

    /// Auction could not produce a win
    #[error(transparent)]
    Auction(#[from] AuctionError),

    /// Commit submitted against a stale version
    #[error("version conflict on {instance_id}: expected {expected}, found {found}")]
    OptimisticLockConflict {
        instance_id: InstanceId,
        expected: u64,
        found: u64,
    },

    /// A stage was visited more often than allowed
    #[error("cycle limit exceeded at {stage}: visit {visits}, limit {limit}")]
    CycleLimitExceeded {
        stage: String,
        visits: u32,
        limit: u32,
    },

    /// A reviewer decision arrived after the approval deadline
    #[error("approval timed out for {0}")]
    ApprovalTimeout(InstanceId),

    /// Unknown instance id
    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceId),

    /// Operation not valid in the instance's current state
    #[error("invalid transition for {instance_id}: {message}")]
    InvalidTransition {
        instance_id: InstanceId,
        message: String,
    },

    /// No outgoing edge matched, or the cursor points nowhere
    #[error("routing error at {stage}: {message}")]
    Routing { stage: String, message: String },

    /// Storage failure
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Checkpoint chain does not fold into a valid instance
    #[error("corrupt checkpoint chain for {instance_id}: {message}")]
    CorruptChain {
        instance_id: InstanceId,
        message: String,
    },

    /// Invalid engine configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid workflow graph
    #[error(transparent)]
    Graph(#[from] GraphBuildError),

    /// Instance cancelled while work was in flight
    #[error("instance {0} cancelled")]
    Cancelled(InstanceId),
}

impl EngineError {
    /// Create a stage failure
    pub fn stage_failure(stage: impl Into<String>, attempts: u32, message: impl Into<String>) -> Self {
        Self::StageFailure {
            stage: stage.into(),
            attempts,
            message: message.into(),
        }
    }

    /// Create a cycle limit error
    pub fn cycle_limit(stage: impl Into<String>, visits: u32, limit: u32) -> Self {
        Self::CycleLimitExceeded {
            stage: stage.into(),
            visits,
            limit,
        }
    }

    /// Create a version conflict error
    pub fn conflict(instance_id: &InstanceId, expected: u64, found: u64) -> Self {
        Self::OptimisticLockConflict {
            instance_id: instance_id.clone(),
            expected,
            found,
        }
    }

    /// Create an invalid transition error
    pub fn invalid_transition(instance_id: &InstanceId, message: impl Into<String>) -> Self {
        Self::InvalidTransition {
            instance_id: instance_id.clone(),
            message: message.into(),
        }
    }

    /// Create a routing error
    pub fn routing(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Routing {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Create a checkpoint error
    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    /// Create a corrupt chain error
    pub fn corrupt_chain(instance_id: &InstanceId, message: impl Into<String>) -> Self {
        Self::CorruptChain {
            instance_id: instance_id.clone(),
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Check if the operation may succeed when retried on fresh state
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::OptimisticLockConflict { .. } | EngineError::Checkpoint(_)
        )
    }

    /// Check if the error is a version conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::OptimisticLockConflict { .. })
    }

    /// Short reason recorded on an instance that ends because of this error
    pub fn reason(&self) -> String {
        match self {
            EngineError::CycleLimitExceeded { .. } => "cycle_limit_exceeded".to_string(),
            EngineError::Auction(e) => e.code().to_string(),
            EngineError::ApprovalTimeout(_) => "approval_timeout".to_string(),
            EngineError::Cancelled(_) => "cancelled".to_string(),
            other => other.to_string(),
        }
    }
}
