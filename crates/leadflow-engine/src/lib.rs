//! leadflow-engine: checkpointed multi-agent workflow engine
//!
//! Moves work items ("instances") through a directed graph of stages run by
//! independent agents:
//! - WorkflowGraph: stages, predicate edges, bounded cycles
//! - AgentRuntime: timeouts, retry with backoff, cancellable fan-out
//! - NegotiationCoordinator: sealed-bid auctions with second-price clearing
//!   against a per-instance budget
//! - ApprovalTicket: auto-approval threshold, human review, timeout default
//! - CheckpointStore: append-only versioned history with optimistic locking;
//!   state is always a replay of the chain
//!
//! # Example
//!
//! ```rust,ignore
//! use leadflow_engine::lead::{default_registry, lead_pipeline};
//! use leadflow_engine::{EngineConfig, MemoryCheckpointStore, WorkflowExecutor};
//!
//! let config = EngineConfig::default();
//! let executor = WorkflowExecutor::new(
//!     lead_pipeline()?,
//!     default_registry(&config),
//!     Arc::new(MemoryCheckpointStore::new()),
//!     config,
//! )?;
//!
//! let id = executor.submit(serde_json::json!({"company": "Acme"})).await?;
//! let status = executor.run(&id).await?;
//! ```

pub mod agent;
pub mod approval;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod instance;
pub mod lead;
pub mod negotiation;
pub mod sink;
pub mod store;

// Re-exports for convenience
pub use agent::{Agent, AgentInput, AgentRegistry, AgentRuntime, Evaluation, StageOutcome};
pub use approval::{ApprovalConfig, ApprovalDecision, ApprovalState, ApprovalTicket, ReviewRequest};
pub use config::{EngineConfig, RetryPolicy};
pub use error::{AgentError, AuctionError, EngineError};
pub use executor::WorkflowExecutor;
pub use graph::{AuctionStage, Branch, BuiltGraph, GraphBuildError, Predicate, Stage, StageKind, WorkflowGraph, END};
pub use instance::{InstanceId, InstanceStatus, StageResult, WorkflowInstance};
pub use negotiation::{
    clear_auction, AuctionPolicy, AuctionResult, Bid, BidBook, NegotiationCoordinator, PricingRule, Settlement,
};
pub use sink::{
    ActionRequest, ActionSink, DeliveryReceipt, LogActionSink, LogNotificationSink, MemoryActionSink,
    MemoryNotificationSink, NotificationSink, SinkError,
};
pub use store::{
    create_store, replay, Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, StoreConfig,
    Transition,
};
