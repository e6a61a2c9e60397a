//! Integration tests for checkpoint recovery and concurrent writers
//!
//! These tests verify that instance state is always a replay of the
//! checkpoint chain:
//! - Resume from the file store after the process is gone
//! - One unreadable instance does not block recovery of the others
//! - Replay is deterministic and matches the live instance
//! - Concurrent advances never lose or duplicate a transition
//! - Cancellation aborts in-flight agents and is terminal
//! - Dispatch retries reuse one idempotency key

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tempfile::tempdir;

use leadflow_engine::lead::{default_registry, lead_pipeline, QUALIFY, RESEARCH};
use leadflow_engine::{
    replay, ActionRequest, ActionSink, Agent, AgentError, AgentInput, AgentRegistry, ApprovalConfig, Checkpoint, CheckpointStore,
    DeliveryReceipt, EngineConfig, Evaluation, FileCheckpointStore, InstanceStatus, MemoryCheckpointStore,
    RetryPolicy, SinkError, StageKind, Transition, WorkflowExecutor, WorkflowGraph, END,
};

fn ceo_lead(id: &str) -> Value {
    json!({
        "id": id,
        "title": "CEO",
        "email": "ceo@acme.io",
        "company": "Acme",
        "summary": "Logistics software",
        "headquarters": "Berlin",
        "employee_count": 250,
        "founded": 2015,
        "careers_url": "https://acme.io/careers",
        "tech_stack": ["Rust", "Postgres", "Kafka", "Kubernetes", "React"],
        "open_roles": 12,
        "hiring_departments": ["engineering"],
        "hiring_locations": ["Berlin"],
        "recent_news": [{"title": "Acme raises Series B"}],
        "hooks": ["Congrats on the Series B", "Saw the Kafka migration post"],
        "linkedin_url": "https://linkedin.com/in/ceo"
    })
}

fn lead_executor(store: Arc<dyn CheckpointStore>, config: EngineConfig) -> WorkflowExecutor {
    WorkflowExecutor::new(
        lead_pipeline().expect("Failed to build lead pipeline"),
        default_registry(&config),
        store,
        config,
    )
    .expect("Failed to create executor")
}

// =============================================================================
// Resume and Replay
// =============================================================================

/// An instance interrupted mid-pipeline resumes from the file store in a new executor
#[tokio::test]
async fn test_resume_from_file_store() {
    let dir = tempdir().expect("Failed to create temp dir");

    let id = {
        let store = Arc::new(FileCheckpointStore::new(dir.path(), true));
        let executor = lead_executor(store, EngineConfig::default());
        let id = executor.submit(ceo_lead("lead-resume")).await.expect("submit failed");
        assert_eq!(executor.advance(&id).await.expect("advance failed"), InstanceStatus::Running);
        assert_eq!(executor.advance(&id).await.expect("advance failed"), InstanceStatus::Running);
        id
    };

    let store = Arc::new(FileCheckpointStore::new(dir.path(), true));
    let executor = Arc::new(lead_executor(store, EngineConfig::default()));
    let before = executor.load(&id).await.expect("load failed");
    assert_eq!(before.version, 3);
    assert_eq!(before.cursor.as_deref(), Some("compose"));

    let resumed = executor.resume_all().await.expect("resume failed");
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].0, id);
    assert_eq!(*resumed[0].1.as_ref().expect("run failed"), InstanceStatus::Completed);

    // Research and qualification are not repeated
    let instance = executor.load(&id).await.expect("load failed");
    assert_eq!(instance.visits(RESEARCH), 1);
    assert_eq!(instance.visits(QUALIFY), 1);

    // Nothing left to resume
    assert!(executor.resume_all().await.expect("resume failed").is_empty());
}

/// A directory left by an interrupted write and a chain that no longer decodes
/// do not stop recovery or the timeout sweep for healthy instances
#[tokio::test]
async fn test_resume_isolates_unreadable_instances() {
    let dir = tempdir().expect("Failed to create temp dir");
    let store = Arc::new(FileCheckpointStore::new(dir.path(), false));
    let config = EngineConfig::default().with_approval(
        ApprovalConfig::default()
            .with_threshold(100)
            .with_timeout(Duration::from_millis(20)),
    );
    let executor = Arc::new(lead_executor(store, config));
    let id = executor.submit(ceo_lead("lead-ok")).await.expect("submit failed");

    std::fs::create_dir(dir.path().join("lead-crashed")).expect("Failed to create dir");
    std::fs::create_dir(dir.path().join("lead-corrupt")).expect("Failed to create dir");
    std::fs::write(dir.path().join("lead-corrupt/checkpoint_00000001.ckpt"), b"not json")
        .expect("Failed to write file");

    let resumed = executor.resume_all().await.expect("resume failed");
    let ids: Vec<&str> = resumed.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["lead-corrupt", "lead-ok"]);
    assert!(resumed[0].1.is_err());
    assert_eq!(
        *resumed[1].1.as_ref().expect("run failed"),
        InstanceStatus::WaitingApproval
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    let swept = executor.sweep_timeouts().await.expect("sweep failed");
    assert_eq!(swept, vec![(id.clone(), InstanceStatus::Rejected)]);
    assert_eq!(
        executor.load(&id).await.expect("load failed").reason.as_deref(),
        Some("approval_timeout")
    );
}

/// Replaying the chain twice yields the same instance the executor loads
#[tokio::test]
async fn test_replay_matches_live_state() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = lead_executor(store.clone(), EngineConfig::default());
    let id = executor.submit(ceo_lead("lead-replay")).await.expect("submit failed");
    executor.run(&id).await.expect("run failed");

    let chain = store.chain(&id).await.expect("chain failed");
    let first = replay(&chain).expect("replay failed").expect("empty chain");
    let second = replay(&chain).expect("replay failed").expect("empty chain");
    assert_eq!(first, second);
    assert_eq!(first, executor.load(&id).await.expect("load failed"));

    // Every prefix of the chain replays to the state committed at that version
    for n in 1..=chain.len() {
        let partial = replay(&chain[..n]).expect("replay failed").expect("empty chain");
        assert_eq!(partial.version, n as u64);
        assert_eq!(partial.status, chain[n - 1].status);
    }
}

/// The audit range query returns checkpoints of every instance in time order
#[tokio::test]
async fn test_audit_range() {
    let executor = lead_executor(Arc::new(MemoryCheckpointStore::new()), EngineConfig::default());
    let start = Utc::now();
    let a = executor.submit(ceo_lead("lead-a")).await.expect("submit failed");
    let b = executor.submit(ceo_lead("lead-b")).await.expect("submit failed");
    executor.run(&a).await.expect("run failed");
    executor.run(&b).await.expect("run failed");
    let end = Utc::now() + chrono::Duration::seconds(1);

    let all = executor.audit_range(start, end).await.expect("range failed");
    let expected = executor.audit(&a).await.expect("audit failed").len() + executor.audit(&b).await.expect("audit failed").len();
    assert_eq!(all.len(), expected);
    assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    assert!(executor.audit_range(end, end).await.expect("range failed").is_empty());
}

// =============================================================================
// Concurrent Writers
// =============================================================================

/// Two writers advancing one instance commit contiguous versions without repeating a stage
#[tokio::test]
async fn test_concurrent_advance_no_lost_updates() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let first = lead_executor(store.clone(), EngineConfig::default());
    let second = lead_executor(store.clone(), EngineConfig::default());
    let id = first.submit(ceo_lead("lead-race")).await.expect("submit failed");

    let (a, b) = tokio::join!(first.advance(&id), second.advance(&id));
    assert_eq!(a.expect("first advance failed"), InstanceStatus::Running);
    assert_eq!(b.expect("second advance failed"), InstanceStatus::Running);

    let chain = store.chain(&id).await.expect("chain failed");
    let versions: Vec<u64> = chain.iter().map(|c| c.version).collect();
    assert_eq!(versions, vec![1, 2, 3]);

    let instance = first.load(&id).await.expect("load failed");
    assert_eq!(instance.visits(RESEARCH), 1);
    assert_eq!(instance.visits(QUALIFY), 1);
}

/// A stale checkpoint is refused by the store
#[tokio::test]
async fn test_stale_append_conflicts() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = lead_executor(store.clone(), EngineConfig::default());
    let id = executor.submit(ceo_lead("lead-stale")).await.expect("submit failed");

    let stale = executor.load(&id).await.expect("load failed");
    executor.advance(&id).await.expect("advance failed");

    let mut next = stale.successor();
    next.reason = Some("stale writer".to_string());
    let err = store
        .append(&Checkpoint::snapshot(&next, Transition::Cancelled { reason: "stale".into() }))
        .await
        .expect_err("stale append succeeded");
    assert!(err.is_conflict());
    assert_eq!(store.latest_version(&id).await.expect("version failed"), Some(2));
}

/// Running many instances at once completes each of them independently
#[tokio::test]
async fn test_run_many() {
    let executor = Arc::new(lead_executor(Arc::new(MemoryCheckpointStore::new()), EngineConfig::default()));
    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(executor.submit(ceo_lead(&format!("lead-{n}"))).await.expect("submit failed"));
    }

    let results = executor.run_many(ids.clone()).await;
    assert_eq!(results.len(), 5);
    for (id, result) in results {
        assert_eq!(result.expect("run failed"), InstanceStatus::Completed, "{id}");
    }
}

// =============================================================================
// Cancellation
// =============================================================================

struct Stalled;

#[async_trait]
impl Agent for Stalled {
    fn id(&self) -> &str {
        "stalled"
    }

    async fn evaluate(&self, _input: &AgentInput) -> Result<Evaluation, AgentError> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(Evaluation::produced(json!({})))
    }
}

/// Cancelling aborts the in-flight agent and leaves the instance failed
#[tokio::test]
async fn test_cancel_in_flight() {
    let graph = WorkflowGraph::new()
        .stage("slow", StageKind::agent("stalled"))
        .entry("slow")
        .edge("slow", END)
        .build()
        .expect("Failed to build graph");
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = Arc::new(
        WorkflowExecutor::new(
            graph,
            AgentRegistry::new().with_agent(Arc::new(Stalled)),
            store.clone(),
            EngineConfig::default(),
        )
        .expect("Failed to create executor"),
    );
    let id = executor.submit(json!({})).await.expect("submit failed");

    let runner = {
        let executor = Arc::clone(&executor);
        let id = id.clone();
        tokio::spawn(async move { executor.run(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = executor.cancel(&id, "operator request").await.expect("cancel failed");
    assert_eq!(status, InstanceStatus::Failed);

    let finished = tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .expect("run did not stop after cancel")
        .expect("run task panicked")
        .expect("run failed");
    assert_eq!(finished, InstanceStatus::Failed);

    let chain = store.chain(&id).await.expect("chain failed");
    assert_eq!(chain.len(), 2);
    assert!(matches!(chain[1].transition, Transition::Cancelled { .. }));
}

// =============================================================================
// Dispatch Idempotency
// =============================================================================

/// Action sink that is unavailable for the first `failures` calls
struct FlakySink {
    failures: u32,
    calls: AtomicU32,
    keys: tokio::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl ActionSink for FlakySink {
    async fn dispatch(&self, action: &ActionRequest) -> Result<DeliveryReceipt, SinkError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.keys.lock().await.push(action.idempotency_key.clone());
        if call < self.failures {
            return Err(SinkError::Unavailable("crm returned 503".into()));
        }
        Ok(DeliveryReceipt {
            delivery_id: format!("crm-{call}"),
            delivered_at: Utc::now(),
        })
    }
}

/// Transient sink failures are retried with the same idempotency key
#[tokio::test]
async fn test_dispatch_retry_reuses_key() {
    let sink = Arc::new(FlakySink {
        failures: 2,
        calls: AtomicU32::new(0),
        keys: tokio::sync::Mutex::new(Vec::new()),
    });
    let config = EngineConfig::default()
        .with_retry_policy(RetryPolicy::new(3).with_backoff_base(Duration::from_millis(1)));
    let executor = lead_executor(Arc::new(MemoryCheckpointStore::new()), config).with_action_sink(sink.clone());

    let id = executor.submit(ceo_lead("lead-flaky")).await.expect("submit failed");
    assert_eq!(executor.run(&id).await.expect("run failed"), InstanceStatus::Completed);

    assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    let keys = sink.keys.lock().await.clone();
    assert!(keys.iter().all(|k| k == "lead-flaky:dispatch:1"));

    let instance = executor.load(&id).await.expect("load failed");
    let receipt = instance.output("dispatch").expect("no receipt");
    assert_eq!(receipt["delivery_id"], json!("crm-2"));
    assert_eq!(instance.result("dispatch").expect("no result").attempts, 3);
}

/// A rejecting sink fails the instance without retrying
#[tokio::test]
async fn test_dispatch_rejected_fails() {
    struct Rejecting;

    #[async_trait]
    impl ActionSink for Rejecting {
        async fn dispatch(&self, _action: &ActionRequest) -> Result<DeliveryReceipt, SinkError> {
            Err(SinkError::Rejected("invalid address".into()))
        }
    }

    let executor = lead_executor(Arc::new(MemoryCheckpointStore::new()), EngineConfig::default())
        .with_action_sink(Arc::new(Rejecting));
    let id = executor.submit(ceo_lead("lead-bounce")).await.expect("submit failed");
    assert_eq!(executor.run(&id).await.expect("run failed"), InstanceStatus::Failed);

    let instance = executor.load(&id).await.expect("load failed");
    assert!(instance.reason.as_ref().expect("no reason").contains("invalid address"));
    assert_eq!(instance.result("dispatch").expect("no result").attempts, 1);
}
