//! Workflow executor
//!
//! Drives instances through a [`BuiltGraph`]. Each call to
//! [`WorkflowExecutor::advance`] performs exactly one transition:
//!
//! 1. load the instance by replaying its checkpoint chain
//! 2. run the stage under the cursor (agent, fan-out, auction, approval or
//!    action)
//! 3. append the resulting checkpoint against the loaded version
//!
//! A version conflict in step 3 means another writer committed first; the
//! executor reloads and redoes the stage decision, up to
//! `max_commit_attempts` times. Side effects that must not repeat
//! (reviewer notifications) run only after a successful append.
//!
//! Every successful append cancels the instance's token, so other in-process
//! work planned against the older version stops waiting on agents, bids or
//! the action sink and replans against the new one.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::agent::{AgentInput, AgentRegistry, AgentRuntime, Evaluation, StageOutcome};
use crate::approval::{ApprovalDecision, ApprovalTicket, ReviewRequest};
use crate::config::{EngineConfig, RetryPolicy};
use crate::error::{AgentError, AuctionError, EngineError};
use crate::graph::{AuctionStage, Branch, BuiltGraph, StageKind, END};
use crate::instance::{InstanceId, InstanceStatus, StageResult, WorkflowInstance};
use crate::negotiation::NegotiationCoordinator;
use crate::sink::{ActionRequest, ActionSink, LogActionSink, LogNotificationSink, NotificationSink, SinkError};
use crate::store::{Checkpoint, CheckpointStore, Transition};

/// Work done only once the transition is durable
enum Effect {
    Notify(ReviewRequest),
}

/// A transition ready to be appended
struct Planned {
    next: WorkflowInstance,
    transition: Transition,
    effects: Vec<Effect>,
    /// The reviewer's decision arrived too late and was replaced by the default
    late_decision: bool,
}

impl Planned {
    fn new(next: WorkflowInstance, transition: Transition) -> Self {
        Self {
            next,
            transition,
            effects: Vec::new(),
            late_decision: false,
        }
    }

    fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

enum Command<'a> {
    Advance,
    Decide {
        decision: ApprovalDecision,
        reviewer: &'a str,
    },
    Cancel {
        reason: &'a str,
    },
}

/// Executes workflow instances against a graph, a registry and a store
pub struct WorkflowExecutor {
    graph: Arc<BuiltGraph>,
    store: Arc<dyn CheckpointStore>,
    runtime: AgentRuntime,
    coordinator: NegotiationCoordinator,
    notifier: Arc<dyn NotificationSink>,
    actions: Arc<dyn ActionSink>,
    config: EngineConfig,
    tokens: Mutex<HashMap<InstanceId, CancellationToken>>,
}

impl WorkflowExecutor {
    /// Create an executor.
    ///
    /// Fails when the configuration is invalid or a stage references an
    /// agent the registry does not know. Agents listed in
    /// `config.disabled_agents` are disabled in the registry.
    pub fn new(
        graph: BuiltGraph,
        registry: AgentRegistry,
        store: Arc<dyn CheckpointStore>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let registry = registry.with_disabled(config.disabled_agents.iter().cloned());

        for stage in graph.stages() {
            let agents: Vec<&String> = match &stage.kind {
                StageKind::Agent { agent } => vec![agent],
                StageKind::FanOut { branches } => branches.iter().map(|b| &b.agent).collect(),
                StageKind::Auction(auction) => auction.participants.iter().collect(),
                StageKind::Approval { .. } | StageKind::Action { .. } => Vec::new(),
            };
            if let Some(missing) = agents.into_iter().find(|a| !registry.contains(a)) {
                return Err(EngineError::config(format!(
                    "stage {} references unregistered agent {}",
                    stage.name, missing
                )));
            }
        }

        let runtime = AgentRuntime::new(Arc::new(registry), config.agent_timeout, config.parallelism);
        let coordinator = NegotiationCoordinator::new(runtime.clone(), config.auction.clone());
        Ok(Self {
            graph: Arc::new(graph),
            store,
            runtime,
            coordinator,
            notifier: Arc::new(LogNotificationSink),
            actions: Arc::new(LogActionSink),
            config,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Set the reviewer notification channel
    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Set the sink receiving approved actions
    pub fn with_action_sink(mut self, actions: Arc<dyn ActionSink>) -> Self {
        self.actions = actions;
        self
    }

    pub fn graph(&self) -> &BuiltGraph {
        &self.graph
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Create an instance for `payload`.
    ///
    /// The id is taken from the payload's `"id"` string field, or generated.
    pub async fn submit(&self, payload: Value) -> Result<InstanceId, EngineError> {
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .map(InstanceId::new)
            .unwrap_or_else(InstanceId::generate);
        self.submit_with_id(id, payload).await
    }

    /// Create an instance with an explicit id
    pub async fn submit_with_id(&self, id: InstanceId, payload: Value) -> Result<InstanceId, EngineError> {
        let instance = WorkflowInstance::new(
            id.clone(),
            payload,
            self.config.initial_budget,
            self.graph.entry(),
        );
        match self
            .store
            .append(&Checkpoint::snapshot(&instance, Transition::Created))
            .await
        {
            Ok(()) => {
                info!(instance = %id, budget = instance.budget_remaining, "instance created");
                Ok(id)
            }
            Err(e) if e.is_conflict() => Err(EngineError::invalid_transition(&id, "instance already exists")),
            Err(e) => Err(e),
        }
    }

    /// Current state, reconstructed from the checkpoint chain
    pub async fn load(&self, id: &InstanceId) -> Result<WorkflowInstance, EngineError> {
        self.store.load(id).await
    }

    /// Full checkpoint chain of an instance
    pub async fn audit(&self, id: &InstanceId) -> Result<Vec<Checkpoint>, EngineError> {
        let chain = self.store.chain(id).await?;
        if chain.is_empty() {
            return Err(EngineError::InstanceNotFound(id.clone()));
        }
        Ok(chain)
    }

    /// Checkpoints committed in `[from, to)` across all instances
    pub async fn audit_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Checkpoint>, EngineError> {
        self.store.range(from, to).await
    }

    /// Perform one transition and return the resulting status
    #[instrument(skip(self, id), fields(instance = %id))]
    pub async fn advance(&self, id: &InstanceId) -> Result<InstanceStatus, EngineError> {
        self.execute(id, Command::Advance).await
    }

    /// Advance until the instance is terminal or waiting for approval
    pub async fn run(&self, id: &InstanceId) -> Result<InstanceStatus, EngineError> {
        let limit = self.graph.step_limit(self.config.max_visits);
        for _ in 0..limit {
            let status = self.advance(id).await?;
            if status.is_terminal() || status == InstanceStatus::WaitingApproval {
                return Ok(status);
            }
        }
        Err(EngineError::routing(
            id.as_str(),
            format!("no terminal state after {limit} transitions"),
        ))
    }

    /// Run several instances concurrently; results are sorted by id
    pub async fn run_many(self: &Arc<Self>, ids: Vec<InstanceId>) -> Vec<(InstanceId, Result<InstanceStatus, EngineError>)> {
        let handles: Vec<JoinHandle<Result<InstanceStatus, EngineError>>> = ids
            .iter()
            .cloned()
            .map(|id| {
                let executor = Arc::clone(self);
                tokio::spawn(async move { executor.run(&id).await })
            })
            .collect();

        let mut results: Vec<_> = ids
            .into_iter()
            .zip(join_all(handles).await)
            .map(|(id, joined)| {
                let result = joined.unwrap_or_else(|e| {
                    Err(EngineError::stage_failure(id.as_str(), 0, format!("run task failed: {e}")))
                });
                (id, result)
            })
            .collect();
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Replay every stored instance and run the non-terminal ones.
    ///
    /// An instance whose chain cannot be loaded is reported with its error
    /// and does not stop the others.
    pub async fn resume_all(self: &Arc<Self>) -> Result<Vec<(InstanceId, Result<InstanceStatus, EngineError>)>, EngineError> {
        let mut pending = Vec::new();
        let mut unreadable = Vec::new();
        for id in self.store.instances().await? {
            match self.store.load(&id).await {
                Ok(instance) if instance.is_terminal() => {}
                Ok(_) => pending.push(id),
                Err(e) => {
                    warn!(instance = %id, error = %e, "instance cannot be replayed, skipping");
                    unreadable.push((id, Err(e)));
                }
            }
        }
        info!(count = pending.len(), skipped = unreadable.len(), "resuming instances");

        let mut results = self.run_many(pending).await;
        results.extend(unreadable);
        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }

    /// Apply a reviewer decision to an instance waiting for approval.
    ///
    /// If the deadline has passed, the decision is discarded, the default
    /// action is committed instead and [`EngineError::ApprovalTimeout`] is
    /// returned.
    #[instrument(skip(self, id), fields(instance = %id))]
    pub async fn decide(
        &self,
        id: &InstanceId,
        decision: ApprovalDecision,
        reviewer: &str,
    ) -> Result<InstanceStatus, EngineError> {
        self.execute(id, Command::Decide { decision, reviewer }).await
    }

    /// Resolve every overdue approval to its default action
    pub async fn sweep_timeouts(&self) -> Result<Vec<(InstanceId, InstanceStatus)>, EngineError> {
        let now = Utc::now();
        let mut resolved = Vec::new();
        for id in self.store.instances().await? {
            let instance = match self.store.load(&id).await {
                Ok(instance) => instance,
                Err(e) => {
                    warn!(instance = %id, error = %e, "instance cannot be replayed, skipping");
                    continue;
                }
            };
            let overdue = instance.status == InstanceStatus::WaitingApproval
                && instance.approval.as_ref().is_some_and(|t| t.is_overdue(now));
            if !overdue {
                continue;
            }
            match self.advance(&id).await {
                Ok(status) => {
                    info!(instance = %id, %status, "approval timed out");
                    resolved.push((id, status));
                }
                Err(e) => warn!(instance = %id, error = %e, "failed to resolve overdue approval"),
            }
        }
        Ok(resolved)
    }

    /// Periodically sweep approval timeouts and run the instances they release
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        match executor.sweep_timeouts().await {
                            Ok(resolved) => {
                                let approved: Vec<InstanceId> = resolved
                                    .into_iter()
                                    .filter(|(_, s)| *s == InstanceStatus::Approved)
                                    .map(|(id, _)| id)
                                    .collect();
                                for (id, result) in executor.run_many(approved).await {
                                    if let Err(e) = result {
                                        warn!(instance = %id, error = %e, "run after sweep failed");
                                    }
                                }
                            }
                            Err(e) => warn!(error = %e, "approval sweep failed"),
                        }
                    }
                }
            }
        })
    }

    /// Fail the instance and abort its in-flight work
    #[instrument(skip(self, id), fields(instance = %id))]
    pub async fn cancel(&self, id: &InstanceId, reason: &str) -> Result<InstanceStatus, EngineError> {
        self.execute(id, Command::Cancel { reason }).await
    }

    /// Token for work planned against the current version; every commit
    /// cancels it and the next caller gets a fresh one
    async fn token(&self, id: &InstanceId) -> CancellationToken {
        self.tokens
            .lock()
            .await
            .entry(id.clone())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Plan and commit one transition, retrying on version conflicts
    async fn execute(&self, id: &InstanceId, command: Command<'_>) -> Result<InstanceStatus, EngineError> {
        let mut last_conflict = None;
        for attempt in 1..=self.config.max_commit_attempts {
            let current = self.store.load(id).await?;
            let planned = match &command {
                Command::Advance => {
                    if current.is_terminal() {
                        return Ok(current.status);
                    }
                    let token = self.token(id).await;
                    self.plan_advance(&current, &token).await
                }
                Command::Decide { decision, reviewer } => self.plan_decision(&current, *decision, reviewer),
                Command::Cancel { reason } => Ok(self.plan_cancel(&current, reason)),
            };

            let planned = match planned {
                Ok(Some(planned)) => planned,
                Ok(None) => return Ok(current.status),
                Err(EngineError::Cancelled(_)) => {
                    let latest = self.store.load(id).await?;
                    if latest.is_terminal() {
                        debug!(instance = %id, status = %latest.status, "work cancelled in flight");
                        return Ok(latest.status);
                    }
                    debug!(instance = %id, attempt, version = latest.version, "superseded in flight, reloading");
                    last_conflict = Some(EngineError::conflict(id, current.version, latest.version));
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.commit(planned).await {
                Err(e) if e.is_conflict() => {
                    warn!(instance = %id, attempt, error = %e, "commit conflict, reloading");
                    last_conflict = Some(e);
                }
                other => return other,
            }
        }
        Err(last_conflict.unwrap_or_else(|| EngineError::conflict(id, 0, 0)))
    }

    async fn commit(&self, planned: Planned) -> Result<InstanceStatus, EngineError> {
        let Planned {
            next,
            transition,
            effects,
            late_decision,
        } = planned;
        let checkpoint = Checkpoint::snapshot(&next, transition);
        self.store.append(&checkpoint).await?;
        if let Some(token) = self.tokens.lock().await.remove(&next.id) {
            token.cancel();
        }
        info!(
            instance = %next.id,
            version = next.version,
            status = %next.status,
            transition = checkpoint.transition.kind(),
            cursor = ?next.cursor,
            "transition committed"
        );

        for effect in effects {
            match effect {
                Effect::Notify(request) => {
                    if let Err(e) = self.notifier.notify(&request).await {
                        warn!(instance = %next.id, error = %e, "review notification failed");
                    }
                }
            }
        }

        if late_decision {
            return Err(EngineError::ApprovalTimeout(next.id));
        }
        Ok(next.status)
    }

    async fn plan_advance(
        &self,
        current: &WorkflowInstance,
        token: &CancellationToken,
    ) -> Result<Option<Planned>, EngineError> {
        if current.is_terminal() {
            return Ok(None);
        }
        if current.status == InstanceStatus::WaitingApproval {
            let now = Utc::now();
            return match &current.approval {
                Some(ticket) if ticket.is_overdue(now) => {
                    let mut ticket = ticket.clone();
                    ticket.expire(now, &current.id)?;
                    Ok(Some(self.resolve_ticket(current.successor(), ticket)))
                }
                _ => Ok(None),
            };
        }

        let Some(stage_name) = current.cursor.clone() else {
            let err = EngineError::routing("-", "running instance has no pending stage");
            return Ok(Some(self.failed(current.successor(), None, &err)));
        };
        let Some(stage) = self.graph.stage(&stage_name).cloned() else {
            let err = EngineError::routing(&stage_name, "unknown stage");
            return Ok(Some(self.failed(current.successor(), Some(&stage_name), &err)));
        };

        let limit = stage.max_visits.unwrap_or(self.config.max_visits);
        let visit = current.visits(&stage.name) + 1;
        if visit > limit {
            let err = EngineError::cycle_limit(&stage.name, visit, limit);
            warn!(instance = %current.id, stage = %stage.name, visit, limit, "cycle limit exceeded");
            return Ok(Some(self.failed(current.successor(), Some(&stage.name), &err)));
        }

        let mut next = current.successor();
        next.record_visit(&stage.name);
        let retry = stage
            .retry
            .clone()
            .unwrap_or_else(|| self.config.retry_policy.clone());
        debug!(instance = %current.id, stage = %stage.name, visit, "running stage");

        let planned = match &stage.kind {
            StageKind::Agent { agent } => {
                self.run_agent_stage(next, &stage.name, agent, visit, &retry, token)
                    .await?
            }
            StageKind::FanOut { branches } => {
                self.run_fan_out(next, &stage.name, branches, visit, &retry, token)
                    .await?
            }
            StageKind::Auction(auction) => {
                self.run_auction_stage(next, &stage.name, auction, visit, token)
                    .await?
            }
            StageKind::Approval {
                score_stage,
                score_field,
            } => self.open_approval(next, &stage.name, score_stage, score_field),
            StageKind::Action { include } => {
                self.run_action(next, &stage.name, include, visit, &retry, token)
                    .await?
            }
        };
        Ok(Some(planned))
    }

    async fn run_agent_stage(
        &self,
        mut next: WorkflowInstance,
        stage: &str,
        agent: &str,
        visit: u32,
        retry: &RetryPolicy,
        token: &CancellationToken,
    ) -> Result<Planned, EngineError> {
        let transition = Transition::StageCommitted {
            stage: stage.to_string(),
            agent: Some(agent.to_string()),
        };
        if !self.runtime.registry().is_enabled(agent) {
            debug!(stage, agent, "agent disabled, recording absent result");
            next.record_result(stage, StageResult::absent("agent disabled", Some(agent.to_string()), 0, visit));
            return Ok(self.conclude(next, stage, transition));
        }

        let input = Arc::new(AgentInput::from_instance(&next, stage, visit));
        match self.runtime.invoke_with_retry(agent, input, retry, token).await {
            Ok(invocation) => Ok(self.record_evaluation(
                next,
                stage,
                invocation.evaluation,
                Some(invocation.agent),
                invocation.attempts,
                visit,
                transition,
            )),
            Err(failure) if failure.is_cancelled() => Err(EngineError::Cancelled(next.id.clone())),
            Err(failure) => {
                next.record_result(
                    stage,
                    StageResult::absent(failure.error.to_string(), Some(failure.agent.clone()), failure.attempts, visit),
                );
                let err = EngineError::stage_failure(stage, failure.attempts, failure.error.to_string());
                Ok(self.failed(next, Some(stage), &err))
            }
        }
    }

    async fn run_fan_out(
        &self,
        mut next: WorkflowInstance,
        stage: &str,
        branches: &[Branch],
        visit: u32,
        retry: &RetryPolicy,
        token: &CancellationToken,
    ) -> Result<Planned, EngineError> {
        let (enabled, disabled): (Vec<Branch>, Vec<Branch>) = branches
            .iter()
            .cloned()
            .partition(|b| self.runtime.registry().is_enabled(&b.agent));

        if let Some(branch) = disabled.iter().find(|b| b.required) {
            let err = EngineError::stage_failure(
                stage,
                0,
                format!("required branch {} uses disabled agent {}", branch.name, branch.agent),
            );
            return Ok(self.failed(next, Some(stage), &err));
        }

        let input = AgentInput::from_instance(&next, stage, visit);
        let report = self.runtime.fan_out(&enabled, &input, retry, token).await;
        if token.is_cancelled() {
            return Err(EngineError::Cancelled(next.id.clone()));
        }

        let mut absent = Vec::new();
        for branch in &disabled {
            let branch_visit = next.record_visit(&branch.name);
            next.record_result(
                &branch.name,
                StageResult::absent("agent disabled", Some(branch.agent.clone()), 0, branch_visit),
            );
            absent.push(branch.name.clone());
        }
        for branch_report in &report.branches {
            let name = &branch_report.branch.name;
            let branch_visit = next.record_visit(name);
            let result = match &branch_report.result {
                Ok(invocation) => match &invocation.evaluation.outcome {
                    StageOutcome::Produced(output) => StageResult::produced(
                        output.clone(),
                        Some(invocation.agent.clone()),
                        invocation.attempts,
                        branch_visit,
                    ),
                    StageOutcome::SkipForward { reason } => StageResult::absent(
                        format!("skipped: {reason}"),
                        Some(invocation.agent.clone()),
                        invocation.attempts,
                        branch_visit,
                    ),
                },
                Err(failure) => StageResult::absent(
                    failure.error.to_string(),
                    Some(failure.agent.clone()),
                    failure.attempts,
                    branch_visit,
                ),
            };
            if !result.is_present() {
                absent.push(name.clone());
            }
            next.record_result(name, result);
        }

        if let Some(failed) = report.failed_required() {
            let (attempts, message) = match &failed.result {
                Err(failure) => (failure.attempts, failure.error.to_string()),
                Ok(_) => (0, "required branch failed".to_string()),
            };
            let err = EngineError::stage_failure(&failed.branch.name, attempts, message);
            return Ok(self.failed(next, Some(stage), &err));
        }

        let names: Vec<&str> = branches.iter().map(|b| b.name.as_str()).collect();
        next.record_result(
            stage,
            StageResult::produced(json!({"branches": names, "absent": absent}), None, 1, visit),
        );
        info!(instance = %next.id, stage, absent = ?absent, "fan-in complete");
        Ok(self.conclude(
            next,
            stage,
            Transition::FanIn {
                stage: stage.to_string(),
                absent,
            },
        ))
    }

    async fn run_auction_stage(
        &self,
        mut next: WorkflowInstance,
        stage: &str,
        auction: &AuctionStage,
        visit: u32,
        token: &CancellationToken,
    ) -> Result<Planned, EngineError> {
        let input = Arc::new(AgentInput::from_instance(&next, stage, visit));
        let deadline = auction.deadline.unwrap_or(self.config.auction.deadline);
        let book = self
            .coordinator
            .collect_bids(input, &auction.task, &auction.participants, deadline, token)
            .await?;

        let floor = self.coordinator.policy().min_quality_for(&auction.task);
        let cleared = match self.coordinator.clear(&book, floor) {
            Err(AuctionError::QualityBelowThreshold { quality, minimum, .. })
                if auction.relax_quality_to.is_some() =>
            {
                warn!(stage, quality, minimum, relaxed = ?auction.relax_quality_to, "re-clearing with relaxed quality floor");
                self.coordinator.clear(&book, auction.relax_quality_to)
            }
            other => other,
        };
        let outcome = match cleared {
            Ok(outcome) => outcome,
            Err(e) => return Ok(self.auction_fallback(next, stage, auction, visit, e)),
        };
        let settlement = match self.coordinator.settle(&outcome.result, next.budget_remaining) {
            Ok(settlement) => settlement,
            Err(e) => return Ok(self.auction_fallback(next, stage, auction, visit, e)),
        };

        settlement.apply(&mut next);
        info!(
            instance = %next.id,
            stage,
            winner = %outcome.result.winner,
            price = settlement.clearing_price,
            budget = settlement.budget_after,
            "auction settled"
        );
        let winner = outcome.result.winner.clone();
        let transition = Transition::AuctionSettled {
            stage: stage.to_string(),
            auction: outcome.result,
            settlement,
        };
        Ok(self.record_evaluation(next, stage, outcome.evaluation, Some(winner), 1, visit, transition))
    }

    fn auction_fallback(
        &self,
        mut next: WorkflowInstance,
        stage: &str,
        auction: &AuctionStage,
        visit: u32,
        error: AuctionError,
    ) -> Planned {
        warn!(instance = %next.id, stage, error = %error, degraded = ?auction.degraded, "auction fallback");
        next.record_result(stage, StageResult::absent(error.to_string(), None, 1, visit));
        let transition = Transition::AuctionFallback {
            stage: stage.to_string(),
            error: error.to_string(),
            degraded: auction.degraded.clone(),
        };
        match &auction.degraded {
            Some(degraded) => {
                next.cursor = Some(degraded.clone());
                next.reason = Some(format!("degraded: {}", error.code()));
            }
            None => {
                let status = match error {
                    AuctionError::BudgetExceeded { .. } => InstanceStatus::Rejected,
                    _ => InstanceStatus::Failed,
                };
                next.finish(status, error.code());
            }
        }
        Planned::new(next, transition)
    }

    fn open_approval(&self, mut next: WorkflowInstance, stage: &str, score_stage: &str, score_field: &str) -> Planned {
        let score = next
            .result(score_stage)
            .and_then(|r| r.field(score_field))
            .and_then(Value::as_f64);
        let ticket = ApprovalTicket::open(stage, score, &self.config.approval, Utc::now());

        if !ticket.is_awaiting_review() {
            return self.resolve_ticket(next, ticket);
        }

        next.status = InstanceStatus::WaitingApproval;
        next.cursor = Some(stage.to_string());
        let request = ReviewRequest::for_instance(&next, &ticket);
        let transition = Transition::ApprovalRequested {
            stage: stage.to_string(),
            deadline: ticket.deadline,
        };
        next.approval = Some(ticket);
        Planned::new(next, transition).with_effect(Effect::Notify(request))
    }

    /// Commit a resolved ticket: continue on approval, reject otherwise
    fn resolve_ticket(&self, mut next: WorkflowInstance, ticket: ApprovalTicket) -> Planned {
        let stage = ticket.stage.clone();
        let transition = Transition::ApprovalResolved {
            stage: stage.clone(),
            state: ticket.state,
            decided_by: ticket.decided_by.clone(),
        };
        let outcome = ticket.outcome();
        let timed_out = ticket.timed_out();
        next.approval = Some(ticket);

        match outcome {
            Some(ApprovalDecision::Approve) => {
                next.status = InstanceStatus::Approved;
                self.conclude(next, &stage, transition)
            }
            _ => {
                let reason = if timed_out {
                    "approval_timeout"
                } else {
                    "approval_rejected"
                };
                next.finish(InstanceStatus::Rejected, reason);
                Planned::new(next, transition)
            }
        }
    }

    fn plan_decision(
        &self,
        current: &WorkflowInstance,
        decision: ApprovalDecision,
        reviewer: &str,
    ) -> Result<Option<Planned>, EngineError> {
        if current.status != InstanceStatus::WaitingApproval {
            return Err(EngineError::invalid_transition(
                &current.id,
                format!("instance is {}, not waiting for approval", current.status),
            ));
        }
        let mut ticket = current
            .approval
            .clone()
            .ok_or_else(|| EngineError::invalid_transition(&current.id, "no approval ticket"))?;

        let late = match ticket.decide(decision, reviewer, Utc::now(), &current.id) {
            Ok(()) => false,
            Err(EngineError::ApprovalTimeout(_)) => true,
            Err(e) => return Err(e),
        };
        let mut planned = self.resolve_ticket(current.successor(), ticket);
        planned.late_decision = late;
        Ok(Some(planned))
    }

    fn plan_cancel(&self, current: &WorkflowInstance, reason: &str) -> Option<Planned> {
        if current.is_terminal() {
            return None;
        }
        let mut next = current.successor();
        next.finish(InstanceStatus::Failed, format!("cancelled: {reason}"));
        Some(Planned::new(
            next,
            Transition::Cancelled {
                reason: reason.to_string(),
            },
        ))
    }

    async fn run_action(
        &self,
        mut next: WorkflowInstance,
        stage: &str,
        include: &[String],
        visit: u32,
        retry: &RetryPolicy,
        token: &CancellationToken,
    ) -> Result<Planned, EngineError> {
        if next.status != InstanceStatus::Approved {
            let err = EngineError::invalid_transition(
                &next.id,
                format!("action stage {stage} requires approval, status is {}", next.status),
            );
            return Ok(self.failed(next, Some(stage), &err));
        }

        let action = ActionRequest {
            instance_id: next.id.clone(),
            stage: stage.to_string(),
            idempotency_key: format!("{}:{}:{}", next.id, stage, visit),
            payload: next.payload.clone(),
            body: include
                .iter()
                .filter_map(|s| next.output(s).map(|v| (s.clone(), v.clone())))
                .collect(),
        };

        let mut retries = 0u32;
        loop {
            let attempts = retries + 1;
            let delivered = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(EngineError::Cancelled(next.id.clone())),
                result = timeout(self.config.agent_timeout, self.actions.dispatch(&action)) => {
                    result.unwrap_or_else(|_| Err(SinkError::Unavailable("dispatch timed out".to_string())))
                }
            };

            match delivered {
                Ok(receipt) => {
                    next.record_result(
                        stage,
                        StageResult::produced(
                            json!({
                                "delivery_id": receipt.delivery_id,
                                "delivered_at": receipt.delivered_at,
                                "idempotency_key": action.idempotency_key,
                            }),
                            None,
                            attempts,
                            visit,
                        ),
                    );
                    let transition = Transition::Dispatched {
                        stage: stage.to_string(),
                        idempotency_key: action.idempotency_key.clone(),
                    };
                    return Ok(self.conclude(next, stage, transition));
                }
                Err(e) => {
                    let error = AgentError::from(e);
                    if error.is_transient() && retry.should_retry(retries) {
                        let delay = retry.delay_for_attempt(retries);
                        warn!(stage, attempt = attempts, ?delay, %error, "retrying dispatch");
                        retries += 1;
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => return Err(EngineError::Cancelled(next.id.clone())),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                    next.record_result(stage, StageResult::absent(error.to_string(), None, attempts, visit));
                    let err = EngineError::stage_failure(stage, attempts, error.to_string());
                    return Ok(self.failed(next, Some(stage), &err));
                }
            }
        }
    }

    /// Store an agent's evaluation and route on it
    #[allow(clippy::too_many_arguments)]
    fn record_evaluation(
        &self,
        mut next: WorkflowInstance,
        stage: &str,
        evaluation: Evaluation,
        agent: Option<String>,
        attempts: u32,
        visit: u32,
        transition: Transition,
    ) -> Planned {
        match evaluation.outcome {
            StageOutcome::Produced(output) => {
                next.record_result(stage, StageResult::produced(output, agent, attempts, visit));
                self.conclude(next, stage, transition)
            }
            StageOutcome::SkipForward { reason } => {
                info!(instance = %next.id, stage, %reason, "skipped forward");
                next.record_result(
                    stage,
                    StageResult::absent(format!("skipped: {reason}"), agent, attempts, visit),
                );
                let transition = match transition {
                    settled @ Transition::AuctionSettled { .. } => settled,
                    _ => Transition::SkippedForward {
                        stage: stage.to_string(),
                        reason: reason.clone(),
                    },
                };
                next.finish(InstanceStatus::Rejected, reason);
                Planned::new(next, transition)
            }
        }
    }

    /// Follow the first matching edge out of `stage`
    fn conclude(&self, mut next: WorkflowInstance, stage: &str, transition: Transition) -> Planned {
        match self.graph.route(stage, &next.stage_results) {
            Some(END) => {
                next.status = InstanceStatus::Completed;
                next.cursor = None;
            }
            Some(target) => next.cursor = Some(target.to_string()),
            None => {
                let err = EngineError::routing(stage, "no outgoing edge matched");
                return self.failed(next, Some(stage), &err);
            }
        }
        Planned::new(next, transition)
    }

    fn failed(&self, mut next: WorkflowInstance, stage: Option<&str>, error: &EngineError) -> Planned {
        warn!(instance = %next.id, stage = ?stage, %error, "instance failed");
        next.finish(InstanceStatus::Failed, error.reason());
        Planned::new(
            next,
            Transition::Failed {
                stage: stage.map(str::to_string),
                error: error.to_string(),
            },
        )
    }
}
