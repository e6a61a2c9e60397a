//! Agent invocation: timeouts, retries and bounded fan-out

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AgentInput, AgentRegistry, Evaluation};
use crate::config::RetryPolicy;
use crate::error::AgentError;
use crate::graph::Branch;

/// A successful invocation
#[derive(Debug, Clone)]
pub struct Invocation {
    pub agent: String,
    pub evaluation: Evaluation,
    pub attempts: u32,
}

/// The last error of an invocation that gave up
#[derive(Debug, Clone)]
pub struct InvocationFailure {
    pub agent: String,
    pub attempts: u32,
    pub error: AgentError,
}

impl InvocationFailure {
    pub fn is_cancelled(&self) -> bool {
        self.error == AgentError::Cancelled
    }
}

/// Outcome of one fan-out branch
#[derive(Debug, Clone)]
pub struct BranchReport {
    pub branch: Branch,
    pub result: Result<Invocation, InvocationFailure>,
}

/// Outcome of a whole fan-out, in branch declaration order
#[derive(Debug, Clone)]
pub struct FanOutReport {
    pub branches: Vec<BranchReport>,
}

impl FanOutReport {
    /// First required branch that failed, if any
    pub fn failed_required(&self) -> Option<&BranchReport> {
        self.branches
            .iter()
            .find(|r| r.branch.required && r.result.as_ref().is_err_and(|f| !f.is_cancelled()))
    }

    /// Names of branches without a usable result
    pub fn absent(&self) -> Vec<String> {
        self.branches
            .iter()
            .filter(|r| r.result.is_err())
            .map(|r| r.branch.name.clone())
            .collect()
    }
}

/// Executes agents from a registry
#[derive(Clone)]
pub struct AgentRuntime {
    registry: Arc<AgentRegistry>,
    agent_timeout: Duration,
    parallelism: usize,
}

impl AgentRuntime {
    pub fn new(registry: Arc<AgentRegistry>, agent_timeout: Duration, parallelism: usize) -> Self {
        Self {
            registry,
            agent_timeout,
            parallelism: parallelism.max(1),
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn agent_timeout(&self) -> Duration {
        self.agent_timeout
    }

    /// Run one evaluation bounded by `limit` and `cancel`
    pub async fn invoke(
        &self,
        agent_id: &str,
        input: Arc<AgentInput>,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<Evaluation, AgentError> {
        let agent = self
            .registry
            .get(agent_id)
            .ok_or_else(|| AgentError::fatal(format!("unknown agent: {agent_id}")))?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            result = timeout(limit, agent.evaluate(&input)) => match result {
                Ok(result) => result,
                Err(_) => Err(AgentError::Timeout(agent_id.to_string())),
            },
        }
    }

    /// Run one evaluation, retrying transient failures with backoff
    pub async fn invoke_with_retry(
        &self,
        agent_id: &str,
        input: Arc<AgentInput>,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Invocation, InvocationFailure> {
        let mut retries = 0u32;
        loop {
            let attempts = retries + 1;
            match self
                .invoke(agent_id, Arc::clone(&input), self.agent_timeout, cancel)
                .await
            {
                Ok(evaluation) => {
                    return Ok(Invocation {
                        agent: agent_id.to_string(),
                        evaluation,
                        attempts,
                    })
                }
                Err(error) if error.is_transient() && policy.should_retry(retries) => {
                    let delay = policy.delay_for_attempt(retries);
                    warn!(
                        agent = agent_id,
                        stage = %input.stage,
                        attempt = attempts,
                        ?delay,
                        %error,
                        "retrying agent"
                    );
                    retries += 1;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Err(InvocationFailure {
                                agent: agent_id.to_string(),
                                attempts,
                                error: AgentError::Cancelled,
                            })
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => {
                    return Err(InvocationFailure {
                        agent: agent_id.to_string(),
                        attempts,
                        error,
                    })
                }
            }
        }
    }

    /// Run `branches` concurrently, at most `parallelism` at a time.
    ///
    /// A failing optional branch is reported and its siblings keep running.
    /// A failing required branch cancels the siblings that have not finished
    /// yet; they report [`AgentError::Cancelled`].
    pub async fn fan_out(
        &self,
        branches: &[Branch],
        input: &AgentInput,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> FanOutReport {
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let group = cancel.child_token();
        let mut handles = Vec::with_capacity(branches.len());

        for branch in branches {
            let runtime = self.clone();
            let task_branch = branch.clone();
            let input = Arc::new(input.for_stage(&branch.name));
            let permits = Arc::clone(&semaphore);
            let group = group.clone();
            let policy = policy.clone();

            let handle = tokio::spawn(async move {
                let branch = task_branch;
                let result = tokio::select! {
                    biased;
                    _ = group.cancelled() => Err(InvocationFailure {
                        agent: branch.agent.clone(),
                        attempts: 0,
                        error: AgentError::Cancelled,
                    }),
                    permit = permits.acquire_owned() => match permit {
                        Ok(_permit) => {
                            runtime
                                .invoke_with_retry(&branch.agent, input, &policy, &group)
                                .await
                        }
                        Err(_) => Err(InvocationFailure {
                            agent: branch.agent.clone(),
                            attempts: 0,
                            error: AgentError::Cancelled,
                        }),
                    },
                };
                if let Err(failure) = &result {
                    if branch.required && !failure.is_cancelled() {
                        warn!(branch = %branch.name, error = %failure.error, "required branch failed");
                        group.cancel();
                    } else {
                        debug!(branch = %branch.name, error = %failure.error, "branch without result");
                    }
                }
                BranchReport { branch, result }
            });
            handles.push((branch.clone(), handle));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (branch, handle) in handles {
            let report = match handle.await {
                Ok(report) => report,
                Err(e) => BranchReport {
                    result: Err(InvocationFailure {
                        agent: branch.agent.clone(),
                        attempts: 0,
                        error: AgentError::fatal(format!("branch task failed: {e}")),
                    }),
                    branch,
                },
            };
            reports.push(report);
        }
        FanOutReport { branches: reports }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::instance::InstanceId;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails transiently `failures` times, then succeeds
    struct Flaky {
        id: &'static str,
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Agent for Flaky {
        fn id(&self) -> &str {
            self.id
        }

        async fn evaluate(&self, _input: &AgentInput) -> Result<Evaluation, AgentError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(AgentError::transient("upstream 503"))
            } else {
                Ok(Evaluation::produced(json!({"call": call + 1})))
            }
        }
    }

    struct Sleepy {
        id: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl Agent for Sleepy {
        fn id(&self) -> &str {
            self.id
        }

        async fn evaluate(&self, input: &AgentInput) -> Result<Evaluation, AgentError> {
            tokio::time::sleep(self.delay).await;
            Ok(Evaluation::produced(json!({"stage": input.stage})))
        }
    }

    struct Broken;

    #[async_trait]
    impl Agent for Broken {
        fn id(&self) -> &str {
            "broken"
        }

        async fn evaluate(&self, _input: &AgentInput) -> Result<Evaluation, AgentError> {
            Err(AgentError::fatal("malformed lead"))
        }
    }

    fn runtime(registry: AgentRegistry) -> AgentRuntime {
        AgentRuntime::new(Arc::new(registry), Duration::from_secs(1), 4)
    }

    fn input() -> AgentInput {
        AgentInput::new(InstanceId::new("lead-1"), "compose", json!({}))
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3).with_backoff_base(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let runtime = runtime(AgentRegistry::new().with_agent(Arc::new(Flaky {
            id: "flaky",
            failures: 2,
            calls: AtomicU32::new(0),
        })));

        let invocation = runtime
            .invoke_with_retry("flaky", Arc::new(input()), &fast_retry(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(invocation.attempts, 3);
        assert_eq!(invocation.evaluation.output(), Some(&json!({"call": 3})));
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let runtime = runtime(AgentRegistry::new().with_agent(Arc::new(Flaky {
            id: "flaky",
            failures: 10,
            calls: AtomicU32::new(0),
        })));

        let failure = runtime
            .invoke_with_retry("flaky", Arc::new(input()), &fast_retry(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 4);
        assert!(failure.error.is_transient());
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let runtime = runtime(AgentRegistry::new().with_agent(Arc::new(Broken)));
        let failure = runtime
            .invoke_with_retry("broken", Arc::new(input()), &fast_retry(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.error, AgentError::fatal("malformed lead"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transient() {
        let runtime = runtime(AgentRegistry::new().with_agent(Arc::new(Sleepy {
            id: "sleepy",
            delay: Duration::from_secs(60),
        })));
        let failure = runtime
            .invoke_with_retry("sleepy", Arc::new(input()), &RetryPolicy::new(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 2);
        assert_eq!(failure.error, AgentError::Timeout("sleepy".into()));
    }

    #[tokio::test]
    async fn test_unknown_agent_is_fatal() {
        let runtime = runtime(AgentRegistry::new());
        let err = runtime
            .invoke("ghost", Arc::new(input()), Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_optional_branch_failure_is_isolated() {
        let registry = AgentRegistry::new()
            .with_agent(Arc::new(Sleepy {
                id: "copy",
                delay: Duration::from_millis(50),
            }))
            .with_agent(Arc::new(Broken));
        let branches = vec![
            Branch::required("copy", "copy"),
            Branch::optional("timing", "broken"),
        ];

        let report = runtime(registry)
            .fan_out(&branches, &input(), &RetryPolicy::no_retry(), &CancellationToken::new())
            .await;

        assert!(report.failed_required().is_none());
        assert_eq!(report.absent(), vec!["timing"]);
        let copy = report.branches[0].result.as_ref().unwrap();
        assert_eq!(copy.evaluation.output(), Some(&json!({"stage": "copy"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_required_branch_failure_cancels_siblings() {
        let registry = AgentRegistry::new()
            .with_agent(Arc::new(Sleepy {
                id: "slow",
                delay: Duration::from_secs(10),
            }))
            .with_agent(Arc::new(Broken));
        let branches = vec![
            Branch::optional("slow", "slow"),
            Branch::required("critical", "broken"),
        ];

        let report = runtime(registry)
            .fan_out(&branches, &input(), &RetryPolicy::no_retry(), &CancellationToken::new())
            .await;

        let failed = report.failed_required().unwrap();
        assert_eq!(failed.branch.name, "critical");
        let slow = report.branches[0].result.as_ref().unwrap_err();
        assert!(slow.is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_invoke() {
        let runtime = runtime(AgentRegistry::new().with_agent(Arc::new(Sleepy {
            id: "sleepy",
            delay: Duration::from_secs(60),
        })));
        let token = CancellationToken::new();
        token.cancel();
        let err = runtime
            .invoke("sleepy", Arc::new(input()), Duration::from_secs(120), &token)
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::Cancelled);
    }
}
