//! Agents and the agent registry
//!
//! Every capability provider (research, scoring, copy, timing, ...) sits
//! behind the single [`Agent`] trait. Agents read the instance snapshot in
//! [`AgentInput`] and return an [`Evaluation`]; they never write state.
//! Stages refer to agents by id, resolved through [`AgentRegistry`].

mod runtime;

pub use runtime::{AgentRuntime, BranchReport, FanOutReport, Invocation, InvocationFailure};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::error::AgentError;
use crate::instance::{InstanceId, StageResult, WorkflowInstance};
use crate::negotiation::Bid;

/// Read-only view of an instance handed to an agent
#[derive(Debug, Clone)]
pub struct AgentInput {
    pub instance_id: InstanceId,
    /// Stage (or fan-out branch) being evaluated
    pub stage: String,
    pub payload: Value,
    pub stage_results: BTreeMap<String, StageResult>,
    /// Visit number of `stage` this evaluation belongs to
    pub visit: u32,
}

impl AgentInput {
    pub fn new(instance_id: InstanceId, stage: impl Into<String>, payload: Value) -> Self {
        Self {
            instance_id,
            stage: stage.into(),
            payload,
            stage_results: BTreeMap::new(),
            visit: 1,
        }
    }

    /// Snapshot `instance` for a visit to `stage`
    pub fn from_instance(instance: &WorkflowInstance, stage: impl Into<String>, visit: u32) -> Self {
        Self {
            instance_id: instance.id.clone(),
            stage: stage.into(),
            payload: instance.payload.clone(),
            stage_results: instance.stage_results.clone(),
            visit,
        }
    }

    pub fn with_result(mut self, stage: impl Into<String>, result: StageResult) -> Self {
        self.stage_results.insert(stage.into(), result);
        self
    }

    /// Same snapshot, addressed to another stage
    pub fn for_stage(&self, stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            ..self.clone()
        }
    }

    /// Output of an earlier stage, if present
    pub fn output(&self, stage: &str) -> Option<&Value> {
        self.stage_results.get(stage)?.output.as_ref()
    }

    /// First present output among `stages`
    pub fn first_output<'a>(&'a self, stages: &[String]) -> Option<&'a Value> {
        stages.iter().find_map(|s| self.output(s))
    }
}

/// What a stage produced
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Normal result, stored under the stage name
    Produced(Value),
    /// The work item should not continue; ends the instance as rejected
    SkipForward { reason: String },
}

/// Result of one agent evaluation, plus a bid when the stage is contended
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub outcome: StageOutcome,
    pub bid: Option<Bid>,
}

impl Evaluation {
    pub fn produced(output: Value) -> Self {
        Self {
            outcome: StageOutcome::Produced(output),
            bid: None,
        }
    }

    pub fn skip_forward(reason: impl Into<String>) -> Self {
        Self {
            outcome: StageOutcome::SkipForward {
                reason: reason.into(),
            },
            bid: None,
        }
    }

    pub fn with_bid(mut self, bid: Bid) -> Self {
        self.bid = Some(bid);
        self
    }

    pub fn output(&self) -> Option<&Value> {
        match &self.outcome {
            StageOutcome::Produced(v) => Some(v),
            StageOutcome::SkipForward { .. } => None,
        }
    }
}

/// A capability provider
#[async_trait]
pub trait Agent: Send + Sync {
    /// Registry id
    fn id(&self) -> &str;

    /// Evaluate the input; contended stages also return a bid
    async fn evaluate(&self, input: &AgentInput) -> Result<Evaluation, AgentError>;
}

pub type BoxedAgent = Arc<dyn Agent>;

/// Agents by id, with a configurable disabled set
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, BoxedAgent>,
    disabled: HashSet<String>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its own id, replacing any previous one
    pub fn register(&mut self, agent: BoxedAgent) -> &mut Self {
        self.agents.insert(agent.id().to_string(), agent);
        self
    }

    pub fn with_agent(mut self, agent: BoxedAgent) -> Self {
        self.register(agent);
        self
    }

    pub fn disable(&mut self, agent_id: impl Into<String>) -> &mut Self {
        self.disabled.insert(agent_id.into());
        self
    }

    pub fn with_disabled<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disabled.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn get(&self, agent_id: &str) -> Option<BoxedAgent> {
        self.agents.get(agent_id).cloned()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Registered and not disabled
    pub fn is_enabled(&self, agent_id: &str) -> bool {
        self.contains(agent_id) && !self.disabled.contains(agent_id)
    }

    /// Registered agent ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.ids())
            .field("disabled", &self.disabled)
            .finish()
    }
}
