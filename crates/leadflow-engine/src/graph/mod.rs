//! Workflow graph definition
//!
//! A graph is static data: named stages, ordered edges with predicates, and
//! an entry stage. [`WorkflowGraph`] is the builder; [`BuiltGraph`] is the
//! validated form the executor routes on.
//!
//! ```ignore
//! let graph = WorkflowGraph::new()
//!     .name("leads")
//!     .stage("research", StageKind::agent("research"))
//!     .stage("qualify", StageKind::agent("scorer"))
//!     .entry("research")
//!     .edge("research", "qualify")
//!     .edge_when("qualify", "research", Predicate::below("research", "quality_score", 40.0))
//!     .edge("qualify", END)
//!     .build()?;
//! ```

mod predicate;

pub use predicate::{Pattern, Predicate};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

use crate::config::RetryPolicy;
use crate::instance::StageResult;

/// Sentinel target for terminal edges
pub const END: &str = "END";

/// One branch of a fan-out stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    /// Name the branch result is stored under
    pub name: String,
    pub agent: String,
    /// A failing required branch fails the whole stage
    #[serde(default)]
    pub required: bool,
}

impl Branch {
    pub fn required(name: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent: agent.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent: agent.into(),
            required: false,
        }
    }
}

/// Configuration of an auction stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionStage {
    /// Task id bids must name
    pub task: String,
    pub participants: Vec<String>,
    /// Overrides the policy deadline
    #[serde(default, with = "humantime_serde")]
    pub deadline: Option<Duration>,
    /// Stage to continue with when the auction cannot produce a win
    #[serde(default)]
    pub degraded: Option<String>,
    /// Quality floor for a single retry after a quality veto
    #[serde(default)]
    pub relax_quality_to: Option<u8>,
}

impl AuctionStage {
    pub fn new<I, S>(task: impl Into<String>, participants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            task: task.into(),
            participants: participants.into_iter().map(Into::into).collect(),
            deadline: None,
            degraded: None,
            relax_quality_to: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn degraded_to(mut self, stage: impl Into<String>) -> Self {
        self.degraded = Some(stage.into());
        self
    }

    pub fn relax_quality_to(mut self, quality: u8) -> Self {
        self.relax_quality_to = Some(quality);
        self
    }
}

/// What a stage does when the cursor reaches it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageKind {
    /// Run one agent
    Agent { agent: String },
    /// Run branches concurrently, fan in when all finish
    FanOut { branches: Vec<Branch> },
    /// Let participants bid, run the winner
    Auction(AuctionStage),
    /// Approval gate scored from another stage's result
    Approval { score_stage: String, score_field: String },
    /// Dispatch the approved action, carrying the listed stage outputs
    Action {
        #[serde(default)]
        include: Vec<String>,
    },
}

impl StageKind {
    pub fn agent(agent: impl Into<String>) -> Self {
        Self::Agent { agent: agent.into() }
    }

    pub fn fan_out(branches: Vec<Branch>) -> Self {
        Self::FanOut { branches }
    }

    pub fn approval(score_stage: impl Into<String>, score_field: impl Into<String>) -> Self {
        Self::Approval {
            score_stage: score_stage.into(),
            score_field: score_field.into(),
        }
    }

    pub fn action<I, S>(include: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Action {
            include: include.into_iter().map(Into::into).collect(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            StageKind::Agent { .. } => "agent",
            StageKind::FanOut { .. } => "fan_out",
            StageKind::Auction(_) => "auction",
            StageKind::Approval { .. } => "approval",
            StageKind::Action { .. } => "action",
        }
    }
}

/// A named stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub kind: StageKind,
    /// Overrides the engine-wide visit cap
    #[serde(default)]
    pub max_visits: Option<u32>,
    /// Overrides the engine-wide retry policy
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl Stage {
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            max_visits: None,
            retry: None,
        }
    }

    pub fn with_max_visits(mut self, max: u32) -> Self {
        self.max_visits = Some(max);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// A directed edge, taken when its predicate holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default = "Predicate::always")]
    pub when: Predicate,
}

/// Errors that can occur while building a workflow graph
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphBuildError {
    #[error("workflow entry point not set")]
    NoEntryPoint,
    #[error("unknown stage: {0}")]
    UnknownStage(String),
    #[error("duplicate stage or branch name: {0}")]
    DuplicateStage(String),
    #[error("stage {0} has no agents")]
    EmptyStage(String),
    #[error("stage {0} has no outgoing edges")]
    DeadEnd(String),
    #[error("invalid pattern in edge from {stage}: {message}")]
    InvalidPattern { stage: String, message: String },
}

/// Builder for workflow graphs
#[derive(Debug, Clone, Default)]
pub struct WorkflowGraph {
    name: String,
    stages: Vec<Stage>,
    edges: Vec<Edge>,
    entry: Option<String>,
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a stage with default visit cap and retry policy
    pub fn stage(self, name: impl Into<String>, kind: StageKind) -> Self {
        self.stage_with(Stage::new(name, kind))
    }

    pub fn stage_with(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    /// Unconditional edge
    pub fn edge(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edge_when(from, to, Predicate::Always)
    }

    /// Conditional edge; edges from one stage are tried in insertion order
    pub fn edge_when(mut self, from: impl Into<String>, to: impl Into<String>, when: Predicate) -> Self {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            when,
        });
        self
    }

    /// Validate and build the graph
    pub fn build(self) -> Result<BuiltGraph, GraphBuildError> {
        let entry = self.entry.ok_or(GraphBuildError::NoEntryPoint)?;

        let mut names = HashSet::new();
        for stage in &self.stages {
            if stage.name == END || !names.insert(stage.name.clone()) {
                return Err(GraphBuildError::DuplicateStage(stage.name.clone()));
            }
        }
        for stage in &self.stages {
            if let StageKind::FanOut { branches } = &stage.kind {
                for branch in branches {
                    if !names.insert(branch.name.clone()) {
                        return Err(GraphBuildError::DuplicateStage(branch.name.clone()));
                    }
                }
            }
        }

        let stages: BTreeMap<String, Stage> = self
            .stages
            .iter()
            .map(|s| (s.name.clone(), s.clone()))
            .collect();

        if !stages.contains_key(&entry) {
            return Err(GraphBuildError::UnknownStage(entry));
        }

        for stage in stages.values() {
            match &stage.kind {
                StageKind::FanOut { branches } if branches.is_empty() => {
                    return Err(GraphBuildError::EmptyStage(stage.name.clone()))
                }
                StageKind::Auction(auction) => {
                    if auction.participants.is_empty() {
                        return Err(GraphBuildError::EmptyStage(stage.name.clone()));
                    }
                    if let Some(degraded) = &auction.degraded {
                        if !stages.contains_key(degraded) {
                            return Err(GraphBuildError::UnknownStage(degraded.clone()));
                        }
                    }
                }
                StageKind::Approval { score_stage, .. } if !names.contains(score_stage) => {
                    return Err(GraphBuildError::UnknownStage(score_stage.clone()))
                }
                _ => {}
            }
        }

        let mut edges: HashMap<String, Vec<Edge>> = HashMap::new();
        for edge in self.edges {
            if !stages.contains_key(&edge.from) {
                return Err(GraphBuildError::UnknownStage(edge.from));
            }
            if edge.to != END && !stages.contains_key(&edge.to) {
                return Err(GraphBuildError::UnknownStage(edge.to));
            }
            check_patterns(&edge.from, &edge.when)?;
            edges.entry(edge.from.clone()).or_default().push(edge);
        }

        for stage in stages.keys() {
            if !edges.contains_key(stage) {
                return Err(GraphBuildError::DeadEnd(stage.clone()));
            }
        }

        Ok(BuiltGraph {
            name: self.name,
            entry,
            order: self.stages.into_iter().map(|s| s.name).collect(),
            stages,
            edges,
        })
    }
}

fn check_patterns(stage: &str, predicate: &Predicate) -> Result<(), GraphBuildError> {
    match predicate {
        Predicate::Matches { pattern, .. } => match pattern.error() {
            Some(message) => Err(GraphBuildError::InvalidPattern {
                stage: stage.to_string(),
                message: message.to_string(),
            }),
            None => Ok(()),
        },
        Predicate::All { of } | Predicate::Any { of } => {
            of.iter().try_for_each(|p| check_patterns(stage, p))
        }
        Predicate::Not { predicate } => check_patterns(stage, predicate),
        _ => Ok(()),
    }
}

/// Validated workflow graph
#[derive(Debug, Clone)]
pub struct BuiltGraph {
    name: String,
    entry: String,
    /// Declaration order, for rendering
    order: Vec<String>,
    stages: BTreeMap<String, Stage>,
    edges: HashMap<String, Vec<Edge>>,
}

impl BuiltGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.get(name)
    }

    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.order.iter().filter_map(|name| self.stages.get(name))
    }

    pub fn edges_from(&self, stage: &str) -> &[Edge] {
        self.edges.get(stage).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Target of the first edge from `stage` whose predicate holds.
    ///
    /// Returns [`END`] for terminal edges and `None` when nothing matches.
    pub fn route(&self, stage: &str, results: &BTreeMap<String, StageResult>) -> Option<&str> {
        let target = self
            .edges_from(stage)
            .iter()
            .find(|edge| edge.when.evaluate(results))
            .map(|edge| edge.to.as_str());
        tracing::debug!(stage, ?target, "edges evaluated");
        target
    }

    /// Upper bound on transitions for one instance
    pub fn step_limit(&self, default_visits: u32) -> u64 {
        let visits: u64 = self
            .stages
            .values()
            .map(|s| u64::from(s.max_visits.unwrap_or(default_visits)))
            .sum();
        // One extra transition per stage for approval resolution and the final commit
        visits + self.stages.len() as u64 + 1
    }

    /// Render the graph as a Mermaid flowchart
    pub fn to_mermaid(&self) -> String {
        let mut lines = vec!["flowchart TD".to_string()];
        lines.push(format!("    {}([{}])", sanitize_id(END), END));
        for stage in self.stages() {
            lines.push(render_stage(stage));
        }
        lines.push(format!("    start([start]) --> {}", sanitize_id(&self.entry)));
        for name in &self.order {
            for edge in self.edges_from(name) {
                let from = sanitize_id(&edge.from);
                let to = sanitize_id(&edge.to);
                match edge.when.label() {
                    Some(label) => lines.push(format!(
                        "    {} -->|{}| {}",
                        from,
                        label.replace('|', "/").replace('"', "'"),
                        to
                    )),
                    None => lines.push(format!("    {} --> {}", from, to)),
                }
            }
            if let Some(Stage {
                kind: StageKind::Auction(AuctionStage { degraded: Some(d), .. }),
                ..
            }) = self.stage(name)
            {
                lines.push(format!("    {} -.->|degraded| {}", sanitize_id(name), sanitize_id(d)));
            }
        }
        lines.join("\n")
    }
}

/// Mermaid node ids must be alphanumeric or underscores
fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn render_stage(stage: &Stage) -> String {
    let id = sanitize_id(&stage.name);
    let label = format!("{}: {}", stage.name, stage.kind.label());
    match &stage.kind {
        StageKind::Agent { .. } => format!("    {}[{}]", id, label),
        StageKind::FanOut { branches } => {
            let names: Vec<&str> = branches.iter().map(|b| b.name.as_str()).collect();
            format!("    {}[/{} {}\\]", id, label, names.join(","))
        }
        StageKind::Auction(_) => format!("    {}[[{}]]", id, label),
        StageKind::Approval { .. } => format!("    {}{{{}}}", id, label),
        StageKind::Action { .. } => format!("    {}({})", id, label),
    }
}
