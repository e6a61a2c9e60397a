//! The standard lead pipeline

use serde_json::json;
use std::sync::Arc;

use super::{
    CopyAgent, HeuristicScorer, NextMorningTiming, PayloadResearchProvider, ResearchAgent, ResearchDepth,
    ScoringAgent, TemplateCopywriter, TimingAgent,
};
use crate::agent::AgentRegistry;
use crate::config::EngineConfig;
use crate::graph::{AuctionStage, Branch, BuiltGraph, GraphBuildError, Predicate, StageKind, WorkflowGraph, END};

pub const RESEARCH: &str = "research";
pub const RESEARCH_BASIC: &str = "research_basic";
pub const RESEARCH_DEEP: &str = "research_deep";
pub const QUALIFY: &str = "qualify";
pub const COMPOSE: &str = "compose";
pub const COPY: &str = "copy";
pub const TIMING: &str = "timing";
pub const APPROVAL: &str = "approval";
pub const DISPATCH: &str = "dispatch";

/// Auction task the research agents bid on
pub const RESEARCH_TASK: &str = "research";

pub const PREMIUM_RESEARCH_AGENT: &str = "research_premium";
pub const BASIC_RESEARCH_AGENT: &str = "research_basic";
pub const SCORER_AGENT: &str = "scorer";
pub const COPY_AGENT: &str = "copywriter";
pub const TIMING_AGENT: &str = "timing";

/// Research quality below which research counts as thin
pub const MIN_RESEARCH_QUALITY: f64 = 40.0;

/// Build the lead graph:
///
/// ```text
/// research (auction, degrades to research_basic)
///   -> qualify (rejects below min_lead_score)
///   -> research_deep once, when the only research was a thin basic pass
///      (premium-only auction, degrades to compose)
///   -> compose (copy required, timing optional; thin research gets fallback copy)
///   -> approval on qualify.score
///   -> dispatch -> END
/// ```
pub fn lead_pipeline() -> Result<BuiltGraph, GraphBuildError> {
    WorkflowGraph::new()
        .name("lead_pipeline")
        .stage(
            RESEARCH,
            StageKind::Auction(
                AuctionStage::new(RESEARCH_TASK, [PREMIUM_RESEARCH_AGENT, BASIC_RESEARCH_AGENT])
                    .degraded_to(RESEARCH_BASIC),
            ),
        )
        .stage(RESEARCH_BASIC, StageKind::agent(BASIC_RESEARCH_AGENT))
        .stage(
            RESEARCH_DEEP,
            StageKind::Auction(AuctionStage::new(RESEARCH_TASK, [PREMIUM_RESEARCH_AGENT]).degraded_to(COMPOSE)),
        )
        .stage(QUALIFY, StageKind::agent(SCORER_AGENT))
        .stage(
            COMPOSE,
            StageKind::fan_out(vec![
                Branch::required(COPY, COPY_AGENT),
                Branch::optional(TIMING, TIMING_AGENT),
            ]),
        )
        .stage(APPROVAL, StageKind::approval(QUALIFY, "score"))
        .stage(DISPATCH, StageKind::action([QUALIFY, COPY, TIMING]))
        .entry(RESEARCH)
        .edge(RESEARCH, QUALIFY)
        .edge(RESEARCH_BASIC, QUALIFY)
        .edge(RESEARCH_DEEP, QUALIFY)
        .edge_when(QUALIFY, RESEARCH_DEEP, thin_basic_research())
        .edge(QUALIFY, COMPOSE)
        .edge(COMPOSE, APPROVAL)
        .edge(APPROVAL, DISPATCH)
        .edge(DISPATCH, END)
        .build()
}

/// Research so far is a basic pass below [`MIN_RESEARCH_QUALITY`] and the
/// deep pass has not run yet
fn thin_basic_research() -> Predicate {
    Predicate::all(vec![
        Predicate::missing(RESEARCH_DEEP),
        Predicate::any(vec![
            Predicate::all(vec![
                Predicate::below(RESEARCH, "quality_score", MIN_RESEARCH_QUALITY),
                Predicate::equals(RESEARCH, "depth", json!("basic")),
            ]),
            Predicate::below(RESEARCH_BASIC, "quality_score", MIN_RESEARCH_QUALITY),
        ]),
    ])
}

/// Registry with the built-in collaborators.
///
/// The premium researcher reads the whole payload and bids 0.03 at quality
/// 90; the basic one reads the company profile only and bids 0.02 at 55.
pub fn default_registry(config: &EngineConfig) -> AgentRegistry {
    AgentRegistry::new()
        .with_agent(Arc::new(ResearchAgent::new(
            PREMIUM_RESEARCH_AGENT,
            Arc::new(PayloadResearchProvider::new(ResearchDepth::Deep)),
            0.03,
            90,
        )))
        .with_agent(Arc::new(ResearchAgent::new(
            BASIC_RESEARCH_AGENT,
            Arc::new(PayloadResearchProvider::new(ResearchDepth::Basic)),
            0.02,
            55,
        )))
        .with_agent(Arc::new(ScoringAgent::new(
            SCORER_AGENT,
            Arc::new(HeuristicScorer),
            config.min_lead_score,
        )))
        .with_agent(Arc::new(CopyAgent::new(COPY_AGENT, Arc::new(TemplateCopywriter))))
        .with_agent(Arc::new(TimingAgent::new(TIMING_AGENT, Arc::new(NextMorningTiming))))
}
