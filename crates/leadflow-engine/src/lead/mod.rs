//! Lead qualification domain
//!
//! The engine knows nothing about leads. This module plugs the lead
//! pipeline into it: collaborator traits for the external systems
//! (research, scoring, copy, send timing), agents adapting them to
//! [`Agent`], deterministic built-in collaborators, and the standard
//! pipeline graph.

mod builtin;
mod pipeline;

pub use builtin::{
    next_morning, template_variants, HeuristicScorer, NextMorningTiming, PayloadResearchProvider, ResearchDepth,
    TemplateCopywriter,
};
pub use pipeline::{
    default_registry, lead_pipeline, APPROVAL, BASIC_RESEARCH_AGENT, COMPOSE, COPY, COPY_AGENT, DISPATCH,
    MIN_RESEARCH_QUALITY, PREMIUM_RESEARCH_AGENT, QUALIFY, RESEARCH, RESEARCH_BASIC, RESEARCH_DEEP, RESEARCH_TASK,
    SCORER_AGENT, TIMING, TIMING_AGENT,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::agent::{Agent, AgentInput, Evaluation};
use crate::error::AgentError;
use crate::negotiation::Bid;

/// Facts gathered about a lead
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchReport {
    /// Completeness of the facts, 0-100
    pub quality_score: u8,
    #[serde(flatten)]
    pub facts: Map<String, Value>,
}

impl ResearchReport {
    /// Stage output: the facts plus `quality_score`
    pub fn into_output(self) -> Value {
        let mut object = self.facts;
        object.insert("quality_score".to_string(), Value::from(self.quality_score));
        Value::Object(object)
    }
}

/// A lead score with the contribution of each signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadScore {
    pub score: u8,
    pub breakdown: BTreeMap<String, u8>,
}

/// One outreach email variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailVariant {
    pub variant: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait ResearchProvider: Send + Sync {
    async fn research(&self, lead: &Value) -> Result<ResearchReport, AgentError>;
}

#[async_trait]
pub trait Scorer: Send + Sync {
    /// Score a lead; `research` is `None` when research produced nothing
    async fn score(&self, lead: &Value, research: Option<&Value>) -> Result<LeadScore, AgentError>;
}

#[async_trait]
pub trait Copywriter: Send + Sync {
    /// Ordered variants, best first
    async fn generate(&self, lead: &Value, research: Option<&Value>) -> Result<Vec<EmailVariant>, AgentError>;
}

#[async_trait]
pub trait TimingPredictor: Send + Sync {
    async fn predict(&self, lead: &Value) -> Result<DateTime<Utc>, AgentError>;
}

/// Research stages whose output later stages read, in preference order
fn research_stages() -> [String; 3] {
    [RESEARCH_DEEP.to_string(), RESEARCH.to_string(), RESEARCH_BASIC.to_string()]
}

/// Research agent that also bids in the research auction
pub struct ResearchAgent {
    id: String,
    provider: Arc<dyn ResearchProvider>,
    cost: f64,
    quality: u8,
}

impl ResearchAgent {
    /// `cost` and `quality` are the bid this agent offers for every lead
    pub fn new(id: impl Into<String>, provider: Arc<dyn ResearchProvider>, cost: f64, quality: u8) -> Self {
        Self {
            id: id.into(),
            provider,
            cost,
            quality,
        }
    }
}

#[async_trait]
impl Agent for ResearchAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn evaluate(&self, input: &AgentInput) -> Result<Evaluation, AgentError> {
        let report = self.provider.research(&input.payload).await?;
        Ok(Evaluation::produced(report.into_output()).with_bid(Bid::new(
            self.id.clone(),
            RESEARCH_TASK,
            self.cost,
            self.quality,
        )))
    }
}

/// Qualifies leads; skips forward below the minimum score
pub struct ScoringAgent {
    id: String,
    scorer: Arc<dyn Scorer>,
    min_score: u8,
}

impl ScoringAgent {
    pub fn new(id: impl Into<String>, scorer: Arc<dyn Scorer>, min_score: u8) -> Self {
        Self {
            id: id.into(),
            scorer,
            min_score,
        }
    }
}

#[async_trait]
impl Agent for ScoringAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn evaluate(&self, input: &AgentInput) -> Result<Evaluation, AgentError> {
        let research = input.first_output(&research_stages());
        let scored = self.scorer.score(&input.payload, research).await?;
        if scored.score < self.min_score {
            return Ok(Evaluation::skip_forward(format!(
                "score {} below minimum {}",
                scored.score, self.min_score
            )));
        }
        let output = serde_json::to_value(&scored).map_err(|e| AgentError::fatal(e.to_string()))?;
        Ok(Evaluation::produced(output))
    }
}

/// Writes outreach copy.
///
/// Output is `{"variants": [...], "fallback": bool}`. Thin or missing
/// research skips the copywriter and uses [`template_variants`] from the
/// lead payload alone; so does a copywriter that fails permanently or
/// returns nothing. Transient failures still propagate so the runtime
/// retries them.
pub struct CopyAgent {
    id: String,
    copywriter: Arc<dyn Copywriter>,
}

impl CopyAgent {
    pub fn new(id: impl Into<String>, copywriter: Arc<dyn Copywriter>) -> Self {
        Self {
            id: id.into(),
            copywriter,
        }
    }

    async fn write(&self, input: &AgentInput) -> Result<(Vec<EmailVariant>, bool), AgentError> {
        let research = input.first_output(&research_stages());
        let quality = research
            .and_then(|r| r.get("quality_score"))
            .and_then(Value::as_f64);
        let fallback = || template_variants(&input.payload, None);

        match quality {
            Some(q) if q >= MIN_RESEARCH_QUALITY => {}
            _ => {
                debug!(instance = %input.instance_id, quality = ?quality, "research too thin, using fallback copy");
                return Ok((fallback(), true));
            }
        }

        match self.copywriter.generate(&input.payload, research).await {
            Ok(variants) if !variants.is_empty() => Ok((variants, false)),
            Ok(_) => {
                warn!(instance = %input.instance_id, "copywriter returned no variants, using fallback copy");
                Ok((fallback(), true))
            }
            Err(e) if e.is_transient() || matches!(e, AgentError::Cancelled) => Err(e),
            Err(e) => {
                warn!(instance = %input.instance_id, error = %e, "copywriter failed, using fallback copy");
                Ok((fallback(), true))
            }
        }
    }
}

#[async_trait]
impl Agent for CopyAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn evaluate(&self, input: &AgentInput) -> Result<Evaluation, AgentError> {
        let (variants, fallback) = self.write(input).await?;
        let variants = serde_json::to_value(&variants).map_err(|e| AgentError::fatal(e.to_string()))?;
        Ok(Evaluation::produced(serde_json::json!({
            "variants": variants,
            "fallback": fallback,
        })))
    }
}

/// Picks the send time
pub struct TimingAgent {
    id: String,
    predictor: Arc<dyn TimingPredictor>,
}

impl TimingAgent {
    pub fn new(id: impl Into<String>, predictor: Arc<dyn TimingPredictor>) -> Self {
        Self {
            id: id.into(),
            predictor,
        }
    }
}

#[async_trait]
impl Agent for TimingAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn evaluate(&self, input: &AgentInput) -> Result<Evaluation, AgentError> {
        let send_at = self.predictor.predict(&input.payload).await?;
        Ok(Evaluation::produced(serde_json::json!({ "send_at": send_at })))
    }
}
