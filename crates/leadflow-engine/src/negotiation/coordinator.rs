//! Bid collection and budget settlement

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{clear_auction, AuctionPolicy, AuctionResult, Bid};
use crate::agent::{AgentInput, AgentRuntime, Evaluation};
use crate::error::{AuctionError, EngineError};
use crate::instance::WorkflowInstance;

/// Tolerance for comparing money amounts
const BUDGET_EPSILON: f64 = 1e-9;

/// Bids collected for one task, together with each bidder's result
#[derive(Debug, Clone)]
pub struct BidBook {
    pub task: String,
    pub bids: Vec<Bid>,
    evaluations: HashMap<String, Evaluation>,
    /// When collection closed; the clock used for TTL checks
    pub closed_at: DateTime<Utc>,
}

impl BidBook {
    pub fn len(&self) -> usize {
        self.bids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty()
    }
}

/// A cleared auction and the winner's stage result
#[derive(Debug, Clone)]
pub struct AuctionOutcome {
    pub result: AuctionResult,
    pub evaluation: Evaluation,
}

/// Budget movement of one settled auction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub clearing_price: f64,
    pub budget_before: f64,
    pub budget_after: f64,
}

impl Settlement {
    /// Apply the budget decrement to the next instance version
    pub fn apply(&self, instance: &mut WorkflowInstance) {
        instance.budget_remaining = self.budget_after;
    }
}

/// Runs auctions among registered agents
#[derive(Clone)]
pub struct NegotiationCoordinator {
    runtime: AgentRuntime,
    policy: AuctionPolicy,
}

impl NegotiationCoordinator {
    pub fn new(runtime: AgentRuntime, policy: AuctionPolicy) -> Self {
        Self { runtime, policy }
    }

    pub fn policy(&self) -> &AuctionPolicy {
        &self.policy
    }

    /// Invoke every participant concurrently and keep the bids that arrive
    /// before `deadline`.
    ///
    /// Disabled agents are skipped. Failing agents and bids for another task
    /// or signed by another agent are dropped. Cancelling `cancel` aborts the
    /// collection.
    pub async fn collect_bids(
        &self,
        input: Arc<AgentInput>,
        task: &str,
        participants: &[String],
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<BidBook, EngineError> {
        let mut join_set = JoinSet::new();
        for agent_id in participants {
            if !self.runtime.registry().is_enabled(agent_id) {
                debug!(agent = %agent_id, task, "participant disabled, not bidding");
                continue;
            }
            let runtime = self.runtime.clone();
            let input = Arc::clone(&input);
            let agent_id = agent_id.clone();
            let token = cancel.clone();
            join_set.spawn(async move {
                let result = runtime.invoke(&agent_id, input, deadline, &token).await;
                (agent_id, result)
            });
        }

        let closes = tokio::time::sleep(deadline);
        tokio::pin!(closes);

        let mut bids = Vec::new();
        let mut evaluations = HashMap::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    join_set.abort_all();
                    return Err(EngineError::Cancelled(input.instance_id.clone()));
                }
                _ = &mut closes => {
                    if !join_set.is_empty() {
                        warn!(task, pending = join_set.len(), "auction deadline elapsed");
                    }
                    join_set.abort_all();
                    break;
                }
                next = join_set.join_next() => {
                    let Some(joined) = next else { break };
                    match joined {
                        Ok((agent_id, Ok(evaluation))) => match &evaluation.bid {
                            Some(bid) if bid.task_id == task && bid.agent_id == agent_id => {
                                debug!(
                                    agent = %agent_id,
                                    cost = bid.estimated_cost,
                                    quality = bid.estimated_quality,
                                    "bid received"
                                );
                                bids.push(bid.clone());
                                evaluations.insert(agent_id, evaluation);
                            }
                            Some(_) => warn!(agent = %agent_id, task, "bid does not match task or agent"),
                            None => debug!(agent = %agent_id, task, "participant declined to bid"),
                        },
                        Ok((agent_id, Err(e))) => warn!(agent = %agent_id, task, error = %e, "participant failed"),
                        Err(e) => warn!(task, error = %e, "participant task aborted"),
                    }
                }
            }
        }

        Ok(BidBook {
            task: task.to_string(),
            bids,
            evaluations,
            closed_at: Utc::now(),
        })
    }

    /// Clear collected bids with an optional quality floor
    pub fn clear(&self, book: &BidBook, min_quality: Option<u8>) -> Result<AuctionOutcome, AuctionError> {
        let result = clear_auction(
            &book.task,
            &book.bids,
            book.closed_at,
            self.policy.pricing,
            min_quality,
        )?;
        let evaluation = book
            .evaluations
            .get(&result.winner)
            .cloned()
            .ok_or_else(|| AuctionError::NoBids {
                task: book.task.clone(),
            })?;
        info!(
            task = %result.task_id,
            winner = %result.winner,
            price = result.clearing_price,
            bidders = result.ranked.len(),
            "auction cleared"
        );
        Ok(AuctionOutcome { result, evaluation })
    }

    /// Collect bids and clear them using the policy's quality floor for `task`
    pub async fn run_auction(
        &self,
        input: Arc<AgentInput>,
        task: &str,
        participants: &[String],
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<AuctionOutcome, EngineError> {
        let book = self
            .collect_bids(input, task, participants, deadline, cancel)
            .await?;
        Ok(self.clear(&book, self.policy.min_quality_for(task))?)
    }

    /// Check the budget gate for a cleared auction
    pub fn settle(&self, result: &AuctionResult, budget_remaining: f64) -> Result<Settlement, AuctionError> {
        if result.clearing_price > budget_remaining + BUDGET_EPSILON {
            return Err(AuctionError::BudgetExceeded {
                required: result.clearing_price,
                remaining: budget_remaining,
            });
        }
        Ok(Settlement {
            clearing_price: result.clearing_price,
            budget_before: budget_remaining,
            budget_after: (budget_remaining - result.clearing_price).max(0.0),
        })
    }
}
