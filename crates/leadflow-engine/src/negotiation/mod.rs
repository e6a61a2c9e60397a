//! Resource negotiation between competing agents
//!
//! Agents bid `(estimated_cost, estimated_quality)` for a task. Bids are
//! ranked by quality per unit cost and the clearing price is set by the
//! configured [`PricingRule`]. Clearing ([`clear_auction`]) is a pure function
//! of the bids, the clock and the policy; collecting bids and settling
//! budgets happens in [`NegotiationCoordinator`].

mod coordinator;

pub use coordinator::{AuctionOutcome, BidBook, NegotiationCoordinator, Settlement};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{AuctionError, EngineError};
use crate::instance::offset;

/// Default validity window of a bid
pub const DEFAULT_BID_TTL: Duration = Duration::from_secs(60);

/// A sealed bid for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub agent_id: String,
    pub task_id: String,
    pub estimated_cost: f64,
    /// 0-100
    pub estimated_quality: u8,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    pub submitted_at: DateTime<Utc>,
}

impl Bid {
    /// Create a bid submitted now with the default TTL
    pub fn new(
        agent_id: impl Into<String>,
        task_id: impl Into<String>,
        estimated_cost: f64,
        estimated_quality: u8,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            task_id: task_id.into(),
            estimated_cost,
            estimated_quality,
            ttl: DEFAULT_BID_TTL,
            submitted_at: Utc::now(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn submitted_at(mut self, at: DateTime<Utc>) -> Self {
        self.submitted_at = at;
        self
    }

    /// Quality per unit cost
    pub fn ratio(&self) -> f64 {
        f64::from(self.estimated_quality) / self.estimated_cost
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        offset(self.submitted_at, self.ttl)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    /// Cost must be positive and finite, quality within 0-100
    pub fn is_well_formed(&self) -> bool {
        self.estimated_cost.is_finite() && self.estimated_cost > 0.0 && self.estimated_quality <= 100
    }
}

/// How the winner's payment is determined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingRule {
    /// Winner pays the runner-up's cost, never more than its own bid
    #[default]
    SecondPrice,
    /// Winner pays its own bid
    FirstPrice,
}

/// Auction settings shared by all auction stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuctionPolicy {
    pub pricing: PricingRule,

    /// How long to wait for bids
    #[serde(with = "humantime_serde")]
    pub deadline: Duration,

    /// Minimum winning quality per task id
    pub min_quality: BTreeMap<String, u8>,
}

impl Default for AuctionPolicy {
    fn default() -> Self {
        Self {
            pricing: PricingRule::SecondPrice,
            deadline: Duration::from_secs(5),
            min_quality: BTreeMap::new(),
        }
    }
}

impl AuctionPolicy {
    pub fn with_pricing(mut self, pricing: PricingRule) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Require at least `quality` from the winner of `task`
    pub fn with_min_quality(mut self, task: impl Into<String>, quality: u8) -> Self {
        self.min_quality.insert(task.into(), quality);
        self
    }

    pub fn min_quality_for(&self, task: &str) -> Option<u8> {
        self.min_quality.get(task).copied()
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.deadline.is_zero() {
            return Err(EngineError::config("auction deadline must be positive"));
        }
        if let Some((task, q)) = self.min_quality.iter().find(|(_, q)| **q > 100) {
            return Err(EngineError::config(format!(
                "min_quality for {task} must be within 0-100, got {q}"
            )));
        }
        Ok(())
    }
}

/// One entry of the audit ranking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedBid {
    pub rank: usize,
    pub ratio: f64,
    pub bid: Bid,
}

/// Outcome of a cleared auction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionResult {
    pub task_id: String,
    pub winner: String,
    pub clearing_price: f64,
    pub quality_guarantee: u8,
    pub pricing: PricingRule,
    /// Every valid bid, best first
    pub ranked: Vec<RankedBid>,
    /// Agents whose bids were expired or malformed
    pub excluded: Vec<String>,
    pub cleared_at: DateTime<Utc>,
}

impl AuctionResult {
    pub fn runner_up(&self) -> Option<&RankedBid> {
        self.ranked.get(1)
    }
}

/// Ranking order: ratio desc, quality desc, cost asc, agent id asc
fn rank_order(a: &Bid, b: &Bid) -> Ordering {
    b.ratio()
        .total_cmp(&a.ratio())
        .then_with(|| b.estimated_quality.cmp(&a.estimated_quality))
        .then_with(|| a.estimated_cost.total_cmp(&b.estimated_cost))
        .then_with(|| a.agent_id.cmp(&b.agent_id))
}

/// Clear a sealed-bid auction for `task`.
///
/// Bids for other tasks, expired bids and malformed bids are ignored. The
/// result depends only on the arguments, so replaying an auction with the
/// same bids and `now` yields the same winner and price.
pub fn clear_auction(
    task: &str,
    bids: &[Bid],
    now: DateTime<Utc>,
    pricing: PricingRule,
    min_quality: Option<u8>,
) -> Result<AuctionResult, AuctionError> {
    let mut excluded = Vec::new();
    let mut valid: Vec<Bid> = Vec::with_capacity(bids.len());
    for bid in bids.iter().filter(|b| b.task_id == task) {
        if bid.is_well_formed() && !bid.is_expired(now) {
            valid.push(bid.clone());
        } else {
            tracing::debug!(agent = %bid.agent_id, task, "bid excluded");
            excluded.push(bid.agent_id.clone());
        }
    }
    excluded.sort();

    valid.sort_by(rank_order);

    let winner = valid.first().ok_or_else(|| AuctionError::NoBids {
        task: task.to_string(),
    })?;

    if let Some(minimum) = min_quality {
        if winner.estimated_quality < minimum {
            return Err(AuctionError::QualityBelowThreshold {
                task: task.to_string(),
                quality: winner.estimated_quality,
                minimum,
            });
        }
    }

    let clearing_price = match (pricing, valid.get(1)) {
        (PricingRule::SecondPrice, Some(runner_up)) => {
            runner_up.estimated_cost.min(winner.estimated_cost)
        }
        _ => winner.estimated_cost,
    };

    let result = AuctionResult {
        task_id: task.to_string(),
        winner: winner.agent_id.clone(),
        clearing_price,
        quality_guarantee: winner.estimated_quality,
        pricing,
        ranked: valid
            .iter()
            .enumerate()
            .map(|(i, bid)| RankedBid {
                rank: i + 1,
                ratio: bid.ratio(),
                bid: bid.clone(),
            })
            .collect(),
        excluded,
        cleared_at: now,
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bid(agent: &str, cost: f64, quality: u8, at: DateTime<Utc>) -> Bid {
        Bid::new(agent, "research", cost, quality).submitted_at(at)
    }

    #[test]
    fn test_best_ratio_wins_second_price() {
        let now = Utc::now();
        let bids = vec![bid("A", 0.05, 85, now), bid("B", 0.03, 60, now)];

        let result = clear_auction("research", &bids, now, PricingRule::SecondPrice, None).unwrap();
        assert_eq!(result.winner, "B");
        assert!((result.clearing_price - 0.03).abs() < 1e-12);
        assert_eq!(result.quality_guarantee, 60);
        assert_eq!(result.ranked.len(), 2);
        assert_eq!(result.ranked[0].rank, 1);
        assert_eq!(result.runner_up().map(|r| r.bid.agent_id.as_str()), Some("A"));
    }

    #[test]
    fn test_second_price_pays_runner_up_cost() {
        let now = Utc::now();
        // A: 80/0.04 = 2000, B: 30/0.02 = 1500
        let bids = vec![bid("A", 0.04, 80, now), bid("B", 0.02, 30, now)];

        let second = clear_auction("research", &bids, now, PricingRule::SecondPrice, None).unwrap();
        assert_eq!(second.winner, "A");
        assert!((second.clearing_price - 0.02).abs() < 1e-12);

        let first = clear_auction("research", &bids, now, PricingRule::FirstPrice, None).unwrap();
        assert!((first.clearing_price - 0.04).abs() < 1e-12);
    }

    #[test]
    fn test_single_bidder_pays_own_cost() {
        let now = Utc::now();
        let result =
            clear_auction("research", &[bid("A", 0.05, 85, now)], now, PricingRule::SecondPrice, None)
                .unwrap();
        assert_eq!(result.winner, "A");
        assert!((result.clearing_price - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_tie_breaks() {
        let now = Utc::now();
        // Equal ratio 2000: higher quality wins
        let bids = vec![bid("low", 0.02, 40, now), bid("high", 0.04, 80, now)];
        let result = clear_auction("research", &bids, now, PricingRule::SecondPrice, None).unwrap();
        assert_eq!(result.winner, "high");

        // Identical bids: smaller agent id wins, regardless of input order
        let bids = vec![bid("zeta", 0.05, 50, now), bid("alpha", 0.05, 50, now)];
        let result = clear_auction("research", &bids, now, PricingRule::SecondPrice, None).unwrap();
        assert_eq!(result.winner, "alpha");
        let reversed: Vec<Bid> = bids.into_iter().rev().collect();
        let again = clear_auction("research", &reversed, now, PricingRule::SecondPrice, None).unwrap();
        assert_eq!(again.winner, "alpha");
        assert_eq!(result.ranked, again.ranked);
    }

    #[test]
    fn test_expired_and_malformed_bids_excluded() {
        let now = Utc::now();
        let stale = bid("stale", 0.01, 99, now - chrono::Duration::seconds(120));
        let free = bid("free", 0.0, 90, now);
        let nan = bid("nan", f64::NAN, 90, now);
        let good = bid("good", 0.05, 50, now);

        let result = clear_auction(
            "research",
            &[stale, free, nan, good],
            now,
            PricingRule::SecondPrice,
            None,
        )
        .unwrap();
        assert_eq!(result.winner, "good");
        assert_eq!(result.excluded, vec!["free", "nan", "stale"]);
    }

    #[test]
    fn test_no_bids() {
        let now = Utc::now();
        let err = clear_auction("research", &[], now, PricingRule::SecondPrice, None).unwrap_err();
        assert_eq!(err, AuctionError::NoBids { task: "research".into() });

        let other_task = Bid::new("A", "copy", 0.01, 50).submitted_at(now);
        assert!(clear_auction("research", &[other_task], now, PricingRule::SecondPrice, None).is_err());
    }

    #[test]
    fn test_quality_gate() {
        let now = Utc::now();
        let bids = vec![bid("cheap", 0.01, 30, now), bid("good", 0.05, 90, now)];
        let err =
            clear_auction("research", &bids, now, PricingRule::SecondPrice, Some(50)).unwrap_err();
        assert_eq!(
            err,
            AuctionError::QualityBelowThreshold {
                task: "research".into(),
                quality: 30,
                minimum: 50
            }
        );
    }

    #[test]
    fn test_policy_serde_and_validate() {
        let policy: AuctionPolicy =
            serde_json::from_str(r#"{"pricing": "first_price", "deadline": "2s"}"#).unwrap();
        assert_eq!(policy.pricing, PricingRule::FirstPrice);
        assert_eq!(policy.deadline, Duration::from_secs(2));
        assert!(policy.validate().is_ok());
        assert!(AuctionPolicy::default()
            .with_min_quality("research", 101)
            .validate()
            .is_err());
    }
}
