//! Engine configuration
//!
//! Cycle bounds, timeouts, parallelism, budgets and retry policy for the
//! workflow executor. Auction and approval settings live next to the code
//! that uses them and are embedded here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::approval::ApprovalConfig;
use crate::error::EngineError;
use crate::negotiation::AuctionPolicy;

/// Workflow engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum visits per stage before the instance fails
    pub max_visits: u32,

    /// Timeout for a single agent invocation
    #[serde(with = "humantime_serde")]
    pub agent_timeout: Duration,

    /// Maximum concurrent agent invocations within one fan-out
    pub parallelism: usize,

    /// Attempts to commit one transition before giving up on conflicts
    pub max_commit_attempts: u32,

    /// Budget assigned to every new instance
    pub initial_budget: f64,

    /// Retry policy for transient agent failures
    pub retry_policy: RetryPolicy,

    /// Auction pricing, deadline and quality floors
    pub auction: AuctionPolicy,

    /// Approval gate threshold, timeout and default action
    pub approval: ApprovalConfig,

    /// Leads scoring below this are rejected by the qualifier
    pub min_lead_score: u8,

    /// Agents switched off by configuration
    pub disabled_agents: BTreeSet<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_visits: 3,
            agent_timeout: Duration::from_secs(30),
            parallelism: num_cpus::get(),
            max_commit_attempts: 5,
            initial_budget: 0.25,
            retry_policy: RetryPolicy::default(),
            auction: AuctionPolicy::default(),
            approval: ApprovalConfig::default(),
            min_lead_score: 20,
            disabled_agents: BTreeSet::new(),
        }
    }
}

impl EngineConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-stage visit cap
    pub fn with_max_visits(mut self, max: u32) -> Self {
        self.max_visits = max;
        self
    }

    /// Set the agent timeout
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    /// Set parallelism level
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Set the commit attempt bound
    pub fn with_max_commit_attempts(mut self, attempts: u32) -> Self {
        self.max_commit_attempts = attempts.max(1);
        self
    }

    /// Set the initial budget per instance
    pub fn with_initial_budget(mut self, budget: f64) -> Self {
        self.initial_budget = budget;
        self
    }

    /// Set retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set auction policy
    pub fn with_auction(mut self, auction: AuctionPolicy) -> Self {
        self.auction = auction;
        self
    }

    /// Set approval settings
    pub fn with_approval(mut self, approval: ApprovalConfig) -> Self {
        self.approval = approval;
        self
    }

    /// Set the qualifier's minimum lead score
    pub fn with_min_lead_score(mut self, score: u8) -> Self {
        self.min_lead_score = score;
        self
    }

    /// Disable an agent by id
    pub fn disable_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.disabled_agents.insert(agent_id.into());
        self
    }

    /// Reject settings the executor cannot run with
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_visits == 0 {
            return Err(EngineError::config("max_visits must be at least 1"));
        }
        if self.parallelism == 0 {
            return Err(EngineError::config("parallelism must be at least 1"));
        }
        if self.max_commit_attempts == 0 {
            return Err(EngineError::config("max_commit_attempts must be at least 1"));
        }
        if self.agent_timeout.is_zero() {
            return Err(EngineError::config("agent_timeout must be positive"));
        }
        if !self.initial_budget.is_finite() || self.initial_budget < 0.0 {
            return Err(EngineError::config(format!(
                "initial_budget must be a non-negative number, got {}",
                self.initial_budget
            )));
        }
        if self.retry_policy.backoff_base > self.retry_policy.backoff_max {
            return Err(EngineError::config("backoff_base exceeds backoff_max"));
        }
        if self.min_lead_score > 100 {
            return Err(EngineError::config("min_lead_score must be within 0-100"));
        }
        self.auction.validate()?;
        self.approval.validate()?;
        Ok(())
    }
}

/// Retry policy for transient agent failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the first try
    pub max_retries: u32,

    /// Base delay for exponential backoff
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Maximum delay between retries
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Set backoff base duration
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Set maximum backoff duration
    pub fn with_backoff_max(mut self, max: Duration) -> Self {
        self.backoff_max = max;
        self
    }

    /// Delay before retry number `retry` (0-based), doubling each time
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(retry);
        self.backoff_base.saturating_mul(multiplier).min(self.backoff_max)
    }

    /// Check if more retries are allowed after `retries` retries
    pub fn should_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::PricingRule;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_visits, 3);
        assert_eq!(config.agent_timeout, Duration::from_secs(30));
        assert_eq!(config.max_commit_attempts, 5);
        assert!((config.initial_budget - 0.25).abs() < 1e-9);
        assert!(config.parallelism > 0);
        assert_eq!(config.auction.pricing, PricingRule::SecondPrice);
        assert_eq!(config.approval.auto_approval_threshold, 90);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .with_max_visits(5)
            .with_parallelism(0)
            .with_initial_budget(1.0)
            .disable_agent("timing");

        assert_eq!(config.max_visits, 5);
        assert_eq!(config.parallelism, 1);
        assert!(config.disabled_agents.contains("timing"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(EngineConfig::default().with_max_visits(0).validate().is_err());
        assert!(EngineConfig::default()
            .with_initial_budget(f64::NAN)
            .validate()
            .is_err());
        assert!(EngineConfig::default()
            .with_initial_budget(-0.1)
            .validate()
            .is_err());
        assert!(EngineConfig::default()
            .with_agent_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_visits": 2, "agent_timeout": "5s"}"#).unwrap();
        assert_eq!(config.max_visits, 2);
        assert_eq!(config.agent_timeout, Duration::from_secs(5));
        assert_eq!(config.max_commit_attempts, 5);
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_retry_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));

        let capped = policy.with_backoff_max(Duration::from_millis(300));
        assert_eq!(capped.delay_for_attempt(10), Duration::from_millis(300));
    }

    #[test]
    fn test_no_retry_policy() {
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }
}
