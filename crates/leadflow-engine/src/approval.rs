//! Approval gate
//!
//! Sign-off before the side-effecting action. A ticket moves through
//!
//! ```text
//! pending ─┬─> auto_approved ─> approved
//!          └─> human_review ─┬─> approved
//!                            ├─> rejected
//!                            └─> timed_out ─┬─> approved   (default action)
//!                                           └─> rejected
//! ```
//!
//! Human review is never a blocking wait: the ticket is stored with its
//! deadline on the instance, and a reviewer decision or a timeout sweep
//! resolves it later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::EngineError;
use crate::instance::{offset, InstanceId, WorkflowInstance};

/// A reviewer decision, also used as the timeout default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

/// Approval gate settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Scores at or above this approve without review
    pub auto_approval_threshold: u8,

    /// How long a human review may stay open
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Applied when the review deadline passes
    pub default_action: ApprovalDecision,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            auto_approval_threshold: 90,
            timeout: Duration::from_secs(24 * 60 * 60),
            default_action: ApprovalDecision::Reject,
        }
    }
}

impl ApprovalConfig {
    pub fn with_threshold(mut self, threshold: u8) -> Self {
        self.auto_approval_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_default_action(mut self, action: ApprovalDecision) -> Self {
        self.default_action = action;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.auto_approval_threshold > 100 {
            return Err(EngineError::config(
                "auto_approval_threshold must be within 0-100",
            ));
        }
        Ok(())
    }
}

/// States of an approval ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    AutoApproved,
    HumanReview,
    TimedOut,
    Approved,
    Rejected,
}

impl ApprovalState {
    pub fn can_transition_to(self, next: ApprovalState) -> bool {
        use ApprovalState::*;
        matches!(
            (self, next),
            (Pending, AutoApproved)
                | (Pending, HumanReview)
                | (AutoApproved, Approved)
                | (HumanReview, Approved)
                | (HumanReview, Rejected)
                | (HumanReview, TimedOut)
                | (TimedOut, Approved)
                | (TimedOut, Rejected)
        )
    }

    pub fn is_resolved(self) -> bool {
        matches!(self, ApprovalState::Approved | ApprovalState::Rejected)
    }
}

/// Approval record stored on the instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalTicket {
    pub stage: String,
    pub state: ApprovalState,
    /// Every state visited, in order
    pub trail: Vec<ApprovalState>,
    pub score: Option<f64>,
    pub threshold: u8,
    pub requested_at: DateTime<Utc>,
    /// Set when the ticket enters human review
    pub deadline: Option<DateTime<Utc>>,
    pub default_action: ApprovalDecision,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl ApprovalTicket {
    /// Open a ticket and route it: auto-approve or send to human review.
    ///
    /// A missing score never auto-approves.
    pub fn open(stage: impl Into<String>, score: Option<f64>, config: &ApprovalConfig, now: DateTime<Utc>) -> Self {
        let mut ticket = Self {
            stage: stage.into(),
            state: ApprovalState::Pending,
            trail: vec![ApprovalState::Pending],
            score,
            threshold: config.auto_approval_threshold,
            requested_at: now,
            deadline: None,
            default_action: config.default_action,
            decided_by: None,
            decided_at: None,
        };

        let auto = score.is_some_and(|s| s >= f64::from(config.auto_approval_threshold));
        if auto {
            ticket.push(ApprovalState::AutoApproved);
            ticket.push(ApprovalState::Approved);
            ticket.decided_by = Some("auto".to_string());
            ticket.decided_at = Some(now);
        } else {
            ticket.push(ApprovalState::HumanReview);
            ticket.deadline = Some(offset(now, config.timeout));
        }
        ticket
    }

    fn push(&mut self, next: ApprovalState) {
        debug_assert!(self.state.can_transition_to(next), "{:?} -> {:?}", self.state, next);
        self.state = next;
        self.trail.push(next);
    }

    fn transition(&mut self, next: ApprovalState, instance_id: &InstanceId) -> Result<(), EngineError> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::invalid_transition(
                instance_id,
                format!("approval cannot move from {:?} to {:?}", self.state, next),
            ));
        }
        self.push(next);
        Ok(())
    }

    pub fn is_awaiting_review(&self) -> bool {
        self.state == ApprovalState::HumanReview
    }

    /// In human review with the deadline at or before `now`
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_awaiting_review() && self.deadline.is_some_and(|d| d <= now)
    }

    /// Apply a reviewer decision made at `now`.
    ///
    /// A decision at or after the deadline is discarded: the ticket times out
    /// to its default action and [`EngineError::ApprovalTimeout`] is returned
    /// after the ticket has been updated.
    pub fn decide(
        &mut self,
        decision: ApprovalDecision,
        reviewer: impl Into<String>,
        now: DateTime<Utc>,
        instance_id: &InstanceId,
    ) -> Result<(), EngineError> {
        if self.is_overdue(now) {
            self.expire(now, instance_id)?;
            return Err(EngineError::ApprovalTimeout(instance_id.clone()));
        }
        let next = match decision {
            ApprovalDecision::Approve => ApprovalState::Approved,
            ApprovalDecision::Reject => ApprovalState::Rejected,
        };
        self.transition(next, instance_id)?;
        self.decided_by = Some(reviewer.into());
        self.decided_at = Some(now);
        Ok(())
    }

    /// Resolve an overdue review to the default action.
    ///
    /// Returns `false` when the ticket was not overdue.
    pub fn expire(&mut self, now: DateTime<Utc>, instance_id: &InstanceId) -> Result<bool, EngineError> {
        if !self.is_overdue(now) {
            return Ok(false);
        }
        self.transition(ApprovalState::TimedOut, instance_id)?;
        let next = match self.default_action {
            ApprovalDecision::Approve => ApprovalState::Approved,
            ApprovalDecision::Reject => ApprovalState::Rejected,
        };
        self.transition(next, instance_id)?;
        self.decided_by = Some("timeout".to_string());
        self.decided_at = Some(now);
        Ok(true)
    }

    /// Final decision, once resolved
    pub fn outcome(&self) -> Option<ApprovalDecision> {
        match self.state {
            ApprovalState::Approved => Some(ApprovalDecision::Approve),
            ApprovalState::Rejected => Some(ApprovalDecision::Reject),
            _ => None,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.trail.contains(&ApprovalState::TimedOut)
    }
}

/// Notification sent to the reviewer channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub instance_id: InstanceId,
    pub stage: String,
    pub score: Option<f64>,
    pub threshold: u8,
    pub deadline: Option<DateTime<Utc>>,
    pub summary: String,
}

impl ReviewRequest {
    pub fn for_instance(instance: &WorkflowInstance, ticket: &ApprovalTicket) -> Self {
        let subject = ["company", "name", "email"]
            .iter()
            .find_map(|key| instance.payload.get(*key).and_then(|v| v.as_str()))
            .unwrap_or("lead");
        let score = ticket
            .score
            .map(|s| format!("{s:.0}"))
            .unwrap_or_else(|| "n/a".to_string());
        Self {
            instance_id: instance.id.clone(),
            stage: ticket.stage.clone(),
            score: ticket.score,
            threshold: ticket.threshold,
            deadline: ticket.deadline,
            summary: format!(
                "{subject}: score {score} below auto-approval threshold {}",
                ticket.threshold
            ),
        }
    }
}
