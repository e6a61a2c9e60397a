//! Workflow instance state
//!
//! A [`WorkflowInstance`] is never stored directly: it is the fold of its
//! checkpoint chain (see [`crate::store::replay`]). The executor clones the
//! current state, applies one transition and appends the result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::approval::ApprovalTicket;

/// Stable identifier of a workflow instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    /// Wrap an existing identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    WaitingApproval,
    Approved,
    Rejected,
    Failed,
    Completed,
}

impl InstanceStatus {
    /// Terminal statuses never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Rejected | InstanceStatus::Failed | InstanceStatus::Completed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "running",
            InstanceStatus::WaitingApproval => "waiting_approval",
            InstanceStatus::Approved => "approved",
            InstanceStatus::Rejected => "rejected",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of one stage visit
///
/// `output == None` marks an absent result: the stage ran (or was skipped)
/// but produced nothing usable. Predicates treat absent results explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub output: Option<Value>,
    pub agent: Option<String>,
    pub attempts: u32,
    pub visit: u32,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl StageResult {
    /// A produced result
    pub fn produced(output: Value, agent: Option<String>, attempts: u32, visit: u32) -> Self {
        Self {
            output: Some(output),
            agent,
            attempts,
            visit,
            error: None,
            recorded_at: Utc::now(),
        }
    }

    /// An absent result carrying the error that caused it
    pub fn absent(error: impl Into<String>, agent: Option<String>, attempts: u32, visit: u32) -> Self {
        Self {
            output: None,
            agent,
            attempts,
            visit,
            error: Some(error.into()),
            recorded_at: Utc::now(),
        }
    }

    pub fn is_present(&self) -> bool {
        self.output.is_some()
    }

    /// Look up a field of the output.
    ///
    /// `path` is either a JSON pointer (`/facts/company`) or a dotted path
    /// (`facts.company`, `variants.0.subject`). An empty path is the whole
    /// output.
    pub fn field(&self, path: &str) -> Option<&Value> {
        let output = self.output.as_ref()?;
        lookup(output, path)
    }
}

/// Resolve a JSON pointer or dotted path inside `value`
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    if path.starts_with('/') {
        return value.pointer(path);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Full state of one workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub payload: Value,
    pub stage_results: BTreeMap<String, StageResult>,
    pub status: InstanceStatus,
    pub budget_remaining: f64,
    pub version: u64,
    pub visit_counts: BTreeMap<String, u32>,
    /// Next stage to run; `None` once nothing is pending
    pub cursor: Option<String>,
    pub reason: Option<String>,
    pub approval: Option<ApprovalTicket>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// State of a freshly submitted instance, before its genesis commit
    pub fn new(id: InstanceId, payload: Value, budget: f64, entry: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            payload,
            stage_results: BTreeMap::new(),
            status: InstanceStatus::Running,
            budget_remaining: budget,
            version: 1,
            visit_counts: BTreeMap::new(),
            cursor: Some(entry.into()),
            reason: None,
            approval: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of committed visits to `stage`
    pub fn visits(&self, stage: &str) -> u32 {
        self.visit_counts.get(stage).copied().unwrap_or(0)
    }

    pub fn result(&self, stage: &str) -> Option<&StageResult> {
        self.stage_results.get(stage)
    }

    /// Output of `stage`, if present
    pub fn output(&self, stage: &str) -> Option<&Value> {
        self.stage_results.get(stage)?.output.as_ref()
    }

    /// Start the next version of this instance.
    ///
    /// The returned copy has `version + 1` and a fresh `updated_at`; the
    /// caller applies the transition and appends it.
    pub fn successor(&self) -> Self {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.updated_at = Utc::now();
        next
    }

    /// Record a visit to `stage` and return its visit number
    pub fn record_visit(&mut self, stage: &str) -> u32 {
        let count = self.visit_counts.entry(stage.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Store the result of `stage`, replacing an earlier visit's result
    pub fn record_result(&mut self, stage: impl Into<String>, result: StageResult) {
        self.stage_results.insert(stage.into(), result);
    }

    /// Move into a terminal status with a reason
    pub fn finish(&mut self, status: InstanceStatus, reason: impl Into<String>) {
        self.status = status;
        self.reason = Some(reason.into());
        self.cursor = None;
    }
}

/// `start + duration`, saturating at the maximum representable time
pub(crate) fn offset(start: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| start.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_terminal() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Rejected.is_terminal());
        assert!(InstanceStatus::Failed.is_terminal());
        assert!(!InstanceStatus::WaitingApproval.is_terminal());
        assert!(!InstanceStatus::Approved.is_terminal());
        assert_eq!(
            serde_json::to_string(&InstanceStatus::WaitingApproval).unwrap(),
            "\"waiting_approval\""
        );
    }

    #[test]
    fn test_field_lookup() {
        let result = StageResult::produced(
            json!({"quality_score": 72, "facts": {"company": "Acme"}, "variants": [{"subject": "hi"}]}),
            Some("research.premium".into()),
            1,
            1,
        );
        assert_eq!(result.field("quality_score"), Some(&json!(72)));
        assert_eq!(result.field("facts.company"), Some(&json!("Acme")));
        assert_eq!(result.field("/facts/company"), Some(&json!("Acme")));
        assert_eq!(result.field("variants.0.subject"), Some(&json!("hi")));
        assert_eq!(result.field("facts.missing"), None);
    }

    #[test]
    fn test_absent_result_has_no_fields() {
        let result = StageResult::absent("timeout", Some("timing".into()), 2, 1);
        assert!(!result.is_present());
        assert_eq!(result.field(""), None);
        assert_eq!(result.error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_successor_and_visits() {
        let instance = WorkflowInstance::new(InstanceId::new("i-1"), json!({}), 0.25, "research");
        let mut next = instance.successor();
        assert_eq!(next.version, 2);
        assert_eq!(next.record_visit("research"), 1);
        assert_eq!(next.record_visit("research"), 2);
        assert_eq!(next.visits("research"), 2);
        assert_eq!(instance.visits("research"), 0);

        next.finish(InstanceStatus::Failed, "cycle_limit_exceeded");
        assert!(next.is_terminal());
        assert_eq!(next.cursor, None);
    }

    #[test]
    fn test_offset_saturates() {
        let now = Utc::now();
        assert_eq!(offset(now, Duration::from_secs(60)), now + chrono::Duration::seconds(60));
        assert_eq!(offset(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
