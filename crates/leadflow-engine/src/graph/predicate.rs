//! Edge predicates over stage results
//!
//! Predicates are plain data so a graph can be described in JSON. Every
//! predicate that looks at a field returns `false` when the stage result is
//! absent: an absent result never satisfies a numeric or equality test.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::instance::StageResult;

/// Condition attached to an edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// Always matches
    Always,
    /// Stage has a produced result
    Present { stage: String },
    /// Stage never ran or its result is absent
    Missing { stage: String },
    /// Numeric field is `>= value`
    AtLeast {
        stage: String,
        field: String,
        value: f64,
    },
    /// Numeric field is `< value`
    Below {
        stage: String,
        field: String,
        value: f64,
    },
    /// Field equals `value`
    Equals {
        stage: String,
        field: String,
        value: Value,
    },
    /// Field is one of `values`
    In {
        stage: String,
        field: String,
        values: Vec<Value>,
    },
    /// String field matches a regex
    Matches {
        stage: String,
        field: String,
        pattern: Pattern,
    },
    /// Field is truthy (non-zero, non-empty, true)
    Truthy { stage: String, field: String },
    All { of: Vec<Predicate> },
    Any { of: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    pub fn always() -> Self {
        Self::Always
    }

    pub fn present(stage: impl Into<String>) -> Self {
        Self::Present { stage: stage.into() }
    }

    pub fn missing(stage: impl Into<String>) -> Self {
        Self::Missing { stage: stage.into() }
    }

    pub fn at_least(stage: impl Into<String>, field: impl Into<String>, value: f64) -> Self {
        Self::AtLeast {
            stage: stage.into(),
            field: field.into(),
            value,
        }
    }

    pub fn below(stage: impl Into<String>, field: impl Into<String>, value: f64) -> Self {
        Self::Below {
            stage: stage.into(),
            field: field.into(),
            value,
        }
    }

    pub fn equals(stage: impl Into<String>, field: impl Into<String>, value: Value) -> Self {
        Self::Equals {
            stage: stage.into(),
            field: field.into(),
            value,
        }
    }

    pub fn matches(stage: impl Into<String>, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Matches {
            stage: stage.into(),
            field: field.into(),
            pattern: Pattern::new(pattern),
        }
    }

    pub fn truthy(stage: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Truthy {
            stage: stage.into(),
            field: field.into(),
        }
    }

    pub fn all(of: Vec<Predicate>) -> Self {
        Self::All { of }
    }

    pub fn any(of: Vec<Predicate>) -> Self {
        Self::Any { of }
    }

    pub fn negate(predicate: Predicate) -> Self {
        Self::Not {
            predicate: Box::new(predicate),
        }
    }

    /// Evaluate against the instance's stage results
    pub fn evaluate(&self, results: &BTreeMap<String, StageResult>) -> bool {
        let field = |stage: &str, path: &str| results.get(stage).and_then(|r| r.field(path)).cloned();
        match self {
            Predicate::Always => true,
            Predicate::Present { stage } => results.get(stage).is_some_and(StageResult::is_present),
            Predicate::Missing { stage } => !results.get(stage).is_some_and(StageResult::is_present),
            Predicate::AtLeast { stage, field: path, value } => {
                number(field(stage, path)).is_some_and(|n| n >= *value)
            }
            Predicate::Below { stage, field: path, value } => {
                number(field(stage, path)).is_some_and(|n| n < *value)
            }
            Predicate::Equals { stage, field: path, value } => {
                field(stage, path).is_some_and(|v| v == *value)
            }
            Predicate::In { stage, field: path, values } => {
                field(stage, path).is_some_and(|v| values.contains(&v))
            }
            Predicate::Matches { stage, field: path, pattern } => match field(stage, path) {
                Some(Value::String(s)) => pattern.is_match(&s),
                _ => false,
            },
            Predicate::Truthy { stage, field: path } => field(stage, path).is_some_and(|v| truthy(&v)),
            Predicate::All { of } => of.iter().all(|p| p.evaluate(results)),
            Predicate::Any { of } => of.iter().any(|p| p.evaluate(results)),
            Predicate::Not { predicate } => !predicate.evaluate(results),
        }
    }

    /// Short label for diagrams; `None` for unconditional edges
    pub fn label(&self) -> Option<String> {
        match self {
            Predicate::Always => None,
            other => Some(other.describe()),
        }
    }

    fn describe(&self) -> String {
        match self {
            Predicate::Always => "always".to_string(),
            Predicate::Present { stage } => format!("{stage} present"),
            Predicate::Missing { stage } => format!("{stage} missing"),
            Predicate::AtLeast { stage, field, value } => format!("{stage}.{field} >= {value}"),
            Predicate::Below { stage, field, value } => format!("{stage}.{field} < {value}"),
            Predicate::Equals { stage, field, value } => format!("{stage}.{field} == {value}"),
            Predicate::In { stage, field, values } => format!("{stage}.{field} in {}", values.len()),
            Predicate::Matches { stage, field, pattern } => format!("{stage}.{field} ~ {pattern}"),
            Predicate::Truthy { stage, field } => format!("{stage}.{field}"),
            Predicate::All { of } => join(of, " and "),
            Predicate::Any { of } => join(of, " or "),
            Predicate::Not { predicate } => format!("not {}", predicate.describe()),
        }
    }
}

/// Regex source, compiled once when the predicate is built or deserialized.
///
/// Serializes as the plain pattern string; equality compares the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Pattern {
    source: String,
    compiled: Result<Regex, String>,
}

impl Pattern {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let compiled = Regex::new(&source).map_err(|e| e.to_string());
        Self { source, compiled }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Compile error, if the source is not a valid regex
    pub fn error(&self) -> Option<&str> {
        self.compiled.as_ref().err().map(String::as_str)
    }

    /// An invalid pattern matches nothing
    pub fn is_match(&self, text: &str) -> bool {
        self.compiled.as_ref().is_ok_and(|re| re.is_match(text))
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl From<String> for Pattern {
    fn from(source: String) -> Self {
        Self::new(source)
    }
}

impl From<Pattern> for String {
    fn from(pattern: Pattern) -> Self {
        pattern.source
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn join(predicates: &[Predicate], sep: &str) -> String {
    predicates
        .iter()
        .map(Predicate::describe)
        .collect::<Vec<_>>()
        .join(sep)
}

fn number(value: Option<Value>) -> Option<f64> {
    value?.as_f64()
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(arr) => !arr.is_empty(),
        Value::Object(obj) => !obj.is_empty(),
        Value::Null => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn results() -> BTreeMap<String, StageResult> {
        let mut results = BTreeMap::new();
        results.insert(
            "research".to_string(),
            StageResult::produced(
                json!({"quality_score": 35, "facts": {"industry": "SaaS", "hiring": ["eng"]}}),
                None,
                1,
                1,
            ),
        );
        results.insert(
            "timing".to_string(),
            StageResult::absent("timed out", None, 1, 1),
        );
        results
    }

    #[test]
    fn test_presence() {
        let results = results();
        assert!(Predicate::present("research").evaluate(&results));
        assert!(!Predicate::present("timing").evaluate(&results));
        assert!(Predicate::missing("timing").evaluate(&results));
        assert!(Predicate::missing("never_ran").evaluate(&results));
    }

    #[test]
    fn test_numeric() {
        let results = results();
        assert!(Predicate::below("research", "quality_score", 40.0).evaluate(&results));
        assert!(!Predicate::at_least("research", "quality_score", 40.0).evaluate(&results));
        assert!(Predicate::at_least("research", "quality_score", 35.0).evaluate(&results));
    }

    #[test]
    fn test_absent_never_satisfies_comparisons() {
        let results = results();
        assert!(!Predicate::below("timing", "send_at", 1e18).evaluate(&results));
        assert!(!Predicate::at_least("timing", "send_at", f64::MIN).evaluate(&results));
        assert!(!Predicate::equals("timing", "", Value::Null).evaluate(&results));
        // Negation is explicit, so absent results can still be routed on
        assert!(Predicate::negate(Predicate::below("timing", "x", 1.0)).evaluate(&results));
    }

    #[test]
    fn test_equals_matches_truthy() {
        let results = results();
        assert!(Predicate::equals("research", "facts.industry", json!("SaaS")).evaluate(&results));
        assert!(Predicate::matches("research", "/facts/industry", "^Saa").evaluate(&results));
        assert!(!Predicate::matches("research", "facts.industry", "[invalid").evaluate(&results));
        assert!(!Predicate::matches("research", "quality_score", ".*").evaluate(&results));
        assert!(Predicate::truthy("research", "facts.hiring").evaluate(&results));
    }

    #[test]
    fn test_pattern_compiled_once_and_serialized_as_string() {
        let p: Predicate = serde_json::from_value(json!({
            "op": "matches", "stage": "research", "field": "facts.industry", "pattern": "^Saa"
        }))
        .unwrap();
        assert_eq!(p, Predicate::matches("research", "facts.industry", "^Saa"));
        assert!(p.evaluate(&results()));
        assert_eq!(serde_json::to_value(&p).unwrap()["pattern"], json!("^Saa"));

        let Predicate::Matches { pattern, .. } = Predicate::matches("research", "x", "[invalid") else {
            unreachable!()
        };
        assert!(pattern.error().is_some());
        assert!(!pattern.is_match("[invalid"));
        assert_eq!(pattern.as_str(), "[invalid");
    }

    #[test]
    fn test_combinators() {
        let results = results();
        let p = Predicate::all(vec![
            Predicate::present("research"),
            Predicate::any(vec![
                Predicate::present("timing"),
                Predicate::below("research", "quality_score", 40.0),
            ]),
        ]);
        assert!(p.evaluate(&results));
        assert_eq!(
            p.label().unwrap(),
            "research present and timing present or research.quality_score < 40"
        );
        assert_eq!(Predicate::always().label(), None);
    }

    #[test]
    fn test_serde_shape() {
        let p: Predicate = serde_json::from_value(json!({
            "op": "below", "stage": "research", "field": "quality_score", "value": 40
        }))
        .unwrap();
        assert_eq!(p, Predicate::below("research", "quality_score", 40.0));

        let not: Predicate = serde_json::from_value(json!({
            "op": "not", "predicate": {"op": "missing", "stage": "copy"}
        }))
        .unwrap();
        assert_eq!(not, Predicate::negate(Predicate::missing("copy")));
    }
}
