//! Deterministic collaborators working from the lead payload alone

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::{Copywriter, EmailVariant, LeadScore, ResearchProvider, ResearchReport, Scorer, TimingPredictor};
use crate::error::AgentError;

const PERSONAL_DOMAINS: &[&str] = &[
    "gmail.com",
    "yahoo.com",
    "hotmail.com",
    "outlook.com",
    "icloud.com",
    "aol.com",
];

/// How much of the payload a research provider reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchDepth {
    /// Company profile and tech stack only
    Basic,
    /// Everything, including hiring, news and hooks
    Deep,
}

/// Research provider that lifts facts out of the lead payload
#[derive(Debug, Clone)]
pub struct PayloadResearchProvider {
    depth: ResearchDepth,
}

impl PayloadResearchProvider {
    pub fn new(depth: ResearchDepth) -> Self {
        Self { depth }
    }

    fn fields(&self) -> &'static [&'static str] {
        const BASIC: &[&str] = &[
            "company",
            "summary",
            "headquarters",
            "employee_count",
            "founded",
            "careers_url",
            "tech_stack",
            "linkedin_url",
        ];
        const DEEP: &[&str] = &[
            "company",
            "summary",
            "headquarters",
            "employee_count",
            "founded",
            "careers_url",
            "tech_stack",
            "linkedin_url",
            "hiring_departments",
            "hiring_locations",
            "open_roles",
            "recent_news",
            "hooks",
        ];
        match self.depth {
            ResearchDepth::Basic => BASIC,
            ResearchDepth::Deep => DEEP,
        }
    }
}

#[async_trait]
impl ResearchProvider for PayloadResearchProvider {
    async fn research(&self, lead: &Value) -> Result<ResearchReport, AgentError> {
        let mut facts = Map::new();
        for field in self.fields() {
            if let Some(value) = lead.get(*field).filter(|v| !v.is_null()) {
                facts.insert(field.to_string(), value.clone());
            }
        }
        facts.insert("depth".to_string(), serde_json::to_value(self.depth).unwrap_or(Value::Null));
        let quality_score = research_quality(&facts);
        Ok(ResearchReport { quality_score, facts })
    }
}

fn list_len(value: &Value, field: &str) -> usize {
    value.get(field).and_then(Value::as_array).map_or(0, Vec::len)
}

fn has_text(value: &Value, field: &str) -> bool {
    value
        .get(field)
        .and_then(Value::as_str)
        .is_some_and(|s| !s.trim().is_empty())
}

fn has_value(value: &Value, field: &str) -> bool {
    match value.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

/// Completeness of gathered facts, 0-100
fn research_quality(facts: &Map<String, Value>) -> u8 {
    let facts = Value::Object(facts.clone());
    let mut score = 0usize;

    // company profile, 30
    if has_text(&facts, "summary") {
        score += 10;
    }
    for field in ["headquarters", "employee_count", "founded", "careers_url"] {
        if has_value(&facts, field) {
            score += 5;
        }
    }

    score += (list_len(&facts, "tech_stack") * 4).min(20);

    // hiring, 20
    if facts.get("open_roles").and_then(Value::as_u64).unwrap_or(0) > 0 {
        score += 10;
    }
    if list_len(&facts, "hiring_departments") > 0 {
        score += 5;
    }
    if list_len(&facts, "hiring_locations") > 0 {
        score += 5;
    }

    score += (list_len(&facts, "recent_news") * 3).min(15);
    score += (list_len(&facts, "hooks") * 3).min(15);

    score.min(100) as u8
}

/// Weighted heuristic over research quality and lead attributes
#[derive(Debug, Clone, Default)]
pub struct HeuristicScorer;

impl HeuristicScorer {
    fn seniority_bonus(title: &str) -> u8 {
        let title = title.to_lowercase();
        let words: Vec<&str> = title
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let has_word = |w: &str| words.contains(&w);

        if ["ceo", "cto", "cfo", "coo", "cmo", "cro", "president", "founder", "owner"]
            .iter()
            .any(|w| has_word(w))
            || title.contains("co-founder")
            || title.starts_with("chief")
        {
            20
        } else if has_word("vp") || title.contains("vice president") || has_word("director") || has_word("head") {
            15
        } else if has_word("manager") || has_word("lead") {
            10
        } else {
            0
        }
    }

    fn corporate_email(lead: &Value) -> bool {
        lead.get("email")
            .and_then(Value::as_str)
            .and_then(|email| email.rsplit_once('@'))
            .map(|(_, domain)| domain.trim().to_lowercase())
            .is_some_and(|domain| !domain.is_empty() && !PERSONAL_DOMAINS.contains(&domain.as_str()))
    }

    fn real_news(source: &Value) -> bool {
        source
            .get("recent_news")
            .and_then(Value::as_array)
            .is_some_and(|news| {
                news.iter().any(|item| match item {
                    Value::String(s) => !s.trim().is_empty(),
                    Value::Object(_) => has_text(item, "title"),
                    _ => false,
                })
            })
    }
}

#[async_trait]
impl Scorer for HeuristicScorer {
    async fn score(&self, lead: &Value, research: Option<&Value>) -> Result<LeadScore, AgentError> {
        // Signals come from research when present, from the lead otherwise
        let source = research.unwrap_or(lead);
        let mut breakdown = BTreeMap::new();

        let quality = research
            .and_then(|r| r.get("quality_score"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        breakdown.insert("research".to_string(), (quality.clamp(0.0, 100.0) * 0.4).round() as u8);

        let title = lead.get("title").and_then(Value::as_str).unwrap_or_default();
        breakdown.insert("seniority".to_string(), Self::seniority_bonus(title));
        breakdown.insert(
            "corporate_email".to_string(),
            if Self::corporate_email(lead) { 10 } else { 0 },
        );
        let hooks = match list_len(source, "hooks") {
            0 => 0,
            1 => 5,
            _ => 10,
        };
        breakdown.insert("hooks".to_string(), hooks);
        breakdown.insert(
            "tech_stack".to_string(),
            if list_len(source, "tech_stack") > 0 { 5 } else { 0 },
        );
        breakdown.insert(
            "hiring".to_string(),
            if list_len(source, "hiring_departments") > 0 { 5 } else { 0 },
        );
        breakdown.insert("news".to_string(), if Self::real_news(source) { 5 } else { 0 });
        let linkedin = has_text(lead, "linkedin_url") || has_text(source, "linkedin_url");
        breakdown.insert("linkedin".to_string(), if linkedin { 5 } else { 0 });

        let total: u32 = breakdown.values().map(|v| u32::from(*v)).sum();
        Ok(LeadScore {
            score: total.min(100) as u8,
            breakdown,
        })
    }
}

/// Two fixed templates, personalised from research
#[derive(Debug, Clone, Default)]
pub struct TemplateCopywriter;

#[async_trait]
impl Copywriter for TemplateCopywriter {
    async fn generate(&self, lead: &Value, research: Option<&Value>) -> Result<Vec<EmailVariant>, AgentError> {
        Ok(template_variants(lead, research))
    }
}

/// The two template variants, opening with the first hook, then the first
/// tech stack entry, then a generic growth line
pub fn template_variants(lead: &Value, research: Option<&Value>) -> Vec<EmailVariant> {
    let source = research.unwrap_or(lead);
    let text = |field: &str, default: &str| {
        lead.get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(default)
            .to_string()
    };
    let first_name = text("first_name", "there");
    let company = text("company", "your company");
    let title = text("title", "leader");

    let first = |field: &str| {
        source
            .get(field)
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let opener = first("hooks")
        .or_else(|| first("tech_stack").map(|tech| format!("I noticed {company} is using {tech}")))
        .unwrap_or_else(|| format!("I've been following {company}'s growth"));

    vec![
        EmailVariant {
            variant: "A".to_string(),
            subject: format!("Quick question about {company}"),
            body: format!(
                "Hi {first_name},\n\n{opener} and thought I'd reach out.\n\n\
                 I work with companies like {company} to help them scale their operations more \
                 efficiently. Given your role as {title}, I thought you might find our approach \
                 interesting.\n\nWould you be open to a quick 15-minute chat to see if there's a fit?\n\n\
                 Best regards"
            ),
        },
        EmailVariant {
            variant: "B".to_string(),
            subject: format!("Helping {company} scale faster"),
            body: format!(
                "Hi {first_name},\n\n{opener} - exciting times!\n\n\
                 I help teams at companies like {company} navigate growth challenges and have a few \
                 ideas that might be valuable for you.\n\nDo you have 15 minutes this week for a brief call?\n\n\
                 Cheers"
            ),
        },
    ]
}

/// Sends the next day at 10:00 UTC
#[derive(Debug, Clone, Default)]
pub struct NextMorningTiming;

#[async_trait]
impl TimingPredictor for NextMorningTiming {
    async fn predict(&self, _lead: &Value) -> Result<DateTime<Utc>, AgentError> {
        next_morning(Utc::now()).ok_or_else(|| AgentError::fatal("send time out of range"))
    }
}

/// 10:00 UTC on the day after `after`
pub fn next_morning(after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let day = after.date_naive().checked_add_days(Days::new(1))?;
    let ten = NaiveTime::from_hms_opt(10, 0, 0)?;
    Some(day.and_time(ten).and_utc())
}
