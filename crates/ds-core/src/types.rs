use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ErrorKind;

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Which public identity a job analyzes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Github,
    Scholar,
    Linkedin,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Github => "github",
            Source::Scholar => "scholar",
            Source::Linkedin => "linkedin",
        }
    }

    /// Parse a source tag. Unknown tags are an input error, not a panic.
    pub fn parse(raw: &str) -> Option<Source> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "github" => Some(Source::Github),
            "scholar" => Some(Source::Scholar),
            "linkedin" => Some(Source::Linkedin),
            _ => None,
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// CardStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl CardStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// Terminal states are sticky, with one exception: a completed card may
    /// be re-completed by a background refinement (same row, updated output).
    pub fn can_transition_to(&self, target: &CardStatus) -> bool {
        matches!(
            (self, target),
            (CardStatus::Pending, CardStatus::Ready)
                | (CardStatus::Pending, CardStatus::Cancelled)
                | (CardStatus::Pending, CardStatus::Skipped)
                | (CardStatus::Ready, CardStatus::Running)
                | (CardStatus::Ready, CardStatus::Cancelled)
                | (CardStatus::Running, CardStatus::Completed)
                | (CardStatus::Running, CardStatus::Failed)
                | (CardStatus::Running, CardStatus::Cancelled)
                | (CardStatus::Running, CardStatus::Ready)
                | (CardStatus::Completed, CardStatus::Completed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CardStatus::Completed
                | CardStatus::Failed
                | CardStatus::Cancelled
                | CardStatus::Skipped
        )
    }
}

// ---------------------------------------------------------------------------
// JobOptions
// ---------------------------------------------------------------------------

/// Caller-supplied knobs for a single job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    /// Restrict the plan to these user-facing card types (resource
    /// dependencies are always included).
    #[serde(default)]
    pub requested_cards: Option<Vec<String>>,
    /// Skip the cross-job resource cache even when fresh entries exist.
    #[serde(default)]
    pub bypass_cache: bool,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub source: Source,
    pub status: JobStatus,
    pub input: Map<String, Value>,
    pub options: JobOptions,
    pub user_id: Option<String>,
    pub subject_key: String,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        source: Source,
        input: Map<String, Value>,
        subject_key: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            status: JobStatus::Pending,
            input,
            options: JobOptions::default(),
            user_id: None,
            subject_key: subject_key.into(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// CardOutput
// ---------------------------------------------------------------------------

/// Structured card output envelope: `data` holds the card payload,
/// `stream` holds section texts accumulated from deltas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CardOutput {
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub stream: Value,
}

impl CardOutput {
    pub fn from_data(data: Value) -> Self {
        Self {
            data,
            stream: Value::Null,
        }
    }

    /// Merge `own` over `prefill`: keys present in `own` win, prefilled keys
    /// survive where `own` is silent. Non-object payloads replace wholesale.
    pub fn merge_data(prefill: &Value, own: &Value) -> Value {
        match (prefill, own) {
            (Value::Object(base), Value::Object(over)) => {
                let mut out = base.clone();
                for (k, v) in over {
                    out.insert(k.clone(), v.clone());
                }
                Value::Object(out)
            }
            (_, Value::Null) => prefill.clone(),
            _ => own.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Card
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: i64,
    pub job_id: Uuid,
    pub card_type: String,
    pub status: CardStatus,
    pub depends_on: Vec<String>,
    pub priority: i32,
    pub concurrency_group: String,
    pub input: Map<String, Value>,
    pub output: Option<CardOutput>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Card {
    /// Internal resource-DAG node (not part of the user-facing report).
    pub fn is_resource(&self) -> bool {
        self.card_type.starts_with("resource.")
    }

    /// Background cards do not gate job completion.
    pub fn is_background(&self) -> bool {
        self.priority > 0
    }
}

// ---------------------------------------------------------------------------
// CardDescriptor
// ---------------------------------------------------------------------------

/// Planner output: one card to create within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardDescriptor {
    pub card_type: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub concurrency_group: String,
    #[serde(default)]
    pub input: Map<String, Value>,
}

impl CardDescriptor {
    pub fn new(card_type: impl Into<String>) -> Self {
        Self {
            card_type: card_type.into(),
            depends_on: Vec::new(),
            priority: 0,
            concurrency_group: String::new(),
            input: Map::new(),
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.concurrency_group = group.into();
        self
    }

    pub fn input(mut self, input: Map<String, Value>) -> Self {
        self.input = input;
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn source_roundtrip() {
        assert_eq!(Source::parse("GitHub"), Some(Source::Github));
        assert_eq!(Source::parse(" scholar "), Some(Source::Scholar));
        assert_eq!(Source::parse("twitter"), None);
        assert_eq!(Source::Linkedin.as_str(), "linkedin");
    }

    #[test]
    fn card_status_transitions() {
        assert!(CardStatus::Pending.can_transition_to(&CardStatus::Ready));
        assert!(CardStatus::Ready.can_transition_to(&CardStatus::Running));
        assert!(CardStatus::Running.can_transition_to(&CardStatus::Completed));
        assert!(CardStatus::Running.can_transition_to(&CardStatus::Ready));
        assert!(!CardStatus::Completed.can_transition_to(&CardStatus::Running));
        assert!(!CardStatus::Failed.can_transition_to(&CardStatus::Ready));
        // Background refinement may re-complete a completed card.
        assert!(CardStatus::Completed.can_transition_to(&CardStatus::Completed));
    }

    #[test]
    fn merge_data_own_wins() {
        let prefill = json!({"name": "Ada", "avatar": "", "about": "early"});
        let own = json!({"about": "final", "skills": ["math"]});
        let merged = CardOutput::merge_data(&prefill, &own);
        assert_eq!(merged["name"], "Ada");
        assert_eq!(merged["about"], "final");
        assert_eq!(merged["skills"], json!(["math"]));
    }

    #[test]
    fn merge_data_null_own_keeps_prefill() {
        let prefill = json!({"name": "Ada"});
        let merged = CardOutput::merge_data(&prefill, &Value::Null);
        assert_eq!(merged, prefill);
    }

    #[test]
    fn resource_and_background_flags() {
        let mut card = Card {
            id: 1,
            job_id: Uuid::new_v4(),
            card_type: "resource.github.data".into(),
            status: CardStatus::Pending,
            depends_on: vec![],
            priority: 0,
            concurrency_group: "scrape:github".into(),
            input: Map::new(),
            output: None,
            error_kind: None,
            error_message: None,
            attempt_count: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        assert!(card.is_resource());
        assert!(!card.is_background());
        card.card_type = "repos".into();
        card.priority = 1;
        assert!(!card.is_resource());
        assert!(card.is_background());
    }
}
