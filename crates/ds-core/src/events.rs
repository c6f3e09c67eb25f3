use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::types::{CardOutput, Source};

// ---------------------------------------------------------------------------
// EventType
// ---------------------------------------------------------------------------

/// Enumerated event types appended to the per-job log.
///
/// Wire names are dotted and stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "job.started")]
    JobStarted,
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "job.failed")]
    JobFailed,
    #[serde(rename = "job.cancelled")]
    JobCancelled,
    #[serde(rename = "card.started")]
    CardStarted,
    #[serde(rename = "card.progress")]
    CardProgress,
    #[serde(rename = "card.delta")]
    CardDelta,
    #[serde(rename = "card.append")]
    CardAppend,
    #[serde(rename = "card.prefill")]
    CardPrefill,
    #[serde(rename = "card.completed")]
    CardCompleted,
    #[serde(rename = "card.failed")]
    CardFailed,
    #[serde(rename = "card.cancelled")]
    CardCancelled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::JobStarted => "job.started",
            EventType::JobCompleted => "job.completed",
            EventType::JobFailed => "job.failed",
            EventType::JobCancelled => "job.cancelled",
            EventType::CardStarted => "card.started",
            EventType::CardProgress => "card.progress",
            EventType::CardDelta => "card.delta",
            EventType::CardAppend => "card.append",
            EventType::CardPrefill => "card.prefill",
            EventType::CardCompleted => "card.completed",
            EventType::CardFailed => "card.failed",
            EventType::CardCancelled => "card.cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<EventType> {
        match raw {
            "job.started" => Some(EventType::JobStarted),
            "job.completed" => Some(EventType::JobCompleted),
            "job.failed" => Some(EventType::JobFailed),
            "job.cancelled" => Some(EventType::JobCancelled),
            "card.started" => Some(EventType::CardStarted),
            "card.progress" => Some(EventType::CardProgress),
            "card.delta" => Some(EventType::CardDelta),
            "card.append" => Some(EventType::CardAppend),
            "card.prefill" => Some(EventType::CardPrefill),
            "card.completed" => Some(EventType::CardCompleted),
            "card.failed" => Some(EventType::CardFailed),
            "card.cancelled" => Some(EventType::CardCancelled),
            _ => None,
        }
    }

    /// Terminal `job.*` events close the stream; exactly one per job.
    pub fn is_job_terminal(&self) -> bool {
        matches!(
            self,
            EventType::JobCompleted | EventType::JobFailed | EventType::JobCancelled
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// One append-only record of job progress. `seq` is strictly increasing and
/// contiguous per job, starting at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub seq: u64,
    pub card_id: Option<i64>,
    pub event_type: EventType,
    pub payload: Value,
    pub emitted_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Payload constructors
// ---------------------------------------------------------------------------

/// Stable payload shapes for the event log (§ event payload contract).
pub mod payloads {
    use super::*;

    pub fn job_started(source: Source) -> Value {
        json!({ "source": source.as_str() })
    }

    pub fn job_failed(kind: ErrorKind, message: &str) -> Value {
        json!({ "error_kind": kind.as_str(), "message": message })
    }

    pub fn job_cancelled(reason: &str) -> Value {
        json!({ "reason": reason })
    }

    pub fn card_started(card_type: &str) -> Value {
        json!({ "card": card_type, "card_type": card_type })
    }

    pub fn card_progress(card_type: &str, step: &str, message: &str, data: Option<Value>) -> Value {
        let mut payload = json!({ "card": card_type, "step": step, "message": message });
        if let Some(data) = data {
            payload["data"] = data;
        }
        payload
    }

    pub fn card_completed(
        card_type: &str,
        output: &CardOutput,
        internal: bool,
        duration_ms: u64,
        meta: Option<Value>,
    ) -> Value {
        let mut payload = json!({
            "card": card_type,
            "payload": { "data": output.data, "stream": output.stream },
            "internal": internal,
            "timing": { "duration_ms": duration_ms },
        });
        if let Some(meta) = meta {
            payload["meta"] = meta;
        }
        payload
    }

    pub fn card_prefill(card_type: &str, data: &Value) -> Value {
        json!({
            "card": card_type,
            "payload": { "data": data, "stream": {} },
            "internal": false,
            "timing": { "duration_ms": 0 },
        })
    }

    pub fn card_failed(card_type: &str, kind: ErrorKind, message: &str, retryable: bool) -> Value {
        json!({
            "card": card_type,
            "error_kind": kind.as_str(),
            "message": message,
            "retryable": retryable,
        })
    }

    pub fn card_cancelled(card_type: &str) -> Value {
        json!({ "card": card_type })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
