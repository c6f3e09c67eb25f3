use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use ds_core::{Result, Source};

use crate::executor::{storage_err, CardCtx};

pub mod github;
pub mod linkedin;
pub mod scholar;

// ---------------------------------------------------------------------------
// CardHandler
// ---------------------------------------------------------------------------

/// One card type's execution strategy.
///
/// Handlers either derive their payload from upstream artifacts (pure
/// shaping) or call the chat provider, streaming through the card's delta
/// router. Artifact-first is the house rule: when a fused enrich artifact
/// already carries the answer, the dedicated model call is skipped.
#[async_trait]
pub trait CardHandler: Send + Sync {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Card handlers keyed by `(source, card_type)`, populated at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    map: HashMap<(Source, String), Arc<dyn CardHandler>>,
}

impl HandlerRegistry {
    pub fn register(
        &mut self,
        source: Source,
        card_type: &str,
        handler: Arc<dyn CardHandler>,
    ) -> &mut Self {
        self.map.insert((source, card_type.to_string()), handler);
        self
    }

    pub fn get(&self, source: Source, card_type: &str) -> Option<Arc<dyn CardHandler>> {
        self.map.get(&(source, card_type.to_string())).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Registry of the built-in handlers for every planned card type.
pub fn builtin_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::default();
    github::register(&mut registry);
    scholar::register(&mut registry);
    linkedin::register(&mut registry);
    registry
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Completed card outputs of this job, keyed by card type.
pub(crate) async fn outputs_by_type(ctx: &CardCtx) -> Result<HashMap<String, Value>> {
    let cards = ctx
        .engine
        .jobs
        .list_cards_for_job(ctx.job.id)
        .await
        .map_err(storage_err)?;
    let mut out = HashMap::new();
    for card in cards {
        if let Some(output) = card.output {
            if !output.data.is_null() {
                out.insert(card.card_type, output.data);
            }
        }
    }
    Ok(out)
}

/// Persist the aggregated report artifact for this job.
pub(crate) async fn save_report(ctx: &CardCtx, report: &Value) -> Result<()> {
    ctx.engine
        .artifacts
        .save_artifact(ctx.job.id, ds_rules::plan::FULL_REPORT, report)
        .await
        .map_err(storage_err)
}

pub(crate) fn obj(value: &Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub(crate) fn non_empty_object(value: &Value) -> Option<&Map<String, Value>> {
    value.as_object().filter(|m| !m.is_empty())
}

pub(crate) fn non_empty_str(value: &Value) -> Option<&str> {
    value.as_str().map(str::trim).filter(|s| !s.is_empty())
}

/// Shape a full report into one card's payload. Used when a card is served
/// from the aggregated `full_report` artifact instead of its own pipeline.
pub fn extract_card_payload(source: Source, report: &Value, card_type: &str) -> Value {
    match source {
        Source::Github => match card_type {
            "profile" => report["user"].clone(),
            "activity" | "stats" => serde_json::json!({
                "overview": report["overview"],
                "activity": report["activity"],
                "code_contribution": report["code_contribution"],
            }),
            "repos" => serde_json::json!({
                "feature_project": report["feature_project"],
                "top_projects": report["top_projects"],
                "most_valuable_pull_request": report["most_valuable_pull_request"],
            }),
            "role_model" => report["role_model"].clone(),
            "roast" => report["roast"].clone(),
            "summary" => report["valuation_and_level"].clone(),
            _ => report.clone(),
        },
        Source::Scholar => {
            let profile = &report["researcherProfile"];
            if !profile.is_null() {
                return match card_type {
                    "researcherInfo" => profile["researcherInfo"].clone(),
                    other => profile["dataBlocks"][other].clone(),
                };
            }
            report.clone()
        }
        Source::Linkedin => {
            let profile = &report["profile_data"];
            match card_type {
                "profile" => {
                    // raw_profile is a large scrape blob; the card contract
                    // does not include it.
                    let mut out = obj(profile);
                    out.remove("raw_profile");
                    Value::Object(out)
                }
                "skills" => profile["skills"].clone(),
                "career" => serde_json::json!({
                    "career": profile["career"],
                    "work_experience": profile["work_experience"],
                    "education": profile["education"],
                    "work_experience_summary": profile["work_experience_summary"],
                    "education_summary": profile["education_summary"],
                }),
                "role_model" => profile["role_model"].clone(),
                "money" => profile["money_analysis"].clone(),
                "roast" => profile["roast"].clone(),
                "summary" => serde_json::json!({
                    "about": profile["about"],
                    "personal_tags": profile["personal_tags"],
                }),
                _ => report.clone(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
