use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::warn;

use ds_core::{Result, Source};
use ds_llm::ChatMessage;

use crate::executor::CardCtx;
use crate::handlers::{
    non_empty_object, non_empty_str, obj, outputs_by_type, save_report, CardHandler,
    HandlerRegistry,
};

pub fn register(registry: &mut HandlerRegistry) {
    registry.register(Source::Linkedin, "profile", Arc::new(Profile));
    registry.register(Source::Linkedin, "skills", Arc::new(Skills));
    registry.register(Source::Linkedin, "career", Arc::new(Career));
    registry.register(Source::Linkedin, "role_model", Arc::new(RoleModel));
    registry.register(Source::Linkedin, "money", Arc::new(Money));
    registry.register(Source::Linkedin, "roast", Arc::new(Roast));
    registry.register(Source::Linkedin, "summary", Arc::new(Summary));
    registry.register(Source::Linkedin, "full_report", Arc::new(FullReport));
    registry.register(
        Source::Linkedin,
        "resource.linkedin.enrich",
        Arc::new(Enrich),
    );
}

async fn raw_report(ctx: &CardCtx) -> Result<Value> {
    ctx.require_artifact("resource.linkedin.raw_profile").await
}

async fn enrich_bundle(ctx: &CardCtx) -> Result<Value> {
    Ok(ctx
        .artifact("resource.linkedin.enrich")
        .await?
        .unwrap_or(Value::Null))
}

fn profile_data(report: &Value) -> Map<String, Value> {
    obj(&report["profile_data"])
}

fn person_name(profile: &Map<String, Value>, raw_profile: &Value) -> String {
    profile
        .get("name")
        .and_then(|v| non_empty_str(v))
        .or_else(|| non_empty_str(&raw_profile["fullName"]))
        .unwrap_or("Unknown")
        .to_string()
}

// ---------------------------------------------------------------------------
// resource.linkedin.enrich
// ---------------------------------------------------------------------------

/// Fused enrichment bundle over the raw scrape: skills, career guidance,
/// role model, money analysis, and the about/tags summary in one
/// strict-JSON call.
struct Enrich;

#[async_trait]
impl CardHandler for Enrich {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let report = raw_report(ctx).await?;
        ctx.progress("analyzing", "Generating enrichment bundle...", None);

        let mut prompt_input = profile_data(&report);
        prompt_input.remove("raw_profile");

        let system = "You are a career analyst. Given a LinkedIn profile as JSON, return \
            ONLY valid JSON with keys:\n\
            skills: {industry_knowledge, tools_technologies, interpersonal_skills, language} \
            (each a list of short strings);\n\
            career: {future_development_potential, development_advice: {past_evaluation, future_advice}};\n\
            role_model: {name, reason};\n\
            money: {salary_estimate, rationale};\n\
            summary: {about, personal_tags};\n\
            work_experience_summary; education_summary.";

        match ctx
            .llm_json(
                "linkedin_enrich",
                vec![
                    ChatMessage::system(system),
                    ChatMessage::user(Value::Object(prompt_input).to_string()),
                ],
            )
            .await
        {
            Ok(bundle) => Ok(bundle),
            Err(err) => {
                warn!(job_id = %ctx.job.id, error = %err, "enrich bundle failed, using empty bundle");
                Ok(json!({}))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// profile
// ---------------------------------------------------------------------------

/// Business-card payload: scraped profile merged with every enrichment the
/// bundle produced. The raw scrape blob stays out of the card contract.
struct Profile;

#[async_trait]
impl CardHandler for Profile {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let report = raw_report(ctx).await?;
        let enrich = enrich_bundle(ctx).await?;
        let mut merged = profile_data(&report);
        merged.remove("raw_profile");

        for key in ["skills", "career", "role_model", "colleagues_view", "life_well_being"] {
            if let Some(value) = non_empty_object(&enrich[key]) {
                merged.insert(key.to_string(), Value::Object(value.clone()));
            }
        }
        if let Some(money) = non_empty_object(&enrich["money"]) {
            merged.insert("money_analysis".to_string(), Value::Object(money.clone()));
        }
        for key in ["work_experience_summary", "education_summary"] {
            if let Some(text) = non_empty_str(&enrich[key]) {
                merged.insert(key.to_string(), Value::String(text.to_string()));
            }
        }
        let summary = &enrich["summary"];
        if !summary["about"].is_null() {
            merged.insert("about".to_string(), summary["about"].clone());
        }
        if !summary["personal_tags"].is_null() {
            merged.insert("personal_tags".to_string(), summary["personal_tags"].clone());
        }

        Ok(Value::Object(merged))
    }
}

// ---------------------------------------------------------------------------
// skills
// ---------------------------------------------------------------------------

struct Skills;

const SKILL_KEYS: [&str; 4] = [
    "industry_knowledge",
    "tools_technologies",
    "interpersonal_skills",
    "language",
];

#[async_trait]
impl CardHandler for Skills {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let enrich = enrich_bundle(ctx).await?;
        let skills = &enrich["skills"];
        let mut out = Map::new();
        for key in SKILL_KEYS {
            let list = skills[key].as_array().cloned().unwrap_or_default();
            out.insert(key.to_string(), Value::Array(list));
        }
        Ok(Value::Object(out))
    }
}

// ---------------------------------------------------------------------------
// career
// ---------------------------------------------------------------------------

struct Career;

#[async_trait]
impl CardHandler for Career {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let report = raw_report(ctx).await?;
        let enrich = enrich_bundle(ctx).await?;
        let profile = profile_data(&report);
        let raw_profile = &report["profile_data"]["raw_profile"];

        let experiences = profile
            .get("work_experience")
            .filter(|v| v.is_array())
            .cloned()
            .unwrap_or_else(|| raw_profile["experiences"].clone());
        let educations = profile
            .get("education")
            .filter(|v| v.is_array())
            .cloned()
            .unwrap_or_else(|| raw_profile["educations"].clone());

        let career = match non_empty_object(&enrich["career"]) {
            Some(career) => Value::Object(career.clone()),
            None => {
                let name = person_name(&profile, raw_profile);
                let headline = non_empty_str(&raw_profile["headline"])
                    .or_else(|| non_empty_str(&raw_profile["occupation"]));
                let potential = match headline {
                    Some(headline) => format!(
                        "{name} shows strong growth potential as a {headline}. Focus on \
                         deepening domain expertise and expanding leadership impact."
                    ),
                    None => format!(
                        "{name} shows strong growth potential. Focus on deepening domain \
                         expertise and expanding leadership impact."
                    ),
                };
                json!({
                    "future_development_potential": potential,
                    "development_advice": {
                        "past_evaluation": "Track record indicates consistent delivery; continue to strengthen strategic ownership and cross-functional influence.",
                        "future_advice": "Prioritize high-leverage projects, build a clear specialization narrative, and invest in communication and mentoring to unlock the next level.",
                    },
                })
            }
        };

        Ok(json!({
            "career": career,
            "work_experience": if experiences.is_null() { json!([]) } else { experiences },
            "education": if educations.is_null() { json!([]) } else { educations },
            "work_experience_summary": enrich["work_experience_summary"].as_str().unwrap_or("").trim(),
            "education_summary": enrich["education_summary"].as_str().unwrap_or("").trim(),
        }))
    }
}

// ---------------------------------------------------------------------------
// role_model / money
// ---------------------------------------------------------------------------

struct RoleModel;

#[async_trait]
impl CardHandler for RoleModel {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let enrich = enrich_bundle(ctx).await?;
        Ok(non_empty_object(&enrich["role_model"])
            .map(|m| Value::Object(m.clone()))
            .unwrap_or(json!({})))
    }
}

struct Money;

#[async_trait]
impl CardHandler for Money {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let enrich = enrich_bundle(ctx).await?;
        let money = non_empty_object(&enrich["money"])
            .or_else(|| non_empty_object(&enrich["money_analysis"]));
        Ok(money.map(|m| Value::Object(m.clone())).unwrap_or(json!({})))
    }
}

// ---------------------------------------------------------------------------
// roast
// ---------------------------------------------------------------------------

/// The roast model call is strict-JSON internally; streaming raw JSON is
/// poor UX, so the finalized text is chunked through the delta router
/// instead.
struct Roast;

#[async_trait]
impl CardHandler for Roast {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let report = raw_report(ctx).await?;
        let profile = profile_data(&report);
        let raw_profile = &report["profile_data"]["raw_profile"];
        let name = person_name(&profile, raw_profile);

        ctx.progress("ai_roast", "Generating roast...", None);
        let system = "Write a short, witty, good-natured roast of this professional based \
            on their LinkedIn profile. Return ONLY valid JSON: {roast} with 3-5 Markdown \
            sentences, no headings.";
        let mut prompt_input = profile.clone();
        prompt_input.remove("raw_profile");
        prompt_input.insert("name".to_string(), json!(name));

        let text = match ctx
            .llm_json(
                "linkedin_roast",
                vec![
                    ChatMessage::system(system),
                    ChatMessage::user(Value::Object(prompt_input).to_string()),
                ],
            )
            .await
        {
            Ok(out) => out["roast"]
                .as_str()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "No roast available".to_string()),
            Err(err) => {
                warn!(job_id = %ctx.job.id, error = %err, "roast failed, using fallback");
                "No roast available".to_string()
            }
        };

        ctx.stream_text(&text);
        Ok(Value::String(text))
    }
}

// ---------------------------------------------------------------------------
// summary
// ---------------------------------------------------------------------------

/// About/tags summary with deterministic fallbacks: the scraped about text
/// when the bundle has none, and tags pooled from the skills lists.
struct Summary;

#[async_trait]
impl CardHandler for Summary {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let report = raw_report(ctx).await?;
        let enrich = enrich_bundle(ctx).await?;
        let profile = profile_data(&report);
        let raw_profile = &report["profile_data"]["raw_profile"];

        let summary = &enrich["summary"];
        let mut about = summary["about"]
            .as_str()
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if about.is_empty() {
            about = profile
                .get("about")
                .and_then(|v| non_empty_str(v))
                .or_else(|| non_empty_str(&raw_profile["about"]))
                .unwrap_or("")
                .to_string();
        }

        let mut tags: Vec<String> = summary["personal_tags"]
            .as_array()
            .map(|xs| {
                xs.iter()
                    .filter_map(|v| non_empty_str(v))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if tags.is_empty() {
            tags = tags_from_skills(&enrich["skills"]);
        }

        if !about.is_empty() {
            ctx.stream_text(&about);
        }
        Ok(json!({ "about": about, "personal_tags": tags }))
    }
}

/// Pool the skills lists into up to six deduplicated, title-cased tags.
fn tags_from_skills(skills: &Value) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out: Vec<String> = Vec::new();
    for key in SKILL_KEYS {
        let Some(values) = skills[key].as_array() else {
            continue;
        };
        for value in values {
            let Some(text) = non_empty_str(value) else {
                continue;
            };
            if !seen.insert(text.to_lowercase()) {
                continue;
            }
            let title_cased = text
                .split_whitespace()
                .map(|word| {
                    let mut chars = word.chars();
                    match chars.next() {
                        Some(first) => {
                            first.to_uppercase().collect::<String>() + chars.as_str()
                        }
                        None => String::new(),
                    }
                })
                .collect::<Vec<_>>()
                .join(" ");
            out.push(title_cased);
            if out.len() == 6 {
                return out;
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// full_report
// ---------------------------------------------------------------------------

struct FullReport;

#[async_trait]
impl CardHandler for FullReport {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let report = raw_report(ctx).await?;
        let mut full = obj(&report);
        let mut merged = profile_data(&report);

        let outputs = outputs_by_type(ctx).await?;

        if let Some(skills) = outputs.get("skills").and_then(Value::as_object) {
            merged.insert("skills".to_string(), Value::Object(skills.clone()));
        }
        if let Some(career) = outputs.get("career").and_then(Value::as_object) {
            for key in [
                "career",
                "work_experience",
                "education",
                "work_experience_summary",
                "education_summary",
            ] {
                if let Some(value) = career.get(key).filter(|v| !v.is_null()) {
                    merged.insert(key.to_string(), value.clone());
                }
            }
        }
        if let Some(role_model) = outputs.get("role_model").and_then(Value::as_object) {
            merged.insert("role_model".to_string(), Value::Object(role_model.clone()));
        }
        if let Some(money) = outputs.get("money").and_then(Value::as_object) {
            merged.insert("money_analysis".to_string(), Value::Object(money.clone()));
        }
        if let Some(roast) = outputs.get("roast") {
            merged.insert("roast".to_string(), roast.clone());
        }
        if let Some(summary) = outputs.get("summary").and_then(Value::as_object) {
            for key in ["about", "personal_tags"] {
                if let Some(value) = summary.get(key).filter(|v| !v.is_null()) {
                    merged.insert(key.to_string(), value.clone());
                }
            }
        }

        full.insert("profile_data".to_string(), Value::Object(merged));
        let report = Value::Object(full);
        save_report(ctx, &report).await?;
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_pool_dedups_and_title_cases() {
        let skills = json!({
            "industry_knowledge": ["machine learning", "Machine Learning", "fintech"],
            "tools_technologies": ["rust", "  "],
            "interpersonal_skills": ["mentoring"],
            "language": ["english", "german", "french", "spanish"],
        });
        let tags = tags_from_skills(&skills);
        assert_eq!(
            tags,
            vec![
                "Machine Learning",
                "Fintech",
                "Rust",
                "Mentoring",
                "English",
                "German"
            ]
        );
    }

    #[test]
    fn person_name_falls_back_to_raw_profile() {
        let profile = Map::new();
        let raw = json!({"fullName": "Ada Lovelace"});
        assert_eq!(person_name(&profile, &raw), "Ada Lovelace");
        assert_eq!(person_name(&profile, &json!({})), "Unknown");
    }
}
