use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::warn;

use ds_core::{Result, Source};
use ds_llm::ChatMessage;

use crate::executor::CardCtx;
use crate::handlers::{
    non_empty_object, obj, outputs_by_type, save_report, CardHandler, HandlerRegistry,
};

pub fn register(registry: &mut HandlerRegistry) {
    registry.register(Source::Scholar, "researcherInfo", Arc::new(ResearcherInfo));
    registry.register(Source::Scholar, "publicationStats", Arc::new(PublicationStats));
    registry.register(Source::Scholar, "roleModel", Arc::new(RoleModel));
    registry.register(Source::Scholar, "estimatedSalary", Arc::new(EstimatedSalary));
    registry.register(Source::Scholar, "criticalReview", Arc::new(CriticalReview));
    registry.register(Source::Scholar, "summary", Arc::new(Summary));
    registry.register(Source::Scholar, "full_report", Arc::new(FullReport));
    registry.register(Source::Scholar, "resource.scholar.level", Arc::new(Level));
}

/// Freshest scholar report available: the background full fetch when it has
/// landed, otherwise the first page.
async fn base_report(ctx: &CardCtx) -> Result<Value> {
    if let Some(full) = ctx.artifact("resource.scholar.full").await? {
        if full.is_object() {
            return Ok(full);
        }
    }
    ctx.require_artifact("resource.scholar.page0").await
}

/// Compact scholar context for model prompts. The raw report can be very
/// large (papers list); keep only key signals.
fn summary_input(report: &Value) -> Value {
    let researcher = &report["researcher"];
    let pub_stats = &report["publication_stats"];
    let coauthors = &report["coauthor_stats"];

    let pick_paper = |paper: &Value| -> Value {
        let mut out = Map::new();
        for key in ["title", "year", "venue", "citations", "url"] {
            if !paper[key].is_null() {
                out.insert(key.to_string(), paper[key].clone());
            }
        }
        Value::Object(out)
    };

    let year_dist = obj(&pub_stats["year_distribution"]);
    let mut recent_years: Vec<String> = year_dist.keys().cloned().collect();
    recent_years.sort_by(|a, b| b.cmp(a));
    recent_years.truncate(6);
    let recent_dist: Map<String, Value> = recent_years
        .into_iter()
        .filter_map(|y| year_dist.get(&y).map(|v| (y, v.clone())))
        .collect();

    let fields: Vec<Value> = report["researcher"]["research_fields"]
        .as_array()
        .map(|xs| xs.iter().take(8).cloned().collect())
        .unwrap_or_default();

    let top_coauthors: Vec<Value> = coauthors["top_coauthors"]
        .as_array()
        .map(|xs| xs.iter().take(5).cloned().collect())
        .unwrap_or_default();

    json!({
        "name": researcher["name"],
        "affiliation": researcher["affiliation"],
        "research_fields": fields,
        "metrics": {
            "total_citations": researcher["total_citations"],
            "citations_5y": researcher["citations_5y"],
            "h_index": researcher["h_index"],
            "h_index_5y": researcher["h_index_5y"],
            "total_papers": pub_stats["total_papers"],
            "top_tier_papers": pub_stats["top_tier_papers"],
        },
        "highlights": {
            "most_cited_paper": pick_paper(&pub_stats["most_cited_paper"]),
            "paper_of_year": pick_paper(&pub_stats["paper_of_year"]),
            "recent_year_distribution": recent_dist,
            "coauthors": {
                "total": coauthors["total_coauthors"],
                "top": top_coauthors,
            },
            "rating": report["rating"],
        },
    })
}

/// Parse a salary-like value ("250k", "$200,000", "200k-300k") into USD.
pub(crate) fn parse_usd(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    if let Some(f) = value.as_f64() {
        return Some(f as i64);
    }
    let raw = value.as_str()?.trim().to_lowercase();
    if raw.is_empty() {
        return None;
    }
    let cleaned: String = raw
        .replace(',', "")
        .replace('$', "")
        .replace("usd", "")
        .replace(['–', '—', '~'], "-")
        .replace(" to ", "-")
        .trim()
        .to_string();

    // Range: "200k-300k" → midpoint.
    if let Some(idx) = cleaned.find('-').filter(|idx| *idx > 0) {
        let a = parse_usd(&Value::String(cleaned[..idx].to_string()));
        let b = parse_usd(&Value::String(cleaned[idx + 1..].to_string()));
        if let (Some(a), Some(b)) = (a, b) {
            return Some((a + b) / 2);
        }
    }

    let (digits, thousands) = match cleaned.strip_suffix('k') {
        Some(rest) => (rest, true),
        None => (cleaned.as_str(), false),
    };
    let number: String = digits
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let parsed = number.parse::<f64>().ok()?;
    Some(if thousands {
        (parsed * 1000.0) as i64
    } else {
        parsed as i64
    })
}

// ---------------------------------------------------------------------------
// researcherInfo / publicationStats: pure artifact shaping
// ---------------------------------------------------------------------------

struct ResearcherInfo;

#[async_trait]
impl CardHandler for ResearcherInfo {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let report = base_report(ctx).await?;
        Ok(report["researcher"].clone())
    }
}

struct PublicationStats;

#[async_trait]
impl CardHandler for PublicationStats {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let report = base_report(ctx).await?;
        Ok(report["publication_stats"].clone())
    }
}

// ---------------------------------------------------------------------------
// resource.scholar.level
// ---------------------------------------------------------------------------

/// Fast career-level estimate consumed by roleModel and estimatedSalary.
struct Level;

#[async_trait]
impl CardHandler for Level {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let report = base_report(ctx).await?;
        ctx.progress("ai_level", "Generating career level (fast)...", None);

        let system = "Estimate this researcher's career level from their metrics.\n\
            Return ONLY valid JSON: {level, levelEquivalency: {us}, earningsPerYearUSD}.";
        match ctx
            .llm_json(
                "scholar_level",
                vec![
                    ChatMessage::system(system),
                    ChatMessage::user(summary_input(&report).to_string()),
                ],
            )
            .await
        {
            Ok(level) => Ok(level),
            Err(err) => {
                warn!(job_id = %ctx.job.id, error = %err, "level estimate failed, using heuristic");
                let h_index = report["researcher"]["h_index"].as_i64().unwrap_or(0);
                let us = match h_index {
                    0..=9 => "L4",
                    10..=24 => "L5",
                    25..=49 => "L6",
                    _ => "L7",
                };
                Ok(json!({
                    "level": us,
                    "levelEquivalency": { "us": us },
                }))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// roleModel / estimatedSalary
// ---------------------------------------------------------------------------

struct RoleModel;

#[async_trait]
impl CardHandler for RoleModel {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let report = base_report(ctx).await?;
        if let Some(existing) = non_empty_object(&report["role_model"]) {
            if !existing["name"].is_null() {
                return Ok(Value::Object(existing.clone()));
            }
        }
        ctx.progress("ai_role_model", "Matching role model...", None);
        let system = "Name one renowned researcher this scholar's trajectory resembles.\n\
            Return ONLY valid JSON: {name, affiliation, reason}.";
        match ctx
            .llm_json(
                "scholar_role_model",
                vec![
                    ChatMessage::system(system),
                    ChatMessage::user(summary_input(&report).to_string()),
                ],
            )
            .await
        {
            Ok(role_model) => Ok(role_model),
            Err(err) => {
                warn!(job_id = %ctx.job.id, error = %err, "role model failed, returning empty");
                Ok(json!({}))
            }
        }
    }
}

/// Salary block with a floor: implausibly low model estimates are replaced
/// by the level-equivalency table.
struct EstimatedSalary;

const SALARY_BY_LEVEL: [(&str, i64); 6] = [
    ("L3", 150_000),
    ("L4", 220_000),
    ("L5", 310_000),
    ("L6", 440_000),
    ("L7", 640_000),
    ("L8", 905_000),
];

#[async_trait]
impl CardHandler for EstimatedSalary {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let level_info = ctx.require_artifact("resource.scholar.level").await?;
        let mut out = obj(&level_info);

        let earnings = parse_usd(&level_info["earningsPerYearUSD"]);
        let earnings = match earnings {
            Some(n) if n >= 10_000 => n,
            _ => {
                let us = level_info["levelEquivalency"]["us"]
                    .as_str()
                    .unwrap_or("")
                    .trim()
                    .to_uppercase();
                SALARY_BY_LEVEL
                    .iter()
                    .find(|(level, _)| *level == us)
                    .map(|(_, usd)| *usd)
                    .unwrap_or(300_000)
            }
        };
        out.insert("earningsPerYearUSD".to_string(), json!(earnings));
        Ok(Value::Object(out))
    }
}

// ---------------------------------------------------------------------------
// criticalReview / summary: streamed model calls
// ---------------------------------------------------------------------------

struct CriticalReview;

#[async_trait]
impl CardHandler for CriticalReview {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let report = base_report(ctx).await?;
        ctx.progress("ai_critical_review", "Generating critical review...", None);
        let system = "You are a rigorous but fair reviewer of academic careers.\n\
            Write a concise critical evaluation in Markdown. Be specific; no headings.";
        match ctx
            .llm_text(
                "scholar_critical_review",
                vec![
                    ChatMessage::system(system),
                    ChatMessage::user(summary_input(&report).to_string()),
                ],
            )
            .await
        {
            Ok(text) => {
                let trimmed = text.trim();
                Ok(json!({
                    "blockTitle": "Roast",
                    "evaluation": if trimmed.is_empty() { Value::Null } else { json!(trimmed) },
                }))
            }
            Err(err) => {
                warn!(job_id = %ctx.job.id, error = %err, "critical review failed");
                Ok(json!({ "blockTitle": "Roast", "evaluation": Value::Null }))
            }
        }
    }
}

/// Sectioned markdown evaluation. The model must emit the section markers
/// on their own lines; the delta router turns them into section switches.
struct Summary;

#[async_trait]
impl CardHandler for Summary {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let report = base_report(ctx).await?;
        ctx.progress("ai_summary", "Generating evaluation...", None);

        let markers = [
            "<!--section:overview-->",
            "<!--section:strengths-->",
            "<!--section:risks-->",
            "<!--section:questions-->",
        ];
        let system = format!(
            "You are a rigorous but fair talent evaluator.\n\
             Write in Markdown. Keep it concise, specific, and actionable.\n\n\
             Output format rules (STRICT):\n\
             1) Use EXACTLY these section markers, each on its own line, in this order:\n\
             {}\n\
             2) After each marker, write that section's content (Markdown paragraphs/bullets).\n\
             3) Do NOT add any other headings or section titles outside the markers.\n\
             4) Do NOT repeat the markers.",
            markers.join("\n")
        );
        let user = format!("Scholar profile signals (JSON):\n{}", summary_input(&report));

        match ctx
            .llm_text(
                "scholar_summary",
                vec![ChatMessage::system(system), ChatMessage::user(user)],
            )
            .await
        {
            Ok(text) => Ok(json!({ "evaluation": text.trim() })),
            Err(err) => {
                warn!(job_id = %ctx.job.id, error = %err, "summary failed");
                Ok(json!({ "evaluation": Value::Null }))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// full_report
// ---------------------------------------------------------------------------

struct FullReport;

const BLOCK_TYPES: [&str; 5] = [
    "publicationStats",
    "roleModel",
    "estimatedSalary",
    "criticalReview",
    "summary",
];

#[async_trait]
impl CardHandler for FullReport {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let outputs = outputs_by_type(ctx).await?;

        let researcher_info = outputs
            .get("researcherInfo")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let mut blocks = Map::new();
        for block in BLOCK_TYPES {
            let value = outputs
                .get(block)
                .filter(|v| v.is_object())
                .cloned()
                .unwrap_or(json!({}));
            blocks.insert(block.to_string(), value);
        }

        let report = json!({
            "researcherProfile": {
                "researcherInfo": researcher_info,
                "dataBlocks": blocks,
                "configInfo": { "comment": "Generated by unified analysis pipeline" },
            }
        });
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
    fn parse_usd_handles_common_shapes() {
        assert_eq!(parse_usd(&json!(250_000)), Some(250_000));
        assert_eq!(parse_usd(&json!("250k")), Some(250_000));
        assert_eq!(parse_usd(&json!("$200,000")), Some(200_000));
        assert_eq!(parse_usd(&json!("200k-300k")), Some(250_000));
        assert_eq!(parse_usd(&json!("200k to 300k")), Some(250_000));
        assert_eq!(parse_usd(&json!("about 180000 usd")), Some(180_000));
        assert_eq!(parse_usd(&json!("")), None);
        assert_eq!(parse_usd(&json!("unknown")), None);
        assert_eq!(parse_usd(&Value::Null), None);
    }

    #[test]
    fn summary_input_keeps_only_key_signals() {
        let report = json!({
            "researcher": {
                "name": "Ada",
                "affiliation": "Analytical Engines",
                "research_fields": ["computing", "mathematics"],
                "h_index": 30,
                "total_citations": 9000,
            },
            "publication_stats": {
                "total_papers": 80,
                "most_cited_paper": {"title": "Notes", "citations": 5000, "pdf": "dropped"},
                "year_distribution": {"2019": 5, "2020": 6, "2021": 7, "2022": 8, "2023": 9, "2024": 4, "2025": 2},
            },
            "papers": [{"big": "list"}],
            "coauthor_stats": {"total_coauthors": 12, "top_coauthors": [{"name": "Babbage"}]},
        });
        let input = summary_input(&report);
        assert_eq!(input["name"], "Ada");
        assert_eq!(input["highlights"]["most_cited_paper"]["title"], "Notes");
        assert!(input["highlights"]["most_cited_paper"].get("pdf").is_none());
        // Only the six most recent years survive.
        assert!(input["highlights"]["recent_year_distribution"]
            .as_object()
            .unwrap()
            .len()
            <= 6);
        assert!(input.get("papers").is_none());
    }
}
