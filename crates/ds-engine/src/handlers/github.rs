use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use ds_core::{CardDescriptor, CardOutput, CardStatus, Result, Source};
use ds_llm::ChatMessage;
use ds_store::CardTransitionEvent;

use crate::best_pr::{best_pr_fallback, best_pr_llm, pr_candidates, BestPrStatus};
use crate::executor::{storage_err, CardCtx};
use crate::handlers::{
    non_empty_object, non_empty_str, obj, outputs_by_type, save_report, CardHandler,
    HandlerRegistry,
};

pub fn register(registry: &mut HandlerRegistry) {
    registry.register(Source::Github, "profile", Arc::new(Profile));
    registry.register(Source::Github, "activity", Arc::new(Activity));
    registry.register(Source::Github, "repos", Arc::new(Repos));
    registry.register(Source::Github, "role_model", Arc::new(RoleModel));
    registry.register(Source::Github, "roast", Arc::new(Roast));
    registry.register(Source::Github, "summary", Arc::new(Summary));
    registry.register(Source::Github, "full_report", Arc::new(FullReport));
    registry.register(Source::Github, "resource.github.enrich", Arc::new(Enrich));
    registry.register(
        Source::Github,
        "resource.github.best_pr",
        Arc::new(BestPrRefine),
    );
}

/// Model input without the bulky PR node list.
fn ai_input(data: &Value) -> Value {
    let mut input = obj(data);
    input.remove("_pull_requests");
    Value::Object(input)
}

// ---------------------------------------------------------------------------
// profile
// ---------------------------------------------------------------------------

/// Profile card from the fast profile fetch, back-filled with GraphQL
/// counts from the data bundle when it has already landed.
struct Profile;

#[async_trait]
impl CardHandler for Profile {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let payload = ctx.require_artifact("resource.github.profile").await?;
        let mut user = obj(&payload["user"]);

        if let Some(data) = ctx.artifact("resource.github.data").await? {
            let d_user = &data["user"];
            for key in ["issues", "pullRequests", "repositories"] {
                let have_count = !user
                    .get(key)
                    .map(|v| v["totalCount"].is_null())
                    .unwrap_or(true);
                if !have_count && !d_user[key]["totalCount"].is_null() {
                    user.insert(key.to_string(), d_user[key].clone());
                }
            }
            for key in ["id", "name"] {
                let missing = user
                    .get(key)
                    .and_then(|v| non_empty_str(v))
                    .is_none();
                if missing {
                    if let Some(value) = non_empty_str(&d_user[key]) {
                        user.insert(key.to_string(), Value::String(value.to_string()));
                    }
                }
            }
        }
        Ok(Value::Object(user))
    }
}

// ---------------------------------------------------------------------------
// activity
// ---------------------------------------------------------------------------

struct Activity;

#[async_trait]
impl CardHandler for Activity {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let data = ctx.require_artifact("resource.github.data").await?;
        Ok(json!({
            "overview": data["overview"],
            "activity": data["activity"],
            "code_contribution": data["code_contribution"],
        }))
    }
}

// ---------------------------------------------------------------------------
// repos
// ---------------------------------------------------------------------------

/// Repos card: projects straight from the data bundle, plus a budgeted
/// best-PR pick. On timeout or exhausted budget the card ships the
/// heuristic pick (or none) and queues a background refinement.
struct Repos;

const BEST_PR_CANDIDATES: usize = 10;
const BEST_PR_BG_CANDIDATES: u64 = 50;
const MIN_LLM_BUDGET_MS: u64 = 500;

fn best_pr_refine_descriptor(reason: &str) -> CardDescriptor {
    let mut input = serde_json::Map::new();
    input.insert("reason".to_string(), json!(reason));
    input.insert("max_candidates".to_string(), json!(BEST_PR_BG_CANDIDATES));
    CardDescriptor::new("resource.github.best_pr")
        .depends_on(&["resource.github.data"])
        .priority(1)
        .group("llm")
        .input(input)
}

#[async_trait]
impl CardHandler for Repos {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let data = ctx.require_artifact("resource.github.data").await?;
        let feature_project = data["feature_project"].clone();
        let top_projects = if data["top_projects"].is_null() {
            json!([])
        } else {
            data["top_projects"].clone()
        };
        let pr_nodes = data["_pull_requests"]["nodes"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let mut most_pr = Value::Null;
        let status: &str;

        if pr_nodes.is_empty() {
            status = "missing_pr_data";
            ctx.defer_card(best_pr_refine_descriptor(status), "ai_best_pr_deferred", status)
                .await;
        } else {
            let candidates = pr_candidates(&pr_nodes, BEST_PR_CANDIDATES);
            let remaining = ctx.remaining_ms();
            if candidates.is_empty() {
                status = "no_candidates";
            } else if remaining < MIN_LLM_BUDGET_MS {
                status = "budget_exhausted";
                ctx.defer_card(
                    best_pr_refine_descriptor(status),
                    "ai_best_pr_deferred",
                    status,
                )
                .await;
            } else {
                let soft = ctx
                    .engine
                    .config
                    .llm_timeout_for("github_best_pr")
                    .min(std::time::Duration::from_millis(remaining));
                ctx.progress(
                    "ai_best_pr",
                    "Finding most valuable pull request...",
                    Some(json!({
                        "candidates": candidates.len(),
                        "timeout_ms": soft.as_millis() as u64,
                    })),
                );
                let (pick, pick_status) =
                    best_pr_llm(ctx.engine.chat.as_ref(), &candidates, soft).await;
                match pick_status {
                    BestPrStatus::Ok => {
                        most_pr = pick.unwrap_or(Value::Null);
                        status = "ok";
                    }
                    BestPrStatus::Timeout => {
                        // Keep UX fast: ship the heuristic pick now, refine
                        // in the background.
                        most_pr = best_pr_fallback(&candidates).unwrap_or(Value::Null);
                        status = "timeout";
                        ctx.defer_card(
                            best_pr_refine_descriptor(status),
                            "ai_best_pr_deferred",
                            status,
                        )
                        .await;
                    }
                    BestPrStatus::Invalid | BestPrStatus::Error | BestPrStatus::Empty
                    | BestPrStatus::Fallback => {
                        most_pr = best_pr_fallback(&candidates).unwrap_or(Value::Null);
                        status = "fallback";
                    }
                }
            }
        }

        ctx.set_meta(json!({ "best_pr": status }));
        Ok(json!({
            "feature_project": feature_project,
            "top_projects": top_projects,
            "most_valuable_pull_request": most_pr,
        }))
    }
}

// ---------------------------------------------------------------------------
// resource.github.enrich
// ---------------------------------------------------------------------------

/// Fused enrichment bundle: one strict-JSON call producing role model,
/// roast, and valuation, consumed by several user cards.
struct Enrich;

#[async_trait]
impl CardHandler for Enrich {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let data = ctx.require_artifact("resource.github.data").await?;
        ctx.progress("analyzing", "Generating enrichment bundle...", None);

        let system = "You are an expert developer-profile analyst.\n\
            Given GitHub profile signals as JSON, return ONLY valid JSON with keys:\n\
            role_model: {name, reason} for a well-known engineer this developer resembles;\n\
            roast: a short, witty, good-natured roast in Markdown;\n\
            valuation_and_level: {level, salary_range, total_compensation}.";
        let user = ai_input(&data).to_string();

        match ctx
            .llm_json(
                "github_enrich",
                vec![ChatMessage::system(system), ChatMessage::user(user)],
            )
            .await
        {
            Ok(bundle) => Ok(bundle),
            Err(err) => {
                warn!(job_id = %ctx.job.id, error = %err, "enrich bundle failed, using fallback");
                Ok(json!({
                    "role_model": {},
                    "roast": Value::Null,
                    "valuation_and_level": {
                        "level": "Unknown",
                        "salary_range": "Unknown",
                        "total_compensation": "Unknown",
                    },
                }))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// role_model / roast / summary: artifact-first, model fallback
// ---------------------------------------------------------------------------

struct RoleModel;

#[async_trait]
impl CardHandler for RoleModel {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        if let Some(enrich) = ctx.artifact("resource.github.enrich").await? {
            if let Some(role_model) = non_empty_object(&enrich["role_model"]) {
                return Ok(Value::Object(role_model.clone()));
            }
        }
        let data = ctx.require_artifact("resource.github.data").await?;
        ctx.progress("ai_role_model", "Generating role model...", None);
        let system = "Given GitHub profile signals as JSON, name one well-known engineer \
            this developer resembles. Return ONLY valid JSON: {name, reason}.";
        match ctx
            .llm_json(
                "github_role_model",
                vec![
                    ChatMessage::system(system),
                    ChatMessage::user(ai_input(&data).to_string()),
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

struct Roast;

#[async_trait]
impl CardHandler for Roast {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        if let Some(enrich) = ctx.artifact("resource.github.enrich").await? {
            if let Some(roast) = non_empty_str(&enrich["roast"]) {
                ctx.stream_text(roast);
                return Ok(Value::String(roast.to_string()));
            }
        }
        let data = ctx.require_artifact("resource.github.data").await?;
        ctx.progress("ai_roast", "Generating roast...", None);
        let system = "Write a short, witty, good-natured roast of this developer based on \
            their GitHub profile. Markdown, 3-5 sentences, no headings.";
        match ctx
            .llm_text(
                "github_roast",
                vec![
                    ChatMessage::system(system),
                    ChatMessage::user(ai_input(&data).to_string()),
                ],
            )
            .await
        {
            Ok(text) => Ok(Value::String(text)),
            Err(err) => {
                warn!(job_id = %ctx.job.id, error = %err, "roast failed, using fallback");
                Ok(Value::String("No roast available".to_string()))
            }
        }
    }
}

struct Summary;

#[async_trait]
impl CardHandler for Summary {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        if let Some(enrich) = ctx.artifact("resource.github.enrich").await? {
            if let Some(valuation) = non_empty_object(&enrich["valuation_and_level"]) {
                return Ok(Value::Object(valuation.clone()));
            }
        }
        let data = ctx.require_artifact("resource.github.data").await?;
        ctx.progress("ai_valuation", "Generating valuation and level...", None);
        let system = "Estimate this developer's career level and compensation from their \
            GitHub signals. Return ONLY valid JSON: {level, salary_range, total_compensation}.";
        match ctx
            .llm_json(
                "github_valuation",
                vec![
                    ChatMessage::system(system),
                    ChatMessage::user(ai_input(&data).to_string()),
                ],
            )
            .await
        {
            Ok(valuation) => Ok(valuation),
            Err(err) => {
                warn!(job_id = %ctx.job.id, error = %err, "valuation failed, using fallback");
                Ok(json!({
                    "level": "Unknown",
                    "salary_range": "Unknown",
                    "total_compensation": "Unknown",
                }))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// resource.github.best_pr: deferred background refinement
// ---------------------------------------------------------------------------

/// Re-runs the best-PR pick with a wider candidate set and a generous
/// timeout, then re-completes the user-facing repos card with the refined
/// result. Clients observe a second `card.completed(repos)` as an update.
struct BestPrRefine;

#[async_trait]
impl CardHandler for BestPrRefine {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let data = ctx.require_artifact("resource.github.data").await?;
        let pr_nodes = data["_pull_requests"]["nodes"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        if pr_nodes.is_empty() {
            return Ok(json!({ "skipped": true, "reason": "no_prs" }));
        }

        let max_candidates = ctx
            .card
            .input
            .get("max_candidates")
            .and_then(Value::as_u64)
            .unwrap_or(BEST_PR_BG_CANDIDATES) as usize;
        let candidates = pr_candidates(&pr_nodes, max_candidates);
        if candidates.is_empty() {
            return Ok(json!({ "skipped": true, "reason": "no_candidates" }));
        }

        let timeout = ctx.engine.config.llm_timeout_for("github_best_pr_background");
        ctx.progress(
            "ai_best_pr_refine",
            "Refining best PR in background...",
            Some(json!({
                "candidates": candidates.len(),
                "timeout_ms": timeout.as_millis() as u64,
            })),
        );

        let (pick, pick_status) =
            best_pr_llm(ctx.engine.chat.as_ref(), &candidates, timeout).await;
        let (best_pr, status) = match pick {
            Some(pick) => (pick, pick_status.as_str()),
            None => match best_pr_fallback(&candidates) {
                Some(pick) => (pick, "fallback"),
                None => return Ok(json!({ "skipped": true, "reason": "no_best_pr" })),
            },
        };

        // Re-complete the user-facing repos card with the refined pick;
        // clients observe the second card.completed as an update.
        let cards = ctx
            .engine
            .jobs
            .list_cards_for_job(ctx.job.id)
            .await
            .map_err(storage_err)?;
        if let Some(repos) = cards.iter().find(|c| c.card_type == "repos") {
            let refinement =
                CardOutput::from_data(json!({ "most_valuable_pull_request": best_pr }));
            if let Err(err) = ctx
                .engine
                .events
                .append_card_transition(
                    ctx.job.id,
                    repos.id,
                    "repos",
                    CardStatus::Completed,
                    Some(refinement),
                    None,
                    CardTransitionEvent::Completed {
                        internal: false,
                        duration_ms: 0,
                        meta: Some(json!({ "source": status })),
                    },
                )
                .await
            {
                warn!(job_id = %ctx.job.id, error = %err, "failed to refresh repos card");
            }
        }

        Ok(json!({ "best_pr": best_pr, "status": status }))
    }
}

// ---------------------------------------------------------------------------
// full_report
// ---------------------------------------------------------------------------

/// Terminal aggregation: the data bundle fused with every user card's
/// output, persisted as the `full_report` artifact.
struct FullReport;

#[async_trait]
impl CardHandler for FullReport {
    async fn execute(&self, ctx: &CardCtx) -> Result<Value> {
        let data = ctx.require_artifact("resource.github.data").await?;
        let mut report = obj(&data);
        report.remove("_pull_requests");

        let outputs = outputs_by_type(ctx).await?;

        if let Some(profile) = outputs.get("profile").and_then(Value::as_object) {
            report.insert("user".to_string(), Value::Object(profile.clone()));
        }
        if let Some(activity) = outputs.get("activity").and_then(Value::as_object) {
            for key in ["overview", "activity", "code_contribution"] {
                if let Some(value) = activity.get(key) {
                    report.insert(key.to_string(), value.clone());
                }
            }
        }
        if let Some(repos) = outputs.get("repos").and_then(Value::as_object) {
            for key in ["feature_project", "top_projects", "most_valuable_pull_request"] {
                if let Some(value) = repos.get(key).filter(|v| !v.is_null()) {
                    report.insert(key.to_string(), value.clone());
                }
            }
        }
        if let Some(role_model) = outputs.get("role_model").and_then(Value::as_object) {
            report.insert("role_model".to_string(), Value::Object(role_model.clone()));
        }
        if let Some(roast) = outputs.get("roast") {
            report.insert("roast".to_string(), roast.clone());
        }
        if let Some(summary) = outputs.get("summary").and_then(Value::as_object) {
            if !summary.is_empty() {
                report.insert(
                    "valuation_and_level".to_string(),
                    Value::Object(summary.clone()),
                );
            }
        }

        let report = Value::Object(report);
        save_report(ctx, &report).await?;
        Ok(report)
    }
}
