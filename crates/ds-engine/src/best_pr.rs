use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use ds_llm::{ChatError, ChatMessage, ChatProvider, ChatRequest};

/// Compact PR candidate handed to heuristics and the model.
#[derive(Debug, Clone)]
pub struct PrCandidate {
    pub repository: String,
    pub url: String,
    pub title: String,
    pub additions: i64,
    pub deletions: i64,
    /// Smaller is "more commented": upstream orders PR nodes by comment
    /// count descending and we preserve that rank.
    pub comment_rank: i64,
}

impl PrCandidate {
    fn impact(&self) -> i64 {
        self.additions + self.deletions
    }

    fn score(&self) -> (i64, i64) {
        // Prefer higher impact; for ties, prefer more-discussed.
        (self.impact(), -self.comment_rank)
    }

    fn to_value(&self) -> Value {
        json!({
            "repository": self.repository,
            "url": self.url,
            "title": self.title,
            "additions": self.additions,
            "deletions": self.deletions,
            "comment_rank": self.comment_rank,
        })
    }
}

/// Outcome tag for the best-PR selection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BestPrStatus {
    Ok,
    Fallback,
    Timeout,
    Invalid,
    Error,
    Empty,
}

impl BestPrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BestPrStatus::Ok => "ok",
            BestPrStatus::Fallback => "fallback",
            BestPrStatus::Timeout => "timeout",
            BestPrStatus::Invalid => "invalid",
            BestPrStatus::Error => "error",
            BestPrStatus::Empty => "empty",
        }
    }
}

/// Build a compact candidate list from raw PR nodes, keeping the payload
/// tiny to bound model latency and cost. Top `max_candidates` by heuristic
/// score, re-sorted into the original comment order for the model.
pub fn pr_candidates(pr_nodes: &[Value], max_candidates: usize) -> Vec<PrCandidate> {
    let mut out: Vec<PrCandidate> = Vec::new();
    for (idx, pr) in pr_nodes.iter().enumerate() {
        let url = pr["url"].as_str().unwrap_or("").trim().to_string();
        let title = pr["title"].as_str().unwrap_or("").trim().to_string();
        if url.is_empty() || title.is_empty() {
            continue;
        }
        out.push(PrCandidate {
            repository: repo_from_url(&url),
            url,
            title,
            additions: pr["additions"].as_i64().unwrap_or(0),
            deletions: pr["deletions"].as_i64().unwrap_or(0),
            comment_rank: idx as i64,
        });
    }
    if out.is_empty() {
        return out;
    }

    let k = max_candidates.clamp(1, 50);
    out.sort_by(|a, b| b.score().cmp(&a.score()));
    out.truncate(k);
    out.sort_by_key(|p| p.comment_rank);
    out
}

/// Deterministic heuristic pick: highest impact, ties broken by discussion.
pub fn best_pr_fallback(candidates: &[PrCandidate]) -> Option<Value> {
    let best = candidates.iter().max_by_key(|p| p.score())?;
    Some(json!({
        "repository": best.repository,
        "url": best.url,
        "title": best.title,
        "additions": best.additions,
        "deletions": best.deletions,
        "reason": "Selected by heuristic (high impact + most discussed among top candidates).",
        "impact": format!("{} lines changed", best.impact()),
    }))
}

/// Ask the model to pick the most valuable PR (strict JSON). Returns the
/// validated pick or a status describing why there is none.
pub async fn best_pr_llm(
    chat: &dyn ChatProvider,
    candidates: &[PrCandidate],
    timeout: Duration,
) -> (Option<Value>, BestPrStatus) {
    if candidates.is_empty() {
        return (None, BestPrStatus::Empty);
    }

    let system = "You are an expert GitHub analyst.\n\
        You are given a list of pull requests (PRs) for a developer.\n\
        The PR list is ordered by comment count DESC (most discussed first).\n\n\
        Return ONLY valid JSON. Do not wrap in markdown (no ``` fences).\n\n\
        Pick the single most valuable PR.\n\
        Return ONLY valid JSON with keys:\n\
        repository, url, title, additions, deletions, reason, impact.\n\
        - reason: 1-2 short sentences.\n\
        - impact: <= 20 words.";
    let user = Value::Array(candidates.iter().map(|c| c.to_value()).collect()).to_string();

    let request = ChatRequest::new(
        "github_best_pr",
        vec![ChatMessage::system(system), ChatMessage::user(user)],
    )
    .temperature(0.2)
    .max_tokens(260)
    .timeout(timeout);

    let out = match tokio::time::timeout(timeout, chat.complete_json(&request)).await {
        Err(_) => return (None, BestPrStatus::Timeout),
        Ok(Err(ChatError::Timeout)) => return (None, BestPrStatus::Timeout),
        Ok(Err(ChatError::InvalidJson(_) | ChatError::Parse(_))) => {
            return (None, BestPrStatus::Invalid)
        }
        Ok(Err(err)) => {
            debug!(error = %err, "best PR model call failed");
            return (None, BestPrStatus::Error);
        }
        Ok(Ok(out)) => out,
    };

    let url = out["url"].as_str().unwrap_or("").trim().to_string();
    let title = out["title"].as_str().unwrap_or("").trim().to_string();
    if url.is_empty() || title.is_empty() {
        return (None, BestPrStatus::Invalid);
    }
    let mut repository = out["repository"].as_str().unwrap_or("").trim().to_string();
    if repository.is_empty() {
        repository = repo_from_url(&url);
    }
    let reason = out["reason"].as_str().unwrap_or("").trim();
    let impact = out["impact"].as_str().unwrap_or("").trim();

    (
        Some(json!({
            "repository": repository,
            "url": url,
            "title": title,
            "additions": out["additions"].as_i64().unwrap_or(0),
            "deletions": out["deletions"].as_i64().unwrap_or(0),
            "reason": if reason.is_empty() { "Selected by model." } else { reason },
            "impact": impact,
        })),
        BestPrStatus::Ok,
    )
}

fn repo_from_url(url: &str) -> String {
    let path = url
        .split("github.com/")
        .nth(1)
        .unwrap_or("")
        .trim_start_matches('/');
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.len() >= 2 {
        format!("{}/{}", parts[0], parts[1])
    } else {
        String::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ds_llm::MockChatProvider;

    fn nodes() -> Vec<Value> {
        vec![
            json!({"url": "https://github.com/acme/widgets/pull/1", "title": "Most discussed", "additions": 10, "deletions": 2}),
            json!({"url": "https://github.com/acme/widgets/pull/2", "title": "Biggest change", "additions": 900, "deletions": 100}),
            json!({"url": "", "title": "No url"}),
            json!({"url": "https://github.com/acme/widgets/pull/3", "title": "Small", "additions": 1, "deletions": 0}),
        ]
    }

    #[test]
    fn candidates_drop_invalid_and_keep_comment_order() {
        let candidates = pr_candidates(&nodes(), 10);
        assert_eq!(candidates.len(), 3);
        // Re-sorted by original comment rank after heuristic selection.
        assert_eq!(candidates[0].comment_rank, 0);
        assert_eq!(candidates[1].comment_rank, 1);
        assert_eq!(candidates[0].repository, "acme/widgets");
    }

    #[test]
    fn candidate_cap_keeps_highest_impact() {
        let candidates = pr_candidates(&nodes(), 1);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].title, "Biggest change");
    }

    #[test]
    fn fallback_picks_highest_impact() {
        let candidates = pr_candidates(&nodes(), 10);
        let pick = best_pr_fallback(&candidates).unwrap();
        assert_eq!(pick["title"], "Biggest change");
        assert_eq!(pick["impact"], "1000 lines changed");
    }

    #[test]
    fn fallback_on_empty_is_none() {
        assert!(best_pr_fallback(&[]).is_none());
    }

    #[tokio::test]
    async fn llm_pick_validates_fields() {
        let chat = MockChatProvider::new().with_text(
            r#"{"repository": "", "url": "https://github.com/acme/widgets/pull/2",
                "title": "Biggest change", "additions": 900, "deletions": 100,
                "reason": "Large, well-reviewed refactor.", "impact": "Reworked the core"}"#,
        );
        let candidates = pr_candidates(&nodes(), 10);
        let (pick, status) =
            best_pr_llm(&chat, &candidates, Duration::from_secs(5)).await;
        assert_eq!(status, BestPrStatus::Ok);
        let pick = pick.unwrap();
        // Repository back-filled from the URL.
        assert_eq!(pick["repository"], "acme/widgets");
    }

    #[tokio::test]
    async fn llm_prose_is_invalid() {
        let chat = MockChatProvider::new().with_text("cannot pick, sorry");
        let candidates = pr_candidates(&nodes(), 10);
        let (pick, status) =
            best_pr_llm(&chat, &candidates, Duration::from_secs(5)).await;
        assert!(pick.is_none());
        assert_eq!(status, BestPrStatus::Invalid);
    }

    #[tokio::test]
    async fn llm_timeout_is_reported() {
        let chat = MockChatProvider::new().with_error(ChatError::Timeout);
        let candidates = pr_candidates(&nodes(), 10);
        let (pick, status) =
            best_pr_llm(&chat, &candidates, Duration::from_secs(5)).await;
        assert!(pick.is_none());
        assert_eq!(status, BestPrStatus::Timeout);
    }

    #[tokio::test]
    async fn empty_candidates_short_circuit() {
        let chat = MockChatProvider::new();
        let (pick, status) = best_pr_llm(&chat, &[], Duration::from_secs(5)).await;
        assert!(pick.is_none());
        assert_eq!(status, BestPrStatus::Empty);
        assert!(chat.captured_requests().is_empty());
    }
}
