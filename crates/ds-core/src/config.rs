use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// BackplaneMode
// ---------------------------------------------------------------------------

/// Cross-process fan-out mode. Never authoritative; the event store remains
/// the source of truth and subscribers fall back to paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackplaneMode {
    None,
    Full,
    Wakeup,
}

impl BackplaneMode {
    pub fn parse(raw: &str) -> BackplaneMode {
        match raw.trim().to_ascii_lowercase().as_str() {
            "full" | "event" => BackplaneMode::Full,
            "wakeup" | "signal" => BackplaneMode::Wakeup,
            _ => BackplaneMode::None,
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Engine configuration, environment-driven.
///
/// Recognized variables:
/// - `MAX_WORKERS`, `POLL_INTERVAL_MS`, `MAX_ATTEMPTS`, `JOB_CACHE_MAX`
/// - `CONCURRENCY_CAP_<GROUP>`: suffix lowercased, `_` becomes `:`
///   (`CONCURRENCY_CAP_SCRAPE_GITHUB` caps the `scrape:github` group)
/// - `CARD_BUDGET_MS_<CARD_TYPE>`: the suffix is matched against the
///   card type's own env key, which maps `.` to `_` (see
///   [`card_env_key`]). `CARD_BUDGET_MS_RESOURCE_GITHUB_BEST_PR` budgets
///   `resource.github.best_pr`; underscores inside a card name survive.
/// - `LLM_TIMEOUT_MS_<TASK>`: suffix lowercased
/// - `BACKPLANE_MODE`: none | full | wakeup
/// - `SSE_HEARTBEAT_INTERVAL_MS`, `SSE_MAX_DURATION_MS`
/// - `CACHE_MAX_AGE_DAYS`
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_workers: usize,
    pub poll_interval: Duration,
    pub claim_batch_size: usize,
    pub max_attempts: u32,
    pub concurrency_caps: HashMap<String, usize>,
    pub card_budgets_ms: HashMap<String, u64>,
    pub default_card_budget_ms: u64,
    pub hard_timeout_ms: u64,
    pub llm_timeouts_ms: HashMap<String, u64>,
    pub default_llm_timeout_ms: u64,
    pub backplane_mode: BackplaneMode,
    pub backplane_max_event_bytes: usize,
    pub sse_heartbeat_interval: Duration,
    pub sse_max_duration: Duration,
    pub cache_max_age_days: u32,
    pub job_cache_max: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut caps = HashMap::new();
        caps.insert("llm".to_string(), 4);
        caps.insert("scrape:github".to_string(), 2);
        caps.insert("scrape:scholar".to_string(), 2);
        caps.insert("scrape:linkedin".to_string(), 2);
        Self {
            max_workers: 8,
            poll_interval: Duration::from_millis(250),
            claim_batch_size: 8,
            max_attempts: 2,
            concurrency_caps: caps,
            card_budgets_ms: HashMap::new(),
            default_card_budget_ms: 30_000,
            hard_timeout_ms: 90_000,
            llm_timeouts_ms: HashMap::new(),
            default_llm_timeout_ms: 20_000,
            backplane_mode: BackplaneMode::None,
            backplane_max_event_bytes: 64 * 1024,
            sse_heartbeat_interval: Duration::from_secs(15),
            sse_max_duration: Duration::from_secs(300),
            cache_max_age_days: 3,
            job_cache_max: 256,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the process environment, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut cfg = EngineConfig::default();

        if let Some(v) = read_parsed::<usize>("MAX_WORKERS") {
            cfg.max_workers = v.clamp(1, 64);
        }
        if let Some(v) = read_parsed::<u64>("POLL_INTERVAL_MS") {
            cfg.poll_interval = Duration::from_millis(v.max(10));
        }
        if let Some(v) = read_parsed::<u32>("MAX_ATTEMPTS") {
            cfg.max_attempts = v.max(1);
        }
        if let Some(v) = read_parsed::<usize>("JOB_CACHE_MAX") {
            cfg.job_cache_max = v;
        }
        if let Some(v) = read_parsed::<u64>("SSE_HEARTBEAT_INTERVAL_MS") {
            cfg.sse_heartbeat_interval = Duration::from_millis(v.max(100));
        }
        if let Some(v) = read_parsed::<u64>("SSE_MAX_DURATION_MS") {
            cfg.sse_max_duration = Duration::from_millis(v.max(1_000));
        }
        if let Some(v) = read_parsed::<u32>("CACHE_MAX_AGE_DAYS") {
            cfg.cache_max_age_days = v.min(30);
        }
        if let Ok(raw) = std::env::var("BACKPLANE_MODE") {
            cfg.backplane_mode = BackplaneMode::parse(&raw);
        }

        for (key, raw) in std::env::vars() {
            if let Some(suffix) = key.strip_prefix("CONCURRENCY_CAP_") {
                if let Ok(cap) = raw.trim().parse::<usize>() {
                    cfg.concurrency_caps
                        .insert(suffix.to_lowercase().replace('_', ":"), cap);
                }
            } else if let Some(suffix) = key.strip_prefix("CARD_BUDGET_MS_") {
                // Stored under the raw lowercased suffix; `budget_for`
                // derives the same key from the card type. A character
                // substitution here would be lossy: `_` in the suffix can
                // stand for either `.` or a literal underscore in the card
                // name (`resource.github.best_pr`).
                if let Ok(ms) = raw.trim().parse::<u64>() {
                    cfg.card_budgets_ms.insert(suffix.to_lowercase(), ms);
                }
            } else if let Some(suffix) = key.strip_prefix("LLM_TIMEOUT_MS_") {
                if let Ok(ms) = raw.trim().parse::<u64>() {
                    cfg.llm_timeouts_ms.insert(suffix.to_lowercase(), ms);
                }
            }
        }

        cfg
    }

    /// Soft budget for one card execution.
    pub fn budget_for(&self, card_type: &str) -> Duration {
        let ms = self
            .card_budgets_ms
            .get(&card_env_key(card_type))
            .copied()
            .unwrap_or(self.default_card_budget_ms);
        Duration::from_millis(ms)
    }

    /// Hard wall-clock limit for one card execution.
    pub fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.hard_timeout_ms)
    }

    /// Per-group running-card cap; `None` means unbounded.
    pub fn cap_for(&self, group: &str) -> Option<usize> {
        if group.is_empty() {
            return None;
        }
        self.concurrency_caps.get(group).copied()
    }

    /// Hard timeout for one LLM task.
    pub fn llm_timeout_for(&self, task: &str) -> Duration {
        let ms = self
            .llm_timeouts_ms
            .get(task)
            .copied()
            .unwrap_or(self.default_llm_timeout_ms);
        Duration::from_millis(ms)
    }
}

fn read_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse::<T>().ok()
}

/// The `CARD_BUDGET_MS_*` env suffix for a card type: lowercased, with
/// dotted path segments joined by `_`. Mapping from the card type is the
/// unambiguous direction; underscores already inside a card name
/// (`best_pr`) stay underscores.
pub fn card_env_key(card_type: &str) -> String {
    card_type.to_lowercase().replace('.', "_")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
