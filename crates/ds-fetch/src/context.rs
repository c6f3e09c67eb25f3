use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use ds_core::CancellationToken;

// ---------------------------------------------------------------------------
// FetchUpdate
// ---------------------------------------------------------------------------

/// Out-of-band updates a fetcher can push while running.
///
/// The executor turns these into `card.progress`, `card.prefill`, and
/// `card.append` events.
#[derive(Debug, Clone)]
pub enum FetchUpdate {
    /// Compact progress with a stable step token.
    Progress {
        step: String,
        message: String,
        data: Option<Value>,
    },
    /// Early, possibly degraded data for another card of the same job.
    Prefill {
        card: String,
        data: Value,
        meta: Option<Value>,
    },
    /// Incremental list items for another card (e.g. paper pages).
    Append {
        card: String,
        path: String,
        items: Vec<Value>,
        dedup_key: String,
        cursor: Option<Value>,
        partial: Option<bool>,
    },
}

/// Callback receiving fetcher updates; must be cheap and non-blocking.
pub type ProgressSink = Arc<dyn Fn(FetchUpdate) + Send + Sync>;

// ---------------------------------------------------------------------------
// FetchContext
// ---------------------------------------------------------------------------

/// Execution context handed to a fetcher.
#[derive(Clone)]
pub struct FetchContext {
    progress: ProgressSink,
    pub cancel: CancellationToken,
    /// Soft deadline: fetchers should return partial results once passed.
    pub deadline: Option<Instant>,
}

impl FetchContext {
    pub fn new(
        progress: ProgressSink,
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            progress,
            cancel,
            deadline,
        }
    }

    /// Context that discards updates (tests, cache-refresh paths).
    pub fn detached() -> Self {
        Self {
            progress: Arc::new(|_| {}),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn progress(&self, step: &str, message: &str, data: Option<Value>) {
        (self.progress)(FetchUpdate::Progress {
            step: step.to_string(),
            message: message.to_string(),
            data,
        });
    }

    pub fn prefill(&self, card: &str, data: Value, meta: Option<Value>) {
        (self.progress)(FetchUpdate::Prefill {
            card: card.to_string(),
            data,
            meta,
        });
    }

    pub fn append(&self, card: &str, path: &str, items: Vec<Value>, dedup_key: &str) {
        (self.progress)(FetchUpdate::Append {
            card: card.to_string(),
            path: path.to_string(),
            items,
            dedup_key: dedup_key.to_string(),
            cursor: None,
            partial: None,
        });
    }

    /// True once the soft deadline has passed; fetchers should wind down
    /// and return whatever they have, with a degradation progress event.
    pub fn past_deadline(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn updates_flow_through_sink() {
        let seen: Arc<Mutex<Vec<FetchUpdate>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            Arc::new(move |update| seen.lock().unwrap().push(update)) as ProgressSink
        };
        let ctx = FetchContext::new(sink, CancellationToken::new(), None);

        ctx.progress("fetching", "Fetching profile...", None);
        ctx.prefill("profile", json!({"name": "Ada"}), Some(json!({"degraded": true})));
        ctx.append("publicationStats", "papers", vec![json!({"id": 1})], "id");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(matches!(&seen[0], FetchUpdate::Progress { step, .. } if step == "fetching"));
        assert!(matches!(&seen[1], FetchUpdate::Prefill { card, .. } if card == "profile"));
        assert!(
            matches!(&seen[2], FetchUpdate::Append { dedup_key, .. } if dedup_key == "id")
        );
    }

    #[test]
    fn deadline_detection() {
        let ctx = FetchContext::detached();
        assert!(!ctx.past_deadline());

        let passed = FetchContext::new(
            Arc::new(|_| {}),
            CancellationToken::new(),
            Some(Instant::now() - Duration::from_millis(1)),
        );
        assert!(passed.past_deadline());
    }
}
