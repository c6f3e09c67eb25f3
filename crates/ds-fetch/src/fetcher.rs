use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use ds_core::Result;

use crate::context::FetchContext;

/// A source-specific I/O adapter for one resource card type.
///
/// Fetchers are the only components that talk to the outside world. They
/// MUST respect cancellation between network calls, and SHOULD honor the
/// soft deadline by returning partial results plus a progress event
/// indicating degradation.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Fetch the payload for `input`, pushing progress/prefill/append
    /// updates through the context.
    async fn fetch(&self, input: &Map<String, Value>, ctx: &FetchContext) -> Result<Value>;

    /// Idempotent fetchers may be retried after a timeout; non-idempotent
    /// ones fall back instead.
    fn idempotent(&self) -> bool {
        true
    }

    /// Whether this fetcher's payload may be served from (and saved to)
    /// the cross-job resource cache.
    fn cacheable(&self) -> bool {
        true
    }
}

/// Registry mapping resource card types to their fetchers, populated at
/// startup.
#[derive(Clone, Default)]
pub struct FetcherRegistry {
    fetchers: HashMap<String, Arc<dyn ResourceFetcher>>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        card_type: impl Into<String>,
        fetcher: Arc<dyn ResourceFetcher>,
    ) -> &mut Self {
        self.fetchers.insert(card_type.into(), fetcher);
        self
    }

    pub fn get(&self, card_type: &str) -> Option<Arc<dyn ResourceFetcher>> {
        self.fetchers.get(card_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.fetchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetchers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
