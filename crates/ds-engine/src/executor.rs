use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use ds_core::events::payloads;
use ds_core::json_clean::prune_empty;
use ds_core::timing::Stopwatch;
use ds_core::{
    CancellationToken, Card, CardDescriptor, CardOutput, EngineError, EventType, Job, Result,
};
use ds_fetch::{FetchContext, FetchUpdate, ProgressSink};
use ds_llm::{ChatError, ChatMessage, ChatRequest};
use ds_rules::{stream_spec, StreamSpec};

use crate::context::EngineContext;
use crate::delta::{DeltaFlush, DeltaRouter};
use crate::handlers::{self, HandlerRegistry};

// ---------------------------------------------------------------------------
// ExecOutcome
// ---------------------------------------------------------------------------

/// Result of one card execution, ready for persistence and event emission.
#[derive(Debug)]
pub struct ExecOutcome {
    pub output: CardOutput,
    pub meta: Option<Value>,
    /// Internal resource cards are flagged so clients can hide them.
    pub internal: bool,
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// CardCtx
// ---------------------------------------------------------------------------

/// Per-execution context handed to card handlers.
pub struct CardCtx {
    pub job: Job,
    pub card: Card,
    pub engine: Arc<EngineContext>,
    pub cancel: CancellationToken,
    pub budget: Stopwatch,
    pub budget_ms: u64,
    pub(crate) progress_sink: ProgressSink,
    pub(crate) delta_tx: Option<flume::Sender<String>>,
    meta: Mutex<Option<Value>>,
}

impl CardCtx {
    /// Emit a `card.progress` event with a stable step token.
    pub fn progress(&self, step: &str, message: &str, data: Option<Value>) {
        (self.progress_sink)(FetchUpdate::Progress {
            step: step.to_string(),
            message: message.to_string(),
            data,
        });
    }

    /// Remaining soft budget in milliseconds.
    pub fn remaining_ms(&self) -> u64 {
        self.budget.remaining_ms(self.budget_ms)
    }

    /// Load an artifact payload for this job.
    pub async fn artifact(&self, artifact_type: &str) -> Result<Option<Value>> {
        let artifact = self
            .engine
            .artifacts
            .get_artifact(self.job.id, artifact_type)
            .await
            .map_err(storage_err)?;
        Ok(artifact.map(|a| a.payload))
    }

    /// Load a required artifact payload, failing the card when missing.
    pub async fn require_artifact(&self, artifact_type: &str) -> Result<Value> {
        self.artifact(artifact_type)
            .await?
            .ok_or_else(|| EngineError::Internal(format!("missing {artifact_type}")))
    }

    /// Text completion for `task`, streamed through the delta router when
    /// this card has a streaming spec. The per-task hard timeout is capped
    /// by the card's remaining budget.
    pub async fn llm_text(&self, task: &str, messages: Vec<ChatMessage>) -> Result<String> {
        self.cancel.check()?;
        let timeout = self.llm_deadline(task);
        let request = ChatRequest::new(task, messages).timeout(timeout);
        let result = match &self.delta_tx {
            Some(tx) => {
                let tx = tx.clone();
                let mut on_delta = move |chunk: &str| {
                    let _ = tx.send(chunk.to_string());
                };
                tokio::time::timeout(timeout, self.engine.chat.stream(&request, &mut on_delta))
                    .await
            }
            None => tokio::time::timeout(timeout, self.engine.chat.complete(&request)).await,
        };
        match result {
            Err(_) => Err(chat_err(ChatError::Timeout)),
            Ok(Err(err)) => Err(chat_err(err)),
            Ok(Ok(response)) => Ok(response.content),
        }
    }

    /// Strict-JSON completion for `task`.
    pub async fn llm_json(&self, task: &str, messages: Vec<ChatMessage>) -> Result<Value> {
        self.cancel.check()?;
        let timeout = self.llm_deadline(task);
        let request = ChatRequest::new(task, messages).timeout(timeout);
        match tokio::time::timeout(timeout, self.engine.chat.complete_json(&request)).await {
            Err(_) => Err(chat_err(ChatError::Timeout)),
            Ok(Err(err)) => Err(chat_err(err)),
            Ok(Ok(value)) => Ok(value),
        }
    }

    /// Push finalized text through the delta router in small chunks. Used
    /// by cards whose model call is strict-JSON internally (streaming raw
    /// JSON is poor UX) but whose final text should still stream.
    pub fn stream_text(&self, text: &str) {
        let Some(tx) = &self.delta_tx else {
            return;
        };
        let mut start = 0;
        while start < text.len() {
            let mut end = (start + 120).min(text.len());
            while !text.is_char_boundary(end) {
                end += 1;
            }
            let _ = tx.send(text[start..end].to_string());
            start = end;
        }
    }

    /// Attach meta to this card's `card.completed` payload.
    pub fn set_meta(&self, meta: Value) {
        *self.meta.lock().expect("meta lock poisoned") = Some(meta);
    }

    /// Queue a deferred refinement card, skipping types that already exist.
    pub async fn defer_card(&self, descriptor: CardDescriptor, step: &str, reason: &str) {
        match self
            .engine
            .jobs
            .create_cards(self.job.id, &[descriptor])
            .await
        {
            Ok(created) if !created.is_empty() => {
                self.progress(
                    step,
                    "Queued background refinement",
                    Some(json!({ "reason": reason })),
                );
            }
            Ok(_) => {}
            Err(err) => warn!(job_id = %self.job.id, error = %err, "failed to queue deferred card"),
        }
    }

    fn llm_deadline(&self, task: &str) -> Duration {
        let per_task = self.engine.config.llm_timeout_for(task);
        per_task.min(Duration::from_millis(self.remaining_ms().max(1)))
    }

    fn take_meta(&self) -> Option<Value> {
        self.meta.lock().expect("meta lock poisoned").take()
    }
}

pub(crate) fn storage_err(err: ds_store::StoreError) -> EngineError {
    EngineError::Storage(err.to_string())
}

pub(crate) fn chat_err(err: ChatError) -> EngineError {
    use ds_core::ErrorKind;
    match err.kind() {
        ErrorKind::UpstreamRateLimited => EngineError::UpstreamRateLimited {
            retry_after_secs: None,
        },
        ErrorKind::UpstreamUnavailable => EngineError::UpstreamUnavailable(err.to_string()),
        ErrorKind::Timeout => EngineError::Timeout(err.to_string()),
        _ => EngineError::LlmInvalidResponse(err.to_string()),
    }
}

// ---------------------------------------------------------------------------
// PipelineExecutor
// ---------------------------------------------------------------------------

/// Executes one card at a time: assembles inputs from artifacts, invokes
/// the right fetcher or handler, writes outputs, and emits events.
pub struct PipelineExecutor {
    engine: Arc<EngineContext>,
    handlers: HandlerRegistry,
    job_cache: Mutex<LruCache<Uuid, Job>>,
}

impl PipelineExecutor {
    pub fn new(engine: Arc<EngineContext>) -> Arc<Self> {
        let capacity =
            NonZeroUsize::new(engine.config.job_cache_max.max(1)).expect("non-zero capacity");
        Arc::new(Self {
            handlers: handlers::builtin_registry(),
            job_cache: Mutex::new(LruCache::new(capacity)),
            engine,
        })
    }

    /// Whether a failed card should be retried. Declared-retryable kinds
    /// always retry; timeouts retry only for idempotent fetcher cards.
    pub fn retry_allowed(&self, card: &Card, err: &EngineError) -> bool {
        if err.is_retryable() {
            return true;
        }
        if err.kind() == ds_core::ErrorKind::Timeout && card.is_resource() {
            if let Some(fetcher) = self.engine.fetchers.get(&card.card_type) {
                return fetcher.idempotent();
            }
        }
        false
    }

    async fn job_cached(&self, job_id: Uuid) -> Result<Job> {
        if let Some(job) = self
            .job_cache
            .lock()
            .expect("job cache lock poisoned")
            .get(&job_id)
        {
            return Ok(job.clone());
        }
        let job = self
            .engine
            .jobs
            .get_job(job_id)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| EngineError::Internal(format!("job {job_id} not found")))?;
        self.job_cache
            .lock()
            .expect("job cache lock poisoned")
            .put(job_id, job.clone());
        Ok(job)
    }

    /// Execute one claimed card to completion (or error), wiring progress
    /// and delta event pumps around the handler.
    pub async fn execute_card(
        &self,
        card: &Card,
        cancel: CancellationToken,
    ) -> Result<ExecOutcome> {
        let started = Stopwatch::start();
        let job = self.job_cached(card.job_id).await?;
        cancel.check()?;

        let internal = card.is_resource();
        let spec = if internal {
            None
        } else {
            stream_spec(job.source, &card.card_type)
        };
        let budget_ms = self
            .engine
            .config
            .budget_for(&card.card_type)
            .as_millis() as u64;

        // Progress pump: serializes card.progress / card.prefill /
        // card.append emission off the handler's execution path.
        let (progress_tx, progress_rx) = flume::unbounded::<FetchUpdate>();
        let progress_task = tokio::spawn(progress_pump(
            self.engine.clone(),
            job.clone(),
            card.clone(),
            progress_rx,
        ));
        let progress_sink: ProgressSink = Arc::new(move |update| {
            let _ = progress_tx.send(update);
        });

        // Delta pump: raw LLM chunks in, routed card.delta events out.
        let (delta_tx, delta_task) = match &spec {
            Some(spec) => {
                let (tx, rx) = flume::unbounded::<String>();
                let task = tokio::spawn(delta_pump(
                    self.engine.clone(),
                    job.id,
                    card.id,
                    card.card_type.clone(),
                    spec.clone(),
                    rx,
                ));
                (Some(tx), Some(task))
            }
            None => (None, None),
        };

        let ctx = CardCtx {
            job,
            card: card.clone(),
            engine: self.engine.clone(),
            cancel,
            budget: started,
            budget_ms,
            progress_sink,
            delta_tx,
            meta: Mutex::new(None),
        };

        let result = self.dispatch(&ctx).await;
        let meta = ctx.take_meta();
        drop(ctx); // closes both pump channels

        let stream_sections = match delta_task {
            Some(task) => task
                .await
                .map_err(|e| EngineError::Internal(format!("delta pump panicked: {e}")))?,
            None => Vec::new(),
        };
        progress_task
            .await
            .map_err(|e| EngineError::Internal(format!("progress pump panicked: {e}")))?;

        let data = result?;
        let stream = match (&spec, stream_sections.is_empty()) {
            (Some(spec), false) => {
                let sections: Map<String, Value> = stream_sections
                    .into_iter()
                    .map(|(section, text)| (section, Value::String(text)))
                    .collect();
                json!({ "field": spec.field, "format": spec.format, "sections": sections })
            }
            _ => Value::Null,
        };

        Ok(ExecOutcome {
            output: CardOutput { data, stream },
            meta,
            internal,
            duration_ms: started.elapsed_ms(),
        })
    }

    async fn dispatch(&self, ctx: &CardCtx) -> Result<Value> {
        let card_type = ctx.card.card_type.clone();

        if ctx.card.is_resource() {
            // Derivation-style resource stages (enrich bundles, refinement)
            // are built in; scrape stages go through the fetcher registry.
            // Either way the payload lands as an artifact for dependents.
            if let Some(handler) = self.handlers.get(ctx.job.source, &card_type) {
                let payload = handler.execute(ctx).await?;
                self.engine
                    .artifacts
                    .save_artifact(ctx.job.id, &card_type, &payload)
                    .await
                    .map_err(storage_err)?;
                return Ok(payload);
            }
            return self.run_fetcher(ctx, &card_type).await;
        }

        if let Some(handler) = self.handlers.get(ctx.job.source, &card_type) {
            return handler.execute(ctx).await;
        }

        // Last resort: shape the aggregated report, if it exists.
        if let Some(report) = ctx.artifact(ds_rules::plan::FULL_REPORT).await? {
            debug!(card_type = %card_type, "serving card from aggregated report");
            return Ok(handlers::extract_card_payload(
                ctx.job.source,
                &report,
                &card_type,
            ));
        }
        Err(EngineError::InvalidInput(format!(
            "unsupported card type: {card_type}"
        )))
    }

    async fn run_fetcher(&self, ctx: &CardCtx, card_type: &str) -> Result<Value> {
        let Some(fetcher) = self.engine.fetchers.get(card_type) else {
            return Err(EngineError::Internal(format!(
                "no fetcher registered for {card_type}"
            )));
        };

        let cache_age = self.engine.config.cache_max_age_days;
        if fetcher.cacheable() && !ctx.job.options.bypass_cache {
            if let Some(hit) = self
                .engine
                .artifacts
                .get_cached_resource(&ctx.job.subject_key, card_type, cache_age)
                .await
                .map_err(storage_err)?
            {
                ctx.progress(
                    "cache",
                    "Loaded from cache",
                    Some(json!({ "max_age_days": cache_age })),
                );
                self.engine
                    .artifacts
                    .save_artifact(ctx.job.id, card_type, &hit)
                    .await
                    .map_err(storage_err)?;
                return Ok(hit);
            }
        }

        ctx.progress("fetching", "Fetching upstream data...", None);

        // Card input overrides job input key-by-key.
        let mut input: Map<String, Value> = ctx.job.input.clone();
        for (k, v) in &ctx.card.input {
            input.insert(k.clone(), v.clone());
        }

        let fetch_timer = Stopwatch::start();
        let deadline = Instant::now() + Duration::from_millis(ctx.budget_ms);
        let fetch_ctx = FetchContext::new(
            ctx.progress_sink.clone(),
            ctx.cancel.clone(),
            Some(deadline),
        );
        let payload = fetcher.fetch(&input, &fetch_ctx).await?;
        ctx.cancel.check()?;
        ctx.progress(
            "timing.fetch",
            "Upstream fetch finished",
            Some(json!({ "duration_ms": fetch_timer.elapsed_ms() })),
        );

        self.engine
            .artifacts
            .save_artifact(ctx.job.id, card_type, &payload)
            .await
            .map_err(storage_err)?;
        if fetcher.cacheable() {
            self.engine
                .artifacts
                .put_cached_resource(&ctx.job.subject_key, card_type, &payload)
                .await
                .map_err(storage_err)?;
        }
        Ok(payload)
    }
}

// ---------------------------------------------------------------------------
// Event pumps
// ---------------------------------------------------------------------------

/// Drains handler/fetcher updates into events. Prefill data is pruned,
/// persisted against the target card, and emitted as `card.prefill`.
async fn progress_pump(
    engine: Arc<EngineContext>,
    job: Job,
    card: Card,
    rx: flume::Receiver<FetchUpdate>,
) {
    let mut card_ids: Option<std::collections::HashMap<String, i64>> = None;

    while let Ok(update) = rx.recv_async().await {
        match update {
            FetchUpdate::Progress {
                step,
                message,
                data,
            } => {
                let payload = payloads::card_progress(&card.card_type, &step, &message, data);
                if let Err(err) = engine
                    .events
                    .append_event(job.id, Some(card.id), EventType::CardProgress, payload)
                    .await
                {
                    warn!(job_id = %job.id, error = %err, "failed to append card.progress");
                }
            }
            FetchUpdate::Prefill { card: target, data, meta } => {
                let data = match meta {
                    Some(meta) => {
                        let mut merged = match data {
                            Value::Object(map) => map,
                            other => {
                                let mut map = Map::new();
                                map.insert("value".to_string(), other);
                                map
                            }
                        };
                        merged.insert("_meta".to_string(), meta);
                        Value::Object(merged)
                    }
                    None => data,
                };
                let Some(data) = prune_empty(&data) else {
                    continue;
                };
                let Some(target_id) =
                    lookup_card_id(&engine, job.id, &target, &mut card_ids).await
                else {
                    continue;
                };
                if let Err(err) = engine.jobs.apply_prefill(target_id, data.clone()).await {
                    warn!(job_id = %job.id, error = %err, "failed to persist prefill");
                    continue;
                }
                let payload = payloads::card_prefill(&target, &data);
                if let Err(err) = engine
                    .events
                    .append_event(job.id, Some(target_id), EventType::CardPrefill, payload)
                    .await
                {
                    warn!(job_id = %job.id, error = %err, "failed to append card.prefill");
                }
            }
            FetchUpdate::Append {
                card: target,
                path,
                items,
                dedup_key,
                cursor,
                partial,
            } => {
                if items.is_empty() {
                    continue;
                }
                let Some(target_id) =
                    lookup_card_id(&engine, job.id, &target, &mut card_ids).await
                else {
                    continue;
                };
                let mut payload = json!({
                    "card": target,
                    "path": path,
                    "items": items,
                    "dedup_key": dedup_key,
                });
                if let Some(cursor) = cursor {
                    payload["cursor"] = cursor;
                }
                if let Some(partial) = partial {
                    payload["partial"] = Value::Bool(partial);
                }
                if let Err(err) = engine
                    .events
                    .append_event(job.id, Some(target_id), EventType::CardAppend, payload)
                    .await
                {
                    warn!(job_id = %job.id, error = %err, "failed to append card.append");
                }
            }
        }
    }
}

async fn lookup_card_id(
    engine: &EngineContext,
    job_id: Uuid,
    card_type: &str,
    cache: &mut Option<std::collections::HashMap<String, i64>>,
) -> Option<i64> {
    if cache.is_none() {
        let cards = engine.jobs.list_cards_for_job(job_id).await.ok()?;
        *cache = Some(
            cards
                .into_iter()
                .map(|c| (c.card_type, c.id))
                .collect(),
        );
    }
    cache.as_ref().and_then(|m| m.get(card_type).copied())
}

/// Routes raw LLM chunks through the [`DeltaRouter`] and appends the
/// resulting `card.delta` events in order. Returns the per-section totals.
async fn delta_pump(
    engine: Arc<EngineContext>,
    job_id: Uuid,
    card_id: i64,
    card_type: String,
    spec: StreamSpec,
    rx: flume::Receiver<String>,
) -> Vec<(String, String)> {
    let pending: Arc<Mutex<Vec<DeltaFlush>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = pending.clone();
    let mut router = DeltaRouter::new(&spec, move |flush| {
        sink.lock().expect("delta sink lock poisoned").push(flush);
    });

    let drain = |pending: &Arc<Mutex<Vec<DeltaFlush>>>| -> Vec<DeltaFlush> {
        std::mem::take(&mut *pending.lock().expect("delta sink lock poisoned"))
    };

    while let Ok(chunk) = rx.recv_async().await {
        router.on_delta(&chunk);
        for flush in drain(&pending) {
            append_delta(&engine, job_id, card_id, &card_type, &spec, flush).await;
        }
    }
    let totals = router.finish();
    for flush in drain(&pending) {
        append_delta(&engine, job_id, card_id, &card_type, &spec, flush).await;
    }
    totals
}

async fn append_delta(
    engine: &EngineContext,
    job_id: Uuid,
    card_id: i64,
    card_type: &str,
    spec: &StreamSpec,
    flush: DeltaFlush,
) {
    let payload = json!({
        "card": card_type,
        "field": spec.field,
        "section": flush.section,
        "format": spec.format,
        "delta": flush.delta,
    });
    if let Err(err) = engine
        .events
        .append_event(job_id, Some(card_id), EventType::CardDelta, payload)
        .await
    {
        warn!(job_id = %job_id, error = %err, "failed to append card.delta");
    }
}
