use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ds_core::events::payloads;
use ds_core::{
    CancellationToken, Card, CardStatus, EngineError, ErrorKind, EventType, JobStatus, Result,
};

use ds_store::CardTransitionEvent;

use crate::context::EngineContext;
use crate::executor::{storage_err, PipelineExecutor};

/// Pull-based card scheduler.
///
/// A single claim/dispatch loop keeps concurrency-group accounting
/// consistent; claimed cards run on a bounded tokio worker pool. Each job
/// has one cancellation token; workers observe it cooperatively.
pub struct Scheduler {
    engine: Arc<EngineContext>,
    executor: Arc<PipelineExecutor>,
    cancels: DashMap<Uuid, CancellationToken>,
    cancel_reasons: DashMap<Uuid, String>,
    workers: Arc<Semaphore>,
    wake: Notify,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(engine: Arc<EngineContext>, executor: Arc<PipelineExecutor>) -> Arc<Self> {
        let max_workers = engine.config.max_workers.max(1);
        Arc::new(Self {
            engine,
            executor,
            cancels: DashMap::new(),
            cancel_reasons: DashMap::new(),
            workers: Arc::new(Semaphore::new(max_workers)),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Nudge the loop out of its poll sleep (new job, requeued card, ...).
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Stop claiming new cards. Running workers finish on their own.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.wake.notify_waiters();
    }

    /// The job's cancellation token (created on demand).
    pub fn cancel_token(&self, job_id: Uuid) -> CancellationToken {
        self.cancels.entry(job_id).or_default().clone()
    }

    /// Cancel a job: stop claiming its cards, cancel everything still
    /// pending, signal running workers, and finalize once they return.
    pub async fn cancel_job(&self, job_id: Uuid, reason: &str) -> Result<()> {
        info!(job_id = %job_id, reason, "cancelling job");
        self.cancel_reasons.insert(job_id, reason.to_string());
        self.cancel_token(job_id).cancel();

        let cancelled = self
            .engine
            .jobs
            .cancel_pending_cards(job_id)
            .await
            .map_err(storage_err)?;
        for card in &cancelled {
            self.append_event(
                job_id,
                Some(card.id),
                EventType::CardCancelled,
                payloads::card_cancelled(&card.card_type),
            )
            .await;
        }

        self.try_finalize_cancelled(job_id).await?;
        self.wake();
        Ok(())
    }

    /// Claim/dispatch until shutdown. Sleeps `poll_interval` between idle
    /// passes; `wake` cuts the sleep short.
    pub async fn run(self: Arc<Self>) {
        info!(
            max_workers = self.engine.config.max_workers,
            "scheduler started"
        );
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let available = self.workers.available_permits();
            if available > 0 {
                let limit = available.min(self.engine.config.claim_batch_size);
                match self
                    .engine
                    .jobs
                    .claim_ready_cards(&self.engine.config.concurrency_caps, limit)
                    .await
                {
                    Ok(outcome) => {
                        for job in &outcome.started_jobs {
                            self.append_event(
                                job.id,
                                None,
                                EventType::JobStarted,
                                payloads::job_started(job.source),
                            )
                            .await;
                        }
                        for card in outcome.cards {
                            let permit = match self.workers.clone().acquire_owned().await {
                                Ok(permit) => permit,
                                Err(_) => return,
                            };
                            let scheduler = self.clone();
                            tokio::spawn(async move {
                                scheduler.run_card(card, permit).await;
                            });
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "claim pass failed");
                    }
                }
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.engine.config.poll_interval) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }
        info!("scheduler stopped");
    }

    async fn run_card(self: Arc<Self>, card: Card, permit: OwnedSemaphorePermit) {
        let _permit = permit;
        let token = self.cancel_token(card.job_id);

        // Retries reuse the same card row; only the first attempt opens the
        // card's event bracket.
        if card.attempt_count == 1 {
            self.append_event(
                card.job_id,
                Some(card.id),
                EventType::CardStarted,
                payloads::card_started(&card.card_type),
            )
            .await;
        }

        debug!(
            job_id = %card.job_id,
            card_type = %card.card_type,
            attempt = card.attempt_count,
            "executing card"
        );

        let hard_timeout = self.engine.config.hard_timeout();
        let result = match tokio::time::timeout(
            hard_timeout,
            self.executor.execute_card(&card, token.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(format!(
                "hard timeout after {}ms",
                hard_timeout.as_millis()
            ))),
        };

        match result {
            Ok(exec) => {
                // Status update and card.completed land in one serialized
                // transaction: no dependent can start in between.
                if let Err(err) = self
                    .engine
                    .events
                    .append_card_transition(
                        card.job_id,
                        card.id,
                        &card.card_type,
                        CardStatus::Completed,
                        Some(exec.output),
                        None,
                        CardTransitionEvent::Completed {
                            internal: exec.internal,
                            duration_ms: exec.duration_ms,
                            meta: exec.meta,
                        },
                    )
                    .await
                {
                    warn!(card_id = card.id, error = %err, "completion persist failed");
                }
                self.finalize_job(card.job_id).await;
            }
            Err(err) if err.kind() == ErrorKind::Cancelled => {
                if let Err(err) = self
                    .engine
                    .events
                    .append_card_transition(
                        card.job_id,
                        card.id,
                        &card.card_type,
                        CardStatus::Cancelled,
                        None,
                        None,
                        CardTransitionEvent::Cancelled,
                    )
                    .await
                {
                    warn!(card_id = card.id, error = %err, "cancel persist failed");
                }
                if let Err(err) = self.try_finalize_cancelled(card.job_id).await {
                    warn!(job_id = %card.job_id, error = %err, "cancel finalize failed");
                }
            }
            Err(err) => {
                let retryable = self.executor.retry_allowed(&card, &err);
                if retryable && card.attempt_count < self.engine.config.max_attempts {
                    warn!(
                        job_id = %card.job_id,
                        card_type = %card.card_type,
                        attempt = card.attempt_count,
                        error = %err,
                        "card failed, retrying"
                    );
                    self.append_event(
                        card.job_id,
                        Some(card.id),
                        EventType::CardProgress,
                        payloads::card_progress(
                            &card.card_type,
                            "retrying",
                            &err.to_string(),
                            Some(serde_json::json!({ "attempt": card.attempt_count })),
                        ),
                    )
                    .await;
                    self.clone().requeue_after_backoff(card);
                } else {
                    warn!(
                        job_id = %card.job_id,
                        card_type = %card.card_type,
                        error = %err,
                        "card failed terminally"
                    );
                    if let Err(persist_err) = self
                        .engine
                        .events
                        .append_card_transition(
                            card.job_id,
                            card.id,
                            &card.card_type,
                            CardStatus::Failed,
                            None,
                            Some((err.kind(), err.to_string())),
                            CardTransitionEvent::Failed { retryable },
                        )
                        .await
                    {
                        warn!(card_id = card.id, error = %persist_err, "failure persist failed");
                    }
                    // Cards stranded behind the failure can never become
                    // ready; skip them so the job can finalize.
                    match self.engine.jobs.skip_blocked_cards(card.job_id).await {
                        Ok(skipped) if !skipped.is_empty() => {
                            debug!(
                                job_id = %card.job_id,
                                skipped = skipped.len(),
                                "skipped cards stranded by failed dependency"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(job_id = %card.job_id, error = %err, "skip pass failed");
                        }
                    }
                    self.finalize_job(card.job_id).await;
                }
            }
        }
    }

    /// Jittered exponential backoff, then back on the ready queue.
    fn requeue_after_backoff(self: Arc<Self>, card: Card) {
        let attempt = card.attempt_count.max(1);
        let base = 250u64.saturating_mul(1 << (attempt - 1).min(6));
        let jitter = rand::thread_rng().gen_range(0..=100);
        let scheduler = self;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(base + jitter)).await;
            if let Err(err) = scheduler.engine.jobs.requeue_card(card.id).await {
                warn!(card_id = card.id, error = %err, "requeue failed");
            }
            scheduler.wake();
        });
    }

    /// Transition the job to completed/failed once every non-background
    /// card is terminal. Exactly one terminal `job.*` event is emitted.
    async fn finalize_job(&self, job_id: Uuid) {
        if self.cancel_token(job_id).is_cancelled() {
            if let Err(err) = self.try_finalize_cancelled(job_id).await {
                warn!(job_id = %job_id, error = %err, "cancel finalize failed");
            }
            return;
        }

        let cards = match self.engine.jobs.list_cards_for_job(job_id).await {
            Ok(cards) => cards,
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "finalize list failed");
                return;
            }
        };
        let required: Vec<&Card> = cards.iter().filter(|c| !c.is_background()).collect();
        if required.iter().any(|c| !c.status.is_terminal()) {
            return;
        }

        // A job fails only when a required card failed with no usable data.
        let hard_failure = required.iter().find(|c| {
            c.status == CardStatus::Failed
                && !c
                    .output
                    .as_ref()
                    .map(|o| match &o.data {
                        serde_json::Value::Object(map) => !map.is_empty(),
                        serde_json::Value::Null => false,
                        _ => true,
                    })
                    .unwrap_or(false)
        });

        let (status, event_type) = match hard_failure {
            Some(_) => (JobStatus::Failed, EventType::JobFailed),
            None => (JobStatus::Completed, EventType::JobCompleted),
        };
        match self.engine.jobs.update_job_status(job_id, status).await {
            Ok(true) => {
                let payload = match hard_failure {
                    Some(card) => payloads::job_failed(
                        card.error_kind.unwrap_or(ErrorKind::Internal),
                        card.error_message.as_deref().unwrap_or("card failed"),
                    ),
                    None => serde_json::json!({}),
                };
                self.append_event(job_id, None, event_type, payload).await;
                self.cancels.remove(&job_id);
                info!(job_id = %job_id, status = ?status, "job finalized");
            }
            Ok(false) => {}
            Err(err) => warn!(job_id = %job_id, error = %err, "job status update failed"),
        }
    }

    /// Emit the terminal `job.cancelled` once no card is still running.
    async fn try_finalize_cancelled(&self, job_id: Uuid) -> Result<()> {
        let cards = self
            .engine
            .jobs
            .list_cards_for_job(job_id)
            .await
            .map_err(storage_err)?;
        if cards.iter().any(|c| c.status == CardStatus::Running) {
            return Ok(());
        }
        if self
            .engine
            .jobs
            .update_job_status(job_id, JobStatus::Cancelled)
            .await
            .map_err(storage_err)?
        {
            let reason = self
                .cancel_reasons
                .remove(&job_id)
                .map(|(_, reason)| reason)
                .unwrap_or_else(|| "cancelled".to_string());
            self.append_event(
                job_id,
                None,
                EventType::JobCancelled,
                payloads::job_cancelled(&reason),
            )
            .await;
            self.cancels.remove(&job_id);
            info!(job_id = %job_id, "job cancelled");
        }
        Ok(())
    }

    async fn append_event(
        &self,
        job_id: Uuid,
        card_id: Option<i64>,
        event_type: EventType,
        payload: serde_json::Value,
    ) {
        if let Err(err) = self
            .engine
            .events
            .append_event(job_id, card_id, event_type, payload)
            .await
        {
            error!(job_id = %job_id, event = %event_type, error = %err, "event append failed");
        }
    }
}
