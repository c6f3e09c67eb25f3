use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use ds_core::subject::resolve_subject_key;
use ds_core::{Card, EngineError, Job, JobOptions, Result, Source};
use ds_engine::{EngineContext, Scheduler};
use ds_stream::EventSubscriber;

use crate::resolver::resolve_input;

/// Result of a job creation request.
#[derive(Debug, Clone)]
pub struct CreateJobOutcome {
    /// Absent when the input was ambiguous and must be confirmed first.
    pub job_id: Option<Uuid>,
    pub needs_confirmation: bool,
}

/// Point-in-time view of a job, its cards, and the stream cursor.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub job: Job,
    pub cards: Vec<Card>,
    pub last_seq: u64,
}

/// The engine's external surface, called by the transport layer.
pub struct JobApi {
    engine: Arc<EngineContext>,
    scheduler: Arc<Scheduler>,
}

impl JobApi {
    pub fn new(engine: Arc<EngineContext>, scheduler: Arc<Scheduler>) -> Self {
        Self { engine, scheduler }
    }

    /// Validate input, plan cards, and insert the pending job. The
    /// scheduler is woken so dispatch starts immediately.
    pub async fn create_job(
        &self,
        source: &str,
        input: Map<String, Value>,
        user_id: Option<String>,
        options: Option<JobOptions>,
    ) -> Result<CreateJobOutcome> {
        let source = Source::parse(source)
            .ok_or_else(|| EngineError::InvalidInput(format!("unrecognized source: {source}")))?;
        let resolution = resolve_input(source, &input)?;
        if resolution.needs_confirmation {
            return Ok(CreateJobOutcome {
                job_id: None,
                needs_confirmation: true,
            });
        }

        let options = options.unwrap_or_default();
        let subject_key = resolve_subject_key(source, &resolution.input);
        let mut job = Job::new(source, resolution.input, subject_key);
        job.user_id = user_id;
        job.options = options.clone();

        let plan = self
            .engine
            .rules
            .build_plan(source, options.requested_cards.as_deref());
        self.engine
            .jobs
            .create_job(&job, &plan)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        self.scheduler.wake();

        info!(job_id = %job.id, source = %source, cards = plan.len(), "job created");
        Ok(CreateJobOutcome {
            job_id: Some(job.id),
            needs_confirmation: false,
        })
    }

    pub async fn get_job_snapshot(&self, job_id: Uuid) -> Result<JobSnapshot> {
        let job = self
            .engine
            .jobs
            .get_job(job_id)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown job: {job_id}")))?;
        let cards = self
            .engine
            .jobs
            .list_cards_for_job(job_id)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        let last_seq = self
            .engine
            .events
            .last_seq(job_id)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(JobSnapshot {
            job,
            cards,
            last_seq,
        })
    }

    pub async fn cancel_job(&self, job_id: Uuid) -> Result<()> {
        self.scheduler.cancel_job(job_id, "cancelled by user").await
    }

    /// Open a resumable subscription; `after_seq = 0` for a fresh stream.
    pub fn stream_events(&self, job_id: Uuid, after_seq: u64) -> EventSubscriber {
        EventSubscriber::open(
            self.engine.events.clone(),
            &self.engine.bus,
            job_id,
            after_seq,
            self.engine.config.sse_heartbeat_interval,
            self.engine.config.sse_max_duration,
        )
    }
}
