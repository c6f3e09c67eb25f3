use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use ds_api::{JobApi, JobSnapshot};
use ds_bus::EventBus;
use ds_core::{EngineConfig, EngineError, EventType, JobStatus, Result};
use ds_engine::{EngineContext, PipelineExecutor, Scheduler};
use ds_fetch::{FetchContext, FetcherRegistry, ResourceFetcher};
use ds_llm::MockChatProvider;
use ds_rules::RulesEngine;
use ds_store::{ArtifactStore, Db, EventStore, JobStore};
use ds_stream::StreamItem;

struct StaticFetcher(Value);

#[async_trait]
impl ResourceFetcher for StaticFetcher {
    async fn fetch(&self, _input: &Map<String, Value>, ctx: &FetchContext) -> Result<Value> {
        ctx.progress("fetched", "Upstream fetch finished", None);
        Ok(self.0.clone())
    }
}

/// Fetcher that dawdles until cancelled, checking the token between ticks.
struct SlowFetcher;

#[async_trait]
impl ResourceFetcher for SlowFetcher {
    async fn fetch(&self, _input: &Map<String, Value>, ctx: &FetchContext) -> Result<Value> {
        for _ in 0..500 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            ctx.cancel.check()?;
        }
        Ok(json!({}))
    }
}

async fn api_with_github_fetchers() -> JobApi {
    let mut registry = FetcherRegistry::new();
    registry.register(
        "resource.github.profile",
        Arc::new(StaticFetcher(json!({"user": {"login": "octocat"}}))),
    );
    registry.register("resource.github.preview", Arc::new(StaticFetcher(json!({}))));
    registry.register(
        "resource.github.data",
        Arc::new(StaticFetcher(json!({
            "user": {"login": "octocat"},
            "overview": {"stars": 1},
            "activity": {},
            "code_contribution": {},
            "feature_project": {"name": "widgets"},
            "top_projects": [],
        }))),
    );
    api_with(registry).await
}

async fn api_with(registry: FetcherRegistry) -> JobApi {
    let db = Db::open_in_memory().await.unwrap();
    let bus = EventBus::new();
    let mut config = EngineConfig::default();
    config.poll_interval = Duration::from_millis(20);
    config.sse_heartbeat_interval = Duration::from_millis(200);
    config.sse_max_duration = Duration::from_secs(10);

    let engine = EngineContext::new(
        JobStore::new(db.clone()),
        ArtifactStore::new(db.clone()),
        EventStore::new(db).with_bus(bus.clone()),
        bus,
        RulesEngine::new(),
        registry,
        Arc::new(
            MockChatProvider::new().with_text(
                r#"{"role_model": {"name": "Linus"}, "roast": "toasty",
                    "valuation_and_level": {"level": "L4"}}"#,
            ),
        ),
        config,
    );
    let executor = PipelineExecutor::new(engine.clone());
    let scheduler = Scheduler::new(engine.clone(), executor);
    tokio::spawn(scheduler.clone().run());
    JobApi::new(engine, scheduler)
}

fn github_input() -> Map<String, Value> {
    let mut input = Map::new();
    input.insert("content".to_string(), json!("octocat"));
    input
}

#[tokio::test]
async fn create_stream_and_resume() {
    let api = api_with_github_fetchers().await;
    let outcome = api
        .create_job("github", github_input(), Some("user-1".to_string()), None)
        .await
        .unwrap();
    assert!(!outcome.needs_confirmation);
    let job_id = outcome.job_id.unwrap();

    // First subscriber consumes a few events, then "disconnects".
    let mut first = api.stream_events(job_id, 0);
    let mut cut_seq = 0;
    let mut first_seqs = Vec::new();
    while first_seqs.len() < 4 {
        match first.next().await.unwrap() {
            Some(StreamItem::Event(event)) => {
                cut_seq = event.seq;
                first_seqs.push(event.seq);
            }
            Some(StreamItem::Heartbeat) => {}
            None => panic!("stream ended prematurely"),
        }
    }
    drop(first);

    // Second subscriber resumes exactly after the cursor and reaches the
    // terminal event.
    let mut resumed = api.stream_events(job_id, cut_seq);
    let mut resumed_seqs = Vec::new();
    loop {
        match resumed.next().await.unwrap() {
            Some(StreamItem::Event(event)) => {
                resumed_seqs.push(event.seq);
                if event.event_type.is_job_terminal() {
                    assert_eq!(event.event_type, EventType::JobCompleted);
                    break;
                }
            }
            Some(StreamItem::Heartbeat) => {}
            None => panic!("stream ended before terminal event"),
        }
    }
    assert_eq!(resumed_seqs[0], cut_seq + 1);

    // Concatenated, the two streams cover the contiguous history.
    let all: Vec<u64> = first_seqs.into_iter().chain(resumed_seqs).collect();
    for (idx, seq) in all.iter().enumerate() {
        assert_eq!(*seq, idx as u64 + 1);
    }

    // Snapshot after completion exposes user-facing outputs and cursor.
    let JobSnapshot {
        job,
        cards,
        last_seq,
    } = api.get_job_snapshot(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.user_id.as_deref(), Some("user-1"));
    // Background refinement may append events past the terminal one.
    assert!(last_seq >= *all.last().unwrap());
    let profile = cards.iter().find(|c| c.card_type == "profile").unwrap();
    assert_eq!(profile.output.as_ref().unwrap().data["login"], "octocat");
}

#[tokio::test]
async fn unknown_source_is_invalid_input() {
    let api = api_with_github_fetchers().await;
    let err = api
        .create_job("myspace", github_input(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn ambiguous_scholar_name_needs_confirmation() {
    let api = api_with_github_fetchers().await;
    let mut input = Map::new();
    input.insert("name".to_string(), json!("Ada Lovelace"));
    let outcome = api.create_job("scholar", input, None, None).await.unwrap();
    assert!(outcome.needs_confirmation);
    assert!(outcome.job_id.is_none());
}

#[tokio::test]
async fn snapshot_of_unknown_job_errors() {
    let api = api_with_github_fetchers().await;
    let err = api
        .get_job_snapshot(uuid::Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn cancel_ends_stream_with_job_cancelled() {
    let mut registry = FetcherRegistry::new();
    registry.register("resource.github.profile", Arc::new(SlowFetcher));
    registry.register("resource.github.preview", Arc::new(StaticFetcher(json!({}))));
    registry.register("resource.github.data", Arc::new(StaticFetcher(json!({}))));
    let api = api_with(registry).await;

    let outcome = api
        .create_job("github", github_input(), None, None)
        .await
        .unwrap();
    let job_id = outcome.job_id.unwrap();
    // Give the scheduler a moment to claim the slow fetch, then cancel.
    tokio::time::sleep(Duration::from_millis(100)).await;
    api.cancel_job(job_id).await.unwrap();

    let mut stream = api.stream_events(job_id, 0);
    let mut last_type = None;
    loop {
        match stream.next().await.unwrap() {
            Some(StreamItem::Event(event)) => {
                let done = event.event_type.is_job_terminal();
                last_type = Some(event.event_type);
                if done {
                    break;
                }
            }
            Some(StreamItem::Heartbeat) => {}
            None => break,
        }
    }
    assert_eq!(last_type, Some(EventType::JobCancelled));
}
