use std::collections::HashMap;

use serde_json::{json, Map, Value};

use ds_bus::EventBus;
use ds_core::{
    Card, CardDescriptor, CardOutput, CardStatus, ErrorKind, EventType, Job, JobStatus, Source,
};
use ds_store::{ArtifactStore, Db, EventStore, JobStore};

fn input(pairs: &[(&str, &str)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect()
}

fn github_plan() -> Vec<CardDescriptor> {
    vec![
        CardDescriptor::new("resource.github.profile").group("scrape:github"),
        CardDescriptor::new("resource.github.data")
            .depends_on(&["resource.github.profile"])
            .group("scrape:github"),
        CardDescriptor::new("profile").depends_on(&["resource.github.profile"]),
        CardDescriptor::new("activity").depends_on(&["resource.github.data"]),
    ]
}

async fn setup() -> (JobStore, ArtifactStore, EventStore, Job) {
    let db = Db::open_in_memory().await.unwrap();
    let jobs = JobStore::new(db.clone());
    let artifacts = ArtifactStore::new(db.clone());
    let events = EventStore::new(db);
    let job = Job::new(
        Source::Github,
        input(&[("content", "octocat")]),
        "github:login:octocat",
    );
    jobs.create_job(&job, &github_plan()).await.unwrap();
    (jobs, artifacts, events, job)
}

fn no_caps() -> HashMap<String, usize> {
    HashMap::new()
}

fn by_type<'a>(cards: &'a [Card], card_type: &str) -> &'a Card {
    cards
        .iter()
        .find(|c| c.card_type == card_type)
        .unwrap_or_else(|| panic!("missing card {card_type}"))
}

#[tokio::test]
async fn create_job_inserts_pending_cards() {
    let (jobs, _, _, job) = setup().await;
    let cards = jobs.list_cards_for_job(job.id).await.unwrap();
    assert_eq!(cards.len(), 4);
    assert!(cards.iter().all(|c| c.status == CardStatus::Pending));
    assert_eq!(
        by_type(&cards, "resource.github.data").depends_on,
        vec!["resource.github.profile"]
    );
}

#[tokio::test]
async fn claim_promotes_only_dependency_free_cards() {
    let (jobs, _, _, job) = setup().await;
    let outcome = jobs.claim_ready_cards(&no_caps(), 10).await.unwrap();

    // Only resource.github.profile has no dependencies.
    assert_eq!(outcome.cards.len(), 1);
    assert_eq!(outcome.cards[0].card_type, "resource.github.profile");
    assert_eq!(outcome.cards[0].status, CardStatus::Running);
    assert_eq!(outcome.cards[0].attempt_count, 1);

    // First dispatch flips the job to running exactly once.
    assert_eq!(outcome.started_jobs.len(), 1);
    assert_eq!(outcome.started_jobs[0].id, job.id);
    let again = jobs.claim_ready_cards(&no_caps(), 10).await.unwrap();
    assert!(again.started_jobs.is_empty());
}

#[tokio::test]
async fn completing_a_dependency_unblocks_dependents() {
    let (jobs, _, _, job) = setup().await;
    let claimed = jobs.claim_ready_cards(&no_caps(), 10).await.unwrap();
    let profile_card = &claimed.cards[0];

    jobs.update_card_status(
        profile_card.id,
        CardStatus::Completed,
        Some(CardOutput::from_data(json!({"user": {"login": "octocat"}}))),
        None,
    )
    .await
    .unwrap();

    let next = jobs.claim_ready_cards(&no_caps(), 10).await.unwrap();
    let types: Vec<&str> = next.cards.iter().map(|c| c.card_type.as_str()).collect();
    assert!(types.contains(&"resource.github.data"));
    assert!(types.contains(&"profile"));
    assert!(!types.contains(&"activity"));
    let _ = job;
}

#[tokio::test]
async fn claim_respects_group_caps_across_jobs() {
    let db = Db::open_in_memory().await.unwrap();
    let jobs = JobStore::new(db);
    let plan = vec![
        CardDescriptor::new("resource.github.profile").group("scrape:github"),
    ];
    for login in ["a", "b", "c"] {
        let job = Job::new(
            Source::Github,
            input(&[("content", login)]),
            format!("github:login:{login}"),
        );
        jobs.create_job(&job, &plan).await.unwrap();
    }

    let mut caps = HashMap::new();
    caps.insert("scrape:github".to_string(), 2);
    let outcome = jobs.claim_ready_cards(&caps, 10).await.unwrap();
    assert_eq!(outcome.cards.len(), 2);

    // Nothing else claimable until one of the claimed cards finishes.
    let outcome = jobs.claim_ready_cards(&caps, 10).await.unwrap();
    assert!(outcome.cards.is_empty());
}

#[tokio::test]
async fn claim_orders_by_priority_then_age() {
    let db = Db::open_in_memory().await.unwrap();
    let jobs = JobStore::new(db);
    let job = Job::new(Source::Github, input(&[("content", "x")]), "github:login:x");
    let plan = vec![
        CardDescriptor::new("background").priority(1),
        CardDescriptor::new("urgent"),
    ];
    jobs.create_job(&job, &plan).await.unwrap();

    let outcome = jobs.claim_ready_cards(&no_caps(), 1).await.unwrap();
    assert_eq!(outcome.cards[0].card_type, "urgent");
}

#[tokio::test]
async fn prefill_then_complete_merges_with_own_data_winning() {
    let (jobs, _, _, job) = setup().await;
    let cards = jobs.list_cards_for_job(job.id).await.unwrap();
    let profile = by_type(&cards, "profile");

    jobs.apply_prefill(profile.id, json!({"name": "Octo", "avatar": "", "about": "early"}))
        .await
        .unwrap();

    // Run the card through claim so the transition is legal.
    let claimed = jobs.claim_ready_cards(&no_caps(), 10).await.unwrap();
    jobs.update_card_status(
        claimed.cards[0].id,
        CardStatus::Completed,
        Some(CardOutput::from_data(json!({}))),
        None,
    )
    .await
    .unwrap();
    let claimed = jobs.claim_ready_cards(&no_caps(), 10).await.unwrap();
    let running_profile = claimed
        .cards
        .iter()
        .find(|c| c.card_type == "profile")
        .unwrap();

    let merged = jobs
        .update_card_status(
            running_profile.id,
            CardStatus::Completed,
            Some(CardOutput::from_data(json!({"about": "final bio"}))),
            None,
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(merged.data["name"], "Octo");
    assert_eq!(merged.data["about"], "final bio");
    assert_eq!(merged.data["avatar"], "");
}

#[tokio::test]
async fn invalid_transition_leaves_row_untouched() {
    let (jobs, _, _, job) = setup().await;
    let cards = jobs.list_cards_for_job(job.id).await.unwrap();
    let pending = by_type(&cards, "activity");

    let result = jobs
        .update_card_status(pending.id, CardStatus::Completed, None, None)
        .await;
    assert!(result.is_err());

    let unchanged = jobs.get_card(pending.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, CardStatus::Pending);
}

#[tokio::test]
async fn failed_card_records_error_kind() {
    let (jobs, _, _, _) = setup().await;
    let claimed = jobs.claim_ready_cards(&no_caps(), 10).await.unwrap();
    let card = &claimed.cards[0];

    jobs.update_card_status(
        card.id,
        CardStatus::Failed,
        None,
        Some((ErrorKind::UpstreamUnavailable, "503 from api".to_string())),
    )
    .await
    .unwrap();

    let failed = jobs.get_card(card.id).await.unwrap().unwrap();
    assert_eq!(failed.status, CardStatus::Failed);
    assert_eq!(failed.error_kind, Some(ErrorKind::UpstreamUnavailable));
    assert_eq!(failed.error_message.as_deref(), Some("503 from api"));
    assert!(failed.finished_at.is_some());
}

#[tokio::test]
async fn cancel_pending_cards_returns_cancelled_set() {
    let (jobs, _, _, job) = setup().await;
    // Claim one card so it is running; the rest stay pending.
    let claimed = jobs.claim_ready_cards(&no_caps(), 1).await.unwrap();
    assert_eq!(claimed.cards.len(), 1);

    let cancelled = jobs.cancel_pending_cards(job.id).await.unwrap();
    assert_eq!(cancelled.len(), 3);
    assert!(cancelled.iter().all(|c| c.status == CardStatus::Cancelled));

    let cards = jobs.list_cards_for_job(job.id).await.unwrap();
    let still_running = by_type(&cards, "resource.github.profile");
    assert_eq!(still_running.status, CardStatus::Running);
}

#[tokio::test]
async fn job_status_transitions_are_sticky() {
    let (jobs, _, _, job) = setup().await;
    assert!(jobs
        .update_job_status(job.id, JobStatus::Running)
        .await
        .unwrap());
    assert!(jobs
        .update_job_status(job.id, JobStatus::Completed)
        .await
        .unwrap());
    // Terminal status refuses further transitions.
    assert!(!jobs
        .update_job_status(job.id, JobStatus::Failed)
        .await
        .unwrap());
    let reread = jobs.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(reread.status, JobStatus::Completed);
}

#[tokio::test]
async fn db_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dossier.db");

    {
        let db = Db::open(&path).await.unwrap();
        let jobs = JobStore::new(db);
        let job = Job::new(Source::Github, input(&[("content", "x")]), "github:login:x");
        let plan = vec![CardDescriptor::new("resource.github.profile")];
        jobs.create_job(&job, &plan).await.unwrap();
    }

    let db = Db::open(&path).await.unwrap();
    let jobs = JobStore::new(db);
    let outcome = jobs.claim_ready_cards(&no_caps(), 10).await.unwrap();
    assert_eq!(outcome.cards.len(), 1);
    assert_eq!(outcome.cards[0].card_type, "resource.github.profile");
}

#[tokio::test]
async fn event_seq_is_contiguous_and_replayable() {
    let (_, _, events, job) = setup().await;
    for i in 0..5 {
        let event = events
            .append_event(
                job.id,
                None,
                EventType::CardProgress,
                json!({"step": "fetching", "i": i}),
            )
            .await
            .unwrap();
        assert_eq!(event.seq, i + 1);
    }

    assert_eq!(events.last_seq(job.id).await.unwrap(), 5);

    let page = events.list_events(job.id, 2, 10).await.unwrap();
    let seqs: Vec<u64> = page.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![3, 4, 5]);
}

#[tokio::test]
async fn append_notifies_bus_subscribers() {
    let db = Db::open_in_memory().await.unwrap();
    let bus = EventBus::new();
    let events = EventStore::new(db).with_bus(bus.clone());
    let job_id = uuid::Uuid::new_v4();

    let rx = bus.subscribe(job_id);
    events
        .append_event(job_id, Some(7), EventType::CardDelta, json!({"delta": "hi"}))
        .await
        .unwrap();

    let signal = rx.try_recv().unwrap();
    assert_eq!(signal.seq, 1);
    let event = signal.event.unwrap();
    assert_eq!(event.card_id, Some(7));
    assert_eq!(event.event_type, EventType::CardDelta);
}

#[tokio::test]
async fn artifacts_upsert_and_reread() {
    let (_, artifacts, _, job) = setup().await;
    artifacts
        .save_artifact(job.id, "resource.github.profile", &json!({"user": {"id": 1}}))
        .await
        .unwrap();
    artifacts
        .save_artifact(job.id, "resource.github.profile", &json!({"user": {"id": 2}}))
        .await
        .unwrap();

    let artifact = artifacts
        .get_artifact(job.id, "resource.github.profile")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(artifact.payload["user"]["id"], 2);
    assert!(artifacts
        .get_artifact(job.id, "missing")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn resource_cache_respects_age_and_zero_disables() {
    let (_, artifacts, _, _) = setup().await;
    artifacts
        .put_cached_resource("github:login:octocat", "resource.github.data", &json!({"n": 1}))
        .await
        .unwrap();

    let hit = artifacts
        .get_cached_resource("github:login:octocat", "resource.github.data", 3)
        .await
        .unwrap();
    assert_eq!(hit.unwrap()["n"], 1);

    let disabled = artifacts
        .get_cached_resource("github:login:octocat", "resource.github.data", 0)
        .await
        .unwrap();
    assert!(disabled.is_none());

    let miss = artifacts
        .get_cached_resource("github:login:other", "resource.github.data", 3)
        .await
        .unwrap();
    assert!(miss.is_none());
}

#[tokio::test]
async fn skip_blocked_cards_strands_transitive_dependents() {
    let db = Db::open_in_memory().await.unwrap();
    let jobs = JobStore::new(db);
    let job = Job::new(Source::Github, input(&[("content", "x")]), "github:login:x");
    let plan = vec![
        CardDescriptor::new("resource.github.profile"),
        CardDescriptor::new("resource.github.data").depends_on(&["resource.github.profile"]),
        CardDescriptor::new("activity").depends_on(&["resource.github.data"]),
        CardDescriptor::new("standalone"),
    ];
    jobs.create_job(&job, &plan).await.unwrap();

    let claimed = jobs.claim_ready_cards(&no_caps(), 1).await.unwrap();
    assert_eq!(claimed.cards[0].card_type, "resource.github.profile");
    jobs.update_card_status(
        claimed.cards[0].id,
        CardStatus::Failed,
        None,
        Some((ErrorKind::UpstreamUnavailable, "boom".to_string())),
    )
    .await
    .unwrap();

    let skipped = jobs.skip_blocked_cards(job.id).await.unwrap();
    let skipped_types: Vec<&str> = skipped.iter().map(|c| c.card_type.as_str()).collect();
    assert!(skipped_types.contains(&"resource.github.data"));
    assert!(skipped_types.contains(&"activity"));
    assert!(!skipped_types.contains(&"standalone"));

    let cards = jobs.list_cards_for_job(job.id).await.unwrap();
    assert_eq!(by_type(&cards, "activity").status, CardStatus::Skipped);
    assert_eq!(by_type(&cards, "standalone").status, CardStatus::Pending);
}

#[tokio::test]
async fn create_cards_skips_existing_types() {
    let (jobs, _, _, job) = setup().await;
    let created = jobs
        .create_cards(
            job.id,
            &[
                CardDescriptor::new("resource.github.best_pr")
                    .depends_on(&["resource.github.data"])
                    .priority(1)
                    .group("llm"),
                CardDescriptor::new("profile"),
            ],
        )
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].card_type, "resource.github.best_pr");
    assert_eq!(created[0].priority, 1);
}
