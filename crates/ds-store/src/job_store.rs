use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use ds_core::{Card, CardDescriptor, CardOutput, CardStatus, ErrorKind, Job, JobStatus};

use crate::db::{
    apply_card_transition, enum_to_sql, row_to_card, row_to_job, CardTransition, Db, CARD_COLUMNS,
};
use crate::error::{Result, StoreError};

// ---------------------------------------------------------------------------
// ClaimOutcome
// ---------------------------------------------------------------------------

/// Result of one ready-card claim pass.
#[derive(Debug, Default)]
pub struct ClaimOutcome {
    /// Cards atomically moved to `running`, in dispatch order.
    pub cards: Vec<Card>,
    /// Jobs that transitioned pending→running during this claim; the
    /// scheduler emits `job.started` for each.
    pub started_jobs: Vec<Job>,
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

/// Exclusive owner of job and card rows.
#[derive(Clone)]
pub struct JobStore {
    db: Db,
}

impl JobStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert a pending job and its initial cards in one transaction.
    pub async fn create_job(&self, job: &Job, plan: &[CardDescriptor]) -> Result<Vec<Card>> {
        let job = job.clone();
        let plan = plan.to_vec();
        let cards = self
            .db
            .call_retry(move || {
                let job = job.clone();
                let plan = plan.clone();
                move |conn: &mut rusqlite::Connection| {
                    let tx = conn.transaction()?;
                    tx.execute(
                        "INSERT INTO jobs (id, source, status, subject_key, user_id, input, options, created_at)
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                        rusqlite::params![
                            job.id.to_string(),
                            enum_to_sql(&job.source),
                            enum_to_sql(&job.status),
                            job.subject_key,
                            job.user_id,
                            serde_json::to_string(&job.input).expect("serialize input"),
                            serde_json::to_string(&job.options).expect("serialize options"),
                            job.created_at.to_rfc3339(),
                        ],
                    )?;
                    let now = Utc::now().to_rfc3339();
                    for descriptor in &plan {
                        tx.execute(
                            "INSERT INTO cards (job_id, card_type, status, depends_on, priority,
                                concurrency_group, input, attempt_count, created_at)
                             VALUES (?1,?2,'pending',?3,?4,?5,?6,0,?7)",
                            rusqlite::params![
                                job.id.to_string(),
                                descriptor.card_type,
                                serde_json::to_string(&descriptor.depends_on)
                                    .expect("serialize deps"),
                                descriptor.priority,
                                descriptor.concurrency_group,
                                serde_json::to_string(&descriptor.input)
                                    .expect("serialize input"),
                                now,
                            ],
                        )?;
                    }
                    let cards = select_cards_for_job(&tx, job.id)?;
                    tx.commit()?;
                    Ok(cards)
                }
            })
            .await?;
        Ok(cards)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let id_str = id.to_string();
        let job = self
            .db
            .conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, source, status, subject_key, user_id, input, options, created_at
                     FROM jobs WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_job(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(job)
    }

    pub async fn update_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<bool> {
        let outcome = self
            .db
            .call_retry(move || {
                move |conn: &mut rusqlite::Connection| {
                    let current: Option<String> = conn
                        .query_row(
                            "SELECT status FROM jobs WHERE id = ?1",
                            rusqlite::params![job_id.to_string()],
                            |r| r.get(0),
                        )
                        .ok();
                    let Some(current) = current else {
                        return Ok(false);
                    };
                    let current: JobStatus = crate::db::enum_from_sql(&current);
                    // Terminal job states are sticky.
                    if current.is_terminal() || current == status {
                        return Ok(false);
                    }
                    conn.execute(
                        "UPDATE jobs SET status = ?1 WHERE id = ?2",
                        rusqlite::params![enum_to_sql(&status), job_id.to_string()],
                    )?;
                    Ok(true)
                }
            })
            .await?;
        Ok(outcome)
    }

    pub async fn list_cards_for_job(&self, job_id: Uuid) -> Result<Vec<Card>> {
        let cards = self
            .db
            .conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let cards = select_cards_for_job(&tx, job_id)?;
                tx.commit()?;
                Ok(cards)
            })
            .await?;
        Ok(cards)
    }

    pub async fn get_card(&self, card_id: i64) -> Result<Option<Card>> {
        let card = self
            .db
            .conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CARD_COLUMNS} FROM cards WHERE id = ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![card_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_card(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(card)
    }

    /// Atomically promote dependency-satisfied pending cards to `ready`,
    /// then claim up to `limit` ready cards as `running`, never exceeding a
    /// concurrency-group cap counted across all jobs.
    ///
    /// Claim order is `(priority asc, created_at asc)`. Jobs touched for the
    /// first time transition pending→running and are reported for
    /// `job.started` emission.
    pub async fn claim_ready_cards(
        &self,
        caps: &HashMap<String, usize>,
        limit: usize,
    ) -> Result<ClaimOutcome> {
        let caps = caps.clone();
        let outcome = self
            .db
            .call_retry(move || {
                let caps = caps.clone();
                move |conn: &mut rusqlite::Connection| {
                    let tx = conn.transaction()?;

                    // 1) Promote pending cards whose dependencies completed.
                    let mut completed: HashSet<(String, String)> = HashSet::new();
                    {
                        let mut stmt = tx.prepare(
                            "SELECT job_id, card_type FROM cards WHERE status = 'completed'",
                        )?;
                        let mut rows = stmt.query([])?;
                        while let Some(row) = rows.next()? {
                            completed.insert((row.get(0)?, row.get(1)?));
                        }
                    }
                    let mut promote: Vec<i64> = Vec::new();
                    {
                        let mut stmt = tx.prepare(
                            "SELECT id, job_id, depends_on FROM cards WHERE status = 'pending'",
                        )?;
                        let mut rows = stmt.query([])?;
                        while let Some(row) = rows.next()? {
                            let id: i64 = row.get(0)?;
                            let job_id: String = row.get(1)?;
                            let deps_raw: String = row.get(2)?;
                            let deps: Vec<String> =
                                serde_json::from_str(&deps_raw).expect("valid json");
                            if deps
                                .iter()
                                .all(|d| completed.contains(&(job_id.clone(), d.clone())))
                            {
                                promote.push(id);
                            }
                        }
                    }
                    for id in &promote {
                        tx.execute(
                            "UPDATE cards SET status = 'ready' WHERE id = ?1 AND status = 'pending'",
                            rusqlite::params![id],
                        )?;
                    }

                    // 2) Current running load per concurrency group.
                    let mut running: HashMap<String, usize> = HashMap::new();
                    {
                        let mut stmt = tx.prepare(
                            "SELECT concurrency_group, COUNT(*) FROM cards
                             WHERE status = 'running' GROUP BY concurrency_group",
                        )?;
                        let mut rows = stmt.query([])?;
                        while let Some(row) = rows.next()? {
                            let group: String = row.get(0)?;
                            let count: i64 = row.get(1)?;
                            running.insert(group, count as usize);
                        }
                    }

                    // 3) Claim in priority order, respecting caps.
                    let mut ready: Vec<Card> = Vec::new();
                    {
                        let mut stmt = tx.prepare(&format!(
                            "SELECT {CARD_COLUMNS} FROM cards WHERE status = 'ready'
                             ORDER BY priority ASC, created_at ASC, id ASC"
                        ))?;
                        let mut rows = stmt.query([])?;
                        while let Some(row) = rows.next()? {
                            ready.push(row_to_card(row)?);
                        }
                    }
                    let now = Utc::now();
                    let mut claimed: Vec<Card> = Vec::new();
                    for mut card in ready {
                        if claimed.len() >= limit {
                            break;
                        }
                        let group = card.concurrency_group.clone();
                        if !group.is_empty() {
                            if let Some(cap) = caps.get(&group) {
                                let used = running.get(&group).copied().unwrap_or(0);
                                if used >= *cap {
                                    continue;
                                }
                            }
                        }
                        tx.execute(
                            "UPDATE cards SET status = 'running',
                                attempt_count = attempt_count + 1, started_at = ?1
                             WHERE id = ?2",
                            rusqlite::params![now.to_rfc3339(), card.id],
                        )?;
                        if !group.is_empty() {
                            *running.entry(group).or_insert(0) += 1;
                        }
                        card.status = CardStatus::Running;
                        card.attempt_count += 1;
                        card.started_at = Some(now);
                        claimed.push(card);
                    }

                    // 4) First dispatch for a job flips it to running.
                    let mut started_jobs: Vec<Job> = Vec::new();
                    let mut seen: HashSet<Uuid> = HashSet::new();
                    for card in &claimed {
                        if !seen.insert(card.job_id) {
                            continue;
                        }
                        let mut stmt = tx.prepare(
                            "SELECT id, source, status, subject_key, user_id, input, options, created_at
                             FROM jobs WHERE id = ?1",
                        )?;
                        let mut rows = stmt.query(rusqlite::params![card.job_id.to_string()])?;
                        if let Some(row) = rows.next()? {
                            let mut job = row_to_job(row)?;
                            if job.status == JobStatus::Pending {
                                tx.execute(
                                    "UPDATE jobs SET status = 'running' WHERE id = ?1",
                                    rusqlite::params![job.id.to_string()],
                                )?;
                                job.status = JobStatus::Running;
                                started_jobs.push(job);
                            }
                        }
                    }

                    tx.commit()?;
                    Ok(ClaimOutcome {
                        cards: claimed,
                        started_jobs,
                    })
                }
            })
            .await?;

        if !outcome.cards.is_empty() {
            debug!(claimed = outcome.cards.len(), "claimed ready cards");
        }
        Ok(outcome)
    }

    /// Transition a card. On `Completed` with an output, the new `data` is
    /// merged over any previously persisted (prefilled) data (the card's
    /// own data wins on key conflicts) and the merged envelope is returned.
    ///
    /// Invalid transitions leave the row untouched.
    pub async fn update_card_status(
        &self,
        card_id: i64,
        status: CardStatus,
        output: Option<CardOutput>,
        error: Option<(ErrorKind, String)>,
    ) -> Result<Option<CardOutput>> {
        let result = self
            .db
            .call_retry(move || {
                let output = output.clone();
                let error = error.clone();
                move |conn: &mut rusqlite::Connection| {
                    let tx = conn.transaction()?;
                    let result = apply_card_transition(&tx, card_id, status, output, &error)?;
                    tx.commit()?;
                    Ok(result)
                }
            })
            .await?;

        match result {
            CardTransition::Done(merged) => Ok(merged),
            CardTransition::NotFound => Err(StoreError::NotFound(format!("card {card_id}"))),
            CardTransition::Invalid(msg) => Err(StoreError::InvalidTransition(msg)),
        }
    }

    /// Record prefilled data against a card that has not run yet. Later
    /// prefills merge over earlier ones; the card's own completion merges
    /// over all of them.
    pub async fn apply_prefill(&self, card_id: i64, data: Value) -> Result<()> {
        self.db
            .call_retry(move || {
                let data = data.clone();
                move |conn: &mut rusqlite::Connection| {
                    let output_raw: Option<Option<String>> = conn
                        .query_row(
                            "SELECT output FROM cards WHERE id = ?1",
                            rusqlite::params![card_id],
                            |r| r.get(0),
                        )
                        .ok();
                    let Some(output_raw) = output_raw else {
                        return Ok(());
                    };
                    let existing: CardOutput = output_raw
                        .map(|s| serde_json::from_str(&s).expect("valid json"))
                        .unwrap_or_default();
                    let merged = CardOutput {
                        data: CardOutput::merge_data(&existing.data, &data),
                        stream: existing.stream,
                    };
                    conn.execute(
                        "UPDATE cards SET output = ?1 WHERE id = ?2",
                        rusqlite::params![
                            serde_json::to_string(&merged).expect("serialize output"),
                            card_id
                        ],
                    )?;
                    Ok(())
                }
            })
            .await?;
        Ok(())
    }

    /// Append additional cards to an existing job (deferred refinement).
    /// Card types already present are skipped.
    pub async fn create_cards(
        &self,
        job_id: Uuid,
        descriptors: &[CardDescriptor],
    ) -> Result<Vec<Card>> {
        let descriptors = descriptors.to_vec();
        let created = self
            .db
            .call_retry(move || {
                let descriptors = descriptors.clone();
                move |conn: &mut rusqlite::Connection| {
                    let tx = conn.transaction()?;
                    let now = Utc::now().to_rfc3339();
                    let mut created_types: Vec<String> = Vec::new();
                    for descriptor in &descriptors {
                        let inserted = tx.execute(
                            "INSERT OR IGNORE INTO cards (job_id, card_type, status, depends_on,
                                priority, concurrency_group, input, attempt_count, created_at)
                             VALUES (?1,?2,'pending',?3,?4,?5,?6,0,?7)",
                            rusqlite::params![
                                job_id.to_string(),
                                descriptor.card_type,
                                serde_json::to_string(&descriptor.depends_on)
                                    .expect("serialize deps"),
                                descriptor.priority,
                                descriptor.concurrency_group,
                                serde_json::to_string(&descriptor.input)
                                    .expect("serialize input"),
                                now,
                            ],
                        )?;
                        if inserted > 0 {
                            created_types.push(descriptor.card_type.clone());
                        }
                    }
                    let mut out = Vec::new();
                    for card_type in created_types {
                        let mut stmt = tx.prepare(&format!(
                            "SELECT {CARD_COLUMNS} FROM cards WHERE job_id = ?1 AND card_type = ?2"
                        ))?;
                        let mut rows =
                            stmt.query(rusqlite::params![job_id.to_string(), card_type])?;
                        if let Some(row) = rows.next()? {
                            out.push(row_to_card(row)?);
                        }
                    }
                    tx.commit()?;
                    Ok(out)
                }
            })
            .await?;
        Ok(created)
    }

    /// Put a running card back on the ready queue (retry after a transient
    /// failure). The attempt count keeps its claimed increments.
    pub async fn requeue_card(&self, card_id: i64) -> Result<()> {
        self.db
            .call_retry(move || {
                move |conn: &mut rusqlite::Connection| {
                    conn.execute(
                        "UPDATE cards SET status = 'ready', started_at = NULL
                         WHERE id = ?1 AND status = 'running'",
                        rusqlite::params![card_id],
                    )?;
                    Ok(())
                }
            })
            .await?;
        Ok(())
    }

    /// Skip every pending card whose dependency chain can no longer
    /// complete (a dependency failed, was cancelled, or was itself
    /// skipped). Returns the skipped cards.
    ///
    /// Skipped cards are terminal without their own lifecycle events; they
    /// simply unblock job finalization.
    pub async fn skip_blocked_cards(&self, job_id: Uuid) -> Result<Vec<Card>> {
        let skipped = self
            .db
            .call_retry(move || {
                move |conn: &mut rusqlite::Connection| {
                    let tx = conn.transaction()?;
                    let mut cards = select_cards_for_job(&tx, job_id)?;
                    let mut dead: HashSet<String> = cards
                        .iter()
                        .filter(|c| {
                            matches!(
                                c.status,
                                CardStatus::Failed | CardStatus::Cancelled | CardStatus::Skipped
                            )
                        })
                        .map(|c| c.card_type.clone())
                        .collect();

                    // Propagate to a fixpoint: skipping a card can strand
                    // its own dependents.
                    let mut skipped: Vec<Card> = Vec::new();
                    loop {
                        let mut changed = false;
                        for card in cards.iter_mut() {
                            if card.status != CardStatus::Pending {
                                continue;
                            }
                            if card.depends_on.iter().any(|d| dead.contains(d)) {
                                card.status = CardStatus::Skipped;
                                dead.insert(card.card_type.clone());
                                skipped.push(card.clone());
                                changed = true;
                            }
                        }
                        if !changed {
                            break;
                        }
                    }

                    let now = Utc::now().to_rfc3339();
                    for card in &skipped {
                        tx.execute(
                            "UPDATE cards SET status = 'skipped', finished_at = ?1
                             WHERE id = ?2 AND status = 'pending'",
                            rusqlite::params![now, card.id],
                        )?;
                    }
                    tx.commit()?;
                    Ok(skipped)
                }
            })
            .await?;
        Ok(skipped)
    }

    /// Cancel every pending/ready card of a job, returning the cancelled
    /// cards for event emission.
    pub async fn cancel_pending_cards(&self, job_id: Uuid) -> Result<Vec<Card>> {
        let cancelled = self
            .db
            .call_retry(move || {
                move |conn: &mut rusqlite::Connection| {
                    let tx = conn.transaction()?;
                    let mut cards: Vec<Card> = Vec::new();
                    {
                        let mut stmt = tx.prepare(&format!(
                            "SELECT {CARD_COLUMNS} FROM cards
                             WHERE job_id = ?1 AND status IN ('pending','ready')
                             ORDER BY id ASC"
                        ))?;
                        let mut rows = stmt.query(rusqlite::params![job_id.to_string()])?;
                        while let Some(row) = rows.next()? {
                            cards.push(row_to_card(row)?);
                        }
                    }
                    let now = Utc::now();
                    for card in &mut cards {
                        tx.execute(
                            "UPDATE cards SET status = 'cancelled', finished_at = ?1
                             WHERE id = ?2",
                            rusqlite::params![now.to_rfc3339(), card.id],
                        )?;
                        card.status = CardStatus::Cancelled;
                        card.finished_at = Some(now);
                    }
                    tx.commit()?;
                    Ok(cards)
                }
            })
            .await?;
        Ok(cancelled)
    }
}

fn select_cards_for_job(
    tx: &rusqlite::Transaction<'_>,
    job_id: Uuid,
) -> rusqlite::Result<Vec<Card>> {
    let mut stmt = tx.prepare(&format!(
        "SELECT {CARD_COLUMNS} FROM cards WHERE job_id = ?1 ORDER BY id ASC"
    ))?;
    let mut rows = stmt.query(rusqlite::params![job_id.to_string()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_card(row)?);
    }
    Ok(out)
}
