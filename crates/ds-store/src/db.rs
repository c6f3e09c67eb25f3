use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use ds_core::{Card, CardOutput, CardStatus, ErrorKind, Job, JobStatus, Source};

use crate::error::{is_transient, Result, StoreError};

/// Shared handle to the serialized SQLite connection.
///
/// `Connection` proxies every call onto one background thread, so calls are
/// executed strictly in submission order; no two operations interleave.
#[derive(Clone)]
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a write operation, retrying transient busy/locked failures with
    /// bounded exponential backoff.
    pub(crate) async fn call_retry<T, Op, F>(&self, make_op: F) -> Result<T>
    where
        T: Send + 'static,
        Op: FnOnce(&mut rusqlite::Connection) -> tokio_rusqlite::Result<T> + Send + 'static,
        F: Fn() -> Op,
    {
        let mut delay = Duration::from_millis(20);
        let mut last_err: Option<tokio_rusqlite::Error> = None;
        for _ in 0..3 {
            match self.conn.call(make_op()).await {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) => {
                    last_err = Some(err);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => return Err(StoreError::Database(err)),
            }
        }
        Err(StoreError::Database(last_err.expect("retry loop ran")))
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;
                    PRAGMA temp_store=MEMORY;

                    CREATE TABLE IF NOT EXISTS jobs (
                        id          TEXT PRIMARY KEY,
                        source      TEXT NOT NULL,
                        status      TEXT NOT NULL,
                        subject_key TEXT NOT NULL,
                        user_id     TEXT,
                        input       TEXT NOT NULL,
                        options     TEXT NOT NULL,
                        created_at  TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                    CREATE INDEX IF NOT EXISTS idx_jobs_subject ON jobs(subject_key);

                    CREATE TABLE IF NOT EXISTS cards (
                        id                INTEGER PRIMARY KEY AUTOINCREMENT,
                        job_id            TEXT NOT NULL,
                        card_type         TEXT NOT NULL,
                        status            TEXT NOT NULL,
                        depends_on        TEXT NOT NULL,
                        priority          INTEGER NOT NULL DEFAULT 0,
                        concurrency_group TEXT NOT NULL DEFAULT '',
                        input             TEXT NOT NULL,
                        output            TEXT,
                        error_kind        TEXT,
                        error_message     TEXT,
                        attempt_count     INTEGER NOT NULL DEFAULT 0,
                        created_at        TEXT NOT NULL,
                        started_at        TEXT,
                        finished_at       TEXT,
                        UNIQUE(job_id, card_type)
                    );

                    CREATE INDEX IF NOT EXISTS idx_cards_job    ON cards(job_id);
                    CREATE INDEX IF NOT EXISTS idx_cards_status ON cards(status);

                    CREATE TABLE IF NOT EXISTS artifacts (
                        job_id     TEXT NOT NULL,
                        type       TEXT NOT NULL,
                        payload    TEXT NOT NULL,
                        created_at TEXT NOT NULL,
                        UNIQUE(job_id, type)
                    );

                    CREATE TABLE IF NOT EXISTS job_events (
                        job_id     TEXT NOT NULL,
                        seq        INTEGER NOT NULL,
                        card_id    INTEGER,
                        event_type TEXT NOT NULL,
                        payload    TEXT NOT NULL,
                        emitted_at TEXT NOT NULL,
                        UNIQUE(job_id, seq)
                    );

                    CREATE INDEX IF NOT EXISTS idx_job_events ON job_events(job_id, seq);

                    CREATE TABLE IF NOT EXISTS resource_cache (
                        subject_key TEXT NOT NULL,
                        type        TEXT NOT NULL,
                        payload     TEXT NOT NULL,
                        created_at  TEXT NOT NULL,
                        UNIQUE(subject_key, type)
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Card transition helper
// ---------------------------------------------------------------------------

pub(crate) enum CardTransition {
    Done(Option<CardOutput>),
    NotFound,
    Invalid(String),
}

/// Validate and apply one card status transition on the given connection
/// (or transaction). On `Completed` with an output, the new `data` is
/// merged over any previously persisted (prefilled) data, the card's own
/// data winning on key conflicts. Invalid transitions leave the row
/// untouched.
pub(crate) fn apply_card_transition(
    conn: &rusqlite::Connection,
    card_id: i64,
    status: CardStatus,
    output: Option<CardOutput>,
    error: &Option<(ErrorKind, String)>,
) -> rusqlite::Result<CardTransition> {
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT status, output FROM cards WHERE id = ?1",
            rusqlite::params![card_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .ok();
    let Some((current_raw, output_raw)) = row else {
        return Ok(CardTransition::NotFound);
    };
    let current: CardStatus = enum_from_sql(&current_raw);
    if !current.can_transition_to(&status) {
        return Ok(CardTransition::Invalid(format!(
            "card {card_id}: {current_raw} -> {}",
            enum_to_sql(&status)
        )));
    }

    let now = Utc::now().to_rfc3339();
    let existing: Option<CardOutput> =
        output_raw.map(|s| serde_json::from_str(&s).expect("valid json"));

    let merged = match (&status, output) {
        (CardStatus::Completed, Some(own)) => {
            let prefill = existing
                .as_ref()
                .map(|o| o.data.clone())
                .unwrap_or(serde_json::Value::Null);
            Some(CardOutput {
                data: CardOutput::merge_data(&prefill, &own.data),
                stream: if own.stream.is_null() {
                    existing.map(|o| o.stream).unwrap_or(serde_json::Value::Null)
                } else {
                    own.stream
                },
            })
        }
        (CardStatus::Completed, None) => existing,
        _ => existing,
    };

    let (error_kind, error_message) = match error {
        Some((kind, message)) => (Some(kind.as_str().to_string()), Some(message.clone())),
        None => (None, None),
    };

    conn.execute(
        "UPDATE cards SET status = ?1, output = ?2, error_kind = ?3,
            error_message = ?4, finished_at = ?5
         WHERE id = ?6",
        rusqlite::params![
            enum_to_sql(&status),
            merged
                .as_ref()
                .map(|o| serde_json::to_string(o).expect("serialize output")),
            error_kind,
            error_message,
            if status.is_terminal() { Some(now) } else { None },
            card_id,
        ],
    )?;
    Ok(CardTransition::Done(merged))
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

pub(crate) fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

pub(crate) fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid date")
        .with_timezone(&Utc)
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.map(|s| parse_ts(&s))
}

pub(crate) fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let id_str: String = row.get(0)?;
    let source_str: String = row.get(1)?;
    let status_str: String = row.get(2)?;
    let input_str: String = row.get(5)?;
    let options_str: String = row.get(6)?;
    let created_at_str: String = row.get(7)?;

    Ok(Job {
        id: Uuid::parse_str(&id_str).expect("valid uuid"),
        source: enum_from_sql::<Source>(&source_str),
        status: enum_from_sql::<JobStatus>(&status_str),
        subject_key: row.get(3)?,
        user_id: row.get(4)?,
        input: serde_json::from_str(&input_str).expect("valid json"),
        options: serde_json::from_str(&options_str).expect("valid json"),
        created_at: parse_ts(&created_at_str),
    })
}

pub(crate) const CARD_COLUMNS: &str = "id, job_id, card_type, status, depends_on, priority, \
     concurrency_group, input, output, error_kind, error_message, attempt_count, \
     created_at, started_at, finished_at";

pub(crate) fn row_to_card(row: &rusqlite::Row<'_>) -> rusqlite::Result<Card> {
    let job_id_str: String = row.get(1)?;
    let status_str: String = row.get(3)?;
    let depends_str: String = row.get(4)?;
    let input_str: String = row.get(7)?;
    let output_str: Option<String> = row.get(8)?;
    let error_kind_str: Option<String> = row.get(9)?;
    let created_at_str: String = row.get(12)?;
    let started_at_str: Option<String> = row.get(13)?;
    let finished_at_str: Option<String> = row.get(14)?;

    Ok(Card {
        id: row.get(0)?,
        job_id: Uuid::parse_str(&job_id_str).expect("valid uuid"),
        card_type: row.get(2)?,
        status: enum_from_sql::<CardStatus>(&status_str),
        depends_on: serde_json::from_str(&depends_str).expect("valid json"),
        priority: row.get(5)?,
        concurrency_group: row.get(6)?,
        input: serde_json::from_str(&input_str).expect("valid json"),
        output: output_str.map(|s| serde_json::from_str::<CardOutput>(&s).expect("valid json")),
        error_kind: error_kind_str.as_deref().and_then(ErrorKind::parse),
        error_message: row.get(10)?,
        attempt_count: row.get(11)?,
        created_at: parse_ts(&created_at_str),
        started_at: parse_opt_ts(started_at_str),
        finished_at: parse_opt_ts(finished_at_str),
    })
}
