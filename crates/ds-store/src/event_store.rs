use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use ds_bus::{Backplane, BusSignal, EventBus};
use ds_core::events::payloads;
use ds_core::{CardOutput, CardStatus, ErrorKind, EventType, JobEvent};

use crate::db::{apply_card_transition, parse_ts, CardTransition, Db};
use crate::error::{Result, StoreError};

/// Terminal event appended atomically with a card's status transition.
#[derive(Debug, Clone)]
pub enum CardTransitionEvent {
    Completed {
        internal: bool,
        duration_ms: u64,
        meta: Option<Value>,
    },
    Failed {
        retryable: bool,
    },
    Cancelled,
}

/// Exclusive owner of the append-only per-job event log, the source of
/// truth for streaming.
///
/// `append_event` assigns the next contiguous `seq` inside one serialized
/// call, then notifies the in-process bus and (if configured) the backplane.
/// Bus and backplane delivery are best-effort; replay always comes from the
/// log.
#[derive(Clone)]
pub struct EventStore {
    db: Db,
    bus: Option<EventBus>,
    backplane: Option<Arc<dyn Backplane>>,
}

impl EventStore {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            bus: None,
            backplane: None,
        }
    }

    /// Attach the in-process bus notified after each append.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Attach the optional cross-process backplane.
    pub fn with_backplane(mut self, backplane: Arc<dyn Backplane>) -> Self {
        self.backplane = Some(backplane);
        self
    }

    pub async fn append_event(
        &self,
        job_id: Uuid,
        card_id: Option<i64>,
        event_type: EventType,
        payload: Value,
    ) -> Result<JobEvent> {
        let emitted_at = Utc::now();
        let payload_for_insert = payload.clone();
        let seq = self
            .db
            .call_retry(move || {
                let payload = payload_for_insert.clone();
                move |conn: &mut rusqlite::Connection| {
                    let tx = conn.transaction()?;
                    let seq: i64 = tx.query_row(
                        "SELECT COALESCE(MAX(seq), 0) + 1 FROM job_events WHERE job_id = ?1",
                        rusqlite::params![job_id.to_string()],
                        |r| r.get(0),
                    )?;
                    tx.execute(
                        "INSERT INTO job_events (job_id, seq, card_id, event_type, payload, emitted_at)
                         VALUES (?1,?2,?3,?4,?5,?6)",
                        rusqlite::params![
                            job_id.to_string(),
                            seq,
                            card_id,
                            event_type.as_str(),
                            serde_json::to_string(&payload).expect("serialize payload"),
                            emitted_at.to_rfc3339(),
                        ],
                    )?;
                    tx.commit()?;
                    Ok(seq as u64)
                }
            })
            .await?;

        let event = JobEvent {
            job_id,
            seq,
            card_id,
            event_type,
            payload,
            emitted_at,
        };

        if let Some(bus) = &self.bus {
            bus.publish(BusSignal::full(Arc::new(event.clone())));
        }
        if let Some(backplane) = &self.backplane {
            backplane.publish(&event);
        }

        Ok(event)
    }

    /// Apply a terminal card transition and append its event in one
    /// serialized transaction.
    ///
    /// Dependents become claimable the moment a card row reads `completed`,
    /// so the row update and the `card.completed` append must be atomic: a
    /// consumer that observes the event can always replay the final payload,
    /// and no dependent's `card.started` can slip in between.
    #[allow(clippy::too_many_arguments)]
    pub async fn append_card_transition(
        &self,
        job_id: Uuid,
        card_id: i64,
        card_type: &str,
        status: CardStatus,
        output: Option<CardOutput>,
        error: Option<(ErrorKind, String)>,
        event: CardTransitionEvent,
    ) -> Result<JobEvent> {
        enum TxOutcome {
            Done(JobEvent),
            NotFound,
            Invalid(String),
        }

        let card_type = card_type.to_string();
        let emitted_at = Utc::now();
        let outcome = self
            .db
            .call_retry(move || {
                let card_type = card_type.clone();
                let output = output.clone();
                let error = error.clone();
                let event = event.clone();
                move |conn: &mut rusqlite::Connection| {
                    let tx = conn.transaction()?;
                    let transition =
                        apply_card_transition(&tx, card_id, status, output, &error)?;
                    let merged = match transition {
                        CardTransition::Done(merged) => merged,
                        CardTransition::NotFound => return Ok(TxOutcome::NotFound),
                        CardTransition::Invalid(msg) => return Ok(TxOutcome::Invalid(msg)),
                    };

                    let payload = match event {
                        CardTransitionEvent::Completed {
                            internal,
                            duration_ms,
                            meta,
                        } => payloads::card_completed(
                            &card_type,
                            &merged.unwrap_or_default(),
                            internal,
                            duration_ms,
                            meta,
                        ),
                        CardTransitionEvent::Failed { retryable } => {
                            let (kind, message) = error.unwrap_or((
                                ErrorKind::Internal,
                                "card failed".to_string(),
                            ));
                            payloads::card_failed(&card_type, kind, &message, retryable)
                        }
                        CardTransitionEvent::Cancelled => payloads::card_cancelled(&card_type),
                    };

                    let seq: i64 = tx.query_row(
                        "SELECT COALESCE(MAX(seq), 0) + 1 FROM job_events WHERE job_id = ?1",
                        rusqlite::params![job_id.to_string()],
                        |r| r.get(0),
                    )?;
                    let event_type = match status {
                        CardStatus::Completed => EventType::CardCompleted,
                        CardStatus::Cancelled => EventType::CardCancelled,
                        _ => EventType::CardFailed,
                    };
                    tx.execute(
                        "INSERT INTO job_events (job_id, seq, card_id, event_type, payload, emitted_at)
                         VALUES (?1,?2,?3,?4,?5,?6)",
                        rusqlite::params![
                            job_id.to_string(),
                            seq,
                            card_id,
                            event_type.as_str(),
                            serde_json::to_string(&payload).expect("serialize payload"),
                            emitted_at.to_rfc3339(),
                        ],
                    )?;
                    tx.commit()?;
                    Ok(TxOutcome::Done(JobEvent {
                        job_id,
                        seq: seq as u64,
                        card_id: Some(card_id),
                        event_type,
                        payload,
                        emitted_at,
                    }))
                }
            })
            .await?;

        let event = match outcome {
            TxOutcome::Done(event) => event,
            TxOutcome::NotFound => return Err(StoreError::NotFound(format!("card {card_id}"))),
            TxOutcome::Invalid(msg) => return Err(StoreError::InvalidTransition(msg)),
        };

        if let Some(bus) = &self.bus {
            bus.publish(BusSignal::full(Arc::new(event.clone())));
        }
        if let Some(backplane) = &self.backplane {
            backplane.publish(&event);
        }

        Ok(event)
    }

    /// Page stored events with `seq > after_seq`, oldest first.
    pub async fn list_events(
        &self,
        job_id: Uuid,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<JobEvent>> {
        let events = self
            .db
            .conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT job_id, seq, card_id, event_type, payload, emitted_at
                     FROM job_events WHERE job_id = ?1 AND seq > ?2
                     ORDER BY seq ASC LIMIT ?3",
                )?;
                let mut rows = stmt.query(rusqlite::params![
                    job_id.to_string(),
                    after_seq as i64,
                    limit as i64
                ])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let job_id_str: String = row.get(0)?;
                    let seq: i64 = row.get(1)?;
                    let event_type_str: String = row.get(3)?;
                    let payload_str: String = row.get(4)?;
                    let emitted_at_str: String = row.get(5)?;
                    out.push(JobEvent {
                        job_id: Uuid::parse_str(&job_id_str).expect("valid uuid"),
                        seq: seq as u64,
                        card_id: row.get(2)?,
                        event_type: EventType::parse(&event_type_str)
                            .expect("known event type"),
                        payload: serde_json::from_str(&payload_str).expect("valid json"),
                        emitted_at: parse_ts(&emitted_at_str),
                    });
                }
                Ok(out)
            })
            .await?;
        Ok(events)
    }

    /// Highest assigned `seq` for a job (0 when no events exist).
    pub async fn last_seq(&self, job_id: Uuid) -> Result<u64> {
        let seq = self
            .db
            .conn()
            .call(move |conn| {
                let seq: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(seq), 0) FROM job_events WHERE job_id = ?1",
                    rusqlite::params![job_id.to_string()],
                    |r| r.get(0),
                )?;
                Ok(seq as u64)
            })
            .await?;
        Ok(seq)
    }
}
