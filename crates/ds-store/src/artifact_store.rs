use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::db::{parse_ts, Db};
use crate::error::Result;

/// Typed blob attached to a job.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub job_id: Uuid,
    pub artifact_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Exclusive owner of artifact rows, plus the cross-job resource cache.
///
/// Payloads are opaque to the store. `(job_id, type)` is upserted:
/// write-then-stable; consumers re-read freely.
#[derive(Clone)]
pub struct ArtifactStore {
    db: Db,
}

impl ArtifactStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn save_artifact(
        &self,
        job_id: Uuid,
        artifact_type: &str,
        payload: &Value,
    ) -> Result<()> {
        let artifact_type = artifact_type.to_string();
        let payload = payload.clone();
        self.db
            .call_retry(move || {
                let artifact_type = artifact_type.clone();
                let payload = payload.clone();
                move |conn: &mut rusqlite::Connection| {
                    conn.execute(
                        "INSERT INTO artifacts (job_id, type, payload, created_at)
                         VALUES (?1,?2,?3,?4)
                         ON CONFLICT(job_id, type) DO UPDATE SET
                            payload = excluded.payload, created_at = excluded.created_at",
                        rusqlite::params![
                            job_id.to_string(),
                            artifact_type,
                            serde_json::to_string(&payload).expect("serialize payload"),
                            Utc::now().to_rfc3339(),
                        ],
                    )?;
                    Ok(())
                }
            })
            .await?;
        Ok(())
    }

    pub async fn get_artifact(
        &self,
        job_id: Uuid,
        artifact_type: &str,
    ) -> Result<Option<Artifact>> {
        let artifact_type = artifact_type.to_string();
        let artifact = self
            .db
            .conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT job_id, type, payload, created_at FROM artifacts
                     WHERE job_id = ?1 AND type = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![job_id.to_string(), artifact_type])?;
                match rows.next()? {
                    Some(row) => {
                        let job_id_str: String = row.get(0)?;
                        let payload_str: String = row.get(2)?;
                        let created_at_str: String = row.get(3)?;
                        Ok(Some(Artifact {
                            job_id: Uuid::parse_str(&job_id_str).expect("valid uuid"),
                            artifact_type: row.get(1)?,
                            payload: serde_json::from_str(&payload_str).expect("valid json"),
                            created_at: parse_ts(&created_at_str),
                        }))
                    }
                    None => Ok(None),
                }
            })
            .await?;
        Ok(artifact)
    }

    // -----------------------------------------------------------------------
    // Resource cache (cross-job, subject-keyed)
    // -----------------------------------------------------------------------

    /// Fresh cached payload for `(subject_key, type)`, if any entry is
    /// younger than `max_age_days`. A zero age disables the cache.
    pub async fn get_cached_resource(
        &self,
        subject_key: &str,
        resource_type: &str,
        max_age_days: u32,
    ) -> Result<Option<Value>> {
        if max_age_days == 0 {
            return Ok(None);
        }
        let subject_key = subject_key.to_string();
        let resource_type = resource_type.to_string();
        let cutoff = Utc::now() - Duration::days(i64::from(max_age_days));
        let payload = self
            .db
            .conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT payload, created_at FROM resource_cache
                     WHERE subject_key = ?1 AND type = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![subject_key, resource_type])?;
                match rows.next()? {
                    Some(row) => {
                        let payload_str: String = row.get(0)?;
                        let created_at_str: String = row.get(1)?;
                        if parse_ts(&created_at_str) < cutoff {
                            Ok(None)
                        } else {
                            Ok(Some(
                                serde_json::from_str(&payload_str).expect("valid json"),
                            ))
                        }
                    }
                    None => Ok(None),
                }
            })
            .await?;
        Ok(payload)
    }

    pub async fn put_cached_resource(
        &self,
        subject_key: &str,
        resource_type: &str,
        payload: &Value,
    ) -> Result<()> {
        let subject_key = subject_key.to_string();
        let resource_type = resource_type.to_string();
        let payload = payload.clone();
        self.db
            .call_retry(move || {
                let subject_key = subject_key.clone();
                let resource_type = resource_type.clone();
                let payload = payload.clone();
                move |conn: &mut rusqlite::Connection| {
                    conn.execute(
                        "INSERT INTO resource_cache (subject_key, type, payload, created_at)
                         VALUES (?1,?2,?3,?4)
                         ON CONFLICT(subject_key, type) DO UPDATE SET
                            payload = excluded.payload, created_at = excluded.created_at",
                        rusqlite::params![
                            subject_key,
                            resource_type,
                            serde_json::to_string(&payload).expect("serialize payload"),
                            Utc::now().to_rfc3339(),
                        ],
                    )?;
                    Ok(())
                }
            })
            .await?;
        Ok(())
    }
}
