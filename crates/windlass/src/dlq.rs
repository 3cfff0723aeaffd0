//! Dead letter storage.
//!
//! Jobs that exhaust their retries (when dead-lettering is enabled) are
//! copied into a per-queue store: a list of ids under
//! `{prefix}:{queue}-dead-letter` plus one hash per entry. Entries can be
//! inspected, republished to the original queue, or dropped.

use crate::error::{QueueError, QueueResult};
use crate::events::QueueEvent;
use crate::job::{JobOptions, JobRecord, JobState};
use crate::queue::Queue;
use chrono::Utc;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One dead-lettered job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Original job id.
    pub id: String,

    /// Queue the job came from.
    pub original_queue: String,

    /// Payload at the time of exhaustion.
    pub data: serde_json::Value,

    /// Submission options, kept so a republish preserves behavior.
    pub opts: JobOptions,

    /// Why the job was dead-lettered.
    pub failed_reason: String,

    /// Attempts made before exhaustion.
    pub attempts_made: u32,

    /// Bounded failure stacktraces.
    pub stacktrace: Vec<String>,

    /// When the job was moved here, unix milliseconds.
    pub moved_at: i64,

    /// Original submission time, unix milliseconds.
    pub original_timestamp: i64,
}

impl DeadLetterEntry {
    fn from_record(record: &JobRecord, reason: &str) -> Self {
        Self {
            id: record.id.as_str().to_string(),
            original_queue: record.queue_name.clone(),
            data: record.data.clone(),
            opts: record.opts.clone(),
            failed_reason: reason.to_string(),
            attempts_made: record.attempts_made,
            stacktrace: record.stacktrace.clone(),
            moved_at: Utc::now().timestamp_millis(),
            original_timestamp: record.timestamp,
        }
    }

    fn to_hash(&self) -> QueueResult<Vec<(String, String)>> {
        Ok(vec![
            ("id".into(), self.id.clone()),
            ("original_queue".into(), self.original_queue.clone()),
            ("data".into(), serde_json::to_string(&self.data)?),
            ("opts".into(), serde_json::to_string(&self.opts)?),
            ("failed_reason".into(), self.failed_reason.clone()),
            ("attempts_made".into(), self.attempts_made.to_string()),
            (
                "stacktrace".into(),
                serde_json::to_string(&self.stacktrace)?,
            ),
            ("moved_at".into(), self.moved_at.to_string()),
            (
                "original_timestamp".into(),
                self.original_timestamp.to_string(),
            ),
        ])
    }

    fn from_hash(hash: &HashMap<String, String>) -> QueueResult<Self> {
        let get = |field: &str| -> QueueResult<String> {
            hash.get(field).cloned().ok_or_else(|| {
                QueueError::Internal(format!("dead letter entry missing field: {field}"))
            })
        };

        Ok(Self {
            id: get("id")?,
            original_queue: get("original_queue")?,
            data: serde_json::from_str(&get("data")?)?,
            opts: serde_json::from_str(&get("opts")?)?,
            failed_reason: get("failed_reason")?,
            attempts_made: get("attempts_made")?
                .parse()
                .map_err(|_| QueueError::Internal("attempts_made not numeric".into()))?,
            stacktrace: serde_json::from_str(&get("stacktrace")?)?,
            moved_at: get("moved_at")?
                .parse()
                .map_err(|_| QueueError::Internal("moved_at not numeric".into()))?,
            original_timestamp: get("original_timestamp")?
                .parse()
                .map_err(|_| QueueError::Internal("original_timestamp not numeric".into()))?,
        })
    }
}

/// Dead letter store for one queue.
pub struct DeadLetterQueue {
    queue: Arc<Queue>,
}

impl DeadLetterQueue {
    /// Creates the store over the queue's keyspace.
    pub fn new(queue: Arc<Queue>) -> Self {
        Self { queue }
    }

    /// Copies an exhausted job into the store. When
    /// `remove_from_original_queue` is configured, the job also leaves the
    /// source queue's failed list and its record hash is handed off.
    pub async fn move_to_dead_letter(
        &self,
        record: &JobRecord,
        reason: &str,
    ) -> QueueResult<()> {
        let entry = DeadLetterEntry::from_record(record, reason);
        let keys = self.queue.keys();
        let id = entry.id.clone();
        let remove_original = self
            .queue
            .config()
            .dead_letter
            .remove_from_original_queue;

        let mut conn = self.queue.pool().get().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(keys.dead_letter_job(&id), &entry.to_hash()?);
        pipe.lpush(keys.dead_letter_list(), &id);
        if remove_original {
            pipe.lrem(keys.failed(), 0, &id);
            pipe.del(keys.job(&id));
        } else {
            pipe.hset(keys.job(&id), "state", JobState::DeadLetter.as_str());
        }
        let _: () = pipe.query_async(&mut *conn).await?;
        drop(conn);

        warn!(
            queue = %self.queue.name(),
            job_id = %id,
            attempts = entry.attempts_made,
            reason = %reason,
            "Job moved to dead letter queue"
        );

        self.queue.events().emit(QueueEvent::JobMovedToDeadLetter {
            queue: self.queue.name().to_string(),
            job_id: id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Range query over the store, newest first.
    pub async fn get_jobs(&self, start: isize, end: isize) -> QueueResult<Vec<DeadLetterEntry>> {
        let keys = self.queue.keys();
        let mut conn = self.queue.pool().get().await?;
        let ids: Vec<String> = conn.lrange(keys.dead_letter_list(), start, end).await?;

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let hash: HashMap<String, String> =
                conn.hgetall(keys.dead_letter_job(&id)).await?;
            if hash.is_empty() {
                continue;
            }
            entries.push(DeadLetterEntry::from_hash(&hash)?);
        }
        Ok(entries)
    }

    /// Loads one entry.
    pub async fn get_job(&self, job_id: &str) -> QueueResult<Option<DeadLetterEntry>> {
        let keys = self.queue.keys();
        let mut conn = self.queue.pool().get().await?;
        let hash: HashMap<String, String> = conn.hgetall(keys.dead_letter_job(job_id)).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        DeadLetterEntry::from_hash(&hash).map(Some)
    }

    /// Re-submits an entry to its original queue and deletes the dead
    /// letter record. With `reset_retries` the attempt counter restarts at
    /// zero; otherwise it carries over.
    pub async fn republish_job(
        &self,
        job_id: &str,
        reset_retries: bool,
    ) -> QueueResult<JobRecord> {
        let entry = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;

        let mut opts = entry.opts.clone();
        opts.job_id = Some(entry.id.clone());

        let record = self.queue.add(entry.data.clone(), opts).await?;

        let keys = self.queue.keys();
        let mut conn = self.queue.pool().get().await?;

        if !reset_retries {
            let _: () = conn
                .hset(
                    keys.job(job_id),
                    "attempts_made",
                    entry.attempts_made.to_string(),
                )
                .await?;
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.lrem(keys.dead_letter_list(), 0, job_id);
        pipe.del(keys.dead_letter_job(job_id));
        let _: () = pipe.query_async(&mut *conn).await?;
        drop(conn);

        info!(
            queue = %self.queue.name(),
            job_id = %job_id,
            reset_retries,
            "Job republished from dead letter queue"
        );

        self.queue
            .events()
            .emit(QueueEvent::JobRepublishedFromDeadLetter {
                queue: self.queue.name().to_string(),
                job_id: job_id.to_string(),
            });

        Ok(record)
    }

    /// Drops one entry. Returns false when it did not exist.
    pub async fn remove_job(&self, job_id: &str) -> QueueResult<bool> {
        let keys = self.queue.keys();
        let mut conn = self.queue.pool().get().await?;
        let removed: i64 = conn.lrem(keys.dead_letter_list(), 0, job_id).await?;
        let _: () = conn.del(keys.dead_letter_job(job_id)).await?;
        Ok(removed > 0)
    }

    /// Drops every entry. Returns how many were removed.
    pub async fn clear(&self) -> QueueResult<u64> {
        let keys = self.queue.keys();
        let mut conn = self.queue.pool().get().await?;
        let ids: Vec<String> = conn.lrange(keys.dead_letter_list(), 0, -1).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &ids {
            pipe.del(keys.dead_letter_job(id));
        }
        pipe.del(keys.dead_letter_list());
        let _: () = pipe.query_async(&mut *conn).await?;

        debug!(queue = %self.queue.name(), count = ids.len(), "Dead letter queue cleared");
        Ok(ids.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_codec_round_trip() {
        let opts: JobOptions = serde_json::from_value(json!({
            "attempts": 2,
            "deadLetter": {"enabled": true, "maxRetries": 2},
        }))
        .unwrap();
        let mut record = JobRecord::new("payments", json!({"amount": 42}), opts);
        record.record_failure("charge declined", "trace-0");
        record.record_failure("charge declined", "trace-1");

        let entry = DeadLetterEntry::from_record(&record, "charge declined");
        assert_eq!(entry.attempts_made, 2);
        assert_eq!(entry.original_queue, "payments");
        assert_eq!(entry.stacktrace.len(), 2);

        let hash: HashMap<String, String> = entry.to_hash().unwrap().into_iter().collect();
        let parsed = DeadLetterEntry::from_hash(&hash).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_entry_rejects_missing_fields() {
        let hash = HashMap::from([("id".to_string(), "x".to_string())]);
        assert!(DeadLetterEntry::from_hash(&hash).is_err());
    }
}
