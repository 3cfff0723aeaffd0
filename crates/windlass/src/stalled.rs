//! Stalled-job recovery.
//!
//! A job is stalled when its active lease is older than the threshold and no
//! worker holds its lock: the worker died or lost its lease mid-run. Stalled
//! jobs are re-enqueued until the stalled-retry budget runs out, then failed.
//! Recovery is idempotent, which is why handlers must be too.

use crate::error::QueueResult;
use crate::events::QueueEvent;
use crate::job::JobState;
use crate::metrics::QueueMetrics;
use crate::queue::Queue;
use chrono::Utc;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Reason recorded on jobs that stalled past their retry budget.
const STALLED_EXHAUSTED_REASON: &str = "stalled and exceeded retries";

/// Periodic checker recovering orphaned active jobs.
pub struct StalledChecker {
    queue: Arc<Queue>,
    shutdown_tx: broadcast::Sender<()>,
    running: AtomicBool,
}

impl StalledChecker {
    /// Creates a checker over the queue, using its stalled configuration.
    pub fn new(queue: Arc<Queue>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            queue,
            shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Signals the loop to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Runs the check on its configured interval until stopped.
    pub async fn run(&self) -> QueueResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let interval = self.queue.config().stalled.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(queue = %self.queue.name(), interval_ms = interval.as_millis() as u64, "Stalled checker started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.check_once().await {
                        error!(queue = %self.queue.name(), error = %e, "Stalled check failed");
                        self.queue.events().emit(QueueEvent::Error {
                            queue: self.queue.name().to_string(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue.name(), "Stalled checker stopped");
        Ok(())
    }

    /// One pass over the active list. Returns the ids that were recovered
    /// or failed.
    pub async fn check_once(&self) -> QueueResult<Vec<String>> {
        let queue = &self.queue;
        let config = queue.config();
        let threshold = config.stalled.threshold_ms as i64;
        let now = Utc::now().timestamp_millis();

        let mut conn = queue.pool().get().await?;
        let active_ids: Vec<String> = conn.lrange(queue.keys().active(), 0, -1).await?;
        drop(conn);

        let mut touched = Vec::new();

        for job_id in active_ids {
            let Some(record) = queue.get_job(&job_id).await? else {
                // Record gone; drop the orphaned id.
                let mut conn = queue.pool().get().await?;
                let _: () = conn.lrem(queue.keys().active(), 0, &job_id).await?;
                continue;
            };

            let lease_start = record.processed_on.unwrap_or(record.timestamp);
            if now - lease_start <= threshold {
                continue;
            }

            // A held lock means the original worker is alive and extending;
            // its commit path owns the transition out of active.
            if !config.worker.disable_locks
                && queue.locks().is_locked(&format!("job:{job_id}")).await?
            {
                continue;
            }

            if record.attempts_made < config.stalled.max_stalled_retries {
                self.requeue(&job_id).await?;
                touched.push(job_id);
            } else {
                self.fail_exhausted(&job_id, record.attempts_made).await?;
                touched.push(job_id);
            }
        }

        Ok(touched)
    }

    /// Moves a stalled job back to waiting and charges one attempt.
    async fn requeue(&self, job_id: &str) -> QueueResult<()> {
        let queue = &self.queue;
        let mut conn = queue.pool().get().await?;

        let moved: i64 = queue
            .scripts()
            .move_job()
            .key(queue.keys().active())
            .key(queue.keys().waiting())
            .key(queue.keys().job(job_id))
            .arg(job_id)
            .arg(JobState::Waiting.as_str())
            .invoke_async(&mut *conn)
            .await?;

        if moved != 1 {
            return Ok(());
        }

        let _: () = conn
            .hincr(queue.keys().job(job_id), "attempts_made", 1)
            .await?;

        warn!(queue = %queue.name(), job_id = %job_id, "Recovered stalled job");
        QueueMetrics::job_stalled(queue.name());
        queue.events().emit(QueueEvent::JobStalled {
            queue: queue.name().to_string(),
            job_id: job_id.to_string(),
        });
        Ok(())
    }

    /// Fails a job that stalled past its retry budget.
    async fn fail_exhausted(&self, job_id: &str, attempts: u32) -> QueueResult<()> {
        let queue = &self.queue;
        let now = Utc::now().timestamp_millis();

        let mut conn = queue.pool().get().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.lrem(queue.keys().active(), 0, job_id);
        pipe.lpush(queue.keys().failed(), job_id);
        pipe.hset(queue.keys().job(job_id), "state", JobState::Failed.as_str());
        pipe.hset(
            queue.keys().job(job_id),
            "failed_reason",
            STALLED_EXHAUSTED_REASON,
        );
        pipe.hset(queue.keys().job(job_id), "finished_on", now.to_string());
        let _: () = pipe.query_async(&mut *conn).await?;
        drop(conn);

        warn!(
            queue = %queue.name(),
            job_id = %job_id,
            attempts,
            "Stalled job exceeded retries, failing"
        );
        queue.events().emit(QueueEvent::JobFailed {
            queue: queue.name().to_string(),
            job_id: job_id.to_string(),
            reason: STALLED_EXHAUSTED_REASON.to_string(),
        });
        debug!(job_id = %job_id, "Stalled job failed");
        Ok(())
    }
}
