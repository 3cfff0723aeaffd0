//! Worker loop: polling, claiming, handler dispatch and outcome commits.

use crate::dlq::DeadLetterQueue;
use crate::error::{QueueError, QueueResult};
use crate::events::QueueEvent;
use crate::job::JobRecord;
use crate::lock::{LockHandle, LockOptions};
use crate::metrics::{QueueMetrics, WorkerMetrics};
use crate::queue::Queue;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Handler invoked once per job attempt. The returned value is stored on
/// the record as `return_value`. Handlers must be idempotent: stalled
/// recovery can hand the same job out again.
pub type JobHandler =
    Arc<dyn Fn(JobRecord) -> BoxFuture<'static, Result<serde_json::Value, QueueError>> + Send + Sync>;

/// Worker statistics snapshot.
#[derive(Debug, Clone)]
pub struct WorkerStats {
    /// Worker id.
    pub id: String,

    /// Loop is running.
    pub running: bool,

    /// Target concurrency for new dispatches.
    pub concurrency: usize,

    /// Handler invocations currently in flight.
    pub in_flight: usize,

    /// Jobs completed by this worker.
    pub jobs_processed: u64,

    /// Attempts failed on this worker.
    pub jobs_failed: u64,
}

/// Shared dispatch state, owned by the worker and cloned into job tasks.
struct WorkerShared {
    id: String,
    queue: Arc<Queue>,
    dlq: DeadLetterQueue,
    handler: JobHandler,
    target_concurrency: AtomicUsize,
    in_flight: AtomicUsize,
    in_flight_ids: Mutex<HashSet<String>>,
    jobs_processed: AtomicU64,
    jobs_failed: AtomicU64,
}

/// Concurrent worker for one queue.
pub struct Worker {
    shared: Arc<WorkerShared>,
    shutdown_tx: broadcast::Sender<()>,
    running: Arc<AtomicBool>,
}

impl Worker {
    /// Creates a worker over the queue, using the queue's worker and lock
    /// configuration.
    pub fn new(queue: Arc<Queue>, handler: JobHandler) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let concurrency = queue.config().worker.concurrency;

        Self {
            shared: Arc::new(WorkerShared {
                id: format!("worker-{}", Uuid::new_v4()),
                dlq: DeadLetterQueue::new(queue.clone()),
                queue,
                handler,
                target_concurrency: AtomicUsize::new(concurrency),
                in_flight: AtomicUsize::new(0),
                in_flight_ids: Mutex::new(HashSet::new()),
                jobs_processed: AtomicU64::new(0),
                jobs_failed: AtomicU64::new(0),
            }),
            shutdown_tx,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Worker id.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Updates the concurrency target for new dispatches. In-flight jobs
    /// are never interrupted.
    pub fn adjust_concurrency(&self, concurrency: usize) {
        let previous = self
            .shared
            .target_concurrency
            .swap(concurrency, Ordering::SeqCst);
        if previous != concurrency {
            info!(
                worker_id = %self.shared.id,
                previous,
                concurrency,
                "Worker concurrency adjusted"
            );
        }
    }

    /// Current concurrency target.
    pub fn concurrency(&self) -> usize {
        self.shared.target_concurrency.load(Ordering::SeqCst)
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.shared.id.clone(),
            running: self.running.load(Ordering::SeqCst),
            concurrency: self.shared.target_concurrency.load(Ordering::SeqCst),
            in_flight: self.shared.in_flight.load(Ordering::SeqCst),
            jobs_processed: self.shared.jobs_processed.load(Ordering::Relaxed),
            jobs_failed: self.shared.jobs_failed.load(Ordering::Relaxed),
        }
    }

    /// Signals the loop to stop polling and drain.
    pub fn stop(&self) {
        info!(worker_id = %self.shared.id, "Stopping worker");
        let _ = self.shutdown_tx.send(());
    }

    /// Runs the poll loop until [`Worker::stop`] is called, then waits for
    /// in-flight jobs up to the configured shutdown budget. Jobs still
    /// running after the budget are left to the stalled checker.
    pub async fn run(&self) -> QueueResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(QueueError::Worker("worker already running".into()));
        }

        let poll_interval = self.shared.queue.config().worker.poll_interval();
        let shutdown_budget = self.shared.queue.config().worker.shutdown_timeout();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(
            worker_id = %self.shared.id,
            queue = %self.shared.queue.name(),
            concurrency = self.concurrency(),
            "Worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(poll_interval) => {
                    if let Err(e) = self.tick().await {
                        error!(worker_id = %self.shared.id, error = %e, "Worker tick failed");
                        self.shared.queue.events().emit(QueueEvent::Error {
                            queue: self.shared.queue.name().to_string(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        // Drain: in-flight handlers finish on their own tasks.
        let shared = self.shared.clone();
        let drained = timeout(shutdown_budget, async move {
            while shared.in_flight.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                worker_id = %self.shared.id,
                in_flight = self.shared.in_flight.load(Ordering::SeqCst),
                "Shutdown budget elapsed with jobs in flight"
            );
        }

        self.running.store(false, Ordering::SeqCst);
        info!(
            worker_id = %self.shared.id,
            processed = self.shared.jobs_processed.load(Ordering::Relaxed),
            failed = self.shared.jobs_failed.load(Ordering::Relaxed),
            "Worker stopped"
        );
        Ok(())
    }

    /// One poll tick: gate on pause, promote ready delayed jobs, claim up to
    /// the free slots and dispatch.
    async fn tick(&self) -> QueueResult<()> {
        let shared = &self.shared;

        if shared.queue.is_paused().await? {
            return Ok(());
        }

        shared.queue.promote_delayed().await?;

        let target = shared.target_concurrency.load(Ordering::SeqCst);
        let in_flight = shared.in_flight.load(Ordering::SeqCst);
        let slots = target.saturating_sub(in_flight);
        WorkerMetrics::update(&shared.id, target, in_flight);
        if slots == 0 {
            return Ok(());
        }

        let candidates = shared.queue.peek_waiting(slots).await?;
        for job_id in candidates {
            if shared.in_flight_ids.lock().contains(&job_id) {
                continue;
            }
            if !shared.queue.claim(&job_id).await? {
                // Another worker claimed it between peek and move.
                continue;
            }
            self.dispatch(job_id);
        }

        Ok(())
    }

    /// Spawns the handler task for one claimed job.
    fn dispatch(&self, job_id: String) {
        let shared = self.shared.clone();
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        shared.in_flight_ids.lock().insert(job_id.clone());

        tokio::spawn(
            async move {
                if let Err(e) = process_one(&shared, &job_id).await {
                    error!(job_id = %job_id, error = %e, "Job processing pipeline failed");
                    shared.queue.events().emit(QueueEvent::Error {
                        queue: shared.queue.name().to_string(),
                        message: e.to_string(),
                    });
                }
                shared.in_flight_ids.lock().remove(&job_id);
                shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            .instrument(tracing::info_span!("job", worker_id = %self.shared.id)),
        );
    }
}

/// Processes one claimed job end to end: lock, invoke, commit, release.
async fn process_one(shared: &WorkerShared, job_id: &str) -> QueueResult<()> {
    let queue = &shared.queue;
    let config = queue.config();

    // Per-job lock guards the transition out of `active`.
    let lock: Option<LockHandle> = if config.worker.disable_locks {
        None
    } else {
        let opts = LockOptions::from_config(&config.lock);
        match queue
            .locks()
            .acquire(&format!("job:{job_id}"), &opts)
            .await?
        {
            Some(handle) => Some(handle),
            None => {
                // Someone else holds the lease; hand the job back.
                warn!(job_id = %job_id, "Could not lock claimed job, returning it to waiting");
                requeue_unlocked(shared, job_id).await?;
                return Ok(());
            }
        }
    };

    let result = run_handler(shared, job_id).await;

    if let Some(handle) = lock {
        if let Err(e) = handle.release().await {
            debug!(job_id = %job_id, error = %e, "Lock release failed");
        }
    }

    result
}

/// Loads the record, invokes the handler and commits the outcome.
async fn run_handler(shared: &WorkerShared, job_id: &str) -> QueueResult<()> {
    let queue = &shared.queue;

    let Some(mut record) = queue.get_job(job_id).await? else {
        // Orphaned id without a record; drop it from active.
        warn!(job_id = %job_id, "Claimed job has no record, discarding");
        let mut conn = queue.pool().get().await?;
        let _: () =
            redis::AsyncCommands::lrem(&mut *conn, queue.keys().active(), 0, job_id).await?;
        return Ok(());
    };

    debug!(
        queue = %queue.name(),
        job_id = %job_id,
        attempt = record.attempts_made + 1,
        "Processing job"
    );

    let started = Instant::now();
    let outcome = AssertUnwindSafe((shared.handler)(record.clone()))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(QueueError::Handler("handler panicked".into())));

    match outcome {
        Ok(value) => {
            queue.commit_completed(&mut record, Some(value)).await?;
            shared.jobs_processed.fetch_add(1, Ordering::Relaxed);
            QueueMetrics::job_completed(queue.name(), started.elapsed());
            debug!(job_id = %job_id, "Job completed");
        }
        Err(e) => {
            shared.jobs_failed.fetch_add(1, Ordering::Relaxed);
            QueueMetrics::job_failed(queue.name(), started.elapsed());
            handle_failure(shared, &mut record, e).await?;
        }
    }

    Ok(())
}

/// Failure path: record the attempt, then dead-letter, retry or leave
/// failed per the job's options.
async fn handle_failure(
    shared: &WorkerShared,
    record: &mut JobRecord,
    error: QueueError,
) -> QueueResult<()> {
    let queue = &shared.queue;
    let config = queue.config();
    let reason = error.to_string();

    record.record_failure(&reason, &reason);
    queue.commit_failed(record).await?;

    warn!(
        queue = %queue.name(),
        job_id = %record.id,
        attempts = record.attempts_made,
        error = %reason,
        "Job attempt failed"
    );

    // Dead letter wins over further retries once the threshold is reached.
    let dl_threshold = record
        .opts
        .dead_letter_threshold(config.dead_letter.max_retries)
        .or_else(|| {
            config
                .dead_letter
                .enabled
                .then_some(config.dead_letter.max_retries)
        });
    if let Some(threshold) = dl_threshold {
        if record.attempts_made >= threshold {
            shared.dlq.move_to_dead_letter(record, &reason).await?;
            QueueMetrics::job_dead_lettered(queue.name());
            return Ok(());
        }
    }

    let max_attempts = record.opts.max_attempts(config.worker.default_attempts);
    if record.attempts_made < max_attempts {
        let delay = record
            .opts
            .backoff
            .map(|b| b.delay_for(record.attempts_made))
            .unwrap_or(0);
        queue.schedule_retry(record, delay).await?;
        QueueMetrics::job_retried(queue.name());
        debug!(job_id = %record.id, delay_ms = delay, "Retry scheduled");
        return Ok(());
    }

    // Terminal failure.
    if record.opts.remove_on_fail {
        let mut conn = queue.pool().get().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.lrem(queue.keys().failed(), 0, record.id.as_str());
        pipe.del(queue.keys().job(record.id.as_str()));
        let _: () = pipe.query_async(&mut *conn).await?;
    }

    Ok(())
}

/// Returns a job we claimed but could not lock to the serving end of
/// `waiting`, so another worker (or a later tick) picks it up.
async fn requeue_unlocked(shared: &WorkerShared, job_id: &str) -> QueueResult<()> {
    let queue = &shared.queue;
    let moved: i64 = queue
        .scripts()
        .move_job()
        .key(queue.keys().active())
        .key(queue.keys().waiting())
        .key(queue.keys().job(job_id))
        .arg(job_id)
        .arg(crate::job::JobState::Waiting.as_str())
        .invoke_async(&mut *queue.pool().get().await?)
        .await?;
    debug!(job_id = %job_id, moved, "Returned unlockable job to waiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use serde_json::json;

    fn test_queue() -> Arc<Queue> {
        let cfg = deadpool_redis::Config::from_url("redis://localhost:6379");
        let pool = cfg
            .builder()
            .unwrap()
            .runtime(deadpool_redis::Runtime::Tokio1)
            .build()
            .unwrap();
        Arc::new(Queue::with_pool("unit", pool, QueueConfig::default()))
    }

    fn noop_handler() -> JobHandler {
        Arc::new(|_job| async { Ok(json!(null)) }.boxed())
    }

    #[test]
    fn test_adjust_concurrency() {
        let worker = Worker::new(test_queue(), noop_handler());
        assert_eq!(worker.concurrency(), 4);

        worker.adjust_concurrency(9);
        assert_eq!(worker.concurrency(), 9);

        worker.adjust_concurrency(0);
        assert_eq!(worker.concurrency(), 0);
    }

    #[test]
    fn test_stats_snapshot() {
        let worker = Worker::new(test_queue(), noop_handler());
        let stats = worker.stats();
        assert!(!stats.running);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.jobs_processed, 0);
        assert!(stats.id.starts_with("worker-"));
    }
}
