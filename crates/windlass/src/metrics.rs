//! Queue metrics.
//!
//! Two layers: static recorders over the `metrics` facade for exporters, and
//! a per-queue rolling-window collector (last 100 points) with an added
//! counter and a processed-rate in jobs per minute.

use crate::events::{EventKind, QueueEvent};
use crate::queue::{JobCounts, Queue};
use chrono::Utc;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Points kept per queue window.
pub const WINDOW_SIZE: usize = 100;

/// Completions inside this horizon feed the processed-rate.
const RATE_HORIZON_MS: i64 = 60_000;

/// Metric names.
pub mod names {
    /// Total jobs added.
    pub const JOBS_ADDED_TOTAL: &str = "windlass_jobs_added_total";
    /// Total jobs completed.
    pub const JOBS_COMPLETED_TOTAL: &str = "windlass_jobs_completed_total";
    /// Total jobs failed.
    pub const JOBS_FAILED_TOTAL: &str = "windlass_jobs_failed_total";
    /// Total retries scheduled.
    pub const JOBS_RETRIED_TOTAL: &str = "windlass_jobs_retried_total";
    /// Total jobs dead lettered.
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "windlass_jobs_dead_lettered_total";
    /// Total stalled recoveries.
    pub const JOBS_STALLED_TOTAL: &str = "windlass_jobs_stalled_total";

    /// Current waiting jobs.
    pub const JOBS_WAITING: &str = "windlass_jobs_waiting";
    /// Current active jobs.
    pub const JOBS_ACTIVE: &str = "windlass_jobs_active";
    /// Current delayed jobs.
    pub const JOBS_DELAYED: &str = "windlass_jobs_delayed";
    /// Current dead letter size.
    pub const JOBS_DEAD_LETTER: &str = "windlass_jobs_dead_letter";

    /// Handler duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "windlass_job_duration_seconds";

    /// Worker target concurrency.
    pub const WORKER_CONCURRENCY: &str = "windlass_worker_concurrency";
    /// Worker in-flight jobs.
    pub const WORKER_IN_FLIGHT: &str = "windlass_worker_in_flight";

    /// Whether this instance currently leads (1) or not (0).
    pub const LEADER_IS_LEADER: &str = "windlass_leader_is_leader";
    /// Workers assigned to this instance by the coordinator.
    pub const COORDINATOR_WORKERS_ASSIGNED: &str = "windlass_coordinator_workers_assigned";
}

/// Registers metric descriptions with the installed recorder.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ADDED_TOTAL, "Total number of jobs added");
    describe_counter!(names::JOBS_COMPLETED_TOTAL, "Total number of jobs completed");
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of job failures");
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of retries scheduled");
    describe_counter!(
        names::JOBS_DEAD_LETTERED_TOTAL,
        "Total number of jobs moved to the dead letter queue"
    );
    describe_counter!(
        names::JOBS_STALLED_TOTAL,
        "Total number of stalled-job recoveries"
    );

    describe_gauge!(names::JOBS_WAITING, "Current number of waiting jobs");
    describe_gauge!(names::JOBS_ACTIVE, "Current number of active jobs");
    describe_gauge!(names::JOBS_DELAYED, "Current number of delayed jobs");
    describe_gauge!(names::JOBS_DEAD_LETTER, "Current dead letter queue size");

    describe_histogram!(names::JOB_DURATION_SECONDS, "Handler duration in seconds");

    describe_gauge!(names::WORKER_CONCURRENCY, "Worker target concurrency");
    describe_gauge!(names::WORKER_IN_FLIGHT, "Worker in-flight jobs");

    describe_gauge!(
        names::LEADER_IS_LEADER,
        "Whether this instance is the leader (1) or not (0)"
    );
    describe_gauge!(
        names::COORDINATOR_WORKERS_ASSIGNED,
        "Workers assigned to this instance"
    );
}

/// Queue-level recorders.
#[derive(Clone)]
pub struct QueueMetrics;

impl QueueMetrics {
    /// Records a job added.
    pub fn job_added(queue: &str) {
        counter!(names::JOBS_ADDED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Records a completion.
    pub fn job_completed(queue: &str, duration: Duration) {
        counter!(names::JOBS_COMPLETED_TOTAL, "queue" => queue.to_string()).increment(1);
        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Records a failure.
    pub fn job_failed(queue: &str, duration: Duration) {
        counter!(names::JOBS_FAILED_TOTAL, "queue" => queue.to_string()).increment(1);
        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Records a retry scheduled.
    pub fn job_retried(queue: &str) {
        counter!(names::JOBS_RETRIED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Records a dead-lettered job.
    pub fn job_dead_lettered(queue: &str) {
        counter!(names::JOBS_DEAD_LETTERED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Records a stalled recovery.
    pub fn job_stalled(queue: &str) {
        counter!(names::JOBS_STALLED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Updates the state gauges.
    pub fn update_counts(queue: &str, counts: &JobCounts) {
        gauge!(names::JOBS_WAITING, "queue" => queue.to_string()).set(counts.waiting as f64);
        gauge!(names::JOBS_ACTIVE, "queue" => queue.to_string()).set(counts.active as f64);
        gauge!(names::JOBS_DELAYED, "queue" => queue.to_string()).set(counts.delayed as f64);
        gauge!(names::JOBS_DEAD_LETTER, "queue" => queue.to_string())
            .set(counts.dead_letter as f64);
    }
}

/// Worker-level recorders.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Updates worker gauges.
    pub fn update(worker_id: &str, concurrency: usize, in_flight: usize) {
        gauge!(names::WORKER_CONCURRENCY, "worker_id" => worker_id.to_string())
            .set(concurrency as f64);
        gauge!(names::WORKER_IN_FLIGHT, "worker_id" => worker_id.to_string())
            .set(in_flight as f64);
    }
}

/// One collected point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsPoint {
    /// Collection time, unix milliseconds.
    pub timestamp: i64,

    /// State counts at collection time.
    pub counts: JobCounts,

    /// Jobs added since the collector started.
    pub added_total: u64,

    /// Completions over the last minute.
    pub processed_per_minute: u64,
}

/// Snapshot returned by [`MetricsCollector::get_metrics`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetricsSnapshot {
    /// Queue name.
    pub queue: String,

    /// Rolling window, oldest first.
    pub points: Vec<MetricsPoint>,

    /// Latest point.
    pub current: MetricsPoint,
}

/// Rolling-window metrics collector for one queue. Listens to the queue's
/// events for the added counter and the processed-rate.
pub struct MetricsCollector {
    queue: Arc<Queue>,
    added: Arc<AtomicU64>,
    completions: Arc<Mutex<VecDeque<i64>>>,
    window: Mutex<VecDeque<MetricsPoint>>,
    listener: JoinHandle<()>,
}

impl MetricsCollector {
    /// Creates a collector and starts its event listener.
    pub fn new(queue: Arc<Queue>) -> Self {
        let added = Arc::new(AtomicU64::new(0));
        let completions = Arc::new(Mutex::new(VecDeque::new()));

        let mut added_rx = queue.events().subscribe(EventKind::JobAdded);
        let mut completed_rx = queue.events().subscribe(EventKind::JobCompleted);
        let listener_added = added.clone();
        let listener_completions = completions.clone();

        let listener = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = added_rx.recv() => match event {
                        Ok(QueueEvent::JobAdded { .. }) => {
                            listener_added.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            listener_added.fetch_add(missed, Ordering::Relaxed);
                        }
                        Err(_) => break,
                    },
                    event = completed_rx.recv() => match event {
                        Ok(QueueEvent::JobCompleted { .. }) => {
                            let now = Utc::now().timestamp_millis();
                            let mut completions = listener_completions.lock();
                            completions.push_back(now);
                            while completions
                                .front()
                                .is_some_and(|t| now - t > RATE_HORIZON_MS)
                            {
                                completions.pop_front();
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(_) => break,
                    },
                }
            }
        });

        Self {
            queue,
            added,
            completions,
            window: Mutex::new(VecDeque::new()),
            listener,
        }
    }

    /// Collects one point into the window and updates the gauges.
    pub async fn collect(&self) -> crate::error::QueueResult<MetricsPoint> {
        let counts = self.queue.get_job_counts().await?;
        let now = Utc::now().timestamp_millis();

        let processed_per_minute = {
            let completions = self.completions.lock();
            completions
                .iter()
                .filter(|t| now - **t <= RATE_HORIZON_MS)
                .count() as u64
        };

        let point = MetricsPoint {
            timestamp: now,
            counts,
            added_total: self.added.load(Ordering::Relaxed),
            processed_per_minute,
        };

        QueueMetrics::update_counts(self.queue.name(), &counts);

        let mut window = self.window.lock();
        window.push_back(point.clone());
        while window.len() > WINDOW_SIZE {
            window.pop_front();
        }

        Ok(point)
    }

    /// Collects a fresh point and returns the full snapshot.
    pub async fn get_metrics(&self) -> crate::error::QueueResult<QueueMetricsSnapshot> {
        let current = self.collect().await?;
        let points: Vec<MetricsPoint> = self.window.lock().iter().cloned().collect();

        Ok(QueueMetricsSnapshot {
            queue: self.queue.name().to_string(),
            points,
            current,
        })
    }
}

impl Drop for MetricsCollector {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics_does_not_panic() {
        register_metrics();
    }

    #[test]
    fn test_static_recorders() {
        QueueMetrics::job_added("q");
        QueueMetrics::job_completed("q", Duration::from_millis(25));
        QueueMetrics::job_failed("q", Duration::from_millis(25));
        QueueMetrics::job_retried("q");
        WorkerMetrics::update("w-1", 4, 2);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut window: VecDeque<u32> = VecDeque::new();
        for i in 0..250 {
            window.push_back(i);
            while window.len() > WINDOW_SIZE {
                window.pop_front();
            }
        }
        assert_eq!(window.len(), WINDOW_SIZE);
        assert_eq!(*window.front().unwrap(), 150);
    }
}
