//! Queue groups, batches and observables.
//!
//! A group aggregates several queues: fan-out submission and summed counts.
//! A batch tracks a set of jobs submitted together, with a derived status
//! and progress. An observable polls a group on an interval and keeps the
//! latest snapshot.

use crate::error::{QueueError, QueueResult};
use crate::events::{EventBus, QueueEvent};
use crate::id::BatchId;
use crate::job::{JobOptions, JobRecord, JobState};
use crate::queue::{JobCounts, Queue};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Derived batch status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchState {
    /// No job has started yet.
    Waiting,
    /// At least one job is running or pending.
    Active,
    /// Every job completed.
    Completed,
    /// At least one job failed terminally.
    Failed,
}

/// A set of jobs submitted together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// Batch id.
    pub id: BatchId,

    /// Queue the jobs went to.
    pub queue: String,

    /// Creation time, unix milliseconds.
    pub created_at: i64,

    /// Member job ids.
    pub job_ids: Vec<String>,
}

/// Point-in-time batch status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatus {
    /// Derived state.
    pub state: BatchState,

    /// Completed share, 0..=100.
    pub progress: u8,

    /// First failure reason, when failed.
    pub error: Option<String>,
}

/// Derives a batch status from its members' states. A missing member (the
/// record was removed or cleaned up) counts as completed.
fn derive_batch_status(members: &[Option<(JobState, Option<String>)>]) -> BatchStatus {
    if members.is_empty() {
        return BatchStatus {
            state: BatchState::Completed,
            progress: 100,
            error: None,
        };
    }

    let mut completed = 0usize;
    let mut started = false;
    let mut error = None;

    for member in members {
        match member {
            None => completed += 1,
            Some((JobState::Completed, _)) => completed += 1,
            Some((JobState::Failed | JobState::DeadLetter, reason)) => {
                if error.is_none() {
                    error = Some(reason.clone().unwrap_or_else(|| "job failed".to_string()));
                }
                started = true;
            }
            Some((JobState::Active, _)) => started = true,
            Some(_) => {}
        }
    }

    let progress = (completed * 100 / members.len()) as u8;
    let state = if error.is_some() {
        BatchState::Failed
    } else if completed == members.len() {
        BatchState::Completed
    } else if started || completed > 0 {
        BatchState::Active
    } else {
        BatchState::Waiting
    };

    BatchStatus {
        state,
        progress,
        error,
    }
}

/// A named set of queues with fan-out submission and aggregate stats.
pub struct QueueGroup {
    name: String,
    queues: RwLock<Vec<Arc<Queue>>>,
    events: Arc<EventBus>,
    settled_batches: Mutex<HashMap<String, BatchState>>,
}

impl QueueGroup {
    /// Creates an empty group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queues: RwLock::new(Vec::new()),
            events: Arc::new(EventBus::new()),
            settled_batches: Mutex::new(HashMap::new()),
        }
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The group's event channels.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Adds a queue to the group.
    pub fn add_queue(&self, queue: Arc<Queue>) {
        let queue_name = queue.name().to_string();
        self.queues.write().push(queue);
        info!(group = %self.name, queue = %queue_name, "Queue added to group");
        self.events.emit(QueueEvent::GroupCreated {
            group: self.name.clone(),
            queue: queue_name,
        });
    }

    /// Removes a queue by name. Returns false when it was not a member.
    pub fn remove_queue(&self, queue_name: &str) -> bool {
        let mut queues = self.queues.write();
        let before = queues.len();
        queues.retain(|q| q.name() != queue_name);
        let removed = queues.len() < before;
        drop(queues);

        if removed {
            info!(group = %self.name, queue = %queue_name, "Queue removed from group");
            self.events.emit(QueueEvent::GroupRemoved {
                group: self.name.clone(),
                queue: queue_name.to_string(),
            });
        }
        removed
    }

    /// Member queue names.
    pub fn queue_names(&self) -> Vec<String> {
        self.queues
            .read()
            .iter()
            .map(|q| q.name().to_string())
            .collect()
    }

    fn member(&self, queue_name: &str) -> QueueResult<Arc<Queue>> {
        self.queues
            .read()
            .iter()
            .find(|q| q.name() == queue_name)
            .cloned()
            .ok_or_else(|| {
                QueueError::Validation(format!("queue {queue_name} is not in group {}", self.name))
            })
    }

    /// Submits the same job to every member queue. Returns the records in
    /// member order.
    pub async fn add_to_all(
        &self,
        data: serde_json::Value,
        opts: JobOptions,
    ) -> QueueResult<Vec<JobRecord>> {
        let queues: Vec<Arc<Queue>> = self.queues.read().clone();
        let mut records = Vec::with_capacity(queues.len());
        for queue in queues {
            records.push(queue.add(data.clone(), opts.clone()).await?);
        }
        Ok(records)
    }

    /// Sums the counts over every member queue.
    pub async fn aggregate_counts(&self) -> QueueResult<JobCounts> {
        let queues: Vec<Arc<Queue>> = self.queues.read().clone();
        let mut totals = JobCounts::default();
        for queue in queues {
            let counts = queue.get_job_counts().await?;
            totals.waiting += counts.waiting;
            totals.active += counts.active;
            totals.completed += counts.completed;
            totals.failed += counts.failed;
            totals.delayed += counts.delayed;
            totals.paused += counts.paused;
            totals.dependency_wait += counts.dependency_wait;
            totals.dead_letter += counts.dead_letter;
        }
        Ok(totals)
    }

    /// Submits a set of jobs to one member queue as a batch.
    pub async fn add_batch(
        &self,
        queue_name: &str,
        jobs: Vec<(serde_json::Value, JobOptions)>,
    ) -> QueueResult<Batch> {
        let queue = self.member(queue_name)?;

        let mut job_ids = Vec::with_capacity(jobs.len());
        for (data, opts) in jobs {
            let record = queue.add(data, opts).await?;
            job_ids.push(record.id.as_str().to_string());
        }

        let batch = Batch {
            id: BatchId::new(),
            queue: queue_name.to_string(),
            created_at: Utc::now().timestamp_millis(),
            job_ids,
        };

        self.events.emit(QueueEvent::BatchAdded {
            batch_id: batch.id.as_str().to_string(),
            jobs: batch.job_ids.len(),
        });
        Ok(batch)
    }

    /// Computes a batch's current status and emits progress/terminal
    /// events. Terminal events fire once per batch.
    pub async fn batch_status(&self, batch: &Batch) -> QueueResult<BatchStatus> {
        let queue = self.member(&batch.queue)?;

        let mut members = Vec::with_capacity(batch.job_ids.len());
        for id in &batch.job_ids {
            let member = queue
                .get_job(id)
                .await?
                .map(|record| (record.state, record.failed_reason));
            members.push(member);
        }

        let status = derive_batch_status(&members);
        let batch_id = batch.id.as_str().to_string();

        self.events.emit(QueueEvent::BatchProgress {
            batch_id: batch_id.clone(),
            progress: status.progress,
        });

        if matches!(status.state, BatchState::Completed | BatchState::Failed) {
            let mut settled = self.settled_batches.lock();
            if settled.insert(batch_id.clone(), status.state) != Some(status.state) {
                match status.state {
                    BatchState::Completed => {
                        self.events.emit(QueueEvent::BatchCompleted { batch_id });
                    }
                    BatchState::Failed => {
                        self.events.emit(QueueEvent::BatchFailed {
                            batch_id,
                            error: status.error.clone().unwrap_or_default(),
                        });
                    }
                    _ => {}
                }
            }
        }

        Ok(status)
    }

    /// Creates an observable polling this group's queues.
    pub fn observe(&self, poll_interval: Duration) -> Observable {
        Observable::new(
            self.queues.read().clone(),
            self.events.clone(),
            poll_interval,
        )
    }
}

/// One collected group snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSnapshot {
    /// Collection time, unix milliseconds.
    pub timestamp: i64,

    /// Per-queue counts.
    pub per_queue: Vec<(String, JobCounts)>,

    /// Summed counts.
    pub totals: JobCounts,
}

/// Periodic snapshot poller over a set of queues.
pub struct Observable {
    id: String,
    queues: Vec<Arc<Queue>>,
    events: Arc<EventBus>,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    last_snapshot: Arc<RwLock<Option<GroupSnapshot>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Observable {
    fn new(queues: Vec<Arc<Queue>>, events: Arc<EventBus>, poll_interval: Duration) -> Self {
        Self {
            id: format!("observable-{}", Uuid::new_v4()),
            queues,
            events,
            poll_interval,
            running: Arc::new(AtomicBool::new(false)),
            last_snapshot: Arc::new(RwLock::new(None)),
            task: Mutex::new(None),
        }
    }

    /// Observable id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// True while polling.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The most recent snapshot, when one has been collected.
    pub fn last_snapshot(&self) -> Option<GroupSnapshot> {
        self.last_snapshot.read().clone()
    }

    /// Starts the poll task. A second start is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        self.events.emit(QueueEvent::ObservableStarted {
            observable_id: self.id.clone(),
        });

        let queues = self.queues.clone();
        let running = self.running.clone();
        let last_snapshot = self.last_snapshot.clone();
        let poll_interval = self.poll_interval;
        let id = self.id.clone();

        let task = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let mut per_queue = Vec::with_capacity(queues.len());
                let mut totals = JobCounts::default();
                let mut failed = false;

                for queue in &queues {
                    match queue.get_job_counts().await {
                        Ok(counts) => {
                            totals.waiting += counts.waiting;
                            totals.active += counts.active;
                            totals.completed += counts.completed;
                            totals.failed += counts.failed;
                            totals.delayed += counts.delayed;
                            totals.paused += counts.paused;
                            totals.dependency_wait += counts.dependency_wait;
                            totals.dead_letter += counts.dead_letter;
                            per_queue.push((queue.name().to_string(), counts));
                        }
                        Err(e) => {
                            error!(observable_id = %id, queue = %queue.name(), error = %e, "Snapshot failed");
                            failed = true;
                            break;
                        }
                    }
                }

                if !failed {
                    *last_snapshot.write() = Some(GroupSnapshot {
                        timestamp: Utc::now().timestamp_millis(),
                        per_queue,
                        totals,
                    });
                    debug!(observable_id = %id, "Snapshot collected");
                }

                tokio::time::sleep(poll_interval).await;
            }
        });

        *self.task.lock() = Some(task);
    }

    /// Stops the poll task.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.events.emit(QueueEvent::ObservableStopped {
            observable_id: self.id.clone(),
        });
    }
}

impl Drop for Observable {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(state: JobState) -> Option<(JobState, Option<String>)> {
        Some((state, None))
    }

    #[test]
    fn test_batch_status_waiting() {
        let status = derive_batch_status(&[member(JobState::Waiting), member(JobState::Delayed)]);
        assert_eq!(status.state, BatchState::Waiting);
        assert_eq!(status.progress, 0);
    }

    #[test]
    fn test_batch_status_active_and_progress() {
        let status = derive_batch_status(&[
            member(JobState::Completed),
            member(JobState::Active),
            member(JobState::Waiting),
            member(JobState::Waiting),
        ]);
        assert_eq!(status.state, BatchState::Active);
        assert_eq!(status.progress, 25);
    }

    #[test]
    fn test_batch_status_completed() {
        let status = derive_batch_status(&[member(JobState::Completed), None]);
        assert_eq!(status.state, BatchState::Completed);
        assert_eq!(status.progress, 100);
        assert!(status.error.is_none());
    }

    #[test]
    fn test_batch_status_failed_carries_reason() {
        let status = derive_batch_status(&[
            member(JobState::Completed),
            Some((JobState::Failed, Some("boom".into()))),
        ]);
        assert_eq!(status.state, BatchState::Failed);
        assert_eq!(status.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_empty_batch_is_completed() {
        let status = derive_batch_status(&[]);
        assert_eq!(status.state, BatchState::Completed);
        assert_eq!(status.progress, 100);
    }

    #[tokio::test]
    async fn test_group_membership_events() {
        let cfg = deadpool_redis::Config::from_url("redis://localhost:6379");
        let pool = cfg
            .builder()
            .unwrap()
            .runtime(deadpool_redis::Runtime::Tokio1)
            .build()
            .unwrap();
        let queue = Arc::new(Queue::with_pool(
            "members",
            pool,
            crate::config::QueueConfig::default(),
        ));

        let group = QueueGroup::new("analytics");
        let mut created_rx = group.events().subscribe(crate::events::EventKind::GroupCreated);

        group.add_queue(queue);
        assert_eq!(group.queue_names(), vec!["members"]);
        assert!(matches!(
            created_rx.recv().await.unwrap(),
            QueueEvent::GroupCreated { .. }
        ));

        assert!(group.remove_queue("members"));
        assert!(!group.remove_queue("members"));
        assert!(group.queue_names().is_empty());
    }
}
