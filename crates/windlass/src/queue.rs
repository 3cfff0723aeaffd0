//! Queue submission, queries and state transitions.
//!
//! List/zset members are job ids; the job hash is the record of truth. The
//! waiting list is consumed from the tail, so FIFO submission pushes to the
//! head and everything that should run next (LIFO submission, promotions,
//! immediate retries) pushes to the tail.

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::events::{EventBus, QueueEvent};
use crate::job::{JobOptions, JobRecord, JobState};
use crate::lock::LockManager;
use crate::rate_limit::{RateLimitOptions, RateLimiter};
use crate::redis::{create_pool, QueueScripts, RedisKeys};
use chrono::Utc;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counts per state structure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: u64,
    pub dependency_wait: u64,
    pub dead_letter: u64,
}

/// Where a fresh submission lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Delayed,
    DependencyWait,
    Priority(u32),
    Waiting,
}

/// A named job queue backed by Redis.
pub struct Queue {
    name: String,
    pool: Pool,
    keys: RedisKeys,
    scripts: QueueScripts,
    config: QueueConfig,
    events: Arc<EventBus>,
    locks: LockManager,
    limiter: Option<RateLimiter>,
    priority_levels: Option<u32>,
}

impl Queue {
    /// Creates a queue over an existing pool.
    pub fn with_pool(name: impl Into<String>, pool: Pool, config: QueueConfig) -> Self {
        let name = name.into();
        let keys = RedisKeys::new(&config.redis.key_prefix, &name);
        let locks = LockManager::new(
            pool.clone(),
            format!("{}:{}", config.redis.key_prefix, name),
        );

        Self {
            name,
            pool,
            keys,
            scripts: QueueScripts::new(),
            config,
            events: Arc::new(EventBus::new()),
            locks,
            limiter: None,
            priority_levels: None,
        }
    }

    /// Connects to Redis (validating with PING) and creates the queue.
    pub async fn connect(name: impl Into<String>, config: QueueConfig) -> QueueResult<Self> {
        let pool = create_pool(&config.redis).await?;
        let queue = Self::with_pool(name, pool, config);
        queue.events.emit(QueueEvent::Ready {
            queue: queue.name.clone(),
        });
        Ok(queue)
    }

    /// Attaches a sliding-window rate limiter to submissions.
    pub fn with_rate_limiter(mut self, opts: RateLimitOptions) -> Self {
        self.limiter = Some(RateLimiter::new(
            self.pool.clone(),
            self.keys.clone(),
            opts,
        ));
        self
    }

    /// Turns this into a priority queue with the given number of levels.
    /// Level `levels - 1` is served first.
    pub fn with_priority_levels(mut self, levels: u32) -> QueueResult<Self> {
        if levels == 0 {
            return Err(QueueError::Configuration(
                "a priority queue needs at least one level".into(),
            ));
        }
        self.priority_levels = Some(levels);
        Ok(self)
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Event channels for this queue.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Number of priority levels, when this is a priority queue.
    pub fn priority_levels(&self) -> Option<u32> {
        self.priority_levels
    }

    pub(crate) fn pool(&self) -> &Pool {
        &self.pool
    }

    pub(crate) fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    pub(crate) fn scripts(&self) -> &QueueScripts {
        &self.scripts
    }

    pub(crate) fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Verifies Redis connectivity.
    pub async fn health_check(&self) -> QueueResult<()> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submits a job. Returns the persisted record.
    pub async fn add(&self, data: serde_json::Value, opts: JobOptions) -> QueueResult<JobRecord> {
        let mut opts = opts;

        if let Some(level) = opts.priority {
            match self.priority_levels {
                Some(levels) if level < levels => {}
                Some(levels) => {
                    return Err(QueueError::Validation(format!(
                        "priority {level} out of range, queue has {levels} levels"
                    )))
                }
                None => {
                    return Err(QueueError::Validation(
                        "priority set on a non-priority queue".into(),
                    ))
                }
            }
        }

        // A limited submission is deferred until the window frees up.
        if let Some(limiter) = &self.limiter {
            let status = limiter.check(&data).await?;
            if status.limited {
                debug!(
                    queue = %self.name,
                    reset_in_ms = status.reset_in_ms,
                    "Submission rate limited, deferring"
                );
                opts.delay = opts.delay.max(status.reset_in_ms);
            }
        }

        let mut record = JobRecord::new(&self.name, data, opts);

        let unfinished_deps = self.register_dependencies(&record).await?;
        let placement = if !unfinished_deps.is_empty() {
            Placement::DependencyWait
        } else {
            placement_for(&record.opts, self.priority_levels.is_some())
        };

        record.state = match placement {
            Placement::Delayed => JobState::Delayed,
            Placement::DependencyWait => JobState::DependencyWait,
            Placement::Priority(_) | Placement::Waiting => JobState::Waiting,
        };

        let fire_at = Utc::now().timestamp_millis() + record.delay as i64;
        let id = record.id.as_str().to_string();

        // Record write and placement commit together.
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(self.keys.job(&id), &record.to_hash()?);
        match placement {
            Placement::Delayed => {
                pipe.zadd(self.keys.delayed(), &id, fire_at);
            }
            Placement::DependencyWait => {
                pipe.sadd(self.keys.dependency_wait(), &id);
            }
            Placement::Priority(level) => {
                let key = self.keys.priority_level(level);
                if record.opts.lifo {
                    pipe.rpush(key, &id);
                } else {
                    pipe.lpush(key, &id);
                }
            }
            Placement::Waiting => {
                let key = self.keys.waiting();
                if record.opts.lifo {
                    pipe.rpush(key, &id);
                } else {
                    pipe.lpush(key, &id);
                }
            }
        }

        let mut conn = self.pool.get().await?;
        let _: () = pipe.query_async(&mut *conn).await?;
        drop(conn);

        debug!(queue = %self.name, job_id = %id, placement = ?placement, "Job added");
        crate::metrics::QueueMetrics::job_added(&self.name);

        self.events.emit(QueueEvent::JobAdded {
            queue: self.name.clone(),
            job_id: id.clone(),
        });
        if placement == Placement::Delayed {
            self.events.emit(QueueEvent::JobDelayed {
                queue: self.name.clone(),
                job_id: id,
                fire_at,
            });
        }

        Ok(record)
    }

    /// Registers this job in its dependencies' reverse indexes and returns
    /// the subset of dependencies that have not finished. Missing
    /// dependencies are logged and do not block submission.
    async fn register_dependencies(&self, record: &JobRecord) -> QueueResult<Vec<String>> {
        if record.dependencies.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.pool.get().await?;
        let mut unfinished = Vec::new();

        for dep in &record.dependencies {
            let _: () = conn
                .sadd(self.keys.dependents(dep), record.id.as_str())
                .await?;

            let exists: bool = conn.exists(self.keys.job(dep)).await?;
            if !exists {
                warn!(
                    queue = %self.name,
                    job_id = %record.id,
                    dependency = %dep,
                    "Dependency does not exist, treating as finished"
                );
                continue;
            }

            let finished_on: Option<String> =
                conn.hget(self.keys.job(dep), "finished_on").await?;
            if finished_on.is_none() {
                unfinished.push(dep.clone());
            }
        }

        Ok(unfinished)
    }

    // =========================================================================
    // Promotion
    // =========================================================================

    /// Moves every delayed job whose fire time has passed to the serving end
    /// of `waiting`. Returns the promoted ids.
    pub async fn promote_delayed(&self) -> QueueResult<Vec<String>> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.pool.get().await?;
        let ids: Vec<String> = self
            .scripts
            .promote_delayed()
            .key(self.keys.delayed())
            .key(self.keys.waiting())
            .arg(now)
            .arg(self.keys.job_prefix())
            .invoke_async(&mut *conn)
            .await?;

        if !ids.is_empty() {
            debug!(queue = %self.name, count = ids.len(), "Promoted delayed jobs");
        }

        Ok(ids)
    }

    /// Drains the priority level lists into `waiting`, highest level first.
    /// Returns how many jobs moved.
    pub async fn pump_priorities(&self) -> QueueResult<u64> {
        let Some(levels) = self.priority_levels else {
            return Ok(0);
        };

        let mut conn = self.pool.get().await?;
        let mut invocation = self.scripts.drain_priority().prepare_invoke();
        invocation.key(self.keys.waiting());
        for level in (0..levels).rev() {
            invocation.key(self.keys.priority_level(level));
        }
        let moved: u64 = invocation.invoke_async(&mut *conn).await?;
        Ok(moved)
    }

    /// Re-evaluates jobs that depend on `job_id` and promotes those whose
    /// dependencies are now all finished (a missing dependency record counts
    /// as finished).
    pub(crate) async fn promote_dependents_of(&self, job_id: &str) -> QueueResult<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let dependents: Vec<String> = conn.smembers(self.keys.dependents(job_id)).await?;
        drop(conn);

        let mut promoted = Vec::new();

        for dependent in dependents {
            let Some(record) = self.get_job(&dependent).await? else {
                continue;
            };
            if record.state != JobState::DependencyWait {
                continue;
            }

            let mut all_done = true;
            let mut conn = self.pool.get().await?;
            for dep in &record.dependencies {
                let exists: bool = conn.exists(self.keys.job(dep)).await?;
                if !exists {
                    continue;
                }
                let finished_on: Option<String> =
                    conn.hget(self.keys.job(dep), "finished_on").await?;
                if finished_on.is_none() {
                    all_done = false;
                    break;
                }
            }

            if !all_done {
                continue;
            }

            let moved: i64 = self
                .scripts
                .promote_dependent()
                .key(self.keys.dependency_wait())
                .key(self.keys.waiting())
                .key(self.keys.job(&dependent))
                .arg(&dependent)
                .invoke_async(&mut *conn)
                .await?;

            if moved == 1 {
                debug!(queue = %self.name, job_id = %dependent, "Promoted dependent job");
                promoted.push(dependent);
            }
        }

        Ok(promoted)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Loads one job record.
    pub async fn get_job(&self, job_id: &str) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.pool.get().await?;
        let hash: HashMap<String, String> = conn.hgetall(self.keys.job(job_id)).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        JobRecord::from_hash(&hash).map(Some)
    }

    /// Range query over one state structure. In a priority queue, `waiting`
    /// unions the priority level lists (highest first) with the waiting list.
    pub async fn get_jobs(
        &self,
        state: JobState,
        start: isize,
        end: isize,
    ) -> QueueResult<Vec<JobRecord>> {
        let ids = self.state_ids(state).await?;
        let slice = range_slice(&ids, start, end);

        let mut jobs = Vec::with_capacity(slice.len());
        for id in slice {
            if let Some(record) = self.get_job(id).await? {
                jobs.push(record);
            }
        }
        Ok(jobs)
    }

    async fn state_ids(&self, state: JobState) -> QueueResult<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let ids: Vec<String> = match state {
            JobState::Waiting => {
                let mut ids: Vec<String> = Vec::new();
                if let Some(levels) = self.priority_levels {
                    for level in (0..levels).rev() {
                        let level_ids: Vec<String> =
                            conn.lrange(self.keys.priority_level(level), 0, -1).await?;
                        ids.extend(level_ids);
                    }
                }
                let waiting: Vec<String> = conn.lrange(self.keys.waiting(), 0, -1).await?;
                ids.extend(waiting);
                ids
            }
            JobState::Active => conn.lrange(self.keys.active(), 0, -1).await?,
            JobState::Completed => conn.lrange(self.keys.completed(), 0, -1).await?,
            JobState::Failed => conn.lrange(self.keys.failed(), 0, -1).await?,
            JobState::Paused => conn.lrange(self.keys.paused_jobs(), 0, -1).await?,
            JobState::Delayed => conn.zrange(self.keys.delayed(), 0, -1).await?,
            JobState::DependencyWait => conn.smembers(self.keys.dependency_wait()).await?,
            JobState::DeadLetter => conn.lrange(self.keys.dead_letter_list(), 0, -1).await?,
        };
        Ok(ids)
    }

    /// Counts per state structure. `paused` reports 1 iff the queue-wide
    /// pause flag is set.
    pub async fn get_job_counts(&self) -> QueueResult<JobCounts> {
        let mut conn = self.pool.get().await?;

        let mut waiting: u64 = conn.llen(self.keys.waiting()).await?;
        if let Some(levels) = self.priority_levels {
            for level in 0..levels {
                let n: u64 = conn.llen(self.keys.priority_level(level)).await?;
                waiting += n;
            }
        }

        let active: u64 = conn.llen(self.keys.active()).await?;
        let completed: u64 = conn.llen(self.keys.completed()).await?;
        let failed: u64 = conn.llen(self.keys.failed()).await?;
        let delayed: u64 = conn.zcard(self.keys.delayed()).await?;
        let paused_flag: bool = conn.exists(self.keys.pause_flag()).await?;
        let dependency_wait: u64 = conn.scard(self.keys.dependency_wait()).await?;
        let dead_letter: u64 = conn.llen(self.keys.dead_letter_list()).await?;

        Ok(JobCounts {
            waiting,
            active,
            completed,
            failed,
            delayed,
            paused: u64::from(paused_flag),
            dependency_wait,
            dead_letter,
        })
    }

    // =========================================================================
    // Pause / resume
    // =========================================================================

    /// Gates worker dispatch for the whole queue.
    pub async fn pause(&self) -> QueueResult<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.set(self.keys.pause_flag(), 1).await?;
        info!(queue = %self.name, "Queue paused");
        Ok(())
    }

    /// Clears the pause flag.
    pub async fn resume(&self) -> QueueResult<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.del(self.keys.pause_flag()).await?;
        info!(queue = %self.name, "Queue resumed");
        Ok(())
    }

    /// True while the pause flag is set.
    pub async fn is_paused(&self) -> QueueResult<bool> {
        let mut conn = self.pool.get().await?;
        let paused: bool = conn.exists(self.keys.pause_flag()).await?;
        Ok(paused)
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Stores handler progress (0..=100) and emits `jobProgress`.
    pub async fn update_progress(&self, job_id: &str, progress: u8) -> QueueResult<()> {
        if progress > 100 {
            return Err(QueueError::Validation(format!(
                "progress must be 0..=100, got {progress}"
            )));
        }

        let mut conn = self.pool.get().await?;
        let exists: bool = conn.exists(self.keys.job(job_id)).await?;
        if !exists {
            return Err(QueueError::JobNotFound(job_id.to_string()));
        }
        let _: () = conn
            .hset(self.keys.job(job_id), "progress", progress.to_string())
            .await?;

        self.events.emit(QueueEvent::JobProgress {
            queue: self.name.clone(),
            job_id: job_id.to_string(),
            progress,
        });
        Ok(())
    }

    /// Removes a job from every state structure and deletes its record and
    /// reverse index, then re-evaluates its dependents.
    pub async fn remove_job(&self, job_id: &str) -> QueueResult<bool> {
        let mut conn = self.pool.get().await?;
        let exists: bool = conn.exists(self.keys.job(job_id)).await?;
        if !exists {
            return Ok(false);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.lrem(self.keys.waiting(), 0, job_id);
        pipe.lrem(self.keys.active(), 0, job_id);
        pipe.lrem(self.keys.completed(), 0, job_id);
        pipe.lrem(self.keys.failed(), 0, job_id);
        pipe.lrem(self.keys.paused_jobs(), 0, job_id);
        pipe.zrem(self.keys.delayed(), job_id);
        pipe.srem(self.keys.dependency_wait(), job_id);
        if let Some(levels) = self.priority_levels {
            for level in 0..levels {
                pipe.lrem(self.keys.priority_level(level), 0, job_id);
            }
        }
        pipe.del(self.keys.job(job_id));
        let _: () = pipe.query_async(&mut *conn).await?;
        drop(conn);

        self.events.emit(QueueEvent::JobRemoved {
            queue: self.name.clone(),
            job_id: job_id.to_string(),
        });

        // Dependents whose last unfinished dependency vanished become
        // runnable; the reverse index goes last so promotion can read it.
        self.promote_dependents_of(job_id).await?;
        let mut conn = self.pool.get().await?;
        let _: () = conn.del(self.keys.dependents(job_id)).await?;

        debug!(queue = %self.name, job_id = %job_id, "Job removed");
        Ok(true)
    }

    /// Deletes every key scoped to this queue.
    pub async fn empty(&self) -> QueueResult<u64> {
        let mut conn = self.pool.get().await?;
        let keys: Vec<String> = conn.keys(self.keys.queue_pattern()).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: u64 = conn.del(&keys).await?;
        info!(queue = %self.name, keys = keys.len(), "Queue emptied");
        Ok(removed)
    }

    /// Removes many jobs, skipping missing ids. Returns how many succeeded.
    pub async fn bulk_remove(&self, job_ids: &[String]) -> QueueResult<usize> {
        let mut removed = 0;
        for id in job_ids {
            if self.remove_job(id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Parks jobs from `waiting` or `delayed` into the paused list. Returns
    /// how many were parked.
    pub async fn bulk_pause(&self, job_ids: &[String]) -> QueueResult<usize> {
        let mut paused = 0;
        let mut conn = self.pool.get().await?;

        for id in job_ids {
            let moved: i64 = self
                .scripts
                .move_job()
                .key(self.keys.waiting())
                .key(self.keys.paused_jobs())
                .key(self.keys.job(id))
                .arg(id)
                .arg(JobState::Paused.as_str())
                .invoke_async(&mut *conn)
                .await?;
            if moved == 1 {
                paused += 1;
                continue;
            }

            // Not waiting; try the delayed set.
            let removed: i64 = conn.zrem(self.keys.delayed(), id).await?;
            if removed == 1 {
                let mut pipe = redis::pipe();
                pipe.atomic();
                pipe.rpush(self.keys.paused_jobs(), id);
                pipe.hset(self.keys.job(id), "state", JobState::Paused.as_str());
                let _: () = pipe.query_async(&mut *conn).await?;
                paused += 1;
            }
        }

        Ok(paused)
    }

    /// Returns parked jobs to `waiting`. Returns how many moved.
    pub async fn bulk_resume(&self, job_ids: &[String]) -> QueueResult<usize> {
        let mut resumed = 0;
        let mut conn = self.pool.get().await?;

        for id in job_ids {
            let moved: i64 = self
                .scripts
                .move_job()
                .key(self.keys.paused_jobs())
                .key(self.keys.waiting())
                .key(self.keys.job(id))
                .arg(id)
                .arg(JobState::Waiting.as_str())
                .invoke_async(&mut *conn)
                .await?;
            if moved == 1 {
                resumed += 1;
            }
        }

        Ok(resumed)
    }

    // =========================================================================
    // Transition commits (worker / stalled checker / DLQ)
    // =========================================================================

    /// Commits a successful run: stamps the outcome, moves active →
    /// completed, emits `jobCompleted` and promotes dependents.
    pub(crate) async fn commit_completed(
        &self,
        record: &mut JobRecord,
        return_value: Option<serde_json::Value>,
    ) -> QueueResult<()> {
        let now = Utc::now().timestamp_millis();
        record.finished_on = Some(now);
        record.return_value = return_value;
        record.state = JobState::Completed;

        let id = record.id.as_str().to_string();
        let mut conn = self.pool.get().await?;

        if record.opts.remove_on_complete {
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.lrem(self.keys.active(), 0, &id);
            pipe.del(self.keys.job(&id));
            let _: () = pipe.query_async(&mut *conn).await?;
        } else {
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.hset_multiple(self.keys.job(&id), &record.to_hash()?);
            pipe.lrem(self.keys.active(), 0, &id);
            pipe.lpush(self.keys.completed(), &id);
            let _: () = pipe.query_async(&mut *conn).await?;
        }
        drop(conn);

        self.events.emit(QueueEvent::JobCompleted {
            queue: self.name.clone(),
            job_id: id.clone(),
            return_value: record.return_value.clone(),
        });

        self.promote_dependents_of(&id).await?;
        Ok(())
    }

    /// Commits a failed attempt: persists the failure fields and moves
    /// active → failed. The caller decides what happens next (retry or
    /// dead letter).
    pub(crate) async fn commit_failed(&self, record: &mut JobRecord) -> QueueResult<()> {
        record.state = JobState::Failed;
        record.finished_on = Some(Utc::now().timestamp_millis());
        let id = record.id.as_str().to_string();
        let reason = record.failed_reason.clone().unwrap_or_default();

        let mut conn = self.pool.get().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(self.keys.job(&id), &record.to_hash()?);
        pipe.lrem(self.keys.active(), 0, &id);
        pipe.lpush(self.keys.failed(), &id);
        let _: () = pipe.query_async(&mut *conn).await?;
        drop(conn);

        self.events.emit(QueueEvent::JobFailed {
            queue: self.name.clone(),
            job_id: id,
            reason,
        });
        Ok(())
    }

    /// Moves a failed job back into circulation for a retry. A zero delay
    /// re-enters the serving end of `waiting`; otherwise the job goes
    /// through the delayed set.
    pub(crate) async fn schedule_retry(
        &self,
        record: &mut JobRecord,
        delay_ms: u64,
    ) -> QueueResult<()> {
        let id = record.id.as_str().to_string();
        let mut conn = self.pool.get().await?;

        if delay_ms == 0 {
            let moved: i64 = self
                .scripts
                .move_job()
                .key(self.keys.failed())
                .key(self.keys.waiting())
                .key(self.keys.job(&id))
                .arg(&id)
                .arg(JobState::Waiting.as_str())
                .invoke_async(&mut *conn)
                .await?;
            if moved == 1 {
                // Back in circulation: the previous attempt's outcome stamp
                // no longer applies.
                let _: () = conn.hdel(self.keys.job(&id), "finished_on").await?;
                record.state = JobState::Waiting;
                record.finished_on = None;
            }
            return Ok(());
        }

        let fire_at = Utc::now().timestamp_millis() + delay_ms as i64;
        record.state = JobState::Delayed;
        record.finished_on = None;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.lrem(self.keys.failed(), 0, &id);
        pipe.zadd(self.keys.delayed(), &id, fire_at);
        pipe.hset(self.keys.job(&id), "state", JobState::Delayed.as_str());
        pipe.hdel(self.keys.job(&id), "finished_on");
        let _: () = pipe.query_async(&mut *conn).await?;
        drop(conn);

        self.events.emit(QueueEvent::JobDelayed {
            queue: self.name.clone(),
            job_id: id,
            fire_at,
        });
        Ok(())
    }

    /// Atomically claims a job from the serving end of `waiting` into
    /// `active`, stamping the lease start. Returns false when another worker
    /// got there first.
    pub(crate) async fn claim(&self, job_id: &str) -> QueueResult<bool> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.pool.get().await?;
        let claimed: i64 = self
            .scripts
            .claim()
            .key(self.keys.waiting())
            .key(self.keys.active())
            .key(self.keys.job(job_id))
            .arg(job_id)
            .arg(now)
            .invoke_async(&mut *conn)
            .await?;

        if claimed == 1 {
            self.events.emit(QueueEvent::JobActive {
                queue: self.name.clone(),
                job_id: job_id.to_string(),
            });
        }
        Ok(claimed == 1)
    }

    /// Ids at the serving end of `waiting`, next-to-serve first.
    pub(crate) async fn peek_waiting(&self, count: usize) -> QueueResult<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.get().await?;
        let mut ids: Vec<String> = conn
            .lrange(self.keys.waiting(), -(count as isize), -1)
            .await?;
        ids.reverse();
        Ok(ids)
    }
}

/// Pure placement decision for a dependency-free submission.
fn placement_for(opts: &JobOptions, is_priority_queue: bool) -> Placement {
    if opts.delay > 0 {
        Placement::Delayed
    } else if is_priority_queue {
        Placement::Priority(opts.priority.unwrap_or(0))
    } else {
        Placement::Waiting
    }
}

/// Applies an inclusive `[start, end]` window (negative indexes count from
/// the end, Redis-style) to an id list.
fn range_slice(ids: &[String], start: isize, end: isize) -> &[String] {
    let len = ids.len() as isize;
    let resolve = |i: isize| -> isize {
        if i < 0 {
            (len + i).max(0)
        } else {
            i.min(len)
        }
    };
    let from = resolve(start).min(len) as usize;
    let to = (resolve(end) + 1).clamp(0, len) as usize;
    if from >= to {
        &[]
    } else {
        &ids[from..to]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_placement_delay_wins() {
        let opts: JobOptions = serde_json::from_value(json!({"delay": 500})).unwrap();
        assert_eq!(placement_for(&opts, false), Placement::Delayed);
        assert_eq!(placement_for(&opts, true), Placement::Delayed);
    }

    #[test]
    fn test_placement_priority_queue() {
        let opts: JobOptions = serde_json::from_value(json!({"priority": 3})).unwrap();
        assert_eq!(placement_for(&opts, true), Placement::Priority(3));

        let opts = JobOptions::default();
        assert_eq!(placement_for(&opts, true), Placement::Priority(0));
    }

    #[test]
    fn test_placement_plain_queue() {
        let opts = JobOptions::default();
        assert_eq!(placement_for(&opts, false), Placement::Waiting);
    }

    #[test]
    fn test_range_slice_windows() {
        let ids: Vec<String> = (0..5).map(|i| i.to_string()).collect();

        assert_eq!(range_slice(&ids, 0, -1), &ids[..]);
        assert_eq!(range_slice(&ids, 0, 1), &ids[0..2]);
        assert_eq!(range_slice(&ids, 3, 10), &ids[3..5]);
        assert_eq!(range_slice(&ids, -2, -1), &ids[3..5]);
        assert!(range_slice(&ids, 4, 2).is_empty());
        assert!(range_slice(&[], 0, -1).is_empty());
    }

    #[test]
    fn test_job_counts_serialize() {
        let counts = JobCounts {
            waiting: 2,
            completed: 1,
            ..JobCounts::default()
        };
        let json = serde_json::to_value(&counts).unwrap();
        assert_eq!(json["waiting"], 2);
        assert_eq!(json["dead_letter"], 0);
    }
}
