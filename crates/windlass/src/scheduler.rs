//! Recurring job scheduling.
//!
//! A schedule registers a cron expression plus a job template. Each firing
//! is submitted as a delayed job under a derived id
//! (`"{scheduleId}:{fireMillis}"`); when that job completes, the scheduler
//! computes the following fire and re-submits, bounded by `endDate` and
//! `limit`. In a scaled deployment only the leader advances schedules.

use crate::cron::CronExpr;
use crate::error::{QueueError, QueueResult};
use crate::events::{EventKind, QueueEvent};
use crate::job::JobOptions;
use crate::leader::LeaderElection;
use crate::queue::Queue;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One registered schedule.
struct Registration {
    expr: CronExpr,
    tz: Option<Tz>,
    data: serde_json::Value,
    opts: JobOptions,
    start_date: Option<i64>,
    end_date: Option<i64>,
    limit: Option<u32>,
    count: u32,
    pending_id: Option<String>,
}

/// Public view of a registered schedule.
#[derive(Debug, Clone)]
pub struct ScheduleInfo {
    /// Schedule id.
    pub id: String,

    /// Cron expression.
    pub cron: String,

    /// IANA timezone, when set.
    pub timezone: Option<String>,

    /// Firings so far.
    pub count: u32,

    /// Firing cap, when set.
    pub limit: Option<u32>,

    /// Currently pending job id, when one is queued.
    pub pending_id: Option<String>,

    /// Next computed fire time.
    pub next_fire: Option<DateTime<Utc>>,
}

/// Cron scheduler for one queue.
pub struct Scheduler {
    queue: Arc<Queue>,
    leader: Option<Arc<LeaderElection>>,
    schedules: Arc<RwLock<HashMap<String, Registration>>>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    /// Creates a scheduler over the queue.
    pub fn new(queue: Arc<Queue>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            queue,
            leader: None,
            schedules: Arc::new(RwLock::new(HashMap::new())),
            running: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Gates schedule advancement on cluster leadership.
    pub fn with_leader_gate(mut self, leader: Arc<LeaderElection>) -> Self {
        self.leader = Some(leader);
        self
    }

    /// Registers a recurring job and submits its first firing. The options
    /// must carry `repeat.cron`; `repeat.tz`, `repeat.startDate`,
    /// `repeat.endDate` and `repeat.limit` bound the recurrence. Returns
    /// the schedule id.
    pub async fn schedule(
        &self,
        data: serde_json::Value,
        opts: JobOptions,
    ) -> QueueResult<String> {
        let repeat = opts
            .repeat
            .clone()
            .ok_or_else(|| QueueError::Validation("schedule requires repeat options".into()))?;
        let cron = repeat
            .cron
            .clone()
            .ok_or_else(|| QueueError::Validation("schedule requires repeat.cron".into()))?;

        let expr = CronExpr::parse(&cron)?;
        let tz = repeat
            .tz
            .as_deref()
            .map(|name| {
                name.parse::<Tz>()
                    .map_err(|_| QueueError::Validation(format!("unknown timezone: {name}")))
            })
            .transpose()?;

        let schedule_id = opts
            .job_id
            .clone()
            .unwrap_or_else(|| format!("schedule-{}", Uuid::now_v7()));

        let mut registration = Registration {
            expr,
            tz,
            data,
            opts,
            start_date: repeat.start_date,
            end_date: repeat.end_date,
            limit: repeat.limit,
            count: repeat.count,
            pending_id: None,
        };

        let now = Utc::now();
        let Some(next) = next_fire(&registration, now) else {
            return Err(QueueError::Validation(format!(
                "schedule {cron:?} never fires within its bounds"
            )));
        };

        self.submit_firing(&schedule_id, &mut registration, now, next)
            .await?;
        self.schedules.write().insert(schedule_id.clone(), registration);

        info!(
            queue = %self.queue.name(),
            schedule_id = %schedule_id,
            cron = %cron,
            "Schedule registered"
        );
        Ok(schedule_id)
    }

    /// Removes a schedule and its pending job. Returns false when the id
    /// was not registered.
    pub async fn unschedule(&self, schedule_id: &str) -> QueueResult<bool> {
        let pending = {
            let mut schedules = self.schedules.write();
            match schedules.remove(schedule_id) {
                Some(registration) => registration.pending_id,
                None => return Ok(false),
            }
        };

        if let Some(pending_id) = pending {
            self.queue.remove_job(&pending_id).await?;
        }
        info!(queue = %self.queue.name(), schedule_id = %schedule_id, "Schedule removed");
        Ok(true)
    }

    /// Fires a registered schedule immediately, outside its cadence.
    pub async fn trigger_now(&self, schedule_id: &str) -> QueueResult<String> {
        let (data, mut opts) = {
            let schedules = self.schedules.read();
            let registration = schedules
                .get(schedule_id)
                .ok_or_else(|| QueueError::JobNotFound(schedule_id.to_string()))?;
            (registration.data.clone(), registration.opts.clone())
        };

        opts.delay = 0;
        opts.job_id = Some(format!(
            "{schedule_id}:manual-{}",
            Utc::now().timestamp_millis()
        ));
        let record = self.queue.add(data, opts).await?;
        Ok(record.id.as_str().to_string())
    }

    /// Lists registered schedules.
    pub fn list(&self) -> Vec<ScheduleInfo> {
        let now = Utc::now();
        self.schedules
            .read()
            .iter()
            .map(|(id, registration)| ScheduleInfo {
                id: id.clone(),
                cron: registration.expr.source().to_string(),
                timezone: registration.tz.map(|tz| tz.name().to_string()),
                count: registration.count,
                limit: registration.limit,
                pending_id: registration.pending_id.clone(),
                next_fire: next_fire(registration, now),
            })
            .collect()
    }

    /// Signals the listener to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Listens for completions of pending firings and re-submits the next
    /// one, until stopped.
    pub async fn run(&self) -> QueueResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut completed_rx = self.queue.events().subscribe(EventKind::JobCompleted);
        info!(queue = %self.queue.name(), "Scheduler started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                event = completed_rx.recv() => match event {
                    Ok(QueueEvent::JobCompleted { job_id, .. }) => {
                        if let Err(e) = self.on_completion(&job_id).await {
                            error!(
                                queue = %self.queue.name(),
                                job_id = %job_id,
                                error = %e,
                                "Schedule advancement failed"
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(queue = %self.queue.name(), missed, "Scheduler lagged on events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue.name(), "Scheduler stopped");
        Ok(())
    }

    /// Advances the schedule that owns this completed firing, if any.
    async fn on_completion(&self, completed_id: &str) -> QueueResult<()> {
        // Only the leader advances cluster-wide schedules.
        if let Some(leader) = &self.leader {
            if !leader.is_leader() {
                return Ok(());
            }
        }

        let schedule_id = {
            let schedules = self.schedules.read();
            schedules
                .iter()
                .find(|(_, r)| r.pending_id.as_deref() == Some(completed_id))
                .map(|(id, _)| id.clone())
        };
        let Some(schedule_id) = schedule_id else {
            return Ok(());
        };

        let now = Utc::now();
        let mut finished = false;
        let mut resubmit: Option<(Registration, DateTime<Utc>)> = None;

        {
            let mut schedules = self.schedules.write();
            if let Some(registration) = schedules.get_mut(&schedule_id) {
                registration.count += 1;
                registration.pending_id = None;

                let capped = registration
                    .limit
                    .is_some_and(|limit| registration.count >= limit);
                match next_fire(registration, now) {
                    Some(next) if !capped => {
                        // Clone the template out so the submit happens
                        // outside the registry lock.
                        resubmit = Some((
                            Registration {
                                expr: registration.expr.clone(),
                                tz: registration.tz,
                                data: registration.data.clone(),
                                opts: registration.opts.clone(),
                                start_date: registration.start_date,
                                end_date: registration.end_date,
                                limit: registration.limit,
                                count: registration.count,
                                pending_id: None,
                            },
                            next,
                        ));
                    }
                    _ => finished = true,
                }
            }
        }

        if finished {
            self.schedules.write().remove(&schedule_id);
            info!(
                queue = %self.queue.name(),
                schedule_id = %schedule_id,
                "Schedule exhausted"
            );
            return Ok(());
        }

        if let Some((mut registration, next)) = resubmit {
            self.submit_firing(&schedule_id, &mut registration, now, next)
                .await?;
            let mut schedules = self.schedules.write();
            if let Some(current) = schedules.get_mut(&schedule_id) {
                current.pending_id = registration.pending_id;
            }
        }

        Ok(())
    }

    /// Submits one firing as a delayed job under a derived id.
    async fn submit_firing(
        &self,
        schedule_id: &str,
        registration: &mut Registration,
        now: DateTime<Utc>,
        fire_at: DateTime<Utc>,
    ) -> QueueResult<()> {
        let fire_millis = fire_at.timestamp_millis();
        let delay = (fire_millis - now.timestamp_millis()).max(0) as u64;
        let pending_id = format!("{schedule_id}:{fire_millis}");

        let mut opts = registration.opts.clone();
        opts.delay = delay;
        opts.job_id = Some(pending_id.clone());
        if let Some(repeat) = opts.repeat.as_mut() {
            repeat.count = registration.count;
        }

        self.queue.add(registration.data.clone(), opts).await?;
        registration.pending_id = Some(pending_id.clone());

        debug!(
            queue = %self.queue.name(),
            schedule_id = %schedule_id,
            pending_id = %pending_id,
            fire_at = %fire_at,
            "Firing queued"
        );
        Ok(())
    }
}

/// Next fire strictly after `now`, honoring the start bound and the end
/// bound. Returns `None` once the schedule is out of range.
fn next_fire(registration: &Registration, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut from = now;
    if let Some(start) = registration.start_date {
        if let Some(start_time) = DateTime::<Utc>::from_timestamp_millis(start) {
            if start_time > from {
                from = start_time;
            }
        }
    }

    let next = match registration.tz {
        Some(tz) => registration.expr.next_fire_in_tz(from, tz)?,
        None => registration.expr.next_fire(from)?,
    };

    if let Some(end) = registration.end_date {
        if next.timestamp_millis() > end {
            return None;
        }
    }
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn registration(cron: &str) -> Registration {
        Registration {
            expr: CronExpr::parse(cron).unwrap(),
            tz: None,
            data: serde_json::json!({}),
            opts: JobOptions::default(),
            start_date: None,
            end_date: None,
            limit: None,
            count: 0,
            pending_id: None,
        }
    }

    #[test]
    fn test_next_fire_plain() {
        let registration = registration("0 12 * * *");
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap();
        let next = next_fire(&registration, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_next_fire_honors_start_date() {
        let mut registration = registration("0 12 * * *");
        let start = Utc.with_ymd_and_hms(2026, 5, 10, 0, 0, 0).unwrap();
        registration.start_date = Some(start.timestamp_millis());

        let now = Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap();
        let next = next_fire(&registration, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 5, 10, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_next_fire_honors_end_date() {
        let mut registration = registration("0 12 * * *");
        let end = Utc.with_ymd_and_hms(2026, 5, 1, 11, 0, 0).unwrap();
        registration.end_date = Some(end.timestamp_millis());

        let now = Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap();
        assert!(next_fire(&registration, now).is_none());
    }

    #[test]
    fn test_derived_firing_ids_are_unique_per_fire() {
        let registration = registration("* * * * *");
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap();
        let first = next_fire(&registration, now).unwrap();
        let second = next_fire(&registration, first).unwrap();
        assert!(second > first);
        assert_ne!(
            format!("s:{}", first.timestamp_millis()),
            format!("s:{}", second.timestamp_millis())
        );
    }
}
