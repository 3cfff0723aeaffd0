//! Retention trimming for terminal jobs.
//!
//! Two policies per terminal list: drop entries whose `finished_on` is past
//! their lifetime, then drop the oldest entries until the list fits under
//! its cap. Jobs submitted with `keepJobs` are exempt from both.

use crate::error::QueueResult;
use crate::events::QueueEvent;
use crate::leader::LeaderElection;
use crate::queue::Queue;
use chrono::Utc;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Result of one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Entries removed from the completed list.
    pub completed_removed: u64,

    /// Entries removed from the failed list.
    pub failed_removed: u64,
}

/// Periodic retention task. In a scaled deployment only the leader runs the
/// pass; followers skip their tick.
pub struct Cleanup {
    queue: Arc<Queue>,
    leader: Option<Arc<LeaderElection>>,
    shutdown_tx: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Cleanup {
    /// Creates the cleanup task.
    pub fn new(queue: Arc<Queue>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            queue,
            leader: None,
            shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Gates the pass on cluster leadership.
    pub fn with_leader_gate(mut self, leader: Arc<LeaderElection>) -> Self {
        self.leader = Some(leader);
        self
    }

    /// Signals the loop to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Runs the pass on its configured interval until stopped.
    pub async fn run(&self) -> QueueResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let interval = Duration::from_secs(self.queue.config().cleanup.interval_secs);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(queue = %self.queue.name(), interval_secs = interval.as_secs(), "Cleanup started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(interval) => {
                    if let Some(leader) = &self.leader {
                        if !leader.is_leader() {
                            continue;
                        }
                    }
                    if let Err(e) = self.clean_once().await {
                        error!(queue = %self.queue.name(), error = %e, "Cleanup pass failed");
                        self.queue.events().emit(QueueEvent::Error {
                            queue: self.queue.name().to_string(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue.name(), "Cleanup stopped");
        Ok(())
    }

    /// One pass over both terminal lists.
    pub async fn clean_once(&self) -> QueueResult<CleanupStats> {
        let config = self.queue.config().cleanup.clone();
        let completed_removed = self
            .trim_list(
                &self.queue.keys().completed(),
                config.completed_lifetime_secs,
                config.max_kept,
            )
            .await?;
        let failed_removed = self
            .trim_list(
                &self.queue.keys().failed(),
                config.failed_lifetime_secs,
                config.max_kept,
            )
            .await?;

        let stats = CleanupStats {
            completed_removed,
            failed_removed,
        };
        if completed_removed + failed_removed > 0 {
            info!(
                queue = %self.queue.name(),
                completed_removed,
                failed_removed,
                "Cleanup pass trimmed jobs"
            );
        }
        Ok(stats)
    }

    async fn trim_list(
        &self,
        list_key: &str,
        lifetime_secs: u64,
        max_kept: usize,
    ) -> QueueResult<u64> {
        let queue = &self.queue;
        let now = Utc::now().timestamp_millis();
        let cutoff = now - (lifetime_secs as i64) * 1000;

        let mut conn = queue.pool().get().await?;
        let ids: Vec<String> = conn.lrange(list_key, 0, -1).await?;
        drop(conn);

        // (id, finished_on) survivors eligible for the cap pass.
        let mut survivors: Vec<(String, i64)> = Vec::new();
        let mut kept_exempt = 0usize;
        let mut removed = 0u64;

        for id in ids {
            let Some(record) = queue.get_job(&id).await? else {
                // Orphaned id; count it out of the list.
                let mut conn = queue.pool().get().await?;
                let _: () = conn.lrem(list_key, 0, &id).await?;
                continue;
            };

            if record.opts.keep_jobs {
                kept_exempt += 1;
                continue;
            }

            let finished_on = record.finished_on.unwrap_or(record.timestamp);
            if finished_on < cutoff {
                self.drop_entry(list_key, &id).await?;
                removed += 1;
            } else {
                survivors.push((id, finished_on));
            }
        }

        // Cap pass: oldest first, never touching the exempt entries.
        if survivors.len() + kept_exempt > max_kept {
            survivors.sort_by_key(|(_, finished_on)| *finished_on);
            let mut over = (survivors.len() + kept_exempt).saturating_sub(max_kept);
            for (id, _) in &survivors {
                if over == 0 {
                    break;
                }
                self.drop_entry(list_key, id).await?;
                removed += 1;
                over -= 1;
            }
        }

        Ok(removed)
    }

    async fn drop_entry(&self, list_key: &str, job_id: &str) -> QueueResult<()> {
        let mut conn = self.queue.pool().get().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.lrem(list_key, 0, job_id);
        pipe.del(self.queue.keys().job(job_id));
        let _: () = pipe.query_async(&mut *conn).await?;
        Ok(())
    }
}
