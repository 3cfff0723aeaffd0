//! Cross-instance work coordination.
//!
//! Every instance publishes a TTL'd record with its worker budget. Each poll
//! cycle refreshes the record, evicts instances that stopped heartbeating,
//! and recomputes a fair worker-count distribution: a proportional pass in
//! discovery order, then a remainder pass that tops up the least-loaded
//! instances one worker at a time.

use crate::config::ScalingConfig;
use crate::error::{QueueError, QueueResult};
use crate::metrics::names;
use crate::redis::ClusterKeys;
use crate::worker::Worker;
use chrono::Utc;
use deadpool_redis::Pool;
use metrics::gauge;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Published record for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Instance id.
    pub id: String,

    /// Worker budget this instance can run.
    pub max_workers: u32,

    /// Advisory jobs-per-worker hint.
    pub jobs_per_worker: u32,

    /// Registration time, unix milliseconds.
    pub started_at: i64,

    /// Last heartbeat, unix milliseconds.
    pub last_heartbeat: i64,

    /// Workers currently assigned by the coordinator.
    pub workers_assigned: u32,
}

impl InstanceRecord {
    fn to_hash(&self) -> Vec<(String, String)> {
        vec![
            ("id".into(), self.id.clone()),
            ("max_workers".into(), self.max_workers.to_string()),
            ("jobs_per_worker".into(), self.jobs_per_worker.to_string()),
            ("started_at".into(), self.started_at.to_string()),
            ("last_heartbeat".into(), self.last_heartbeat.to_string()),
            (
                "workers_assigned".into(),
                self.workers_assigned.to_string(),
            ),
        ]
    }

    fn from_hash(hash: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            id: hash.get("id")?.clone(),
            max_workers: hash.get("max_workers")?.parse().ok()?,
            jobs_per_worker: hash.get("jobs_per_worker")?.parse().ok()?,
            started_at: hash.get("started_at")?.parse().ok()?,
            last_heartbeat: hash.get("last_heartbeat")?.parse().ok()?,
            workers_assigned: hash.get("workers_assigned")?.parse().ok()?,
        })
    }
}

/// Fair distribution over the discovered instances. Returns `(id, share)`
/// pairs in discovery order; the shares sum to
/// `min(Σ workers_assigned, Σ max_workers)` whenever any capacity exists.
pub fn fair_distribution(instances: &[InstanceRecord]) -> Vec<(String, u32)> {
    let total_assigned: u64 = instances.iter().map(|i| i.workers_assigned as u64).sum();
    let total_max: u64 = instances.iter().map(|i| i.max_workers as u64).sum();
    let target = total_assigned.min(total_max);

    let mut shares: Vec<u32> = Vec::with_capacity(instances.len());
    let mut remaining_capacity = total_max;
    let mut remaining_target = target;

    // Proportional pass, capped at each instance's budget.
    for instance in instances {
        let share = if remaining_capacity > 0 {
            ((instance.max_workers as u64 * remaining_target / remaining_capacity) as u32)
                .min(instance.max_workers)
        } else {
            0
        };
        shares.push(share);
        remaining_capacity -= instance.max_workers as u64;
        remaining_target -= share as u64;
    }

    // Remainder pass: one worker at a time to the least-loaded instances
    // with room, wrapping around as needed.
    while remaining_target > 0 {
        let mut with_room: Vec<usize> = (0..instances.len())
            .filter(|&i| shares[i] < instances[i].max_workers)
            .collect();
        if with_room.is_empty() {
            break;
        }
        with_room.sort_by(|&a, &b| {
            let load_a = shares[a] as f64 / instances[a].max_workers.max(1) as f64;
            let load_b = shares[b] as f64 / instances[b].max_workers.max(1) as f64;
            load_a.total_cmp(&load_b)
        });
        for i in with_room {
            if remaining_target == 0 {
                break;
            }
            if shares[i] < instances[i].max_workers {
                shares[i] += 1;
                remaining_target -= 1;
            }
        }
    }

    instances
        .iter()
        .zip(shares)
        .map(|(instance, share)| (instance.id.clone(), share))
        .collect()
}

/// Work coordinator for one instance.
pub struct WorkCoordinator {
    instance_id: String,
    pool: Pool,
    keys: ClusterKeys,
    config: ScalingConfig,
    started_at: i64,
    workers_assigned: AtomicU32,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl WorkCoordinator {
    /// Creates a coordinator. `key_prefix` defaults to the configured
    /// coordination prefix or the caller's queue prefix.
    pub fn new(pool: Pool, default_prefix: &str, config: ScalingConfig) -> Self {
        let prefix = config
            .work_coordination
            .key_prefix
            .clone()
            .unwrap_or_else(|| default_prefix.to_string());
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(crate::id::instance_id);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            instance_id,
            pool,
            keys: ClusterKeys::new(prefix),
            workers_assigned: AtomicU32::new(config.max_workers_per_instance),
            config,
            started_at: Utc::now().timestamp_millis(),
            running: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// This instance's id.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The worker budget currently assigned to this instance.
    pub fn get_worker_count(&self) -> u32 {
        self.workers_assigned.load(Ordering::SeqCst)
    }

    fn record_ttl_ms(&self) -> u64 {
        self.config.work_coordination.poll_interval_ms * 3
    }

    /// Publishes this instance's record. New registrations start at the
    /// full budget; the cluster target contracts toward fairness from there.
    pub async fn register(&self) -> QueueResult<()> {
        let now = Utc::now().timestamp_millis();
        let record = InstanceRecord {
            id: self.instance_id.clone(),
            max_workers: self.config.max_workers_per_instance,
            jobs_per_worker: self.config.jobs_per_worker,
            started_at: self.started_at,
            last_heartbeat: now,
            workers_assigned: self.get_worker_count(),
        };

        let key = self.keys.instance(&self.instance_id);
        let mut conn = self.pool.get().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(&key, &record.to_hash());
        pipe.pexpire(&key, self.record_ttl_ms() as i64);
        let _: () = pipe.query_async(&mut *conn).await?;

        info!(
            instance_id = %self.instance_id,
            max_workers = record.max_workers,
            "Instance registered"
        );
        Ok(())
    }

    /// Refreshes the heartbeat, re-registering when the record expired.
    async fn heartbeat(&self) -> QueueResult<()> {
        let key = self.keys.instance(&self.instance_id);
        let mut conn = self.pool.get().await?;
        let exists: bool = conn.exists(&key).await?;
        if !exists {
            drop(conn);
            warn!(instance_id = %self.instance_id, "Instance record expired, re-registering");
            return self.register().await;
        }

        let now = Utc::now().timestamp_millis();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset(&key, "last_heartbeat", now.to_string());
        pipe.pexpire(&key, self.record_ttl_ms() as i64);
        let _: () = pipe.query_async(&mut *conn).await?;
        Ok(())
    }

    /// Discovers registered instances in deterministic order, evicting
    /// those whose heartbeat went stale.
    pub async fn instances(&self) -> QueueResult<Vec<InstanceRecord>> {
        let now = Utc::now().timestamp_millis();
        let stale_cutoff = now - self.record_ttl_ms() as i64;

        let mut conn = self.pool.get().await?;
        let keys: Vec<String> = conn.keys(self.keys.instance_pattern()).await?;

        let mut instances = Vec::new();
        for key in keys {
            let hash: HashMap<String, String> = conn.hgetall(&key).await?;
            let Some(record) = InstanceRecord::from_hash(&hash) else {
                continue;
            };

            if record.last_heartbeat < stale_cutoff {
                let _: () = conn.del(&key).await?;
                warn!(instance_id = %record.id, "Evicted stale instance");
                continue;
            }
            instances.push(record);
        }

        // Discovery order must agree across instances for the proportional
        // pass to converge.
        instances.sort_by(|a, b| (a.started_at, &a.id).cmp(&(b.started_at, &b.id)));
        Ok(instances)
    }

    /// One coordination cycle: heartbeat, discover, distribute, commit our
    /// share.
    pub async fn poll_once(&self) -> QueueResult<u32> {
        self.heartbeat().await?;

        let instances = self.instances().await?;
        if instances.is_empty() {
            return Err(QueueError::Coordination(
                "no registered instances, not even ours".into(),
            ));
        }

        let distribution = fair_distribution(&instances);
        let ours = distribution
            .iter()
            .find(|(id, _)| id == &self.instance_id)
            .map(|(_, share)| *share)
            .unwrap_or(0);

        self.workers_assigned.store(ours, Ordering::SeqCst);
        let mut conn = self.pool.get().await?;
        let _: () = conn
            .hset(
                self.keys.instance(&self.instance_id),
                "workers_assigned",
                ours.to_string(),
            )
            .await?;

        gauge!(
            names::COORDINATOR_WORKERS_ASSIGNED,
            "instance_id" => self.instance_id.clone()
        )
        .set(ours as f64);

        debug!(
            instance_id = %self.instance_id,
            workers = ours,
            instances = instances.len(),
            "Coordination cycle complete"
        );
        Ok(ours)
    }

    /// Signals the loop to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Registers and runs coordination cycles until stopped. Cycle errors
    /// are transient: they are logged and the next cycle recovers.
    pub async fn run(&self) -> QueueResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.register().await?;

        let interval = Duration::from_millis(self.config.work_coordination.poll_interval_ms);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.poll_once().await {
                        error!(instance_id = %self.instance_id, error = %e, "Coordination cycle failed");
                    }
                }
            }
        }

        // Leave the cluster politely so peers rebalance sooner.
        let mut conn = self.pool.get().await?;
        let _: () = conn.del(self.keys.instance(&self.instance_id)).await?;
        self.running.store(false, Ordering::SeqCst);
        info!(instance_id = %self.instance_id, "Coordinator stopped");
        Ok(())
    }

    /// Spawns a task that applies this coordinator's worker budget to a
    /// local worker every poll interval.
    pub fn attach_worker(self: &Arc<Self>, worker: Arc<Worker>) -> JoinHandle<()> {
        let coordinator = self.clone();
        let interval = Duration::from_millis(self.config.work_coordination.poll_interval_ms);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(interval) => {
                        worker.adjust_concurrency(coordinator.get_worker_count() as usize);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, max_workers: u32, assigned: u32) -> InstanceRecord {
        InstanceRecord {
            id: id.to_string(),
            max_workers,
            jobs_per_worker: 1,
            started_at: 0,
            last_heartbeat: 0,
            workers_assigned: assigned,
        }
    }

    #[test]
    fn test_record_codec_round_trip() {
        let record = instance("i-1", 8, 5);
        let hash: HashMap<String, String> = record.to_hash().into_iter().collect();
        assert_eq!(InstanceRecord::from_hash(&hash), Some(record));
    }

    #[test]
    fn test_even_distribution() {
        let instances = vec![instance("a", 4, 4), instance("b", 4, 4)];
        let shares = fair_distribution(&instances);
        assert_eq!(shares, vec![("a".to_string(), 4), ("b".to_string(), 4)]);
    }

    #[test]
    fn test_distribution_sums_to_target() {
        let instances = vec![
            instance("a", 5, 5),
            instance("b", 3, 3),
            instance("c", 2, 2),
        ];
        let shares = fair_distribution(&instances);
        let total: u32 = shares.iter().map(|(_, s)| *s).sum();
        assert_eq!(total, 10);
        for ((_, share), inst) in shares.iter().zip(&instances) {
            assert!(*share <= inst.max_workers);
        }
    }

    #[test]
    fn test_contraction_below_capacity() {
        // Cluster target is the assigned sum when below total capacity.
        let instances = vec![instance("a", 8, 2), instance("b", 8, 2)];
        let shares = fair_distribution(&instances);
        let total: u32 = shares.iter().map(|(_, s)| *s).sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn test_remainder_goes_to_least_loaded() {
        // Target 5 over capacities 4+4: the proportional pass floors to
        // 2+2, the remainder tops up the least loaded.
        let instances = vec![instance("a", 4, 5), instance("b", 4, 0)];
        let shares = fair_distribution(&instances);
        let total: u32 = shares.iter().map(|(_, s)| *s).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn test_empty_and_zero_capacity() {
        assert!(fair_distribution(&[]).is_empty());

        let instances = vec![instance("a", 0, 0)];
        assert_eq!(fair_distribution(&instances), vec![("a".to_string(), 0)]);
    }
}
