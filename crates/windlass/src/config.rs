//! Queue system configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for a queue and its attendant subsystems.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Redis connection configuration.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Worker loop configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Per-job lock configuration.
    #[serde(default)]
    pub lock: LockConfig,

    /// Stalled-job checker configuration.
    #[serde(default)]
    pub stalled: StalledConfig,

    /// Cleanup (retention) configuration.
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Dead letter queue configuration.
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,

    /// Horizontal scaling configuration.
    #[serde(default)]
    pub scaling: ScalingConfig,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Key prefix for all queue-related keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_key_prefix() -> String {
    "queue".to_string()
}

/// Worker loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum concurrent handler invocations on this instance.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Poll interval in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Default maximum attempts when submission options do not say.
    #[serde(default = "default_max_attempts")]
    pub default_attempts: u32,

    /// Graceful shutdown budget in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Disable per-job locking entirely. Only safe with a single instance.
    #[serde(default)]
    pub disable_locks: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval(),
            default_attempts: default_max_attempts(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            disable_locks: false,
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval() -> u64 {
    50
}

fn default_max_attempts() -> u32 {
    1
}

fn default_shutdown_timeout() -> u64 {
    30
}

/// Per-job distributed lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock duration in milliseconds.
    #[serde(default = "default_lock_duration")]
    pub duration_ms: u64,

    /// Acquisition retries before giving up.
    #[serde(default = "default_lock_retries")]
    pub retries: u32,

    /// Delay between acquisition retries in milliseconds.
    #[serde(default = "default_lock_retry_delay")]
    pub retry_delay_ms: u64,

    /// Auto-extend the lock while the handler runs.
    #[serde(default = "default_true")]
    pub auto_extend: bool,

    /// Auto-extension interval in milliseconds. Zero means two thirds of
    /// the lock duration.
    #[serde(default)]
    pub extend_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            duration_ms: default_lock_duration(),
            retries: default_lock_retries(),
            retry_delay_ms: default_lock_retry_delay(),
            auto_extend: true,
            extend_interval_ms: 0,
        }
    }
}

fn default_lock_duration() -> u64 {
    30_000
}

fn default_lock_retries() -> u32 {
    3
}

fn default_lock_retry_delay() -> u64 {
    200
}

fn default_true() -> bool {
    true
}

/// Stalled-job checker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalledConfig {
    /// Check interval in milliseconds.
    #[serde(default = "default_stalled_interval")]
    pub interval_ms: u64,

    /// Lease age after which an active job counts as stalled, in
    /// milliseconds.
    #[serde(default = "default_stalled_threshold")]
    pub threshold_ms: u64,

    /// How many times a stalled job is re-enqueued before it is failed.
    #[serde(default = "default_max_stalled_retries")]
    pub max_stalled_retries: u32,
}

impl Default for StalledConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_stalled_interval(),
            threshold_ms: default_stalled_threshold(),
            max_stalled_retries: default_max_stalled_retries(),
        }
    }
}

fn default_stalled_interval() -> u64 {
    30_000
}

fn default_stalled_threshold() -> u64 {
    10_000
}

fn default_max_stalled_retries() -> u32 {
    3
}

/// Cleanup (retention) configuration for completed and failed jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Cleanup interval in seconds.
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,

    /// Completed job lifetime in seconds.
    #[serde(default = "default_completed_lifetime")]
    pub completed_lifetime_secs: u64,

    /// Failed job lifetime in seconds.
    #[serde(default = "default_failed_lifetime")]
    pub failed_lifetime_secs: u64,

    /// Maximum entries kept per terminal list after age trimming.
    #[serde(default = "default_max_kept")]
    pub max_kept: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            completed_lifetime_secs: default_completed_lifetime(),
            failed_lifetime_secs: default_failed_lifetime(),
            max_kept: default_max_kept(),
        }
    }
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_completed_lifetime() -> u64 {
    86_400 // 24 h
}

fn default_failed_lifetime() -> u64 {
    86_400 * 7
}

fn default_max_kept() -> usize {
    1000
}

/// Dead letter queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// Enable the dead letter queue.
    #[serde(default)]
    pub enabled: bool,

    /// Attempts after which an exhausted job is moved, when enabled.
    #[serde(default = "default_dlq_max_retries")]
    pub max_retries: u32,

    /// Remove the entry from the source queue's failed list when moved.
    #[serde(default = "default_true")]
    pub remove_from_original_queue: bool,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: default_dlq_max_retries(),
            remove_from_original_queue: true,
        }
    }
}

fn default_dlq_max_retries() -> u32 {
    3
}

/// Horizontal scaling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    /// Enable multi-instance coordination.
    #[serde(default)]
    pub enabled: bool,

    /// Instance id. Generated when empty.
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Worker budget this instance is willing to run.
    #[serde(default = "default_max_workers")]
    pub max_workers_per_instance: u32,

    /// Advisory jobs-per-worker hint published with the instance record.
    #[serde(default = "default_jobs_per_worker")]
    pub jobs_per_worker: u32,

    /// Leader election tuning.
    #[serde(default)]
    pub leader_election: LeaderElectionConfig,

    /// Work coordination tuning.
    #[serde(default)]
    pub work_coordination: WorkCoordinationConfig,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            instance_id: None,
            max_workers_per_instance: default_max_workers(),
            jobs_per_worker: default_jobs_per_worker(),
            leader_election: LeaderElectionConfig::default(),
            work_coordination: WorkCoordinationConfig::default(),
        }
    }
}

fn default_max_workers() -> u32 {
    4
}

fn default_jobs_per_worker() -> u32 {
    1
}

/// Leader election tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderElectionConfig {
    /// Watchdog interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Leader record TTL in milliseconds.
    #[serde(default = "default_leader_timeout")]
    pub leader_timeout_ms: u64,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval(),
            leader_timeout_ms: default_leader_timeout(),
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    5_000
}

fn default_leader_timeout() -> u64 {
    15_000
}

/// Work coordination tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkCoordinationConfig {
    /// Coordinator poll interval in milliseconds.
    #[serde(default = "default_coordination_poll")]
    pub poll_interval_ms: u64,

    /// Key prefix for coordination keys. Defaults to the queue prefix.
    #[serde(default)]
    pub key_prefix: Option<String>,
}

impl Default for WorkCoordinationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_coordination_poll(),
            key_prefix: None,
        }
    }
}

fn default_coordination_poll() -> u64 {
    5_000
}

impl WorkerConfig {
    /// Returns the poll interval as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the shutdown budget as a Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl LockConfig {
    /// Returns the lock duration as a Duration.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Effective auto-extension interval: two thirds of the duration unless
    /// overridden.
    pub fn extend_interval(&self) -> Duration {
        if self.extend_interval_ms > 0 {
            Duration::from_millis(self.extend_interval_ms)
        } else {
            Duration::from_millis(self.duration_ms * 2 / 3)
        }
    }
}

impl StalledConfig {
    /// Returns the check interval as a Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl LeaderElectionConfig {
    /// Heartbeat refresh interval while leading: a third of the watchdog
    /// interval, never under one second.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis((self.heartbeat_interval_ms / 3).max(1_000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert_eq!(config.redis.key_prefix, "queue");
        assert_eq!(config.worker.poll_interval_ms, 50);
        assert_eq!(config.lock.duration_ms, 30_000);
        assert_eq!(config.stalled.threshold_ms, 10_000);
        assert_eq!(config.cleanup.max_kept, 1000);
        assert!(!config.dead_letter.enabled);
        assert!(!config.scaling.enabled);
    }

    #[test]
    fn test_extend_interval_defaults_to_two_thirds() {
        let lock = LockConfig::default();
        assert_eq!(lock.extend_interval(), Duration::from_millis(20_000));

        let lock = LockConfig {
            extend_interval_ms: 5_000,
            ..LockConfig::default()
        };
        assert_eq!(lock.extend_interval(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_leader_refresh_interval_floor() {
        let config = LeaderElectionConfig {
            heartbeat_interval_ms: 1_500,
            leader_timeout_ms: 15_000,
        };
        assert_eq!(config.refresh_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let config: QueueConfig =
            serde_json::from_str(r#"{"worker": {"concurrency": 16}}"#).unwrap();
        assert_eq!(config.worker.concurrency, 16);
        assert_eq!(config.worker.poll_interval_ms, 50);
        assert_eq!(config.redis.pool_size, 10);
    }
}
