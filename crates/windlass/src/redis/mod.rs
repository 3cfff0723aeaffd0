//! Redis connection pool and keyspace.

mod scripts;

pub use scripts::QueueScripts;

use crate::config::RedisConfig;
use crate::error::{QueueError, QueueResult};
use deadpool_redis::{Config, Pool, Runtime};
use tracing::info;

/// Create a Redis connection pool and verify connectivity.
pub async fn create_pool(config: &RedisConfig) -> QueueResult<Pool> {
    let cfg = Config::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| QueueError::Configuration(format!("Invalid Redis config: {e}")))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| QueueError::Configuration(format!("Failed to create pool: {e}")))?;

    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<String>(&mut *conn).await?;

    info!(url = %config.url, pool_size = config.pool_size, "Redis connection pool ready");

    Ok(pool)
}

/// Key builder for one queue's slice of the keyspace.
///
/// Every key is namespaced `{prefix}:{queue}:...`, except the dead letter
/// store which hangs off the queue name itself (`{prefix}:{queue}-dead-letter`)
/// so it survives `empty()`.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
    queue: String,
}

impl RedisKeys {
    /// Creates a key builder for the given prefix and queue name.
    pub fn new(prefix: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            queue: queue.into(),
        }
    }

    /// The queue this builder is bound to.
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    fn scoped(&self, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, self.queue, suffix)
    }

    /// Waiting list. Producers LPUSH, workers claim from the tail.
    pub fn waiting(&self) -> String {
        self.scoped("waiting")
    }

    /// Active list (jobs under lease).
    pub fn active(&self) -> String {
        self.scoped("active")
    }

    /// Completed list, newest first.
    pub fn completed(&self) -> String {
        self.scoped("completed")
    }

    /// Failed list, newest first.
    pub fn failed(&self) -> String {
        self.scoped("failed")
    }

    /// Delayed sorted set, scored by fire time in unix milliseconds.
    pub fn delayed(&self) -> String {
        self.scoped("delayed")
    }

    /// Queue-wide pause flag.
    pub fn pause_flag(&self) -> String {
        self.scoped("paused")
    }

    /// List of jobs parked by a bulk pause.
    pub fn paused_jobs(&self) -> String {
        self.scoped("paused-jobs")
    }

    /// Set of jobs whose dependencies have not finished.
    pub fn dependency_wait(&self) -> String {
        self.scoped("dependency-wait")
    }

    /// Job record hash.
    pub fn job(&self, job_id: &str) -> String {
        self.scoped(&format!("job:{job_id}"))
    }

    /// Prefix shared by all job record hashes, used by scripts that build
    /// job keys server-side.
    pub fn job_prefix(&self) -> String {
        self.scoped("job:")
    }

    /// Reverse dependency index for one job.
    pub fn dependents(&self, job_id: &str) -> String {
        self.scoped(&format!("job:{job_id}:dependents"))
    }

    /// Priority level list. Higher index is served first.
    pub fn priority_level(&self, level: u32) -> String {
        self.scoped(&format!("priority:{level}"))
    }

    /// Sliding-window rate limit set for one identifier.
    pub fn rate_limit(&self, identifier: &str) -> String {
        self.scoped(&format!("limit:{identifier}"))
    }

    /// Resource lock key.
    pub fn lock(&self, resource: &str) -> String {
        self.scoped(&format!("lock:{resource}"))
    }

    /// Dead letter list for this queue.
    pub fn dead_letter_list(&self) -> String {
        format!("{}:{}-dead-letter", self.prefix, self.queue)
    }

    /// Dead letter entry hash.
    pub fn dead_letter_job(&self, job_id: &str) -> String {
        format!("{}:{}-dead-letter:{}", self.prefix, self.queue, job_id)
    }

    /// Pattern matching every key scoped to this queue.
    pub fn queue_pattern(&self) -> String {
        format!("{}:{}:*", self.prefix, self.queue)
    }
}

/// Keys shared across queues of one prefix (cluster coordination).
#[derive(Debug, Clone)]
pub struct ClusterKeys {
    prefix: String,
}

impl ClusterKeys {
    /// Creates a cluster key builder for the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Current leader record.
    pub fn leader(&self) -> String {
        format!("{}:leader:current", self.prefix)
    }

    /// Instance record hash.
    pub fn instance(&self, instance_id: &str) -> String {
        format!("{}:scaling:instance:{}", self.prefix, instance_id)
    }

    /// Pattern matching every instance record.
    pub fn instance_pattern(&self) -> String {
        format!("{}:scaling:instance:*", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_keys() {
        let keys = RedisKeys::new("queue", "emails");

        assert_eq!(keys.waiting(), "queue:emails:waiting");
        assert_eq!(keys.delayed(), "queue:emails:delayed");
        assert_eq!(keys.job("42"), "queue:emails:job:42");
        assert_eq!(keys.dependents("42"), "queue:emails:job:42:dependents");
        assert_eq!(keys.priority_level(3), "queue:emails:priority:3");
        assert_eq!(keys.rate_limit("emails"), "queue:emails:limit:emails");
        assert_eq!(keys.lock("job:42"), "queue:emails:lock:job:42");
        assert_eq!(keys.queue_pattern(), "queue:emails:*");
    }

    #[test]
    fn test_dead_letter_keys_survive_queue_pattern() {
        let keys = RedisKeys::new("queue", "emails");
        assert_eq!(keys.dead_letter_list(), "queue:emails-dead-letter");
        assert_eq!(keys.dead_letter_job("42"), "queue:emails-dead-letter:42");
        // Deleting `queue:emails:*` must not touch the dead letter store.
        assert!(!keys.dead_letter_list().starts_with("queue:emails:"));
    }

    #[test]
    fn test_cluster_keys() {
        let keys = ClusterKeys::new("queue");
        assert_eq!(keys.leader(), "queue:leader:current");
        assert_eq!(keys.instance("i-1"), "queue:scaling:instance:i-1");
        assert_eq!(keys.instance_pattern(), "queue:scaling:instance:*");
    }
}
