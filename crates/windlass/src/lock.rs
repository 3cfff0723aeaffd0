//! Distributed resource locks.
//!
//! Acquisition is a conditional set with a millisecond TTL; the stored token
//! names the holder. Release and extension are compare-and-act scripts, so a
//! lock that expired and was re-acquired elsewhere can never be released or
//! refreshed by the previous holder.

use crate::error::{QueueError, QueueResult};
use crate::id::lock_token;
use deadpool_redis::Pool;
use redis::Script;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Delete the key iff the caller still owns it.
const RELEASE_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Refresh the TTL iff the caller still owns the key.
const EXTEND_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Lock acquisition options.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Lock TTL.
    pub duration: Duration,

    /// Acquisition retries after the first attempt.
    pub retries: u32,

    /// Delay between acquisition attempts.
    pub retry_delay: Duration,

    /// Refresh the TTL in the background while the lock is held.
    pub auto_extend: bool,

    /// Refresh interval. `None` means two thirds of the duration.
    pub extend_interval: Option<Duration>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(30),
            retries: 3,
            retry_delay: Duration::from_millis(200),
            auto_extend: false,
            extend_interval: None,
        }
    }
}

impl LockOptions {
    /// Builds options from the queue lock configuration.
    pub fn from_config(config: &crate::config::LockConfig) -> Self {
        Self {
            duration: config.duration(),
            retries: config.retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            auto_extend: config.auto_extend,
            extend_interval: Some(config.extend_interval()),
        }
    }

    fn effective_extend_interval(&self) -> Duration {
        self.extend_interval
            .unwrap_or_else(|| self.duration * 2 / 3)
    }
}

/// Factory for locks under one key prefix.
#[derive(Clone)]
pub struct LockManager {
    pool: Pool,
    prefix: String,
    release_script: Script,
    extend_script: Script,
}

impl LockManager {
    /// Creates a lock manager. Lock keys are `{prefix}:lock:{resource}`.
    pub fn new(pool: Pool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            release_script: Script::new(RELEASE_LUA),
            extend_script: Script::new(EXTEND_LUA),
        }
    }

    fn key(&self, resource: &str) -> String {
        format!("{}:lock:{}", self.prefix, resource)
    }

    /// Attempts to take the lock, retrying per the options. Returns `None`
    /// when every attempt found the resource held by someone else.
    pub async fn acquire(
        &self,
        resource: &str,
        opts: &LockOptions,
    ) -> QueueResult<Option<LockHandle>> {
        let key = self.key(resource);
        let token = lock_token();
        let ttl_ms = opts.duration.as_millis() as u64;

        for attempt in 0..=opts.retries {
            let mut conn = self.pool.get().await?;
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut *conn)
                .await?;
            drop(conn);

            if acquired.is_some() {
                debug!(resource = %resource, attempt, "Acquired lock");
                return Ok(Some(LockHandle::new(self.clone(), key, token, opts)));
            }

            if attempt < opts.retries {
                tokio::time::sleep(opts.retry_delay).await;
            }
        }

        Ok(None)
    }

    /// Releases the resource iff `token` still owns it.
    pub async fn release(&self, resource: &str, token: &str) -> QueueResult<bool> {
        self.release_key(&self.key(resource), token).await
    }

    /// Refreshes the TTL iff `token` still owns the resource.
    pub async fn extend(
        &self,
        resource: &str,
        token: &str,
        duration: Duration,
    ) -> QueueResult<bool> {
        self.extend_key(&self.key(resource), token, duration).await
    }

    /// True while any holder owns the resource.
    pub async fn is_locked(&self, resource: &str) -> QueueResult<bool> {
        let mut conn = self.pool.get().await?;
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.key(resource))
            .query_async(&mut *conn)
            .await?;
        Ok(exists)
    }

    /// Runs `f` under the lock, releasing on every exit path. Fails with
    /// [`QueueError::LockUnavailable`] when acquisition exhausts its retries.
    pub async fn with_lock<F, Fut, T>(
        &self,
        resource: &str,
        opts: &LockOptions,
        f: F,
    ) -> QueueResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = QueueResult<T>>,
    {
        let handle = self
            .acquire(resource, opts)
            .await?
            .ok_or_else(|| QueueError::LockUnavailable(resource.to_string()))?;

        let result = f().await;

        if let Err(e) = handle.release().await {
            warn!(resource = %resource, error = %e, "Failed to release lock");
        }

        result
    }

    async fn release_key(&self, key: &str, token: &str) -> QueueResult<bool> {
        let mut conn = self.pool.get().await?;
        let released: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut *conn)
            .await?;
        Ok(released == 1)
    }

    async fn extend_key(&self, key: &str, token: &str, duration: Duration) -> QueueResult<bool> {
        let mut conn = self.pool.get().await?;
        let extended: i64 = self
            .extend_script
            .key(key)
            .arg(token)
            .arg(duration.as_millis() as u64)
            .invoke_async(&mut *conn)
            .await?;
        Ok(extended == 1)
    }
}

/// A held lock. Dropping the handle cancels auto-extension and lets the TTL
/// free the resource; call [`LockHandle::release`] to free it immediately.
pub struct LockHandle {
    manager: LockManager,
    key: String,
    token: String,
    extend_task: Option<JoinHandle<()>>,
}

impl LockHandle {
    fn new(manager: LockManager, key: String, token: String, opts: &LockOptions) -> Self {
        let extend_task = if opts.auto_extend {
            let interval = opts.effective_extend_interval();
            let duration = opts.duration;
            let task_manager = manager.clone();
            let task_key = key.clone();
            let task_token = token.clone();

            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await; // immediate first tick
                loop {
                    ticker.tick().await;
                    match task_manager
                        .extend_key(&task_key, &task_token, duration)
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => {
                            // Lock lost to expiry; stop silently.
                            debug!(key = %task_key, "Lock no longer owned, stopping auto-extend");
                            break;
                        }
                        Err(e) => {
                            debug!(key = %task_key, error = %e, "Lock extension failed");
                        }
                    }
                }
            }))
        } else {
            None
        };

        Self {
            manager,
            key,
            token,
            extend_task,
        }
    }

    /// The holder token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Stops auto-extension and releases the lock. Returns false when the
    /// lock had already been lost.
    pub async fn release(mut self) -> QueueResult<bool> {
        if let Some(task) = self.extend_task.take() {
            task.abort();
        }
        self.manager.release_key(&self.key, &self.token).await
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(task) = self.extend_task.take() {
            task.abort();
        }
    }
}
