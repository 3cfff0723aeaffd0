//! Sliding-window rate limiting.
//!
//! Each identifier owns a sorted set of admission timestamps. Trimming the
//! window, counting, and admitting run as one server-side script so two
//! concurrent checks can never both pass `max`.

use crate::error::QueueResult;
use crate::redis::RedisKeys;
use deadpool_redis::Pool;
use chrono::Utc;
use redis::Script;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Trim the window, count, and admit in one step.
///
/// KEYS: limit zset. ARGV: now ms, duration ms, max, member.
/// Returns `{limited, remaining, reset_in_ms}`.
const CHECK_LUA: &str = r#"
local now = tonumber(ARGV[1])
local duration = tonumber(ARGV[2])
local max = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, now - duration)
local count = redis.call('ZCARD', KEYS[1])

local function reset_in()
  local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
  if oldest[2] then
    local reset = tonumber(oldest[2]) + duration - now
    if reset > 0 then return reset end
  end
  return 0
end

if count >= max then
  return {1, 0, reset_in()}
end

redis.call('ZADD', KEYS[1], now, ARGV[4])
redis.call('EXPIRE', KEYS[1], math.ceil(duration / 1000))
return {0, max - count - 1, reset_in()}
"#;

/// How the per-identifier key is derived from the payload.
#[derive(Clone)]
pub enum KeySource {
    /// Read a top-level field of the payload.
    Field(String),
    /// Derive the key with a caller-supplied function.
    Function(Arc<dyn Fn(&serde_json::Value) -> String + Send + Sync>),
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Field(field) => f.debug_tuple("Field").field(field).finish(),
            KeySource::Function(_) => f.debug_tuple("Function").finish(),
        }
    }
}

/// Rate limiter options.
#[derive(Debug, Clone)]
pub struct RateLimitOptions {
    /// Maximum admissions per window.
    pub max: u64,

    /// Window length in milliseconds.
    pub duration_ms: u64,

    /// Optional identifier derivation. When absent, the whole queue shares
    /// one window.
    pub key_source: Option<KeySource>,
}

impl RateLimitOptions {
    /// Creates options with one shared window per queue.
    pub fn new(max: u64, duration_ms: u64) -> Self {
        Self {
            max,
            duration_ms,
            key_source: None,
        }
    }

    /// Keys the window by a top-level payload field.
    pub fn keyed_by_field(mut self, field: impl Into<String>) -> Self {
        self.key_source = Some(KeySource::Field(field.into()));
        self
    }

    /// Keys the window with a derivation function.
    pub fn keyed_by(
        mut self,
        f: impl Fn(&serde_json::Value) -> String + Send + Sync + 'static,
    ) -> Self {
        self.key_source = Some(KeySource::Function(Arc::new(f)));
        self
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// The check was rejected.
    pub limited: bool,

    /// Admissions left in the current window.
    pub remaining: u64,

    /// Milliseconds until the oldest window entry expires.
    pub reset_in_ms: u64,
}

/// Sliding-window rate limiter for one queue.
#[derive(Clone)]
pub struct RateLimiter {
    pool: Pool,
    keys: RedisKeys,
    opts: RateLimitOptions,
    script: Script,
}

impl RateLimiter {
    /// Creates a limiter bound to one queue's keyspace.
    pub fn new(pool: Pool, keys: RedisKeys, opts: RateLimitOptions) -> Self {
        Self {
            pool,
            keys,
            opts,
            script: Script::new(CHECK_LUA),
        }
    }

    /// The limiter options.
    pub fn options(&self) -> &RateLimitOptions {
        &self.opts
    }

    /// Identifier for a payload: the queue name, suffixed by the derived
    /// key when one is configured.
    pub fn identifier(&self, data: &serde_json::Value) -> String {
        let queue = self.keys.queue_name();
        match &self.opts.key_source {
            None => queue.to_string(),
            Some(KeySource::Field(field)) => {
                let raw = match data.get(field) {
                    Some(serde_json::Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                format!("{queue}:{raw}")
            }
            Some(KeySource::Function(f)) => format!("{queue}:{}", f(data)),
        }
    }

    /// Checks whether this payload is admitted right now.
    pub async fn check(&self, data: &serde_json::Value) -> QueueResult<RateLimitStatus> {
        let identifier = self.identifier(data);
        let key = self.keys.rate_limit(&identifier);
        let now = Utc::now().timestamp_millis();
        let member = format!("{now}-{}", Uuid::new_v4());

        let mut conn = self.pool.get().await?;
        let reply: Vec<i64> = self
            .script
            .key(&key)
            .arg(now)
            .arg(self.opts.duration_ms)
            .arg(self.opts.max)
            .arg(&member)
            .invoke_async(&mut *conn)
            .await?;

        Ok(RateLimitStatus {
            limited: reply.first().copied().unwrap_or(0) == 1,
            remaining: reply.get(1).copied().unwrap_or(0).max(0) as u64,
            reset_in_ms: reply.get(2).copied().unwrap_or(0).max(0) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn limiter(opts: RateLimitOptions) -> RateLimiter {
        let cfg = deadpool_redis::Config::from_url("redis://localhost:6379");
        let pool = cfg
            .builder()
            .unwrap()
            .runtime(deadpool_redis::Runtime::Tokio1)
            .build()
            .unwrap();
        RateLimiter::new(pool, RedisKeys::new("queue", "emails"), opts)
    }

    #[test]
    fn test_identifier_defaults_to_queue_name() {
        let limiter = limiter(RateLimitOptions::new(2, 10_000));
        assert_eq!(limiter.identifier(&json!({"any": "thing"})), "emails");
    }

    #[test]
    fn test_identifier_from_field() {
        let limiter = limiter(RateLimitOptions::new(2, 10_000).keyed_by_field("tenant"));
        assert_eq!(
            limiter.identifier(&json!({"tenant": "acme"})),
            "emails:acme"
        );
        // Non-string fields stringify; missing fields fall back to empty.
        assert_eq!(limiter.identifier(&json!({"tenant": 7})), "emails:7");
        assert_eq!(limiter.identifier(&json!({})), "emails:");
    }

    #[test]
    fn test_identifier_from_function() {
        let limiter = limiter(
            RateLimitOptions::new(2, 10_000)
                .keyed_by(|data| data["a"].as_str().unwrap_or("x").to_uppercase()),
        );
        assert_eq!(limiter.identifier(&json!({"a": "bc"})), "emails:BC");
    }
}
