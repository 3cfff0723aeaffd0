//! Priority pump.
//!
//! A priority queue keeps one list per level; a fast pump drains them into
//! `waiting` (highest level first, within-level order preserved) so the
//! generic worker loop serves the highest-priority items first. Dynamic
//! reordering re-reads each parked job's current priority option and
//! re-buckets it, in one server-side pass so the pump cannot interleave.

use crate::error::{QueueError, QueueResult};
use crate::events::QueueEvent;
use crate::queue::Queue;
use redis::Script;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Re-bucket every parked job by its current `priority` option.
///
/// KEYS: level lists, lowest level first. ARGV: job key prefix.
const REORDER_LUA: &str = r#"
local entries = {}
for k = 1, #KEYS do
  local ids = redis.call('LRANGE', KEYS[k], 0, -1)
  for i = 1, #ids do
    entries[#entries + 1] = ids[i]
  end
  redis.call('DEL', KEYS[k])
end

local moved = 0
for i = 1, #entries do
  local level = 0
  local opts = redis.call('HGET', ARGV[1] .. entries[i], 'opts')
  if opts then
    local ok, parsed = pcall(cjson.decode, opts)
    if ok and type(parsed) == 'table' and type(parsed['priority']) == 'number' then
      level = parsed['priority']
    end
  end
  if level < 0 then level = 0 end
  if level >= #KEYS then level = #KEYS - 1 end
  redis.call('RPUSH', KEYS[level + 1], entries[i])
  moved = moved + 1
end
return moved
"#;

/// Default pump cadence.
const DEFAULT_PUMP_INTERVAL: Duration = Duration::from_millis(25);

/// Pump task for one priority queue.
pub struct PriorityPump {
    queue: Arc<Queue>,
    levels: u32,
    pump_interval: Duration,
    reorder_interval: Option<Duration>,
    reorder_script: Script,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl PriorityPump {
    /// Creates the pump. Fails when the queue has no priority levels.
    pub fn new(queue: Arc<Queue>) -> QueueResult<Self> {
        let levels = queue.priority_levels().ok_or_else(|| {
            QueueError::Configuration("priority pump needs a priority queue".into())
        })?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            queue,
            levels,
            pump_interval: DEFAULT_PUMP_INTERVAL,
            reorder_interval: None,
            reorder_script: Script::new(REORDER_LUA),
            running: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    /// Overrides the pump cadence.
    pub fn with_pump_interval(mut self, interval: Duration) -> Self {
        self.pump_interval = interval;
        self
    }

    /// Enables periodic dynamic reordering. Jobs the pump already moved to
    /// `waiting` keep their effective order.
    pub fn with_reordering(mut self, interval: Duration) -> Self {
        self.reorder_interval = Some(interval);
        self
    }

    /// Signals the loop to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Runs the pump (and reordering, when enabled) until stopped.
    pub async fn run(&self) -> QueueResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut pump = tokio::time::interval(self.pump_interval);
        pump.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut reorder = tokio::time::interval(
            self.reorder_interval
                .unwrap_or(Duration::from_secs(3600)),
        );
        reorder.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        reorder.tick().await; // swallow the immediate tick

        info!(
            queue = %self.queue.name(),
            levels = self.levels,
            pump_ms = self.pump_interval.as_millis() as u64,
            reordering = self.reorder_interval.is_some(),
            "Priority pump started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = pump.tick() => {
                    if let Err(e) = self.queue.pump_priorities().await {
                        error!(queue = %self.queue.name(), error = %e, "Priority pump failed");
                        self.queue.events().emit(QueueEvent::Error {
                            queue: self.queue.name().to_string(),
                            message: e.to_string(),
                        });
                    }
                }
                _ = reorder.tick(), if self.reorder_interval.is_some() => {
                    if let Err(e) = self.reorder_once().await {
                        error!(queue = %self.queue.name(), error = %e, "Priority reorder failed");
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue.name(), "Priority pump stopped");
        Ok(())
    }

    /// One reordering pass over the level lists only.
    pub async fn reorder_once(&self) -> QueueResult<u64> {
        let mut conn = self.queue.pool().get().await?;
        let mut invocation = self.reorder_script.prepare_invoke();
        for level in 0..self.levels {
            invocation.key(self.queue.keys().priority_level(level));
        }
        invocation.arg(self.queue.keys().job_prefix());
        let moved: u64 = invocation.invoke_async(&mut *conn).await?;

        if moved > 0 {
            debug!(queue = %self.queue.name(), moved, "Reordered parked priority jobs");
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;

    fn priority_queue(levels: u32) -> Arc<Queue> {
        let cfg = deadpool_redis::Config::from_url("redis://localhost:6379");
        let pool = cfg
            .builder()
            .unwrap()
            .runtime(deadpool_redis::Runtime::Tokio1)
            .build()
            .unwrap();
        Arc::new(
            Queue::with_pool("unit", pool, QueueConfig::default())
                .with_priority_levels(levels)
                .unwrap(),
        )
    }

    #[test]
    fn test_pump_requires_priority_queue() {
        let cfg = deadpool_redis::Config::from_url("redis://localhost:6379");
        let pool = cfg
            .builder()
            .unwrap()
            .runtime(deadpool_redis::Runtime::Tokio1)
            .build()
            .unwrap();
        let plain = Arc::new(Queue::with_pool("unit", pool, QueueConfig::default()));
        assert!(PriorityPump::new(plain).is_err());
    }

    #[test]
    fn test_pump_construction() {
        let pump = PriorityPump::new(priority_queue(5))
            .unwrap()
            .with_pump_interval(Duration::from_millis(10))
            .with_reordering(Duration::from_secs(1));
        assert_eq!(pump.levels, 5);
        assert_eq!(pump.pump_interval, Duration::from_millis(10));
        assert_eq!(pump.reorder_interval, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_zero_levels_rejected() {
        let cfg = deadpool_redis::Config::from_url("redis://localhost:6379");
        let pool = cfg
            .builder()
            .unwrap()
            .runtime(deadpool_redis::Runtime::Tokio1)
            .build()
            .unwrap();
        assert!(Queue::with_pool("unit", pool, QueueConfig::default())
            .with_priority_levels(0)
            .is_err());
    }
}
