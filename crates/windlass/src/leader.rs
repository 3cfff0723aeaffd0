//! Leader election.
//!
//! One instance at a time owns the leader record
//! (`"{instanceId}:{unixMillis}"` with TTL) and runs cluster-singleton work.
//! A watchdog timer tries to take over an absent or expired record; while
//! leading, a faster heartbeat refreshes the record unconditionally.

use crate::config::LeaderElectionConfig;
use crate::error::QueueResult;
use crate::metrics::names;
use crate::redis::ClusterKeys;
use chrono::Utc;
use deadpool_redis::Pool;
use metrics::gauge;
use parking_lot::RwLock;
use redis::{AsyncCommands, Script};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Delete the leader record iff this instance still owns it.
const STEP_DOWN_LUA: &str = r#"
local value = redis.call('GET', KEYS[1])
if value and string.find(value, ARGV[1] .. ':', 1, true) == 1 then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Election role of this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    /// Observing; someone else leads.
    Follower,
    /// Attempting to take over an absent or expired record.
    Candidate,
    /// This instance leads.
    Leader,
}

impl LeaderState {
    fn from_u8(value: u8) -> Self {
        match value {
            2 => LeaderState::Leader,
            1 => LeaderState::Candidate,
            _ => LeaderState::Follower,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LeaderState::Follower => 0,
            LeaderState::Candidate => 1,
            LeaderState::Leader => 2,
        }
    }
}

/// Parsed leader record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderInfo {
    /// Leading instance id.
    pub instance_id: String,

    /// When the record was last written, unix milliseconds.
    pub timestamp: i64,
}

/// Parses `"{instanceId}:{unixMillis}"`.
fn parse_leader_record(value: &str) -> Option<LeaderInfo> {
    let (instance_id, raw_ts) = value.rsplit_once(':')?;
    let timestamp = raw_ts.parse().ok()?;
    Some(LeaderInfo {
        instance_id: instance_id.to_string(),
        timestamp,
    })
}

type LeaderCallback = Box<dyn Fn() + Send + Sync>;

/// Leader election for one instance.
pub struct LeaderElection {
    instance_id: String,
    pool: Pool,
    keys: ClusterKeys,
    config: LeaderElectionConfig,
    state: AtomicU8,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    step_down_script: Script,
    on_become_leader: RwLock<Option<LeaderCallback>>,
    on_leadership_lost: RwLock<Option<LeaderCallback>>,
}

impl LeaderElection {
    /// Creates the election participant.
    pub fn new(
        pool: Pool,
        key_prefix: impl Into<String>,
        instance_id: impl Into<String>,
        config: LeaderElectionConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            instance_id: instance_id.into(),
            pool,
            keys: ClusterKeys::new(key_prefix),
            config,
            state: AtomicU8::new(LeaderState::Follower.as_u8()),
            running: AtomicBool::new(false),
            shutdown_tx,
            step_down_script: Script::new(STEP_DOWN_LUA),
            on_become_leader: RwLock::new(None),
            on_leadership_lost: RwLock::new(None),
        }
    }

    /// This instance's id.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Current role.
    pub fn state(&self) -> LeaderState {
        LeaderState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// True while this instance leads.
    pub fn is_leader(&self) -> bool {
        self.state() == LeaderState::Leader
    }

    /// Registers the callback fired on winning an election.
    pub fn on_become_leader(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.on_become_leader.write() = Some(Box::new(f));
    }

    /// Registers the callback fired on losing leadership.
    pub fn on_leadership_lost(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.on_leadership_lost.write() = Some(Box::new(f));
    }

    /// Reads and validates the current leader record. An expired record
    /// (older than the leader timeout) reads as no leader.
    pub async fn get_current_leader(&self) -> QueueResult<Option<LeaderInfo>> {
        let mut conn = self.pool.get().await?;
        let value: Option<String> = conn.get(self.keys.leader()).await?;
        drop(conn);

        let Some(info) = value.as_deref().and_then(parse_leader_record) else {
            return Ok(None);
        };

        let now = Utc::now().timestamp_millis();
        if now - info.timestamp > self.config.leader_timeout_ms as i64 {
            return Ok(None);
        }
        Ok(Some(info))
    }

    /// Deletes the leader record iff still owned, then steps back to
    /// follower.
    pub async fn step_down(&self) -> QueueResult<()> {
        let mut conn = self.pool.get().await?;
        let _: i64 = self
            .step_down_script
            .key(self.keys.leader())
            .arg(&self.instance_id)
            .invoke_async(&mut *conn)
            .await?;
        drop(conn);

        if self.state() == LeaderState::Leader {
            self.become_follower();
        }
        info!(instance_id = %self.instance_id, "Stepped down");
        Ok(())
    }

    /// Signals the loop to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Runs the watchdog and heartbeat timers until stopped. Steps down on
    /// the way out.
    pub async fn run(&self) -> QueueResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let watchdog_interval =
            std::time::Duration::from_millis(self.config.heartbeat_interval_ms);
        let refresh_interval = self.config.refresh_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(
            instance_id = %self.instance_id,
            watchdog_ms = self.config.heartbeat_interval_ms,
            leader_timeout_ms = self.config.leader_timeout_ms,
            "Leader election started"
        );

        let mut watchdog = tokio::time::interval(watchdog_interval);
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(refresh_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = watchdog.tick() => {
                    if let Err(e) = self.watchdog_tick().await {
                        error!(instance_id = %self.instance_id, error = %e, "Watchdog tick failed");
                    }
                }
                _ = heartbeat.tick() => {
                    if self.is_leader() {
                        if let Err(e) = self.heartbeat_tick().await {
                            warn!(instance_id = %self.instance_id, error = %e, "Heartbeat failed");
                        }
                    }
                }
            }
        }

        if let Err(e) = self.step_down().await {
            warn!(instance_id = %self.instance_id, error = %e, "Step down on shutdown failed");
        }
        self.running.store(false, Ordering::SeqCst);
        info!(instance_id = %self.instance_id, "Leader election stopped");
        Ok(())
    }

    /// Watchdog: read the record; take over when it is absent or expired;
    /// detect usurpation when we believe we lead.
    async fn watchdog_tick(&self) -> QueueResult<()> {
        let mut conn = self.pool.get().await?;
        let value: Option<String> = conn.get(self.keys.leader()).await?;
        drop(conn);

        let now = Utc::now().timestamp_millis();
        let current = value.as_deref().and_then(parse_leader_record);

        match current {
            Some(info) if info.instance_id == self.instance_id => Ok(()),
            Some(info) if now - info.timestamp <= self.config.leader_timeout_ms as i64 => {
                // A live foreign record. If we thought we led, we were
                // usurped after an expiry.
                if self.state() == LeaderState::Leader {
                    warn!(
                        instance_id = %self.instance_id,
                        leader = %info.instance_id,
                        "Leadership lost to another instance"
                    );
                    self.become_follower();
                }
                Ok(())
            }
            _ => self.try_acquire(now).await,
        }
    }

    /// Conditional set of the leader record.
    async fn try_acquire(&self, now: i64) -> QueueResult<()> {
        self.state
            .store(LeaderState::Candidate.as_u8(), Ordering::SeqCst);

        let record = format!("{}:{now}", self.instance_id);
        let mut conn = self.pool.get().await?;
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.keys.leader())
            .arg(&record)
            .arg("NX")
            .arg("PX")
            .arg(self.config.leader_timeout_ms)
            .query_async(&mut *conn)
            .await?;
        drop(conn);

        if acquired.is_some() {
            self.become_leader();
        } else {
            self.state
                .store(LeaderState::Follower.as_u8(), Ordering::SeqCst);
        }
        Ok(())
    }

    /// Unconditional refresh while leading. A failed write costs
    /// leadership; the next watchdog read settles who leads.
    async fn heartbeat_tick(&self) -> QueueResult<()> {
        let record = format!("{}:{}", self.instance_id, Utc::now().timestamp_millis());
        let mut conn = self.pool.get().await?;
        let result: Result<(), redis::RedisError> = redis::cmd("SET")
            .arg(self.keys.leader())
            .arg(&record)
            .arg("PX")
            .arg(self.config.leader_timeout_ms)
            .query_async(&mut *conn)
            .await;

        if let Err(e) = result {
            warn!(instance_id = %self.instance_id, error = %e, "Heartbeat write failed");
            self.become_follower();
        }
        Ok(())
    }

    fn become_leader(&self) {
        self.state
            .store(LeaderState::Leader.as_u8(), Ordering::SeqCst);
        gauge!(names::LEADER_IS_LEADER, "instance_id" => self.instance_id.clone()).set(1.0);
        info!(instance_id = %self.instance_id, "Became leader");
        if let Some(callback) = self.on_become_leader.read().as_ref() {
            callback();
        }
    }

    fn become_follower(&self) {
        self.state
            .store(LeaderState::Follower.as_u8(), Ordering::SeqCst);
        gauge!(names::LEADER_IS_LEADER, "instance_id" => self.instance_id.clone()).set(0.0);
        debug!(instance_id = %self.instance_id, "Became follower");
        if let Some(callback) = self.on_leadership_lost.read().as_ref() {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_leader_record() {
        let info = parse_leader_record("instance-abc:1700000000000").unwrap();
        assert_eq!(info.instance_id, "instance-abc");
        assert_eq!(info.timestamp, 1_700_000_000_000);

        assert!(parse_leader_record("no-timestamp").is_none());
        assert!(parse_leader_record("id:not-a-number").is_none());
    }

    #[test]
    fn test_parse_keeps_colons_in_instance_id() {
        let info = parse_leader_record("host:8080:1700000000000").unwrap();
        assert_eq!(info.instance_id, "host:8080");
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            LeaderState::Follower,
            LeaderState::Candidate,
            LeaderState::Leader,
        ] {
            assert_eq!(LeaderState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_callbacks_fire_on_transitions() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let cfg = deadpool_redis::Config::from_url("redis://localhost:6379");
        let pool = cfg
            .builder()
            .unwrap()
            .runtime(deadpool_redis::Runtime::Tokio1)
            .build()
            .unwrap();
        let election =
            LeaderElection::new(pool, "queue", "instance-1", LeaderElectionConfig::default());

        let won = Arc::new(AtomicUsize::new(0));
        let lost = Arc::new(AtomicUsize::new(0));
        let won_counter = won.clone();
        let lost_counter = lost.clone();
        election.on_become_leader(move || {
            won_counter.fetch_add(1, Ordering::SeqCst);
        });
        election.on_leadership_lost(move || {
            lost_counter.fetch_add(1, Ordering::SeqCst);
        });

        election.become_leader();
        assert!(election.is_leader());
        assert_eq!(won.load(Ordering::SeqCst), 1);

        election.become_follower();
        assert_eq!(election.state(), LeaderState::Follower);
        assert_eq!(lost.load(Ordering::SeqCst), 1);
    }
}
