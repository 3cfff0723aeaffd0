//! Server-side scripts for check-and-act state moves.
//!
//! Every transition that must observe and mutate multiple keys without a
//! competing claimer interleaving runs as one Lua script.

use redis::Script;

/// Claim one job: remove it from the serving end of `waiting` and, if it was
/// actually there, push it onto `active` and stamp the record.
///
/// KEYS: waiting, active, job hash. ARGV: job id, processed_on millis.
const CLAIM_LUA: &str = r#"
if redis.call('LREM', KEYS[1], -1, ARGV[1]) == 1 then
  redis.call('LPUSH', KEYS[2], ARGV[1])
  redis.call('HSET', KEYS[3], 'state', 'active', 'processed_on', ARGV[2])
  return 1
end
return 0
"#;

/// Move a job between two lists iff it is still in the source list, updating
/// the record's state field in the same step.
///
/// KEYS: source list, destination list, job hash.
/// ARGV: job id, new state name.
const MOVE_LUA: &str = r#"
if redis.call('LREM', KEYS[1], -1, ARGV[1]) == 1 then
  redis.call('RPUSH', KEYS[2], ARGV[1])
  redis.call('HSET', KEYS[3], 'state', ARGV[2])
  return 1
end
return 0
"#;

/// Promote every delayed job whose fire time has passed to the serving end
/// of `waiting`.
///
/// KEYS: delayed zset, waiting list. ARGV: now millis, job key prefix.
const PROMOTE_DELAYED_LUA: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], 0, ARGV[1])
for i = 1, #ids do
  redis.call('ZREM', KEYS[1], ids[i])
  redis.call('RPUSH', KEYS[2], ids[i])
  redis.call('HSET', ARGV[2] .. ids[i], 'state', 'waiting')
end
return ids
"#;

/// Drain priority level lists into `waiting` so the highest level is served
/// first and within-level order is preserved.
///
/// KEYS: waiting, then level lists ordered highest priority first.
const DRAIN_PRIORITY_LUA: &str = r#"
local moved = 0
for k = #KEYS, 2, -1 do
  local ids = redis.call('LRANGE', KEYS[k], 0, -1)
  for i = 1, #ids do
    redis.call('RPUSH', KEYS[1], ids[i])
  end
  if #ids > 0 then
    redis.call('DEL', KEYS[k])
  end
  moved = moved + #ids
end
return moved
"#;

/// Promote one dependency-waiting job to `waiting` iff it is still parked.
///
/// KEYS: dependency-wait set, waiting list, job hash. ARGV: job id.
const PROMOTE_DEPENDENT_LUA: &str = r#"
if redis.call('SREM', KEYS[1], ARGV[1]) == 1 then
  redis.call('RPUSH', KEYS[2], ARGV[1])
  redis.call('HSET', KEYS[3], 'state', 'waiting')
  return 1
end
return 0
"#;

/// Scripts used by the queue and worker, compiled once per queue.
#[derive(Clone)]
pub struct QueueScripts {
    claim: Script,
    move_job: Script,
    promote_delayed: Script,
    drain_priority: Script,
    promote_dependent: Script,
}

impl QueueScripts {
    /// Builds the script set.
    pub fn new() -> Self {
        Self {
            claim: Script::new(CLAIM_LUA),
            move_job: Script::new(MOVE_LUA),
            promote_delayed: Script::new(PROMOTE_DELAYED_LUA),
            drain_priority: Script::new(DRAIN_PRIORITY_LUA),
            promote_dependent: Script::new(PROMOTE_DEPENDENT_LUA),
        }
    }

    /// The waiting → active claim script.
    pub fn claim(&self) -> &Script {
        &self.claim
    }

    /// The guarded list-to-list move script.
    pub fn move_job(&self) -> &Script {
        &self.move_job
    }

    /// The delayed promotion script.
    pub fn promote_delayed(&self) -> &Script {
        &self.promote_delayed
    }

    /// The priority pump script.
    pub fn drain_priority(&self) -> &Script {
        &self.drain_priority
    }

    /// The dependency promotion script.
    pub fn promote_dependent(&self) -> &Script {
        &self.promote_dependent
    }
}

impl Default for QueueScripts {
    fn default() -> Self {
        Self::new()
    }
}
