//! Windlass - Redis-backed distributed job queue
//!
//! Producers submit jobs to named queues; worker instances, possibly spread
//! across processes and hosts, consume them concurrently with:
//! - At-least-once delivery with idempotent handlers
//! - Retries with fixed or exponential backoff
//! - Delayed and cron-recurring execution
//! - Priority levels with a fast pump into the waiting list
//! - Dependency ordering and dead-letter handling
//! - Per-job distributed locks and stalled-job recovery
//! - Leader election and fair worker distribution across instances
//!
//! # Architecture
//!
//! ```text
//! producer ──► Queue::add ──► delayed zset │ priority lists │ waiting list
//!                                  │              │              │
//!                      promoter ───┘    pump ─────┘              │
//!                                                                ▼
//!                               worker loop ──► active ──► completed / failed
//!                                   │                          │
//!                            per-job lock                 retry / backoff
//!                                   │                          │
//!                           stalled checker             dead letter queue
//!
//! cluster: leader election (singleton tasks) + work coordinator (fair
//! worker budgets per instance)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use windlass::{JobOptions, Queue, QueueConfig, Worker};
//! use futures::FutureExt;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let queue = Arc::new(Queue::connect("emails", QueueConfig::default()).await?);
//!
//! queue.add(json!({"to": "user@example.com"}), JobOptions::default()).await?;
//!
//! let worker = Worker::new(
//!     queue.clone(),
//!     Arc::new(|job| async move {
//!         // send the email...
//!         Ok(json!({"sent": true}))
//!     }.boxed()),
//! );
//! worker.run().await?;
//! ```

pub mod cleanup;
pub mod config;
pub mod coordinator;
pub mod cron;
pub mod dlq;
pub mod error;
pub mod events;
pub mod group;
pub mod id;
pub mod job;
pub mod leader;
pub mod lock;
pub mod metrics;
pub mod priority;
pub mod queue;
pub mod rate_limit;
pub mod redis;
pub mod scheduler;
pub mod stalled;
pub mod worker;

pub use cleanup::{Cleanup, CleanupStats};
pub use config::{
    CleanupConfig, DeadLetterConfig, LeaderElectionConfig, LockConfig, QueueConfig, RedisConfig,
    ScalingConfig, StalledConfig, WorkCoordinationConfig, WorkerConfig,
};
pub use coordinator::{fair_distribution, InstanceRecord, WorkCoordinator};
pub use cron::CronExpr;
pub use dlq::{DeadLetterEntry, DeadLetterQueue};
pub use error::{QueueError, QueueResult};
pub use events::{EventBus, EventKind, QueueEvent};
pub use group::{Batch, BatchState, BatchStatus, GroupSnapshot, Observable, QueueGroup};
pub use id::{BatchId, JobId};
pub use job::{BackoffKind, BackoffPolicy, JobOptions, JobRecord, JobState, RepeatOptions};
pub use leader::{LeaderElection, LeaderInfo, LeaderState};
pub use lock::{LockHandle, LockManager, LockOptions};
pub use metrics::{register_metrics, MetricsCollector, QueueMetricsSnapshot};
pub use priority::PriorityPump;
pub use queue::{JobCounts, Queue};
pub use rate_limit::{RateLimitOptions, RateLimitStatus, RateLimiter};
pub use scheduler::{ScheduleInfo, Scheduler};
pub use stalled::StalledChecker;
pub use worker::{JobHandler, Worker, WorkerStats};

/// Re-export of the commonly used surface.
pub mod prelude {
    pub use crate::config::QueueConfig;
    pub use crate::error::{QueueError, QueueResult};
    pub use crate::job::{JobOptions, JobRecord, JobState};
    pub use crate::queue::Queue;
    pub use crate::worker::Worker;
}
