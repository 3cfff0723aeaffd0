//! End-to-end scenarios against a running Redis.
//!
//! All tests are ignored by default; run them with a local Redis:
//! `cargo test -- --ignored`.

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use windlass::{
    DeadLetterQueue, JobOptions, JobState, LeaderElection, LeaderElectionConfig, LockOptions,
    Queue, QueueConfig, RateLimitOptions, RateLimiter, StalledChecker, Worker,
};

const REDIS_URL: &str = "redis://localhost:6379";

fn test_config(tag: &str) -> QueueConfig {
    let mut config = QueueConfig::default();
    config.redis.url = REDIS_URL.to_string();
    config.redis.key_prefix = format!("windlass-test-{tag}-{}", Uuid::new_v4());
    config
}

async fn wait_until<F, Fut>(budget: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn spawn_worker(worker: Arc<Worker>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let _ = worker.run().await;
    })
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis at redis://localhost:6379"]
async fn delayed_job_fires_after_its_delay() {
    let queue = Arc::new(
        Queue::connect("delayed", test_config("delayed"))
            .await
            .unwrap(),
    );

    let opts: JobOptions = serde_json::from_value(json!({"delay": 1000})).unwrap();
    let record = queue.add(json!({"v": 1}), opts).await.unwrap();
    assert_eq!(record.state, JobState::Delayed);

    let counts = queue.get_job_counts().await.unwrap();
    assert_eq!(counts.delayed, 1);
    assert_eq!(counts.waiting, 0);

    let worker = Arc::new(Worker::new(
        queue.clone(),
        Arc::new(|job| async move { Ok(json!({"echo": job.data["v"]})) }.boxed()),
    ));
    let handle = spawn_worker(worker.clone());

    let done = wait_until(Duration::from_secs(5), || {
        let queue = queue.clone();
        async move { queue.get_job_counts().await.unwrap().completed == 1 }
    })
    .await;
    assert!(done, "job never completed");

    let finished = queue.get_job(record.id.as_str()).await.unwrap().unwrap();
    assert_eq!(finished.state, JobState::Completed);
    assert_eq!(finished.return_value, Some(json!({"echo": 1})));
    assert!(finished.finished_on.is_some());
    assert!(finished.processed_on.unwrap() <= finished.finished_on.unwrap());

    worker.stop();
    let _ = handle.await;
    queue.empty().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis at redis://localhost:6379"]
async fn retry_uses_exponential_backoff_and_completes() {
    let queue = Arc::new(
        Queue::connect("retries", test_config("retries"))
            .await
            .unwrap(),
    );

    let attempts = Arc::new(Mutex::new(Vec::<i64>::new()));
    let seen = attempts.clone();
    let worker = Arc::new(Worker::new(
        queue.clone(),
        Arc::new(move |_job| {
            let seen = seen.clone();
            async move {
                let mut seen = seen.lock();
                seen.push(chrono::Utc::now().timestamp_millis());
                if seen.len() < 3 {
                    Err(windlass::QueueError::Handler("flaky".into()))
                } else {
                    Ok(json!("ok"))
                }
            }
            .boxed()
        }),
    ));

    let opts: JobOptions = serde_json::from_value(json!({
        "attempts": 3,
        "backoff": {"type": "exponential", "delay": 100},
    }))
    .unwrap();
    let record = queue.add(json!({}), opts).await.unwrap();

    let handle = spawn_worker(worker.clone());
    let done = wait_until(Duration::from_secs(10), || {
        let queue = queue.clone();
        let id = record.id.as_str().to_string();
        async move {
            queue
                .get_job(&id)
                .await
                .unwrap()
                .map(|j| j.state == JobState::Completed)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(done, "job never completed");

    let finished = queue.get_job(record.id.as_str()).await.unwrap().unwrap();
    assert_eq!(finished.attempts_made, 2); // two failures before the success
    assert_eq!(attempts.lock().len(), 3);

    worker.stop();
    let _ = handle.await;
    queue.empty().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis at redis://localhost:6379"]
async fn dependent_job_waits_for_its_dependency() {
    let queue = Arc::new(
        Queue::connect("deps", test_config("deps")).await.unwrap(),
    );

    let a = queue.add(json!({"job": "a"}), JobOptions::default()).await.unwrap();
    let b_opts: JobOptions =
        serde_json::from_value(json!({"dependsOn": a.id.as_str()})).unwrap();
    let b = queue.add(json!({"job": "b"}), b_opts).await.unwrap();

    assert_eq!(b.state, JobState::DependencyWait);
    let counts = queue.get_job_counts().await.unwrap();
    assert_eq!(counts.dependency_wait, 1);
    assert_eq!(counts.waiting, 1);

    let worker = Arc::new(Worker::new(
        queue.clone(),
        Arc::new(|_job| async move { Ok(json!(null)) }.boxed()),
    ));
    let handle = spawn_worker(worker.clone());

    let done = wait_until(Duration::from_secs(5), || {
        let queue = queue.clone();
        async move { queue.get_job_counts().await.unwrap().completed == 2 }
    })
    .await;
    assert!(done, "dependency chain never drained");

    let a_done = queue.get_job(a.id.as_str()).await.unwrap().unwrap();
    let b_done = queue.get_job(b.id.as_str()).await.unwrap().unwrap();
    assert!(a_done.finished_on.unwrap() <= b_done.processed_on.unwrap());

    worker.stop();
    let _ = handle.await;
    queue.empty().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis at redis://localhost:6379"]
async fn rate_limiter_enforces_the_window_ceiling() {
    let config = test_config("limit");
    let queue = Arc::new(Queue::connect("limited", config).await.unwrap());

    let limiter = RateLimiter::new(
        windlass::redis::create_pool(&queue.config().redis).await.unwrap(),
        windlass::redis::RedisKeys::new(&queue.config().redis.key_prefix, "limited"),
        RateLimitOptions::new(2, 10_000),
    );

    let first = limiter.check(&json!({})).await.unwrap();
    assert!(!first.limited);
    assert_eq!(first.remaining, 1);

    let second = limiter.check(&json!({})).await.unwrap();
    assert!(!second.limited);
    assert_eq!(second.remaining, 0);

    let third = limiter.check(&json!({})).await.unwrap();
    assert!(third.limited);
    assert_eq!(third.remaining, 0);
    assert!(third.reset_in_ms > 0);

    queue.empty().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis at redis://localhost:6379"]
async fn stalled_job_is_recovered() {
    let config = test_config("stalled");
    let prefix = config.redis.key_prefix.clone();
    let queue = Arc::new(Queue::connect("stalls", config).await.unwrap());

    let record = queue.add(json!({}), JobOptions::default()).await.unwrap();
    let id = record.id.as_str().to_string();

    // Simulate a crashed worker: the job sits in active with an old lease
    // and no lock holder.
    let client = redis::Client::open(REDIS_URL).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let waiting_key = format!("{prefix}:stalls:waiting");
    let active_key = format!("{prefix}:stalls:active");
    let job_key = format!("{prefix}:stalls:job:{id}");
    let _: () = redis::cmd("LREM")
        .arg(&waiting_key)
        .arg(0)
        .arg(&id)
        .query_async(&mut conn)
        .await
        .unwrap();
    let _: () = redis::cmd("LPUSH")
        .arg(&active_key)
        .arg(&id)
        .query_async(&mut conn)
        .await
        .unwrap();
    let stale = chrono::Utc::now().timestamp_millis() - 60_000;
    let _: () = redis::cmd("HSET")
        .arg(&job_key)
        .arg("state")
        .arg("active")
        .arg("processed_on")
        .arg(stale.to_string())
        .query_async(&mut conn)
        .await
        .unwrap();

    let checker = StalledChecker::new(queue.clone());
    let touched = checker.check_once().await.unwrap();
    assert_eq!(touched, vec![id.clone()]);

    let recovered = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(recovered.state, JobState::Waiting);
    assert_eq!(recovered.attempts_made, 1);

    let counts = queue.get_job_counts().await.unwrap();
    assert_eq!(counts.waiting, 1);
    assert_eq!(counts.active, 0);

    queue.empty().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis at redis://localhost:6379"]
async fn exhausted_job_lands_in_the_dead_letter_queue_and_republishes() {
    let mut config = test_config("dlq");
    config.dead_letter.enabled = true;
    config.dead_letter.max_retries = 2;
    let queue = Arc::new(Queue::connect("doomed", config).await.unwrap());

    let worker = Arc::new(Worker::new(
        queue.clone(),
        Arc::new(|_job| {
            async move { Err(windlass::QueueError::Handler("always fails".into())) }.boxed()
        }),
    ));

    let opts: JobOptions = serde_json::from_value(json!({
        "attempts": 2,
        "deadLetter": {"enabled": true, "maxRetries": 2},
    }))
    .unwrap();
    let record = queue.add(json!({"doomed": true}), opts).await.unwrap();
    let id = record.id.as_str().to_string();

    let handle = spawn_worker(worker.clone());
    let done = wait_until(Duration::from_secs(10), || {
        let queue = queue.clone();
        async move { queue.get_job_counts().await.unwrap().dead_letter == 1 }
    })
    .await;
    assert!(done, "job never reached the dead letter queue");
    worker.stop();
    let _ = handle.await;

    let counts = queue.get_job_counts().await.unwrap();
    assert_eq!(counts.failed, 0, "entry should leave the failed list");

    let dlq = DeadLetterQueue::new(queue.clone());
    let entries = dlq.get_jobs(0, -1).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].attempts_made, 2);
    assert_eq!(entries[0].failed_reason, "Handler failed: always fails");

    let republished = dlq.republish_job(&id, true).await.unwrap();
    assert_eq!(republished.id.as_str(), id);

    let back = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(back.state, JobState::Waiting);
    assert_eq!(back.attempts_made, 0);
    assert_eq!(queue.get_job_counts().await.unwrap().dead_letter, 0);

    queue.empty().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis at redis://localhost:6379"]
async fn priority_queue_serves_higher_levels_first() {
    let queue = Arc::new(
        Queue::connect("ranked", test_config("ranked"))
            .await
            .unwrap()
            .with_priority_levels(3)
            .unwrap(),
    );

    for (tag, priority) in [("low", 0), ("high", 2), ("mid", 1), ("high2", 2), ("low2", 0)] {
        let opts: JobOptions = serde_json::from_value(json!({"priority": priority})).unwrap();
        queue.add(json!({"tag": tag, "p": priority}), opts).await.unwrap();
    }

    // One pump pass moves everything into waiting, highest level first.
    queue.pump_priorities().await.unwrap();

    let order = Arc::new(Mutex::new(Vec::<i64>::new()));
    let seen = order.clone();
    let worker = Arc::new(Worker::new(
        queue.clone(),
        Arc::new(move |job| {
            let seen = seen.clone();
            async move {
                seen.lock().push(job.data["p"].as_i64().unwrap());
                Ok(json!(null))
            }
            .boxed()
        }),
    ));
    worker.adjust_concurrency(1);

    let handle = spawn_worker(worker.clone());
    let done = wait_until(Duration::from_secs(5), || {
        let queue = queue.clone();
        async move { queue.get_job_counts().await.unwrap().completed == 5 }
    })
    .await;
    assert!(done, "priority jobs never drained");
    worker.stop();
    let _ = handle.await;

    let completed = order.lock().clone();
    let mut sorted = completed.clone();
    sorted.sort_by(|a, b| b.cmp(a));
    assert_eq!(completed, sorted, "completion order must be non-increasing");

    queue.empty().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis at redis://localhost:6379"]
async fn lock_tokens_guard_release_and_mutual_exclusion() {
    let config = test_config("locks");
    let pool = windlass::redis::create_pool(&config.redis).await.unwrap();
    let locks = windlass::LockManager::new(pool, &config.redis.key_prefix);

    let opts = LockOptions {
        retries: 0,
        ..LockOptions::default()
    };

    let held = locks.acquire("resource", &opts).await.unwrap().unwrap();
    assert!(locks.is_locked("resource").await.unwrap());

    // A second holder cannot get in, and a foreign token cannot release.
    assert!(locks.acquire("resource", &opts).await.unwrap().is_none());
    assert!(!locks.release("resource", "not-the-token").await.unwrap());
    assert!(locks.is_locked("resource").await.unwrap());

    assert!(held.release().await.unwrap());
    assert!(!locks.is_locked("resource").await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis at redis://localhost:6379"]
async fn leadership_fails_over_when_the_leader_stops() {
    let config = test_config("leader");
    let pool = windlass::redis::create_pool(&config.redis).await.unwrap();
    let election_config = LeaderElectionConfig {
        heartbeat_interval_ms: 200,
        leader_timeout_ms: 1_000,
    };

    let a = Arc::new(LeaderElection::new(
        pool.clone(),
        &config.redis.key_prefix,
        "instance-a",
        election_config.clone(),
    ));
    let b = Arc::new(LeaderElection::new(
        pool,
        &config.redis.key_prefix,
        "instance-b",
        election_config,
    ));

    let run_a = {
        let a = a.clone();
        tokio::spawn(async move { a.run().await })
    };
    let run_b = {
        let b = b.clone();
        tokio::spawn(async move { b.run().await })
    };

    let elected = wait_until(Duration::from_secs(3), || {
        let a = a.clone();
        let b = b.clone();
        async move { a.is_leader() || b.is_leader() }
    })
    .await;
    assert!(elected, "no instance took leadership");
    assert!(
        !(a.is_leader() && b.is_leader()),
        "both instances lead at once"
    );

    let (leader, follower) = if a.is_leader() {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    };
    let leader_id = leader.instance_id().to_string();

    leader.stop();
    let failed_over = wait_until(Duration::from_secs(5), || {
        let follower = follower.clone();
        async move { follower.is_leader() }
    })
    .await;
    assert!(failed_over, "follower never took over");

    let current = follower.get_current_leader().await.unwrap().unwrap();
    assert_ne!(current.instance_id, leader_id);

    follower.stop();
    let _ = run_a.await;
    let _ = run_b.await;
}
