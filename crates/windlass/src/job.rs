//! Job records, submission options and the Redis hash codec.

use crate::error::{QueueError, QueueResult};
use crate::id::JobId;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Most recent stacktrace entries kept on a job record.
pub const STACKTRACE_LIMIT: usize = 10;

/// Lifecycle state of a job. A job is in exactly one state at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    /// Ready to be picked up by a worker.
    Waiting,
    /// Currently being processed under a lease.
    Active,
    /// Finished successfully.
    Completed,
    /// Finished with an error (possibly awaiting retry).
    Failed,
    /// Scheduled to become waiting at a future time.
    Delayed,
    /// Parked by a bulk pause.
    Paused,
    /// Held until all dependencies finish.
    DependencyWait,
    /// Exhausted of retries and copied to the dead letter store.
    DeadLetter,
}

impl JobState {
    /// Canonical wire name for this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
            JobState::Paused => "paused",
            JobState::DependencyWait => "dependency-wait",
            JobState::DeadLetter => "dead-letter",
        }
    }

    /// Parses a wire name back into a state.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "delayed" => Some(JobState::Delayed),
            "paused" => Some(JobState::Paused),
            "dependency-wait" => Some(JobState::DependencyWait),
            "dead-letter" => Some(JobState::DeadLetter),
            _ => None,
        }
    }

    /// True for states with `finished_on` set.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::DeadLetter
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Retry backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Constant delay between attempts.
    Fixed,
    /// Base delay doubled per prior failure.
    Exponential,
}

/// Backoff configuration carried in submission options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Strategy.
    #[serde(rename = "type")]
    pub kind: BackoffKind,

    /// Base delay in milliseconds.
    #[serde(rename = "delay")]
    pub delay_ms: u64,
}

impl BackoffPolicy {
    /// Creates a fixed backoff.
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay_ms,
        }
    }

    /// Creates an exponential backoff.
    pub fn exponential(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms,
        }
    }

    /// Delay before the next attempt, given how many attempts have been
    /// made so far (k-th failure yields base·2^(k−1) for exponential).
    pub fn delay_for(&self, attempts_made: u32) -> u64 {
        match self.kind {
            BackoffKind::Fixed => self.delay_ms,
            BackoffKind::Exponential => {
                let exp = attempts_made.saturating_sub(1).min(32);
                self.delay_ms.saturating_mul(1u64 << exp)
            }
        }
    }
}

/// Dead letter override carried in submission options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DeadLetterOptions {
    /// Enable the dead letter queue for this job.
    pub enabled: bool,

    /// Override the attempts threshold for dead-lettering.
    pub max_retries: Option<u32>,
}

/// Recurrence options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RepeatOptions {
    /// 5-field cron expression.
    pub cron: Option<String>,

    /// IANA timezone name.
    pub tz: Option<String>,

    /// Earliest fire time, unix milliseconds.
    pub start_date: Option<i64>,

    /// Latest fire time, unix milliseconds.
    pub end_date: Option<i64>,

    /// Maximum number of firings.
    pub limit: Option<u32>,

    /// Firings so far, maintained by the scheduler.
    pub count: u32,

    /// Simple-interval recurrence from foreign payloads. Accepted so those
    /// payloads round-trip; only `cron` drives recurrence here.
    pub every: Option<u64>,
}

/// Submission options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptions {
    /// Delay before the job becomes waiting, in milliseconds.
    pub delay: u64,

    /// Maximum total handler invocations, including the first.
    pub attempts: Option<u32>,

    /// Retry backoff policy.
    pub backoff: Option<BackoffPolicy>,

    /// Priority level (priority queues only; higher served first).
    pub priority: Option<u32>,

    /// Push to the serving end of the selected list.
    pub lifo: bool,

    /// Caller-supplied job id. Collision overwrites silently.
    pub job_id: Option<String>,

    /// Ids that must finish before this job runs.
    #[serde(deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Exempt from cleanup trimming.
    pub keep_jobs: bool,

    /// Remove the record when the job completes.
    pub remove_on_complete: bool,

    /// Remove the record when the job fails terminally.
    pub remove_on_fail: bool,

    /// Dead letter override.
    pub dead_letter: Option<DeadLetterOptions>,

    /// Recurrence.
    pub repeat: Option<RepeatOptions>,
}

/// Accepts `"id"` or `["id", ...]` for `dependsOn`.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(id)) => vec![id],
        Some(OneOrMany::Many(ids)) => ids,
    })
}

impl JobOptions {
    /// Resolved maximum attempts, falling back to the given default.
    pub fn max_attempts(&self, default_attempts: u32) -> u32 {
        self.attempts.unwrap_or(default_attempts).max(1)
    }

    /// Dead-letter threshold when dead-lettering applies to this job.
    pub fn dead_letter_threshold(&self, config_default: u32) -> Option<u32> {
        match &self.dead_letter {
            Some(opts) if opts.enabled => Some(opts.max_retries.unwrap_or(config_default)),
            _ => None,
        }
    }
}

/// One submitted unit of work. The Redis hash is the system of record; this
/// struct is the parsed in-memory view.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    /// Unique id.
    pub id: JobId,

    /// Owning queue.
    pub queue_name: String,

    /// Opaque payload.
    pub data: serde_json::Value,

    /// Submission options.
    pub opts: JobOptions,

    /// Current lifecycle state.
    pub state: JobState,

    /// Submitted-at, unix milliseconds.
    pub timestamp: i64,

    /// Requested delay in milliseconds.
    pub delay: u64,

    /// Handler invocations so far.
    pub attempts_made: u32,

    /// Progress, 0..=100.
    pub progress: u8,

    /// When processing last started, unix milliseconds.
    pub processed_on: Option<i64>,

    /// When the job reached a terminal state, unix milliseconds.
    pub finished_on: Option<i64>,

    /// Handler return value.
    pub return_value: Option<serde_json::Value>,

    /// Message of the last failure.
    pub failed_reason: Option<String>,

    /// Most recent failure stacktraces, newest last, at most
    /// [`STACKTRACE_LIMIT`].
    pub stacktrace: Vec<String>,

    /// Ids this job depends on.
    pub dependencies: Vec<String>,
}

impl JobRecord {
    /// Creates a fresh record for submission.
    pub fn new(queue_name: impl Into<String>, data: serde_json::Value, opts: JobOptions) -> Self {
        let id = match &opts.job_id {
            Some(id) => JobId::from_string(id.clone()),
            None => JobId::new(),
        };
        let dependencies = opts.depends_on.clone();
        let delay = opts.delay;

        Self {
            id,
            queue_name: queue_name.into(),
            data,
            opts,
            state: JobState::Waiting,
            timestamp: Utc::now().timestamp_millis(),
            delay,
            attempts_made: 0,
            progress: 0,
            processed_on: None,
            finished_on: None,
            return_value: None,
            failed_reason: None,
            stacktrace: Vec::new(),
            dependencies,
        }
    }

    /// True once the job has a terminal outcome.
    pub fn is_finished(&self) -> bool {
        self.finished_on.is_some()
    }

    /// Records a failed attempt: bumps the attempt counter, stores the
    /// reason and appends to the bounded stacktrace.
    pub fn record_failure(&mut self, reason: impl Into<String>, stack: impl Into<String>) {
        self.attempts_made += 1;
        self.failed_reason = Some(reason.into());
        self.stacktrace.push(stack.into());
        if self.stacktrace.len() > STACKTRACE_LIMIT {
            let overflow = self.stacktrace.len() - STACKTRACE_LIMIT;
            self.stacktrace.drain(..overflow);
        }
    }

    /// Serializes the record into flat hash fields. Numbers are decimal
    /// strings; structured fields are compact JSON. Optional fields are
    /// written only when present so the codec round-trips byte-for-byte.
    pub fn to_hash(&self) -> QueueResult<Vec<(String, String)>> {
        let mut fields: Vec<(String, String)> = vec![
            ("id".into(), self.id.as_str().to_string()),
            ("queue".into(), self.queue_name.clone()),
            ("data".into(), serde_json::to_string(&self.data)?),
            ("opts".into(), serde_json::to_string(&self.opts)?),
            ("state".into(), self.state.as_str().to_string()),
            ("timestamp".into(), self.timestamp.to_string()),
            ("delay".into(), self.delay.to_string()),
            ("attempts_made".into(), self.attempts_made.to_string()),
            ("progress".into(), self.progress.to_string()),
            (
                "stacktrace".into(),
                serde_json::to_string(&self.stacktrace)?,
            ),
            (
                "dependencies".into(),
                serde_json::to_string(&self.dependencies)?,
            ),
        ];

        if let Some(value) = self.processed_on {
            fields.push(("processed_on".into(), value.to_string()));
        }
        if let Some(value) = self.finished_on {
            fields.push(("finished_on".into(), value.to_string()));
        }
        if let Some(value) = &self.return_value {
            fields.push(("return_value".into(), serde_json::to_string(value)?));
        }
        if let Some(value) = &self.failed_reason {
            fields.push(("failed_reason".into(), value.clone()));
        }

        Ok(fields)
    }

    /// Parses a record back out of its hash fields.
    pub fn from_hash(hash: &HashMap<String, String>) -> QueueResult<Self> {
        let id = required(hash, "id")?;
        let queue_name = required(hash, "queue")?;
        let data = serde_json::from_str(&required(hash, "data")?)?;
        let opts: JobOptions = serde_json::from_str(&required(hash, "opts")?)?;
        let state = JobState::parse(&required(hash, "state")?)
            .ok_or_else(|| QueueError::Internal(format!("unknown job state for {id}")))?;

        Ok(Self {
            id: JobId::from_string(id),
            queue_name,
            data,
            opts,
            state,
            timestamp: parse_num(hash, "timestamp")?.unwrap_or_default(),
            delay: parse_num(hash, "delay")?.unwrap_or_default(),
            attempts_made: parse_num(hash, "attempts_made")?.unwrap_or_default(),
            progress: parse_num(hash, "progress")?.unwrap_or_default(),
            processed_on: parse_num(hash, "processed_on")?,
            finished_on: parse_num(hash, "finished_on")?,
            return_value: hash
                .get("return_value")
                .map(|raw| serde_json::from_str(raw))
                .transpose()?,
            failed_reason: hash.get("failed_reason").cloned(),
            stacktrace: hash
                .get("stacktrace")
                .map(|raw| serde_json::from_str(raw))
                .transpose()?
                .unwrap_or_default(),
            dependencies: hash
                .get("dependencies")
                .map(|raw| serde_json::from_str(raw))
                .transpose()?
                .unwrap_or_default(),
        })
    }
}

fn required(hash: &HashMap<String, String>, field: &str) -> QueueResult<String> {
    hash.get(field)
        .cloned()
        .ok_or_else(|| QueueError::Internal(format!("job record missing field: {field}")))
}

fn parse_num<T: std::str::FromStr>(
    hash: &HashMap<String, String>,
    field: &str,
) -> QueueResult<Option<T>> {
    match hash.get(field) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| QueueError::Internal(format!("job record field not numeric: {field}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_record() -> JobRecord {
        let opts: JobOptions = serde_json::from_value(json!({
            "attempts": 3,
            "backoff": {"type": "exponential", "delay": 100},
            "dependsOn": ["a", "b"],
            "keepJobs": true,
        }))
        .unwrap();
        JobRecord::new("emails", json!({"to": "user@example.com"}), opts)
    }

    #[test]
    fn test_codec_round_trip() {
        let mut record = sample_record();
        record.processed_on = Some(1_700_000_000_000);
        record.finished_on = Some(1_700_000_000_500);
        record.return_value = Some(json!({"ok": true}));
        record.record_failure("boom", "trace-1");

        let hash: HashMap<String, String> = record.to_hash().unwrap().into_iter().collect();
        let parsed = JobRecord::from_hash(&hash).unwrap();
        assert_eq!(parsed, record);

        // Idempotent across a second cycle.
        let hash2: HashMap<String, String> = parsed.to_hash().unwrap().into_iter().collect();
        assert_eq!(hash, hash2);
    }

    #[test]
    fn test_missing_optionals_parse_as_none() {
        let record = sample_record();
        let hash: HashMap<String, String> = record.to_hash().unwrap().into_iter().collect();
        assert!(!hash.contains_key("processed_on"));

        let parsed = JobRecord::from_hash(&hash).unwrap();
        assert_eq!(parsed.processed_on, None);
        assert_eq!(parsed.finished_on, None);
        assert_eq!(parsed.return_value, None);
    }

    #[test]
    fn test_stacktrace_is_bounded() {
        let mut record = sample_record();
        for i in 0..25 {
            record.record_failure("err", format!("trace-{i}"));
        }
        assert_eq!(record.stacktrace.len(), STACKTRACE_LIMIT);
        assert_eq!(record.stacktrace[0], "trace-15");
        assert_eq!(record.stacktrace[9], "trace-24");
        assert_eq!(record.attempts_made, 25);
    }

    #[test]
    fn test_depends_on_accepts_scalar_and_list() {
        let opts: JobOptions = serde_json::from_str(r#"{"dependsOn": "only"}"#).unwrap();
        assert_eq!(opts.depends_on, vec!["only"]);

        let opts: JobOptions = serde_json::from_str(r#"{"dependsOn": ["x", "y"]}"#).unwrap();
        assert_eq!(opts.depends_on, vec!["x", "y"]);
    }

    #[test]
    fn test_backoff_delays() {
        let fixed = BackoffPolicy::fixed(500);
        assert_eq!(fixed.delay_for(1), 500);
        assert_eq!(fixed.delay_for(4), 500);

        let exp = BackoffPolicy::exponential(100);
        assert_eq!(exp.delay_for(1), 100);
        assert_eq!(exp.delay_for(2), 200);
        assert_eq!(exp.delay_for(3), 400);
        assert_eq!(exp.delay_for(4), 800);
    }

    #[test]
    fn test_max_attempts_resolution() {
        let opts = JobOptions::default();
        assert_eq!(opts.max_attempts(1), 1);

        let opts = JobOptions {
            attempts: Some(5),
            ..JobOptions::default()
        };
        assert_eq!(opts.max_attempts(1), 5);
    }

    #[test]
    fn test_dead_letter_threshold() {
        let opts = JobOptions::default();
        assert_eq!(opts.dead_letter_threshold(3), None);

        let opts: JobOptions =
            serde_json::from_str(r#"{"deadLetter": {"enabled": true, "maxRetries": 2}}"#).unwrap();
        assert_eq!(opts.dead_letter_threshold(3), Some(2));

        let opts: JobOptions =
            serde_json::from_str(r#"{"deadLetter": {"enabled": true}}"#).unwrap();
        assert_eq!(opts.dead_letter_threshold(3), Some(3));
    }

    #[test]
    fn test_state_names_round_trip() {
        for state in [
            JobState::Waiting,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
            JobState::Delayed,
            JobState::Paused,
            JobState::DependencyWait,
            JobState::DeadLetter,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert!(JobState::parse("limbo").is_none());
    }

    #[test]
    fn test_repeat_every_round_trips() {
        let opts: JobOptions =
            serde_json::from_str(r#"{"repeat": {"cron": "* * * * *", "every": 5000}}"#).unwrap();
        let repeat = opts.repeat.as_ref().unwrap();
        assert_eq!(repeat.every, Some(5000));
        assert_eq!(repeat.cron.as_deref(), Some("* * * * *"));
    }
}
