//! Job definition and related types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, ToilError};

/// Unique identifier for a job, assigned by the datastore on first persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The status of a job.
///
/// `New` jobs have never run; `Busy` jobs are held by a worker; `Success` and
/// `Buried` are terminal for the job instance. `Failed`, `Unknown` and
/// `Paused` are non-terminal failure/deferral states eligible for re-dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Created, not yet executed.
    New,
    /// A worker currently holds the job.
    Busy,
    /// Permanently failed after exhausting retries; manual revival only.
    Buried,
    /// Completed successfully.
    Success,
    /// Failed, scheduled for retry.
    Failed,
    /// Datastore-missing or corrupted record; treated as retryable.
    Unknown,
    /// Handler explicitly deferred the job; no retry scheduled.
    Paused,
}

impl JobStatus {
    /// Terminal for this job instance. Recurrence spawns a new job.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Buried)
    }

    /// Counts against a sequence's outstanding set.
    pub fn is_outstanding(self) -> bool {
        !self.is_terminal()
    }

    /// States from which (re-)dispatch to the broker is permitted.
    pub fn can_dispatch(self) -> bool {
        matches!(
            self,
            JobStatus::New | JobStatus::Failed | JobStatus::Unknown | JobStatus::Paused
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::New => "new",
            JobStatus::Busy => "busy",
            JobStatus::Buried => "buried",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Unknown => "unknown",
            JobStatus::Paused => "paused",
        };
        f.write_str(s)
    }
}

/// Options for job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// Maximum number of retry attempts before burial.
    pub max_retries: u32,
    /// Advisory execution-time budget. Enforcement is a host-process concern;
    /// the engine records it but never interrupts a handler.
    #[serde(with = "duration_serde")]
    pub max_runtime: Option<Duration>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_runtime: None,
        }
    }
}

impl JobOptions {
    /// Create new JobOptions with the given max retries.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Set the advisory max runtime.
    pub fn max_runtime(mut self, max_runtime: Duration) -> Self {
        self.max_runtime = Some(max_runtime);
        self
    }
}

/// One timestamped event in a job's audit trail. Entries are only ever
/// appended, never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the event happened (epoch milliseconds).
    pub at: i64,
    /// Status the job held after the event.
    pub status: JobStatus,
    /// Human-readable status text.
    pub message: String,
    /// Structured context, e.g. error details for a failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

/// One unit of deferred work: target handler, payload, and scheduling/retry
/// metadata plus execution history.
///
/// A job is owned exclusively by whichever component currently holds it;
/// cross-process sharing goes through the datastore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    id: Option<JobId>,
    /// Name of the handler to invoke. Must resolve in the handler registry.
    pub worker: String,
    /// Logical classification for similar-job de-duplication. Defaults to the
    /// worker name; see [`Job::group_key`].
    pub group: Option<String>,
    /// Domain priority 0-255. Smaller values map to higher broker priority.
    pub priority: u8,
    /// Opaque payload handed to the handler.
    pub payload: serde_json::Value,
    /// Execution options.
    pub options: JobOptions,
    /// Jobs sharing a sequence key execute strictly in ascending-id order.
    pub sequence: Option<String>,
    /// Not eligible for dispatch before this instant (epoch milliseconds).
    pub run_at: i64,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Attempt counter.
    pub retries: u32,
    /// Set by the worker at lock time (epoch milliseconds).
    pub start_time: Option<i64>,
    /// Set at reconciliation (epoch milliseconds).
    pub end_time: Option<i64>,
    /// Last attempt duration.
    pub duration_ms: Option<u64>,
    /// Host that executed the last attempt.
    pub host_name: Option<String>,
    /// Most recent human-readable status text.
    pub last_message: Option<String>,
    /// Append-only audit trail.
    pub history: Vec<HistoryEntry>,
    /// Set once the job has been successfully published to the broker.
    pub pushed_to_broker: bool,
}

impl Job {
    /// Create a new job for the given handler name and payload.
    pub fn new(worker: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: None,
            worker: worker.into(),
            group: None,
            priority: 100,
            payload,
            options: JobOptions::default(),
            sequence: None,
            run_at: now_ms(),
            status: JobStatus::New,
            retries: 0,
            start_time: None,
            end_time: None,
            duration_ms: None,
            host_name: None,
            last_message: None,
            history: Vec::new(),
            pushed_to_broker: false,
        }
    }

    /// Set the domain priority (0-255, smaller is more urgent).
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set the de-duplication group.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set execution options.
    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Put the job in a sequence.
    pub fn in_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.sequence = Some(sequence.into());
        self
    }

    /// Schedule the job to run at a specific instant (epoch milliseconds).
    pub fn schedule_at(mut self, run_at: i64) -> Self {
        self.run_at = run_at;
        self
    }

    /// Schedule the job to run after a delay.
    pub fn schedule_in(self, delay: Duration) -> Self {
        let run_at = now_ms() + delay.as_millis() as i64;
        self.schedule_at(run_at)
    }

    /// The job's identity, if it has been persisted.
    pub fn id(&self) -> Option<JobId> {
        self.id
    }

    /// Assign the datastore-issued identity. An id is set at most once.
    pub fn assign_id(&mut self, id: JobId) -> Result<()> {
        if self.id.is_some() {
            return Err(ToilError::InvalidJob(format!(
                "job {} already has an id",
                self.id.unwrap()
            )));
        }
        self.id = Some(id);
        Ok(())
    }

    /// Group used for similar-job checks: the explicit group, else the worker
    /// name.
    pub fn group_key(&self) -> &str {
        self.group.as_deref().unwrap_or(&self.worker)
    }

    /// Record a lifecycle event: append a history entry and update the
    /// current status and last message.
    pub fn record(
        &mut self,
        status: JobStatus,
        message: impl Into<String>,
        context: Option<serde_json::Value>,
    ) {
        let message = message.into();
        self.history.push(HistoryEntry {
            at: now_ms(),
            status,
            message: message.clone(),
            context,
        });
        self.status = status;
        self.last_message = Some(message);
    }

    /// Clone this job for recurrence: a fresh identity with execution and
    /// retry state reset and `run_at` set to the recurrence instant.
    pub fn recurrence_clone(&self, run_at: i64) -> Job {
        Job {
            id: None,
            worker: self.worker.clone(),
            group: self.group.clone(),
            priority: self.priority,
            payload: self.payload.clone(),
            options: self.options.clone(),
            sequence: self.sequence.clone(),
            run_at,
            status: JobStatus::New,
            retries: 0,
            start_time: None,
            end_time: None,
            duration_ms: None,
            host_name: None,
            last_message: None,
            history: Vec::new(),
            pushed_to_broker: false,
        }
    }

    /// Serialize the job to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize a job from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Current instant as epoch milliseconds.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Serde module for optional Duration serialization as milliseconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => (d.as_millis() as u64).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_creation_defaults() {
        let job = Job::new("send_email", json!({"to": "a@example.com"}));
        assert_eq!(job.status, JobStatus::New);
        assert_eq!(job.priority, 100);
        assert_eq!(job.retries, 0);
        assert_eq!(job.options.max_retries, 3);
        assert!(job.id().is_none());
        assert!(!job.pushed_to_broker);
        assert!(job.history.is_empty());
    }

    #[test]
    fn test_group_key_defaults_to_worker() {
        let job = Job::new("send_email", json!({}));
        assert_eq!(job.group_key(), "send_email");

        let job = job.with_group("notifications");
        assert_eq!(job.group_key(), "notifications");
    }

    #[test]
    fn test_assign_id_once() {
        let mut job = Job::new("w", json!({}));
        job.assign_id(JobId(7)).unwrap();
        assert_eq!(job.id(), Some(JobId(7)));

        let err = job.assign_id(JobId(8)).unwrap_err();
        assert!(matches!(err, ToilError::InvalidJob(_)));
        assert_eq!(job.id(), Some(JobId(7)));
    }

    #[test]
    fn test_record_appends_history() {
        let mut job = Job::new("w", json!({}));
        job.record(JobStatus::Busy, "locked", None);
        job.record(JobStatus::Failed, "boom", Some(json!({"error": "boom"})));

        assert_eq!(job.history.len(), 2);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_message.as_deref(), Some("boom"));
        assert_eq!(job.history[0].status, JobStatus::Busy);
        assert!(job.history[1].context.is_some());
    }

    #[test]
    fn test_status_predicates() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Buried.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());

        for status in [
            JobStatus::New,
            JobStatus::Busy,
            JobStatus::Failed,
            JobStatus::Unknown,
            JobStatus::Paused,
        ] {
            assert!(status.is_outstanding(), "{status} should be outstanding");
        }

        assert!(JobStatus::New.can_dispatch());
        assert!(JobStatus::Failed.can_dispatch());
        assert!(JobStatus::Unknown.can_dispatch());
        assert!(JobStatus::Paused.can_dispatch());
        assert!(!JobStatus::Busy.can_dispatch());
        assert!(!JobStatus::Success.can_dispatch());
        assert!(!JobStatus::Buried.can_dispatch());
    }

    #[test]
    fn test_schedule_in() {
        let before = now_ms();
        let job = Job::new("w", json!({})).schedule_in(Duration::from_secs(60));
        let after = now_ms();

        assert!(job.run_at >= before + 60_000);
        assert!(job.run_at <= after + 60_000);
    }

    #[test]
    fn test_recurrence_clone_resets_execution_state() {
        let mut job = Job::new("report", json!({"week": 12}))
            .with_priority(50)
            .in_sequence("reports");
        job.assign_id(JobId(3)).unwrap();
        job.retries = 2;
        job.pushed_to_broker = true;
        job.start_time = Some(1);
        job.record(JobStatus::Success, "done", None);

        let next_run = now_ms() + 3_600_000;
        let clone = job.recurrence_clone(next_run);

        assert!(clone.id().is_none());
        assert_eq!(clone.status, JobStatus::New);
        assert_eq!(clone.retries, 0);
        assert_eq!(clone.run_at, next_run);
        assert_eq!(clone.priority, 50);
        assert_eq!(clone.sequence.as_deref(), Some("reports"));
        assert_eq!(clone.payload, json!({"week": 12}));
        assert!(!clone.pushed_to_broker);
        assert!(clone.history.is_empty());
        assert!(clone.start_time.is_none());
    }

    #[test]
    fn test_job_serialization_roundtrip() {
        let mut job = Job::new("w", json!({"n": 1})).in_sequence("s");
        job.assign_id(JobId(42)).unwrap();
        job.record(JobStatus::Busy, "locked", None);

        let json = job.to_json().unwrap();
        let back = Job::from_json(&json).unwrap();

        assert_eq!(back.id(), Some(JobId(42)));
        assert_eq!(back.status, JobStatus::Busy);
        assert_eq!(back.history.len(), 1);
        assert_eq!(back.sequence.as_deref(), Some("s"));
    }
}
