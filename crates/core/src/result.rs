//! Outcome of one execution attempt.

use crate::handler::{HandlerError, Outcome};
use crate::job::JobStatus;

/// The outcome of one execution attempt. Immutable after construction.
///
/// A `Failed` result with `retry` set maps to [`JobStatus::Failed`]; without
/// it, the job is buried outright regardless of remaining retries.
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    /// The attempt succeeded. `run_again_at` schedules a recurrence clone.
    Success {
        message: Option<String>,
        run_again_at: Option<i64>,
    },
    /// The handler explicitly deferred the job; no retry is scheduled.
    Paused { message: Option<String> },
    /// The attempt failed.
    Failed {
        message: String,
        /// Error class/text for the history entry.
        error: Option<String>,
        /// Whether a retry is requested.
        retry: bool,
        /// Overrides the backoff-computed next run (epoch milliseconds).
        retry_at: Option<i64>,
    },
}

impl RunResult {
    /// A plain success.
    pub fn success() -> Self {
        RunResult::Success {
            message: None,
            run_again_at: None,
        }
    }

    /// A success with a status message.
    pub fn success_with(message: impl Into<String>) -> Self {
        RunResult::Success {
            message: Some(message.into()),
            run_again_at: None,
        }
    }

    /// A success that schedules a recurrence at `run_again_at` (epoch ms).
    pub fn recur(run_again_at: i64) -> Self {
        RunResult::Success {
            message: None,
            run_again_at: Some(run_again_at),
        }
    }

    /// A paused result.
    pub fn paused() -> Self {
        RunResult::Paused { message: None }
    }

    /// A retryable failure.
    pub fn failed(message: impl Into<String>) -> Self {
        RunResult::Failed {
            message: message.into(),
            error: None,
            retry: true,
            retry_at: None,
        }
    }

    /// A failure that buries the job immediately.
    pub fn failed_fatal(message: impl Into<String>) -> Self {
        RunResult::Failed {
            message: message.into(),
            error: None,
            retry: false,
            retry_at: None,
        }
    }

    /// Override the next run time of a failed result (epoch ms).
    pub fn retry_at(mut self, at: i64) -> Self {
        if let RunResult::Failed { retry_at, .. } = &mut self {
            *retry_at = Some(at);
        }
        self
    }

    /// The job status this result maps to, before retry accounting.
    pub fn status(&self) -> JobStatus {
        match self {
            RunResult::Success { .. } => JobStatus::Success,
            RunResult::Paused { .. } => JobStatus::Paused,
            RunResult::Failed { retry: true, .. } => JobStatus::Failed,
            RunResult::Failed { retry: false, .. } => JobStatus::Buried,
        }
    }

    /// The status message, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            RunResult::Success { message, .. } | RunResult::Paused { message } => {
                message.as_deref()
            }
            RunResult::Failed { message, .. } => Some(message),
        }
    }

    /// Error class/text carried by a failed result.
    pub fn error(&self) -> Option<&str> {
        match self {
            RunResult::Failed { error, .. } => error.as_deref(),
            _ => None,
        }
    }

    /// Whether the result requested a retry.
    pub fn retry_requested(&self) -> bool {
        matches!(self, RunResult::Failed { retry: true, .. })
    }

    /// Recurrence instant carried by a successful result.
    pub fn run_again_at(&self) -> Option<i64> {
        match self {
            RunResult::Success { run_again_at, .. } => *run_again_at,
            _ => None,
        }
    }

    /// Next-run override carried by a failed result.
    pub fn requested_retry_at(&self) -> Option<i64> {
        match self {
            RunResult::Failed { retry_at, .. } => *retry_at,
            _ => None,
        }
    }

    /// Coerce a handler return value into a result.
    ///
    /// Any non-result return value maps to a success; a recurrence timestamp
    /// maps to a success that also schedules recurrence; a handler error maps
    /// to a failure carrying the error, retryable per the error's flag.
    pub fn from_handler(outcome: std::result::Result<Outcome, HandlerError>) -> RunResult {
        match outcome {
            Ok(Outcome::Done) => RunResult::success(),
            Ok(Outcome::RunAgainAt(at)) => RunResult::recur(at),
            Ok(Outcome::Result(result)) => result,
            Err(err) => RunResult::Failed {
                message: err.message.clone(),
                error: Some(err.to_string()),
                retry: err.retryable,
                retry_at: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(RunResult::success().status(), JobStatus::Success);
        assert_eq!(RunResult::paused().status(), JobStatus::Paused);
        assert_eq!(RunResult::failed("x").status(), JobStatus::Failed);
        assert_eq!(RunResult::failed_fatal("x").status(), JobStatus::Buried);
    }

    #[test]
    fn test_recur_carries_timestamp() {
        let r = RunResult::recur(1234);
        assert_eq!(r.run_again_at(), Some(1234));
        assert_eq!(r.status(), JobStatus::Success);
    }

    #[test]
    fn test_retry_at_override() {
        let r = RunResult::failed("x").retry_at(9999);
        assert_eq!(r.requested_retry_at(), Some(9999));
        assert!(r.retry_requested());
    }

    #[test]
    fn test_retry_at_noop_on_success() {
        let r = RunResult::success().retry_at(9999);
        assert_eq!(r.requested_retry_at(), None);
    }

    #[test]
    fn test_coerce_done() {
        let r = RunResult::from_handler(Ok(Outcome::Done));
        assert_eq!(r, RunResult::success());
    }

    #[test]
    fn test_coerce_run_again() {
        let r = RunResult::from_handler(Ok(Outcome::RunAgainAt(42)));
        assert_eq!(r.run_again_at(), Some(42));
    }

    #[test]
    fn test_coerce_explicit_result() {
        let r = RunResult::from_handler(Ok(Outcome::Result(RunResult::paused())));
        assert_eq!(r.status(), JobStatus::Paused);
    }

    #[test]
    fn test_coerce_retryable_error() {
        let r = RunResult::from_handler(Err(HandlerError::retryable("boom")));
        assert_eq!(r.status(), JobStatus::Failed);
        assert!(r.retry_requested());
        assert_eq!(r.message(), Some("boom"));
        assert!(r.error().is_some());
    }

    #[test]
    fn test_coerce_fatal_error() {
        let r = RunResult::from_handler(Err(HandlerError::fatal("bad config")));
        assert_eq!(r.status(), JobStatus::Buried);
        assert!(!r.retry_requested());
    }
}
