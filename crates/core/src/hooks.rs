//! Lifecycle hooks: an explicit ordered list of observers with vetoable
//! before-execute propagation.
//!
//! Observers run synchronously in registration order. A panicking observer is
//! logged and skipped; observer failures never corrupt job state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::job::Job;

/// Continue/abort signal returned by `before_execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookFlow {
    /// Keep going.
    Continue,
    /// Stop the pipeline: the handler does not run and the delivery is not
    /// acknowledged.
    Abort,
}

/// A lifecycle observer. All methods have no-op defaults.
pub trait Observer: Send + Sync {
    /// Runs before the handler. The first observer returning
    /// [`HookFlow::Abort`] stops the pipeline.
    fn before_execute(&self, _job: &Job) -> HookFlow {
        HookFlow::Continue
    }

    /// Runs after the attempt, with the attempt duration.
    fn after_execute(&self, _job: &Job, _duration_ms: u64) {}

    /// Runs after reconciliation has persisted the final state.
    fn after_completed(&self, _job: &Job) {}

    /// Runs at each worker heartbeat checkpoint.
    fn heartbeat(&self) {}

    /// Runs when a worker is shut down externally.
    fn force_shutdown(&self) {}
}

/// Ordered observer list.
#[derive(Clone, Default)]
pub struct Hooks {
    observers: Vec<Arc<dyn Observer>>,
}

impl Hooks {
    /// Create an empty hook list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observer. Invocation order is registration order.
    pub fn add(&mut self, observer: Arc<dyn Observer>) {
        self.observers.push(observer);
    }

    /// Run `before_execute` on each observer in order; the first `Abort`
    /// wins. A panicking observer counts as `Continue`.
    pub fn before_execute(&self, job: &Job) -> HookFlow {
        for observer in &self.observers {
            match catch_unwind(AssertUnwindSafe(|| observer.before_execute(job))) {
                Ok(HookFlow::Abort) => return HookFlow::Abort,
                Ok(HookFlow::Continue) => {}
                Err(_) => tracing::warn!("before_execute observer panicked"),
            }
        }
        HookFlow::Continue
    }

    /// Run `after_execute` on each observer, swallowing panics.
    pub fn after_execute(&self, job: &Job, duration_ms: u64) {
        for observer in &self.observers {
            if catch_unwind(AssertUnwindSafe(|| observer.after_execute(job, duration_ms)))
                .is_err()
            {
                tracing::warn!("after_execute observer panicked");
            }
        }
    }

    /// Run `after_completed` on each observer, swallowing panics.
    pub fn after_completed(&self, job: &Job) {
        for observer in &self.observers {
            if catch_unwind(AssertUnwindSafe(|| observer.after_completed(job))).is_err() {
                tracing::warn!("after_completed observer panicked");
            }
        }
    }

    /// Run `heartbeat` on each observer, swallowing panics.
    pub fn heartbeat(&self) {
        for observer in &self.observers {
            if catch_unwind(AssertUnwindSafe(|| observer.heartbeat())).is_err() {
                tracing::warn!("heartbeat observer panicked");
            }
        }
    }

    /// Run `force_shutdown` on each observer, swallowing panics.
    pub fn force_shutdown(&self) {
        for observer in &self.observers {
            if catch_unwind(AssertUnwindSafe(|| observer.force_shutdown())).is_err() {
                tracing::warn!("force_shutdown observer panicked");
            }
        }
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Whether no observers are registered.
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}
