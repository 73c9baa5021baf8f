//! Datastore contract for durable job storage.
//!
//! The engine never issues raw queries; every persistence semantic it needs
//! is behind this narrow contract. Implementations live in backend crates
//! (see `toil-memory` for the in-process reference implementation).

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::job::{Job, JobId};

/// Durable storage contract for jobs.
///
/// Implementations must be thread-safe; all writes to a given job are
/// serialized by the fact that only the worker holding the delivery touches
/// its record.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Create or update a job record. Assigns the id on first save.
    async fn persist_job(&self, job: &mut Job) -> Result<()>;

    /// Persist a batch of jobs in one datastore call.
    async fn persist_jobs(&self, jobs: &mut [Job]) -> Result<()>;

    /// Fetch a job by id.
    async fn fetch_job(&self, id: JobId) -> Result<Option<Job>>;

    /// Whether an earlier job in this job's sequence is still outstanding
    /// (status `New`, `Busy`, `Failed`, `Unknown` or `Paused`).
    async fn currently_sequenced(&self, job: &Job) -> Result<bool>;

    /// The next queued job in this job's sequence: lowest id greater than the
    /// given job's, status `New`.
    async fn fetch_next_sequence(&self, job: &Job) -> Result<Option<Job>>;

    /// Whether another outstanding job with the same group and worker exists.
    async fn is_similar_job(&self, job: &Job) -> Result<bool>;
}

/// A type-erased datastore shared across tasks.
pub type SharedDatastore = Arc<dyn Datastore>;
