//! In-memory datastore.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use toil_core::{Datastore, Job, JobId, JobStatus, Result};

/// Datastore holding all jobs in a process-local map. Ids are assigned from a
/// monotonically increasing counter, so id order is creation order.
pub struct MemoryDatastore {
    inner: Mutex<Inner>,
}

struct Inner {
    jobs: HashMap<u64, Job>,
    next_id: u64,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                jobs: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Number of stored jobs.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all stored jobs, ordered by id.
    pub fn all_jobs(&self) -> Vec<Job> {
        let inner = self.inner.lock().unwrap();
        let mut jobs: Vec<Job> = inner.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.id());
        jobs
    }

    /// Remove a job record. Used by tests to simulate a datastore that lost a
    /// record the broker still references.
    pub fn forget(&self, id: JobId) {
        self.inner.lock().unwrap().jobs.remove(&id.0);
    }

    fn persist_locked(inner: &mut Inner, job: &mut Job) -> Result<()> {
        let id = match job.id() {
            Some(id) => id,
            None => {
                let id = JobId(inner.next_id);
                inner.next_id += 1;
                job.assign_id(id)?;
                id
            }
        };
        inner.jobs.insert(id.0, job.clone());
        Ok(())
    }
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn persist_job(&self, job: &mut Job) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::persist_locked(&mut inner, job)
    }

    async fn persist_jobs(&self, jobs: &mut [Job]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for job in jobs.iter_mut() {
            Self::persist_locked(&mut inner, job)?;
        }
        Ok(())
    }

    async fn fetch_job(&self, id: JobId) -> Result<Option<Job>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.jobs.get(&id.0).cloned())
    }

    async fn currently_sequenced(&self, job: &Job) -> Result<bool> {
        let Some(sequence) = job.sequence.as_deref() else {
            return Ok(false);
        };
        let inner = self.inner.lock().unwrap();
        let blocked = inner.jobs.values().any(|other| {
            other.sequence.as_deref() == Some(sequence)
                && other.status.is_outstanding()
                && match (other.id(), job.id()) {
                    (Some(o), Some(s)) => o < s,
                    // An unpersisted job trails every stored one.
                    (Some(_), None) => true,
                    _ => false,
                }
        });
        Ok(blocked)
    }

    async fn fetch_next_sequence(&self, job: &Job) -> Result<Option<Job>> {
        let Some(sequence) = job.sequence.as_deref() else {
            return Ok(None);
        };
        let Some(my_id) = job.id() else {
            return Ok(None);
        };
        let inner = self.inner.lock().unwrap();
        let next = inner
            .jobs
            .values()
            .filter(|other| {
                other.sequence.as_deref() == Some(sequence)
                    && other.status == JobStatus::New
                    && other.id().is_some_and(|o| o > my_id)
            })
            .min_by_key(|other| other.id());
        Ok(next.cloned())
    }

    async fn is_similar_job(&self, job: &Job) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        let similar = inner.jobs.values().any(|other| {
            other.id() != job.id()
                && other.worker == job.worker
                && other.group_key() == job.group_key()
                && other.status.is_outstanding()
        });
        Ok(similar)
    }
}
