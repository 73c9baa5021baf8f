//! In-memory worker registry.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use toil_core::{Result, ToilError, WorkerRecord, WorkerRegistry, WorkerStatus};

/// Worker registry backed by a process-local map, keyed by worker name.
pub struct MemoryWorkerRegistry {
    records: Mutex<HashMap<String, WorkerRecord>>,
}

impl MemoryWorkerRegistry {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Mark a worker for shutdown, as an operator tool would.
    pub fn mark(&self, name: &str, status: WorkerStatus) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        match records.get_mut(name) {
            Some(record) => {
                record.status = status;
                Ok(())
            }
            None => Err(ToilError::Worker(format!("no worker named {name}"))),
        }
    }

    /// Replace a record's pid, simulating a newer process taking the name.
    pub fn reassign_pid(&self, name: &str, pid: u32) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        match records.get_mut(name) {
            Some(record) => {
                record.pid = pid;
                Ok(())
            }
            None => Err(ToilError::Worker(format!("no worker named {name}"))),
        }
    }

    /// Names of all registered workers.
    pub fn names(&self) -> Vec<String> {
        self.records.lock().unwrap().keys().cloned().collect()
    }
}

impl Default for MemoryWorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerRegistry for MemoryWorkerRegistry {
    async fn register(&self, record: &WorkerRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn fetch(&self, name: &str) -> Result<Option<WorkerRecord>> {
        Ok(self.records.lock().unwrap().get(name).cloned())
    }

    async fn update(&self, record: &WorkerRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        if !records.contains_key(&record.name) {
            return Err(ToilError::Worker(format!(
                "cannot update unregistered worker {}",
                record.name
            )));
        }
        records.insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.records.lock().unwrap().remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_fetch_remove() {
        let registry = MemoryWorkerRegistry::new();
        let record = WorkerRecord::new("worker-a");

        registry.register(&record).await.unwrap();
        let fetched = registry.fetch("worker-a").await.unwrap().unwrap();
        assert_eq!(fetched.pid, record.pid);

        registry.remove("worker-a").await.unwrap();
        assert!(registry.fetch("worker-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_for_shutdown() {
        let registry = MemoryWorkerRegistry::new();
        registry.register(&WorkerRecord::new("worker-a")).await.unwrap();

        registry.mark("worker-a", WorkerStatus::Stop).unwrap();
        let fetched = registry.fetch("worker-a").await.unwrap().unwrap();
        assert_eq!(fetched.status, WorkerStatus::Stop);

        assert!(registry.mark("nope", WorkerStatus::Kill).is_err());
    }

    #[tokio::test]
    async fn test_update_requires_registration() {
        let registry = MemoryWorkerRegistry::new();
        let record = WorkerRecord::new("worker-a");
        assert!(registry.update(&record).await.is_err());

        registry.register(&record).await.unwrap();
        let mut updated = record.clone();
        updated.job_count = 5;
        registry.update(&updated).await.unwrap();

        let fetched = registry.fetch("worker-a").await.unwrap().unwrap();
        assert_eq!(fetched.job_count, 5);
    }
}
