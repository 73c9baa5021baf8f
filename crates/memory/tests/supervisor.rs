//! Supervisor lifecycle against the in-memory drivers: heartbeat records,
//! suicide mode, external shutdown marks.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use toil_core::{
    Datastore, ExitReason, Handler, HandlerError, HandlerRegistry, Hooks, Job, JobManager,
    JobStatus, ManagerConfig, Observer, Outcome, Supervisor, SupervisorConfig, WorkerRegistry,
    WorkerStatus,
};
use toil_memory::{MemoryBroker, MemoryDatastore, MemoryWorkerRegistry};

struct OkHandler;

#[async_trait]
impl Handler for OkHandler {
    async fn run(&self, _job: &Job) -> Result<Outcome, HandlerError> {
        Ok(Outcome::Done)
    }
}

struct Rig {
    manager: Arc<JobManager>,
    datastore: Arc<MemoryDatastore>,
    registry: Arc<MemoryWorkerRegistry>,
}

fn rig(handlers: HandlerRegistry, hooks: Hooks) -> Rig {
    let datastore = Arc::new(MemoryDatastore::new());
    let broker = Arc::new(MemoryBroker::new());
    let config = ManagerConfig::builder()
        .publish_retry_pause(Duration::from_millis(1))
        .missing_job_pause(Duration::from_millis(1))
        .build();
    let manager = Arc::new(
        JobManager::new(datastore.clone(), broker, handlers, config).with_hooks(hooks),
    );
    Rig {
        manager,
        datastore,
        registry: Arc::new(MemoryWorkerRegistry::new()),
    }
}

fn quick_config(name: &str) -> SupervisorConfig {
    SupervisorConfig::builder()
        .name(name)
        .fetch_timeout(Duration::from_millis(20))
        .heartbeat_interval(Duration::from_millis(20))
        .build()
}

#[tokio::test]
async fn test_job_budget_triggers_suicide() {
    let mut handlers = HandlerRegistry::new();
    handlers.register("work", || Arc::new(OkHandler));
    let rig = rig(handlers, Hooks::new());

    let mut jobs: Vec<Job> = (0..2).map(|i| Job::new("work", json!({"i": i}))).collect();
    rig.manager.enqueue_many(&mut jobs).await.unwrap();

    let config = SupervisorConfig::builder()
        .name("budgeted")
        .fetch_timeout(Duration::from_millis(20))
        .heartbeat_interval(Duration::from_millis(20))
        .max_jobs(2)
        .build();
    let supervisor = Supervisor::new(rig.manager.clone(), rig.registry.clone(), config);

    let reason = supervisor.run().await.unwrap();
    assert_eq!(reason, ExitReason::Suicide);
    assert_eq!(reason.code(), 2);

    for job in &jobs {
        let done = rig.datastore.fetch_job(job.id().unwrap()).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Success);
    }
    // Clean exits deregister.
    assert!(rig.registry.fetch("budgeted").await.unwrap().is_none());
}

#[tokio::test]
async fn test_idle_budget_triggers_suicide() {
    let rig = rig(HandlerRegistry::new(), Hooks::new());

    let config = SupervisorConfig::builder()
        .name("idle")
        .fetch_timeout(Duration::from_millis(10))
        .heartbeat_interval(Duration::from_millis(10))
        .max_idle(Duration::from_millis(50))
        .build();
    let supervisor = Supervisor::new(rig.manager.clone(), rig.registry.clone(), config);

    let reason = supervisor.run().await.unwrap();
    assert_eq!(reason, ExitReason::Suicide);
}

#[tokio::test]
async fn test_stop_consuming_finishes_cleanly() {
    let rig = rig(HandlerRegistry::new(), Hooks::new());
    let supervisor = Supervisor::new(
        rig.manager.clone(),
        rig.registry.clone(),
        quick_config("stopping"),
    );

    let manager = rig.manager.clone();
    let task = tokio::spawn(async move { supervisor.run().await });

    tokio::time::sleep(Duration::from_millis(40)).await;
    manager.stop_consuming();

    let reason = task.await.unwrap().unwrap();
    assert_eq!(reason, ExitReason::Finished);
    assert_eq!(reason.code(), 0);
    assert!(rig.registry.fetch("stopping").await.unwrap().is_none());
}

#[tokio::test]
async fn test_external_stop_mark_forces_shutdown() {
    #[derive(Clone, Default)]
    struct ShutdownCounter(Arc<AtomicU32>);

    impl Observer for ShutdownCounter {
        fn force_shutdown(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let counter = ShutdownCounter::default();
    let mut hooks = Hooks::new();
    hooks.add(Arc::new(counter.clone()));
    let rig = rig(HandlerRegistry::new(), hooks);

    let supervisor = Supervisor::new(
        rig.manager.clone(),
        rig.registry.clone(),
        quick_config("marked"),
    );
    let registry = rig.registry.clone();
    let task = tokio::spawn(async move { supervisor.run().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    registry.mark("marked", WorkerStatus::Stop).unwrap();

    let reason = task.await.unwrap().unwrap();
    assert_eq!(reason, ExitReason::ForcedShutdown);
    assert_eq!(reason.code(), 6);
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    // The record survives a forced shutdown for post-mortem inspection.
    assert!(rig.registry.fetch("marked").await.unwrap().is_some());
}

#[tokio::test]
async fn test_missing_record_exits() {
    let rig = rig(HandlerRegistry::new(), Hooks::new());
    let supervisor = Supervisor::new(
        rig.manager.clone(),
        rig.registry.clone(),
        quick_config("ghost"),
    );

    let registry = rig.registry.clone();
    let task = tokio::spawn(async move { supervisor.run().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    registry.remove("ghost").await.unwrap();

    let reason = task.await.unwrap().unwrap();
    assert_eq!(reason, ExitReason::MissingRecord);
    assert_eq!(reason.code(), 3);
}

#[tokio::test]
async fn test_foreign_pid_exits() {
    let rig = rig(HandlerRegistry::new(), Hooks::new());
    let supervisor = Supervisor::new(
        rig.manager.clone(),
        rig.registry.clone(),
        quick_config("usurped"),
    );

    let registry = rig.registry.clone();
    let task = tokio::spawn(async move { supervisor.run().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    registry
        .reassign_pid("usurped", std::process::id().wrapping_add(1))
        .unwrap();

    let reason = task.await.unwrap().unwrap();
    assert_eq!(reason, ExitReason::ForeignPid);
    assert_eq!(reason.code(), 4);
    // The newer claimant keeps the record.
    assert!(rig.registry.fetch("usurped").await.unwrap().is_some());
}

#[tokio::test]
async fn test_stop_on_failure_exits_on_execution_error() {
    // The producer knows the handler; the consuming supervisor does not, so
    // every delivery raises an execution error.
    let datastore = Arc::new(MemoryDatastore::new());
    let broker = Arc::new(MemoryBroker::new());
    let config = ManagerConfig::default();

    let mut producer_handlers = HandlerRegistry::new();
    producer_handlers.register("work", || Arc::new(OkHandler));
    let producer = JobManager::new(
        datastore.clone(),
        broker.clone(),
        producer_handlers,
        config.clone(),
    );
    let mut job = Job::new("work", json!({}));
    producer.enqueue(&mut job).await.unwrap();

    let consumer = Arc::new(JobManager::new(
        datastore.clone(),
        broker,
        HandlerRegistry::new(),
        config,
    ));
    let registry = Arc::new(MemoryWorkerRegistry::new());
    let supervisor_config = SupervisorConfig::builder()
        .name("fragile")
        .fetch_timeout(Duration::from_millis(20))
        .stop_on_failure(true)
        .build();
    let supervisor = Supervisor::new(consumer, registry, supervisor_config);

    let reason = supervisor.run().await.unwrap();
    assert_eq!(reason, ExitReason::FailedJob);
    assert_eq!(reason.code(), 5);
}

#[tokio::test]
async fn test_heartbeat_updates_registry_record() {
    let mut handlers = HandlerRegistry::new();
    handlers.register("work", || Arc::new(OkHandler));
    let rig = rig(handlers, Hooks::new());

    let mut job = Job::new("work", json!({}));
    rig.manager.enqueue(&mut job).await.unwrap();

    let supervisor = Supervisor::new(
        rig.manager.clone(),
        rig.registry.clone(),
        quick_config("beating"),
    );
    let manager = rig.manager.clone();
    let registry = rig.registry.clone();
    let task = tokio::spawn(async move { supervisor.run().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = registry.fetch("beating").await.unwrap().unwrap();
    assert_eq!(record.job_count, 1);
    assert_eq!(record.last_job, job.id());
    assert!(record.pulse_at >= record.started_at);

    manager.stop_consuming();
    task.await.unwrap().unwrap();
}
