//! # toil-core - Core types and traits for the job engine
//!
//! This crate provides the core abstractions of the toil job queue system:
//! - `Job`, `JobId`, `JobOptions`, `JobStatus` and the job history
//! - `JobManager` for enqueueing and executing jobs
//! - `Datastore` and `Broker` traits for storage and transport drivers
//! - `Handler` trait and registry for application job code
//! - `Supervisor` and `WorkerRegistry` for hosting a consume loop
//! - Error types

mod backoff;
mod broker;
mod config;
mod datastore;
mod error;
mod handler;
mod hooks;
mod job;
mod manager;
mod result;
mod supervisor;

// Re-export main types
pub use backoff::{growth, max_jitter, retry_delay_secs, GROWTH_BASE, GROWTH_FACTOR};
pub use broker::{
    broker_priority, publish_delay, publish_with_reconnect, Broker, Delivery, SharedBroker,
};
pub use config::{
    ManagerConfig, ManagerConfigBuilder, SupervisorConfig, SupervisorConfigBuilder,
};
pub use datastore::{Datastore, SharedDatastore};
pub use error::{Result, ToilError};
pub use handler::{Handler, HandlerError, HandlerRegistry, Outcome};
pub use hooks::{HookFlow, Hooks, Observer};
pub use job::{now_ms, HistoryEntry, Job, JobId, JobOptions, JobStatus};
pub use manager::JobManager;
pub use result::RunResult;
pub use supervisor::{
    ExitReason, SharedWorkerRegistry, Supervisor, WorkerRecord, WorkerRegistry, WorkerStatus,
};
