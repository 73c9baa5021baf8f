//! # toil-memory - In-process backends for toil
//!
//! Reference implementations of the `Datastore`, `Broker` and
//! `WorkerRegistry` contracts, backed by process-local state. Suitable for
//! tests, demos and single-process deployments; durability ends with the
//! process.

mod broker;
mod datastore;
mod registry;

pub use broker::MemoryBroker;
pub use datastore::MemoryDatastore;
pub use registry::MemoryWorkerRegistry;
