//! Handler contract and name-based handler resolution.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, ToilError};
use crate::job::Job;
use crate::result::RunResult;

/// Error returned from job handlers.
#[derive(Debug)]
pub struct HandlerError {
    /// Error message.
    pub message: String,
    /// Whether the job should be retried.
    pub retryable: bool,
}

impl HandlerError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a new non-retryable error (job is buried).
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl<E: std::error::Error> From<E> for HandlerError {
    fn from(err: E) -> Self {
        Self::retryable(err.to_string())
    }
}

/// What a handler hands back on success.
#[derive(Debug)]
pub enum Outcome {
    /// Plain success.
    Done,
    /// Success, and run this job again at the given instant (epoch ms) as a
    /// fresh clone.
    RunAgainAt(i64),
    /// An explicit result, passed through verbatim.
    Result(RunResult),
}

/// A unit-of-work implementation, resolved by worker name.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Execute one attempt for the given job.
    async fn run(&self, job: &Job) -> std::result::Result<Outcome, HandlerError>;
}

type HandlerFactory = Arc<dyn Fn() -> Arc<dyn Handler> + Send + Sync>;

/// Registry mapping stable worker names to handler factories.
///
/// Populated at startup; an unknown name is a typed configuration error, both
/// at enqueue and at execute time.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler factory under a worker name.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Handler> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Register a shared handler instance under a worker name.
    pub fn register_instance(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.register(name, move || handler.clone());
    }

    /// Whether a handler is registered under the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiate the handler registered under the given name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Handler>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| ToilError::UnknownHandler(name.to_string()))
    }

    /// Registered worker names.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}
