//! Error types for the toil job queue engine.

use thiserror::Error;

/// The main error type for the toil engine.
#[derive(Error, Debug)]
pub enum ToilError {
    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Enqueue failed; the job may still be durably stored.
    #[error("enqueue failed: {0}")]
    Enqueue(String),

    /// Durable storage failure.
    #[error("datastore error: {0}")]
    Datastore(String),

    /// Broker failure that is not a transport problem.
    #[error("broker error: {0}")]
    Broker(String),

    /// Broker transport failure; eligible for reconnect-and-retry.
    #[error("transport error: {0}")]
    Transport(String),

    /// No handler registered under the given worker name.
    #[error("unknown handler: {0}")]
    UnknownHandler(String),

    /// Malformed or inconsistent job data.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// Job id referenced by a delivery is missing from the datastore.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Worker supervision error.
    #[error("worker error: {0}")]
    Worker(String),
}

impl ToilError {
    /// Whether this error is a broker transport failure, the only class the
    /// publish layer retries through a reconnect.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Result type alias using ToilError.
pub type Result<T> = std::result::Result<T, ToilError>;
