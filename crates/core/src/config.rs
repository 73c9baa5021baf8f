//! Configuration types for the manager and the worker supervisor.

use std::collections::HashMap;
use std::time::Duration;

/// Configuration for the [`JobManager`](crate::JobManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Upper bound of the domain priority range; broker priority is computed
    /// as `max_priority - job.priority`.
    pub max_priority: u8,
    /// Total publish attempts through the reconnect strategy.
    pub publish_attempts: u32,
    /// Pause between reconnect-and-retry publish attempts.
    pub publish_retry_pause: Duration,
    /// Pause before requeueing a delivery whose job record is missing.
    pub missing_job_pause: Duration,
    /// Per-retry-count overrides of the backoff growth, in seconds.
    pub backoff_overrides: HashMap<u32, u64>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_priority: 255,
            publish_attempts: 3,
            publish_retry_pause: Duration::from_secs(1),
            missing_job_pause: Duration::from_millis(500),
            backoff_overrides: HashMap::new(),
        }
    }
}

impl ManagerConfig {
    /// Create a new builder.
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::new()
    }
}

/// Builder for [`ManagerConfig`].
#[derive(Debug, Default)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum domain priority.
    pub fn max_priority(mut self, max: u8) -> Self {
        self.config.max_priority = max;
        self
    }

    /// Set the total publish attempts.
    pub fn publish_attempts(mut self, attempts: u32) -> Self {
        self.config.publish_attempts = attempts;
        self
    }

    /// Set the pause between publish retries.
    pub fn publish_retry_pause(mut self, pause: Duration) -> Self {
        self.config.publish_retry_pause = pause;
        self
    }

    /// Set the pause before requeueing a missing-job delivery.
    pub fn missing_job_pause(mut self, pause: Duration) -> Self {
        self.config.missing_job_pause = pause;
        self
    }

    /// Override the backoff growth for a specific retry count, in seconds.
    pub fn backoff_override(mut self, retries: u32, growth_secs: u64) -> Self {
        self.config.backoff_overrides.insert(retries, growth_secs);
        self
    }

    /// Build the ManagerConfig.
    pub fn build(self) -> ManagerConfig {
        self.config
    }
}

/// Configuration for the [`Supervisor`](crate::Supervisor).
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Name under which the worker registers itself.
    pub name: String,
    /// Timeout for one broker receive; bounds the time between checkpoints.
    pub fetch_timeout: Duration,
    /// Wall-clock interval between heartbeat checkpoints, independent of
    /// message traffic.
    pub heartbeat_interval: Duration,
    /// Suicide mode: terminate after this many jobs.
    pub max_jobs: Option<u64>,
    /// Suicide mode: terminate after being idle this long.
    pub max_idle: Option<Duration>,
    /// Suicide mode: terminate above this resident-set size.
    pub memory_limit_kb: Option<u64>,
    /// Exit on the first job execution error.
    pub stop_on_failure: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            name: default_worker_name(),
            fetch_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
            max_jobs: None,
            max_idle: None,
            memory_limit_kb: None,
            stop_on_failure: false,
        }
    }
}

impl SupervisorConfig {
    /// Create a new builder.
    pub fn builder() -> SupervisorConfigBuilder {
        SupervisorConfigBuilder::new()
    }
}

/// Builder for [`SupervisorConfig`].
#[derive(Debug, Default)]
pub struct SupervisorConfigBuilder {
    config: SupervisorConfig,
}

impl SupervisorConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the broker receive timeout.
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch_timeout = timeout;
        self
    }

    /// Set the heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Terminate after this many jobs.
    pub fn max_jobs(mut self, max: u64) -> Self {
        self.config.max_jobs = Some(max);
        self
    }

    /// Terminate after being idle this long.
    pub fn max_idle(mut self, max: Duration) -> Self {
        self.config.max_idle = Some(max);
        self
    }

    /// Terminate above this resident-set size in kilobytes.
    pub fn memory_limit_kb(mut self, limit: u64) -> Self {
        self.config.memory_limit_kb = Some(limit);
        self
    }

    /// Exit on the first job execution error.
    pub fn stop_on_failure(mut self, stop: bool) -> Self {
        self.config.stop_on_failure = stop;
        self
    }

    /// Build the SupervisorConfig.
    pub fn build(self) -> SupervisorConfig {
        self.config
    }
}

/// Default worker name: `host-pid`.
fn default_worker_name() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}-{}", host, std::process::id())
}
