//! Worker-process supervision: registry record, heartbeat, suicide mode and
//! signal-driven shutdown.
//!
//! One supervisor hosts one consume loop in one OS process, with one job in
//! flight at a time. All shutdown is cooperative: signals and external
//! stop/kill marks are observed only at checkpoints, after each job and at
//! each heartbeat tick, so an in-flight handler is never interrupted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::job::{now_ms, JobId};
use crate::manager::JobManager;

/// Externally visible worker state. Operators mark a worker `Stop` or `Kill`
/// to shut it down at its next checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    /// Worker is alive and consuming.
    Running,
    /// Worker should finish the in-flight job and exit.
    Stop,
    /// Worker should exit as soon as its next checkpoint is reached.
    Kill,
}

/// A worker's self-reported registry record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Registry key.
    pub name: String,
    /// Host the worker runs on.
    pub host: String,
    /// Worker's own process id. A mismatch means another process has been
    /// promoted under this name.
    pub pid: u32,
    /// Operator-visible status.
    pub status: WorkerStatus,
    /// When the worker started (epoch milliseconds).
    pub started_at: i64,
    /// Last heartbeat (epoch milliseconds).
    pub pulse_at: i64,
    /// Jobs executed so far.
    pub job_count: u64,
    /// Resident-set size at the last heartbeat.
    pub memory_kb: u64,
    /// Seconds since the last job finished.
    pub idle_secs: u64,
    /// The last job this worker executed.
    pub last_job: Option<JobId>,
}

impl WorkerRecord {
    /// A fresh record for the current process.
    pub fn new(name: impl Into<String>) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let now = now_ms();

        Self {
            name: name.into(),
            host,
            pid: std::process::id(),
            status: WorkerStatus::Running,
            started_at: now,
            pulse_at: now,
            job_count: 0,
            memory_kb: 0,
            idle_secs: 0,
            last_job: None,
        }
    }
}

/// Registry of live worker processes.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Register a worker record, replacing any previous record under the
    /// same name.
    async fn register(&self, record: &WorkerRecord) -> Result<()>;

    /// Fetch a worker record by name.
    async fn fetch(&self, name: &str) -> Result<Option<WorkerRecord>>;

    /// Update an existing record.
    async fn update(&self, record: &WorkerRecord) -> Result<()>;

    /// Remove a record.
    async fn remove(&self, name: &str) -> Result<()>;
}

/// A type-erased worker registry shared across tasks.
pub type SharedWorkerRegistry = Arc<dyn WorkerRegistry>;

/// Why a supervisor exited. Each reason maps to a distinct process exit code
/// so an orchestrator can tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Normal shutdown-loop exit (signal or `stop_consuming`).
    Finished,
    /// Suicide mode: job budget, idle budget or memory ceiling reached.
    Suicide,
    /// The worker's own registry record disappeared.
    MissingRecord,
    /// The registry record carries another process's pid.
    ForeignPid,
    /// A job execution error with `stop_on_failure` set.
    FailedJob,
    /// Marked `Stop` or `Kill` externally.
    ForcedShutdown,
}

impl ExitReason {
    /// The process exit code for this reason.
    pub fn code(self) -> i32 {
        match self {
            ExitReason::Finished => 0,
            ExitReason::Suicide => 2,
            ExitReason::MissingRecord => 3,
            ExitReason::ForeignPid => 4,
            ExitReason::FailedJob => 5,
            ExitReason::ForcedShutdown => 6,
        }
    }
}

/// Hosts one [`JobManager`] consume loop in the current process.
pub struct Supervisor {
    manager: Arc<JobManager>,
    registry: SharedWorkerRegistry,
    config: SupervisorConfig,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Create a supervisor around a manager. The manager's stop token doubles
    /// as the shutdown token, so `stop_consuming` ends the loop.
    pub fn new(
        manager: Arc<JobManager>,
        registry: SharedWorkerRegistry,
        config: SupervisorConfig,
    ) -> Self {
        let shutdown = manager.stop_token();
        Self {
            manager,
            registry,
            config,
            shutdown,
        }
    }

    /// The token that ends the consume loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Install OS signal handling: SIGTERM/SIGINT request a deferred shutdown
    /// observed at the next checkpoint.
    pub fn install_signal_handler(&self) {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            wait_for_termination_signal().await;
            tracing::info!("termination signal received, shutting down after in-flight job");
            token.cancel();
        });
    }

    /// Run the consume loop until shutdown. Returns why the loop ended; the
    /// hosting binary maps it to a process exit code.
    pub async fn run(&self) -> Result<ExitReason> {
        let record = WorkerRecord::new(self.config.name.clone());
        let pid = record.pid;
        self.registry.register(&record).await?;

        tracing::info!(
            worker = %self.config.name,
            host = %record.host,
            pid = pid,
            "worker supervisor started"
        );

        let mut job_count: u64 = 0;
        let mut last_job: Option<JobId> = None;
        let mut last_activity = Instant::now();
        let mut last_checkpoint = Instant::now();

        let reason = loop {
            if self.shutdown.is_cancelled() {
                break ExitReason::Finished;
            }

            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break ExitReason::Finished,
                r = self.manager.broker().receive(self.config.fetch_timeout) => r,
            };

            let mut ran_job = false;
            let mut idle_wait = false;
            match received {
                Ok(Some(delivery)) => match self.manager.execute(&delivery, false).await {
                    Ok(ran) => {
                        if ran {
                            job_count += 1;
                            last_job = Some(delivery.job_id);
                            last_activity = Instant::now();
                            ran_job = true;
                        }
                    }
                    Err(e) => {
                        tracing::error!(
                            job_id = %delivery.job_id,
                            error = %e,
                            "job execution failed"
                        );
                        if self.config.stop_on_failure {
                            break ExitReason::FailedJob;
                        }
                    }
                },
                Ok(None) => {
                    // Wait timeout; fall through to the heartbeat checkpoint.
                    idle_wait = true;
                }
                Err(e) => {
                    tracing::error!(error = %e, "broker receive failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }

            // Checkpoint immediately after each job, on every empty wait and
            // at the wall-clock interval, whichever comes first.
            if ran_job || idle_wait || last_checkpoint.elapsed() >= self.config.heartbeat_interval {
                if let Some(reason) = self
                    .checkpoint(pid, job_count, last_job, last_activity)
                    .await?
                {
                    break reason;
                }
                last_checkpoint = Instant::now();
            }
        };

        self.finish(reason).await;
        Ok(reason)
    }

    /// One heartbeat checkpoint: verify the registry record still belongs to
    /// this process and is not marked for shutdown, update liveness fields,
    /// then apply the suicide policy.
    async fn checkpoint(
        &self,
        pid: u32,
        job_count: u64,
        last_job: Option<JobId>,
        last_activity: Instant,
    ) -> Result<Option<ExitReason>> {
        let Some(mut record) = self.registry.fetch(&self.config.name).await? else {
            tracing::warn!(worker = %self.config.name, "worker record missing from registry");
            return Ok(Some(ExitReason::MissingRecord));
        };

        if record.pid != pid {
            tracing::warn!(
                worker = %self.config.name,
                recorded_pid = record.pid,
                own_pid = pid,
                "another process holds this worker name"
            );
            return Ok(Some(ExitReason::ForeignPid));
        }

        match record.status {
            WorkerStatus::Stop | WorkerStatus::Kill => {
                tracing::info!(
                    worker = %self.config.name,
                    status = ?record.status,
                    "worker marked for shutdown externally"
                );
                return Ok(Some(ExitReason::ForcedShutdown));
            }
            WorkerStatus::Running => {}
        }

        let idle_secs = last_activity.elapsed().as_secs();
        record.pulse_at = now_ms();
        record.job_count = job_count;
        record.memory_kb = current_rss_kb();
        record.idle_secs = idle_secs;
        record.last_job = last_job;
        self.registry.update(&record).await?;

        self.manager.hooks().heartbeat();

        tracing::trace!(
            worker = %self.config.name,
            job_count = job_count,
            idle_secs = idle_secs,
            memory_kb = record.memory_kb,
            "heartbeat"
        );

        if let Some(max) = self.config.max_jobs {
            if job_count >= max {
                tracing::info!(worker = %self.config.name, job_count, "job budget reached");
                return Ok(Some(ExitReason::Suicide));
            }
        }
        if let Some(max_idle) = self.config.max_idle {
            if last_activity.elapsed() >= max_idle {
                tracing::info!(worker = %self.config.name, idle_secs, "idle budget reached");
                return Ok(Some(ExitReason::Suicide));
            }
        }
        if let Some(limit) = self.config.memory_limit_kb {
            if record.memory_kb > limit {
                tracing::info!(
                    worker = %self.config.name,
                    memory_kb = record.memory_kb,
                    limit_kb = limit,
                    "memory ceiling exceeded"
                );
                return Ok(Some(ExitReason::Suicide));
            }
        }

        Ok(None)
    }

    async fn finish(&self, reason: ExitReason) {
        if reason == ExitReason::ForcedShutdown {
            self.manager.hooks().force_shutdown();
        }

        // Deregister on clean exits; a promoted process keeps its record.
        if matches!(reason, ExitReason::Finished | ExitReason::Suicide) {
            if let Err(e) = self.registry.remove(&self.config.name).await {
                tracing::warn!(
                    worker = %self.config.name,
                    error = %e,
                    "failed to deregister worker"
                );
            }
        }

        tracing::info!(
            worker = %self.config.name,
            reason = ?reason,
            exit_code = reason.code(),
            "worker supervisor exiting"
        );
    }
}

async fn wait_for_termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Resident-set size of the current process in kilobytes. Zero where the
/// platform does not expose it.
fn current_rss_kb() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    return rest
                        .trim()
                        .trim_end_matches("kB")
                        .trim()
                        .parse()
                        .unwrap_or(0);
                }
            }
        }
        0
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}
