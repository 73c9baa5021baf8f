//! The job manager: turns lifecycle events into persistence and broker
//! operations.
//!
//! Owns enqueue, execute, retry/backoff, sequencing enforcement and
//! reconciliation. Constructed explicitly and injected wherever jobs are
//! produced or consumed; there is no global instance.

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::retry_delay_secs;
use crate::broker::{broker_priority, publish_delay, publish_with_reconnect, Delivery, SharedBroker};
use crate::config::ManagerConfig;
use crate::datastore::SharedDatastore;
use crate::error::{Result, ToilError};
use crate::handler::HandlerRegistry;
use crate::hooks::{HookFlow, Hooks};
use crate::job::{now_ms, Job, JobStatus};
use crate::result::RunResult;

/// Orchestrator tying the datastore and the broker together.
pub struct JobManager {
    datastore: SharedDatastore,
    broker: SharedBroker,
    handlers: HandlerRegistry,
    hooks: Hooks,
    config: ManagerConfig,
    host: String,
    stop: CancellationToken,
}

impl JobManager {
    /// Create a new manager.
    pub fn new(
        datastore: SharedDatastore,
        broker: SharedBroker,
        handlers: HandlerRegistry,
        config: ManagerConfig,
    ) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            datastore,
            broker,
            handlers,
            hooks: Hooks::new(),
            config,
            host,
            stop: CancellationToken::new(),
        }
    }

    /// Attach lifecycle observers.
    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// The broker this manager publishes to and consumes from.
    pub fn broker(&self) -> &SharedBroker {
        &self.broker
    }

    /// The datastore this manager persists to.
    pub fn datastore(&self) -> &SharedDatastore {
        &self.datastore
    }

    /// The lifecycle observers.
    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    /// The handler registry.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Token cancelled by [`JobManager::stop_consuming`]. Consume loops watch
    /// it at their checkpoints.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Request that consume loops stop. Safe to call from a message callback
    /// or a signal handler; cancellation is cooperative.
    pub fn stop_consuming(&self) {
        self.stop.cancel();
    }

    // ========== Enqueue ==========

    /// Enqueue one job: persist it, then publish unless withheld by its
    /// sequence.
    ///
    /// A persistence failure aborts with no partial state. A publish failure
    /// after successful persistence also errors, but the job remains durably
    /// stored and eligible for later revival.
    pub async fn enqueue(&self, job: &mut Job) -> Result<()> {
        if !self.handlers.contains(&job.worker) {
            return Err(ToilError::UnknownHandler(job.worker.clone()));
        }

        self.datastore
            .persist_job(job)
            .await
            .map_err(|e| ToilError::Enqueue(format!("persist failed: {e}")))?;

        self.publish_or_withhold(job).await
    }

    /// Enqueue a batch: persist all jobs in one datastore call, then publish
    /// each independently, applying the per-sequence withholding rule.
    pub async fn enqueue_many(&self, jobs: &mut [Job]) -> Result<()> {
        for job in jobs.iter() {
            if !self.handlers.contains(&job.worker) {
                return Err(ToilError::UnknownHandler(job.worker.clone()));
            }
        }

        self.datastore
            .persist_jobs(jobs)
            .await
            .map_err(|e| ToilError::Enqueue(format!("batch persist failed: {e}")))?;

        let mut first_err = None;
        for job in jobs.iter_mut() {
            if let Err(e) = self.publish_or_withhold(job).await {
                tracing::error!(job_id = ?job.id(), error = %e, "publish failed for batch job");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Publish a persisted job unless an earlier job in its sequence is still
    /// outstanding, in which case record the withholding and stop.
    async fn publish_or_withhold(&self, job: &mut Job) -> Result<()> {
        if job.sequence.is_some() && self.datastore.currently_sequenced(job).await? {
            job.record(job.status, "withheld for sequencing", None);
            self.datastore.persist_job(job).await?;
            tracing::debug!(
                job_id = ?job.id(),
                sequence = job.sequence.as_deref(),
                "job withheld for sequencing"
            );
            return Ok(());
        }

        self.publish_job(job).await
    }

    /// Publish a persisted job to the broker, mapping priority and computing
    /// the delivery delay, with transport failures retried through the
    /// reconnect strategy.
    async fn publish_job(&self, job: &mut Job) -> Result<()> {
        let id = job
            .id()
            .ok_or_else(|| ToilError::InvalidJob("cannot publish an unpersisted job".to_string()))?;

        let priority = broker_priority(job.priority, self.config.max_priority);
        let delay = publish_delay(job.run_at, now_ms());

        publish_with_reconnect(
            self.broker.as_ref(),
            id,
            priority,
            delay,
            self.config.publish_attempts,
            self.config.publish_retry_pause,
        )
        .await
        .map_err(|e| {
            tracing::error!(
                job_id = %id,
                error = %e,
                "publish failed; job remains stored for manual revival"
            );
            ToilError::Enqueue(format!("publish failed for job {id}: {e}"))
        })?;

        job.pushed_to_broker = true;
        self.datastore.persist_job(job).await?;

        tracing::debug!(
            job_id = %id,
            priority = priority,
            delay_ms = delay.as_millis() as u64,
            "job published"
        );
        Ok(())
    }

    // ========== Execute ==========

    /// Execute the job referenced by a delivery.
    ///
    /// Returns `Ok(true)` when a handler attempt actually ran, `Ok(false)`
    /// when the delivery was skipped (duplicate, already owned, missing
    /// record, vetoed). With `force` set, the terminal- and busy-status
    /// guards are bypassed.
    pub async fn execute(&self, delivery: &Delivery, force: bool) -> Result<bool> {
        let mut job = match self.datastore.fetch_job(delivery.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.handle_missing_job(delivery).await?;
                return Ok(false);
            }
            // A fetch failure is handled like a missing record: pause and
            // requeue once, then drop, so an outage never spins on the same
            // in-flight delivery.
            Err(e) => {
                tracing::error!(
                    job_id = %delivery.job_id,
                    error = %e,
                    "datastore fetch failed for delivery"
                );
                self.handle_missing_job(delivery).await?;
                return Ok(false);
            }
        };

        // Redelivery of an already finished job must be idempotent.
        if !force && job.status.is_terminal() {
            tracing::debug!(
                job_id = %delivery.job_id,
                status = %job.status,
                "duplicate delivery of a finished job, acknowledging"
            );
            self.ack_quietly(delivery).await;
            return Ok(false);
        }

        // Another worker already holds the job.
        if !force && job.status == JobStatus::Busy {
            tracing::debug!(job_id = %delivery.job_id, "job already locked, acknowledging");
            self.ack_quietly(delivery).await;
            return Ok(false);
        }

        let handler = match self.handlers.resolve(&job.worker) {
            Ok(handler) => handler,
            Err(e) => {
                tracing::error!(
                    job_id = %delivery.job_id,
                    worker = %job.worker,
                    "no handler registered for delivered job"
                );
                self.ack_quietly(delivery).await;
                return Err(e);
            }
        };

        // Lock the job before running.
        job.start_time = Some(now_ms());
        job.host_name = Some(self.host.clone());
        job.record(JobStatus::Busy, "locked", None);
        self.datastore.persist_job(&mut job).await?;

        if self.hooks.before_execute(&job) == HookFlow::Abort {
            tracing::warn!(job_id = %delivery.job_id, "execution vetoed by observer");
            return Ok(false);
        }

        let started = Instant::now();
        let result = self.run_handler(handler, &job).await;

        // The attempt has run; the delivery is settled regardless of outcome.
        // Negative acknowledgement is reserved for load/consistency failures.
        self.ack_quietly(delivery).await;

        self.reconcile(&mut job, result).await?;

        let duration_ms = job
            .duration_ms
            .unwrap_or_else(|| started.elapsed().as_millis() as u64);
        self.hooks.after_execute(&job, duration_ms);
        self.hooks.after_completed(&job);

        Ok(true)
    }

    /// A delivery whose job record is missing or unfetchable: requeue once
    /// after a short pause, then drop it for good.
    async fn handle_missing_job(&self, delivery: &Delivery) -> Result<()> {
        if !delivery.redelivered {
            tracing::warn!(
                job_id = %delivery.job_id,
                "job record missing for delivery, requeueing once"
            );
            tokio::time::sleep(self.config.missing_job_pause).await;
            self.broker.nack(delivery, true).await
        } else {
            tracing::error!(
                job_id = %delivery.job_id,
                "job record still missing on redelivery, dropping"
            );
            self.broker.nack(delivery, false).await
        }
    }

    /// Run the handler under a separate task so a panic is contained, and
    /// coerce whatever comes back into a result.
    async fn run_handler(&self, handler: Arc<dyn crate::handler::Handler>, job: &Job) -> RunResult {
        let run_job = job.clone();
        let attempt = tokio::spawn(async move { handler.run(&run_job).await });

        match attempt.await {
            Ok(outcome) => RunResult::from_handler(outcome),
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    format!("handler panicked: {join_err}")
                } else {
                    format!("handler task failed: {join_err}")
                };
                tracing::error!(job_id = ?job.id(), error = %message, "handler crashed");
                RunResult::Failed {
                    message: message.clone(),
                    error: Some(message),
                    retry: true,
                    retry_at: None,
                }
            }
        }
    }

    async fn ack_quietly(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.ack(delivery).await {
            tracing::error!(job_id = %delivery.job_id, error = %e, "failed to ack delivery");
        }
    }

    // ========== Reconciliation ==========

    /// Reconcile the outcome of one attempt back into durable state: retry,
    /// bury or complete, then schedule recurrence and advance the sequence
    /// where applicable.
    ///
    /// The history context of a failed attempt records the error text, the
    /// retry counter and the computed next run. Jobs the handler itself
    /// enqueued during the attempt are not tracked.
    pub async fn reconcile(&self, job: &mut Job, result: RunResult) -> Result<()> {
        let now = now_ms();
        job.end_time = Some(now);
        job.duration_ms = job.start_time.map(|s| (now - s).max(0) as u64);

        let mut status = result.status();

        if status == JobStatus::Failed {
            job.retries += 1;
            if job.retries < job.options.max_retries {
                let run_at = match result.requested_retry_at() {
                    Some(at) => at,
                    None => {
                        let delay = retry_delay_secs(job.retries, &self.config.backoff_overrides);
                        now + (delay as i64) * 1000
                    }
                };
                job.run_at = run_at;
                job.record(
                    JobStatus::Failed,
                    result.message().unwrap_or("failed"),
                    Some(serde_json::json!({
                        "error": result.error(),
                        "retries": job.retries,
                        "run_at": run_at,
                    })),
                );
                self.datastore.persist_job(job).await?;

                tracing::debug!(
                    job_id = ?job.id(),
                    retries = job.retries,
                    run_at = run_at,
                    "job scheduled for retry"
                );

                // Re-enters the publish path; sequencing still applies.
                return self.publish_or_withhold(job).await;
            }
            status = JobStatus::Buried;
        }

        let context = match &result {
            RunResult::Failed { .. } => Some(serde_json::json!({
                "error": result.error(),
                "retries": job.retries,
            })),
            _ => None,
        };
        let message = result.message().unwrap_or(match status {
            JobStatus::Success => "completed",
            JobStatus::Paused => "paused",
            JobStatus::Buried => "buried",
            _ => "done",
        });
        job.record(status, message, context);
        self.datastore.persist_job(job).await?;

        if status == JobStatus::Buried {
            tracing::warn!(
                job_id = ?job.id(),
                retries = job.retries,
                last_message = job.last_message.as_deref(),
                "job buried"
            );
        }

        // Recurrence: spawn a fresh clone unless a similar job is already
        // outstanding.
        if let Some(run_again_at) = result.run_again_at() {
            if !self.datastore.is_similar_job(job).await? {
                let mut clone = job.recurrence_clone(run_again_at);
                match self.enqueue_clone(&mut clone).await {
                    Ok(()) => tracing::debug!(
                        job_id = ?job.id(),
                        next_id = ?clone.id(),
                        run_at = run_again_at,
                        "recurrence scheduled"
                    ),
                    Err(e) => tracing::error!(
                        job_id = ?job.id(),
                        error = %e,
                        "failed to enqueue recurrence clone"
                    ),
                }
            } else {
                tracing::debug!(
                    job_id = ?job.id(),
                    group = job.group_key(),
                    "similar job outstanding, skipping recurrence"
                );
            }
        }

        // Sequencing only advances on terminal states, never on requeued
        // failures.
        if job.sequence.is_some() && status.is_terminal() {
            if let Some(mut next) = self.datastore.fetch_next_sequence(job).await? {
                tracing::debug!(
                    job_id = ?job.id(),
                    next_id = ?next.id(),
                    sequence = job.sequence.as_deref(),
                    "advancing sequence"
                );
                if let Err(e) = self.publish_job(&mut next).await {
                    tracing::error!(
                        next_id = ?next.id(),
                        error = %e,
                        "failed to publish next job in sequence"
                    );
                }
            }
        }

        Ok(())
    }

    /// Enqueue a recurrence clone. Kept behind a box: `execute` awaits
    /// `reconcile`, which awaits `enqueue`, and boxing keeps the generated
    /// futures from referencing each other across that chain.
    fn enqueue_clone<'a>(
        &'a self,
        job: &'a mut Job,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.enqueue(job))
    }
}
