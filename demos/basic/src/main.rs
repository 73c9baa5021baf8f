//! Basic demo using the in-memory backends.
//!
//! Demonstrates:
//! - Registering handlers and enqueueing jobs with priorities and a sequence
//! - Hosting a consume loop under a supervisor with a job budget
//! - Mapping the supervisor's exit reason to a process exit code
//!
//! Run with: `cargo run -p demo-basic`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use toil_core::{
    Handler, HandlerError, HandlerRegistry, Job, JobManager, ManagerConfig, Outcome, Supervisor,
    SupervisorConfig,
};
use toil_memory::{MemoryBroker, MemoryDatastore, MemoryWorkerRegistry};

/// Email notification job payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Email {
    to: String,
    subject: String,
}

struct SendEmail;

#[async_trait]
impl Handler for SendEmail {
    async fn run(&self, job: &Job) -> Result<Outcome, HandlerError> {
        let email: Email = serde_json::from_value(job.payload.clone())?;
        println!("[email] sending to: {}", email.to);
        println!("        subject: {}", email.subject);

        // Simulate some work
        tokio::time::sleep(Duration::from_millis(200)).await;

        println!("[email] sent\n");
        Ok(Outcome::Done)
    }
}

struct ProvisionStep;

#[async_trait]
impl Handler for ProvisionStep {
    async fn run(&self, job: &Job) -> Result<Outcome, HandlerError> {
        let step = job.payload["step"].as_str().unwrap_or("?");
        println!("[provision] running step: {step}\n");
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(Outcome::Done)
    }
}

#[tokio::main]
async fn main() -> toil_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    println!("toil job queue demo\n");

    let datastore = Arc::new(MemoryDatastore::new());
    let broker = Arc::new(MemoryBroker::new());
    let registry = Arc::new(MemoryWorkerRegistry::new());

    let mut handlers = HandlerRegistry::new();
    handlers.register("send_email", || Arc::new(SendEmail));
    handlers.register("provision_step", || Arc::new(ProvisionStep));

    let manager = Arc::new(JobManager::new(
        datastore,
        broker,
        handlers,
        ManagerConfig::default(),
    ));

    let emails = vec![
        Email {
            to: "alice@example.com".to_string(),
            subject: "Welcome!".to_string(),
        },
        Email {
            to: "bob@example.com".to_string(),
            subject: "Your order shipped".to_string(),
        },
        Email {
            to: "charlie@example.com".to_string(),
            subject: "Password reset".to_string(),
        },
    ];

    println!("Enqueueing {} emails (bob's is urgent)...", emails.len());
    for (i, email) in emails.into_iter().enumerate() {
        let priority = if email.to.starts_with("bob") { 10 } else { 100 };
        let mut job =
            Job::new("send_email", serde_json::to_value(&email)?).with_priority(priority);
        manager.enqueue(&mut job).await?;
        println!("  enqueued #{i}: {:?}", job.id());
    }

    println!("\nEnqueueing a provisioning sequence (runs strictly in order)...");
    for step in ["create-vm", "install-os", "start-services"] {
        let mut job = Job::new("provision_step", json!({ "step": step }))
            .in_sequence("provision-host-1");
        manager.enqueue(&mut job).await?;
        println!("  enqueued step: {step}");
    }

    println!("\nStarting supervised worker (exits after 6 jobs)...\n");

    let config = SupervisorConfig::builder()
        .name("demo-worker")
        .fetch_timeout(Duration::from_secs(1))
        .max_jobs(6)
        .build();
    let supervisor = Supervisor::new(manager, registry, config);
    supervisor.install_signal_handler();

    let reason = supervisor.run().await?;
    println!("worker exited: {reason:?}");
    std::process::exit(reason.code());
}
