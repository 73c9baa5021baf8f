//! In-memory broker.
//!
//! Single consumer credit, priority ordering with FIFO ties, delayed
//! delivery via a due-time list promoted on each receive.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use toil_core::{now_ms, Broker, Delivery, JobId, Result, ToilError};

/// Broker holding the queue in process memory. Delivery tags are issued from
/// a counter and never reused.
pub struct MemoryBroker {
    state: Mutex<State>,
    notify: Notify,
}

struct State {
    ready: BinaryHeap<Entry>,
    delayed: Vec<Delayed>,
    inflight: Option<Inflight>,
    next_tag: u64,
    next_seq: u64,
}

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    priority: u8,
    seq: u64,
    job_id: JobId,
    redelivered: bool,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher broker priority wins, then lower seq (FIFO).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Delayed {
    due_ms: i64,
    entry: Entry,
}

struct Inflight {
    delivery: Delivery,
    priority: u8,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                ready: BinaryHeap::new(),
                delayed: Vec::new(),
                inflight: None,
                next_tag: 1,
                next_seq: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Messages currently queued (ready plus delayed), excluding in-flight.
    pub fn queued(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.ready.len() + state.delayed.len()
    }

    fn promote_due(state: &mut State) {
        let now = now_ms();
        let mut i = 0;
        while i < state.delayed.len() {
            if state.delayed[i].due_ms <= now {
                let delayed = state.delayed.swap_remove(i);
                state.ready.push(delayed.entry);
            } else {
                i += 1;
            }
        }
    }

    /// Time until the earliest delayed message becomes due.
    fn next_due(state: &State) -> Option<Duration> {
        let now = now_ms();
        state
            .delayed
            .iter()
            .map(|d| Duration::from_millis((d.due_ms - now).max(0) as u64))
            .min()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, job_id: JobId, priority: u8, delay: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = Entry {
            priority,
            seq: state.next_seq,
            job_id,
            redelivered: false,
        };
        state.next_seq += 1;

        if delay.is_zero() {
            state.ready.push(entry);
        } else {
            state.delayed.push(Delayed {
                due_ms: now_ms() + delay.as_millis() as i64,
                entry,
            });
        }
        drop(state);

        tracing::trace!(
            job_id = %job_id,
            priority = priority,
            delay_ms = delay.as_millis() as u64,
            "message queued"
        );
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;

        loop {
            let next_due = {
                let mut state = self.state.lock().unwrap();
                Self::promote_due(&mut state);

                // An unacknowledged delivery is re-presented before anything
                // new is handed out.
                if let Some(inflight) = state.inflight.as_mut() {
                    inflight.delivery.redelivered = true;
                    return Ok(Some(inflight.delivery.clone()));
                }

                if let Some(entry) = state.ready.pop() {
                    let tag = state.next_tag;
                    state.next_tag += 1;
                    let delivery = Delivery {
                        tag,
                        job_id: entry.job_id,
                        redelivered: entry.redelivered,
                    };
                    state.inflight = Some(Inflight {
                        delivery: delivery.clone(),
                        priority: entry.priority,
                    });
                    return Ok(Some(delivery));
                }

                Self::next_due(&state)
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let mut sleep = deadline - now;
            if let Some(due) = next_due {
                sleep = sleep.min(due);
            }
            let _ = tokio::time::timeout(sleep, self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match &state.inflight {
            Some(inflight) if inflight.delivery.tag == delivery.tag => {
                state.inflight = None;
                Ok(())
            }
            _ => Err(ToilError::Broker(format!(
                "ack for unknown delivery tag {}",
                delivery.tag
            ))),
        }
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let inflight = match state.inflight.take() {
            Some(inflight) if inflight.delivery.tag == delivery.tag => inflight,
            other => {
                state.inflight = other;
                return Err(ToilError::Broker(format!(
                    "nack for unknown delivery tag {}",
                    delivery.tag
                )));
            }
        };

        if requeue {
            let entry = Entry {
                priority: inflight.priority,
                seq: state.next_seq,
                job_id: inflight.delivery.job_id,
                redelivered: true,
            };
            state.next_seq += 1;
            state.ready.push(entry);
            drop(state);
            tracing::debug!(job_id = %delivery.job_id, "message requeued");
            self.notify.notify_one();
        }
        Ok(())
    }
}
