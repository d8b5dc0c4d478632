//! Job identity, observable state and the id → job registry.
//!
//! The scheduler is the single writer of a job's observable state; callers
//! read point-in-time snapshots through a watch channel. This replaces a
//! per-job mutex on the hot path with one `send_modify` per output event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::engine::backend::Token;

/// Monotonically increasing job identifier, assigned at submission.
pub type JobId = u64;

/// Lifecycle of one generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    /// Accepted, not yet picked up by the scheduler.
    Queued,
    /// Prompt tokens are being prefilled into the KV cache.
    DecodingPrompt,
    /// One token is sampled per tick.
    Generating,
    Finished,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Finished | JobPhase::Failed)
    }
}

/// Point-in-time view of a job, emitted on every output event.
///
/// `tokens` and `text` are append-only: successive snapshots only ever grow
/// them, in generation order.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub phase: JobPhase,
    /// Failure description once `phase == Failed`.
    pub error: Option<String>,
    pub tokens: Vec<Token>,
    pub text: String,
    /// Tokens per second over the generation phase.
    pub tps: f32,
    /// Time to first generated token, in milliseconds from submission.
    pub ttft_ms: f32,
    pub prompt_token_count: usize,
    /// Result of an embedding job.
    pub embedding: Option<Vec<f32>>,
    pub embedding_token_count: usize,
}

impl Default for JobSnapshot {
    fn default() -> Self {
        Self {
            phase: JobPhase::Queued,
            error: None,
            tokens: Vec::new(),
            text: String::new(),
            tps: 0.0,
            ttft_ms: 0.0,
            prompt_token_count: 0,
            embedding: None,
            embedding_token_count: 0,
        }
    }
}

impl JobSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// The caller-facing half of a job: cancellation flag and snapshot publisher.
pub(crate) struct JobShared {
    pub id: JobId,
    cancel: AtomicBool,
    tx: watch::Sender<JobSnapshot>,
}

impl JobShared {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Mutate the current snapshot in place and notify every observer.
    pub fn publish<F: FnOnce(&mut JobSnapshot)>(&self, update: F) {
        self.tx.send_modify(update);
    }

    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        self.publish(|s| {
            s.phase = JobPhase::Failed;
            s.error = Some(message);
        });
    }
}

#[derive(Clone)]
pub(crate) struct JobEntry {
    pub shared: Arc<JobShared>,
    pub rx: watch::Receiver<JobSnapshot>,
}

/// Id → job map shared between submission, observation and the scheduler.
pub(crate) struct JobRegistry {
    next_id: AtomicU64,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a job id, register the entry and return the shared handle.
    pub fn create(&self) -> (JobId, Arc<JobShared>, watch::Receiver<JobSnapshot>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(JobSnapshot::default());
        let shared = Arc::new(JobShared {
            id,
            cancel: AtomicBool::new(false),
            tx,
        });
        self.jobs
            .lock()
            .expect("job registry lock poisoned")
            .insert(
                id,
                JobEntry {
                    shared: Arc::clone(&shared),
                    rx: rx.clone(),
                },
            );
        (id, shared, rx)
    }

    pub fn get(&self, id: JobId) -> Option<JobEntry> {
        self.jobs
            .lock()
            .expect("job registry lock poisoned")
            .get(&id)
            .cloned()
    }

    pub fn remove(&self, id: JobId) -> Option<JobEntry> {
        self.jobs
            .lock()
            .expect("job registry lock poisoned")
            .remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_assigns_monotonic_ids() {
        let registry = JobRegistry::new();
        let (a, _, _) = registry.create();
        let (b, _, _) = registry.create();
        assert!(b > a);
    }

    #[test]
    fn snapshots_are_observable_after_publish() {
        let registry = JobRegistry::new();
        let (id, shared, rx) = registry.create();
        shared.publish(|s| {
            s.phase = JobPhase::Generating;
            s.tokens.push(42);
            s.text.push('x');
        });
        let snap = rx.borrow().clone();
        assert_eq!(snap.phase, JobPhase::Generating);
        assert_eq!(snap.tokens, vec![42]);
        assert!(registry.get(id).is_some());
        registry.remove(id);
        assert!(registry.get(id).is_none());
    }

    #[tokio::test]
    async fn waiters_wake_on_terminal_transition() {
        let registry = JobRegistry::new();
        let (_, shared, rx) = registry.create();
        let waiter = tokio::spawn(async move {
            let mut rx = rx;
            let snap = rx.wait_for(|s| s.is_terminal()).await.unwrap().clone();
            snap
        });
        shared.fail("boom");
        let snap = waiter.await.unwrap();
        assert_eq!(snap.phase, JobPhase::Failed);
        assert_eq!(snap.error.as_deref(), Some("boom"));
    }
}
