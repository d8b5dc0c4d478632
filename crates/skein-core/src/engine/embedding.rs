//! The embedding path: a degenerate scheduler that packs whole inputs into
//! one decode and extracts pooled vectors.
//!
//! Shared by both services: the generative scheduler runs single embedding
//! jobs between ticks, while [`EmbeddingService`] (the dedicated service for
//! embedding models) drains its queue and packs several jobs into one batch,
//! each on its own slot with logits requested at its final token.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::types::EmbeddingParams;
use crate::engine::backend::{ModelBackend, Pos, Token};
use crate::engine::batch::Batch;
use crate::engine::job::{JobPhase, JobShared};
use crate::engine::slots::SlotPool;
use crate::engine::tokenizer::Tokenizer;

pub(crate) struct EmbedJob {
    pub shared: Arc<JobShared>,
    pub params: EmbeddingParams,
    pub slot: crate::engine::backend::SlotId,
}

/// Dedicated service for embedding models. Completion and chat submissions
/// are rejected at the submission boundary, so the queue only ever carries
/// embedding jobs.
pub(crate) struct EmbeddingService {
    tx: Option<mpsc::Sender<EmbedJob>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl EmbeddingService {
    pub fn start(
        backend: Box<dyn ModelBackend>,
        tokenizer: Arc<dyn Tokenizer>,
        pool: SlotPool,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<EmbedJob>(128);
        let thread = std::thread::Builder::new()
            .name("skein-embedding".into())
            .spawn(move || run(backend, tokenizer, pool, rx))
            .expect("failed to spawn embedding thread");
        Self {
            tx: Some(tx),
            thread: Some(thread),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<EmbedJob> {
        self.tx.clone().expect("service already shut down")
    }

    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EmbeddingService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    mut backend: Box<dyn ModelBackend>,
    tokenizer: Arc<dyn Tokenizer>,
    pool: SlotPool,
    mut rx: mpsc::Receiver<EmbedJob>,
) {
    info!(
        n_ctx = backend.n_ctx(),
        slots = pool.capacity(),
        "embedding service started"
    );
    while let Some(first) = rx.blocking_recv() {
        let mut jobs = vec![first];
        // Pack whatever else is already queued, one slot each.
        let max_pack = backend.n_seq_max().max(1);
        while jobs.len() < max_pack {
            match rx.try_recv() {
                Ok(job) => jobs.push(job),
                Err(_) => break,
            }
        }
        // Tighter per-job budget when sharing the context between inputs.
        let budget = (backend.n_ctx() / jobs.len()).saturating_sub(4).min(512);
        process_batch(backend.as_mut(), tokenizer.as_ref(), &pool, jobs, budget);
    }
}

/// Tokenize, pack and decode a group of embedding jobs, then extract one
/// vector per job. Every exit path wipes and releases the job's slot.
pub(crate) fn process_batch(
    backend: &mut dyn ModelBackend,
    tokenizer: &dyn Tokenizer,
    pool: &SlotPool,
    jobs: Vec<EmbedJob>,
    per_job_budget: usize,
) {
    struct Prepared {
        job: EmbedJob,
        last_index: usize,
        token_count: usize,
    }

    let release = |backend: &mut dyn ModelBackend, job: &EmbedJob| {
        backend.seq_remove(job.slot, 0, None);
        pool.release(job.slot);
    };

    let mut batch = Batch::new(backend.n_batch().max(1));
    let budget = per_job_budget.min(backend.n_batch().max(1) / jobs.len().max(1)).max(1);
    let mut prepared: Vec<Prepared> = Vec::with_capacity(jobs.len());

    for job in jobs {
        job.shared.publish(|s| s.phase = JobPhase::DecodingPrompt);
        let mut tokens: Vec<Token> = match tokenizer.tokenize(&job.params.input, true) {
            Ok(tokens) => tokens,
            Err(e) => {
                job.shared.fail(format!("Failed to tokenize input: {e}"));
                release(backend, &job);
                continue;
            }
        };
        if tokens.is_empty() {
            job.shared.fail("Input text resulted in empty tokens");
            release(backend, &job);
            continue;
        }
        if tokens.len() > budget {
            debug!(job = job.shared.id, budget, "truncated embedding input");
            tokens.truncate(budget);
        }

        // Clean KV for this sequence before the single decode.
        backend.seq_remove(job.slot, 0, None);
        let mut last_index = 0;
        let count = tokens.len();
        let mut packed = true;
        for (i, &token) in tokens.iter().enumerate() {
            match batch.add(token, i as Pos, job.slot, i + 1 == count) {
                Ok(index) => last_index = index,
                Err(e) => {
                    job.shared.fail(format!("Failed to pack embedding input: {e}"));
                    release(backend, &job);
                    packed = false;
                    break;
                }
            }
        }
        if packed {
            prepared.push(Prepared {
                job,
                last_index,
                token_count: count,
            });
        }
    }

    if prepared.is_empty() {
        return;
    }

    backend.set_embedding_mode(true);
    if let Err(e) = backend.decode(&batch) {
        warn!(error = %e, "embedding decode failed");
        for p in &prepared {
            p.job
                .shared
                .fail("Failed to decode input for embedding generation");
            release(backend, &p.job);
        }
        backend.set_embedding_mode(false);
        return;
    }

    for p in &prepared {
        // Sequence-level embedding when the model pools, last-token otherwise.
        let extracted = if backend.pools_embeddings() {
            backend
                .seq_embedding(p.job.slot)
                .or_else(|_| backend.token_embedding(p.last_index))
        } else {
            backend.token_embedding(p.last_index)
        };
        match extracted {
            Ok(mut embedding) => {
                if p.job.params.normalize {
                    l2_normalize(&mut embedding);
                }
                let token_count = p.token_count;
                p.job.shared.publish(move |s| {
                    s.phase = JobPhase::Finished;
                    s.embedding = Some(embedding);
                    s.embedding_token_count = token_count;
                });
            }
            Err(e) => {
                p.job.shared.fail(format!("Embedding extraction failed: {e}"));
            }
        }
        release(backend, &p.job);
    }
    backend.set_embedding_mode(false);
}

fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-8 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}
