//! The narrow programmatic surface of the runtime.
//!
//! [`Engine`] owns the scheduler (or embedding) service for one loaded model.
//! Submission validates synchronously, builds the per-job sampler, blocks on
//! the slot pool for admission control and hands the job to the service.
//! Observation goes through point-in-time snapshots of a watch channel.

pub(crate) mod types;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::info;

use crate::engine::backend::ModelBackend;
use crate::engine::embedding::{EmbedJob, EmbeddingService};
use crate::engine::errors::EngineError;
use crate::engine::job::{JobId, JobRegistry, JobSnapshot};
use crate::engine::sampler::{build_sampler, SamplerSpec};
use crate::engine::scheduler::{Command, GenerativeService, RunJob, SchedulerConfig};
use crate::engine::slots::SlotPool;
use crate::engine::tokenizer::{apply_chat_template, Tokenizer};

pub use types::{
    ChatParams, CompletionParams, CompletionResult, EmbeddingParams, EmbeddingResult,
    EngineConfig, LoadingParams, ModelKind,
};

enum Service {
    Generative(GenerativeService),
    Embedding(EmbeddingService),
}

/// One loaded model plus its scheduler.
///
/// All submission methods are async only because admission blocks on the
/// slot pool; validation failures surface synchronously in the returned
/// error.
pub struct Engine {
    kind: ModelKind,
    service: Service,
    registry: Arc<JobRegistry>,
    pool: SlotPool,
    tokenizer: Arc<dyn Tokenizer>,
}

impl Engine {
    /// Build an engine over an already-constructed backend and tokenizer.
    ///
    /// The slot pool is sized from the backend's parallel-sequence limit.
    pub fn with_backend(
        backend: Box<dyn ModelBackend>,
        tokenizer: Arc<dyn Tokenizer>,
        kind: ModelKind,
        config: EngineConfig,
    ) -> Self {
        let pool = SlotPool::new(backend.n_seq_max().max(1));
        let service = match kind {
            ModelKind::Generative => Service::Generative(GenerativeService::start(
                backend,
                Arc::clone(&tokenizer),
                pool.clone(),
                SchedulerConfig {
                    n_keep: config.n_keep,
                    overflow_dir: config.overflow_dir,
                },
            )),
            ModelKind::Embedding => Service::Embedding(EmbeddingService::start(
                backend,
                Arc::clone(&tokenizer),
                pool.clone(),
            )),
        };
        info!(kind = ?kind, slots = pool.capacity(), "engine ready");
        Self {
            kind,
            service,
            registry: Arc::new(JobRegistry::new()),
            pool,
            tokenizer,
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    /// Submit a text-completion job. Returns once the job holds a slot and
    /// is queued for the scheduler.
    pub async fn submit_completion(
        &self,
        mut params: CompletionParams,
    ) -> Result<JobId, EngineError> {
        let Service::Generative(service) = &self.service else {
            return Err(EngineError::Unsupported {
                operation: "completion",
            });
        };
        params.validate()?;

        // Grammar and schema problems surface before any slot is held.
        let sampler = build_sampler(SamplerSpec {
            temperature: params.temperature,
            top_p: params.top_p,
            seed: params.seed.max(0) as u64,
            grammar: params.grammar.as_deref().filter(|g| !g.is_empty()),
            json_schema: params.json_schema.as_deref().filter(|s| !s.is_empty()),
        })?;

        let (id, shared, _rx) = self.registry.create();
        if params.session_id < 0 {
            params.session_id = id as i64;
        }

        let slot = match self.pool.acquire().await {
            Ok(slot) => slot,
            Err(e) => {
                self.registry.remove(id);
                return Err(e);
            }
        };

        let job = RunJob {
            shared,
            params,
            sampler,
            slot,
            submitted_at: Instant::now(),
        };
        if service.sender().send(Command::Run(Box::new(job))).await.is_err() {
            self.pool.release(slot);
            self.registry.remove(id);
            return Err(EngineError::ShuttingDown);
        }
        Ok(id)
    }

    /// Submit a chat-completion job: the message list is collapsed into a
    /// single prompt via the chat template, then follows the completion path.
    pub async fn submit_chat(&self, params: ChatParams) -> Result<JobId, EngineError> {
        if !matches!(self.service, Service::Generative(_)) {
            return Err(EngineError::Unsupported { operation: "chat" });
        }
        params.validate()?;
        let prompt = apply_chat_template(self.tokenizer.as_ref(), &params.messages, params.use_jinja)?;
        self.submit_completion(params.into_completion(prompt)).await
    }

    /// Submit an embedding job. Works on both engine kinds; the dedicated
    /// embedding service additionally packs queued jobs into shared batches.
    pub async fn submit_embedding(&self, params: EmbeddingParams) -> Result<JobId, EngineError> {
        params.validate()?;
        let (id, shared, _rx) = self.registry.create();
        let slot = match self.pool.acquire().await {
            Ok(slot) => slot,
            Err(e) => {
                self.registry.remove(id);
                return Err(e);
            }
        };
        let job = EmbedJob {
            shared,
            params,
            slot,
        };
        let sent = match &self.service {
            Service::Generative(service) => service
                .sender()
                .send(Command::Embed(job))
                .await
                .map_err(|_| ()),
            Service::Embedding(service) => service.sender().send(job).await.map_err(|_| ()),
        };
        if sent.is_err() {
            self.pool.release(slot);
            self.registry.remove(id);
            return Err(EngineError::ShuttingDown);
        }
        Ok(id)
    }

    // ── Observation ───────────────────────────────────────────────────────────

    fn snapshot(&self, job_id: JobId) -> Result<JobSnapshot, EngineError> {
        self.registry
            .get(job_id)
            .map(|entry| entry.rx.borrow().clone())
            .ok_or(EngineError::JobNotFound { job_id })
    }

    pub fn is_finished(&self, job_id: JobId) -> Result<bool, EngineError> {
        Ok(self.snapshot(job_id)?.is_terminal())
    }

    pub fn has_error(&self, job_id: JobId) -> Result<bool, EngineError> {
        Ok(self.snapshot(job_id)?.has_error())
    }

    /// The failure description, or an empty string for a healthy job.
    pub fn error_message(&self, job_id: JobId) -> Result<String, EngineError> {
        Ok(self.snapshot(job_id)?.error.unwrap_or_default())
    }

    /// Snapshot of a completion job's output; callable repeatedly while the
    /// job streams.
    pub fn result(&self, job_id: JobId) -> Result<CompletionResult, EngineError> {
        Ok(CompletionResult::from(&self.snapshot(job_id)?))
    }

    /// Take the result of an embedding job, removing it from the registry.
    pub fn embedding_result(&self, job_id: JobId) -> Result<EmbeddingResult, EngineError> {
        let entry = self
            .registry
            .remove(job_id)
            .ok_or(EngineError::JobNotFound { job_id })?;
        let snap = entry.rx.borrow().clone();
        Ok(EmbeddingResult {
            embedding: snap.embedding.unwrap_or_default(),
            token_count: snap.embedding_token_count,
        })
    }

    /// Block until the job reaches a terminal phase, returning the final
    /// snapshot.
    pub async fn wait(&self, job_id: JobId) -> Result<JobSnapshot, EngineError> {
        let entry = self
            .registry
            .get(job_id)
            .ok_or(EngineError::JobNotFound { job_id })?;
        let mut rx = entry.rx;
        let snap = rx
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        Ok(snap.clone())
    }

    /// Observe every snapshot the job publishes, token by token.
    pub fn subscribe(&self, job_id: JobId) -> Result<watch::Receiver<JobSnapshot>, EngineError> {
        self.registry
            .get(job_id)
            .map(|entry| entry.rx)
            .ok_or(EngineError::JobNotFound { job_id })
    }

    /// Request cancellation: non-blocking and idempotent. The job finishes
    /// (keeping partial output) at the scheduler's next tick.
    pub fn cancel(&self, job_id: JobId) -> Result<(), EngineError> {
        let entry = self
            .registry
            .get(job_id)
            .ok_or(EngineError::JobNotFound { job_id })?;
        entry.shared.cancel();
        Ok(())
    }

    /// Stop accepting work and fail whatever is still live, then join the
    /// service thread. Called implicitly on drop.
    pub fn shutdown(&mut self) {
        self.pool.shutdown();
        match &mut self.service {
            Service::Generative(service) => service.shutdown(),
            Service::Embedding(service) => service.shutdown(),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(feature = "llama")]
impl Engine {
    /// Load a generative model from a GGUF file and start its scheduler.
    pub fn load_model(
        path: impl AsRef<std::path::Path>,
        params: LoadingParams,
    ) -> Result<Self, EngineError> {
        Self::load_gguf(path.as_ref(), params, ModelKind::Generative)
    }

    /// Load an embedding model from a GGUF file and start the embedding
    /// service.
    pub fn load_embedding_model(
        path: impl AsRef<std::path::Path>,
        params: LoadingParams,
    ) -> Result<Self, EngineError> {
        Self::load_gguf(path.as_ref(), params, ModelKind::Embedding)
    }

    fn load_gguf(
        path: &std::path::Path,
        params: LoadingParams,
        kind: ModelKind,
    ) -> Result<Self, EngineError> {
        params.validate()?;
        if !path.exists() {
            return Err(EngineError::ModelLoad {
                path: path.to_path_buf(),
                message: "model file not found".into(),
            });
        }
        if path.extension().and_then(|e| e.to_str()) != Some("gguf") {
            return Err(EngineError::ModelLoad {
                path: path.to_path_buf(),
                message: "invalid model file extension, expected .gguf".into(),
            });
        }
        let (backend, tokenizer) =
            crate::engine::llama::load(path, &params, kind == ModelKind::Embedding)?;
        let config = EngineConfig::from(&params);
        Ok(Self::with_backend(backend, tokenizer, kind, config))
    }
}
