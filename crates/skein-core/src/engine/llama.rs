//! llama.cpp-backed implementation of the backend seam and tokenizer.
//!
//! Everything the scheduler needs funnels through [`LlamaModelBackend`]; the
//! rest of the crate never touches llama-cpp-2 types.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::token::LlamaToken;
use tracing::{info, warn};

use crate::api::types::LoadingParams;
use crate::engine::backend::{BackendError, ModelBackend, Pos, SlotId, Token};
use crate::engine::batch::Batch;
use crate::engine::errors::EngineError;
use crate::engine::tokenizer::Tokenizer;

/// Open the model file and build the backend/tokenizer pair for the engine.
pub(crate) fn load(
    path: &Path,
    params: &LoadingParams,
    embedding: bool,
) -> Result<(Box<dyn ModelBackend>, Arc<dyn Tokenizer>), EngineError> {
    let model_load_err = |message: String| EngineError::ModelLoad {
        path: path.to_path_buf(),
        message,
    };

    let backend = LlamaBackend::init().map_err(|e| model_load_err(e.to_string()))?;
    let model_params = LlamaModelParams::default()
        .with_n_gpu_layers(params.n_gpu_layers)
        .with_use_mlock(params.use_mlock);
    let model = Arc::new(
        LlamaModel::load_from_file(&backend, path, &model_params)
            .map_err(|e| model_load_err(e.to_string()))?,
    );

    let n_ctx_train = model.n_ctx_train() as i64;
    if i64::from(params.n_ctx) > n_ctx_train {
        warn!(
            requested = params.n_ctx,
            trained = n_ctx_train,
            "requested context exceeds the model's training context"
        );
    }

    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(params.n_ctx))
        .with_n_batch(params.n_batch)
        .with_n_ubatch(params.n_ubatch)
        .with_n_seq_max(params.n_parallel)
        .with_embeddings(embedding);

    // The context borrows the model; the Arc keeps the allocation pinned for
    // the backend's lifetime, so widening the borrow is sound here.
    let context = unsafe {
        let ctx = model
            .new_context(&backend, ctx_params)
            .map_err(|e| model_load_err(e.to_string()))?;
        std::mem::transmute::<LlamaContext<'_>, LlamaContext<'static>>(ctx)
    };

    let mut runtime = LlamaModelBackend {
        context,
        n_ctx: params.n_ctx as usize,
        n_batch: params.n_batch as usize,
        n_seq: params.n_parallel as usize,
        model: Arc::clone(&model),
        _backend: backend,
    };
    info!(
        path = %path.display(),
        n_ctx = runtime.n_ctx,
        n_parallel = runtime.n_seq,
        "model loaded"
    );

    if params.warmup {
        runtime.warmup();
    }

    let tokenizer: Arc<dyn Tokenizer> = Arc::new(LlamaTokenizer { model });
    Ok((Box::new(runtime), tokenizer))
}

pub struct LlamaModelBackend {
    context: LlamaContext<'static>,
    n_ctx: usize,
    n_batch: usize,
    n_seq: usize,
    model: Arc<LlamaModel>,
    _backend: LlamaBackend,
}

impl LlamaModelBackend {
    /// One throwaway decode so the first real request does not pay the lazy
    /// allocation cost.
    fn warmup(&mut self) {
        let mut warm = Batch::new(2);
        let _ = warm.add(self.model.token_bos().0, 0, 0, false);
        let _ = warm.add(self.model.token_eos().0, 1, 0, true);
        if let Err(e) = self.decode(&warm) {
            warn!(error = %e, "warmup decode failed");
        }
        self.clear_all();
    }
}

impl ModelBackend for LlamaModelBackend {
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn n_batch(&self) -> usize {
        self.n_batch
    }

    fn n_seq_max(&self) -> usize {
        self.n_seq
    }

    fn n_embd(&self) -> usize {
        self.model.n_embd() as usize
    }

    fn pools_embeddings(&self) -> bool {
        self.context.pooling_type() != llama_cpp_2::context::params::LlamaPoolingType::None
    }

    fn decode(&mut self, batch: &Batch) -> Result<(), BackendError> {
        let mut native = LlamaBatch::new(batch.len().max(1), 1);
        for entry in batch.entries() {
            native
                .add(
                    LlamaToken(entry.token),
                    entry.pos,
                    &[entry.slot],
                    entry.logits,
                )
                .map_err(|e| BackendError::Native {
                    message: e.to_string(),
                })?;
        }
        self.context
            .decode(&mut native)
            .map_err(|e| BackendError::Native {
                message: format!("decode failed: {e}"),
            })
    }

    fn logits(&self, index: usize) -> Result<Vec<f32>, BackendError> {
        Ok(self.context.get_logits_ith(index as i32).to_vec())
    }

    fn seq_remove(&mut self, slot: SlotId, p0: Pos, p1: Option<Pos>) {
        let removed = self.context.clear_kv_cache_seq(
            Some(slot as u32),
            Some(p0 as u32),
            p1.map(|p| p as u32),
        );
        if let Err(e) = removed {
            warn!(slot, error = %e, "kv cache removal failed");
        }
    }

    fn seq_shift(&mut self, slot: SlotId, p0: Pos, p1: Pos, delta: Pos) {
        if let Err(e) =
            self.context
                .kv_cache_seq_add(slot, Some(p0 as u32), Some(p1 as u32), delta)
        {
            warn!(slot, error = %e, "kv cache shift failed");
        }
    }

    fn clear_all(&mut self) {
        self.context.clear_kv_cache();
    }

    fn set_embedding_mode(&mut self, enabled: bool) {
        self.context.set_embeddings(enabled);
    }

    fn seq_embedding(&self, slot: SlotId) -> Result<Vec<f32>, BackendError> {
        self.context
            .embeddings_seq_ith(slot)
            .map(|e| e.to_vec())
            .map_err(|_| BackendError::Embeddings { slot })
    }

    fn token_embedding(&self, index: usize) -> Result<Vec<f32>, BackendError> {
        self.context
            .embeddings_ith(index as i32)
            .map(|e| e.to_vec())
            .map_err(|_| BackendError::Logits { index })
    }

    fn save_sequence(
        &mut self,
        path: &Path,
        _slot: SlotId,
        tokens: &[Token],
    ) -> Result<(), BackendError> {
        let tokens: Vec<LlamaToken> = tokens.iter().map(|&t| LlamaToken(t)).collect();
        self.context
            .save_session_file(path, &tokens)
            .map_err(|e| BackendError::Native {
                message: format!("session save failed: {e}"),
            })
    }

    fn load_sequence(
        &mut self,
        path: &Path,
        _slot: SlotId,
        max_tokens: usize,
    ) -> Result<Vec<Token>, BackendError> {
        self.context
            .load_session_file(path, max_tokens)
            .map(|tokens| tokens.into_iter().map(|t| t.0).collect())
            .map_err(|_| BackendError::StateCorrupt)
    }
}

pub struct LlamaTokenizer {
    model: Arc<LlamaModel>,
}

impl Tokenizer for LlamaTokenizer {
    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<Token>, EngineError> {
        let add_bos = if add_special && self.should_add_bos() {
            AddBos::Always
        } else {
            AddBos::Never
        };
        self.model
            .str_to_token(text, add_bos)
            .map(|tokens| tokens.into_iter().map(|t| t.0).collect())
            .map_err(|e| EngineError::Tokenize {
                message: e.to_string(),
            })
    }

    #[allow(deprecated)]
    fn decode_one(&self, token: Token) -> String {
        self.model
            .token_to_str(LlamaToken(token), Special::Tokenize)
            .unwrap_or_default()
    }

    fn should_add_bos(&self) -> bool {
        self.model.add_bos_token()
    }

    fn bos_token(&self) -> Token {
        self.model.token_bos().0
    }

    fn eog_token(&self) -> Token {
        self.model.token_eos().0
    }

    fn is_eog(&self, token: Token) -> bool {
        self.model.is_eog_token(LlamaToken(token))
    }

    fn chat_template(&self) -> Option<String> {
        self.model.meta_val_str("tokenizer.chat_template").ok()
    }
}
