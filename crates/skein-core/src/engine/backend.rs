//! Backend seam between the scheduler and a concrete model implementation.
//!
//! The scheduler owns a `Box<dyn ModelBackend>` exclusively; no other thread
//! ever touches the model context, the KV memory or the decode call. Keeping
//! the trait this small is what lets the whole runtime run against the
//! in-memory test backend.

use std::path::Path;

use thiserror::Error;

use crate::engine::batch::Batch;

/// A model vocabulary token id.
pub type Token = i32;

/// A KV-cache sequence slot id in `[0, n_seq_max)`.
pub type SlotId = i32;

/// A position within a sequence.
pub type Pos = i32;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("decode failed (status {status})")]
    Decode { status: i32 },

    #[error("no logits at batch index {index}")]
    Logits { index: usize },

    #[error("no embeddings for sequence {slot}")]
    Embeddings { slot: SlotId },

    #[error("failed to read sequence state file")]
    StateRead {
        #[source]
        source: std::io::Error,
    },

    #[error("sequence state file is corrupt")]
    StateCorrupt,

    #[error("failed to write sequence state file")]
    StateWrite {
        #[source]
        source: std::io::Error,
    },

    #[error("batch capacity {capacity} exceeded")]
    BatchCapacity { capacity: usize },

    #[error("{message}")]
    Native { message: String },
}

/// The model context as seen by the scheduler.
///
/// One decode call per tick; per-sequence KV surgery through `seq_remove` /
/// `seq_shift`; logits and embeddings read back by batch index from the most
/// recent decode.
pub trait ModelBackend: Send {
    /// Context window size in tokens.
    fn n_ctx(&self) -> usize;

    /// Maximum number of token entries in one decode batch.
    fn n_batch(&self) -> usize;

    /// Number of independent KV sequences the context supports.
    fn n_seq_max(&self) -> usize;

    /// Embedding dimension of the model.
    fn n_embd(&self) -> usize;

    /// `true` when the model pools token embeddings into a single
    /// sequence-level embedding.
    fn pools_embeddings(&self) -> bool;

    /// Run one forward pass over the batch.
    fn decode(&mut self, batch: &Batch) -> Result<(), BackendError>;

    /// Logits for the batch entry at `index` in the most recent decode.
    ///
    /// Only valid for entries that requested logits.
    fn logits(&self, index: usize) -> Result<Vec<f32>, BackendError>;

    /// Remove KV entries of `slot` over positions `[p0, p1)`; `None` means
    /// "to the end".
    fn seq_remove(&mut self, slot: SlotId, p0: Pos, p1: Option<Pos>);

    /// Shift KV positions of `slot` in `[p0, p1)` by `delta`.
    fn seq_shift(&mut self, slot: SlotId, p0: Pos, p1: Pos, delta: Pos);

    /// Wipe the KV memory of every sequence.
    fn clear_all(&mut self);

    /// Toggle embedding extraction mode for subsequent decodes.
    fn set_embedding_mode(&mut self, enabled: bool);

    /// Pooled sequence-level embedding for `slot` after a decode in embedding
    /// mode.
    fn seq_embedding(&self, slot: SlotId) -> Result<Vec<f32>, BackendError>;

    /// Token-level embedding for the batch entry at `index`.
    fn token_embedding(&self, index: usize) -> Result<Vec<f32>, BackendError>;

    /// Persist the KV state of `slot` together with its token history.
    fn save_sequence(
        &mut self,
        path: &Path,
        slot: SlotId,
        tokens: &[Token],
    ) -> Result<(), BackendError>;

    /// Restore the KV state of `slot` from `path`, returning the saved token
    /// history (at most `max_tokens` entries).
    fn load_sequence(
        &mut self,
        path: &Path,
        slot: SlotId,
        max_tokens: usize,
    ) -> Result<Vec<Token>, BackendError>;
}
