//! skein-core — a batched LLM inference runtime.
//!
//! The crate hosts one transformer model in memory and executes concurrent
//! generation requests against it: a fixed pool of KV-cache sequence slots is
//! shared between jobs, a single scheduler thread packs prompt-prefill tokens
//! and one-token generations from many sequences into one decode per tick,
//! and per-job samplers apply temperature/top-p/grammar constraints.
//!
//! The scheduler is written against the narrow [`ModelBackend`] trait so the
//! whole runtime can be exercised with an in-memory backend; the `llama`
//! feature provides the llama.cpp-backed implementation.

mod engine;

pub mod api;

pub use api::{
    ChatParams, CompletionParams, CompletionResult, EmbeddingParams, EmbeddingResult, Engine,
    EngineConfig, LoadingParams, ModelKind,
};
pub use engine::backend::{BackendError, ModelBackend, Pos, SlotId, Token};
pub use engine::batch::{Batch, BatchEntry};
pub use engine::errors::EngineError;
pub use engine::grammar::{Grammar, GrammarError};
pub use engine::job::{JobId, JobPhase, JobSnapshot};
pub use engine::tokenizer::{ChatMessage, Tokenizer};

#[cfg(feature = "llama")]
pub use engine::llama::{LlamaModelBackend, LlamaTokenizer};
