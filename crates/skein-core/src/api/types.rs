//! Request/result types for the runtime facade, with the synchronous
//! validation rules applied at submission.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::engine::backend::Token;
use crate::engine::errors::EngineError;
use crate::engine::job::JobSnapshot;
use crate::engine::tokenizer::ChatMessage;

/// What the loaded model is used for. The split is enforced at the submission
/// boundary: an embedding engine rejects completion and chat jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    Generative,
    Embedding,
}

/// Parameters of one text-completion job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionParams {
    pub prompt: String,
    pub max_new_tokens: i32,
    pub min_length: i32,
    pub temperature: f32,
    pub top_p: f32,
    pub seed: i64,
    /// Kept for API parity; snapshots stream regardless.
    pub streaming: bool,
    /// Path of the on-disk KV session to continue and persist.
    pub session_path: Option<PathBuf>,
    /// Logical session id; `-1` auto-assigns. Must be `>= 0` when
    /// `session_path` is set.
    pub session_id: i64,
    /// GBNF grammar constraining the output. Mutually exclusive with
    /// `json_schema`.
    pub grammar: Option<String>,
    /// JSON schema converted to a grammar before sampling starts.
    pub json_schema: Option<String>,
    /// Whether the context window may be shifted when the job outgrows it.
    pub allow_context_shift: bool,
    /// Tokens dropped from the middle on a context shift; `0` means half of
    /// the overflow.
    pub n_discard: i32,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            max_new_tokens: 128,
            min_length: 0,
            temperature: 0.8,
            top_p: 0.9,
            seed: 0,
            streaming: false,
            session_path: None,
            session_id: -1,
            grammar: None,
            json_schema: None,
            allow_context_shift: true,
            n_discard: 0,
        }
    }
}

impl CompletionParams {
    pub(crate) fn validate(&self) -> Result<(), EngineError> {
        if self.prompt.is_empty() {
            return invalid("prompt is empty");
        }
        validate_sampling(
            self.seed,
            self.max_new_tokens,
            self.min_length,
            self.temperature,
            self.top_p,
        )?;
        validate_session(self.session_path.as_deref(), self.session_id)?;
        validate_constraint(self.grammar.as_deref(), self.json_schema.as_deref())
    }
}

/// Parameters of one chat-completion job; reduced to a [`CompletionParams`]
/// by the chat formatter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatParams {
    pub messages: Vec<ChatMessage>,
    pub max_new_tokens: i32,
    pub min_length: i32,
    pub temperature: f32,
    pub top_p: f32,
    pub seed: i64,
    pub streaming: bool,
    pub session_path: Option<PathBuf>,
    pub session_id: i64,
    pub grammar: Option<String>,
    pub json_schema: Option<String>,
    pub allow_context_shift: bool,
    pub n_discard: i32,
    /// Render the model-embedded jinja template; ChatML otherwise.
    pub use_jinja: bool,
}

impl Default for ChatParams {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            max_new_tokens: 128,
            min_length: 0,
            temperature: 0.8,
            top_p: 0.9,
            seed: 0,
            streaming: false,
            session_path: None,
            session_id: -1,
            grammar: None,
            json_schema: None,
            allow_context_shift: true,
            n_discard: 0,
            use_jinja: true,
        }
    }
}

impl ChatParams {
    pub(crate) fn validate(&self) -> Result<(), EngineError> {
        if self.messages.is_empty() {
            return invalid("messages is empty");
        }
        validate_sampling(
            self.seed,
            self.max_new_tokens,
            self.min_length,
            self.temperature,
            self.top_p,
        )?;
        validate_session(self.session_path.as_deref(), self.session_id)?;
        validate_constraint(self.grammar.as_deref(), self.json_schema.as_deref())
    }

    /// Carry everything but the message list into completion parameters.
    pub(crate) fn into_completion(self, prompt: String) -> CompletionParams {
        CompletionParams {
            prompt,
            max_new_tokens: self.max_new_tokens,
            min_length: self.min_length,
            temperature: self.temperature,
            top_p: self.top_p,
            seed: self.seed,
            streaming: self.streaming,
            session_path: self.session_path,
            session_id: self.session_id,
            grammar: self.grammar,
            json_schema: self.json_schema,
            allow_context_shift: self.allow_context_shift,
            n_discard: self.n_discard,
        }
    }
}

/// Parameters of one embedding job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingParams {
    pub input: String,
    pub session_id: i64,
    /// L2-normalise the result vector.
    pub normalize: bool,
}

impl Default for EmbeddingParams {
    fn default() -> Self {
        Self {
            input: String::new(),
            session_id: -1,
            normalize: true,
        }
    }
}

/// Upper bound on embedding input length, in characters.
const MAX_EMBEDDING_INPUT_CHARS: usize = 100_000;

impl EmbeddingParams {
    pub(crate) fn validate(&self) -> Result<(), EngineError> {
        if self.input.is_empty() {
            return invalid("input is empty");
        }
        if self.input.len() > MAX_EMBEDDING_INPUT_CHARS {
            return invalid(format!(
                "input is too long: {} characters",
                self.input.len()
            ));
        }
        Ok(())
    }
}

/// Snapshot of a completion job's output; safe to call repeatedly while the
/// job streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResult {
    pub tokens: Vec<Token>,
    pub text: String,
    pub tps: f32,
    pub ttft_ms: f32,
    pub prompt_token_count: usize,
}

impl From<&JobSnapshot> for CompletionResult {
    fn from(snap: &JobSnapshot) -> Self {
        Self {
            tokens: snap.tokens.clone(),
            text: snap.text.clone(),
            tps: snap.tps,
            ttft_ms: snap.ttft_ms,
            prompt_token_count: snap.prompt_token_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub embedding: Vec<f32>,
    pub token_count: usize,
}

/// Model loading parameters (see the `llama` feature for the native loader).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadingParams {
    pub n_ctx: u32,
    /// Leading tokens pinned when the context window shifts.
    pub n_keep: u32,
    pub n_batch: u32,
    pub n_ubatch: u32,
    /// Parallel sequences: the slot-pool capacity.
    pub n_parallel: u32,
    pub n_gpu_layers: u32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub cont_batching: bool,
    pub warmup: bool,
    pub main_gpu: i32,
    /// Per-GPU split of the model; must sum to ~1 when given.
    pub tensor_split: Option<Vec<f32>>,
}

impl Default for LoadingParams {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_keep: 256,
            n_batch: 512,
            n_ubatch: 512,
            n_parallel: 1,
            n_gpu_layers: 0,
            use_mmap: true,
            use_mlock: false,
            cont_batching: true,
            warmup: false,
            main_gpu: 0,
            tensor_split: None,
        }
    }
}

impl LoadingParams {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.n_ctx == 0 {
            return invalid("n_ctx must be > 0");
        }
        if self.n_parallel == 0 {
            return invalid("n_parallel must be > 0");
        }
        if let Some(split) = &self.tensor_split {
            if !split.is_empty() {
                let sum: f32 = split.iter().sum();
                if (sum - 1.0).abs() > 1e-3 {
                    return invalid(format!("tensor_split must sum to 1.0 (got {sum})"));
                }
            }
        }
        Ok(())
    }
}

/// Runtime knobs that apply regardless of the backend in use.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Leading tokens pinned on a context shift.
    pub n_keep: usize,
    /// Where prompts of overflowed jobs are dumped.
    pub overflow_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            n_keep: 256,
            overflow_dir: PathBuf::from("overflow_contexts"),
        }
    }
}

impl From<&LoadingParams> for EngineConfig {
    fn from(params: &LoadingParams) -> Self {
        Self {
            n_keep: params.n_keep as usize,
            ..Self::default()
        }
    }
}

// ── shared validation rules ───────────────────────────────────────────────────

fn invalid(reason: impl Into<String>) -> Result<(), EngineError> {
    Err(EngineError::InvalidParameters {
        reason: reason.into(),
    })
}

fn validate_sampling(
    seed: i64,
    max_new_tokens: i32,
    min_length: i32,
    temperature: f32,
    top_p: f32,
) -> Result<(), EngineError> {
    if seed < 0 {
        return invalid(format!("seed is negative: {seed}"));
    }
    if !(0..=4096).contains(&max_new_tokens) {
        return invalid(format!("max_new_tokens is out of range: {max_new_tokens}"));
    }
    if !(0..=4096).contains(&min_length) {
        return invalid(format!("min_length is out of range: {min_length}"));
    }
    if temperature < 0.0 {
        return invalid(format!("temperature is negative: {temperature}"));
    }
    if !(0.0..=1.0).contains(&top_p) {
        return invalid(format!("top_p is out of range: {top_p}"));
    }
    Ok(())
}

fn validate_session(path: Option<&std::path::Path>, session_id: i64) -> Result<(), EngineError> {
    if path.is_some() && session_id < 0 {
        return invalid("session_id must be set when session_path is provided");
    }
    Ok(())
}

fn validate_constraint(grammar: Option<&str>, schema: Option<&str>) -> Result<(), EngineError> {
    if grammar.is_some_and(|g| !g.is_empty()) && schema.is_some_and(|s| !s.is_empty()) {
        return invalid("provide either grammar or json_schema, not both");
    }
    if let Some(schema) = schema {
        if !schema.is_empty() {
            serde_json::from_str::<serde_json::Value>(schema).map_err(|e| {
                EngineError::InvalidParameters {
                    reason: format!("invalid JSON schema: {e}"),
                }
            })?;
        }
    }
    Ok(())
}
