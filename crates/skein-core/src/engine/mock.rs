//! In-memory backend and byte-level tokenizer for exercising the runtime
//! without native code.
//!
//! The mock keeps per-slot KV as `(position, token)` lists, replays
//! deterministic logits derived from how many logit-flagged entries a slot
//! has produced, and persists sequences to a small framed file so the
//! session-store paths (including corruption recovery) run for real.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::engine::backend::{BackendError, ModelBackend, Pos, SlotId, Token};
use crate::engine::batch::{Batch, BatchEntry};
use crate::engine::errors::EngineError;
use crate::engine::tokenizer::Tokenizer;

pub const VOCAB: usize = 258;
pub const BOS: Token = 256;
pub const EOG: Token = 257;

const SESSION_MAGIC: &[u8; 4] = b"SKSN";

/// Shared observation point for tests: how much work the backend really did.
#[derive(Debug, Default)]
pub struct Counters {
    pub decode_calls: usize,
    pub decoded_tokens: usize,
    pub slots_used: std::collections::BTreeSet<SlotId>,
}

pub struct MockBackend {
    n_ctx: usize,
    n_batch: usize,
    n_seq: usize,
    n_embd: usize,
    pooled: bool,
    embedding_mode: bool,
    /// Per-slot KV contents as (position, token) pairs.
    kv: HashMap<SlotId, Vec<(Pos, Token)>>,
    /// The entries of the most recent decode, for logits/embedding lookups.
    last_batch: Vec<BatchEntry>,
    /// For each entry of the last decode that requested logits, which slot it
    /// belongs to and how many logit requests that slot had seen before it.
    last_flagged: Vec<Option<(SlotId, usize)>>,
    flagged_count: HashMap<SlotId, usize>,
    /// Canned continuation: the token favored at generation ordinal `i`.
    reply: Option<Vec<Token>>,
    /// Artificial decode latency, for cancellation/backpressure tests.
    decode_delay: Option<Duration>,
    /// Fail every decode after this many successful calls.
    fail_after: Option<usize>,
    counters: Arc<Mutex<Counters>>,
}

impl MockBackend {
    pub fn new(n_ctx: usize, n_batch: usize, n_seq: usize) -> Self {
        Self {
            n_ctx,
            n_batch,
            n_seq,
            n_embd: 8,
            pooled: false,
            embedding_mode: false,
            kv: HashMap::new(),
            last_batch: Vec::new(),
            last_flagged: Vec::new(),
            flagged_count: HashMap::new(),
            reply: None,
            decode_delay: None,
            fail_after: None,
            counters: Arc::new(Mutex::new(Counters::default())),
        }
    }

    /// Favor exactly this text during generation, then end generation.
    pub fn with_reply(mut self, text: &str) -> Self {
        self.reply = Some(text.bytes().map(|b| b as Token).collect());
        self
    }

    pub fn with_decode_delay(mut self, delay: Duration) -> Self {
        self.decode_delay = Some(delay);
        self
    }

    pub fn with_fail_after(mut self, calls: usize) -> Self {
        self.fail_after = Some(calls);
        self
    }

    pub fn with_pooled_embeddings(mut self) -> Self {
        self.pooled = true;
        self
    }

    pub fn counters(&self) -> Arc<Mutex<Counters>> {
        Arc::clone(&self.counters)
    }

    /// The token this slot's logits favor at generation ordinal `ordinal`.
    fn favorite(&self, slot: SlotId, ordinal: usize) -> Token {
        match &self.reply {
            Some(reply) => reply.get(ordinal).copied().unwrap_or(EOG),
            None => {
                // Deterministic printable ASCII, never end-of-generation.
                let mix = (slot as usize).wrapping_mul(31).wrapping_add(ordinal * 7);
                (b' ' as usize + mix % 95) as Token
            }
        }
    }
}

impl ModelBackend for MockBackend {
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
        self.n_embd
    }

    fn pools_embeddings(&self) -> bool {
        self.pooled
    }

    fn decode(&mut self, batch: &Batch) -> Result<(), BackendError> {
        if batch.len() > self.n_batch {
            return Err(BackendError::BatchCapacity {
                capacity: self.n_batch,
            });
        }
        if let Some(delay) = self.decode_delay {
            std::thread::sleep(delay);
        }
        {
            let mut counters = self.counters.lock().unwrap();
            if let Some(limit) = self.fail_after {
                if counters.decode_calls >= limit {
                    return Err(BackendError::Decode { status: 1 });
                }
            }
            counters.decode_calls += 1;
            counters.decoded_tokens += batch.len();
            for entry in batch.entries() {
                counters.slots_used.insert(entry.slot);
            }
        }

        self.last_batch = batch.entries().to_vec();
        self.last_flagged = batch
            .entries()
            .iter()
            .map(|entry| {
                entry.logits.then(|| {
                    let seen = self.flagged_count.entry(entry.slot).or_insert(0);
                    let ordinal = *seen;
                    *seen += 1;
                    (entry.slot, ordinal)
                })
            })
            .collect();
        for entry in batch.entries() {
            self.kv
                .entry(entry.slot)
                .or_default()
                .push((entry.pos, entry.token));
        }
        Ok(())
    }

    fn logits(&self, index: usize) -> Result<Vec<f32>, BackendError> {
        let flagged = self
            .last_flagged
            .get(index)
            .and_then(|f| *f)
            .ok_or(BackendError::Logits { index })?;
        let (slot, ordinal) = flagged;
        let favorite = self.favorite(slot, ordinal);
        let mut logits = vec![0.0f32; VOCAB];
        for (i, logit) in logits.iter_mut().enumerate() {
            *logit = ((i * 31 + ordinal * 17 + slot as usize) % 997) as f32 / 1000.0;
        }
        logits[favorite as usize] = 100.0;
        Ok(logits)
    }

    fn seq_remove(&mut self, slot: SlotId, p0: Pos, p1: Option<Pos>) {
        if p0 == 0 && p1.is_none() {
            // A full wipe is the start of a fresh use of this slot.
            self.flagged_count.remove(&slot);
        }
        let entries = self.kv.entry(slot).or_default();
        entries.retain(|&(pos, _)| pos < p0 || p1.map(|p1| pos >= p1).unwrap_or(false));
    }

    fn seq_shift(&mut self, slot: SlotId, p0: Pos, p1: Pos, delta: Pos) {
        if let Some(entries) = self.kv.get_mut(&slot) {
            for (pos, _) in entries.iter_mut() {
                if *pos >= p0 && *pos < p1 {
                    *pos += delta;
                }
            }
        }
    }

    fn clear_all(&mut self) {
        self.kv.clear();
        self.flagged_count.clear();
    }

    fn set_embedding_mode(&mut self, enabled: bool) {
        self.embedding_mode = enabled;
    }

    fn seq_embedding(&self, slot: SlotId) -> Result<Vec<f32>, BackendError> {
        if !self.embedding_mode {
            return Err(BackendError::Embeddings { slot });
        }
        let tokens: Vec<Token> = self
            .kv
            .get(&slot)
            .map(|kv| kv.iter().map(|&(_, t)| t).collect())
            .unwrap_or_default();
        if tokens.is_empty() {
            return Err(BackendError::Embeddings { slot });
        }
        Ok(embedding_of(&tokens, self.n_embd))
    }

    fn token_embedding(&self, index: usize) -> Result<Vec<f32>, BackendError> {
        if !self.embedding_mode {
            return Err(BackendError::Logits { index });
        }
        let entry = self
            .last_batch
            .get(index)
            .ok_or(BackendError::Logits { index })?;
        Ok(embedding_of(&[entry.token, entry.pos], self.n_embd))
    }

    fn save_sequence(
        &mut self,
        path: &Path,
        _slot: SlotId,
        tokens: &[Token],
    ) -> Result<(), BackendError> {
        let mut bytes = Vec::with_capacity(8 + tokens.len() * 4);
        bytes.extend_from_slice(SESSION_MAGIC);
        bytes.extend_from_slice(&(tokens.len() as u32).to_le_bytes());
        for &t in tokens {
            bytes.extend_from_slice(&t.to_le_bytes());
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes).map_err(|source| BackendError::StateWrite { source })?;
        std::fs::rename(&tmp, path).map_err(|source| BackendError::StateWrite { source })
    }

    fn load_sequence(
        &mut self,
        path: &Path,
        slot: SlotId,
        max_tokens: usize,
    ) -> Result<Vec<Token>, BackendError> {
        let bytes = std::fs::read(path).map_err(|source| BackendError::StateRead { source })?;
        if bytes.len() < 8 || &bytes[..4] != SESSION_MAGIC {
            return Err(BackendError::StateCorrupt);
        }
        let count = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        if bytes.len() != 8 + count * 4 {
            return Err(BackendError::StateCorrupt);
        }
        let tokens: Vec<Token> = bytes[8..]
            .chunks_exact(4)
            .take(max_tokens)
            .map(|c| Token::from_le_bytes(c.try_into().unwrap()))
            .collect();
        // Restoring the file also restores the slot's KV contents.
        self.kv.insert(
            slot,
            tokens
                .iter()
                .enumerate()
                .map(|(i, &t)| (i as Pos, t))
                .collect(),
        );
        Ok(tokens)
    }
}

fn embedding_of(tokens: &[Token], n_embd: usize) -> Vec<f32> {
    let mut seed = 0x9e37u64;
    for &t in tokens {
        seed = seed.wrapping_mul(31).wrapping_add(t as u64);
    }
    (0..n_embd)
        .map(|i| ((seed.wrapping_add(i as u64 * 131) % 1000) as f32 / 500.0) - 1.0)
        .collect()
}

/// Byte-level tokenizer: one token per byte, BOS 256, EOG 257.
pub struct MockTokenizer {
    add_bos: bool,
    chat_template: Option<String>,
}

impl MockTokenizer {
    pub fn new() -> Self {
        Self {
            add_bos: true,
            chat_template: None,
        }
    }

    pub fn with_chat_template(mut self, template: &str) -> Self {
        self.chat_template = Some(template.to_owned());
        self
    }
}

impl Default for MockTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer for MockTokenizer {
    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<Token>, EngineError> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_special && self.add_bos {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(|b| b as Token));
        Ok(tokens)
    }

    fn decode_one(&self, token: Token) -> String {
        match u8::try_from(token) {
            Ok(byte) => (byte as char).to_string(),
            Err(_) => String::new(),
        }
    }

    fn should_add_bos(&self) -> bool {
        self.add_bos
    }

    fn bos_token(&self) -> Token {
        BOS
    }

    fn eog_token(&self) -> Token {
        EOG
    }

    fn chat_template(&self) -> Option<String> {
        self.chat_template.clone()
    }
}
