//! The cooperative batched-decoding loop.
//!
//! One OS thread owns the model backend, the shared batch and the live-job
//! list. Per tick it walks the jobs in submission order, packs prompt-prefill
//! tokens and one-token generations into the batch, then issues at most one
//! decode. There is no thread per job; callers interact through the command
//! channel and per-job watch snapshots.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::types::CompletionParams;
use crate::engine::backend::{ModelBackend, Pos, SlotId, Token};
use crate::engine::batch::Batch;
use crate::engine::embedding::{self, EmbedJob};
use crate::engine::job::{JobPhase, JobShared};
use crate::engine::sampler::SamplerChain;
use crate::engine::session::{match_prefix, SessionFile};
use crate::engine::slots::SlotPool;
use crate::engine::tokenizer::Tokenizer;

/// Work items accepted by the scheduler. Closing the channel is the shutdown
/// signal: queued commands are drained first, then every live job is failed.
pub(crate) enum Command {
    Run(Box<RunJob>),
    Embed(EmbedJob),
}

/// A validated completion job carrying its sampler and slot, ready to join
/// the live list.
pub(crate) struct RunJob {
    pub shared: Arc<JobShared>,
    pub params: CompletionParams,
    pub sampler: SamplerChain,
    pub slot: SlotId,
    pub submitted_at: Instant,
}

pub(crate) struct SchedulerConfig {
    pub n_keep: usize,
    pub overflow_dir: PathBuf,
}

/// Handle owning the scheduler thread. Dropping it closes the command channel
/// and joins the thread.
pub(crate) struct GenerativeService {
    tx: Option<mpsc::Sender<Command>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl GenerativeService {
    pub fn start(
        backend: Box<dyn ModelBackend>,
        tokenizer: Arc<dyn Tokenizer>,
        pool: SlotPool,
        config: SchedulerConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Command>(128);
        let state = SchedulerState {
            n_ctx: backend.n_ctx(),
            batch: Batch::new(backend.n_batch().max(1)),
            backend,
            tokenizer,
            pool,
            live: Vec::new(),
            cmd_rx: rx,
            n_keep: config.n_keep,
            overflow_dir: config.overflow_dir,
        };
        let thread = std::thread::Builder::new()
            .name("skein-scheduler".into())
            .spawn(move || state.run())
            .expect("failed to spawn scheduler thread");
        Self {
            tx: Some(tx),
            thread: Some(thread),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<Command> {
        self.tx.clone().expect("service already shut down")
    }

    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GenerativeService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Per-job scheduler state ───────────────────────────────────────────────────

struct ActiveJob {
    shared: Arc<JobShared>,
    params: CompletionParams,
    slot: SlotId,
    sampler: Option<SamplerChain>,
    session: Option<SessionFile>,
    /// Prompt fully prefilled; one token sampled per tick.
    generating: bool,
    /// Session loaded and prompt tokenized.
    prepared: bool,
    terminal: bool,
    prompt_tokens: Vec<Token>,
    /// Token history reflected in this slot's KV cache.
    session_tokens: Vec<Token>,
    n_past: Pos,
    prompt_cursor: usize,
    /// Batch index whose logits this job samples from.
    batch_pos: usize,
    n_remain: i32,
    generated: usize,
    submitted_at: Instant,
    gen_started: Option<Instant>,
}

impl ActiveJob {
    fn new(job: RunJob) -> Self {
        let n_remain = job.params.max_new_tokens;
        Self {
            shared: job.shared,
            params: job.params,
            slot: job.slot,
            sampler: Some(job.sampler),
            session: None,
            generating: false,
            prepared: false,
            terminal: false,
            prompt_tokens: Vec::new(),
            session_tokens: Vec::new(),
            n_past: 0,
            prompt_cursor: 0,
            batch_pos: 0,
            n_remain,
            generated: 0,
            submitted_at: job.submitted_at,
            gen_started: None,
        }
    }

    fn tps(&self) -> f32 {
        match (self.gen_started, self.generated) {
            (Some(start), n) if n > 0 => {
                let secs = start.elapsed().as_secs_f32();
                if secs > 0.0 {
                    n as f32 / secs
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }
}

struct SchedulerState {
    backend: Box<dyn ModelBackend>,
    tokenizer: Arc<dyn Tokenizer>,
    pool: SlotPool,
    batch: Batch,
    live: Vec<ActiveJob>,
    cmd_rx: mpsc::Receiver<Command>,
    n_ctx: usize,
    n_keep: usize,
    overflow_dir: PathBuf,
}

impl SchedulerState {
    fn run(mut self) {
        info!(
            n_ctx = self.n_ctx,
            n_batch = self.batch.capacity(),
            slots = self.pool.capacity(),
            "scheduler started"
        );
        loop {
            // Drain all pending commands without blocking.
            loop {
                match self.cmd_rx.try_recv() {
                    Ok(cmd) => self.admit(cmd),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        self.fail_all("Service is shutting down");
                        return;
                    }
                }
            }

            if self.live.is_empty() {
                // Quiescent: block until new work arrives or the engine goes
                // away.
                match self.cmd_rx.blocking_recv() {
                    Some(cmd) => {
                        self.admit(cmd);
                        continue;
                    }
                    None => return,
                }
            }

            self.tick();
        }
    }

    fn admit(&mut self, cmd: Command) {
        match cmd {
            Command::Run(job) => {
                // Defensive wipe: the slot's KV must be empty before first use.
                self.backend.seq_remove(job.slot, 0, None);
                job.shared.publish(|s| s.phase = JobPhase::DecodingPrompt);
                debug!(job = job.shared.id, slot = job.slot, "job admitted");
                self.live.push(ActiveJob::new(*job));
            }
            Command::Embed(job) => {
                // The embedding path never enters the prompt/generation loop.
                let budget = (self.n_ctx.saturating_sub(4)).min(8192);
                embedding::process_batch(
                    self.backend.as_mut(),
                    self.tokenizer.as_ref(),
                    &self.pool,
                    vec![job],
                    budget,
                );
            }
        }
    }

    /// One pass over the live jobs followed by at most one decode.
    fn tick(&mut self) {
        let mut participants: Vec<usize> = Vec::new();

        for i in 0..self.live.len() {
            if self.live[i].terminal {
                continue;
            }

            // 1. Terminal checks: cancellation and exhausted budget.
            {
                let job = &self.live[i];
                if job.shared.is_cancelled() || (job.generating && job.n_remain <= 0) {
                    self.complete_job(i);
                    continue;
                }
            }

            // 2. Context capacity.
            if !self.ensure_capacity(i) {
                continue;
            }

            if !self.live[i].generating {
                // 3. Prompt phase.
                if !self.live[i].prepared {
                    if let Err(message) = self.prepare_prompt(i) {
                        self.fail_job(i, message);
                        continue;
                    }
                }
                if self.batch.room() == 0 {
                    break;
                }

                let job = &mut self.live[i];
                let take = (job.prompt_tokens.len() - job.prompt_cursor).min(self.batch.room());
                for _ in 0..take {
                    let token = job.prompt_tokens[job.prompt_cursor];
                    let is_last = job.prompt_cursor == job.prompt_tokens.len() - 1;
                    match self.batch.add(token, job.n_past, job.slot, is_last) {
                        Ok(index) => {
                            if is_last {
                                job.batch_pos = index;
                            }
                        }
                        Err(_) => break,
                    }
                    if let Some(sampler) = job.sampler.as_mut() {
                        sampler.accept(token, self.tokenizer.as_ref());
                    }
                    job.session_tokens.push(token);
                    job.prompt_cursor += 1;
                    job.n_past += 1;
                }
                participants.push(i);

                if job.prompt_cursor >= job.prompt_tokens.len() {
                    job.generating = true;
                    job.gen_started = Some(Instant::now());
                    job.shared.publish(|s| s.phase = JobPhase::Generating);
                    // The next decode needs one cell of headroom.
                    if !self.ensure_capacity(i) {
                        continue;
                    }
                } else {
                    // Batch filled before the prompt was exhausted.
                    break;
                }
            } else {
                // 4. Generation phase.
                if self.batch.room() == 0 {
                    continue;
                }
                self.generation_step(i, &mut participants);
            }
        }

        // 5. Decode once for everything packed this tick.
        if !self.batch.is_empty() {
            if let Err(e) = self.backend.decode(&self.batch) {
                warn!(error = %e, "batched decode failed");
                for &i in &participants {
                    if !self.live[i].terminal {
                        self.fail_job(i, "Could not decode next token".to_owned());
                    }
                }
            }
            self.batch.clear();
        }

        self.live.retain(|job| !job.terminal);
    }

    /// Sample one token for a generating job and pack it into the batch.
    fn generation_step(&mut self, i: usize, participants: &mut Vec<usize>) {
        let logits = {
            let job = &self.live[i];
            match self.backend.logits(job.batch_pos) {
                Ok(logits) => logits,
                Err(e) => {
                    self.fail_job(i, format!("Could not read logits: {e}"));
                    return;
                }
            }
        };

        let token = {
            let job = &mut self.live[i];
            let sampler = job.sampler.as_mut().expect("live job owns a sampler");
            let token = sampler.sample(&logits, self.tokenizer.as_ref());
            sampler.accept(token, self.tokenizer.as_ref());
            token
        };

        if self.tokenizer.is_eog(token) {
            self.complete_job(i);
            return;
        }

        let piece = self.tokenizer.decode_one(token);
        let job = &mut self.live[i];
        let index = match self.batch.add(token, job.n_past, job.slot, true) {
            Ok(index) => index,
            Err(e) => {
                // Room was checked by the caller.
                warn!(error = %e, "batch rejected generation token");
                return;
            }
        };
        job.batch_pos = index;
        job.n_past += 1;
        job.n_remain -= 1;
        job.generated += 1;
        if job.session.is_some() {
            job.session_tokens.push(token);
        }

        let ttft_ms = (job.generated == 1)
            .then(|| job.submitted_at.elapsed().as_secs_f32() * 1000.0);
        let tps = job.tps();
        job.shared.publish(move |s| {
            s.tokens.push(token);
            s.text.push_str(&piece);
            if let Some(ttft_ms) = ttft_ms {
                s.ttft_ms = ttft_ms;
            }
            s.tps = tps;
        });
        participants.push(i);
    }

    /// First touch of a job: restore its session, tokenize the prompt and
    /// trim the slot's KV to the reusable prefix.
    fn prepare_prompt(&mut self, i: usize) -> Result<(), String> {
        let n_ctx = self.n_ctx;
        let job = &mut self.live[i];

        if let Some(path) = &job.params.session_path {
            let session = SessionFile::new(path.clone());
            job.session_tokens = session.load(self.backend.as_mut(), job.slot, n_ctx);
            job.session = Some(session);
        }

        job.prompt_tokens = if job.session_tokens.is_empty() || !job.params.prompt.is_empty() {
            self.tokenizer
                .tokenize(&job.params.prompt, true)
                .map_err(|e| {
                    debug!(job = job.shared.id, error = %e, "tokenization failed");
                    "Failed to tokenize input".to_owned()
                })?
        } else {
            job.session_tokens.clone()
        };

        if job.prompt_tokens.is_empty() {
            if self.tokenizer.should_add_bos() {
                job.prompt_tokens.push(self.tokenizer.bos_token());
            } else {
                return Err("Failed to ensure input content".to_owned());
            }
        }

        let mut matched = match_prefix(&job.prompt_tokens, &job.session_tokens, self.n_keep);
        if matched == job.prompt_tokens.len() && matched > 0 {
            // The whole prompt is already in the cache: step back one token so
            // the decode produces logits to sample the continuation from.
            matched -= 1;
        }
        self.backend.seq_remove(job.slot, matched as Pos, None);
        job.session_tokens.truncate(matched);
        job.n_past = matched as Pos;
        job.prompt_cursor = matched;
        job.prepared = true;

        let prompt_token_count = job.prompt_tokens.len();
        debug!(
            job = job.shared.id,
            prompt_tokens = prompt_token_count,
            reused = matched,
            "prompt prepared"
        );
        job.shared
            .publish(move |s| s.prompt_token_count = prompt_token_count);
        Ok(())
    }

    /// Make room for at least one more token, shifting the window when the
    /// job allows it; fails the job (with an overflow dump) otherwise.
    fn ensure_capacity(&mut self, i: usize) -> bool {
        let n_ctx = self.n_ctx as Pos;
        if self.live[i].n_past + 1 <= n_ctx {
            return true;
        }
        if self.live[i].params.allow_context_shift {
            self.left_trim(i);
            if self.live[i].n_past + 1 <= n_ctx {
                return true;
            }
            let message = self.overflow_message(i, "Context overflow even after trimming");
            self.fail_job(i, message);
        } else {
            let message =
                self.overflow_message(i, "Context overflow: context shifting is disabled");
            self.fail_job(i, message);
        }
        false
    }

    /// Left-trim the window: keep the first `n_keep` tokens, drop the next
    /// `n_discard` and relabel the remainder's KV positions.
    fn left_trim(&mut self, i: usize) {
        let n_keep = self.n_keep as Pos;
        let job = &mut self.live[i];
        if job.n_past <= n_keep {
            return;
        }
        let n_left = job.n_past - n_keep;
        let n_discard = if job.params.n_discard > 0 {
            job.params.n_discard.min(n_left)
        } else {
            n_left / 2
        };
        if n_discard <= 0 {
            return;
        }

        debug!(
            job = job.shared.id,
            n_past = job.n_past,
            n_keep,
            n_discard,
            "context full, shifting"
        );
        self.backend
            .seq_remove(job.slot, n_keep, Some(n_keep + n_discard));
        self.backend
            .seq_shift(job.slot, n_keep + n_discard, job.n_past, -n_discard);
        job.n_past -= n_discard;

        let keep = n_keep as usize;
        let discard = n_discard as usize;
        if job.session_tokens.len() >= keep + discard {
            job.session_tokens.drain(keep..keep + discard);
        }
    }

    /// Write the offending prompt to the overflow dump directory and build
    /// the failure message carrying the dump path.
    fn overflow_message(&mut self, i: usize, base: &str) -> String {
        let job = &self.live[i];
        let unix_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let file = format!(
            "context_{}_{}_{}tokens.txt",
            job.shared.id,
            unix_time,
            job.prompt_tokens.len()
        );
        let path = self.overflow_dir.join(file);
        let written = std::fs::create_dir_all(&self.overflow_dir)
            .and_then(|_| std::fs::write(&path, &job.params.prompt));
        match written {
            Ok(()) => format!("{base}. Prompt saved to {}", path.display()),
            Err(e) => {
                warn!(error = %e, "failed to write overflow dump");
                format!("{base}.")
            }
        }
    }

    /// Successful exit: persist the session, free the sampler, publish the
    /// terminal snapshot, then wipe and release the slot.
    fn complete_job(&mut self, i: usize) {
        {
            let job = &mut self.live[i];
            if let Some(session) = job.session.take() {
                session.save(self.backend.as_mut(), job.slot, &job.session_tokens);
            }
            job.sampler = None;
            job.terminal = true;
            let tps = job.tps();
            debug!(job = job.shared.id, generated = job.generated, "job finished");
            job.shared.publish(move |s| {
                s.phase = JobPhase::Finished;
                if tps > 0.0 {
                    s.tps = tps;
                }
            });
        }
        let slot = self.live[i].slot;
        self.backend.seq_remove(slot, 0, None);
        self.pool.release(slot);
    }

    /// Failure exit: free the sampler, publish the error, then wipe and
    /// release the slot. Sessions are not saved on failure.
    fn fail_job(&mut self, i: usize, message: String) {
        {
            let job = &mut self.live[i];
            job.sampler = None;
            job.terminal = true;
            debug!(job = job.shared.id, message = %message, "job failed");
            job.shared.fail(message);
        }
        let slot = self.live[i].slot;
        self.backend.seq_remove(slot, 0, None);
        self.pool.release(slot);
    }

    fn fail_all(&mut self, message: &str) {
        for i in 0..self.live.len() {
            if !self.live[i].terminal {
                self.fail_job(i, message.to_owned());
            }
        }
        self.live.clear();
    }
}
