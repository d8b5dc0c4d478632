//! skein-runtime – command-line front-end for the inference engine.
//!
//! Startup order:
//! 1. Parse flags and environment configuration.
//! 2. Initialise structured tracing (JSON when `SKEIN_LOG_JSON=1`).
//! 3. Load the model and start the scheduler.
//! 4. Run the requested job, streaming output and cancelling on Ctrl-C.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use skein_core::{
    ChatMessage, ChatParams, CompletionParams, EmbeddingParams, Engine, LoadingParams,
};

#[derive(Parser)]
#[command(name = "skein-runtime", about = "Run one-shot jobs against a local GGUF model")]
struct Cli {
    #[command(flatten)]
    model: ModelArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ModelArgs {
    /// Path to the .gguf model file.
    #[arg(long, env = "SKEIN_MODEL")]
    model: PathBuf,

    /// Context window size in tokens.
    #[arg(long, default_value_t = 4096)]
    ctx: u32,

    /// Leading tokens pinned when the window shifts.
    #[arg(long, default_value_t = 256)]
    keep: u32,

    /// Decode batch size.
    #[arg(long, default_value_t = 512)]
    batch: u32,

    /// Parallel sequence slots.
    #[arg(long, default_value_t = 1)]
    parallel: u32,

    /// Layers to offload to the GPU.
    #[arg(long, default_value_t = 0)]
    gpu_layers: u32,

    /// Run a warmup decode after loading.
    #[arg(long)]
    warmup: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Text completion for a raw prompt.
    Complete {
        prompt: String,

        #[arg(short = 'n', long, default_value_t = 128)]
        max_tokens: i32,

        #[arg(long, default_value_t = 0.8)]
        temperature: f32,

        #[arg(long, default_value_t = 0.9)]
        top_p: f32,

        #[arg(long, default_value_t = 0)]
        seed: i64,

        /// GBNF grammar file constraining the output.
        #[arg(long)]
        grammar_file: Option<PathBuf>,

        /// JSON schema file constraining the output.
        #[arg(long)]
        schema_file: Option<PathBuf>,

        /// KV session file to continue and persist.
        #[arg(long)]
        session: Option<PathBuf>,

        /// Logical session id (required with --session).
        #[arg(long, default_value_t = -1)]
        session_id: i64,

        /// Fail instead of shifting the window on overflow.
        #[arg(long)]
        no_context_shift: bool,
    },

    /// Chat completion from system/user messages.
    Chat {
        /// System message prepended to the conversation.
        #[arg(long)]
        system: Option<String>,

        /// User message (repeatable; alternates with assistant turns).
        #[arg(long, required = true)]
        user: Vec<String>,

        #[arg(short = 'n', long, default_value_t = 256)]
        max_tokens: i32,

        #[arg(long, default_value_t = 0.8)]
        temperature: f32,

        #[arg(long, default_value_t = 0.9)]
        top_p: f32,

        #[arg(long, default_value_t = 0)]
        seed: i64,

        /// Force the generic ChatML template instead of the model-embedded one.
        #[arg(long)]
        no_jinja: bool,
    },

    /// Compute an embedding vector for a text.
    Embed {
        text: String,

        /// Skip L2 normalisation of the result.
        #[arg(long)]
        raw: bool,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("SKEIN_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if std::env::var("SKEIN_LOG_JSON").map(|v| v == "1").unwrap_or(false) {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let loading = LoadingParams {
        n_ctx: cli.model.ctx,
        n_keep: cli.model.keep,
        n_batch: cli.model.batch,
        n_parallel: cli.model.parallel,
        n_gpu_layers: cli.model.gpu_layers,
        warmup: cli.model.warmup,
        ..Default::default()
    };

    match cli.command {
        Command::Complete {
            prompt,
            max_tokens,
            temperature,
            top_p,
            seed,
            grammar_file,
            schema_file,
            session,
            session_id,
            no_context_shift,
        } => {
            let grammar = read_optional(grammar_file.as_deref()).context("reading grammar file")?;
            let json_schema = read_optional(schema_file.as_deref()).context("reading schema file")?;
            let engine = Engine::load_model(&cli.model.model, loading)?;
            let params = CompletionParams {
                prompt,
                max_new_tokens: max_tokens,
                temperature,
                top_p,
                seed,
                grammar,
                json_schema,
                session_path: session,
                session_id,
                allow_context_shift: !no_context_shift,
                ..Default::default()
            };
            let id = engine.submit_completion(params).await?;
            stream_to_stdout(&engine, id).await?;
        }

        Command::Chat {
            system,
            user,
            max_tokens,
            temperature,
            top_p,
            seed,
            no_jinja,
        } => {
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(ChatMessage::new("system", system));
            }
            messages.extend(user.into_iter().map(|m| ChatMessage::new("user", m)));

            let engine = Engine::load_model(&cli.model.model, loading)?;
            let params = ChatParams {
                messages,
                max_new_tokens: max_tokens,
                temperature,
                top_p,
                seed,
                use_jinja: !no_jinja,
                ..Default::default()
            };
            let id = engine.submit_chat(params).await?;
            stream_to_stdout(&engine, id).await?;
        }

        Command::Embed { text, raw } => {
            let engine = Engine::load_embedding_model(&cli.model.model, loading)?;
            let id = engine
                .submit_embedding(EmbeddingParams {
                    input: text,
                    normalize: !raw,
                    ..Default::default()
                })
                .await?;
            engine.wait(id).await?;
            if engine.has_error(id)? {
                anyhow::bail!("embedding failed: {}", engine.error_message(id)?);
            }
            let result = engine.embedding_result(id)?;
            info!(
                dimensions = result.embedding.len(),
                tokens = result.token_count,
                "embedding computed"
            );
            println!("{}", format_vector(&result.embedding));
        }
    }

    Ok(())
}

/// Print generated text as it appears; Ctrl-C cancels the job but keeps the
/// partial output.
async fn stream_to_stdout(engine: &Engine, id: skein_core::JobId) -> anyhow::Result<()> {
    use std::io::Write;

    let mut rx = engine.subscribe(id)?;
    let mut printed = 0usize;
    loop {
        let terminal = {
            let snap = rx.borrow();
            let text = snap.text.as_str();
            if text.len() > printed {
                print!("{}", &text[printed..]);
                let _ = std::io::stdout().flush();
                printed = text.len();
            }
            snap.is_terminal()
        };
        if terminal {
            break;
        }
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupt received, cancelling job");
                engine.cancel(id)?;
            }
        }
    }
    println!();

    if engine.has_error(id)? {
        anyhow::bail!("job failed: {}", engine.error_message(id)?);
    }
    let result = engine.result(id)?;
    info!(
        prompt_tokens = result.prompt_token_count,
        generated = result.tokens.len(),
        ttft_ms = format!("{:.1}", result.ttft_ms),
        tps = format!("{:.1}", result.tps),
        "job finished"
    );
    Ok(())
}

fn read_optional(path: Option<&std::path::Path>) -> anyhow::Result<Option<String>> {
    path.map(|p| std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display())))
        .transpose()
}

fn format_vector(values: &[f32]) -> String {
    let joined: Vec<String> = values.iter().map(|v| format!("{v:.6}")).collect();
    format!("[{}]", joined.join(", "))
}
