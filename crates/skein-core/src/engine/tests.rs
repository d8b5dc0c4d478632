use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::api::{
    ChatParams, CompletionParams, EmbeddingParams, Engine, EngineConfig, ModelKind,
};
use crate::engine::embedding::{self, EmbedJob};
use crate::engine::errors::EngineError;
use crate::engine::job::{JobPhase, JobRegistry};
use crate::engine::mock::{MockBackend, MockTokenizer};
use crate::engine::slots::SlotPool;
use crate::engine::tokenizer::ChatMessage;

static DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "skein-test-{tag}-{}-{}",
        std::process::id(),
        DIR_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn engine(backend: MockBackend) -> Engine {
    engine_with_config(backend, ModelKind::Generative, EngineConfig::default())
}

fn engine_with_config(backend: MockBackend, kind: ModelKind, config: EngineConfig) -> Engine {
    Engine::with_backend(
        Box::new(backend),
        Arc::new(MockTokenizer::new()),
        kind,
        config,
    )
}

fn completion(prompt: &str) -> CompletionParams {
    CompletionParams {
        prompt: prompt.into(),
        temperature: 0.0,
        ..Default::default()
    }
}

// ── Completion basics ─────────────────────────────────────────────────────────

#[tokio::test]
async fn single_completion_produces_output_and_metrics() {
    let engine = engine(MockBackend::new(256, 64, 2).with_reply("Paris"));
    let id = engine
        .submit_completion(CompletionParams {
            max_new_tokens: 8,
            ..completion("The capital of France is")
        })
        .await
        .unwrap();

    let snap = engine.wait(id).await.unwrap();
    assert_eq!(snap.phase, JobPhase::Finished);
    assert!(!snap.has_error());
    assert_eq!(snap.text, "Paris");
    assert_eq!(snap.tokens.len(), 5);

    let result = engine.result(id).unwrap();
    assert!(result.prompt_token_count > 0);
    assert!(result.ttft_ms > 0.0);
    assert!(result.tps > 0.0);
    // The snapshot is repeatable.
    assert_eq!(engine.result(id).unwrap().text, "Paris");
}

#[tokio::test]
async fn max_new_tokens_zero_finishes_after_prompt_decode() {
    let engine = engine(MockBackend::new(64, 32, 1));
    let id = engine
        .submit_completion(CompletionParams {
            max_new_tokens: 0,
            ..completion("just prefill this")
        })
        .await
        .unwrap();
    let snap = engine.wait(id).await.unwrap();
    assert!(!snap.has_error());
    assert!(snap.tokens.is_empty());
    assert!(snap.text.is_empty());
    assert!(snap.prompt_token_count > 0);
}

#[tokio::test]
async fn validation_failures_are_synchronous() {
    let engine = engine(MockBackend::new(64, 32, 1));

    let empty = engine.submit_completion(completion("")).await;
    assert!(matches!(empty, Err(EngineError::InvalidParameters { .. })));

    let both = engine
        .submit_completion(CompletionParams {
            grammar: Some("root ::= [0-9]".into()),
            json_schema: Some("{}".into()),
            ..completion("p")
        })
        .await;
    assert!(matches!(both, Err(EngineError::InvalidParameters { .. })));

    let bad_schema = engine
        .submit_completion(CompletionParams {
            json_schema: Some("{nope".into()),
            ..completion("p")
        })
        .await;
    assert!(matches!(
        bad_schema,
        Err(EngineError::InvalidParameters { .. })
    ));

    let bad_grammar = engine
        .submit_completion(CompletionParams {
            grammar: Some("root ::= undefined-rule".into()),
            ..completion("p")
        })
        .await;
    assert!(matches!(bad_grammar, Err(EngineError::InvalidGrammar { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parallel_completions_use_distinct_slots() {
    // A little decode latency keeps all four jobs in flight at once.
    let backend = MockBackend::new(256, 64, 4)
        .with_reply("out")
        .with_decode_delay(Duration::from_millis(5));
    let counters = backend.counters();
    let engine = Arc::new(engine(backend));

    let mut ids = Vec::new();
    for i in 0..4 {
        let id = engine
            .submit_completion(CompletionParams {
                max_new_tokens: 8,
                ..completion(&format!("prompt number {i}"))
            })
            .await
            .unwrap();
        ids.push(id);
    }
    for &id in &ids {
        let snap = engine.wait(id).await.unwrap();
        assert!(!snap.has_error());
        assert_eq!(snap.text, "out");
    }

    let used = counters.lock().unwrap().slots_used.clone();
    assert_eq!(used.into_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slot_pool_backpressure_reuses_the_slot() {
    let backend = MockBackend::new(256, 32, 1).with_reply("ab");
    let counters = backend.counters();
    let engine = Arc::new(engine(backend));

    let first = engine.submit_completion(completion("one")).await.unwrap();
    // The second submission queues on the single slot until the first job
    // releases it.
    let second = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let id = engine.submit_completion(completion("two")).await.unwrap();
            engine.wait(id).await.unwrap()
        })
    };
    let snap = engine.wait(first).await.unwrap();
    assert!(!snap.has_error());
    let snap2 = second.await.unwrap();
    assert!(!snap2.has_error());

    let used = counters.lock().unwrap().slots_used.clone();
    assert_eq!(used.into_iter().collect::<Vec<_>>(), vec![0]);
}

// ── Cancellation, failures, shutdown ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_keeps_partial_output_without_error() {
    let engine = engine(
        MockBackend::new(4096, 32, 1).with_decode_delay(Duration::from_millis(3)),
    );
    let id = engine
        .submit_completion(CompletionParams {
            max_new_tokens: 200,
            ..completion("count to a thousand")
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(40)).await;
    engine.cancel(id).unwrap();
    // Cancelling again is fine.
    engine.cancel(id).unwrap();

    let snap = engine.wait(id).await.unwrap();
    assert_eq!(snap.phase, JobPhase::Finished);
    assert!(!snap.has_error());
    assert!(snap.tokens.len() < 200, "cancel must cut generation short");
}

#[tokio::test]
async fn decode_failure_fails_the_participating_job() {
    let engine = engine(MockBackend::new(64, 32, 1).with_fail_after(0));
    let id = engine.submit_completion(completion("doomed")).await.unwrap();
    let snap = engine.wait(id).await.unwrap();
    assert_eq!(snap.phase, JobPhase::Failed);
    assert_eq!(snap.error.as_deref(), Some("Could not decode next token"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_fails_live_jobs() {
    let mut engine = engine(
        MockBackend::new(4096, 32, 1).with_decode_delay(Duration::from_millis(3)),
    );
    let id = engine
        .submit_completion(CompletionParams {
            max_new_tokens: 500,
            ..completion("long running")
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let rx = engine.subscribe(id).unwrap();
    engine.shutdown();

    let snap = rx.borrow().clone();
    assert_eq!(snap.phase, JobPhase::Failed);
    assert_eq!(snap.error.as_deref(), Some("Service is shutting down"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streamed_snapshots_grow_monotonically() {
    let engine = engine(
        MockBackend::new(4096, 32, 1).with_decode_delay(Duration::from_millis(2)),
    );
    let id = engine
        .submit_completion(CompletionParams {
            max_new_tokens: 12,
            ..completion("stream me")
        })
        .await
        .unwrap();

    let mut rx = engine.subscribe(id).unwrap();
    let mut last_len = 0usize;
    loop {
        let (len, terminal) = {
            let snap = rx.borrow();
            (snap.tokens.len(), snap.is_terminal())
        };
        assert!(len >= last_len, "outputs must only grow");
        last_len = len;
        if terminal {
            break;
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
    assert_eq!(last_len, 12);
}

// ── Constrained sampling ──────────────────────────────────────────────────────

#[tokio::test]
async fn grammar_forces_four_digits() {
    let engine = engine(MockBackend::new(256, 64, 1));
    let id = engine
        .submit_completion(CompletionParams {
            max_new_tokens: 8,
            grammar: Some("root ::= digit digit digit digit\ndigit ::= [0-9]".into()),
            ..completion("Output a 4 digit number:")
        })
        .await
        .unwrap();
    let snap = engine.wait(id).await.unwrap();
    assert!(!snap.has_error());
    assert_eq!(snap.text.len(), 4);
    assert!(snap.text.chars().all(|c| c.is_ascii_digit()), "{}", snap.text);
}

#[tokio::test]
async fn json_schema_constrains_output_to_parseable_json() {
    // The canned continuation follows the schema's (alphabetical) key order.
    let engine = engine(MockBackend::new(512, 128, 1).with_reply(r#"{"age": 36, "name": "ada"}"#));
    let schema = r#"{
        "type": "object",
        "properties": {"name": {"type": "string"}, "age": {"type": "integer"}},
        "required": ["name", "age"]
    }"#;
    let id = engine
        .submit_completion(CompletionParams {
            max_new_tokens: 64,
            json_schema: Some(schema.into()),
            ..completion("Produce a person record:")
        })
        .await
        .unwrap();
    let snap = engine.wait(id).await.unwrap();
    assert!(!snap.has_error(), "{:?}", snap.error);
    let value: serde_json::Value = serde_json::from_str(&snap.text).unwrap();
    assert!(value.get("name").is_some());
    assert!(value.get("age").is_some());
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn session_reuse_skips_prefilled_tokens() {
    let dir = temp_dir("session");
    let session_path = dir.join("turn.bin");
    let backend = MockBackend::new(512, 128, 1);
    let counters = backend.counters();
    let engine = engine(backend);

    let turn1_prompt = "Remember the keyword ZEBRA-ALPHA.";
    let id1 = engine
        .submit_completion(CompletionParams {
            max_new_tokens: 4,
            session_path: Some(session_path.clone()),
            session_id: 42,
            ..completion(turn1_prompt)
        })
        .await
        .unwrap();
    let snap1 = engine.wait(id1).await.unwrap();
    assert!(!snap1.has_error());
    assert!(session_path.exists(), "session must persist on completion");
    let decoded_turn1 = counters.lock().unwrap().decoded_tokens;

    let turn2_prompt = format!("{turn1_prompt}{} What keyword did I give you?", snap1.text);
    let id2 = engine
        .submit_completion(CompletionParams {
            max_new_tokens: 4,
            session_path: Some(session_path.clone()),
            session_id: 42,
            ..completion(&turn2_prompt)
        })
        .await
        .unwrap();
    let snap2 = engine.wait(id2).await.unwrap();
    assert!(!snap2.has_error());

    let decoded_turn2 = counters.lock().unwrap().decoded_tokens - decoded_turn1;
    let turn2_tokens = turn2_prompt.len() + 1; // byte tokens + BOS
    assert!(
        decoded_turn2 < turn2_tokens,
        "turn 2 must reuse the session prefix ({decoded_turn2} decoded, {turn2_tokens} prompt tokens)"
    );
}

#[tokio::test]
async fn corrupt_session_files_are_recovered_silently() {
    let dir = temp_dir("corrupt");
    let session_path = dir.join("bad.bin");
    std::fs::write(&session_path, b"not a session at all").unwrap();

    let engine = engine(MockBackend::new(256, 64, 1));
    let id = engine
        .submit_completion(CompletionParams {
            max_new_tokens: 2,
            session_path: Some(session_path.clone()),
            session_id: 7,
            ..completion("fresh start")
        })
        .await
        .unwrap();
    let snap = engine.wait(id).await.unwrap();
    assert!(!snap.has_error(), "corruption is never surfaced");
    // The corrupt file was replaced by a freshly saved session.
    let bytes = std::fs::read(&session_path).unwrap();
    assert_eq!(&bytes[..4], b"SKSN");
}

// ── Context window ────────────────────────────────────────────────────────────

#[tokio::test]
async fn overflow_without_shift_fails_with_dump_path() {
    let dir = temp_dir("overflow");
    let engine = engine_with_config(
        MockBackend::new(8, 4, 1),
        ModelKind::Generative,
        EngineConfig {
            n_keep: 2,
            overflow_dir: dir.clone(),
        },
    );
    let prompt = "this prompt is far too long for an eight token context";
    let id = engine
        .submit_completion(CompletionParams {
            max_new_tokens: 4,
            allow_context_shift: false,
            ..completion(prompt)
        })
        .await
        .unwrap();
    let snap = engine.wait(id).await.unwrap();
    assert_eq!(snap.phase, JobPhase::Failed);
    let message = snap.error.unwrap();
    assert!(message.contains("Context overflow"), "{message}");
    assert!(message.contains(dir.to_str().unwrap()), "{message}");

    let dump = std::fs::read_dir(&dir).unwrap().next().unwrap().unwrap();
    let contents = std::fs::read_to_string(dump.path()).unwrap();
    assert_eq!(contents, prompt);
    assert!(dump.file_name().to_str().unwrap().starts_with("context_"));
}

#[tokio::test]
async fn context_shift_carries_generation_past_the_window() {
    let engine = engine_with_config(
        MockBackend::new(16, 8, 1),
        ModelKind::Generative,
        EngineConfig {
            n_keep: 4,
            overflow_dir: temp_dir("shift"),
        },
    );
    let id = engine
        .submit_completion(CompletionParams {
            max_new_tokens: 30,
            ..completion("abcd")
        })
        .await
        .unwrap();
    let snap = engine.wait(id).await.unwrap();
    assert!(!snap.has_error(), "{:?}", snap.error);
    assert_eq!(snap.tokens.len(), 30, "shifting must keep generation going");
}

// ── Chat ──────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn chat_completion_formats_and_generates() {
    let engine = engine(MockBackend::new(512, 128, 1).with_reply("ok"));
    let id = engine
        .submit_chat(ChatParams {
            messages: vec![
                ChatMessage::new("system", "Answer with one word."),
                ChatMessage::new("user", "Say ok."),
            ],
            max_new_tokens: 8,
            temperature: 0.0,
            ..Default::default()
        })
        .await
        .unwrap();
    let snap = engine.wait(id).await.unwrap();
    assert!(!snap.has_error());
    assert_eq!(snap.text, "ok");
    // The formatted prompt covers both messages plus template markers.
    assert!(snap.prompt_token_count > "Say ok.".len());
}

#[tokio::test]
async fn empty_chat_is_rejected() {
    let engine = engine(MockBackend::new(64, 32, 1));
    let err = engine.submit_chat(ChatParams::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidParameters { .. }));
}

// ── Embeddings ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn embedding_on_generative_engine_is_normalized() {
    let engine = engine(MockBackend::new(256, 64, 2));
    let id = engine
        .submit_embedding(EmbeddingParams {
            input: "embed this text".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let snap = engine.wait(id).await.unwrap();
    assert!(!snap.has_error());

    let result = engine.embedding_result(id).unwrap();
    assert_eq!(result.embedding.len(), 8);
    assert!(result.token_count > 0);
    let norm: f32 = result.embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-4, "normalized vector, got norm {norm}");

    // Taking the result removes the job from the registry.
    assert!(matches!(
        engine.embedding_result(id),
        Err(EngineError::JobNotFound { .. })
    ));
}

#[tokio::test]
async fn embedding_engine_rejects_completions_at_submission() {
    let engine = engine_with_config(
        MockBackend::new(256, 64, 2).with_pooled_embeddings(),
        ModelKind::Embedding,
        EngineConfig::default(),
    );
    let err = engine.submit_completion(completion("nope")).await.unwrap_err();
    assert!(matches!(err, EngineError::Unsupported { .. }));
    let err = engine
        .submit_chat(ChatParams {
            messages: vec![ChatMessage::new("user", "hi")],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unsupported { .. }));

    let id = engine
        .submit_embedding(EmbeddingParams {
            input: "pooled please".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let snap = engine.wait(id).await.unwrap();
    assert!(!snap.has_error());
    assert_eq!(snap.embedding.as_ref().map(Vec::len), Some(8));
}

#[tokio::test]
async fn embedding_batch_packs_multiple_jobs_into_one_decode() {
    let mut backend = MockBackend::new(256, 64, 4).with_pooled_embeddings();
    let counters = backend.counters();
    let tokenizer = MockTokenizer::new();
    let registry = JobRegistry::new();
    let pool = SlotPool::new(4);

    let mut jobs = Vec::new();
    let mut rxs = Vec::new();
    for text in ["first input", "second input", "third input"] {
        let (_, shared, rx) = registry.create();
        let slot = pool.acquire().await.unwrap();
        jobs.push(EmbedJob {
            shared,
            params: EmbeddingParams {
                input: text.into(),
                ..Default::default()
            },
            slot,
        });
        rxs.push(rx);
    }

    embedding::process_batch(&mut backend, &tokenizer, &pool, jobs, 64);

    assert_eq!(counters.lock().unwrap().decode_calls, 1);
    let mut embeddings = Vec::new();
    for rx in &rxs {
        let snap = rx.borrow().clone();
        assert_eq!(snap.phase, JobPhase::Finished);
        embeddings.push(snap.embedding.unwrap());
    }
    // Distinct inputs on distinct slots produce distinct vectors.
    assert_ne!(embeddings[0], embeddings[1]);
    assert_ne!(embeddings[1], embeddings[2]);
    // All slots were wiped and returned to the pool.
    for _ in 0..4 {
        pool.acquire().await.unwrap();
    }
}

#[tokio::test]
async fn observing_unknown_jobs_errors() {
    let engine = engine(MockBackend::new(64, 32, 1));
    assert!(matches!(
        engine.is_finished(999),
        Err(EngineError::JobNotFound { job_id: 999 })
    ));
    assert!(matches!(engine.cancel(999), Err(EngineError::JobNotFound { .. })));
    assert!(matches!(engine.result(999), Err(EngineError::JobNotFound { .. })));
}
