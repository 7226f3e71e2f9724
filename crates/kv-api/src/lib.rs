//! HTTP surface over the scheduler: JSON, SSE, and a WebSocket demo route,
//! plus health/metrics endpoints for the usual container orchestrator checks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use kv_backend::{mock::MockBackend, InferenceBackend, LoadParams, SequenceState};
use kv_common::config::EngineConfig;
use kv_core::{Engine, ModelRunner, NullProgress, SamplingParams, SeqId, Sequence};
use kv_obs::{init as obs_init, spawn_gpu_polling, spawn_system_polling};
use once_cell::sync::Lazy;
use prometheus::{Encoder, Histogram, IntCounter, TextEncoder};
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tokio_stream::wrappers::ReceiverStream;

#[derive(Clone)]
pub struct AppState {
    backend: Arc<dyn InferenceBackend>,
    config: Arc<EngineConfig>,
    engine: Arc<StdMutex<Engine>>,
    requests_total: IntCounter,
    tokens_generated_total: IntCounter,
    ttft_seconds: Histogram,
    queue_depth_gauge: prometheus::IntGauge,
    kv_used_blocks: prometheus::IntGauge,
    kv_capacity_blocks: prometheus::IntGauge,
    limiter: RateLimiter,
    budgets: TokenBudgets,
    model_path: Arc<RwLock<Option<String>>>,
}

static ENCODER: Lazy<TextEncoder> = Lazy::new(TextEncoder::new);

/// Bridges the scheduler's `ModelRunner` seam to a concrete `InferenceBackend`.
/// One token of forward-pass output per sequence, mock or real; the engine
/// never knows or cares which.
struct BackendRunner<'a> {
    backend: &'a dyn InferenceBackend,
}

impl ModelRunner for BackendRunner<'_> {
    fn run(&self, seqs: &[&Sequence], _is_prefill: bool) -> Vec<u32> {
        seqs.iter()
            .map(|seq| {
                let mut batch = [SequenceState { tokens: seq.token_ids.clone(), max_new_tokens: seq.max_tokens }];
                let out = self.backend.forward(&mut batch).unwrap_or_default();
                out.token.unwrap_or_else(|| {
                    let mut rng = rand::thread_rng();
                    kv_backend::mock::sample_next_byte_token(&mut rng)
                })
            })
            .collect()
    }
}

pub fn app() -> Router {
    let config = EngineConfig::load();
    config.validate().expect("invalid engine configuration");
    let backend: Arc<dyn InferenceBackend> = Arc::new(MockBackend::new());
    let workers = kv_backend::worker_handles(config.tensor_parallel_size);
    tracing::info!(ranks = workers.len(), "tensor-parallel worker handles sized");

    obs_init();
    spawn_gpu_polling();
    spawn_system_polling();

    let num_blocks = config.num_blocks_or(4096);
    let engine = Engine::new(
        config.max_num_seqs,
        config.max_num_batched_tokens,
        config.eos,
        num_blocks,
        config.kvcache_block_size,
    );

    let queue_depth_gauge =
        prometheus::register_int_gauge!("kv_waiting_sequences", "Sequences waiting to be scheduled").expect("gauge");
    let kv_used_blocks = prometheus::register_int_gauge!("kv_used_blocks", "KV cache blocks in use").expect("gauge");
    let kv_capacity_blocks =
        prometheus::register_int_gauge!("kv_capacity_blocks", "Total KV cache block pool size").expect("gauge");

    let state = AppState {
        backend,
        config: Arc::new(config),
        engine: Arc::new(StdMutex::new(engine)),
        requests_total: prometheus::register_int_counter!("kv_requests_total", "Total number of /generate requests")
            .expect("counter"),
        tokens_generated_total: prometheus::register_int_counter!(
            "kv_tokens_generated_total",
            "Total completion tokens produced"
        )
        .expect("counter"),
        ttft_seconds: prometheus::register_histogram!("kv_request_seconds", "End-to-end request latency").expect("histogram"),
        queue_depth_gauge,
        kv_used_blocks,
        kv_capacity_blocks,
        limiter: RateLimiter::new(),
        budgets: TokenBudgets::new(),
        model_path: Arc::new(RwLock::new(None)),
    };

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/generate", post(generate))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/sse/generate", get(generate_sse))
        .route("/ws/generate", get(ws_generate))
        .route("/admin/set_model", post(admin_set_model))
        .route("/openapi.json", get(openapi))
        .with_state(state)
}

async fn metrics() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    ENCODER.encode(&metric_families, &mut buffer).unwrap();
    ([("content-type", ENCODER.format_type().to_string())], buffer)
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let has_model = state.model_path.read().await.is_some();
    if has_model {
        ([("content-type", "text/plain")], "ready")
    } else {
        ([("content-type", "text/plain")], "ready-no-model")
    }
}

#[derive(serde::Deserialize)]
struct GenerateRequest {
    prompt: String,
    max_tokens: Option<usize>,
    temperature: Option<f32>,
    ignore_eos: Option<bool>,
}

#[derive(serde::Serialize)]
struct GenerateResponse {
    text: String,
    completion_tokens: usize,
}

fn tenant_id() -> String {
    "default".into()
}

/// Runs one prompt through the shared engine to completion, blocking the
/// calling task's thread for the duration. Other in-flight requests that
/// share this engine are interleaved via the scheduler's own batching, not
/// via async concurrency.
fn run_to_completion(state: &AppState, prompt_tokens: Vec<u32>, params: SamplingParams) -> Vec<u32> {
    let mut engine = state.engine.lock().unwrap();
    let runner = BackendRunner { backend: state.backend.as_ref() };
    let outputs = engine.generate(vec![prompt_tokens], vec![params], &runner, NullProgress);
    state.queue_depth_gauge.set(engine.scheduler().block_manager().num_used_blocks() as i64);
    state.kv_used_blocks.set(engine.scheduler().block_manager().num_used_blocks() as i64);
    state.kv_capacity_blocks.set(engine.scheduler().block_manager().num_blocks_total() as i64);
    outputs.into_iter().next().map(|o| o.token_ids).unwrap_or_default()
}

async fn generate(State(state): State<AppState>, Json(req): Json<GenerateRequest>) -> Json<GenerateResponse> {
    state.requests_total.inc();
    if !state.limiter.check_allow(&tenant_id()).await {
        return Json(GenerateResponse { text: "RATE_LIMITED".into(), completion_tokens: 0 });
    }
    if !state.budgets.allowed(&tenant_id(), req.max_tokens.unwrap_or(128) as u64).await {
        return Json(GenerateResponse { text: "TOKEN_BUDGET_EXCEEDED".into(), completion_tokens: 0 });
    }

    let start = std::time::Instant::now();
    let prompt_tokens = state.backend.tokenize(&req.prompt).unwrap_or_default();
    let params = SamplingParams {
        temperature: req.temperature.unwrap_or(1.0),
        max_tokens: req.max_tokens.unwrap_or(128),
        ignore_eos: req.ignore_eos.unwrap_or(false),
    };
    let completion_tokens = run_to_completion(&state, prompt_tokens, params);
    let text = state.backend.detokenize(&completion_tokens).unwrap_or_default();
    state.ttft_seconds.observe(start.elapsed().as_secs_f64());
    state.tokens_generated_total.inc_by(completion_tokens.len() as u64);
    state.budgets.record(&tenant_id(), completion_tokens.len() as u64).await;
    Json(GenerateResponse { text, completion_tokens: completion_tokens.len() })
}

/// Streams one event per decoded token by driving the shared engine one
/// tick at a time, rather than blocking for the whole completion like
/// `/generate`. Other requests admitted to the same engine share these
/// ticks, which is the point of continuous batching.
async fn generate_sse(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    state.requests_total.inc();
    let (tx, rx) = mpsc::channel(16);

    tokio::task::spawn_blocking(move || {
        let prompt_tokens = state.backend.tokenize(&req.prompt).unwrap_or_default();
        let params = SamplingParams {
            temperature: req.temperature.unwrap_or(1.0),
            max_tokens: req.max_tokens.unwrap_or(128),
            ignore_eos: req.ignore_eos.unwrap_or(false),
        };
        let seq_id: SeqId = {
            let mut engine = state.engine.lock().unwrap();
            engine.add_request(prompt_tokens, params)
        };

        let mut done = false;
        while !done {
            let mut engine = state.engine.lock().unwrap();
            let runner = BackendRunner { backend: state.backend.as_ref() };
            let (outputs, _) = engine.step(&runner);
            drop(engine);
            for out in outputs {
                if out.seq_id == seq_id {
                    let text = state.backend.detokenize(&out.token_ids).unwrap_or_default();
                    let _ = tx.blocking_send(Ok(Event::default().data(text)));
                    done = true;
                }
            }
        }
    });

    Sse::new(ReceiverStream::new(rx))
}

async fn ws_generate(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move {
        use axum::extract::ws::Message;
        let prompt_tokens = state.backend.tokenize("hello").unwrap_or_default();
        let completion = run_to_completion(&state, prompt_tokens, SamplingParams::default());
        for &tok in &completion {
            let text = state.backend.detokenize(&[tok]).unwrap_or_default();
            if socket.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        let _ = socket.close().await;
    })
}

async fn openapi() -> impl IntoResponse {
    let spec = serde_json::json!({
        "openapi": "3.0.0",
        "info": {"title": "Nanoserve Inference API", "version": "0.1.0"},
        "paths": {
            "/generate": {"post": {"summary": "Generate text"}},
            "/v1/chat/completions": {"post": {"summary": "OpenAI chat subset"}},
            "/sse/generate": {"get": {"summary": "Token-by-token SSE stream"}},
            "/ws/generate": {"get": {"summary": "WebSocket stream demo"}},
            "/metrics": {"get": {"summary": "Prometheus metrics"}},
            "/healthz": {"get": {"summary": "health"}},
            "/readyz": {"get": {"summary": "readiness"}},
            "/admin/set_model": {"post": {"summary": "Hot load model"}}
        }
    });
    Json(spec)
}

#[derive(serde::Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(serde::Deserialize)]
struct ChatRequest {
    #[allow(dead_code)]
    model: Option<String>,
    messages: Vec<ChatMessage>,
    max_tokens: Option<usize>,
}

#[derive(serde::Serialize)]
struct ChatChoiceMessage {
    role: String,
    content: String,
}

#[derive(serde::Serialize)]
struct ChatChoice {
    index: u32,
    message: ChatChoiceMessage,
    finish_reason: String,
}

#[derive(serde::Serialize)]
struct ChatResponse {
    id: String,
    object: String,
    choices: Vec<ChatChoice>,
}

async fn chat_completions(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Json<ChatResponse> {
    state.requests_total.inc();
    if !state.limiter.check_allow(&tenant_id()).await {
        return Json(ChatResponse {
            id: "rate-limited".into(),
            object: "chat.completion".into(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatChoiceMessage { role: "assistant".into(), content: "RATE_LIMITED".into() },
                finish_reason: "stop".into(),
            }],
        });
    }
    tracing::info!(target: "api", messages = req.messages.len(), "chat request");
    let mut prompt = String::new();
    for m in &req.messages {
        if m.role == "system" || m.role == "user" {
            prompt.push_str(&m.content);
            prompt.push('\n');
        }
    }
    let prompt_tokens = state.backend.tokenize(&prompt).unwrap_or_default();
    let params = SamplingParams { max_tokens: req.max_tokens.unwrap_or(128), ..Default::default() };
    let completion = run_to_completion(&state, prompt_tokens, params);
    let text = state.backend.detokenize(&completion).unwrap_or_default();
    Json(ChatResponse {
        id: "chatcmpl-1".into(),
        object: "chat.completion".into(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatChoiceMessage { role: "assistant".into(), content: text },
            finish_reason: "stop".into(),
        }],
    })
}

#[derive(serde::Deserialize)]
struct SetModel {
    path: String,
}

async fn admin_set_model(State(state): State<AppState>, Json(req): Json<SetModel>) -> impl IntoResponse {
    match state.backend.load_model(&req.path, LoadParams { n_ctx: state.config.max_model_len, n_gpu_layers: 0 }) {
        Ok(_) => {
            state.model_path.write().await.replace(req.path);
            ([("content-type", "text/plain")], "ok")
        }
        Err(_) => ([("content-type", "text/plain")], "load failed"),
    }
}

#[derive(Clone)]
struct RateLimiter {
    inner: Arc<AsyncMutex<HashMap<String, (u64, std::time::Instant)>>>,
}

impl RateLimiter {
    fn new() -> Self {
        Self { inner: Arc::new(AsyncMutex::new(HashMap::new())) }
    }

    async fn check_allow(&self, key: &str) -> bool {
        let mut g = self.inner.lock().await;
        let entry = g.entry(key.to_string()).or_insert((0, std::time::Instant::now()));
        if entry.1.elapsed() > std::time::Duration::from_secs(60) {
            *entry = (0, std::time::Instant::now());
        }
        let limit: u64 = std::env::var("KV_RATE_LIMIT_PER_MIN").ok().and_then(|v| v.parse().ok()).unwrap_or(600);
        if entry.0 >= limit {
            return false;
        }
        entry.0 += 1;
        true
    }
}

#[derive(Clone)]
struct TokenBudgets {
    inner: Arc<AsyncMutex<HashMap<String, u64>>>,
}

impl TokenBudgets {
    fn new() -> Self {
        Self { inner: Arc::new(AsyncMutex::new(HashMap::new())) }
    }

    async fn record(&self, key: &str, tokens: u64) {
        let mut g = self.inner.lock().await;
        let v = g.entry(key.to_string()).or_insert(0);
        *v += tokens;
    }

    async fn allowed(&self, key: &str, new_tokens: u64) -> bool {
        let budget: u64 = std::env::var("KV_TOKEN_BUDGET").ok().and_then(|v| v.parse().ok()).unwrap_or(u64::MAX);
        let g = self.inner.lock().await;
        let used = *g.get(key).unwrap_or(&0);
        used + new_tokens <= budget
    }
}
