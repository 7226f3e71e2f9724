use axum::Router;
use clap::{Args, Parser, Subcommand};
use kv_api::app;
use kv_backend::{mock::MockBackend, InferenceBackend, SequenceState};
use kv_core::{Engine, ModelRunner, ProgressSink, SamplingParams, SeqId, Sequence};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "nanoserve", version, about = "Request scheduler and paged KV-cache block manager for LLM inference")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server.
    Serve,
    /// Generate one completion locally, without starting the server.
    Run(RunArgs),
    /// Print host CPU/memory stats.
    Stats,
    Version,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(short, long)]
    prompt: String,
    #[arg(short = 'n', long, default_value_t = 128)]
    max_tokens: usize,
    #[arg(short, long, default_value_t = 1.0)]
    temperature: f32,
}

struct MockRunner<'a> {
    backend: &'a MockBackend,
}

impl ModelRunner for MockRunner<'_> {
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

/// Prints prefill/decode throughput as it happens, mirroring the `tqdm`
/// progress bar `generate()` drives in the system this was derived from.
struct StdoutProgress;

impl ProgressSink for StdoutProgress {
    fn on_tick(&mut self, is_prefill: bool, num_tokens: usize, elapsed: std::time::Duration) {
        let secs = elapsed.as_secs_f64().max(1e-9);
        let phase = if is_prefill { "prefill" } else { "decode" };
        tracing::info!(phase, tokens_per_sec = num_tokens as f64 / secs, "tick");
    }

    fn on_finished(&mut self, seq_id: SeqId) {
        tracing::info!(seq_id, "sequence finished");
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve => serve().await,
        Commands::Run(args) => run_local(args),
        Commands::Stats => stats(),
        Commands::Version => println!("{}", env!("CARGO_PKG_VERSION")),
    }
}

async fn serve() {
    let app: Router = app();
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", 8080)).await.unwrap();
    tracing::info!("listening on http://0.0.0.0:8080");
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await.unwrap();
}

fn run_local(args: RunArgs) {
    let backend = MockBackend::new();
    let prompt_tokens = backend.tokenize(&args.prompt).unwrap_or_default();
    let config = kv_common::config::EngineConfig::default();
    let mut engine = Engine::new(
        config.max_num_seqs,
        config.max_num_batched_tokens,
        config.eos,
        config.num_blocks_or(64),
        config.kvcache_block_size,
    );
    let runner = MockRunner { backend: &backend };
    let params = SamplingParams { temperature: args.temperature, max_tokens: args.max_tokens, ignore_eos: false };
    let outputs = engine.generate(vec![prompt_tokens], vec![params], &runner, StdoutProgress);
    let text = outputs
        .into_iter()
        .next()
        .map(|o| backend.detokenize(&o.token_ids).unwrap_or_default())
        .unwrap_or_default();
    println!("{}", text);
}

fn stats() {
    use sysinfo::{CpuExt, System, SystemExt};
    let mut sys = System::new_all();
    sys.refresh_all();
    let total_mem = sys.total_memory();
    let used_mem = sys.used_memory();
    let cpu_avg: f32 = sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / (sys.cpus().len() as f32);
    println!("CPU: {:.1}%", cpu_avg);
    println!("Memory: {} / {} MiB", used_mem / 1024 / 1024, total_mem / 1024 / 1024);
    println!("GPU: see /metrics for NVML-based GPU stats if NVIDIA is present");
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()));

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
            .install_simple()
            .ok();
        if let Some(tracer) = tracer {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(OpenTelemetryLayer::new(tracer))
                .init();
            return;
        }
    }

    tracing_subscriber::registry().with(env_filter).with(tracing_subscriber::fmt::layer()).init();
}
