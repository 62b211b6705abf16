use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use surge_common::config::SurgeConfig;
use surge_core::ramp::{RampConfig, RampController, RampEvent, RampPhase};
use opentelemetry_otlp::WithExportConfig;
use surge_transport::HttpTransport;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "surge", version, about = "Ollama load-testing proxy and bench")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP proxy in front of Ollama.
    Serve,
    /// Ramp concurrency levels against a running proxy.
    Ramp(RampArgs),
    /// One-shot host CPU/RAM stats.
    Stats,
    Version,
}

#[derive(Args, Debug)]
struct RampArgs {
    /// Highest concurrency level to reach.
    #[arg(short = 'c', long, default_value_t = 5)]
    max_concurrency: u32,
    #[arg(short, long, default_value = "Hello, how are you?")]
    message: String,
    /// Model name; defaults to the configured one.
    #[arg(long)]
    model: Option<String>,
    /// Base URL of the surge proxy.
    #[arg(long, default_value = "http://localhost:8000")]
    url: String,
    /// Per-run budget in seconds; defaults to the configured one.
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Write the collected per-level results here as JSON.
    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve => serve().await,
        Commands::Ramp(args) => ramp(args).await,
        Commands::Stats => stats(),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn serve() -> anyhow::Result<()> {
    let config = SurgeConfig::load();
    let addr = config.listen_addr.clone();
    let app = surge_api::app(config)?;
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on http://{addr}");
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

async fn ramp(args: RampArgs) -> anyhow::Result<()> {
    let config = SurgeConfig::load();
    let model = args.model.unwrap_or(config.default_model);
    let timeout = Duration::from_secs(args.timeout_secs.unwrap_or(config.run_timeout_secs));
    let ramp_cfg =
        RampConfig::new(args.max_concurrency, args.message, model).with_timeout(timeout);

    let transport = HttpTransport::proxy(&args.url)?;
    let mut controller = RampController::new(transport);

    let (tx, mut rx) = tokio::sync::mpsc::channel::<RampEvent>(16);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                RampEvent::Progress { level, total, result } => {
                    println!(
                        "[{level}/{total}] {:.2} tok/s, {:.3}s latency, {} tokens",
                        result.tokens_per_second, result.latency_seconds, result.total_tokens
                    );
                }
                RampEvent::Failure { level, total, error } => {
                    eprintln!("[{level}/{total}] failed: {error}");
                }
                RampEvent::Cancelled { level, total } => {
                    eprintln!("[{level}/{total}] cancelled");
                }
            }
        }
    });

    // Ctrl-C stops the ramp between levels; the level in flight finishes.
    let cancel = controller.cancel_flag();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("cancel requested");
        cancel.store(true, std::sync::atomic::Ordering::Relaxed);
    });

    let phase = controller.start(&ramp_cfg, &tx).await;
    drop(tx);
    let _ = printer.await;

    let results = controller.into_results();
    println!(
        "ramp {:?}: {} of {} levels completed",
        phase,
        results.len(),
        args.max_concurrency
    );
    if let Some(path) = args.out {
        std::fs::write(&path, serde_json::to_string_pretty(&results)?)?;
        println!("results written to {}", path.display());
    }
    if phase == RampPhase::Failed {
        anyhow::bail!("ramp halted early");
    }
    Ok(())
}

fn stats() -> anyhow::Result<()> {
    let mut sys = sysinfo::System::new_all();
    sys.refresh_all();
    let total_mem = sys.total_memory();
    let used_mem = sys.used_memory();
    let cpus = sys.cpus();
    let cpu_avg: f32 =
        cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len().max(1) as f32;
    println!("CPU: {cpu_avg:.1}%");
    println!("Memory: {} / {} MiB", used_mem / 1024 / 1024, total_mem / 1024 / 1024);
    println!("GPU: see /metrics on the proxy for GPU gauges");
    Ok(())
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );

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

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
