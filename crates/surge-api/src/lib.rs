//! HTTP proxy in front of Ollama: aggregate chat with resource metrics,
//! a simplified load-testing view, and a live SSE stream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use once_cell::sync::Lazy;
use prometheus::{Encoder, Histogram, IntCounterVec, TextEncoder};
use serde::Serialize;
use serde_json::{json, Value};
use surge_common::config::SurgeConfig;
use surge_common::metrics::{MetricsPayload, PeakGpuUsage, PeakRamUsage, ResourceDelta};
use surge_common::SurgeError;
use surge_core::frame::FrameDecoder;
use surge_obs::{
    bottleneck, efficiency, peak_gpu_usage, peak_ram_usage, resource_delta, usage_pattern,
    Bottleneck, Efficiency, ResourceMonitor, ResourceSnapshot, UsagePattern,
};
use surge_transport::{ByteStream, HttpTransport, StreamTransport};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt as _};

/// Upstream generation can legitimately take minutes under load.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Clone)]
pub struct AppState {
    config: Arc<SurgeConfig>,
    transport: Arc<HttpTransport>,
}

static ENCODER: Lazy<TextEncoder> = Lazy::new(TextEncoder::new);
static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    prometheus::register_int_counter_vec!(
        "surge_requests_total",
        "Requests served, by route",
        &["route"]
    )
    .expect("counter")
});
static CHAT_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    prometheus::register_histogram!("surge_chat_seconds", "End-to-end /chat latency")
        .expect("histogram")
});

pub fn app(config: SurgeConfig) -> surge_common::Result<Router> {
    surge_obs::init();
    surge_obs::spawn_gpu_polling();
    let _ = &*REQUESTS_TOTAL;
    let _ = &*CHAT_SECONDS;
    let transport = Arc::new(HttpTransport::ollama(&config.ollama_url)?);
    let state = AppState { config: Arc::new(config), transport };

    Ok(Router::new()
        .route("/", get(root))
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(metrics))
        .route("/chat", post(chat))
        .route("/chat/simple", post(chat_simple))
        .route("/chat/stream", post(chat_stream))
        .with_state(state))
}

async fn root() -> impl IntoResponse {
    Json(json!({"message": "surge Ollama proxy is running"}))
}

async fn metrics() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = ENCODER.encode(&metric_families, &mut buffer) {
        tracing::error!(target: "api", "metrics encode failed: {e}");
    }
    ([("content-type", ENCODER.format_type().to_string())], buffer)
}

#[derive(Debug, serde::Deserialize)]
pub struct ChatRequest {
    pub concurrency: u32,
    pub message: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunTiming {
    pub total_duration: u64,
    pub load_duration: u64,
    pub prompt_eval_count: u64,
    pub prompt_eval_duration: u64,
    pub eval_count: u64,
    pub eval_duration: u64,
    pub tokens_per_second: f64,
    pub prompt_tokens_per_second: f64,
    pub total_tokens: u64,
    pub total_time_seconds: f64,
    pub load_time_seconds: f64,
    pub prompt_eval_time_seconds: f64,
    pub eval_time_seconds: f64,
}

impl RunTiming {
    /// Reduce a terminal chunk's nanosecond counters to load-testing
    /// numbers. Rates divide the unrounded durations; only the reported
    /// fields are rounded.
    fn from_chunk(chunk: &OllamaChunk) -> Self {
        const NS: f64 = 1_000_000_000.0;
        let total_duration = chunk.total_duration.unwrap_or(0);
        let load_duration = chunk.load_duration.unwrap_or(0);
        let prompt_eval_count = chunk.prompt_eval_count.unwrap_or(0);
        let prompt_eval_duration = chunk.prompt_eval_duration.unwrap_or(0);
        let eval_count = chunk.eval_count.unwrap_or(0);
        let eval_duration = chunk.eval_duration.unwrap_or(0);

        let eval_secs = eval_duration as f64 / NS;
        let prompt_secs = prompt_eval_duration as f64 / NS;
        let tokens_per_second = if eval_secs > 0.0 && eval_count > 0 {
            round2(eval_count as f64 / eval_secs)
        } else {
            0.0
        };
        let prompt_tokens_per_second = if prompt_secs > 0.0 && prompt_eval_count > 0 {
            round2(prompt_eval_count as f64 / prompt_secs)
        } else {
            0.0
        };

        Self {
            total_duration,
            load_duration,
            prompt_eval_count,
            prompt_eval_duration,
            eval_count,
            eval_duration,
            tokens_per_second,
            prompt_tokens_per_second,
            total_tokens: prompt_eval_count + eval_count,
            total_time_seconds: round3(total_duration as f64 / NS),
            load_time_seconds: round3(load_duration as f64 / NS),
            prompt_eval_time_seconds: round3(prompt_secs),
            eval_time_seconds: round3(eval_secs),
        }
    }
}

/// Aggregate result of one proxied run, plus the full resource picture
/// collected around it.
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub model: String,
    pub created_at: String,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_reason: Option<String>,
    #[serde(flatten)]
    pub timing: RunTiming,
    pub usage_before: ResourceSnapshot,
    pub usage_after: ResourceSnapshot,
    pub usage_during: Vec<ResourceSnapshot>,
    pub resource_delta: ResourceDelta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_gpu_usage: Option<PeakGpuUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_ram_usage: Option<PeakRamUsage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimplifiedGpuData {
    pub memory_delta_mb: f64,
    pub utilization_delta_percent: f64,
    pub peak_memory_mb: f64,
    pub peak_utilization_percent: f64,
    pub memory_usage_pattern: UsagePattern,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimplifiedRamData {
    pub memory_delta_gb: f64,
    pub peak_usage_gb: f64,
    pub usage_pattern: UsagePattern,
}

/// Everything a load-test harness needs, nothing it does not.
#[derive(Debug, Clone, Serialize)]
pub struct SimplifiedResponse {
    pub response: String,
    pub model: String,
    pub tokens_per_second: f64,
    pub total_tokens: u64,
    pub total_time_seconds: f64,
    pub gpu_data: SimplifiedGpuData,
    pub ram_data: SimplifiedRamData,
    pub bottleneck_type: Bottleneck,
    pub resource_efficiency: Efficiency,
}

struct ChatOutcome {
    response: ChatResponse,
    samples: Vec<ResourceSnapshot>,
}

async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    REQUESTS_TOTAL.with_label_values(&["chat"]).inc();
    let timer = CHAT_SECONDS.start_timer();
    let outcome = run_chat(&state, &req, None).await?;
    timer.observe_duration();
    Ok(Json(outcome.response))
}

async fn chat_simple(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<SimplifiedResponse>, ApiError> {
    REQUESTS_TOTAL.with_label_values(&["chat_simple"]).inc();
    let outcome = run_chat(&state, &req, None).await?;
    Ok(Json(simplify(&outcome)))
}

async fn chat_stream(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    REQUESTS_TOTAL.with_label_values(&["chat_stream"]).inc();
    let (tx, rx) = mpsc::channel::<Event>(64);
    tokio::spawn(async move {
        stream_task(state, req, tx).await;
    });
    Sse::new(ReceiverStream::new(rx).map(Ok)).keep_alive(KeepAlive::default())
}

async fn stream_task(state: AppState, req: ChatRequest, tx: mpsc::Sender<Event>) {
    let _ = tx.send(status_event("Initializing request...")).await;
    let _ = tx.send(status_event("Monitoring resources...")).await;
    let _ = tx.send(status_event("Connecting to Ollama...")).await;
    let _ = tx.send(status_event("Processing your request...")).await;

    match run_chat(&state, &req, Some(&tx)).await {
        Ok(outcome) => {
            let _ = tx.send(status_event("Calculating metrics...")).await;
            match metrics_event(&outcome.response) {
                Ok(event) => {
                    let _ = tx.send(event).await;
                }
                Err(e) => {
                    let _ = tx.send(error_event(&e.to_string())).await;
                    return;
                }
            }
            let _ = tx.send(status_event("Complete!")).await;
            let _ = tx.send(Event::default().data("[DONE]")).await;
        }
        Err(e) => {
            let _ = tx.send(error_event(&ApiError::from(e).detail)).await;
        }
    }
}

/// Run one upstream request end to end: snapshot resources, stream the
/// response, reduce timing and resource data into a `ChatResponse`.
///
/// When `events` is given, content pieces and the post-connect status are
/// forwarded as SSE events while the stream runs.
async fn run_chat(
    state: &AppState,
    req: &ChatRequest,
    events: Option<&mpsc::Sender<Event>>,
) -> surge_common::Result<ChatOutcome> {
    let model = req.model.clone().unwrap_or_else(|| state.config.default_model.clone());
    tracing::info!(target: "api", concurrency = req.concurrency, %model, "chat request");

    let before = surge_obs::sample::snapshot().await;
    let monitor = ResourceMonitor::spawn(Duration::from_millis(state.config.sample_interval_ms));

    let run = async {
        let stream = state.transport.start_run(req.concurrency, &req.message, &model).await?;
        if let Some(tx) = events {
            let _ = tx.send(status_event("Receiving response...")).await;
        }
        pump_upstream(stream, events).await
    };
    let outcome = match tokio::time::timeout(UPSTREAM_TIMEOUT, run).await {
        Ok(result) => result,
        Err(_) => Err(SurgeError::Timeout(UPSTREAM_TIMEOUT)),
    };

    let samples = monitor.stop().await;
    let after = surge_obs::sample::snapshot().await;
    let (content, terminal) = outcome?;

    let timing = RunTiming::from_chunk(&terminal);
    let response = ChatResponse {
        response: if content.is_empty() { "No response from Ollama".into() } else { content },
        model: terminal.model.unwrap_or_else(|| "unknown".into()),
        created_at: terminal.created_at.unwrap_or_default(),
        done: true,
        done_reason: terminal.done_reason,
        timing,
        resource_delta: resource_delta(&before, &after),
        peak_gpu_usage: peak_gpu_usage(&samples),
        peak_ram_usage: peak_ram_usage(&samples),
        usage_before: before,
        usage_after: after,
        usage_during: samples.clone(),
    };
    Ok(ChatOutcome { response, samples })
}

#[derive(Debug, Default, serde::Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    total_duration: Option<u64>,
    #[serde(default)]
    load_duration: Option<u64>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    prompt_eval_duration: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    eval_duration: Option<u64>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

/// Drain the upstream byte stream until its done-marked chunk arrives;
/// returns the concatenated content and that terminal chunk.
async fn pump_upstream(
    mut stream: ByteStream,
    events: Option<&mpsc::Sender<Event>>,
) -> surge_common::Result<(String, OllamaChunk)> {
    let mut decoder = FrameDecoder::new();
    let mut content = String::new();
    while let Some(chunk) = stream.next().await {
        for value in decoder.push(&chunk?) {
            if let Some(terminal) = apply_record(value, &mut content, events).await {
                return Ok((content, terminal));
            }
        }
    }
    for value in decoder.finish() {
        if let Some(terminal) = apply_record(value, &mut content, events).await {
            return Ok((content, terminal));
        }
    }
    Err(SurgeError::IncompleteStream)
}

async fn apply_record(
    value: Value,
    content: &mut String,
    events: Option<&mpsc::Sender<Event>>,
) -> Option<OllamaChunk> {
    let record: OllamaChunk = match serde_json::from_value(value) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(target: "api", "skipping unexpected record: {e}");
            return None;
        }
    };
    if let Some(message) = &record.message {
        if !message.content.is_empty() {
            content.push_str(&message.content);
            if let Some(tx) = events {
                let _ = tx.send(content_event(&message.content)).await;
            }
        }
    }
    record.done.then_some(record)
}

fn simplify(outcome: &ChatOutcome) -> SimplifiedResponse {
    let r = &outcome.response;
    let gpu_delta = r.resource_delta.gpu.first().cloned().unwrap_or_default();
    let ram_delta_gb = r.resource_delta.ram.as_ref().map(|d| d.memory_delta_gb).unwrap_or(0.0);
    let total_vram_mb = outcome
        .samples
        .iter()
        .chain(std::iter::once(&r.usage_before))
        .find_map(|s| s.gpus.first())
        .map(|g| g.memory_total_mb)
        .filter(|&mb| mb > 0.0)
        .unwrap_or(6144.0);

    let memory_samples: Vec<f64> =
        outcome.samples.iter().filter_map(|s| s.gpus.first()).map(|g| g.memory_used_mb).collect();
    let ram_samples: Vec<f64> =
        outcome.samples.iter().filter_map(|s| s.ram.as_ref()).map(|ram| ram.used_gb).collect();

    SimplifiedResponse {
        response: r.response.clone(),
        model: r.model.clone(),
        tokens_per_second: r.timing.tokens_per_second,
        total_tokens: r.timing.total_tokens,
        total_time_seconds: r.timing.total_time_seconds,
        gpu_data: SimplifiedGpuData {
            memory_delta_mb: gpu_delta.memory_delta_mb,
            utilization_delta_percent: gpu_delta.utilization_delta_percent,
            peak_memory_mb: r.peak_gpu_usage.as_ref().map(|p| p.vram_mb).unwrap_or(0.0),
            peak_utilization_percent: r
                .peak_gpu_usage
                .as_ref()
                .map(|p| p.utilization_percent)
                .unwrap_or(0.0),
            // 500 MB jump counts as a VRAM spike.
            memory_usage_pattern: usage_pattern(&memory_samples, 500.0),
        },
        ram_data: SimplifiedRamData {
            memory_delta_gb: round2(ram_delta_gb),
            peak_usage_gb: round2(
                r.peak_ram_usage.as_ref().map(|p| p.mb / 1024.0).unwrap_or(0.0),
            ),
            // 0.5 GB jump counts as a RAM spike.
            usage_pattern: usage_pattern(&ram_samples, 0.5),
        },
        bottleneck_type: bottleneck(
            gpu_delta.memory_delta_mb,
            gpu_delta.utilization_delta_percent,
            ram_delta_gb,
            total_vram_mb,
        ),
        resource_efficiency: efficiency(
            r.timing.tokens_per_second,
            gpu_delta.utilization_delta_percent,
        ),
    }
}

fn metrics_event(response: &ChatResponse) -> serde_json::Result<Event> {
    let payload = MetricsPayload {
        model: Some(response.model.clone()),
        done: true,
        total_time_seconds: Some(response.timing.total_time_seconds),
        tokens_per_second: response.timing.tokens_per_second,
        prompt_tokens_per_second: response.timing.prompt_tokens_per_second,
        total_tokens: response.timing.total_tokens,
        load_time_seconds: response.timing.load_time_seconds,
        eval_time_seconds: response.timing.eval_time_seconds,
        resource_delta: Some(response.resource_delta.clone()),
        peak_gpu_usage: response.peak_gpu_usage.clone(),
        peak_ram_usage: response.peak_ram_usage.clone(),
    };
    let mut value = serde_json::to_value(&payload)?;
    value["type"] = Value::String("metrics".into());
    if !response.created_at.is_empty() {
        value["created_at"] = Value::String(response.created_at.clone());
    }
    Ok(Event::default().data(value.to_string()))
}

fn status_event(message: &str) -> Event {
    Event::default().data(json!({"type": "status", "message": message}).to_string())
}

fn content_event(content: &str) -> Event {
    Event::default().data(json!({"type": "content", "content": content}).to_string())
}

fn error_event(message: &str) -> Event {
    Event::default().data(json!({"type": "error", "message": message}).to_string())
}

/// Client-facing error with the FastAPI-style `{"detail": ...}` body.
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"detail": self.detail}))).into_response()
    }
}

impl From<SurgeError> for ApiError {
    fn from(e: SurgeError) -> Self {
        match e {
            SurgeError::Timeout(_) => Self {
                status: StatusCode::GATEWAY_TIMEOUT,
                detail: "Request to Ollama timed out".into(),
            },
            SurgeError::Transport(msg) if msg.starts_with("upstream returned") => Self {
                status: StatusCode::BAD_GATEWAY,
                detail: format!("Ollama API error: {msg}"),
            },
            SurgeError::Transport(msg) => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                detail: format!(
                    "Cannot connect to Ollama. Make sure Ollama is running ({msg})"
                ),
            },
            other => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                detail: other.to_string(),
            },
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use surge_common::metrics::{GpuDelta, RamDelta};
    use surge_core::record::{classify, Record};
    use surge_obs::sample::{GpuSample, RamSample};

    fn terminal_chunk() -> OllamaChunk {
        OllamaChunk {
            model: Some("qwen3:4b-q8_0".into()),
            done: true,
            total_duration: Some(3_000_000_000),
            load_duration: Some(250_000_000),
            prompt_eval_count: Some(25),
            prompt_eval_duration: Some(500_000_000),
            eval_count: Some(100),
            eval_duration: Some(2_000_000_000),
            ..OllamaChunk::default()
        }
    }

    #[test]
    fn timing_reduces_nanosecond_counters() {
        let timing = RunTiming::from_chunk(&terminal_chunk());
        assert_eq!(timing.total_time_seconds, 3.0);
        assert_eq!(timing.load_time_seconds, 0.25);
        assert_eq!(timing.eval_time_seconds, 2.0);
        assert_eq!(timing.tokens_per_second, 50.0);
        assert_eq!(timing.prompt_tokens_per_second, 50.0);
        assert_eq!(timing.total_tokens, 125);
    }

    #[test]
    fn timing_guards_zero_durations() {
        let timing = RunTiming::from_chunk(&OllamaChunk::default());
        assert_eq!(timing.tokens_per_second, 0.0);
        assert_eq!(timing.prompt_tokens_per_second, 0.0);
        assert_eq!(timing.total_time_seconds, 0.0);
    }

    #[test]
    fn error_statuses_follow_cause() {
        let e = ApiError::from(SurgeError::Timeout(Duration::from_secs(600)));
        assert_eq!(e.status, StatusCode::GATEWAY_TIMEOUT);
        let e = ApiError::from(SurgeError::Transport("upstream returned 500: boom".into()));
        assert_eq!(e.status, StatusCode::BAD_GATEWAY);
        let e = ApiError::from(SurgeError::Transport("request to x failed: refused".into()));
        assert_eq!(e.status, StatusCode::SERVICE_UNAVAILABLE);
        let e = ApiError::from(SurgeError::IncompleteStream);
        assert_eq!(e.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    fn outcome_fixture() -> ChatOutcome {
        let snap = |mb: f64, util: f64, gb: f64| ResourceSnapshot {
            gpus: vec![GpuSample {
                index: 0,
                name: "test".into(),
                memory_used_mb: mb,
                memory_total_mb: 12288.0,
                utilization_percent: util,
            }],
            ram: Some(RamSample {
                total_gb: 32.0,
                used_gb: gb,
                available_gb: 32.0 - gb,
                percent_used: gb / 32.0 * 100.0,
            }),
        };
        let samples = vec![snap(2000.0, 40.0, 10.0), snap(2100.0, 60.0, 10.1), snap(2150.0, 55.0, 10.2)];
        let response = ChatResponse {
            response: "hello".into(),
            model: "qwen3:4b-q8_0".into(),
            created_at: String::new(),
            done: true,
            done_reason: None,
            timing: RunTiming {
                tokens_per_second: 40.0,
                total_tokens: 125,
                total_time_seconds: 3.0,
                ..RunTiming::default()
            },
            usage_before: snap(2000.0, 40.0, 10.0),
            usage_after: snap(2150.0, 55.0, 10.2),
            usage_during: samples.clone(),
            resource_delta: ResourceDelta {
                gpu: vec![GpuDelta {
                    gpu_index: 0,
                    memory_delta_mb: 150.0,
                    utilization_delta_percent: 15.0,
                }],
                ram: Some(RamDelta { memory_delta_gb: 0.2, percent_delta: 0.6 }),
            },
            peak_gpu_usage: Some(PeakGpuUsage {
                utilization_percent: 60.0,
                vram_percent: 17.5,
                vram_mb: 2150.0,
            }),
            peak_ram_usage: Some(PeakRamUsage { percent: 31.9, mb: 10444.8 }),
        };
        ChatOutcome { response, samples }
    }

    #[test]
    fn simplified_view_reduces_the_full_response() {
        let simple = simplify(&outcome_fixture());
        assert_eq!(simple.model, "qwen3:4b-q8_0");
        assert_eq!(simple.gpu_data.memory_delta_mb, 150.0);
        assert_eq!(simple.gpu_data.peak_memory_mb, 2150.0);
        assert_eq!(simple.gpu_data.memory_usage_pattern, UsagePattern::Stable);
        assert_eq!(simple.ram_data.memory_delta_gb, 0.2);
        assert_eq!(simple.ram_data.peak_usage_gb, 10.2);
        assert_eq!(simple.bottleneck_type, Bottleneck::Balanced);
        // 40 tokens/s over a 15 point utilization delta is well past the
        // high-efficiency ratio.
        assert_eq!(simple.resource_efficiency, Efficiency::High);
    }

    #[test]
    fn metrics_event_classifies_as_metrics() {
        let outcome = outcome_fixture();
        let payload = MetricsPayload {
            model: Some(outcome.response.model.clone()),
            done: true,
            total_time_seconds: Some(outcome.response.timing.total_time_seconds),
            tokens_per_second: outcome.response.timing.tokens_per_second,
            total_tokens: outcome.response.timing.total_tokens,
            resource_delta: Some(outcome.response.resource_delta.clone()),
            ..MetricsPayload::default()
        };
        let mut value = serde_json::to_value(&payload).unwrap();
        value["type"] = Value::String("metrics".into());
        match classify(&value) {
            Record::Metrics(parsed) => {
                assert!(parsed.done);
                assert_eq!(parsed.total_time_seconds, Some(3.0));
                assert_eq!(parsed.resource_delta.unwrap().gpu.len(), 1);
            }
            other => panic!("expected metrics, got {other:?}"),
        }
    }
}
