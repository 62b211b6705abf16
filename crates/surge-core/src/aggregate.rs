//! Per-run accumulation of streamed content and captured metrics.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use surge_common::metrics::MetricsPayload;
use surge_common::{Result, SurgeError};

use crate::record::Record;

/// One measurement for a single concurrency level. Immutable once built;
/// persisted by an external collaborator after the ramp completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub concurrency: u32,
    pub latency_seconds: f64,
    pub tokens_per_second: f64,
    pub prompt_tokens_per_second: f64,
    pub total_tokens: u64,
    pub load_time_seconds: f64,
    pub eval_time_seconds: f64,
    pub gpu_utilization_delta_percent: f64,
    pub ram_percent_delta: f64,
    pub peak_gpu_utilization_percent: f64,
    pub peak_gpu_vram_percent: f64,
    pub peak_gpu_vram_mb: f64,
    pub peak_cpu_ram_percent: f64,
    pub peak_cpu_ram_mb: f64,
    pub gpu_memory_delta_mb: f64,
    pub ram_memory_delta_gb: f64,
    pub model: String,
    pub response: String,
}

/// Transient state for the run currently executing. Exclusively owned by
/// that run; re-initialized per level, never shared across levels.
pub struct RunAggregator {
    level: u32,
    content: String,
    captured: Option<MetricsPayload>,
    terminal: Option<Option<MetricsPayload>>,
    started: Instant,
    terminal_at: Option<Instant>,
}

impl RunAggregator {
    pub fn new(level: u32) -> Self {
        Self {
            level,
            content: String::new(),
            captured: None,
            terminal: None,
            started: Instant::now(),
            terminal_at: None,
        }
    }

    pub fn observe(&mut self, record: Record) {
        match record {
            Record::Status(message) => {
                tracing::debug!(target: "aggregate", level = self.level, "status: {message}");
            }
            Record::Content(fragment) => self.content.push_str(&fragment),
            Record::Metrics(payload) => {
                // Last metrics record wins. A producer that folds the
                // terminal signal into its metrics record ends the run here.
                let done = payload.done;
                self.captured = Some(payload);
                if done && self.terminal.is_none() {
                    self.terminal = Some(None);
                    self.terminal_at = Some(Instant::now());
                }
            }
            Record::Terminal(embedded) => {
                if self.terminal_at.is_none() {
                    self.terminal_at = Some(Instant::now());
                }
                self.terminal = Some(embedded);
            }
        }
    }

    /// Whether the terminal signal for this run has been seen. The ramp
    /// stops reading the stream once it has.
    pub fn is_complete(&self) -> bool {
        self.terminal.is_some()
    }

    /// Consume the run state and build the result. Must be called after
    /// the byte stream has ended.
    pub fn finish(self) -> Result<RunResult> {
        let Some(embedded) = self.terminal else {
            return Err(SurgeError::IncompleteStream);
        };
        // Wall clock from capture start to terminal receipt; only used
        // when the payload does not report its own total time.
        let elapsed = self
            .terminal_at
            .unwrap_or(self.started)
            .duration_since(self.started)
            .as_secs_f64();
        let metrics = match self.captured.or(embedded) {
            Some(metrics) => metrics,
            None => return Err(SurgeError::MissingMetrics(self.level)),
        };
        Ok(build_result(self.level, self.content, &metrics, elapsed))
    }
}

fn build_result(level: u32, content: String, m: &MetricsPayload, elapsed: f64) -> RunResult {
    let delta = m.resource_delta.clone().unwrap_or_default();
    let gpu_delta = delta.gpu.first().cloned().unwrap_or_default();
    let ram_delta = delta.ram.unwrap_or_default();
    let peak_gpu = m.peak_gpu_usage.clone().unwrap_or_default();
    let peak_ram = m.peak_ram_usage.clone().unwrap_or_default();

    RunResult {
        concurrency: level,
        latency_seconds: m.total_time_seconds.unwrap_or(elapsed),
        tokens_per_second: m.tokens_per_second,
        prompt_tokens_per_second: m.prompt_tokens_per_second,
        total_tokens: m.total_tokens,
        load_time_seconds: m.load_time_seconds,
        eval_time_seconds: m.eval_time_seconds,
        gpu_utilization_delta_percent: gpu_delta.utilization_delta_percent,
        ram_percent_delta: ram_delta.percent_delta,
        peak_gpu_utilization_percent: peak_gpu.utilization_percent,
        peak_gpu_vram_percent: peak_gpu.vram_percent,
        peak_gpu_vram_mb: peak_gpu.vram_mb,
        peak_cpu_ram_percent: peak_ram.percent,
        peak_cpu_ram_mb: peak_ram.mb,
        gpu_memory_delta_mb: gpu_delta.memory_delta_mb,
        ram_memory_delta_gb: ram_delta.memory_delta_gb,
        model: m.model.clone().unwrap_or_else(|| "unknown".into()),
        response: content,
    }
}
