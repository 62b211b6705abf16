//! Wire shape of the metrics payload exchanged over the stream.
//!
//! The proxy serializes these structures into the `{"type":"metrics",...}`
//! event and into the aggregate `/chat` response; the bench core
//! deserializes them back out of captured records. Key names with literal
//! `%` suffixes are part of the wire format and are preserved via renames.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Some producers fold the end-of-generation signal into the metrics
    /// record itself instead of emitting a separate terminal record.
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_time_seconds: Option<f64>,
    #[serde(default)]
    pub tokens_per_second: f64,
    #[serde(default)]
    pub prompt_tokens_per_second: f64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub load_time_seconds: f64,
    #[serde(default)]
    pub eval_time_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_delta: Option<ResourceDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_gpu_usage: Option<PeakGpuUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_ram_usage: Option<PeakRamUsage>,
}

/// Before/after difference in GPU and host-RAM usage around one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDelta {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpu: Vec<GpuDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram: Option<RamDelta>,
}

impl ResourceDelta {
    pub fn is_empty(&self) -> bool {
        self.gpu.is_empty() && self.ram.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuDelta {
    #[serde(default)]
    pub gpu_index: u32,
    #[serde(default)]
    pub memory_delta_mb: f64,
    #[serde(default)]
    pub utilization_delta_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RamDelta {
    #[serde(default)]
    pub memory_delta_gb: f64,
    #[serde(default)]
    pub percent_delta: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeakGpuUsage {
    #[serde(rename = "peak_gpu_utilization_%", default)]
    pub utilization_percent: f64,
    #[serde(rename = "peak_gpu_vram_usage_%", default)]
    pub vram_percent: f64,
    #[serde(rename = "peak_gpu_vram_mb", default)]
    pub vram_mb: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeakRamUsage {
    #[serde(rename = "peak_cpu_ram_usage_%", default)]
    pub percent: f64,
    #[serde(rename = "peak_cpu_ram_usage_mb", default)]
    pub mb: f64,
}
