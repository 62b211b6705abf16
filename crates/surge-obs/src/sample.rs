//! One-shot GPU and RAM usage snapshots.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuSample {
    pub index: u32,
    pub name: String,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub utilization_percent: f64,
}

impl GpuSample {
    pub fn vram_percent(&self) -> f64 {
        if self.memory_total_mb > 0.0 {
            self.memory_used_mb / self.memory_total_mb * 100.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RamSample {
    pub total_gb: f64,
    pub used_gb: f64,
    pub available_gb: f64,
    pub percent_used: f64,
}

/// GPU and RAM usage at one instant. A GPU-less host degrades to a
/// RAM-only snapshot; that is not an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub gpus: Vec<GpuSample>,
    pub ram: Option<RamSample>,
}

impl ResourceSnapshot {
    pub fn gpu_available(&self) -> bool {
        !self.gpus.is_empty()
    }
}

/// Capture both GPU and RAM usage now.
pub async fn snapshot() -> ResourceSnapshot {
    ResourceSnapshot { gpus: sample_gpus().await, ram: sample_ram() }
}

pub fn sample_ram() -> Option<RamSample> {
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory() as f64;
    if total == 0.0 {
        return None;
    }
    let used = sys.used_memory() as f64;
    Some(RamSample {
        total_gb: total / GIB,
        used_gb: used / GIB,
        available_gb: sys.available_memory() as f64 / GIB,
        percent_used: used / total * 100.0,
    })
}

/// Query nvidia-smi for per-GPU memory and utilization. Empty when the
/// binary is missing, fails, or times out.
pub async fn sample_gpus() -> Vec<GpuSample> {
    let query = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.used,memory.total,utilization.gpu",
            "--format=csv,noheader,nounits",
        ])
        .output();
    let output = match tokio::time::timeout(Duration::from_secs(10), query).await {
        Ok(Ok(output)) if output.status.success() => output,
        Ok(Ok(output)) => {
            tracing::debug!(target: "obs", status = %output.status, "nvidia-smi exited nonzero");
            return Vec::new();
        }
        Ok(Err(e)) => {
            tracing::debug!(target: "obs", "nvidia-smi not available: {e}");
            return Vec::new();
        }
        Err(_) => {
            tracing::warn!(target: "obs", "nvidia-smi timed out");
            return Vec::new();
        }
    };
    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
}

fn parse_nvidia_smi(stdout: &str) -> Vec<GpuSample> {
    let mut gpus = Vec::new();
    for line in stdout.lines() {
        let parts: Vec<&str> = line.split(", ").map(str::trim).collect();
        if parts.len() < 5 {
            continue;
        }
        let (Ok(index), Ok(used), Ok(total), Ok(util)) = (
            parts[0].parse::<u32>(),
            parts[2].parse::<f64>(),
            parts[3].parse::<f64>(),
            parts[4].parse::<f64>(),
        ) else {
            continue;
        };
        gpus.push(GpuSample {
            index,
            name: parts[1].to_string(),
            memory_used_mb: used,
            memory_total_mb: total,
            utilization_percent: util,
        });
    }
    gpus
}
