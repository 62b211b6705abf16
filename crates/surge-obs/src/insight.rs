//! Load-testing insight reduction: usage patterns, bottleneck, efficiency.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsagePattern {
    Stable,
    GradualIncrease,
    Spike,
    InsufficientData,
}

/// Classify a series of usage samples. A jump between adjacent samples
/// larger than `threshold` is a spike; a >20% rise from the first three
/// to the last three samples is a gradual increase.
pub fn usage_pattern(samples: &[f64], threshold: f64) -> UsagePattern {
    if samples.len() < 3 {
        return UsagePattern::InsufficientData;
    }
    for window in samples.windows(2) {
        if (window[1] - window[0]).abs() > threshold {
            return UsagePattern::Spike;
        }
    }
    let start_avg: f64 = samples[..3].iter().sum::<f64>() / 3.0;
    let end_avg: f64 = samples[samples.len() - 3..].iter().sum::<f64>() / 3.0;
    if end_avg > start_avg * 1.2 {
        return UsagePattern::GradualIncrease;
    }
    UsagePattern::Stable
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bottleneck {
    Vram,
    GpuCompute,
    Ram,
    Balanced,
}

/// Primary limiting resource for one run.
pub fn bottleneck(
    gpu_delta_mb: f64,
    gpu_util_delta: f64,
    ram_delta_gb: f64,
    total_vram_mb: f64,
) -> Bottleneck {
    let vram_usage_percent = if total_vram_mb > 0.0 {
        gpu_delta_mb / total_vram_mb * 100.0
    } else {
        0.0
    };
    if vram_usage_percent > 70.0 {
        return Bottleneck::Vram;
    }
    if gpu_util_delta > 50.0 && vram_usage_percent < 50.0 {
        return Bottleneck::GpuCompute;
    }
    if ram_delta_gb > 2.0 {
        return Bottleneck::Ram;
    }
    Bottleneck::Balanced
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Efficiency {
    High,
    Medium,
    Low,
}

/// Tokens produced per point of GPU utilization spent.
pub fn efficiency(tokens_per_second: f64, gpu_util_delta: f64) -> Efficiency {
    let ratio = tokens_per_second / gpu_util_delta.max(1.0);
    if ratio > 0.5 {
        Efficiency::High
    } else if ratio > 0.2 {
        Efficiency::Medium
    } else {
        Efficiency::Low
    }
}
