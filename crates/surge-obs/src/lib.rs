//! Host resource observation: GPU/RAM snapshots, background sampling,
//! delta and peak reduction, and load-test insight analysis.

pub mod insight;
pub mod monitor;
pub mod sample;

pub use insight::{bottleneck, efficiency, usage_pattern, Bottleneck, Efficiency, UsagePattern};
pub use monitor::{peak_gpu_usage, peak_ram_usage, resource_delta, ResourceMonitor};
pub use sample::{GpuSample, RamSample, ResourceSnapshot};

use once_cell::sync::Lazy;
use prometheus::{Gauge, IntGauge};

static GPU_UTIL: Lazy<Gauge> = Lazy::new(|| {
    prometheus::register_gauge!("surge_gpu_utilization", "GPU utilization percent").unwrap()
});
static GPU_MEM_USED_MB: Lazy<Gauge> = Lazy::new(|| {
    prometheus::register_gauge!("surge_gpu_memory_used_mb", "GPU memory used (MB)").unwrap()
});
static RAM_USED_BYTES: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!("surge_ram_used_bytes", "Host RAM used (bytes)").unwrap()
});
static RAM_USED_PERCENT: Lazy<Gauge> = Lazy::new(|| {
    prometheus::register_gauge!("surge_ram_used_percent", "Host RAM used percent").unwrap()
});

pub fn init() {
    // Touch statics to force registration even when nothing samples yet.
    let _ = &*GPU_UTIL;
    let _ = &*GPU_MEM_USED_MB;
    let _ = &*RAM_USED_BYTES;
    let _ = &*RAM_USED_PERCENT;
}

/// Push one snapshot into the prometheus gauges.
pub fn record_snapshot(snapshot: &ResourceSnapshot) {
    if let Some(gpu) = snapshot.gpus.first() {
        GPU_UTIL.set(gpu.utilization_percent);
        GPU_MEM_USED_MB.set(gpu.memory_used_mb);
    }
    if let Some(ram) = &snapshot.ram {
        RAM_USED_BYTES.set((ram.used_gb * 1024.0 * 1024.0 * 1024.0) as i64);
        RAM_USED_PERCENT.set(ram.percent_used);
    }
}

/// NVML-backed polling loop for hosts where nvidia-smi shelling is too
/// coarse. Mirrors the default sampler's gauges.
pub fn spawn_gpu_polling() {
    #[cfg(feature = "nvidia")]
    tokio::spawn(async move {
        let nvml = match nvml_wrapper::Nvml::init() {
            Ok(n) => n,
            Err(_) => return,
        };
        let device = match nvml.device_by_index(0) {
            Ok(d) => d,
            Err(_) => return,
        };
        loop {
            if let Ok(util) = device.utilization_rates() {
                GPU_UTIL.set(util.gpu as f64);
            }
            if let Ok(mem) = device.memory_info() {
                GPU_MEM_USED_MB.set(mem.used as f64 / 1024.0 / 1024.0);
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    });
}
