//! Background sampling during a run, plus delta/peak reduction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use surge_common::metrics::{GpuDelta, PeakGpuUsage, PeakRamUsage, RamDelta, ResourceDelta};
use tokio::task::JoinHandle;

use crate::sample::{snapshot, ResourceSnapshot};

/// Samples GPU/RAM usage on an interval for the duration of one run.
pub struct ResourceMonitor {
    samples: Arc<Mutex<Vec<ResourceSnapshot>>>,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ResourceMonitor {
    pub fn spawn(interval: Duration) -> Self {
        let samples: Arc<Mutex<Vec<ResourceSnapshot>>> = Arc::default();
        let stop = Arc::new(AtomicBool::new(false));
        let task_samples = samples.clone();
        let task_stop = stop.clone();
        let handle = tokio::spawn(async move {
            while !task_stop.load(Ordering::Relaxed) {
                let snap = snapshot().await;
                crate::record_snapshot(&snap);
                task_samples.lock().expect("sampler mutex").push(snap);
                tokio::time::sleep(interval).await;
            }
        });
        Self { samples, stop, handle }
    }

    /// Stop sampling and hand back everything collected.
    pub async fn stop(self) -> Vec<ResourceSnapshot> {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.abort();
        let _ = self.handle.await;
        std::mem::take(&mut *self.samples.lock().expect("sampler mutex"))
    }
}

/// Difference between two snapshots, paired per GPU index.
pub fn resource_delta(before: &ResourceSnapshot, after: &ResourceSnapshot) -> ResourceDelta {
    let gpu = before
        .gpus
        .iter()
        .zip(after.gpus.iter())
        .enumerate()
        .map(|(i, (b, a))| GpuDelta {
            gpu_index: i as u32,
            memory_delta_mb: a.memory_used_mb - b.memory_used_mb,
            utilization_delta_percent: a.utilization_percent - b.utilization_percent,
        })
        .collect();
    let ram = match (&before.ram, &after.ram) {
        (Some(b), Some(a)) => Some(RamDelta {
            memory_delta_gb: round3(a.used_gb - b.used_gb),
            percent_delta: round2(a.percent_used - b.percent_used),
        }),
        _ => None,
    };
    ResourceDelta { gpu, ram }
}

/// Highest GPU usage across the sample window; None when no GPU was ever
/// visible.
pub fn peak_gpu_usage(samples: &[ResourceSnapshot]) -> Option<PeakGpuUsage> {
    let mut peak = PeakGpuUsage::default();
    let mut seen = false;
    for snap in samples {
        for gpu in &snap.gpus {
            seen = true;
            peak.utilization_percent = peak.utilization_percent.max(gpu.utilization_percent);
            peak.vram_percent = peak.vram_percent.max(gpu.vram_percent());
            peak.vram_mb = peak.vram_mb.max(gpu.memory_used_mb);
        }
    }
    seen.then_some(peak)
}

pub fn peak_ram_usage(samples: &[ResourceSnapshot]) -> Option<PeakRamUsage> {
    let mut peak = PeakRamUsage::default();
    let mut seen = false;
    for ram in samples.iter().filter_map(|s| s.ram.as_ref()) {
        seen = true;
        peak.percent = peak.percent.max(ram.percent_used);
        peak.mb = peak.mb.max(round2(ram.used_gb * 1024.0));
    }
    seen.then_some(peak)
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
    use crate::sample::{GpuSample, RamSample};

    fn snap(gpu_mb: f64, gpu_util: f64, ram_gb: f64, ram_pct: f64) -> ResourceSnapshot {
        ResourceSnapshot {
            gpus: vec![GpuSample {
                index: 0,
                name: "test".into(),
                memory_used_mb: gpu_mb,
                memory_total_mb: 12288.0,
                utilization_percent: gpu_util,
            }],
            ram: Some(RamSample {
                total_gb: 32.0,
                used_gb: ram_gb,
                available_gb: 32.0 - ram_gb,
                percent_used: ram_pct,
            }),
        }
    }

    #[test]
    fn delta_pairs_gpus_and_subtracts() {
        let before = snap(1000.0, 10.0, 10.0, 31.25);
        let after = snap(1812.0, 44.0, 10.4, 32.5);
        let delta = resource_delta(&before, &after);
        assert_eq!(delta.gpu.len(), 1);
        assert_eq!(delta.gpu[0].memory_delta_mb, 812.0);
        assert_eq!(delta.gpu[0].utilization_delta_percent, 34.0);
        let ram = delta.ram.unwrap();
        assert_eq!(ram.memory_delta_gb, 0.4);
        assert_eq!(ram.percent_delta, 1.25);
    }

    #[test]
    fn delta_without_gpus_is_ram_only() {
        let before = ResourceSnapshot { gpus: vec![], ram: snap(0.0, 0.0, 10.0, 31.0).ram };
        let after = ResourceSnapshot { gpus: vec![], ram: snap(0.0, 0.0, 11.0, 34.0).ram };
        let delta = resource_delta(&before, &after);
        assert!(delta.gpu.is_empty());
        assert!(!delta.is_empty());
    }

    #[test]
    fn peaks_take_the_maximum_sample() {
        let samples = vec![
            snap(1000.0, 10.0, 10.0, 31.0),
            snap(3400.0, 91.0, 12.0, 37.5),
            snap(2000.0, 50.0, 11.0, 34.0),
        ];
        let gpu = peak_gpu_usage(&samples).unwrap();
        assert_eq!(gpu.utilization_percent, 91.0);
        assert_eq!(gpu.vram_mb, 3400.0);
        assert!((gpu.vram_percent - 3400.0 / 12288.0 * 100.0).abs() < 1e-9);
        let ram = peak_ram_usage(&samples).unwrap();
        assert_eq!(ram.percent, 37.5);
        assert_eq!(ram.mb, 12288.0);
    }

    #[test]
    fn no_gpu_samples_means_no_gpu_peak() {
        let samples = vec![ResourceSnapshot::default()];
        assert!(peak_gpu_usage(&samples).is_none());
        assert!(peak_ram_usage(&samples).is_none());
    }

    #[tokio::test]
    async fn monitor_collects_and_stops() {
        let monitor = ResourceMonitor::spawn(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let samples = monitor.stop().await;
        assert!(!samples.is_empty());
    }
}
