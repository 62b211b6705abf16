//! Sequential concurrency ramp: drive levels 1..=max, one full
//! request/response cycle at a time, halting on first failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use surge_common::{Result, SurgeError};
use surge_transport::StreamTransport;
use tokio::sync::mpsc;
use tokio::time;
use tokio_stream::StreamExt as _;

use crate::aggregate::{RunAggregator, RunResult};
use crate::frame::FrameDecoder;
use crate::record::classify;

/// Parameters for one ramp invocation.
#[derive(Debug, Clone)]
pub struct RampConfig {
    pub max_concurrency: u32,
    pub message: String,
    pub model: String,
    /// Budget for one full run, connection included.
    pub timeout: Duration,
}

impl RampConfig {
    pub fn new(max_concurrency: u32, message: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            max_concurrency,
            message: message.into(),
            model: model.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampPhase {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Notifications emitted while the ramp advances.
#[derive(Debug, Clone)]
pub enum RampEvent {
    Progress { level: u32, total: u32, result: RunResult },
    Failure { level: u32, total: u32, error: String },
    Cancelled { level: u32, total: u32 },
}

/// Owns the ramp state for one process-scoped invocation. Results are
/// appended in strictly increasing level order; a failure at level k
/// leaves results for levels 1..k intact and never attempts k+1.
pub struct RampController<T> {
    transport: T,
    phase: RampPhase,
    results: Vec<RunResult>,
    cancel: Arc<AtomicBool>,
}

impl<T: StreamTransport> RampController<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            phase: RampPhase::Idle,
            results: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn phase(&self) -> RampPhase {
        self.phase
    }

    pub fn results(&self) -> &[RunResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<RunResult> {
        self.results
    }

    /// Shared cancellation flag. Observed between levels only; the level
    /// in flight when it flips still runs to completion.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Run the ramp to its terminal phase. A second call while Running is
    /// a no-op; at most one ramp runs at a time. Any settled phase may be
    /// restarted, which resets the accumulated results.
    pub async fn start(&mut self, cfg: &RampConfig, events: &mpsc::Sender<RampEvent>) -> RampPhase {
        if self.phase == RampPhase::Running {
            return self.phase;
        }
        self.phase = RampPhase::Running;
        self.results.clear();
        self.cancel.store(false, Ordering::Relaxed);

        let total = cfg.max_concurrency;
        for level in 1..=total {
            if self.cancel.load(Ordering::Relaxed) {
                tracing::info!(target: "ramp", level, "ramp cancelled before level");
                let _ = events.send(RampEvent::Cancelled { level, total }).await;
                self.phase = RampPhase::Cancelled;
                return self.phase;
            }

            let outcome = time::timeout(cfg.timeout, run_level(&self.transport, level, cfg)).await;
            match outcome {
                Ok(Ok(result)) => {
                    tracing::info!(
                        target: "ramp",
                        level,
                        tokens_per_second = result.tokens_per_second,
                        latency_seconds = result.latency_seconds,
                        "level complete"
                    );
                    self.results.push(result.clone());
                    let _ = events.send(RampEvent::Progress { level, total, result }).await;
                }
                Ok(Err(err)) => return self.fail(level, total, err, events).await,
                Err(_) => {
                    return self
                        .fail(level, total, SurgeError::Timeout(cfg.timeout), events)
                        .await
                }
            }
        }

        self.phase = RampPhase::Completed;
        self.phase
    }

    async fn fail(
        &mut self,
        level: u32,
        total: u32,
        err: SurgeError,
        events: &mpsc::Sender<RampEvent>,
    ) -> RampPhase {
        tracing::warn!(target: "ramp", level, "ramp halted: {err}");
        let _ = events
            .send(RampEvent::Failure { level, total, error: err.to_string() })
            .await;
        self.phase = RampPhase::Failed;
        self.phase
    }
}

/// One full run at a fixed level: stream bytes through the decoder,
/// classify each record, and fold it into the aggregator.
async fn run_level<T: StreamTransport>(
    transport: &T,
    level: u32,
    cfg: &RampConfig,
) -> Result<RunResult> {
    let mut stream = transport.start_run(level, &cfg.message, &cfg.model).await?;
    let mut decoder = FrameDecoder::new();
    let mut aggregator = RunAggregator::new(level);

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for value in decoder.push(&chunk) {
            aggregator.observe(classify(&value));
        }
        if aggregator.is_complete() {
            break;
        }
    }
    if !aggregator.is_complete() {
        for value in decoder.finish() {
            aggregator.observe(classify(&value));
        }
    }

    aggregator.finish()
}
