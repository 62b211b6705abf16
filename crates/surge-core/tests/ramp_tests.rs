use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use surge_core::{RampConfig, RampController, RampEvent, RampPhase};
use surge_transport::mock::{MockRun, MockTransport};
use tokio::sync::mpsc;

/// A well-formed proxy-style run: status, content, metrics-with-done, [DONE].
fn good_stream(level: u32) -> Vec<Vec<u8>> {
    let metrics = format!(
        "data: {{\"type\":\"metrics\",\"done\":true,\"model\":\"m\",\"total_time_seconds\":{}.5,\
         \"tokens_per_second\":40.0,\"total_tokens\":100,\
         \"resource_delta\":{{\"ram\":{{\"memory_delta_gb\":0.2,\"percent_delta\":0.5}}}}}}\n",
        level
    );
    vec![
        b"data: {\"type\":\"status\",\"message\":\"Receiving response...\"}\n".to_vec(),
        b"data: {\"type\":\"content\",\"content\":\"ok\"}\n".to_vec(),
        metrics.into_bytes(),
        b"data: [DONE]\n".to_vec(),
    ]
}

fn config(max: u32) -> RampConfig {
    RampConfig::new(max, "hello", "m").with_timeout(Duration::from_millis(500))
}

fn drain(rx: &mut mpsc::Receiver<RampEvent>) -> Vec<RampEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn all_levels_succeed_in_order() {
    let transport = MockTransport::new(|level| MockRun::Chunks(good_stream(level)));
    let mut controller = RampController::new(transport);
    let (tx, mut rx) = mpsc::channel(64);

    let phase = controller.start(&config(4), &tx).await;
    assert_eq!(phase, RampPhase::Completed);

    let levels: Vec<u32> = controller.results().iter().map(|r| r.concurrency).collect();
    assert_eq!(levels, vec![1, 2, 3, 4]);
    // Per-level latency came from the reported payload, not wall clock.
    assert_eq!(controller.results()[2].latency_seconds, 3.5);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 4);
    assert!(matches!(events[3], RampEvent::Progress { level: 4, total: 4, .. }));
}

#[tokio::test]
async fn failure_halts_the_ramp_and_keeps_earlier_results() {
    let transport = MockTransport::new(|level| {
        if level == 2 {
            MockRun::Fail("connection refused".into())
        } else {
            MockRun::Chunks(good_stream(level))
        }
    });
    let mut controller = RampController::new(transport);
    let (tx, mut rx) = mpsc::channel(64);

    let phase = controller.start(&config(3), &tx).await;
    assert_eq!(phase, RampPhase::Failed);
    // Only level 1 produced a result; level 3 was never attempted.
    assert_eq!(controller.results().len(), 1);
    assert_eq!(controller.results()[0].concurrency, 1);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 2);
    match &events[1] {
        RampEvent::Failure { level, total, error } => {
            assert_eq!(*level, 2);
            assert_eq!(*total, 3);
            assert!(error.contains("connection refused"));
        }
        other => panic!("expected Failure, got {other:?}"),
    }
}

#[tokio::test]
async fn incomplete_stream_fails_the_level() {
    let transport = MockTransport::new(|_| {
        MockRun::Chunks(vec![
            b"data: {\"type\":\"status\",\"message\":\"Connecting...\"}\n".to_vec(),
            b"data: {\"type\":\"content\",\"content\":\"par\"}\n".to_vec(),
        ])
    });
    let mut controller = RampController::new(transport);
    let (tx, mut rx) = mpsc::channel(64);

    assert_eq!(controller.start(&config(2), &tx).await, RampPhase::Failed);
    assert!(controller.results().is_empty());
    let events = drain(&mut rx);
    match &events[0] {
        RampEvent::Failure { level: 1, error, .. } => {
            assert!(error.contains("terminal"), "unexpected error: {error}");
        }
        other => panic!("expected Failure at level 1, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn hung_stream_times_out() {
    let transport = MockTransport::new(|_| {
        MockRun::ChunksThenHang(vec![b"data: {\"type\":\"content\",\"content\":\"x\"}\n".to_vec()])
    });
    let mut controller = RampController::new(transport);
    let (tx, mut rx) = mpsc::channel(64);

    let phase = controller.start(&config(2), &tx).await;
    assert_eq!(phase, RampPhase::Failed);
    assert!(controller.results().is_empty());

    let events = drain(&mut rx);
    match &events[0] {
        RampEvent::Failure { error, .. } => assert!(error.contains("timeout")),
        other => panic!("expected timeout Failure, got {other:?}"),
    }
}

#[tokio::test]
async fn cancellation_is_observed_between_levels() {
    // The level-1 run itself requests cancellation; the in-flight level
    // still completes, and the ramp stops before starting level 2.
    let flag_slot: Arc<OnceLock<Arc<AtomicBool>>> = Arc::new(OnceLock::new());
    let slot = flag_slot.clone();
    let transport = MockTransport::new(move |level| {
        if level == 1 {
            if let Some(flag) = slot.get() {
                flag.store(true, Ordering::Relaxed);
            }
        }
        MockRun::Chunks(good_stream(level))
    });
    let mut controller = RampController::new(transport);
    let _ = flag_slot.set(controller.cancel_flag());
    let (tx, mut rx) = mpsc::channel(64);

    let phase = controller.start(&config(5), &tx).await;
    assert_eq!(phase, RampPhase::Cancelled);
    assert_eq!(controller.results().len(), 1);
    assert_eq!(controller.results()[0].concurrency, 1);

    let events = drain(&mut rx);
    assert!(matches!(events.last(), Some(RampEvent::Cancelled { level: 2, total: 5 })));
}

#[tokio::test]
async fn restart_resets_results() {
    let transport = MockTransport::new(|level| MockRun::Chunks(good_stream(level)));
    let mut controller = RampController::new(transport);
    let (tx, _rx) = mpsc::channel(64);

    assert_eq!(controller.start(&config(2), &tx).await, RampPhase::Completed);
    assert_eq!(controller.results().len(), 2);

    assert_eq!(controller.start(&config(3), &tx).await, RampPhase::Completed);
    let levels: Vec<u32> = controller.results().iter().map(|r| r.concurrency).collect();
    assert_eq!(levels, vec![1, 2, 3]);
}
