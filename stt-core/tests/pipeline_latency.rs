use std::thread;
use std::time::{Duration, Instant};

use stt_core::confidence::ConfidenceOptions;
use stt_core::inference::stub::StubBackend;
use stt_core::inference::ModelHandle;
use stt_core::queue::{TaskQueue, WorkerPool};
use stt_core::streaming::{StreamingCoordinator, StreamingPolicy};
use stt_core::types::TranscriptionResult;

fn recv_with_timeout(
    rx: &mut tokio::sync::broadcast::Receiver<TranscriptionResult>,
    timeout: Duration,
) -> TranscriptionResult {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(result) => return result,
            Err(tokio::sync::broadcast::error::TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    panic!("timed out waiting for a transcription result");
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::TryRecvError::Closed) => {
                panic!("transcription channel closed unexpectedly")
            }
        }
    }
}

/// End-to-end scenario 2 from the streaming emission laws: push short chunks
/// at a fast cadence, finalize, and expect at least one partial followed by
/// exactly one final whose `end_time_ms` is at or beyond any partial's.
#[test]
fn partial_then_final_latency_under_budget() {
    let buffer = std::sync::Arc::new(stt_core::buffer::AudioBufferManager::new(
        Default::default(),
    ));
    let queue = TaskQueue::new();
    let workers = WorkerPool::start(queue.clone(), 2);
    let mut backend = StubBackend::new();
    backend
        .load(
            std::path::Path::new("model.bin"),
            stt_core::quantization::QuantizationLevel::Full32,
            false,
            0,
        )
        .unwrap();
    let model = ModelHandle::new(backend);

    let coordinator = StreamingCoordinator::new(buffer, model, queue.clone(), ConfidenceOptions::default());
    let mut results = coordinator.subscribe();

    let policy = StreamingPolicy {
        min_samples: 1_600,
        transcription_interval_ms: 50,
        min_chunk_ms: 50,
        min_update_interval_ms: 0,
        max_update_frequency: 1_000.0,
        ..StreamingPolicy::default()
    };

    let start = Instant::now();
    coordinator.start(1, policy);
    let chunk = vec![0.2f32; 4_000];
    for _ in 0..12 {
        coordinator.add_chunk(1, &chunk);
        thread::sleep(Duration::from_millis(10));
    }

    let first = recv_with_timeout(&mut results, Duration::from_secs(2));
    assert!(first.is_partial, "expected a partial emission first");
    let first_latency = start.elapsed();
    assert!(
        first_latency < Duration::from_millis(500),
        "time to first partial too high: {first_latency:?}"
    );

    coordinator.finalize(1);
    let mut final_result = None;
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        let result = recv_with_timeout(&mut results, Duration::from_secs(2));
        if !result.is_partial {
            final_result = Some(result);
            break;
        }
        assert!(
            result.end_time_ms >= first.end_time_ms,
            "later partial regressed end_time_ms"
        );
    }
    let final_result = final_result.expect("expected exactly one final result");
    assert!(final_result.end_time_ms >= first.end_time_ms);

    workers.stop();
}
