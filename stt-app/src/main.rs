//! stt-app entry point: a thin driver binary wiring `stt_core::Engine` to
//! process exit codes. Config file and CLI argument parsing live outside
//! this crate's scope, so this binary reads a model path and thread count
//! from `std::env::args` and nothing more.
//!
//! Usage: `sttd <model-path> [threads]`
//!
//! Reads raw little-endian f32 PCM (16kHz mono) from stdin in fixed-size
//! chunks until EOF, feeding it to a single streaming utterance. Status and
//! transcription events are logged via `tracing` as they arrive.

use std::io::Read;
use std::process::ExitCode;
use std::sync::Arc;

use stt_core::inference::stub::StubBackend;
use stt_core::{Engine, EngineConfig, UtteranceId};
use tracing::{error, info, warn};

const EXIT_SUCCESS: u8 = 0;
const EXIT_INIT_FAILURE: u8 = 1;
const EXIT_RUNTIME_FAILURE: u8 = 2;
const EXIT_CONFIG_ERROR: u8 = 3;

/// 100ms @ 16kHz mono.
const CHUNK_SAMPLES: usize = 1600;
const UTTERANCE_ID: UtteranceId = 1;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stt_app=info,stt_core=info".parse().unwrap()),
        )
        .init();

    info!("stt-app starting");

    let mut args = std::env::args().skip(1);
    let model_path = match args.next() {
        Some(p) => p,
        None => {
            error!("usage: sttd <model-path> [threads]");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    let threads: usize = match args.next() {
        Some(s) => match s.parse() {
            Ok(n) => n,
            Err(_) => {
                error!(value = %s, "invalid thread count");
                return ExitCode::from(EXIT_CONFIG_ERROR);
            }
        },
        None => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4),
    };

    let engine = Arc::new(Engine::new(
        EngineConfig::default(),
        StubBackend::new(),
        None,
        None,
    ));

    if let Err(e) = engine.initialize(&model_path, threads) {
        error!("engine initialization failed: {e}");
        return ExitCode::from(EXIT_INIT_FAILURE);
    }
    info!(model_path = %model_path, threads, "engine initialized");

    let mut status_rx = engine.subscribe_status();
    tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(status) => info!(?status, "engine status changed"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("status receiver lagged by {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut transcript_rx = engine.subscribe_transcriptions();
    tokio::spawn(async move {
        loop {
            match transcript_rx.recv().await {
                Ok(result) => info!(
                    text = %result.text,
                    confidence = result.confidence,
                    is_partial = result.is_partial,
                    language = ?result.detected_language,
                    word_count = result.word_timings.len(),
                    "transcription result"
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("transcript receiver lagged by {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    if let Err(e) = engine.start_streaming(UTTERANCE_ID, None) {
        error!("failed to start streaming: {e}");
        return ExitCode::from(EXIT_RUNTIME_FAILURE);
    }

    let mut stdin = std::io::stdin().lock();
    let mut buf = [0u8; CHUNK_SAMPLES * 4];
    loop {
        let n = match stdin.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                error!("stdin read failed: {e}");
                return ExitCode::from(EXIT_RUNTIME_FAILURE);
            }
        };
        let samples: Vec<f32> = buf[..n]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if !samples.is_empty() {
            engine.add_audio_chunk(UTTERANCE_ID, &samples);
        }
    }

    engine.finalize_streaming(UTTERANCE_ID);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    engine.shutdown();
    info!("stt-app shutting down");
    ExitCode::from(EXIT_SUCCESS)
}
