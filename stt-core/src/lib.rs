//! # stt-core
//!
//! Real-time speech-to-text serving core: per-utterance audio buffering,
//! streaming transcription coordination, confidence scoring, quantization
//! policy, error recovery, a shared priority task queue, pipeline
//! orchestration (language detection + translation), and health monitoring.
//!
//! ## Architecture
//!
//! ```text
//! caller → add_audio_chunk → AudioBufferManager (C1)
//!                                  │
//!                        StreamingCoordinator (C5) ── InferenceBackend (C3)
//!                                  │                         │
//!                         ConfidenceEngine (C4) ◄─────────────┘
//!                                  │
//!                    broadcast::Sender<TranscriptionResult>
//!                                  │
//!                        PipelineOrchestrator (C8) ── language detector / translator
//! ```
//!
//! C2 (QuantizationPolicy), C6 (ErrorRecovery), C7 (TaskQueue+WorkerPool) and
//! C9 (HealthMonitor) are cross-cutting and used by the components above.
//! All inference and orchestration work is dispatched onto the shared C7
//! queue so a caller's `add_audio_chunk` never blocks on a model call.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod buffer;
pub mod confidence;
pub mod engine;
pub mod error;
pub mod health;
pub mod inference;
pub mod pipeline;
pub mod quantization;
pub mod queue;
pub mod recovery;
pub mod streaming;
pub mod types;

pub use confidence::ConfidenceOptions;
pub use engine::{Engine, EngineConfig, EngineStatus};
pub use error::{Result, SttError};
pub use health::{HealthCheckConfig, HealthMonitor, HealthStatus, SystemHealthStatus};
pub use inference::{InferenceParams, ModelHandle, WhisperBackend};
pub use pipeline::{LanguageDetector, PipelineConfig, PipelineEvent, PipelineOrchestrator, Translator};
pub use quantization::{QuantizationLevel, QuantizationManager};
pub use queue::{Priority, TaskQueue, WorkerPool};
pub use recovery::{ErrorContext, ErrorKind, ErrorRecovery, RecoveryConfig};
pub use streaming::{StreamingCoordinator, StreamingPolicy};
pub use types::{QualityLevel, QualityMetrics, TranscriptionResult, UtteranceId, WordTiming};
