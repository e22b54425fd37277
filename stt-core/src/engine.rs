//! `Engine` — top-level lifecycle controller and Control API (§6).
//!
//! Wires C1-C9 together: a buffer manager, a streaming coordinator, an
//! inference backend, confidence scoring, error recovery, the shared task
//! queue/worker pool, a pipeline orchestrator, and a health monitor.
//!
//! ## Lifecycle
//!
//! ```text
//! Engine::new(config)
//!     └─► initialize(...)        → model loaded, status Uninitialized → Ready
//!         └─► start_streaming()  → per-utterance streaming begins
//!             └─► stop_streaming()/finalize_streaming()
//! ```
//!
//! `initialize` is idempotent-guarded: calling it twice without an intervening
//! failure returns `SttError::AlreadyRunning`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use crate::buffer::{AudioBufferManager, BufferConfig};
use crate::confidence::ConfidenceOptions;
use crate::error::{Result, SttError};
use crate::health::{HealthCheckConfig, HealthMonitor};
use crate::inference::{InferenceParams, ModelHandle, WhisperBackend};
use crate::pipeline::{LanguageDetector, PipelineConfig, PipelineEvent, PipelineOrchestrator, Translator};
use crate::quantization::{QuantizationLevel, QuantizationManager};
use crate::queue::{Priority, TaskQueue, WorkerPool};
use crate::recovery::{ErrorContext, ErrorKind, ErrorRecovery, RecoveryConfig};
use crate::streaming::{StreamingCoordinator, StreamingPolicy};
use crate::types::{TranscriptionResult, UtteranceId};

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub buffer: BufferConfig,
    pub recovery: RecoveryConfig,
    pub pipeline: PipelineConfig,
    pub confidence: ConfidenceOptions,
    pub health: HealthCheckConfig,
    pub worker_count: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            recovery: RecoveryConfig::default(),
            pipeline: PipelineConfig::default(),
            confidence: ConfidenceOptions::default(),
            health: HealthCheckConfig::default(),
            worker_count: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Uninitialized,
    Initializing,
    Ready,
    Error,
}

struct LoadedModel {
    base_path: PathBuf,
    level: QuantizationLevel,
    use_gpu: bool,
    gpu_id: u32,
    threads: usize,
}

/// The top-level engine handle. `Clone`-able and `Send + Sync`; every field
/// uses interior mutability or is itself a cheap `Arc`-wrapped handle.
pub struct Engine {
    status: Mutex<EngineStatus>,
    running: AtomicBool,
    model: ModelHandle,
    quantization: QuantizationManager,
    loaded: Mutex<Option<LoadedModel>>,
    buffer: Arc<AudioBufferManager>,
    queue: TaskQueue,
    workers: Mutex<Option<WorkerPool>>,
    streaming: StreamingCoordinator,
    pipeline: PipelineOrchestrator,
    recovery: Arc<ErrorRecovery>,
    health: HealthMonitor,
    status_tx: broadcast::Sender<EngineStatus>,
    worker_count: usize,
    base_params: Mutex<InferenceParams>,
    confidence_opts: Mutex<ConfidenceOptions>,
}

impl Engine {
    pub fn new<M: WhisperBackend>(
        config: EngineConfig,
        backend: M,
        detector: Option<Arc<dyn LanguageDetector>>,
        translator: Option<Arc<dyn Translator>>,
    ) -> Self {
        let model = ModelHandle::new(backend);
        let buffer = Arc::new(AudioBufferManager::new(config.buffer.clone()));
        let queue = TaskQueue::new();
        let streaming = StreamingCoordinator::new(buffer.clone(), model.clone(), queue.clone(), config.confidence.clone());
        let pipeline = PipelineOrchestrator::new(config.pipeline.clone(), detector, translator, queue.clone());
        let recovery = Arc::new(ErrorRecovery::new(config.recovery.clone()));
        let health = HealthMonitor::new(config.health.clone());
        let (status_tx, _) = broadcast::channel(32);
        let confidence_opts = Mutex::new(config.confidence.clone());

        let recovery_model = model.clone();
        let recovery_quant = QuantizationManager::new();
        recovery.register_callback(ErrorKind::ModelLoadFailure, move |ctx: &ErrorContext| {
            let Some(path) = ctx.snapshot.model_path.as_ref() else { return false };
            let fallback_path = recovery_quant.path_for(Path::new(path), QuantizationLevel::Half16);
            let mut backend = recovery_model.0.lock();
            backend
                .load(&fallback_path, QuantizationLevel::Half16, false, 0)
                .is_ok()
        });

        Self {
            status: Mutex::new(EngineStatus::Uninitialized),
            running: AtomicBool::new(false),
            model,
            quantization: QuantizationManager::new(),
            loaded: Mutex::new(None),
            buffer,
            queue,
            workers: Mutex::new(None),
            streaming,
            pipeline,
            recovery,
            health,
            status_tx,
            worker_count: config.worker_count.max(1),
            base_params: Mutex::new(InferenceParams::default()),
            confidence_opts,
        }
    }

    fn set_status(&self, status: EngineStatus) {
        *self.status.lock() = status;
        let _ = self.status_tx.send(status);
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_transcriptions(&self) -> broadcast::Receiver<TranscriptionResult> {
        self.streaming.subscribe()
    }

    pub fn subscribe_pipeline_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.pipeline.subscribe()
    }

    pub fn health_monitor(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn pipeline(&self) -> &PipelineOrchestrator {
        &self.pipeline
    }

    pub fn recovery(&self) -> &ErrorRecovery {
        &self.recovery
    }

    // ---- initialization -------------------------------------------------

    pub fn initialize(&self, model_path: impl AsRef<Path>, threads: usize) -> Result<()> {
        self.initialize_with_quantization_gpu(model_path, QuantizationLevel::Full32, false, 0, threads)
    }

    pub fn initialize_with_gpu(&self, model_path: impl AsRef<Path>, gpu_id: u32, threads: usize) -> Result<()> {
        self.initialize_with_quantization_gpu(model_path, QuantizationLevel::Full32, true, gpu_id, threads)
    }

    pub fn initialize_with_quantization(
        &self,
        model_path: impl AsRef<Path>,
        level: QuantizationLevel,
        threads: usize,
    ) -> Result<()> {
        self.initialize_with_quantization_gpu(model_path, level, false, 0, threads)
    }

    pub fn initialize_with_quantization_gpu(
        &self,
        model_path: impl AsRef<Path>,
        level: QuantizationLevel,
        use_gpu: bool,
        gpu_id: u32,
        threads: usize,
    ) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SttError::AlreadyRunning);
        }
        self.set_status(EngineStatus::Initializing);
        let base_path = model_path.as_ref().to_path_buf();
        let resolved = self.quantization.path_for(&base_path, level);

        let load_result = {
            let mut backend = self.model.0.lock();
            backend.load(&resolved, level, use_gpu, gpu_id).and_then(|_| {
                backend.set_params(InferenceParams { n_threads: threads, ..InferenceParams::default() });
                backend.validate()
            })
        };

        if let Err(e) = load_result {
            let mut ctx = ErrorContext::new(ErrorKind::ModelLoadFailure, e.to_string(), 0, "init");
            ctx.snapshot.model_path = Some(resolved.to_string_lossy().to_string());
            ctx.snapshot.current_quantization = Some(level.as_str().to_string());
            ctx.snapshot.was_using_gpu = use_gpu;
            let outcome = self.recovery.handle(ctx);
            if !outcome.success {
                self.running.store(false, Ordering::SeqCst);
                self.set_status(EngineStatus::Error);
                return Err(e);
            }
        }

        {
            let mut params = self.base_params.lock();
            params.n_threads = threads;
            self.streaming.set_base_params(params.clone());
        }
        *self.loaded.lock() = Some(LoadedModel { base_path, level, use_gpu, gpu_id, threads });

        let mut workers = self.workers.lock();
        if workers.is_none() {
            *workers = Some(WorkerPool::start(self.queue.clone(), self.worker_count));
        }
        drop(workers);

        self.health.register_check("model", {
            let model = self.model.clone();
            move || {
                let valid = model.0.lock().validate().is_ok();
                crate::health::ComponentHealth {
                    name: "model".to_string(),
                    status: if valid { crate::health::HealthStatus::Healthy } else { crate::health::HealthStatus::Critical },
                    message: if valid { "model loaded".to_string() } else { "model not loaded".to_string() },
                    response_time_ms: 0.0,
                    details: Default::default(),
                }
            }
        });

        self.set_status(EngineStatus::Ready);
        info!(?level, use_gpu, threads, "engine initialized");
        Ok(())
    }

    /// Re-loads the model at a new quantization level (§6 `set_quantization_level`).
    pub fn set_quantization_level(&self, level: QuantizationLevel) -> Result<()> {
        let loaded = self.loaded.lock().as_ref().map(|l| (l.base_path.clone(), l.use_gpu, l.gpu_id, l.threads));
        let Some((base_path, use_gpu, gpu_id, threads)) = loaded else {
            return Err(SttError::NotRunning);
        };
        let path = self.quantization.path_for(&base_path, level);
        let mut backend = self.model.0.lock();
        backend.load(&path, level, use_gpu, gpu_id)?;
        backend.validate()?;
        drop(backend);
        if let Some(l) = self.loaded.lock().as_mut() {
            l.level = level;
        }
        let _ = threads;
        Ok(())
    }

    // ---- streaming --------------------------------------------------

    pub fn start_streaming(&self, utterance_id: UtteranceId, policy: Option<StreamingPolicy>) -> Result<()> {
        if self.status() != EngineStatus::Ready {
            return Err(SttError::NotRunning);
        }
        self.streaming.start(utterance_id, policy.unwrap_or_default());
        Ok(())
    }

    pub fn add_audio_chunk(&self, utterance_id: UtteranceId, samples: &[f32]) {
        self.streaming.add_chunk(utterance_id, samples);
    }

    pub fn finalize_streaming(&self, utterance_id: UtteranceId) {
        self.streaming.finalize(utterance_id);
    }

    pub fn stop_streaming(&self, utterance_id: UtteranceId) {
        self.streaming.stop(utterance_id);
    }

    pub fn stop_all(&self) {
        self.streaming.stop_all();
    }

    /// Hands a finished streaming result to the pipeline orchestrator.
    pub fn process_transcription(&self, utterance_id: UtteranceId, session_id: impl Into<String>, result: TranscriptionResult) -> bool {
        self.pipeline.process_transcription(utterance_id, session_id, result, Vec::new())
    }

    // ---- one-shot transcription --------------------------------------

    /// Full, non-streaming transcription capped at 30s (§6 `transcribe`).
    pub fn transcribe(&self, audio: &[f32]) -> Result<TranscriptionResult> {
        if audio.len() > crate::inference::FULL_AUDIO_CAP_SAMPLES {
            return Err(SttError::Configuration("audio exceeds full-utterance cap (30s)".to_string()));
        }
        self.run_one_shot(audio, false)
    }

    /// Single partial transcription capped at 10s (§6 `transcribe_live`).
    pub fn transcribe_live(&self, audio: &[f32]) -> Result<TranscriptionResult> {
        if audio.len() > crate::inference::PARTIAL_AUDIO_CAP_SAMPLES {
            return Err(SttError::Configuration("audio exceeds live/partial cap (10s)".to_string()));
        }
        self.run_one_shot(audio, true)
    }

    fn run_one_shot(&self, audio: &[f32], partial_mode: bool) -> Result<TranscriptionResult> {
        let start = std::time::Instant::now();
        let params = InferenceParams { partial_mode, ..self.base_params.lock().clone() };
        let raw = {
            let mut backend = self.model.0.lock();
            backend.set_params(params.clone());
            backend.infer(audio, &params)?
        };
        let latency_ms = start.elapsed().as_secs_f32() * 1000.0;
        let end_time_ms = (audio.len() as u64 * 1000) / 16_000;
        let opts = self.confidence_opts.lock().clone();
        Ok(crate::confidence::build_transcription_result(
            0, &raw, audio, partial_mode, 0, end_time_ms, latency_ms, &opts, None,
        ))
    }

    // ---- runtime configuration setters (§6) ----------------------------

    pub fn set_language(&self, code: Option<String>) {
        self.with_base_params(|p| p.language = code);
    }

    pub fn set_translate_to_english(&self, enabled: bool) {
        self.with_base_params(|p| p.translate_to_english = enabled);
    }

    pub fn set_temperature(&self, temperature: f32) {
        self.with_base_params(|p| p.temperature = temperature.clamp(0.0, 1.0));
    }

    pub fn set_max_tokens(&self, max_tokens: usize) {
        self.with_base_params(|p| p.max_tokens = max_tokens);
    }

    fn with_base_params(&self, f: impl FnOnce(&mut InferenceParams)) {
        let mut params = self.base_params.lock();
        f(&mut params);
        self.streaming.set_base_params(params.clone());
    }

    pub fn set_confidence_threshold(&self, threshold: f32) {
        self.with_confidence_opts(|o| o.confidence_threshold = threshold.clamp(0.0, 1.0));
    }

    pub fn set_word_level_confidence_enabled(&self, enabled: bool) {
        self.with_confidence_opts(|o| o.word_level_confidence_enabled = enabled);
    }

    pub fn set_quality_indicators_enabled(&self, enabled: bool) {
        self.with_confidence_opts(|o| o.quality_indicators_enabled = enabled);
    }

    pub fn set_confidence_filtering_enabled(&self, enabled: bool) {
        self.with_confidence_opts(|o| o.confidence_filtering_enabled = enabled);
    }

    fn with_confidence_opts(&self, f: impl FnOnce(&mut ConfidenceOptions)) {
        let mut opts = self.confidence_opts.lock();
        f(&mut opts);
        self.streaming.set_confidence_options(opts.clone());
    }

    pub fn set_language_detection_enabled(&self, enabled: bool) {
        self.pipeline.set_language_detection_enabled(enabled);
    }

    pub fn set_language_detection_threshold(&self, threshold: f32) {
        self.pipeline.set_language_detection_threshold(threshold);
    }

    pub fn set_auto_language_switching(&self, enabled: bool) {
        self.pipeline.set_auto_language_switching(enabled);
    }

    /// Dispatches an arbitrary closure onto the shared task queue (used by
    /// driver code that wants to piggyback on C7 rather than spawn its own
    /// threads).
    pub fn dispatch(&self, priority: Priority, job: impl FnOnce() + Send + 'static) {
        self.queue.enqueue_fn(priority, job);
    }

    pub fn shutdown(&self) {
        self.streaming.stop_all();
        self.queue.shutdown();
        if let Some(pool) = self.workers.lock().take() {
            pool.stop();
        }
        self.running.store(false, Ordering::SeqCst);
        self.set_status(EngineStatus::Uninitialized);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::stub::StubBackend;

    #[test]
    fn initialize_transitions_to_ready() {
        let engine = Engine::new(EngineConfig::default(), StubBackend::new(), None, None);
        engine.initialize("model.bin", 2).unwrap();
        assert_eq!(engine.status(), EngineStatus::Ready);
        engine.shutdown();
    }

    #[test]
    fn double_initialize_without_shutdown_errors() {
        let engine = Engine::new(EngineConfig::default(), StubBackend::new(), None, None);
        engine.initialize("model.bin", 2).unwrap();
        let err = engine.initialize("model.bin", 2).unwrap_err();
        assert!(matches!(err, SttError::AlreadyRunning));
        engine.shutdown();
    }

    #[test]
    fn transcribe_over_cap_is_rejected() {
        let engine = Engine::new(EngineConfig::default(), StubBackend::new(), None, None);
        engine.initialize("model.bin", 2).unwrap();
        let too_long = vec![0.0f32; crate::inference::FULL_AUDIO_CAP_SAMPLES + 1];
        assert!(engine.transcribe(&too_long).is_err());
        engine.shutdown();
    }

    #[test]
    fn transcribe_returns_non_empty_result_for_tone() {
        let engine = Engine::new(EngineConfig::default(), StubBackend::new(), None, None);
        engine.initialize("model.bin", 2).unwrap();
        let tone = vec![0.1f32; 16_000 * 2];
        let result = engine.transcribe(&tone).unwrap();
        assert!(!result.is_partial);
        assert!(result.confidence > 0.0);
        engine.shutdown();
    }

    #[test]
    fn streaming_lifecycle_runs_without_panicking() {
        let engine = Engine::new(EngineConfig::default(), StubBackend::new(), None, None);
        engine.initialize("model.bin", 2).unwrap();
        engine.start_streaming(1, None).unwrap();
        engine.add_audio_chunk(1, &vec![0.05f32; 16_000]);
        engine.finalize_streaming(1);
        std::thread::sleep(std::time::Duration::from_millis(50));
        engine.shutdown();
    }
}
