//! Pipeline orchestrator (C8): STT result → optional language detection →
//! confidence gate → optional multi-candidate translation.
//!
//! The language detector and translator are external collaborators (§1);
//! they are expressed as traits so the orchestrator stays decoupled from any
//! concrete implementation, the same seam [`crate::inference::WhisperBackend`]
//! provides for the inference library.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::queue::{Priority, TaskQueue};
use crate::types::{TranscriptionResult, UtteranceId};

pub trait LanguageDetector: Send + Sync {
    fn detect(&self, text: &str) -> DetectionResult;
}

#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub language: String,
    pub confidence: f32,
    pub reliable: bool,
}

pub trait Translator: Send + Sync {
    fn translate(&self, text: &str, target_lang: &str) -> Result<TranslationOutcome, String>;
}

#[derive(Debug, Clone)]
pub struct TranslationOutcome {
    pub text: String,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub min_transcription_confidence: f32,
    pub language_detection_enabled: bool,
    pub language_detection_confidence_threshold: f32,
    pub auto_language_switching: bool,
    pub candidate_confidence_threshold: f32,
    pub max_transcription_candidates: usize,
    pub max_concurrent_translations: usize,
    pub language_cache_ttl_ms: u64,
    pub translation_timeout_ms: u64,
    pub enable_automatic_translation: bool,
    pub enable_preliminary_translation: bool,
    pub enable_fallback_translation: bool,
    pub notify_language_changes: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_transcription_confidence: 0.6,
            language_detection_enabled: true,
            language_detection_confidence_threshold: 0.7,
            auto_language_switching: false,
            candidate_confidence_threshold: 0.5,
            max_transcription_candidates: 3,
            max_concurrent_translations: 10,
            language_cache_ttl_ms: 30_000,
            translation_timeout_ms: 5_000,
            enable_automatic_translation: true,
            enable_preliminary_translation: false,
            enable_fallback_translation: true,
            notify_language_changes: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Created,
    Transcription,
    LanguageDetection,
    TranslationEvaluation,
    Translation,
    Complete,
    Error,
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    TranscriptionComplete { utterance_id: UtteranceId },
    LanguageDetectionComplete { utterance_id: UtteranceId, language: String, confidence: f32 },
    LanguageChange { utterance_id: UtteranceId, old: String, new: String, confidence: f32 },
    TranslationComplete { utterance_id: UtteranceId, text: String, confidence: f32 },
    PipelineError { utterance_id: UtteranceId, stage: &'static str, message: String },
}

struct PipelineOperation {
    session_id: String,
    start_time: Instant,
    active: bool,
    stage: Stage,
}

struct CacheEntry {
    result: DetectionResult,
    inserted_at: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineStats {
    pub transcriptions: u64,
    pub detections: u64,
    pub language_changes: u64,
    pub cache_hits: u64,
    pub translations_triggered: u64,
    pub confidence_gate_rejections_transcription: u64,
    pub confidence_gate_rejections_language: u64,
    pub translations_succeeded: u64,
    pub translations_failed: u64,
}

struct RollingAverage {
    window: VecDeque<f32>,
}

impl RollingAverage {
    const CAPACITY: usize = 100;

    fn new() -> Self {
        Self { window: VecDeque::with_capacity(Self::CAPACITY) }
    }

    fn push(&mut self, v: f32) {
        if self.window.len() >= Self::CAPACITY {
            self.window.pop_front();
        }
        self.window.push_back(v);
    }

    fn average(&self) -> f32 {
        if self.window.is_empty() {
            0.0
        } else {
            self.window.iter().sum::<f32>() / self.window.len() as f32
        }
    }
}

type GateCallback = Arc<dyn Fn(&TranscriptionResult) -> bool + Send + Sync>;

struct Inner {
    config: PipelineConfig,
    /// Live-settable mirrors of `config`'s language-detection knobs (§6 setters);
    /// `config` itself stays the immutable construction-time baseline.
    language_detection_enabled: AtomicBool,
    language_detection_confidence_threshold: Mutex<f32>,
    auto_language_switching: AtomicBool,
    detector: Option<Arc<dyn LanguageDetector>>,
    translator: Option<Arc<dyn Translator>>,
    queue: TaskQueue,
    operations: Mutex<HashMap<UtteranceId, PipelineOperation>>,
    language_cache: Mutex<HashMap<(String, u64), CacheEntry>>,
    session_languages: Mutex<HashMap<String, String>>,
    stats: Mutex<PipelineStats>,
    translation_latency: Mutex<RollingAverage>,
    detection_latency: Mutex<RollingAverage>,
    gate_callback: Mutex<Option<GateCallback>>,
    sender: broadcast::Sender<PipelineEvent>,
    seq: AtomicU64,
}

#[derive(Clone)]
pub struct PipelineOrchestrator(Arc<Inner>);

fn text_hash(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

impl PipelineOrchestrator {
    pub fn new(
        config: PipelineConfig,
        detector: Option<Arc<dyn LanguageDetector>>,
        translator: Option<Arc<dyn Translator>>,
        queue: TaskQueue,
    ) -> Self {
        let (sender, _) = broadcast::channel(256);
        let language_detection_enabled = AtomicBool::new(config.language_detection_enabled);
        let language_detection_confidence_threshold = Mutex::new(config.language_detection_confidence_threshold);
        let auto_language_switching = AtomicBool::new(config.auto_language_switching);
        Self(Arc::new(Inner {
            config,
            language_detection_enabled,
            language_detection_confidence_threshold,
            auto_language_switching,
            detector,
            translator,
            queue,
            operations: Mutex::new(HashMap::new()),
            language_cache: Mutex::new(HashMap::new()),
            session_languages: Mutex::new(HashMap::new()),
            stats: Mutex::new(PipelineStats::default()),
            translation_latency: Mutex::new(RollingAverage::new()),
            detection_latency: Mutex::new(RollingAverage::new()),
            gate_callback: Mutex::new(None),
            sender,
            seq: AtomicU64::new(0),
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.0.sender.subscribe()
    }

    pub fn set_confidence_gate(&self, callback: impl Fn(&TranscriptionResult) -> bool + Send + Sync + 'static) {
        *self.0.gate_callback.lock() = Some(Arc::new(callback));
    }

    pub fn set_language_detection_enabled(&self, enabled: bool) {
        self.0.language_detection_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_language_detection_threshold(&self, threshold: f32) {
        *self.0.language_detection_confidence_threshold.lock() = threshold.clamp(0.0, 1.0);
    }

    pub fn set_auto_language_switching(&self, enabled: bool) {
        self.0.auto_language_switching.store(enabled, Ordering::SeqCst);
    }

    pub fn stats(&self) -> PipelineStats {
        *self.0.stats.lock()
    }

    pub fn avg_translation_latency_ms(&self) -> f32 {
        self.0.translation_latency.lock().average()
    }

    pub fn avg_language_detection_latency_ms(&self) -> f32 {
        self.0.detection_latency.lock().average()
    }

    /// Returns `false` (rejecting the operation) when at capacity (§4.8
    /// concurrency cap).
    pub fn process_transcription(
        &self,
        utterance_id: UtteranceId,
        session_id: impl Into<String>,
        result: TranscriptionResult,
        candidates: Vec<TranscriptionResult>,
    ) -> bool {
        let session_id = session_id.into();
        {
            let mut ops = self.0.operations.lock();
            if !ops.contains_key(&utterance_id) && ops.len() >= self.0.config.max_concurrent_translations {
                return false;
            }
            ops.insert(
                utterance_id,
                PipelineOperation { session_id: session_id.clone(), start_time: Instant::now(), active: true, stage: Stage::Created },
            );
        }
        self.0.stats.lock().transcriptions += 1;

        let this = self.clone();
        self.0.queue.enqueue_fn(Priority::High, move || {
            this.run(utterance_id, session_id, result, candidates);
        });
        true
    }

    pub fn cancel(&self, utterance_id: UtteranceId) {
        let mut ops = self.0.operations.lock();
        if let Some(op) = ops.get_mut(&utterance_id) {
            op.active = false;
            op.stage = Stage::Cancelled;
        }
        ops.remove(&utterance_id);
    }

    fn is_active(&self, utterance_id: UtteranceId) -> bool {
        self.0.operations.lock().get(&utterance_id).map(|op| op.active).unwrap_or(false)
    }

    fn set_stage(&self, utterance_id: UtteranceId, stage: Stage) {
        if let Some(op) = self.0.operations.lock().get_mut(&utterance_id) {
            op.stage = stage;
        }
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.0.sender.send(event);
    }

    fn run(&self, utterance_id: UtteranceId, session_id: String, result: TranscriptionResult, mut candidates: Vec<TranscriptionResult>) {
        self.set_stage(utterance_id, Stage::Transcription);
        self.emit(PipelineEvent::TranscriptionComplete { utterance_id });

        if !self.is_active(utterance_id) {
            return;
        }

        let mut result = result;
        let should_detect = self.0.language_detection_enabled.load(Ordering::SeqCst)
            && self.0.detector.is_some()
            && result.text.chars().count() >= 10
            && result.confidence >= self.0.config.min_transcription_confidence;

        if should_detect {
            self.set_stage(utterance_id, Stage::LanguageDetection);
            if let Some(detection) = self.detect_language(&session_id, &result.text) {
                self.emit(PipelineEvent::LanguageDetectionComplete {
                    utterance_id,
                    language: detection.language.clone(),
                    confidence: detection.confidence,
                });

                let passes = detection.confidence >= *self.0.language_detection_confidence_threshold.lock()
                    && detection.reliable;

                if passes && self.0.auto_language_switching.load(Ordering::SeqCst) {
                    let mut sessions = self.0.session_languages.lock();
                    let current = sessions.get(&session_id).cloned();
                    if current.as_deref() != Some(detection.language.as_str()) {
                        let old = current.unwrap_or_else(|| "auto".to_string());
                        sessions.insert(session_id.clone(), detection.language.clone());
                        drop(sessions);
                        self.0.stats.lock().language_changes += 1;
                        result.language_changed = true;
                        if self.0.config.notify_language_changes {
                            self.emit(PipelineEvent::LanguageChange {
                                utterance_id,
                                old,
                                new: detection.language.clone(),
                                confidence: detection.confidence,
                            });
                        }
                    }
                }
                if !passes {
                    self.0.stats.lock().confidence_gate_rejections_language += 1;
                }
                result.detected_language = Some(detection.language);
                result.language_confidence = Some(detection.confidence);
            }
        }

        if !self.is_active(utterance_id) {
            return;
        }

        self.set_stage(utterance_id, Stage::TranslationEvaluation);
        let gate_passes = result.confidence >= self.0.config.min_transcription_confidence
            && result.meets_confidence_threshold
            && result.text.chars().count() >= 3
            && result.language_confidence.map(|c| c >= 0.5).unwrap_or(true);

        let final_decision = match self.0.gate_callback.lock().as_ref() {
            Some(cb) => cb(&result),
            None => gate_passes,
        };

        if !final_decision {
            self.0.stats.lock().confidence_gate_rejections_transcription += 1;
            self.finish(utterance_id, Stage::Complete);
            return;
        }

        if !self.0.config.enable_automatic_translation {
            self.finish(utterance_id, Stage::Complete);
            return;
        }

        self.set_stage(utterance_id, Stage::Translation);
        self.0.stats.lock().translations_triggered += 1;

        let Some(translator) = self.0.translator.clone() else {
            self.emit(PipelineEvent::PipelineError { utterance_id, stage: "translation", message: "no translator configured".into() });
            self.0.stats.lock().translations_failed += 1;
            self.finish(utterance_id, Stage::Error);
            return;
        };

        let target_lang = result.detected_language.clone().unwrap_or_else(|| "en".to_string());
        let outcome = if !candidates.is_empty() {
            candidates.retain(|c| c.confidence >= self.0.config.candidate_confidence_threshold);
            candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
            candidates.truncate(self.0.config.max_transcription_candidates);
            let mut best: Option<TranslationOutcome> = None;
            for candidate in &candidates {
                if let Ok(t) = translator.translate(&candidate.text, &target_lang) {
                    if best.as_ref().map(|b| t.confidence > b.confidence).unwrap_or(true) {
                        best = Some(t);
                    }
                }
            }
            match best {
                Some(t) => Ok(t),
                None if self.0.config.enable_fallback_translation => translator.translate(&result.text, &target_lang),
                None => Err("no candidate translated successfully".to_string()),
            }
        } else {
            translator.translate(&result.text, &target_lang)
        };

        let start = Instant::now();
        match outcome {
            Ok(t) => {
                self.0.translation_latency.lock().push(start.elapsed().as_secs_f32() * 1000.0);
                self.0.stats.lock().translations_succeeded += 1;
                self.emit(PipelineEvent::TranslationComplete { utterance_id, text: t.text, confidence: t.confidence });
                self.finish(utterance_id, Stage::Complete);
            }
            Err(message) => {
                self.0.stats.lock().translations_failed += 1;
                self.emit(PipelineEvent::PipelineError { utterance_id, stage: "translation", message });
                self.finish(utterance_id, Stage::Error);
            }
        }
    }

    fn detect_language(&self, session_id: &str, text: &str) -> Option<DetectionResult> {
        let key = (session_id.to_string(), text_hash(text));
        {
            let mut cache = self.0.language_cache.lock();
            if let Some(entry) = cache.get(&key) {
                if entry.inserted_at.elapsed() < Duration::from_millis(self.0.config.language_cache_ttl_ms) {
                    self.0.stats.lock().cache_hits += 1;
                    return Some(entry.result.clone());
                }
                cache.remove(&key);
            }
        }
        let detector = self.0.detector.as_ref()?;
        let start = Instant::now();
        let detection = detector.detect(text);
        self.0.detection_latency.lock().push(start.elapsed().as_secs_f32() * 1000.0);
        self.0.stats.lock().detections += 1;
        self.0
            .language_cache
            .lock()
            .insert(key, CacheEntry { result: detection.clone(), inserted_at: Instant::now() });
        Some(detection)
    }

    fn finish(&self, utterance_id: UtteranceId, stage: Stage) {
        debug!(utterance_id, ?stage, "pipeline operation finished");
        self.0.operations.lock().remove(&utterance_id);
    }

    pub fn active_operation_count(&self) -> usize {
        self.0.operations.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{QualityLevel, QualityMetrics};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    fn sample_result(confidence: f32, meets: bool) -> TranscriptionResult {
        TranscriptionResult {
            utterance_id: 1,
            text: "hello there friend".to_string(),
            confidence,
            is_partial: false,
            start_time_ms: 0,
            end_time_ms: 1000,
            detected_language: None,
            language_confidence: None,
            language_changed: false,
            word_timings: vec![],
            quality_level: QualityLevel::Medium,
            meets_confidence_threshold: meets,
            quality: QualityMetrics::default(),
        }
    }

    struct StubTranslator;
    impl Translator for StubTranslator {
        fn translate(&self, text: &str, _target_lang: &str) -> Result<TranslationOutcome, String> {
            Ok(TranslationOutcome { text: format!("[t] {text}"), confidence: 0.9 })
        }
    }

    fn drain(queue: &TaskQueue) {
        std::thread::sleep(StdDuration::from_millis(20));
        while queue.try_dequeue().is_some() {}
    }

    #[test]
    fn confidence_gate_rejection_does_not_trigger_translation() {
        let queue = TaskQueue::new();
        let orch = PipelineOrchestrator::new(PipelineConfig::default(), None, Some(Arc::new(StubTranslator)), queue.clone());
        let result = sample_result(0.5, false);
        orch.process_transcription(1, "s1", result, vec![]);
        drain(&queue);
        let stats = orch.stats();
        assert_eq!(stats.translations_triggered, 0);
        assert_eq!(stats.confidence_gate_rejections_transcription, 1);
    }

    #[test]
    fn passing_result_triggers_translation() {
        let queue = TaskQueue::new();
        let orch = PipelineOrchestrator::new(PipelineConfig::default(), None, Some(Arc::new(StubTranslator)), queue.clone());
        let result = sample_result(0.9, true);
        orch.process_transcription(1, "s1", result, vec![]);
        drain(&queue);
        let stats = orch.stats();
        assert_eq!(stats.translations_triggered, 1);
        assert_eq!(stats.translations_succeeded, 1);
    }

    #[test]
    fn rejects_new_operations_over_concurrency_cap() {
        let queue = TaskQueue::new();
        let cfg = PipelineConfig { max_concurrent_translations: 1, ..PipelineConfig::default() };
        let orch = PipelineOrchestrator::new(cfg, None, Some(Arc::new(StubTranslator)), queue.clone());
        // Fill capacity without draining the queue so operation 1 stays "active".
        assert!(orch.process_transcription(1, "s1", sample_result(0.9, true), vec![]));
        let accepted = orch.process_transcription(2, "s1", sample_result(0.9, true), vec![]);
        assert!(!accepted);
        drain(&queue);
    }

    #[test]
    fn user_gate_callback_overrides_default_decision() {
        let queue = TaskQueue::new();
        let orch = PipelineOrchestrator::new(PipelineConfig::default(), None, Some(Arc::new(StubTranslator)), queue.clone());
        let called = Arc::new(AtomicUsize::new(0));
        let called2 = called.clone();
        orch.set_confidence_gate(move |_r| {
            called2.fetch_add(1, Ordering::SeqCst);
            false
        });
        orch.process_transcription(1, "s1", sample_result(0.9, true), vec![]);
        drain(&queue);
        assert_eq!(called.load(Ordering::SeqCst), 1);
        assert_eq!(orch.stats().translations_triggered, 0);
    }
}
