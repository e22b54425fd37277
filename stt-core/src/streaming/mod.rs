//! Streaming transcription coordinator (C5) — the heart of the system.
//!
//! Owns `StreamingState` per active utterance, decides when to fire partial
//! vs. final inferences, and gates which results actually get emitted.
//! Inference itself is dispatched onto the shared [`TaskQueue`] so `add_chunk`
//! never blocks the ingest thread on a synchronous model call (§5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::buffer::AudioBufferManager;
use crate::confidence::{build_transcription_result, ConfidenceOptions, StreamingFusion};
use crate::inference::{InferenceParams, ModelHandle};
use crate::queue::{Priority, TaskQueue};
use crate::types::{TranscriptionResult, UtteranceId};

/// Per-utterance policy knobs (§3 `StreamingState`, §4.5 trigger/gate constants).
#[derive(Debug, Clone)]
pub struct StreamingPolicy {
    pub min_samples: usize,
    pub transcription_interval_ms: u64,
    pub min_chunk_ms: u64,
    pub incremental_updates_enabled: bool,
    pub min_text_length: usize,
    pub similarity_threshold: f32,
    pub min_update_interval_ms: u64,
    pub max_update_frequency: f32,
    pub normalize_trim: bool,
    pub normalize_collapse_whitespace: bool,
    pub normalize_lowercase: bool,
    pub normalize_remove_punctuation: bool,
}

impl Default for StreamingPolicy {
    fn default() -> Self {
        Self {
            min_samples: 16_000,
            transcription_interval_ms: 1_000,
            min_chunk_ms: 250,
            incremental_updates_enabled: true,
            min_text_length: 3,
            similarity_threshold: 0.8,
            min_update_interval_ms: 100,
            max_update_frequency: 10.0,
            normalize_trim: true,
            normalize_collapse_whitespace: true,
            normalize_lowercase: false,
            normalize_remove_punctuation: false,
        }
    }
}

const PARTIAL_READ_SAMPLES: usize = 32_000; // ~2s @ 16kHz (§4.5)

struct StreamingState {
    policy: StreamingPolicy,
    last_sent_text: String,
    last_sent_time: Option<Instant>,
    last_partial_time: Option<Instant>,
    total_samples: u64,
    processed_samples: u64,
    transcription_count: u32,
    start_time: Instant,
    active: bool,
}

impl StreamingState {
    fn new(policy: StreamingPolicy) -> Self {
        Self {
            policy,
            last_sent_text: String::new(),
            last_sent_time: None,
            last_partial_time: None,
            total_samples: 0,
            processed_samples: 0,
            transcription_count: 0,
            start_time: Instant::now(),
            active: true,
        }
    }

    fn unprocessed_samples(&self) -> u64 {
        self.total_samples.saturating_sub(self.processed_samples)
    }

    fn should_fire_partial(&self) -> bool {
        if !self.active {
            return false;
        }
        let since_last = self.last_partial_time.map(|t| t.elapsed().as_millis() as u64).unwrap_or(u64::MAX);
        if since_last < self.policy.transcription_interval_ms {
            return false;
        }
        let min_chunk_samples = 16_000 * self.policy.min_chunk_ms / 1_000;
        self.unprocessed_samples() >= self.policy.min_samples as u64
            && self.unprocessed_samples() >= min_chunk_samples
    }
}

fn normalize(text: &str, policy: &StreamingPolicy) -> String {
    let mut s = text.to_string();
    if policy.normalize_trim {
        s = s.trim().to_string();
    }
    if policy.normalize_collapse_whitespace {
        s = s.split_whitespace().collect::<Vec<_>>().join(" ");
    }
    if policy.normalize_lowercase {
        s = s.to_lowercase();
    }
    if policy.normalize_remove_punctuation {
        s = s.chars().filter(|c| !c.is_ascii_punctuation()).collect();
    }
    s
}

fn levenshtein_chars(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (m, n) = (a.len(), b.len());
    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];
    for i in 1..=m {
        curr[0] = i;
        for j in 1..=n {
            curr[j] = if a[i - 1] == b[j - 1] {
                prev[j - 1]
            } else {
                1 + prev[j - 1].min(prev[j]).min(curr[j - 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[n]
}

/// §4.5: `1 - levenshtein(a, b) / max(|a|, |b|)`.
pub fn text_similarity(a: &str, b: &str) -> f32 {
    let denom = a.chars().count().max(b.chars().count());
    if denom == 0 {
        return 1.0;
    }
    1.0 - (levenshtein_chars(a, b) as f32 / denom as f32)
}

fn should_emit(state: &StreamingState, result: &TranscriptionResult) -> bool {
    if !result.is_partial {
        return true;
    }
    if !state.policy.incremental_updates_enabled {
        return false;
    }
    let normalized = normalize(&result.text, &state.policy);
    if normalized.chars().count() < state.policy.min_text_length {
        return false;
    }
    if normalized == state.last_sent_text {
        return false;
    }
    if text_similarity(&normalized, &state.last_sent_text) >= state.policy.similarity_threshold {
        return false;
    }
    if let Some(last) = state.last_sent_time {
        let elapsed = last.elapsed().as_millis() as u64;
        if elapsed < state.policy.min_update_interval_ms {
            return false;
        }
        let min_interval_for_rate = (1000.0 / state.policy.max_update_frequency) as u64;
        if elapsed < min_interval_for_rate {
            return false;
        }
    }
    true
}

struct Inner {
    buffer: Arc<AudioBufferManager>,
    backend: ModelHandle,
    queue: TaskQueue,
    confidence_opts: Mutex<ConfidenceOptions>,
    base_params: Mutex<InferenceParams>,
    sender: broadcast::Sender<TranscriptionResult>,
    states: Mutex<HashMap<UtteranceId, StreamingState>>,
}

#[derive(Clone)]
pub struct StreamingCoordinator(Arc<Inner>);

impl StreamingCoordinator {
    pub fn new(
        buffer: Arc<AudioBufferManager>,
        backend: ModelHandle,
        queue: TaskQueue,
        confidence_opts: ConfidenceOptions,
    ) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self(Arc::new(Inner {
            buffer,
            backend,
            queue,
            confidence_opts: Mutex::new(confidence_opts),
            base_params: Mutex::new(InferenceParams::default()),
            sender,
            states: Mutex::new(HashMap::new()),
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptionResult> {
        self.0.sender.subscribe()
    }

    /// Replaces the confidence options used for every future inference build.
    pub fn set_confidence_options(&self, opts: ConfidenceOptions) {
        *self.0.confidence_opts.lock() = opts;
    }

    /// Replaces the base inference parameters (language, temperature, etc.);
    /// `partial_mode` is overridden per call regardless of what's stored here.
    pub fn set_base_params(&self, params: InferenceParams) {
        *self.0.base_params.lock() = params;
    }

    pub fn start(&self, utterance_id: UtteranceId, policy: StreamingPolicy) {
        self.0.buffer.create(utterance_id, None);
        self.0.states.lock().insert(utterance_id, StreamingState::new(policy));
    }

    pub fn add_chunk(&self, utterance_id: UtteranceId, samples: &[f32]) {
        self.0.buffer.add(utterance_id, samples);
        let fire = {
            let mut states = self.0.states.lock();
            if let Some(state) = states.get_mut(&utterance_id) {
                state.total_samples += samples.len() as u64;
                if state.should_fire_partial() {
                    state.last_partial_time = Some(Instant::now());
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        if fire {
            self.dispatch_partial(utterance_id);
        }
    }

    fn dispatch_partial(&self, utterance_id: UtteranceId) {
        let this = self.clone();
        self.0.queue.enqueue_fn(Priority::Normal, move || this.run_partial(utterance_id));
    }

    fn run_partial(&self, utterance_id: UtteranceId) {
        let pcm = self.0.buffer.read_recent(utterance_id, PARTIAL_READ_SAMPLES);
        if pcm.is_empty() {
            return;
        }
        let start = std::time::Instant::now();
        let mut params = self.0.base_params.lock().clone();
        params.partial_mode = true;
        let raw = {
            let mut backend = self.0.backend.0.lock();
            backend.set_params(params.clone());
            match backend.infer(&pcm, &params) {
                Ok(raw) => raw,
                Err(e) => {
                    debug!(utterance_id, error = %e, "partial inference failed");
                    return;
                }
            }
        };
        let latency_ms = start.elapsed().as_secs_f32() * 1000.0;

        let mut states = self.0.states.lock();
        let Some(state) = states.get_mut(&utterance_id) else { return };
        if !state.active {
            return;
        }
        let start_time_ms = 0;
        let end_time_ms = state.start_time.elapsed().as_millis() as u64;
        let fusion = StreamingFusion {
            streaming_duration_ms: end_time_ms,
            processed_samples: state.processed_samples,
            total_samples: state.total_samples,
        };
        drop(states);

        let opts = self.0.confidence_opts.lock().clone();
        let result = build_transcription_result(
            utterance_id,
            &raw,
            &pcm,
            true,
            start_time_ms,
            end_time_ms,
            latency_ms,
            &opts,
            Some(&fusion),
        );

        let mut states = self.0.states.lock();
        let Some(state) = states.get_mut(&utterance_id) else { return };
        state.processed_samples = state.total_samples;
        state.transcription_count += 1;
        let emit = should_emit(state, &result);
        if emit {
            state.last_sent_text = normalize(&result.text, &state.policy);
            state.last_sent_time = Some(Instant::now());
        }
        drop(states);

        if emit {
            let _ = self.0.sender.send(result);
        }
    }

    pub fn finalize(&self, utterance_id: UtteranceId) {
        let this = self.clone();
        self.0.queue.enqueue_fn(Priority::High, move || this.run_final(utterance_id));
    }

    fn run_final(&self, utterance_id: UtteranceId) {
        self.0.buffer.finalize(utterance_id);
        let pcm = self.0.buffer.read_all(utterance_id);
        let start = std::time::Instant::now();
        let mut params = self.0.base_params.lock().clone();
        params.partial_mode = false;
        let raw = {
            let mut backend = self.0.backend.0.lock();
            backend.set_params(params.clone());
            match backend.infer(&pcm, &params) {
                Ok(raw) => raw,
                Err(e) => {
                    debug!(utterance_id, error = %e, "final inference failed");
                    return;
                }
            }
        };
        let latency_ms = start.elapsed().as_secs_f32() * 1000.0;

        let (end_time_ms, fusion) = {
            let states = self.0.states.lock();
            match states.get(&utterance_id) {
                Some(s) => {
                    let end_time_ms = s.start_time.elapsed().as_millis() as u64;
                    let fusion = StreamingFusion {
                        streaming_duration_ms: end_time_ms,
                        processed_samples: s.processed_samples,
                        total_samples: s.total_samples,
                    };
                    (end_time_ms, fusion)
                }
                None => (0, StreamingFusion::default()),
            }
        };

        let opts = self.0.confidence_opts.lock().clone();
        let result = build_transcription_result(
            utterance_id, &raw, &pcm, false, 0, end_time_ms, latency_ms, &opts, Some(&fusion),
        );

        self.0.states.lock().remove(&utterance_id);
        if !result.text.is_empty() {
            let _ = self.0.sender.send(result);
        }
    }

    /// Aborts without emitting a final result.
    pub fn stop(&self, utterance_id: UtteranceId) {
        self.0.states.lock().remove(&utterance_id);
        self.0.buffer.set_active(utterance_id, false);
    }

    pub fn stop_all(&self) {
        let ids: Vec<UtteranceId> = self.0.states.lock().keys().copied().collect();
        for id in ids {
            self.stop(id);
        }
    }

    pub fn is_streaming(&self, utterance_id: UtteranceId) -> bool {
        self.0.states.lock().contains_key(&utterance_id)
    }

    pub fn active_count(&self) -> usize {
        self.0.states.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_similarity_is_one() {
        assert_eq!(text_similarity("hello", "hello"), 1.0);
    }

    #[test]
    fn completely_different_text_has_low_similarity() {
        let sim = text_similarity("abc", "xyz");
        assert!(sim < 0.5);
    }

    #[test]
    fn should_fire_partial_requires_minimum_samples_and_interval() {
        let mut state = StreamingState::new(StreamingPolicy::default());
        assert!(!state.should_fire_partial());
        state.total_samples = 16_000;
        state.last_partial_time = None;
        assert!(state.should_fire_partial());
        state.last_partial_time = Some(Instant::now());
        assert!(!state.should_fire_partial());
    }

    #[test]
    fn normalize_trims_and_collapses_whitespace() {
        let policy = StreamingPolicy::default();
        assert_eq!(normalize("  hello   world  ", &policy), "hello world");
    }
}
