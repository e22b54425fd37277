//! Shared data model (§3): the value types every component passes around.
//!
//! Owning component for each type is noted on the type itself; everyone else
//! references an utterance or session only by id.

use serde::{Deserialize, Serialize};

/// A single speech segment, identified by a monotonic id unique within the process.
pub type UtteranceId = u32;

/// A word-level timing tuple produced by the confidence engine.
///
/// Invariants (enforced by [`crate::confidence::enforce_word_timing_consistency`]):
/// `end_ms >= start_ms + 50`, `end_ms - start_ms <= 5000`, and timings within a
/// single result are sorted and non-overlapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordTiming {
    pub word: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub confidence: f32,
}

impl WordTiming {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// Bucketed assessment of a transcription's reliability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    High,
    Medium,
    Low,
    Rejected,
    Failed,
}

/// Signal-level quality diagnostics computed alongside confidence (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetrics {
    pub snr_db: f32,
    pub clarity: f32,
    pub background_noise: bool,
    pub processing_latency_ms: f32,
    pub avg_token_probability: f32,
    pub no_speech_probability: f32,
}

impl Default for QualityMetrics {
    fn default() -> Self {
        Self {
            snr_db: 0.0,
            clarity: 0.0,
            background_noise: false,
            processing_latency_ms: 0.0,
            avg_token_probability: 0.0,
            no_speech_probability: 0.0,
        }
    }
}

/// The result of one inference call, partial or final.
///
/// Owned transiently by whichever component produced it; no component holds
/// these long-term (the streaming coordinator emits and forgets).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionResult {
    pub utterance_id: UtteranceId,
    pub text: String,
    pub confidence: f32,
    pub is_partial: bool,
    pub start_time_ms: u64,
    pub end_time_ms: u64,
    pub detected_language: Option<String>,
    pub language_confidence: Option<f32>,
    pub language_changed: bool,
    pub word_timings: Vec<WordTiming>,
    pub quality_level: QualityLevel,
    pub meets_confidence_threshold: bool,
    pub quality: QualityMetrics,
}

impl TranscriptionResult {
    pub fn empty_failed(utterance_id: UtteranceId, start_time_ms: u64, end_time_ms: u64) -> Self {
        Self {
            utterance_id,
            text: String::new(),
            confidence: 0.0,
            is_partial: false,
            start_time_ms,
            end_time_ms,
            detected_language: None,
            language_confidence: None,
            language_changed: false,
            word_timings: Vec::new(),
            quality_level: QualityLevel::Failed,
            meets_confidence_threshold: false,
            quality: QualityMetrics::default(),
        }
    }
}

/// Raw output from the inference backend before confidence enrichment (§4.3).
#[derive(Debug, Clone, Default)]
pub struct RawInferenceOutput {
    pub segments: Vec<RawSegment>,
}

#[derive(Debug, Clone, Default)]
pub struct RawSegment {
    pub text: String,
    pub tokens: Vec<RawToken>,
    pub no_speech_prob: f32,
    pub detected_language_probs: Vec<(String, f32)>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RawToken {
    pub probability: f32,
    pub timestamp_probability: f32,
    /// 10ms units, as the external inference library reports them (§4.3 contract).
    pub start_10ms: u32,
    pub end_10ms: u32,
    pub is_text: bool,
}
