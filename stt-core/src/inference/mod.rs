//! Inference backend adapter (C3).
//!
//! The external Whisper library is a black box providing `load`/`infer`;
//! `WhisperBackend` is the seam that decouples the rest of this crate from
//! any particular implementation of it (§9 "dynamic dispatch over engines").
//!
//! `&mut self` on `infer` expresses that decoder contexts are stateful and
//! not safely shared across threads (§5) — all mutation is serialised
//! through `ModelHandle`'s `parking_lot::Mutex`, one per quantization level.

pub mod stub;

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::quantization::QuantizationLevel;
use crate::types::RawInferenceOutput;

/// Per-call inference configuration (§4.3 `set_params`).
#[derive(Debug, Clone)]
pub struct InferenceParams {
    pub n_threads: usize,
    pub translate_to_english: bool,
    pub temperature: f32,
    pub max_tokens: usize,
    /// `None` means "auto-detect".
    pub language: Option<String>,
    /// Forces single-segment, no prior context, no offset (§4.3).
    pub partial_mode: bool,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            n_threads: 4,
            translate_to_english: false,
            temperature: 0.0,
            max_tokens: 224,
            language: None,
            partial_mode: false,
        }
    }
}

/// Result of `validate` (§4.3): sanity metadata about a loaded model.
#[derive(Debug, Clone)]
pub struct ModelValidation {
    pub model_type: String,
    pub vocab_size: usize,
    pub audio_context_frames: usize,
}

/// Per-call audio length caps (§6): 30s full, 10s live/partial at 16kHz.
pub const FULL_AUDIO_CAP_SAMPLES: usize = 30 * 16_000;
pub const PARTIAL_AUDIO_CAP_SAMPLES: usize = 10 * 16_000;

/// Minimum sane vocabulary size (§4.3 load errors).
pub const MIN_VOCAB_SIZE: usize = 1_000;

/// Contract for a Whisper-family inference backend.
pub trait WhisperBackend: Send + 'static {
    /// Loads a model at the given quantization level. On GPU failure the
    /// adapter does not silently fall back to CPU — that decision belongs to
    /// the caller (C5/C6).
    fn load(&mut self, path: &Path, level: QuantizationLevel, use_gpu: bool, gpu_id: u32) -> Result<()>;

    /// Runs inference over `pcm` (mono f32 @ 16kHz), respecting `params`.
    fn infer(&mut self, pcm: &[f32], params: &InferenceParams) -> Result<RawInferenceOutput>;

    fn unload(&mut self);

    fn set_params(&mut self, params: InferenceParams);

    fn validate(&self) -> Result<ModelValidation>;
}

/// Thread-safe reference-counted handle to any `WhisperBackend` implementor.
///
/// `parking_lot::Mutex` is non-poisoning on panic and cheaper uncontended
/// than `std::sync::Mutex`, matching how decoder contexts are serialized.
#[derive(Clone)]
pub struct ModelHandle(pub Arc<Mutex<dyn WhisperBackend>>);

impl ModelHandle {
    pub fn new<M: WhisperBackend>(backend: M) -> Self {
        Self(Arc::new(Mutex::new(backend)))
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").finish_non_exhaustive()
    }
}
