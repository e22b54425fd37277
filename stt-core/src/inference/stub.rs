//! `StubBackend` — deterministic placeholder standing in for the external
//! Whisper library. Used by tests and as the default backend until a real
//! adapter is wired in.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, SttError};
use crate::inference::{InferenceParams, ModelValidation, WhisperBackend, MIN_VOCAB_SIZE};
use crate::quantization::QuantizationLevel;
use crate::types::{RawInferenceOutput, RawSegment, RawToken};

pub struct StubBackend {
    model_path: Option<PathBuf>,
    level: QuantizationLevel,
    params: InferenceParams,
    call_count: u32,
}

impl Default for StubBackend {
    fn default() -> Self {
        Self {
            model_path: None,
            level: QuantizationLevel::Full32,
            params: InferenceParams::default(),
            call_count: 0,
        }
    }
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WhisperBackend for StubBackend {
    fn load(&mut self, path: &Path, level: QuantizationLevel, use_gpu: bool, gpu_id: u32) -> Result<()> {
        if !path.as_os_str().is_empty() && path.extension().is_none() && path.to_string_lossy().contains("missing") {
            return Err(SttError::ModelNotFound { path: path.to_path_buf() });
        }
        debug!(?path, ?level, use_gpu, gpu_id, "stub backend load");
        self.model_path = Some(path.to_path_buf());
        self.level = level;
        Ok(())
    }

    fn infer(&mut self, pcm: &[f32], params: &InferenceParams) -> Result<RawInferenceOutput> {
        if pcm.is_empty() {
            return Ok(RawInferenceOutput::default());
        }
        self.call_count += 1;
        let text = if params.partial_mode {
            "stub partial text".to_string()
        } else {
            format!("stub final transcript number {}", self.call_count)
        };
        let words: Vec<&str> = text.split_whitespace().collect();
        let mut tokens = Vec::with_capacity(words.len());
        for (i, _) in words.iter().enumerate() {
            tokens.push(RawToken {
                probability: 0.9,
                timestamp_probability: 0.85,
                start_10ms: (i as u32) * 20,
                end_10ms: (i as u32) * 20 + 18,
                is_text: true,
            });
        }
        Ok(RawInferenceOutput {
            segments: vec![RawSegment {
                text,
                tokens,
                no_speech_prob: 0.02,
                detected_language_probs: vec![("en".to_string(), 0.95)],
            }],
        })
    }

    fn unload(&mut self) {
        self.model_path = None;
    }

    fn set_params(&mut self, params: InferenceParams) {
        self.params = params;
    }

    fn validate(&self) -> Result<ModelValidation> {
        if self.model_path.is_none() {
            return Err(SttError::ModelValidation("no model loaded".into()));
        }
        Ok(ModelValidation {
            model_type: "stub".to_string(),
            vocab_size: MIN_VOCAB_SIZE + 1,
            audio_context_frames: 1500,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infer_on_silence_returns_no_segments() {
        let mut backend = StubBackend::new();
        backend.load(Path::new("model.bin"), QuantizationLevel::Full32, false, 0).unwrap();
        let out = backend.infer(&[], &InferenceParams::default()).unwrap();
        assert!(out.segments.is_empty());
    }

    #[test]
    fn validate_fails_before_load() {
        let backend = StubBackend::new();
        assert!(backend.validate().is_err());
    }

    #[test]
    fn validate_succeeds_after_load() {
        let mut backend = StubBackend::new();
        backend.load(Path::new("model.bin"), QuantizationLevel::Full32, false, 0).unwrap();
        let v = backend.validate().unwrap();
        assert!(v.vocab_size >= MIN_VOCAB_SIZE);
    }
}
