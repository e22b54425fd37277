//! Quantization level policy (C2): static config per level, optimal selection
//! given GPU memory and model size, path mangling, and accuracy validation.

use std::path::{Path, PathBuf};

/// Numeric precision of model weights/activations used at inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuantizationLevel {
    Full32,
    Half16,
    Int8,
    Auto,
}

impl QuantizationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full32 => "full32",
            Self::Half16 => "half16",
            Self::Int8 => "int8",
            Self::Auto => "auto",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "half16" | "fp16" => Self::Half16,
            "int8" => Self::Int8,
            "auto" => Self::Auto,
            _ => Self::Full32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuantizationConfig {
    pub level: QuantizationLevel,
    pub enable_gpu_acceleration: bool,
    pub min_gpu_mb: usize,
    pub expected_accuracy_loss: f32,
    pub model_suffix: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct AccuracyValidationResult {
    pub word_error_rate: f32,
    pub character_error_rate: f32,
    pub confidence_score: f32,
    pub total_samples: usize,
    pub passes_threshold: bool,
    pub validation_details: String,
}

pub struct QuantizationManager {
    accuracy_threshold: f32,
}

impl Default for QuantizationManager {
    fn default() -> Self {
        Self { accuracy_threshold: 0.85 }
    }
}

impl QuantizationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config_for(&self, level: QuantizationLevel) -> QuantizationConfig {
        match level {
            QuantizationLevel::Full32 => QuantizationConfig {
                level,
                enable_gpu_acceleration: true,
                min_gpu_mb: 2_500,
                expected_accuracy_loss: 0.0,
                model_suffix: "",
            },
            QuantizationLevel::Half16 => QuantizationConfig {
                level,
                enable_gpu_acceleration: true,
                min_gpu_mb: 700,
                expected_accuracy_loss: 0.01,
                model_suffix: "_fp16",
            },
            QuantizationLevel::Int8 => QuantizationConfig {
                level,
                enable_gpu_acceleration: true,
                min_gpu_mb: 0,
                expected_accuracy_loss: 0.04,
                model_suffix: "_int8",
            },
            QuantizationLevel::Auto => QuantizationConfig {
                level,
                enable_gpu_acceleration: true,
                min_gpu_mb: 0,
                expected_accuracy_loss: 0.0,
                model_suffix: "",
            },
        }
    }

    /// Highest-precision level whose `min_gpu_mb + model_mb` fits in
    /// `avail_gpu_mb`; Full32 (CPU fallback) if none fit.
    pub fn select_optimal(&self, avail_gpu_mb: usize, model_mb: usize) -> QuantizationLevel {
        for level in [QuantizationLevel::Full32, QuantizationLevel::Half16, QuantizationLevel::Int8] {
            let cfg = self.config_for(level);
            if cfg.min_gpu_mb + model_mb <= avail_gpu_mb {
                return level;
            }
        }
        QuantizationLevel::Full32
    }

    pub fn preference_order(&self, avail_gpu_mb: usize) -> Vec<QuantizationLevel> {
        let mut levels = vec![QuantizationLevel::Full32, QuantizationLevel::Half16, QuantizationLevel::Int8];
        levels.sort_by_key(|l| {
            let cfg = self.config_for(*l);
            let fits = cfg.min_gpu_mb <= avail_gpu_mb;
            // Prefer levels that fit, and within that prefer lower accuracy loss.
            (!fits, (cfg.expected_accuracy_loss * 1000.0) as i64)
        });
        levels
    }

    pub fn path_for(&self, base_path: &Path, level: QuantizationLevel) -> PathBuf {
        let suffix = self.config_for(level).model_suffix;
        if suffix.is_empty() {
            return base_path.to_path_buf();
        }
        let stem = base_path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        let ext = base_path.extension().and_then(|s| s.to_str());
        let file_name = match ext {
            Some(ext) => format!("{stem}{suffix}.{ext}"),
            None => format!("{stem}{suffix}"),
        };
        base_path.with_file_name(file_name)
    }

    /// A level is supported if its expected accuracy doesn't fall below the
    /// configured `accuracy_threshold`.
    pub fn supported(&self, level: QuantizationLevel) -> bool {
        let cfg = self.config_for(level);
        (1.0 - cfg.expected_accuracy_loss) >= self.accuracy_threshold
    }

    pub fn set_accuracy_threshold(&mut self, threshold: f32) {
        self.accuracy_threshold = threshold.clamp(0.0, 1.0);
    }

    pub fn accuracy_threshold(&self) -> f32 {
        self.accuracy_threshold
    }

    /// Mean WER/CER/confidence across parallel `(expected, actual)` pairs,
    /// with `confidences` supplied by the caller's transcription run.
    pub fn validate_model_accuracy(
        &self,
        expected: &[String],
        actual: &[String],
        confidences: &[f32],
    ) -> AccuracyValidationResult {
        let n = expected.len().min(actual.len());
        if n == 0 {
            return AccuracyValidationResult::default();
        }
        let mut wer_sum = 0.0f32;
        let mut cer_sum = 0.0f32;
        for i in 0..n {
            wer_sum += word_error_rate(&expected[i], &actual[i]);
            cer_sum += char_error_rate(&expected[i], &actual[i]);
        }
        let confidence_score = if confidences.is_empty() {
            0.0
        } else {
            confidences.iter().sum::<f32>() / confidences.len() as f32
        };
        let word_error_rate = wer_sum / n as f32;
        let character_error_rate = cer_sum / n as f32;
        let passes_threshold = (1.0 - word_error_rate) >= self.accuracy_threshold;
        AccuracyValidationResult {
            word_error_rate,
            character_error_rate,
            confidence_score,
            total_samples: n,
            passes_threshold,
            validation_details: format!(
                "WER={word_error_rate:.3} CER={character_error_rate:.3} over {n} samples"
            ),
        }
    }
}

fn levenshtein<T: PartialEq>(a: &[T], b: &[T]) -> usize {
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

pub fn word_error_rate(expected: &str, actual: &str) -> f32 {
    let e: Vec<&str> = expected.split_whitespace().collect();
    let a: Vec<&str> = actual.split_whitespace().collect();
    let denom = e.len().max(a.len()).max(1);
    levenshtein(&e, &a) as f32 / denom as f32
}

pub fn char_error_rate(expected: &str, actual: &str) -> f32 {
    let e: Vec<char> = expected.chars().collect();
    let a: Vec<char> = actual.chars().collect();
    let denom = e.len().max(a.len()).max(1);
    levenshtein(&e, &a) as f32 / denom as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_optimal_picks_highest_precision_that_fits() {
        let mgr = QuantizationManager::new();
        assert_eq!(mgr.select_optimal(8_000, 500), QuantizationLevel::Full32);
        assert_eq!(mgr.select_optimal(2_200, 500), QuantizationLevel::Half16);
        assert_eq!(mgr.select_optimal(1_100, 500), QuantizationLevel::Int8);
        assert_eq!(mgr.select_optimal(0, 500), QuantizationLevel::Full32);
    }

    #[test]
    fn path_mangling_inserts_suffix_before_extension() {
        let mgr = QuantizationManager::new();
        let base = Path::new("/models/whisper-base.bin");
        assert_eq!(
            mgr.path_for(base, QuantizationLevel::Half16),
            PathBuf::from("/models/whisper-base_fp16.bin")
        );
        assert_eq!(mgr.path_for(base, QuantizationLevel::Full32), PathBuf::from(base));
    }

    #[test]
    fn wer_and_cer_are_zero_for_identical_text() {
        assert_eq!(word_error_rate("hello world", "hello world"), 0.0);
        assert_eq!(char_error_rate("hello world", "hello world"), 0.0);
    }

    #[test]
    fn wer_counts_substitutions() {
        let wer = word_error_rate("the quick brown fox", "the quick red fox");
        assert!((wer - 0.25).abs() < 1e-6);
    }

    #[test]
    fn accuracy_threshold_is_clamped() {
        let mut mgr = QuantizationManager::new();
        mgr.set_accuracy_threshold(1.5);
        assert_eq!(mgr.accuracy_threshold(), 1.0);
        mgr.set_accuracy_threshold(-0.5);
        assert_eq!(mgr.accuracy_threshold(), 0.0);
    }

    #[test]
    fn supported_rejects_levels_below_accuracy_threshold() {
        let mut mgr = QuantizationManager::new();
        assert!(mgr.supported(QuantizationLevel::Int8));
        mgr.set_accuracy_threshold(0.97);
        assert!(!mgr.supported(QuantizationLevel::Int8));
        assert!(mgr.supported(QuantizationLevel::Half16));
        assert!(mgr.supported(QuantizationLevel::Full32));
    }
}
