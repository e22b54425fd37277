use thiserror::Error;

/// All errors produced by stt-core that must surface past a component boundary.
///
/// Recoverable, transient failures are not represented here — they flow through
/// [`crate::recovery::ErrorContext`] and the recovery FSM instead (see `recovery`).
#[derive(Debug, Error)]
pub enum SttError {
    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("model validation failed: {0}")]
    ModelValidation(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("GPU context error: {0}")]
    GpuContext(String),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("unknown utterance: {0}")]
    UnknownUtterance(u32),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SttError>;
