//! Error types for audiogan-rs.

use std::fmt;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Which update phase a gradient failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Discriminator,
    Generator,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Discriminator => write!(f, "discriminator"),
            Phase::Generator => write!(f, "generator"),
        }
    }
}

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tensor shapes that should agree do not. Always a wiring bug.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// Non-finite or oversized gradients on consecutive attempts.
    #[error(
        "{phase} gradients diverged on {consecutive} consecutive steps ({total} failures in total)"
    )]
    GradientDivergence {
        phase: Phase,
        consecutive: usize,
        total: usize,
    },

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// Dataset / batching error.
    #[error("data: {0}")]
    Data(String),

    /// Checkpoint persistence error.
    #[error("checkpoint: {0}")]
    Checkpoint(String),

    /// Audio processing error (STFT, WAV I/O).
    #[error("audio: {0}")]
    Audio(String),

    /// Heatmap encoding error.
    #[error("image: {0}")]
    Image(#[from] image::ImageError),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<hound::Error> for Error {
    fn from(error: hound::Error) -> Self {
        Error::Audio(error.to_string())
    }
}
