//! Error types for vlm-eval operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for vlm-eval operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving an evaluation run.
///
/// Each stage of the pipeline (backend load, image fetch, generation,
/// report writing) has its own variant so callers can decide whether a
/// failure aborts the run or skips the current entry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Failed to load the model backend (weights, config, or tokenizer).
    #[error("Model load failed: {0}")]
    ModelLoad(String),

    /// Failed to encode or decode text with the tokenizer.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Text generation failed inside the backend.
    #[error("Generation failed: {0}")]
    Generation(String),

    /// Failed to load an image file.
    #[error("Image load failed: {path}: {reason}")]
    ImageLoad {
        /// Path to the image that failed to load.
        path: PathBuf,
        /// Reason for the failure.
        reason: String,
    },

    /// Failed to fetch a remote image.
    #[error("Image fetch failed: {url}: {reason}")]
    ImageFetch {
        /// URL of the image that failed to fetch.
        url: String,
        /// Reason for the failure.
        reason: String,
    },

    /// An image id resolved to neither path convention.
    #[error("Image {image_id} not found at {primary} or {secondary}")]
    MissingImage {
        /// Dataset image id.
        image_id: u64,
        /// Primary candidate path that was tried first.
        primary: PathBuf,
        /// Secondary candidate path tried as fallback.
        secondary: PathBuf,
    },

    /// Failed to read or parse the dataset metadata file.
    #[error("Dataset error: {path}: {reason}")]
    Dataset {
        /// Path to the metadata file.
        path: PathBuf,
        /// Reason for the failure.
        reason: String,
    },

    /// Error writing report files.
    #[error("Report error: {0}")]
    Report(String),

    /// Tensor operation error from the compute backend.
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// I/O error wrapper.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl From<tokenizers::Error> for Error {
    fn from(e: tokenizers::Error) -> Self {
        Self::Tokenizer(e.to_string())
    }
}
