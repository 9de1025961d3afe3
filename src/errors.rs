use thiserror::Error;
use std::io;
use std::path::PathBuf;

/// Custom error types for ECM FiberTrack
#[derive(Error, Debug)]
pub enum FiberTrackError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to load configuration from {path}: {source}")]
    ConfigLoad {
        source: toml::de::Error,
        path: PathBuf,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Image size mismatch: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No images found in {0}")]
    NoImages(PathBuf),

    #[error("Invalid input path: {0}")]
    InvalidPath(PathBuf),

    #[error("Unexpected error: {0}")]
    Other(String),
}

/// Type alias for Result with our custom error type
pub type Result<T> = std::result::Result<T, FiberTrackError>;
