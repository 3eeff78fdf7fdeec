//! Unified error types for finetuning

use thiserror::Error;

/// Unified error type for all finetuning operations
#[derive(Error, Debug)]
pub enum FinetuneError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Dataset is empty")]
    EmptyDataset,

    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Weight not found: {0}")]
    WeightNotFound(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),
}

impl FinetuneError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        FinetuneError::Config(msg.into())
    }

    /// Create an invalid batch error
    pub fn invalid_batch<S: Into<String>>(msg: S) -> Self {
        FinetuneError::InvalidBatch(msg.into())
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch<S: Into<String>>(name: S, expected: &[usize], actual: &[usize]) -> Self {
        FinetuneError::ShapeMismatch {
            name: name.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Create a checkpoint error
    pub fn checkpoint<S: Into<String>>(msg: S) -> Self {
        FinetuneError::Checkpoint(msg.into())
    }
}

/// Result type alias for finetuning operations
pub type Result<T> = std::result::Result<T, FinetuneError>;
