//! Error types for the taper crate

use thiserror::Error;

/// Main error type for taper operations
#[derive(Error, Debug)]
pub enum Error {
    /// Compile-step error (missing or inconsistent configuration)
    #[error("Compile error: {0}")]
    Compile(String),

    /// Data error (malformed batches, mismatched lengths, bad splits)
    #[error("Data error: {0}")]
    Data(String),

    /// Unknown loss name passed to the compile step
    #[error("Unknown loss '{name}', supported losses are {supported:?}")]
    UnknownLoss {
        /// The name that failed to resolve
        name: String,
        /// Names the loss table does support
        supported: Vec<&'static str>,
    },

    /// Unknown metric name passed to the compile step
    #[error("Unknown metric '{name}', supported metrics are {supported:?}")]
    UnknownMetric {
        /// The name that failed to resolve
        name: String,
        /// Names the metric table does support
        supported: Vec<&'static str>,
    },

    /// Unknown optimizer name passed to the compile step
    #[error("Unknown optimizer '{name}', supported optimizers are {supported:?}")]
    UnknownOptimizer {
        /// The name that failed to resolve
        name: String,
        /// Names the optimizer table does support
        supported: Vec<&'static str>,
    },

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for taper operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a compile-step error
    pub fn compile(msg: impl Into<String>) -> Self {
        Self::Compile(msg.into())
    }

    /// Create a data error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }
}
