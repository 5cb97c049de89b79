//! Error types for video-lora.

use thiserror::Error;

/// Result type alias for video-lora operations.
pub type Result<T> = std::result::Result<T, LoraError>;

/// Errors that can occur in video-lora operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LoraError {
    /// Adapter not found.
    #[error("adapter not found: {name}")]
    AdapterNotFound {
        /// Name of the missing adapter
        name: String,
    },

    /// Adapter already exists.
    #[error("adapter already exists: {name}")]
    AdapterExists {
        /// Name of the duplicate adapter
        name: String,
    },

    /// Adapter name and weight counts do not line up.
    #[error("length of adapter names {names} is not equal to the length of their weights {weights}")]
    WeightCountMismatch {
        /// Number of adapter names
        names: usize,
        /// Number of weight entries
        weights: usize,
    },

    /// No scale expansion registered for the model architecture.
    #[error("no scale expansion registered for architecture: {architecture}")]
    UnknownArchitecture {
        /// Architecture name reported by the model
        architecture: String,
    },

    /// A per-block weight mapping named a block group the architecture lacks.
    #[error("unknown scale group '{group}' for architecture {architecture}")]
    UnknownScaleGroup {
        /// Offending block-group key
        group: String,
        /// Architecture name reported by the model
        architecture: String,
    },

    /// A state-dict key could not be mapped to the target naming convention.
    #[error("cannot map state dict key: {key}")]
    UnmappedKey {
        /// The unconvertible key
        key: String,
    },

    /// Shape mismatch in tensor operation.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Weight loading error.
    #[error("failed to load weights: {0}")]
    WeightLoad(String),

    /// Filesystem or serialization error.
    #[error("io error: {0}")]
    Io(String),

    /// Underlying candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
