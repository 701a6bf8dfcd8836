//! Error types for model fusion

use thiserror::Error;

/// Model fusion errors
#[derive(Debug, Error)]
pub enum MergeError {
    /// Two parameter sets do not share the same key set
    #[error("Key set mismatch: '{key}' is not present in both parameter sets")]
    KeySetMismatch { key: String },

    /// A fine-tuned model diverges from the pretrained parameter naming
    #[error(
        "Parameter names of model {model_index} differ from the reference: {differing_keys:?}"
    )]
    ParameterNameMismatch {
        model_index: usize,
        differing_keys: Vec<String>,
    },

    /// Shape mismatch
    #[error("Shape mismatch for '{key}': expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Decomposition could not be carried out for a single parameter.
    /// Recovered inside the solver and never returned from a merge run.
    #[error("Degenerate subspace: {0}")]
    DegenerateSubspace(String),

    /// Invalid weights
    #[error("Invalid weights: {0}")]
    InvalidWeights(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Model pool has nothing to merge
    #[error("Model pool contains no fine-tuned models")]
    EmptyModelPool,

    /// Unknown model name
    #[error("Model not found in pool: {0}")]
    ModelNotFound(String),
}

/// Result type for merge operations
pub type Result<T> = std::result::Result<T, MergeError>;
