//! Error types for motion in-betweening

use thiserror::Error;

#[derive(Error, Debug)]
pub enum InbetweenError {
    #[error("Dimension mismatch in {context}: expected {expected}, got {got}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Malformed clip '{clip}': {reason}")]
    MalformedClip { clip: String, reason: String },

    #[error("No subjects selected for the {0} split")]
    EmptySubjects(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Contract violation: {0}")]
    ContractViolation(String),

    #[error("Computation error: {0}")]
    ComputationError(String),

    #[error("Missing weights for '{role}' at {path}")]
    MissingWeights { role: String, path: String },

    #[error("Candle error: {0}")]
    CandleError(#[from] candle_core::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serde_json::Error> for InbetweenError {
    fn from(e: serde_json::Error) -> Self {
        InbetweenError::SerializationError(e.to_string())
    }
}
