//! Flow-related error types.

use thiserror::Error;

/// Errors that can occur while building, running or training a flow.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Flow has no layers defined")]
    NoLayers,

    #[error("Invalid layer configuration: {message}")]
    InvalidLayerConfig { message: String },

    #[error("Invalid tensor shape: {message}")]
    InvalidShape { message: String },

    #[error("Non-invertible layer {layer}: {reason}")]
    NonInvertible { layer: String, reason: String },

    #[error("Stale or missing forward-pass context for {layer}: expected {expected}, found {found}")]
    StaleContext {
        layer: String,
        expected: String,
        found: String,
    },

    #[error("Degenerate mixture prior: {message}")]
    DegeneratePrior { message: String },

    #[error("Invalid label {label}: expected -1 (unlabeled) or a class in [0, {num_classes})")]
    InvalidLabel { label: i64, num_classes: usize },

    #[error("Unsupported dataset: {name}")]
    UnknownDataset { name: String },

    #[error("Unknown flow architecture: {name}")]
    UnknownArchitecture { name: String },

    #[error("Unknown {kind}: {name}")]
    UnknownOption { kind: &'static str, name: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Tensor data error: {message}")]
    TensorData { message: String },

    #[error("Checkpoint error: {message}")]
    Checkpoint { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    pub(crate) fn non_invertible(layer: &str, reason: impl Into<String>) -> Self {
        FlowError::NonInvertible {
            layer: layer.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn stale(layer: &str, expected: impl ToString, found: impl ToString) -> Self {
        FlowError::StaleContext {
            layer: layer.to_string(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    pub(crate) fn shape(message: impl Into<String>) -> Self {
        FlowError::InvalidShape {
            message: message.into(),
        }
    }
}
