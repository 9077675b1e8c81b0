//! Error types for Grad-CAM computation.

use thiserror::Error;

use crate::tapped::Phase;

/// Result type alias using [`GradCamError`].
pub type Result<T> = std::result::Result<T, GradCamError>;

/// Errors surfaced by the tapped classifier and the Grad-CAM engine.
///
/// None of these are retried internally: the pipeline is deterministic, so
/// repeating a call with the same inputs fails the same way.
#[derive(Error, Debug)]
pub enum GradCamError {
    /// Input or intermediate tensor has a shape the classifier cannot accept.
    #[error("shape error: {0}")]
    Shape(String),

    /// Operation invoked in the wrong capture phase.
    #[error("{operation} requires phase {expected}, classifier is {actual}")]
    State {
        /// Operation that was attempted.
        operation: &'static str,
        /// Phase(s) in which the operation is legal.
        expected: &'static str,
        /// Phase the classifier was actually in.
        actual: Phase,
    },

    /// Forced target class outside `[0, num_classes)`.
    #[error("class index {index} out of range for {num_classes} classes")]
    InvalidClassIndex {
        /// Requested class.
        index: usize,
        /// Size of the classification head.
        num_classes: usize,
    },

    /// Tap index that does not split the feature stage into two non-empty parts.
    #[error("tap index {index} invalid for a feature stage of {len} layers")]
    InvalidTap {
        /// Requested boundary.
        index: usize,
        /// Number of feature-stage layers.
        len: usize,
    },

    /// NaN or infinity produced by the classifier or its gradients.
    #[error("non-finite values: {0}")]
    NonFinite(String),

    /// Error raised by the tensor backend.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    /// I/O error while reading configs or weights.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON configuration.
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl GradCamError {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    /// True for the lifecycle-violation kind.
    pub fn is_state_error(&self) -> bool {
        matches!(self, Self::State { .. })
    }
}
