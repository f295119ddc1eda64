//! Error types for gradient synthesis and training orchestration.

use tessel_graph::GraphError;
use tessel_runtime::RuntimeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    /// The forward graph and configuration cannot produce a training graph.
    #[error("Gradient graph build failed: {0}")]
    GraphBuildError(String),

    /// A training graph accessor was called before `build`.
    #[error("Training graph has not been built")]
    NotBuilt,

    #[error("Expected {expected} output gradients, got {got}")]
    GradientOrderMismatch { expected: usize, got: usize },

    /// An operation was called out of protocol order.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Model export failed: {0}")]
    Export(String),
}

impl TrainingError {
    pub(crate) fn build(message: impl Into<String>) -> Self {
        TrainingError::GraphBuildError(message.into())
    }
}

pub type Result<T> = std::result::Result<T, TrainingError>;
