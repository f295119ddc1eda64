//! Error types for the runtime crate.

use crate::device::DeviceHandle;
use tessel_graph::GraphError;
use thiserror::Error;

/// Runtime execution errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Device kind not recognized, or no provider can serve it.
    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    /// Shape does not satisfy the declaration of the tensor it is bound to.
    #[error("Shape mismatch for '{name}': expected {expected}, got {actual}")]
    ShapeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// Element type does not match the declaration of the tensor.
    #[error("Type mismatch for '{name}': expected {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// Name is not a declared graph input or output.
    #[error("Unknown tensor name: {0}")]
    UnknownTensorName(String),

    /// Fewer inputs than the graph requires.
    #[error("Model requires {required} inputs, feed supplies {supplied} (missing: {missing:?})")]
    MissingInput {
        required: usize,
        supplied: usize,
        missing: Vec<String>,
    },

    /// A buffer lives on a device no configured provider serves.
    #[error("Device mismatch for '{name}': {device} is not served by [{providers}]")]
    DeviceMismatch {
        name: String,
        device: DeviceHandle,
        providers: String,
    },

    /// Binding table was created by another session.
    #[error("IO binding belongs to session {binding}, not session {session}")]
    ForeignBinding { binding: u64, session: u64 },

    /// No configured provider has a kernel for an operator.
    #[error("No execution provider implements '{op_type}' (node '{node}')")]
    UnsupportedOperator { op_type: String, node: String },

    /// Backward execution requested without retained forward state.
    #[error("No retained forward state: run_forward must precede run_backward")]
    NoForwardState,

    /// A kernel rejected its inputs.
    #[error("Kernel '{op_type}' failed: {message}")]
    Kernel { op_type: String, message: String },

    /// Execution failed.
    #[error("Execution failed: {0}")]
    ExecutionError(String),

    /// Invalid tensor.
    #[error("Invalid tensor: {0}")]
    TensorError(String),

    /// Profiling artifact could not be written.
    #[error("Profiling failed: {0}")]
    Profiling(String),

    /// Graph loading or validation failed.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Shorthand for a kernel failure.
    pub fn kernel(op_type: impl Into<String>, message: impl Into<String>) -> Self {
        RuntimeError::Kernel {
            op_type: op_type.into(),
            message: message.into(),
        }
    }
}

/// Specialized Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
