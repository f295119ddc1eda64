//! Graph model for tessel.
//!
//! This crate provides the structured graph representation consumed by the
//! runtime and the gradient builder, together with a single loader for
//! serialized graph documents.
//!
//! # Example
//!
//! ```no_run
//! use tessel_graph::{ModelSource, load_graph};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let graph = load_graph(&ModelSource::from("model.json"))?;
//!
//! println!("Model: {}", graph.metadata.name);
//! println!("Nodes: {}", graph.nodes.len());
//! println!("Tensors: {}", graph.tensor_info.len());
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

pub mod dot;
pub mod graph;
pub mod order;
pub mod source;

pub use dot::to_dot;
pub use graph::{
    AttributeValue, DataType, Dimension, Graph, ModelMetadata, Node, NodeId, TensorId,
    TensorInfo, TensorKind, TensorShape,
};
pub use source::{ModelSource, load_graph, save_graph, to_bytes};

/// Errors that can occur when loading or inspecting graphs.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Failed to read graph document: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to decode graph document: {0}")]
    DecodeError(#[from] serde_json::Error),

    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Missing tensor: {0}")]
    MissingTensor(String),

    #[error("Missing attribute: {0}")]
    MissingAttribute(String),

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Unsupported data type: {0}")]
    UnsupportedDataType(String),

    #[error("Graph contains a cycle through node '{0}'")]
    Cycle(String),
}

/// Result type for graph operations.
pub type Result<T> = std::result::Result<T, GraphError>;
