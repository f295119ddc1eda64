//! Gradient graph synthesis and training orchestration for tessel.
//!
//! # Architecture
//!
//! - [`GradientGraphBuilder`] extends a forward graph with a yield point
//!   and backward nodes, specialized to one input shape signature
//! - [`GradientRegistry`] holds the per-operator [`GradientRule`]s it uses
//! - [`TrainingOrchestrator`] wraps a [`HostModule`], rebuilding the
//!   training session when the shape signature or gradient requirements
//!   change, and moves [`HostTensor`]s in and out through IO bindings
//!
//! # Example
//!
//! ```ignore
//! let mut trainer = TrainingOrchestrator::new(model, OrchestratorOptions::default());
//!
//! let x = HostTensor::from_vec(batch, &[2, 3])?.with_requires_grad(true);
//! let outputs = trainer.forward(&[Some(&x)])?;
//!
//! let dy = HostTensor::from_vec(vec![1.0f32; 4], outputs[0].shape())?;
//! let grads = trainer.backward(&[&dy])?;
//! // grads[0] is dx; the remaining slots are parameter gradients.
//! ```

mod builder;
mod error;
pub mod gradient;
mod host;
mod orchestrator;
mod specialize;
mod transport;

pub use builder::{
    GradientBuilderConfig, GradientGraphBuilder, GraphMetadata, ShapeSignature, grad_name,
};
pub use error::{Result, TrainingError};
pub use gradient::{GradientContext, GradientRegistry, GradientRule};
pub use host::{ExportSpec, HostModule, HostTensor};
pub use orchestrator::{OrchestratorOptions, OrchestratorState, TrainingOrchestrator};
