//! Execution sessions and device-aware IO binding for tessel graphs.
//!
//! # Architecture
//!
//! The runtime has three responsibilities:
//! 1. **Memory description** - [`DeviceHandle`] names a memory space,
//!    [`BoundBuffer`] describes a caller-owned region in it
//! 2. **Binding** - an [`IoBinding`] associates buffers with the named inputs
//!    and outputs of one session, without copying
//! 3. **Execution** - an [`ExecutionSession`] places each node on an
//!    [`ExecutionProvider`] and runs the graph from values or from bindings
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use tessel_graph::ModelSource;
//! use tessel_runtime::{ExecutionSession, RunOptions, SessionOptions, Value};
//!
//! # fn main() -> tessel_runtime::Result<()> {
//! let mut session =
//!     ExecutionSession::new(&ModelSource::from("model.json"), SessionOptions::default())?;
//!
//! let mut feed = HashMap::new();
//! feed.insert("x".to_string(), Value::from_vec(vec![1.0f32, -2.0], &[2])?);
//!
//! let outputs = session.run(&[], feed, &RunOptions::default())?;
//! println!("{:?}", outputs[0].to_vec::<f32>()?);
//! # Ok(())
//! # }
//! ```

mod binding;
mod broadcast;
mod device;
mod error;
mod kernel;
pub mod kernels;
mod profiler;
mod provider;
mod session;
mod value;

pub use binding::{BoundBuffer, IoBinding};
pub use broadcast::broadcast_shape;
pub use device::{DeviceHandle, DeviceKind, MemoryKind};
pub use error::{Result, RuntimeError};
pub use kernel::{Kernel, KernelRegistry};
pub use provider::{CpuExecutionProvider, DefaultProviderFactory, ExecutionProvider, ProviderFactory};
pub use session::{
    ExecutionSession, RunOptions, SessionOptions, YIELD_GRAD_INDICES, YIELD_OP,
};
pub use value::{Element, Value};
