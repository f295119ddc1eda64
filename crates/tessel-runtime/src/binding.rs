//! Caller-owned buffers bound to named graph tensors.
//!
//! A [`BoundBuffer`] only describes memory: where it is, what it holds and
//! how big it is. An [`IoBinding`] collects them per session. Nothing here
//! copies data; the session reads and writes the addresses while an
//! execution call is in progress.

use crate::device::DeviceHandle;
use crate::error::{Result, RuntimeError};
use crate::value::{Value, byte_size};
use std::collections::HashMap;
use std::sync::Arc;
use tessel_graph::{DataType, Graph};

/// A caller-owned memory region associated with a named graph tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundBuffer {
    name: String,
    device: DeviceHandle,
    element_type: DataType,
    shape: Vec<usize>,
    address: usize,
    byte_len: usize,
}

impl BoundBuffer {
    /// Describe a buffer.
    ///
    /// `shape` is signed so that shapes coming from host frameworks can be
    /// passed through unchanged.
    ///
    /// # Errors
    /// Returns [`RuntimeError::ShapeMismatch`] if any dimension is negative
    /// or the region size overflows.
    pub fn new(
        name: impl Into<String>,
        device: DeviceHandle,
        element_type: DataType,
        shape: &[i64],
        address: usize,
    ) -> Result<Self> {
        let name = name.into();
        let dims = shape
            .iter()
            .map(|&d| usize::try_from(d))
            .collect::<std::result::Result<Vec<usize>, _>>()
            .map_err(|_| RuntimeError::ShapeMismatch {
                name: name.clone(),
                expected: "non-negative dimensions".to_string(),
                actual: format!("{:?}", shape),
            })?;
        let byte_len = byte_size(&dims, element_type).ok_or_else(|| RuntimeError::ShapeMismatch {
            name: name.clone(),
            expected: format!("at most {} bytes", usize::MAX),
            actual: format!("{:?}", shape),
        })?;

        Ok(Self {
            name,
            device,
            element_type,
            shape: dims,
            address,
            byte_len,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    pub fn element_type(&self) -> DataType {
        self.element_type
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn address(&self) -> usize {
        self.address
    }

    /// Size of the region in bytes.
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }
}

/// Input and output bindings for one execution session.
///
/// Created by [`ExecutionSession::io_binding`] and only usable with that
/// session. Mutation takes `&mut self`; an execution borrows the table for
/// its whole duration.
///
/// [`ExecutionSession::io_binding`]: crate::ExecutionSession::io_binding
#[derive(Debug)]
pub struct IoBinding {
    session_id: u64,
    graph: Arc<Graph>,
    inputs: HashMap<String, BoundBuffer>,
    outputs: HashMap<String, BoundBuffer>,
    allocated: Vec<(String, Value)>,
}

impl IoBinding {
    pub(crate) fn new(session_id: u64, graph: Arc<Graph>) -> Self {
        Self {
            session_id,
            graph,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            allocated: Vec::new(),
        }
    }

    /// Bind a caller-owned region as the value of input `name`.
    ///
    /// Replaces any existing binding for the name. The memory is read when an
    /// execution call runs, not now. Names the graph does not declare are
    /// accepted here and rejected at execution time.
    ///
    /// # Safety
    /// `address` must point to `shape.product() * element_type.size()`
    /// readable bytes on `device`, and stay valid and unaliased by writers
    /// for every execution call made while the binding is in place.
    ///
    /// # Errors
    /// [`RuntimeError::ShapeMismatch`] for negative dimensions,
    /// [`RuntimeError::TypeMismatch`] if the graph declares `name` with a
    /// different element type.
    pub unsafe fn bind_input(
        &mut self,
        name: &str,
        device: DeviceHandle,
        element_type: DataType,
        shape: &[i64],
        address: usize,
    ) -> Result<()> {
        let buffer = BoundBuffer::new(name, device, element_type, shape, address)?;
        self.check_declared_type(&buffer)?;
        self.inputs.insert(name.to_string(), buffer);
        Ok(())
    }

    /// Bind a caller-owned region to receive output `name`.
    ///
    /// # Safety
    /// `address` must point to `shape.product() * element_type.size()`
    /// writable bytes on `device` that nothing else reads or writes during
    /// the execution calls made while the binding is in place.
    ///
    /// # Errors
    /// Same as [`bind_input`](Self::bind_input).
    pub unsafe fn bind_output(
        &mut self,
        name: &str,
        device: DeviceHandle,
        element_type: DataType,
        shape: &[i64],
        address: usize,
    ) -> Result<()> {
        let buffer = BoundBuffer::new(name, device, element_type, shape, address)?;
        self.check_declared_type(&buffer)?;
        self.outputs.insert(name.to_string(), buffer);
        Ok(())
    }

    /// Drop all input bindings.
    pub fn clear_inputs(&mut self) {
        self.inputs.clear();
    }

    /// Drop all output bindings and any session-allocated outputs.
    pub fn clear_outputs(&mut self) {
        self.outputs.clear();
        self.allocated.clear();
    }

    pub fn bound_input(&self, name: &str) -> Option<&BoundBuffer> {
        self.inputs.get(name)
    }

    pub fn bound_output(&self, name: &str) -> Option<&BoundBuffer> {
        self.outputs.get(name)
    }

    /// All bound inputs, in no particular order.
    pub fn bound_inputs(&self) -> impl Iterator<Item = &BoundBuffer> {
        self.inputs.values()
    }

    /// All bound outputs, in no particular order.
    pub fn bound_outputs(&self) -> impl Iterator<Item = &BoundBuffer> {
        self.outputs.values()
    }

    /// Values the session allocated for outputs that were not bound, in graph
    /// output order. Refreshed by every execution call.
    pub fn outputs(&self) -> &[(String, Value)] {
        &self.allocated
    }

    /// Session-allocated value for output `name`.
    pub fn output(&self, name: &str) -> Option<&Value> {
        self.allocated
            .iter()
            .find(|(output, _)| output == name)
            .map(|(_, value)| value)
    }

    /// Id of the session this table belongs to.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub(crate) fn set_allocated(&mut self, values: Vec<(String, Value)>) {
        self.allocated = values;
    }

    fn check_declared_type(&self, buffer: &BoundBuffer) -> Result<()> {
        if let Ok(info) = self.graph.tensor_by_name(buffer.name()) {
            if info.dtype != buffer.element_type() {
                return Err(RuntimeError::TypeMismatch {
                    name: buffer.name().to_string(),
                    expected: info.dtype.to_string(),
                    actual: buffer.element_type().to_string(),
                });
            }
        }
        Ok(())
    }
}
