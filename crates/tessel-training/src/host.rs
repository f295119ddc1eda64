//! The host tensor framework boundary.
//!
//! [`HostTensor`] is what the host side hands in and gets back;
//! [`HostModule`] is the model the orchestrator wraps. The orchestrator
//! is the only place host tensors are turned into bound buffers.

use crate::error::{Result, TrainingError};
use tessel_graph::{DataType, Dimension, Graph, TensorShape};
use tessel_runtime::{DeviceHandle, Element, Value};

/// A host framework tensor: owned element bytes tagged with the device the
/// host considers them to live on.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    data: Vec<u8>,
    shape: Vec<usize>,
    dtype: DataType,
    device: DeviceHandle,
    requires_grad: bool,
}

impl HostTensor {
    pub fn from_vec<T: Element>(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        Ok(Self::from_value(Value::from_vec(data, shape)?))
    }

    pub fn from_bools(data: &[bool], shape: &[usize]) -> Result<Self> {
        Ok(Self::from_value(Value::from_bools(data, shape)?))
    }

    pub fn zeros(shape: &[usize], dtype: DataType) -> Self {
        Self::from_value(Value::zeros(shape, dtype))
    }

    pub(crate) fn from_raw(
        data: Vec<u8>,
        shape: &[usize],
        dtype: DataType,
        device: DeviceHandle,
    ) -> Result<Self> {
        let value = Value::from_raw(data, shape, dtype)?.with_device(device);
        Ok(Self::from_value(value))
    }

    fn from_value(value: Value) -> Self {
        let shape = value.shape().to_vec();
        let dtype = value.dtype();
        let device = value.device();
        Self {
            data: value.into_bytes(),
            shape,
            dtype,
            device,
            requires_grad: false,
        }
    }

    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    pub fn with_device(mut self, device: DeviceHandle) -> Self {
        self.device = device;
        self
    }

    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }

    pub fn set_device(&mut self, device: DeviceHandle) {
        self.device = device;
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    /// Address of the first element.
    ///
    /// Valid until the tensor is dropped or mutated.
    pub fn data_ptr(&self) -> usize {
        self.data.as_ptr() as usize
    }

    /// Mutable address of the first element.
    pub fn data_mut_ptr(&mut self) -> usize {
        self.data.as_mut_ptr() as usize
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Shape as the signed dimensions used by bound buffers.
    pub(crate) fn signed_shape(&self) -> Vec<i64> {
        self.shape.iter().map(|&d| d as i64).collect()
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        Ok(self.to_value()?.to_vec()?)
    }

    pub fn to_bools(&self) -> Result<Vec<bool>> {
        Ok(self.to_value()?.to_bools()?)
    }

    /// Copy into a runtime value on the same device.
    pub fn to_value(&self) -> Result<Value> {
        Ok(Value::from_raw(self.data.clone(), &self.shape, self.dtype)?.with_device(self.device))
    }

    /// Overwrite the elements in place, keeping shape and type.
    pub fn copy_from_slice<T: Element>(&mut self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if T::DTYPE != self.dtype || bytes.len() != self.data.len() {
            return Err(TrainingError::InvalidState(format!(
                "cannot copy {} {} elements into a {} tensor of shape {:?}",
                data.len(),
                T::DTYPE,
                self.dtype,
                self.shape
            )));
        }
        self.data.copy_from_slice(bytes);
        Ok(())
    }
}

/// What the orchestrator asks a module to export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSpec {
    /// Names of the inputs present in this call, in argument order.
    pub input_names: Vec<String>,
    /// Element type of each present input.
    pub input_dtypes: Vec<DataType>,
    /// Symbolic name of every axis of every present input.
    pub dynamic_axes: Vec<Vec<String>>,
}

impl ExportSpec {
    pub(crate) fn new(inputs: &[(String, &HostTensor)]) -> Self {
        let dynamic_axes = inputs
            .iter()
            .enumerate()
            .map(|(i, (_, tensor))| {
                (0..tensor.shape().len())
                    .map(|j| format!("input{}_dim{}", i, j))
                    .collect()
            })
            .collect();
        Self {
            input_names: inputs.iter().map(|(name, _)| name.clone()).collect(),
            input_dtypes: inputs.iter().map(|(_, tensor)| tensor.dtype()).collect(),
            dynamic_axes,
        }
    }

    /// Declared shape of present input `index`: every axis symbolic.
    pub fn input_shape(&self, index: usize) -> TensorShape {
        let dims = self
            .dynamic_axes
            .get(index)
            .map(|axes| axes.iter().cloned().map(Dimension::Named).collect())
            .unwrap_or_default();
        TensorShape::Dynamic(dims)
    }
}

/// A host model the orchestrator can export and train.
pub trait HostModule {
    /// Argument names of the forward function, in order.
    fn forward_signature(&self) -> Vec<String>;

    /// Parameters by initializer name.
    fn named_parameters(&self) -> Vec<(String, &HostTensor)>;

    /// Export the forward computation as a graph.
    ///
    /// The graph must declare `spec.input_names` as its inputs and carry one
    /// initializer per named parameter.
    fn export(&self, spec: &ExportSpec) -> Result<Graph>;

    /// Move parameters to `device`.
    fn relocate(&mut self, device: DeviceHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_spec_axes() {
        let a = HostTensor::zeros(&[2, 3], DataType::F32);
        let b = HostTensor::zeros(&[5], DataType::I64);
        let spec = ExportSpec::new(&[("a".to_string(), &a), ("b".to_string(), &b)]);

        assert_eq!(spec.input_names, vec!["a", "b"]);
        assert_eq!(spec.input_dtypes, vec![DataType::F32, DataType::I64]);
        assert_eq!(spec.dynamic_axes[1], vec!["input1_dim0"]);
        assert_eq!(
            spec.input_shape(0),
            TensorShape::Dynamic(vec![
                Dimension::Named("input0_dim0".to_string()),
                Dimension::Named("input0_dim1".to_string()),
            ])
        );
    }

    #[test]
    fn test_copy_from_slice_checks_layout() {
        let mut t = HostTensor::zeros(&[2], DataType::F32);
        t.copy_from_slice(&[1.5f32, -2.0]).unwrap();
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![1.5, -2.0]);
        assert!(t.copy_from_slice(&[1.0f32]).is_err());
        assert!(t.copy_from_slice(&[1i32, 2]).is_err());
    }

    #[test]
    fn test_device_and_grad_flags() {
        let t = HostTensor::from_vec(vec![1.0f32], &[1])
            .unwrap()
            .with_requires_grad(true)
            .with_device(DeviceHandle::accelerator(1));
        assert!(t.requires_grad());
        assert_eq!(t.device(), DeviceHandle::accelerator(1));
        assert_eq!(t.to_value().unwrap().device(), DeviceHandle::accelerator(1));
    }
}
