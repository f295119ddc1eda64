//! Device-tagged tensor values owned by the runtime.

use crate::device::DeviceHandle;
use crate::error::{Result, RuntimeError};
use bytemuck::Pod;
use tessel_graph::DataType;

/// Rust element types with a runtime data type.
pub trait Element: Pod {
    const DTYPE: DataType;
}

impl Element for f32 {
    const DTYPE: DataType = DataType::F32;
}

impl Element for i32 {
    const DTYPE: DataType = DataType::I32;
}

impl Element for i64 {
    const DTYPE: DataType = DataType::I64;
}

impl Element for u8 {
    const DTYPE: DataType = DataType::U8;
}

/// A tensor value: element bytes plus shape, element type and the device
/// the value is considered to live on.
///
/// Values are what kernels consume and produce, what [`run`] takes as feed
/// and what the session hands back for outputs nobody bound.
///
/// [`run`]: crate::ExecutionSession::run
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    data: Vec<u8>,
    shape: Vec<usize>,
    dtype: DataType,
    device: DeviceHandle,
}

impl Value {
    /// Create a CPU value from a vector with a given shape.
    ///
    /// # Example
    /// ```
    /// # use tessel_runtime::Value;
    /// let value = Value::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    /// assert_eq!(value.len(), 4);
    /// ```
    pub fn from_vec<T: Element>(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        check_len(data.len(), shape)?;
        Ok(Self {
            data: bytemuck::cast_slice(&data).to_vec(),
            shape: shape.to_vec(),
            dtype: T::DTYPE,
            device: DeviceHandle::cpu(),
        })
    }

    /// Create a boolean CPU value.
    pub fn from_bools(data: &[bool], shape: &[usize]) -> Result<Self> {
        check_len(data.len(), shape)?;
        Ok(Self {
            data: data.iter().map(|&b| b as u8).collect(),
            shape: shape.to_vec(),
            dtype: DataType::Bool,
            device: DeviceHandle::cpu(),
        })
    }

    /// Create a value from raw little-endian element bytes.
    pub fn from_raw(data: Vec<u8>, shape: &[usize], dtype: DataType) -> Result<Self> {
        if byte_size(shape, dtype) != Some(data.len()) {
            return Err(RuntimeError::TensorError(format!(
                "{} bytes cannot hold {:?} elements of {}",
                data.len(),
                shape,
                dtype
            )));
        }
        Ok(Self {
            data,
            shape: shape.to_vec(),
            dtype,
            device: DeviceHandle::cpu(),
        })
    }

    /// A zero-filled CPU value.
    ///
    /// # Panics
    /// If the byte size of `shape` overflows `usize`.
    pub fn zeros(shape: &[usize], dtype: DataType) -> Self {
        let bytes = byte_size(shape, dtype).unwrap_or(usize::MAX);
        Self {
            data: vec![0; bytes],
            shape: shape.to_vec(),
            dtype,
            device: DeviceHandle::cpu(),
        }
    }

    /// Retag the value with the device it lives on.
    pub fn with_device(mut self, device: DeviceHandle) -> Self {
        self.device = device;
        self
    }

    /// Copy the elements out as a vector.
    ///
    /// # Errors
    /// Returns an error if `T` does not match the value's element type.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(RuntimeError::TensorError(format!(
                "cannot read {} value as {}",
                self.dtype,
                T::DTYPE
            )));
        }
        // Byte storage carries no alignment guarantee.
        Ok(bytemuck::pod_collect_to_vec(&self.data))
    }

    /// Copy a boolean value out as a vector.
    pub fn to_bools(&self) -> Result<Vec<bool>> {
        if self.dtype != DataType::Bool {
            return Err(RuntimeError::TensorError(format!(
                "cannot read {} value as bool",
                self.dtype
            )));
        }
        Ok(self.data.iter().map(|&b| b != 0).collect())
    }

    /// Raw element bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
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

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Number of bytes `shape` elements of `dtype` occupy, `None` on overflow.
pub(crate) fn byte_size(shape: &[usize], dtype: DataType) -> Option<usize> {
    shape
        .iter()
        .try_fold(dtype.size(), |acc, &dim| acc.checked_mul(dim))
}

fn check_len(len: usize, shape: &[usize]) -> Result<()> {
    let expected = shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim));
    if expected != Some(len) {
        return Err(RuntimeError::TensorError(format!(
            "data length {} doesn't match shape {:?}",
            len, shape
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflowing_shape_rejected() {
        let shape = [1usize << 62, 4];
        assert_eq!(byte_size(&shape, DataType::F32), None);
        assert!(Value::from_raw(Vec::new(), &shape, DataType::F32).is_err());
        assert!(Value::from_vec(Vec::<f32>::new(), &shape).is_err());
    }

    #[test]
    fn test_value_from_vec() {
        let value = Value::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[2, 2]).unwrap();

        assert_eq!(value.shape(), &[2, 2]);
        assert_eq!(value.dtype(), DataType::F32);
        assert_eq!(value.len(), 4);
        assert_eq!(value.device(), DeviceHandle::cpu());
        assert_eq!(value.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_value_wrong_element_type() {
        let value = Value::from_vec(vec![1i64, 2], &[2]).unwrap();
        assert!(value.to_vec::<f32>().is_err());
        assert_eq!(value.to_vec::<i64>().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_value_shape_mismatch() {
        let result = Value::from_vec(vec![1.0f32, 2.0, 3.0], &[2, 2]);
        assert!(matches!(result, Err(RuntimeError::TensorError(_))));
    }

    #[test]
    fn test_bools() {
        let value = Value::from_bools(&[true, false, true], &[3]).unwrap();
        assert_eq!(value.dtype(), DataType::Bool);
        assert_eq!(value.as_bytes(), &[1, 0, 1]);
        assert_eq!(value.to_bools().unwrap(), vec![true, false, true]);
    }

    #[test]
    fn test_from_raw_checks_length() {
        assert!(Value::from_raw(vec![0; 7], &[2], DataType::F32).is_err());
        let value = Value::from_raw(vec![0; 8], &[2], DataType::F32).unwrap();
        assert_eq!(value.to_vec::<f32>().unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_zero_sized() {
        let value = Value::zeros(&[0, 3], DataType::F32);
        assert!(value.is_empty());
        assert!(value.as_bytes().is_empty());
    }
}
