//! Hand-off of runtime values to host tensors.
//!
//! Values cross to the host through a byte transport whose type codes do
//! not distinguish booleans from bytes. The receiving side restores `Bool`
//! from the declared graph type and leaves genuine `u8` tensors alone.

use crate::error::Result;
use crate::host::HostTensor;
use tessel_graph::DataType;
use tessel_runtime::{DeviceHandle, Value};

/// Element codes of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportCode {
    Float32,
    Int32,
    Int64,
    /// Both `U8` and `Bool`.
    Byte,
}

impl TransportCode {
    fn of(dtype: DataType) -> Self {
        match dtype {
            DataType::F32 => TransportCode::Float32,
            DataType::I32 => TransportCode::Int32,
            DataType::I64 => TransportCode::Int64,
            DataType::U8 | DataType::Bool => TransportCode::Byte,
        }
    }

    fn dtype(self) -> DataType {
        match self {
            TransportCode::Float32 => DataType::F32,
            TransportCode::Int32 => DataType::I32,
            TransportCode::Int64 => DataType::I64,
            TransportCode::Byte => DataType::U8,
        }
    }
}

/// A value in transit to the host.
#[derive(Debug)]
pub(crate) struct Transported {
    bytes: Vec<u8>,
    shape: Vec<usize>,
    code: TransportCode,
    device: DeviceHandle,
}

pub(crate) fn send(value: Value) -> Transported {
    let shape = value.shape().to_vec();
    let code = TransportCode::of(value.dtype());
    let device = value.device();
    Transported {
        bytes: value.into_bytes(),
        shape,
        code,
        device,
    }
}

/// Materialize a host tensor, restoring `Bool` when `declared` says so.
pub(crate) fn receive(transported: Transported, declared: DataType) -> Result<HostTensor> {
    let dtype = match (transported.code, declared) {
        (TransportCode::Byte, DataType::Bool) => DataType::Bool,
        (code, _) => code.dtype(),
    };
    HostTensor::from_raw(
        transported.bytes,
        &transported.shape,
        dtype,
        transported.device,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_restored_from_declaration() {
        let mask = Value::from_bools(&[true, false, true], &[3]).unwrap();
        let transported = send(mask);
        assert_eq!(transported.code, TransportCode::Byte);

        let host = receive(transported, DataType::Bool).unwrap();
        assert_eq!(host.dtype(), DataType::Bool);
        assert_eq!(host.to_bools().unwrap(), vec![true, false, true]);
    }

    #[test]
    fn test_bytes_stay_bytes() {
        let raw = Value::from_vec(vec![0u8, 7, 1], &[3]).unwrap();
        let host = receive(send(raw), DataType::U8).unwrap();
        assert_eq!(host.dtype(), DataType::U8);
        assert_eq!(host.to_vec::<u8>().unwrap(), vec![0, 7, 1]);
    }

    #[test]
    fn test_device_travels_with_value() {
        let value = Value::from_vec(vec![1.0f32, 2.0], &[2])
            .unwrap()
            .with_device(DeviceHandle::accelerator(0));
        let host = receive(send(value), DataType::F32).unwrap();
        assert_eq!(host.device(), DeviceHandle::accelerator(0));
        assert_eq!(host.dtype(), DataType::F32);
    }
}
