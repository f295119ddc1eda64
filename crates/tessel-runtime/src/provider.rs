//! Execution providers: backends that run operators and own device memory
//! access.

use crate::device::{DeviceHandle, MemoryKind};
use crate::error::{Result, RuntimeError};
use crate::kernel::{Kernel, KernelRegistry};
use std::fmt;
use std::sync::Arc;

/// A backend capable of running graph operators on one device.
///
/// Sessions consult providers in preference order: each node runs on the
/// first provider that has a kernel for it, and bound buffers are read and
/// written by the provider serving their device.
pub trait ExecutionProvider: Send + Sync + fmt::Debug {
    /// Short provider name, e.g. `"cpu"`.
    fn name(&self) -> &str;

    /// The device this provider executes on.
    fn device(&self) -> DeviceHandle;

    /// Kernel for an operator type, if this provider implements it.
    fn kernel(&self, op_type: &str) -> Option<&dyn Kernel>;

    /// Copy `len` bytes of device memory starting at `address` to the host.
    ///
    /// # Safety
    /// `address` must be valid for reads of `len` bytes on [`device`](Self::device).
    unsafe fn read(&self, address: usize, len: usize) -> Result<Vec<u8>>;

    /// Copy `bytes` into device memory starting at `address`.
    ///
    /// # Safety
    /// `address` must be valid for writes of `bytes.len()` bytes on
    /// [`device`](Self::device), with no concurrent access.
    unsafe fn write(&self, address: usize, bytes: &[u8]) -> Result<()>;
}

/// Host execution provider backed by the built-in kernels.
#[derive(Debug)]
pub struct CpuExecutionProvider {
    kernels: KernelRegistry,
}

impl CpuExecutionProvider {
    pub fn new() -> Self {
        Self {
            kernels: KernelRegistry::with_defaults(),
        }
    }

    /// A CPU provider with a custom kernel set.
    pub fn with_kernels(kernels: KernelRegistry) -> Self {
        Self { kernels }
    }

    pub fn kernels(&self) -> &KernelRegistry {
        &self.kernels
    }
}

impl Default for CpuExecutionProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionProvider for CpuExecutionProvider {
    fn name(&self) -> &str {
        "cpu"
    }

    fn device(&self) -> DeviceHandle {
        DeviceHandle::cpu()
    }

    fn kernel(&self, op_type: &str) -> Option<&dyn Kernel> {
        self.kernels.get(op_type)
    }

    unsafe fn read(&self, address: usize, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        check_address(address)?;
        // SAFETY: the caller guarantees `address..address + len` is readable
        // host memory.
        let bytes = unsafe { std::slice::from_raw_parts(address as *const u8, len) };
        Ok(bytes.to_vec())
    }

    unsafe fn write(&self, address: usize, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        check_address(address)?;
        // SAFETY: the caller guarantees `address..address + bytes.len()` is
        // writable host memory not overlapping `bytes`.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
        }
        Ok(())
    }
}

fn check_address(address: usize) -> Result<()> {
    if address == 0 {
        return Err(RuntimeError::ExecutionError(
            "bound buffer has a null address".to_string(),
        ));
    }
    Ok(())
}

/// Maps a device to the ordered provider list that should serve it.
pub trait ProviderFactory: Send + Sync {
    fn providers_for(&self, device: DeviceHandle) -> Result<Vec<Arc<dyn ExecutionProvider>>>;
}

/// Serves host memory with the CPU provider. Accelerators need a
/// user-supplied factory.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProviderFactory;

impl ProviderFactory for DefaultProviderFactory {
    fn providers_for(&self, device: DeviceHandle) -> Result<Vec<Arc<dyn ExecutionProvider>>> {
        match device.default_memory() {
            MemoryKind::Host => Ok(vec![Arc::new(CpuExecutionProvider::new())]),
            MemoryKind::Device => Err(RuntimeError::InvalidDevice(format!(
                "no execution provider registered for {}",
                device
            ))),
        }
    }
}
