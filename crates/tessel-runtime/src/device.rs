//! Memory-space identification.

use crate::error::{Result, RuntimeError};
use std::fmt;
use std::str::FromStr;

/// Kind of memory space a buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Accelerator,
}

/// Where memory handed out by a device's default allocator lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Addressable from the host.
    Host,
    /// Device-local, needs a provider to read or write.
    Device,
}

/// Identifies a memory space: device kind plus device index.
///
/// The index is meaningful only for accelerators; CPU handles always carry
/// index 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    kind: DeviceKind,
    index: u32,
}

impl DeviceHandle {
    /// Construct a handle from a device kind name.
    ///
    /// Accepts `cpu`, `cuda`, `gpu` and `accelerator`. A CPU handle ignores
    /// `index` and is normalized to index 0.
    ///
    /// # Errors
    /// Returns [`RuntimeError::InvalidDevice`] for unrecognized kinds.
    pub fn new(kind: &str, index: u32) -> Result<Self> {
        match kind.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::cpu()),
            "cuda" | "gpu" | "accelerator" => Ok(Self::accelerator(index)),
            other => Err(RuntimeError::InvalidDevice(format!(
                "unrecognized device kind '{}'",
                other
            ))),
        }
    }

    /// The host CPU.
    pub const fn cpu() -> Self {
        Self {
            kind: DeviceKind::Cpu,
            index: 0,
        }
    }

    /// Accelerator number `index`.
    pub const fn accelerator(index: u32) -> Self {
        Self {
            kind: DeviceKind::Accelerator,
            index,
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_cpu(&self) -> bool {
        self.kind == DeviceKind::Cpu
    }

    /// Memory kind of this device's default allocator.
    pub fn default_memory(&self) -> MemoryKind {
        match self.kind {
            DeviceKind::Cpu => MemoryKind::Host,
            DeviceKind::Accelerator => MemoryKind::Device,
        }
    }
}

impl Default for DeviceHandle {
    fn default() -> Self {
        Self::cpu()
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeviceKind::Cpu => f.write_str("cpu"),
            DeviceKind::Accelerator => write!(f, "accelerator:{}", self.index),
        }
    }
}

impl FromStr for DeviceHandle {
    type Err = RuntimeError;

    /// Parse `cpu`, `cuda`, `cuda:1`, `accelerator:0` and similar.
    fn from_str(s: &str) -> Result<Self> {
        let (kind, index) = match s.split_once(':') {
            Some((kind, index)) => {
                let index = index.parse::<u32>().map_err(|_| {
                    RuntimeError::InvalidDevice(format!("invalid device index in '{}'", s))
                })?;
                (kind, index)
            }
            None => (s, 0),
        };
        Self::new(kind, index)
    }
}
