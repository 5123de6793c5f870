//! Device placement of tensor buffers

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ShmError, ShmResult};

/// Device kind, numbered with the DLPack device type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum DeviceKind {
    /// Host memory
    Cpu = 1,
    /// CUDA device memory
    Cuda = 2,
    /// Pinned host memory allocated through CUDA
    CudaHost = 3,
    /// OpenCL device memory
    OpenCl = 4,
    /// Vulkan device memory
    Vulkan = 7,
    /// Metal device memory
    Metal = 8,
    /// ROCm device memory
    Rocm = 10,
    /// Pinned host memory allocated through ROCm
    RocmHost = 11,
    /// CUDA unified memory
    CudaManaged = 13,
}

impl DeviceKind {
    /// Parse a DLPack device type code
    pub fn from_code(code: i32) -> ShmResult<Self> {
        Ok(match code {
            1 => DeviceKind::Cpu,
            2 => DeviceKind::Cuda,
            3 => DeviceKind::CudaHost,
            4 => DeviceKind::OpenCl,
            7 => DeviceKind::Vulkan,
            8 => DeviceKind::Metal,
            10 => DeviceKind::Rocm,
            11 => DeviceKind::RocmHost,
            13 => DeviceKind::CudaManaged,
            other => {
                return Err(ShmError::InvalidDescriptor(format!(
                    "unknown device type code {other}"
                )))
            }
        })
    }

    /// DLPack device type code
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Whether the CPU can address this memory directly.
    ///
    /// Only host-accessible buffers can be placed in the shared segment.
    pub fn is_host_accessible(self) -> bool {
        matches!(
            self,
            DeviceKind::Cpu | DeviceKind::CudaHost | DeviceKind::RocmHost
        )
    }

    fn name(self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Cuda => "cuda",
            DeviceKind::CudaHost => "cuda_host",
            DeviceKind::OpenCl => "opencl",
            DeviceKind::Vulkan => "vulkan",
            DeviceKind::Metal => "metal",
            DeviceKind::Rocm => "rocm",
            DeviceKind::RocmHost => "rocm_host",
            DeviceKind::CudaManaged => "cuda_managed",
        }
    }
}

/// Device placement: kind plus ordinal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    /// Device kind
    pub kind: DeviceKind,
    /// Device ordinal (0 for host memory)
    pub index: u32,
}

impl Device {
    /// Host memory
    pub const CPU: Device = Device {
        kind: DeviceKind::Cpu,
        index: 0,
    };

    /// Construct a device
    pub fn new(kind: DeviceKind, index: u32) -> Self {
        Self { kind, index }
    }

    /// CUDA device `index`
    pub fn cuda(index: u32) -> Self {
        Self::new(DeviceKind::Cuda, index)
    }

    /// Whether the CPU can address this memory directly
    pub fn is_host_accessible(&self) -> bool {
        self.kind.is_host_accessible()
    }

    /// Fail with [`ShmError::DeviceIncompatible`] unless the buffer can be shared
    pub fn ensure_shareable(&self) -> ShmResult<()> {
        if self.is_host_accessible() {
            Ok(())
        } else {
            Err(ShmError::DeviceIncompatible { device: *self })
        }
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::CPU
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.name(), self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_codes_roundtrip() {
        for kind in [
            DeviceKind::Cpu,
            DeviceKind::Cuda,
            DeviceKind::CudaHost,
            DeviceKind::Rocm,
            DeviceKind::CudaManaged,
        ] {
            assert_eq!(DeviceKind::from_code(kind.code()).unwrap(), kind);
        }
        assert!(DeviceKind::from_code(99).is_err());
    }

    #[test]
    fn test_host_accessibility() {
        assert!(Device::CPU.ensure_shareable().is_ok());
        assert!(Device::new(DeviceKind::CudaHost, 0).ensure_shareable().is_ok());

        let err = Device::cuda(1).ensure_shareable().unwrap_err();
        assert!(matches!(err, ShmError::DeviceIncompatible { device } if device == Device::cuda(1)));
    }

    #[test]
    fn test_device_display() {
        assert_eq!(Device::CPU.to_string(), "cpu:0");
        assert_eq!(Device::cuda(2).to_string(), "cuda:2");
    }
}
