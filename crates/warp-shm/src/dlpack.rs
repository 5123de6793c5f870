//! DLPack interop
//!
//! DLPack is the cross-library tensor descriptor: device, dtype, shape,
//! strides and a raw data pointer. This module defines the ABI structs and
//! converts between them and [`TensorMeta`] without copying the bytes:
//!
//! - [`DlpackTensor::from_raw`] borrows a foreign buffer as a
//!   [`TensorSource`] so it can be written straight into the store.
//! - [`Tensor::to_dlpack`] exposes a tensor (including a store view) as a
//!   `DLTensor` pointing at the same bytes, for as long as the tensor is
//!   mutably borrowed.
//!
//! Buffers on devices the CPU cannot address are rejected with
//! [`ShmError::DeviceIncompatible`]; there is no implicit copy to host.

use std::ffi::c_void;
use std::marker::PhantomData;

use crate::device::{Device, DeviceKind};
use crate::dtype::{DataType, DataTypeCode};
use crate::error::{ShmError, ShmResult};
use crate::tensor::{compact_strides, Tensor, TensorMeta, TensorSource};

/// DLPack `DLDevice`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DLDevice {
    /// Device type code
    pub device_type: i32,
    /// Device ordinal
    pub device_id: i32,
}

/// DLPack `DLDataType`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DLDataType {
    /// Type code
    pub code: u8,
    /// Bits per lane
    pub bits: u8,
    /// Vector lanes
    pub lanes: u16,
}

/// DLPack `DLTensor`
#[repr(C)]
#[derive(Debug)]
pub struct DLTensor {
    /// Opaque data pointer
    pub data: *mut c_void,
    /// Device of the data
    pub device: DLDevice,
    /// Number of dimensions
    pub ndim: i32,
    /// Element type
    pub dtype: DLDataType,
    /// Shape array of `ndim` entries
    pub shape: *mut i64,
    /// Stride array of `ndim` entries in elements, or null for compact row-major
    pub strides: *mut i64,
    /// Byte offset from `data` to the first element
    pub byte_offset: u64,
}

impl From<Device> for DLDevice {
    fn from(device: Device) -> Self {
        Self {
            device_type: device.kind.code(),
            device_id: device.index as i32,
        }
    }
}

impl TryFrom<DLDevice> for Device {
    type Error = ShmError;

    fn try_from(device: DLDevice) -> ShmResult<Self> {
        let index = u32::try_from(device.device_id).map_err(|_| {
            ShmError::InvalidDescriptor(format!("negative device id {}", device.device_id))
        })?;
        Ok(Device::new(DeviceKind::from_code(device.device_type)?, index))
    }
}

impl From<DataType> for DLDataType {
    fn from(dtype: DataType) -> Self {
        Self {
            code: dtype.code as u8,
            bits: dtype.bits,
            lanes: dtype.lanes,
        }
    }
}

impl TryFrom<DLDataType> for DataType {
    type Error = ShmError;

    fn try_from(dtype: DLDataType) -> ShmResult<Self> {
        DataType::new(DataTypeCode::from_code(dtype.code)?, dtype.bits, dtype.lanes)
    }
}

/// Foreign tensor buffer borrowed through a `DLTensor`
pub struct DlpackTensor<'a> {
    meta: TensorMeta,
    data: &'a [u8],
}

impl<'a> DlpackTensor<'a> {
    /// Borrow the buffer a `DLTensor` describes.
    ///
    /// Fails with [`ShmError::DeviceIncompatible`] for memory the CPU cannot
    /// address, before touching the data pointer.
    ///
    /// # Safety
    ///
    /// `tensor.shape` (and `tensor.strides` when non-null) must point to
    /// `ndim` readable `i64`s, and `data + byte_offset` must point to a
    /// readable host buffer covering every element, valid and not mutated
    /// for `'a`.
    pub unsafe fn from_raw(tensor: &'a DLTensor) -> ShmResult<Self> {
        let device = Device::try_from(tensor.device)?;
        device.ensure_shareable()?;
        let dtype = DataType::try_from(tensor.dtype)?;

        let ndim = usize::try_from(tensor.ndim)
            .map_err(|_| ShmError::InvalidDescriptor(format!("negative ndim {}", tensor.ndim)))?;
        let shape = read_dims(tensor.shape, ndim, "shape")?;
        let strides = if tensor.strides.is_null() {
            compact_strides(&shape)
        } else {
            read_dims(tensor.strides, ndim, "strides")?
        };

        let meta = TensorMeta {
            device,
            dtype,
            shape,
            strides,
        };
        meta.ensure_storable()?;

        let nbytes = meta.nbytes();
        let data = if nbytes == 0 {
            &[][..]
        } else {
            if tensor.data.is_null() {
                return Err(ShmError::InvalidDescriptor(
                    "null data pointer for non-empty tensor".into(),
                ));
            }
            let offset = usize::try_from(tensor.byte_offset).map_err(|_| {
                ShmError::InvalidDescriptor(format!("byte offset {} overflows", tensor.byte_offset))
            })?;
            // SAFETY: caller guarantees the buffer covers every element
            unsafe { std::slice::from_raw_parts((tensor.data as *const u8).add(offset), nbytes) }
        };

        Ok(Self { meta, data })
    }
}

/// # Safety
///
/// `ptr` must be null or point to `ndim` readable `i64`s.
unsafe fn read_dims(ptr: *const i64, ndim: usize, what: &str) -> ShmResult<Vec<usize>> {
    if ndim == 0 {
        return Ok(Vec::new());
    }
    if ptr.is_null() {
        return Err(ShmError::InvalidDescriptor(format!("null {what} pointer")));
    }
    // SAFETY: checked non-null, caller guarantees ndim entries
    let dims = unsafe { std::slice::from_raw_parts(ptr, ndim) };
    dims.iter()
        .map(|&d| {
            usize::try_from(d)
                .map_err(|_| ShmError::InvalidDescriptor(format!("negative {what} entry {d}")))
        })
        .collect()
}

impl TensorSource for DlpackTensor<'_> {
    fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    fn bytes(&self) -> &[u8] {
        self.data
    }
}

/// A `DLTensor` describing a borrowed [`Tensor`].
///
/// Owns the shape and stride arrays the descriptor points into; the data
/// pointer stays valid while this export lives.
pub struct DlpackExport<'a> {
    raw: DLTensor,
    _shape: Vec<i64>,
    _strides: Vec<i64>,
    _borrow: PhantomData<&'a mut [u8]>,
}

impl DlpackExport<'_> {
    /// The descriptor
    pub fn as_raw(&self) -> &DLTensor {
        &self.raw
    }
}

impl Tensor {
    /// Describe this tensor's bytes as a `DLTensor` without copying them.
    ///
    /// For a store view the pointer targets the shared segment, so writes
    /// through it are visible to every other view of the object.
    pub fn to_dlpack(&mut self) -> DlpackExport<'_> {
        let mut shape: Vec<i64> = self.shape().iter().map(|&d| d as i64).collect();
        let mut strides: Vec<i64> = self.strides().iter().map(|&s| s as i64).collect();
        let device = DLDevice::from(self.device());
        let dtype = DLDataType::from(self.dtype());
        let ndim = shape.len() as i32;
        let data = self.as_bytes_mut().as_mut_ptr().cast::<c_void>();

        let raw = DLTensor {
            data,
            device,
            ndim,
            dtype,
            shape: shape.as_mut_ptr(),
            strides: strides.as_mut_ptr(),
            byte_offset: 0,
        };
        DlpackExport {
            raw,
            _shape: shape,
            _strides: strides,
            _borrow: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_through_dlpack() {
        let mut t = Tensor::from_vec(&[2, 3], vec![1i64, 2, 3, 5, 4, 6]).unwrap();
        let expected = t.clone();
        let export = t.to_dlpack();

        let borrowed = unsafe { DlpackTensor::from_raw(export.as_raw()) }.unwrap();
        assert_eq!(borrowed.meta(), expected.meta());
        assert_eq!(borrowed.bytes(), expected.as_bytes());
    }

    #[test]
    fn test_null_strides_and_byte_offset() {
        let mut data = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut shape = [1i64, 5];
        let raw = DLTensor {
            data: data.as_mut_ptr().cast(),
            device: DLDevice::from(Device::CPU),
            ndim: 2,
            dtype: DataType::FLOAT32.into(),
            shape: shape.as_mut_ptr(),
            strides: std::ptr::null_mut(),
            byte_offset: 4,
        };
        let t = unsafe { DlpackTensor::from_raw(&raw) }.unwrap();
        assert_eq!(t.meta().strides, vec![5, 1]);
        assert_eq!(t.bytes(), bytemuck::cast_slice::<f32, u8>(&data[1..]));
    }

    #[test]
    fn test_accelerator_memory_rejected() {
        let mut shape = [4i64];
        let raw = DLTensor {
            data: std::ptr::null_mut(),
            device: DLDevice::from(Device::cuda(0)),
            ndim: 1,
            dtype: DataType::FLOAT32.into(),
            shape: shape.as_mut_ptr(),
            strides: std::ptr::null_mut(),
            byte_offset: 0,
        };
        let err = unsafe { DlpackTensor::from_raw(&raw) }.err().unwrap();
        assert!(matches!(err, ShmError::DeviceIncompatible { .. }));
    }

    #[test]
    fn test_overflowing_shape_rejected() {
        let mut data = [0u8; 8];
        let mut shape = [1i64 << 62, 8];
        let raw = DLTensor {
            data: data.as_mut_ptr().cast(),
            device: DLDevice::from(Device::CPU),
            ndim: 2,
            dtype: DataType::INT64.into(),
            shape: shape.as_mut_ptr(),
            strides: std::ptr::null_mut(),
            byte_offset: 0,
        };
        let err = unsafe { DlpackTensor::from_raw(&raw) }.err().unwrap();
        assert!(matches!(err, ShmError::InvalidDescriptor(_)), "got {err}");
    }

    #[test]
    fn test_non_contiguous_rejected() {
        let mut data = [0u8; 6];
        let mut shape = [3i64, 2];
        let mut strides = [1i64, 3];
        let raw = DLTensor {
            data: data.as_mut_ptr().cast(),
            device: DLDevice::from(Device::CPU),
            ndim: 2,
            dtype: DataType::UINT8.into(),
            shape: shape.as_mut_ptr(),
            strides: strides.as_mut_ptr(),
            byte_offset: 0,
        };
        let err = unsafe { DlpackTensor::from_raw(&raw) }.err().unwrap();
        assert!(matches!(err, ShmError::InvalidLayout(_)));
    }

    #[test]
    fn test_null_data_rejected() {
        let mut shape = [2i64];
        let raw = DLTensor {
            data: std::ptr::null_mut(),
            device: DLDevice::from(Device::CPU),
            ndim: 1,
            dtype: DataType::INT32.into(),
            shape: shape.as_mut_ptr(),
            strides: std::ptr::null_mut(),
            byte_offset: 0,
        };
        let err = unsafe { DlpackTensor::from_raw(&raw) }.err().unwrap();
        assert!(matches!(err, ShmError::InvalidDescriptor(_)));
    }
}
