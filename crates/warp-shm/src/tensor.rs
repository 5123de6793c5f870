//! Tensor metadata and local tensor views

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::dtype::{DataType, Element};
use crate::error::{ShmError, ShmResult};
use crate::id::ObjectId;
use crate::segment::SharedRegion;

/// Layout and placement of a tensor buffer.
///
/// Strides are counted in elements, like shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorMeta {
    /// Device placement
    pub device: Device,
    /// Element dtype
    pub dtype: DataType,
    /// Extent of each dimension
    pub shape: Vec<usize>,
    /// Element stride of each dimension
    pub strides: Vec<usize>,
}

impl TensorMeta {
    /// Row-major compact metadata for `shape`
    pub fn contiguous(device: Device, dtype: DataType, shape: &[usize]) -> Self {
        Self {
            device,
            dtype,
            shape: shape.to_vec(),
            strides: compact_strides(shape),
        }
    }

    /// Number of elements, saturating on overflow
    pub fn numel(&self) -> usize {
        self.shape.iter().fold(1usize, |n, &d| n.saturating_mul(d))
    }

    /// Byte length of a contiguous buffer with this metadata, saturating on
    /// overflow. [`TensorMeta::checked_nbytes`] rejects such shapes.
    pub fn nbytes(&self) -> usize {
        self.numel().saturating_mul(self.dtype.size_bytes())
    }

    /// Byte length, failing when the shape describes more bytes than a
    /// buffer can hold
    pub fn checked_nbytes(&self) -> ShmResult<usize> {
        self.shape
            .iter()
            .try_fold(self.dtype.size_bytes(), |n, &d| n.checked_mul(d))
            .filter(|&n| n <= isize::MAX as usize)
            .ok_or_else(|| {
                ShmError::InvalidDescriptor(format!(
                    "shape {:?} of {} overflows the addressable size",
                    self.shape, self.dtype
                ))
            })
    }

    /// Number of dimensions
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Whether the strides describe a row-major compact layout.
    ///
    /// Dimensions of extent 1 may carry any stride.
    pub fn is_contiguous(&self) -> bool {
        if self.strides.len() != self.shape.len() {
            return false;
        }
        let mut expected = 1usize;
        for (&extent, &stride) in self.shape.iter().zip(&self.strides).rev() {
            if extent != 1 {
                if stride != expected {
                    return false;
                }
                expected = expected.saturating_mul(extent);
            }
        }
        true
    }

    /// Fail unless the store can hold a buffer with this metadata
    pub fn ensure_storable(&self) -> ShmResult<()> {
        self.device.ensure_shareable()?;
        self.checked_nbytes()?;
        if !self.is_contiguous() {
            return Err(ShmError::InvalidLayout(format!(
                "shape {:?} with strides {:?} is not contiguous",
                self.shape, self.strides
            )));
        }
        Ok(())
    }

    fn flat_index(&self, index: &[usize]) -> ShmResult<usize> {
        if index.len() != self.ndim() {
            return Err(ShmError::InvalidDescriptor(format!(
                "index of rank {} for tensor of rank {}",
                index.len(),
                self.ndim()
            )));
        }
        let mut offset = 0;
        for (dim, (&i, (&extent, &stride))) in index
            .iter()
            .zip(self.shape.iter().zip(&self.strides))
            .enumerate()
        {
            if i >= extent {
                return Err(ShmError::InvalidDescriptor(format!(
                    "index {i} out of bounds for dimension {dim} of extent {extent}"
                )));
            }
            offset += i * stride;
        }
        Ok(offset)
    }
}

/// Row-major compact strides for `shape`
pub fn compact_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1].saturating_mul(shape[i + 1]);
    }
    strides
}

/// A tensor buffer that can be written into the store
pub trait TensorSource {
    /// Layout and placement
    fn meta(&self) -> &TensorMeta;

    /// Raw bytes, `meta().nbytes()` long
    fn bytes(&self) -> &[u8];

    /// Store instance and object this buffer is a view of, if any
    fn backing_object(&self) -> Option<(u64, &ObjectId)> {
        None
    }
}

/// Host buffer aligned for every supported element type
#[derive(Clone)]
struct HostBuffer {
    words: Vec<u64>,
    len: usize,
}

impl HostBuffer {
    fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(8)],
            len,
        }
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = Self::zeroed(bytes.len());
        buf.as_mut_slice().copy_from_slice(bytes);
        buf
    }

    fn as_slice(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }
}

enum Storage {
    Host(HostBuffer),
    Shared {
        object: ObjectId,
        store_id: u64,
        region: SharedRegion,
    },
}

/// Process-local tensor.
///
/// Either owns a host buffer or is a view of a stored object. Views alias
/// the store's shared segment: in-place writes are observed by every other
/// view of the same object, in any process. Dropping a view unmaps it and
/// never deletes the stored object.
pub struct Tensor {
    meta: TensorMeta,
    storage: Storage,
}

impl Tensor {
    /// Owned tensor from typed elements, row-major
    pub fn from_vec<T: Element>(shape: &[usize], data: Vec<T>) -> ShmResult<Self> {
        Self::from_slice(shape, &data)
    }

    /// Owned tensor copied from typed elements, row-major
    pub fn from_slice<T: Element>(shape: &[usize], data: &[T]) -> ShmResult<Self> {
        let meta = TensorMeta::contiguous(Device::CPU, T::DTYPE, shape);
        Self::from_bytes(meta, bytemuck::cast_slice(data))
    }

    /// Owned zero-filled tensor
    pub fn zeros(dtype: DataType, shape: &[usize]) -> ShmResult<Self> {
        let meta = TensorMeta::contiguous(Device::CPU, dtype, shape);
        let buf = HostBuffer::zeroed(meta.checked_nbytes()?);
        Ok(Self {
            meta,
            storage: Storage::Host(buf),
        })
    }

    /// Owned tensor copied from raw bytes laid out as `meta` describes
    pub fn from_bytes(meta: TensorMeta, bytes: &[u8]) -> ShmResult<Self> {
        let nbytes = meta.checked_nbytes()?;
        if !meta.is_contiguous() {
            return Err(ShmError::InvalidLayout(format!(
                "shape {:?} with strides {:?} is not contiguous",
                meta.shape, meta.strides
            )));
        }
        if bytes.len() != nbytes {
            return Err(ShmError::InvalidDescriptor(format!(
                "expected {} bytes for shape {:?} of {}, got {}",
                nbytes,
                meta.shape,
                meta.dtype,
                bytes.len()
            )));
        }
        Ok(Self {
            meta,
            storage: Storage::Host(HostBuffer::from_bytes(bytes)),
        })
    }

    /// View of a stored object's mapped segment
    pub(crate) fn from_shared(
        meta: TensorMeta,
        object: ObjectId,
        store_id: u64,
        region: SharedRegion,
    ) -> ShmResult<Self> {
        if region.len() != meta.checked_nbytes()? {
            return Err(ShmError::Protocol(format!(
                "object {object} maps {} bytes, metadata describes {}",
                region.len(),
                meta.nbytes()
            )));
        }
        Ok(Self {
            meta,
            storage: Storage::Shared {
                object,
                store_id,
                region,
            },
        })
    }

    /// Layout and placement
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    /// Extent of each dimension
    pub fn shape(&self) -> &[usize] {
        &self.meta.shape
    }

    /// Element strides
    pub fn strides(&self) -> &[usize] {
        &self.meta.strides
    }

    /// Element dtype
    pub fn dtype(&self) -> DataType {
        self.meta.dtype
    }

    /// Device placement
    pub fn device(&self) -> Device {
        self.meta.device
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.meta.numel()
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Host(buf) => buf.as_slice(),
            Storage::Shared { region, .. } => region.as_slice(),
        }
    }

    /// Raw bytes, writable. Writes to a view land in the shared segment.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Host(buf) => buf.as_mut_slice(),
            Storage::Shared { region, .. } => region.as_mut_slice(),
        }
    }

    /// Typed elements
    pub fn as_slice<T: Element>(&self) -> ShmResult<&[T]> {
        self.check_dtype::<T>()?;
        // an empty mapping has no address aligned for T
        if self.as_bytes().is_empty() {
            return Ok(&[]);
        }
        bytemuck::try_cast_slice(self.as_bytes())
            .map_err(|e| ShmError::InvalidDescriptor(format!("cannot view buffer as elements: {e}")))
    }

    /// Typed elements, writable
    pub fn as_mut_slice<T: Element>(&mut self) -> ShmResult<&mut [T]> {
        self.check_dtype::<T>()?;
        if self.as_bytes().is_empty() {
            return Ok(&mut []);
        }
        bytemuck::try_cast_slice_mut(self.as_bytes_mut())
            .map_err(|e| ShmError::InvalidDescriptor(format!("cannot view buffer as elements: {e}")))
    }

    /// Copy out typed elements
    pub fn to_vec<T: Element>(&self) -> ShmResult<Vec<T>> {
        self.as_slice::<T>().map(<[T]>::to_vec)
    }

    /// Read the element at `index`
    pub fn get<T: Element>(&self, index: &[usize]) -> ShmResult<T> {
        let offset = self.meta.flat_index(index)?;
        Ok(self.as_slice::<T>()?[offset])
    }

    /// Write the element at `index`
    pub fn set<T: Element>(&mut self, index: &[usize], value: T) -> ShmResult<()> {
        let offset = self.meta.flat_index(index)?;
        self.as_mut_slice::<T>()?[offset] = value;
        Ok(())
    }

    /// Fill every element with `value`
    pub fn fill<T: Element>(&mut self, value: T) -> ShmResult<()> {
        self.as_mut_slice::<T>()?.fill(value);
        Ok(())
    }

    /// Store object this tensor is a view of
    pub fn object_id(&self) -> Option<&ObjectId> {
        match &self.storage {
            Storage::Host(_) => None,
            Storage::Shared { object, .. } => Some(object),
        }
    }

    /// Whether this tensor is a view of a stored object
    pub fn is_shared(&self) -> bool {
        matches!(self.storage, Storage::Shared { .. })
    }

    /// Independent host copy of this tensor
    pub fn to_owned_tensor(&self) -> Tensor {
        Tensor {
            meta: self.meta.clone(),
            storage: Storage::Host(HostBuffer::from_bytes(self.as_bytes())),
        }
    }

    fn check_dtype<T: Element>(&self) -> ShmResult<()> {
        if self.meta.dtype == T::DTYPE {
            Ok(())
        } else {
            Err(ShmError::DtypeMismatch {
                expected: self.meta.dtype.to_string(),
                actual: T::DTYPE.to_string(),
            })
        }
    }
}

impl TensorSource for Tensor {
    fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    fn bytes(&self) -> &[u8] {
        self.as_bytes()
    }

    fn backing_object(&self) -> Option<(u64, &ObjectId)> {
        match &self.storage {
            Storage::Host(_) => None,
            Storage::Shared {
                object, store_id, ..
            } => Some((*store_id, object)),
        }
    }
}

/// Value equality: same dtype, same shape, same bytes
impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.meta.dtype == other.meta.dtype
            && self.meta.shape == other.meta.shape
            && self.as_bytes() == other.as_bytes()
    }
}

impl Clone for Tensor {
    /// Cloning a view maps nothing new: the clone is an owned host copy.
    fn clone(&self) -> Self {
        self.to_owned_tensor()
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("device", &self.meta.device)
            .field("dtype", &self.meta.dtype)
            .field("shape", &self.meta.shape)
            .field("object", &self.object_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_strides() {
        assert_eq!(compact_strides(&[2, 3]), vec![3, 1]);
        assert_eq!(compact_strides(&[4, 2, 5]), vec![10, 5, 1]);
        assert!(compact_strides(&[]).is_empty());
    }

    #[test]
    fn test_contiguity() {
        let mut meta = TensorMeta::contiguous(Device::CPU, DataType::FLOAT32, &[2, 3]);
        assert!(meta.is_contiguous());

        // transposed view
        meta.shape = vec![3, 2];
        meta.strides = vec![1, 3];
        assert!(!meta.is_contiguous());

        // unit dimensions ignore their stride
        let meta = TensorMeta {
            device: Device::CPU,
            dtype: DataType::FLOAT32,
            shape: vec![1, 4],
            strides: vec![99, 1],
        };
        assert!(meta.is_contiguous());
    }

    #[test]
    fn test_typed_access() {
        let mut t = Tensor::from_vec(&[2, 3], vec![1i64, 2, 3, 5, 4, 6]).unwrap();
        assert_eq!(t.numel(), 6);
        assert_eq!(t.get::<i64>(&[1, 0]).unwrap(), 5);

        t.set::<i64>(&[0, 0], 999).unwrap();
        assert_eq!(t.to_vec::<i64>().unwrap(), vec![999, 2, 3, 5, 4, 6]);

        assert!(matches!(
            t.get::<f32>(&[0, 0]),
            Err(ShmError::DtypeMismatch { .. })
        ));
        assert!(t.get::<i64>(&[2, 0]).is_err());
        assert!(t.get::<i64>(&[0]).is_err());
    }

    #[test]
    fn test_from_bytes_validates_length() {
        let meta = TensorMeta::contiguous(Device::CPU, DataType::FLOAT32, &[4]);
        assert!(Tensor::from_bytes(meta.clone(), &[0u8; 16]).is_ok());
        assert!(Tensor::from_bytes(meta, &[0u8; 15]).is_err());
    }

    #[test]
    fn test_value_equality() {
        let a = Tensor::from_vec(&[2, 2], vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let b = a.clone();
        assert_eq!(a, b);

        let c = Tensor::from_vec(&[4], vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_storable_rejects_device_and_layout() {
        let meta = TensorMeta::contiguous(Device::cuda(0), DataType::FLOAT32, &[4]);
        assert!(matches!(
            meta.ensure_storable(),
            Err(ShmError::DeviceIncompatible { .. })
        ));

        let meta = TensorMeta {
            device: Device::CPU,
            dtype: DataType::FLOAT32,
            shape: vec![3, 2],
            strides: vec![1, 3],
        };
        assert!(matches!(
            meta.ensure_storable(),
            Err(ShmError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_zeros_and_fill() {
        let mut t = Tensor::zeros(DataType::FLOAT64, &[3]).unwrap();
        assert_eq!(t.to_vec::<f64>().unwrap(), vec![0.0; 3]);
        t.fill(2.5f64).unwrap();
        assert_eq!(t.to_vec::<f64>().unwrap(), vec![2.5; 3]);
        assert!(!t.is_shared());
        assert!(t.object_id().is_none());
    }

    #[test]
    fn test_overflowing_shape_is_an_error() {
        let meta = TensorMeta::contiguous(Device::CPU, DataType::INT64, &[1 << 62, 8]);
        assert!(matches!(
            meta.checked_nbytes(),
            Err(ShmError::InvalidDescriptor(_))
        ));
        assert!(matches!(
            Tensor::from_bytes(meta.clone(), &[]),
            Err(ShmError::InvalidDescriptor(_))
        ));
        assert!(matches!(
            meta.ensure_storable(),
            Err(ShmError::InvalidDescriptor(_))
        ));
        assert!(Tensor::zeros(DataType::UINT8, &[usize::MAX, 2]).is_err());
        assert_eq!(meta.nbytes(), usize::MAX);
    }

    #[test]
    fn test_zero_element_typed_access() {
        let mut t = Tensor::zeros(DataType::FLOAT32, &[0, 3]).unwrap();
        assert!(t.to_vec::<f32>().unwrap().is_empty());
        t.fill(1.0f32).unwrap();
        assert!(t.as_mut_slice::<f32>().unwrap().is_empty());
    }
}
