//! Shared mappings of store-owned segments

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use serde::{Deserialize, Serialize};

use crate::error::{ShmError, ShmResult};

/// Location of a stored object's bytes inside the store arena
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Segment file inside the store's arena directory
    pub path: PathBuf,
    /// Byte length of the object
    pub nbytes: u64,
}

/// Read-write shared mapping of one segment.
///
/// The mapping is `MAP_SHARED`: writes are visible to every other mapping of
/// the same segment, in this process or any other. Dropping a region only
/// unmaps it; the segment itself belongs to the store.
pub struct SharedRegion {
    path: PathBuf,
    // None for zero-length objects, which cannot be mapped
    mmap: Option<MmapMut>,
}

impl SharedRegion {
    /// Map a segment described by the store
    pub fn map(info: &SegmentInfo) -> ShmResult<Self> {
        let len = usize::try_from(info.nbytes).map_err(|_| {
            ShmError::Protocol(format!("segment of {} bytes exceeds address space", info.nbytes))
        })?;
        Self::map_path(&info.path, len)
    }

    fn map_path(path: &Path, len: usize) -> ShmResult<Self> {
        if len == 0 {
            return Ok(Self {
                path: path.to_path_buf(),
                mmap: None,
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| map_open_error(path, e))?;
        let actual = file.metadata()?.len();
        if actual < len as u64 {
            return Err(ShmError::Protocol(format!(
                "segment {} holds {actual} bytes, expected {len}",
                path.display()
            )));
        }

        // SAFETY: the segment file is sized by the store before it is handed
        // out and is never truncated while listed. Other processes may write
        // through their own mappings concurrently; that is the documented
        // aliasing contract of the store, and we only hand out byte slices
        // (no references into the region outlive a borrow of `self`).
        let mmap = unsafe { memmap2::MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self {
            path: path.to_path_buf(),
            mmap: Some(mmap),
        })
    }

    /// Mapped bytes
    pub fn as_slice(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    /// Mapped bytes, writable
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.mmap.as_deref_mut().unwrap_or(&mut [])
    }

    /// Byte length
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Segment path this region maps
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("path", &self.path)
            .field("len", &self.len())
            .finish()
    }
}

fn map_open_error(path: &Path, err: std::io::Error) -> ShmError {
    if err.kind() == std::io::ErrorKind::NotFound {
        ShmError::Protocol(format!(
            "segment {} vanished before it could be mapped",
            path.display()
        ))
    } else {
        ShmError::Io(err)
    }
}

/// Create a zero-filled segment file of `nbytes` bytes.
///
/// Used by the store when it allocates a new object.
pub(crate) fn create_segment_file(path: &Path, nbytes: u64) -> ShmResult<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;
    file.set_len(nbytes)?;
    Ok(file)
}
