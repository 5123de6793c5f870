//! Object arena and index
//!
//! Every object's bytes live in one segment file inside the store's arena
//! directory. The index maps identifiers to segments; aliases created by
//! `link` share a segment. A segment file is unlinked, and its bytes handed
//! back to the capacity budget, once no identifier references it anymore.
//! Clients that already mapped it keep a valid mapping.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{ShmError, ShmResult};
use crate::id::ObjectId;
use crate::protocol::StoreStats;
use crate::segment::{create_segment_file, SegmentInfo};
use crate::tensor::TensorMeta;

/// Prefix of segment file names inside the arena directory
pub(crate) const SEGMENT_PREFIX: &str = "seg-";

/// Connection-scoped token identifying who created an unsealed object
pub(crate) type SessionId = u64;

/// One segment file and its share of the capacity budget
struct Segment {
    path: PathBuf,
    nbytes: u64,
    used: Arc<AtomicU64>,
}

impl Segment {
    fn info(&self) -> SegmentInfo {
        SegmentInfo {
            path: self.path.clone(),
            nbytes: self.nbytes,
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove segment");
            }
        }
        self.used.fetch_sub(self.nbytes, Ordering::AcqRel);
    }
}

struct Entry {
    meta: TensorMeta,
    segment: Arc<Segment>,
    // Some(session) until sealed
    creator: Option<SessionId>,
}

impl Entry {
    fn is_sealed(&self) -> bool {
        self.creator.is_none()
    }
}

#[derive(Default)]
struct Index {
    entries: HashMap<ObjectId, Entry>,
    // identifiers whose segment file is being created
    reserved: HashSet<ObjectId>,
}

impl Index {
    fn is_taken(&self, id: &ObjectId) -> bool {
        self.entries.contains_key(id) || self.reserved.contains(id)
    }
}

/// Index of stored objects with capacity accounting
pub struct ObjectTable {
    dir: PathBuf,
    capacity: u64,
    used: Arc<AtomicU64>,
    next_segment: AtomicU64,
    index: Mutex<Index>,
}

impl ObjectTable {
    /// Table allocating segments inside `dir`
    pub fn new(dir: &Path, capacity: u64) -> Self {
        Self {
            dir: dir.to_path_buf(),
            capacity,
            used: Arc::new(AtomicU64::new(0)),
            next_segment: AtomicU64::new(0),
            index: Mutex::new(Index::default()),
        }
    }

    /// Arena directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Allocate an unsealed object of `nbytes` bytes owned by `session`.
    ///
    /// The identifier and its bytes are reserved before the segment file is
    /// created, sealed or not, so a second create for it fails with
    /// [`ShmError::DuplicateIdentifier`]. File creation runs outside the
    /// index lock.
    pub(crate) fn create(
        &self,
        session: SessionId,
        id: ObjectId,
        meta: TensorMeta,
        nbytes: u64,
    ) -> ShmResult<SegmentInfo> {
        meta.ensure_storable()?;
        if meta.nbytes() as u64 != nbytes {
            return Err(ShmError::InvalidDescriptor(format!(
                "metadata describes {} bytes, create asked for {nbytes}",
                meta.nbytes()
            )));
        }

        {
            let mut index = self.index.lock();
            if index.is_taken(&id) {
                return Err(ShmError::DuplicateIdentifier(id));
            }

            let used = self.used.load(Ordering::Acquire);
            let available = self.capacity.saturating_sub(used);
            if nbytes > available {
                return Err(ShmError::Capacity {
                    requested: nbytes,
                    available,
                });
            }
            self.used.fetch_add(nbytes, Ordering::AcqRel);
            index.reserved.insert(id.clone());
        }

        // owns the reserved bytes from here on; dropping it releases them
        let n = self.next_segment.fetch_add(1, Ordering::Relaxed);
        let segment = Arc::new(Segment {
            path: self.dir.join(format!("{SEGMENT_PREFIX}{n:016x}")),
            nbytes,
            used: Arc::clone(&self.used),
        });
        let created = create_segment_file(&segment.path, nbytes);

        let mut index = self.index.lock();
        index.reserved.remove(&id);
        if let Err(e) = created {
            drop(index);
            drop(segment);
            return Err(e);
        }
        let info = segment.info();
        debug!(%id, nbytes, segment = %info.path.display(), "Created object");
        index.entries.insert(
            id,
            Entry {
                meta,
                segment,
                creator: Some(session),
            },
        );
        Ok(info)
    }

    /// Publish an object created by `session`
    pub(crate) fn seal(&self, session: SessionId, id: &ObjectId) -> ShmResult<()> {
        let mut index = self.index.lock();
        let entry = index
            .entries
            .get_mut(id)
            .ok_or_else(|| ShmError::NotFound(id.clone()))?;
        match entry.creator {
            Some(creator) if creator == session => {
                entry.creator = None;
                debug!(%id, "Sealed object");
                Ok(())
            }
            Some(_) => Err(ShmError::Protocol(format!(
                "object {id} was created by another connection"
            ))),
            None => Err(ShmError::Protocol(format!("object {id} is already sealed"))),
        }
    }

    /// Discard an unsealed object created by `session`
    pub(crate) fn abort(&self, session: SessionId, id: &ObjectId) -> ShmResult<()> {
        let mut index = self.index.lock();
        match index.entries.get(id).map(|e| e.creator) {
            None => Err(ShmError::NotFound(id.clone())),
            Some(Some(creator)) if creator == session => {
                let removed = index.entries.remove(id);
                drop(index);
                drop(removed);
                debug!(%id, "Aborted object");
                Ok(())
            }
            Some(_) => Err(ShmError::Protocol(format!(
                "object {id} is not an unsealed object of this connection"
            ))),
        }
    }

    /// Discard every unsealed object created by `session`, returning how many
    pub(crate) fn abort_session(&self, session: SessionId) -> usize {
        let removed: Vec<Entry> = {
            let mut index = self.index.lock();
            let ids: Vec<ObjectId> = index
                .entries
                .iter()
                .filter(|(_, entry)| entry.creator == Some(session))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| index.entries.remove(id))
                .collect()
        };
        // segment files are removed here, outside the lock
        removed.len()
    }

    /// Register `id` as another name for the bytes of sealed `source`
    pub(crate) fn link(&self, id: ObjectId, source: &ObjectId) -> ShmResult<(TensorMeta, SegmentInfo)> {
        let mut index = self.index.lock();
        if index.is_taken(&id) {
            return Err(ShmError::DuplicateIdentifier(id));
        }
        let (meta, segment) = match index.entries.get(source) {
            Some(entry) if entry.is_sealed() => (entry.meta.clone(), Arc::clone(&entry.segment)),
            _ => return Err(ShmError::NotFound(source.clone())),
        };
        let info = segment.info();
        debug!(%id, %source, "Linked object");
        index.entries.insert(
            id,
            Entry {
                meta: meta.clone(),
                segment,
                creator: None,
            },
        );
        Ok((meta, info))
    }

    /// Metadata and segment of a sealed object
    pub(crate) fn get(&self, id: &ObjectId) -> ShmResult<(TensorMeta, SegmentInfo)> {
        let index = self.index.lock();
        match index.entries.get(id) {
            Some(entry) if entry.is_sealed() => Ok((entry.meta.clone(), entry.segment.info())),
            _ => Err(ShmError::NotFound(id.clone())),
        }
    }

    /// Whether a sealed object exists
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.index
            .lock()
            .entries
            .get(id)
            .is_some_and(Entry::is_sealed)
    }

    /// Sealed identifiers, sorted
    pub fn list(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self
            .index
            .lock()
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_sealed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Remove a sealed identifier from the index
    pub(crate) fn delete(&self, id: &ObjectId) -> ShmResult<()> {
        let removed = {
            let mut index = self.index.lock();
            match index.entries.get(id) {
                Some(entry) if entry.is_sealed() => index.entries.remove(id),
                _ => return Err(ShmError::NotFound(id.clone())),
            }
        };
        // segment file goes away here if this was its last alias
        drop(removed);
        debug!(%id, "Deleted object");
        Ok(())
    }

    /// Usage counters
    pub fn stats(&self) -> StoreStats {
        let index = self.index.lock();
        let segments: HashSet<*const Segment> =
            index.entries.values().map(|e| Arc::as_ptr(&e.segment)).collect();
        StoreStats {
            objects: index.entries.values().filter(|e| e.is_sealed()).count(),
            segments: segments.len(),
            used_bytes: self.used.load(Ordering::Acquire),
            capacity_bytes: self.capacity,
        }
    }

    /// Drop every object and remove its segment file
    pub fn clear(&self) {
        let entries = std::mem::take(&mut self.index.lock().entries);
        drop(entries);
    }
}
