//! Per-store arena directories
//!
//! Several stores may share one `shm_dir`. Each owns a subdirectory
//! `store-{store_id:016x}` holding its segment files and an `endpoint` file
//! naming the socket it serves. An arena whose endpoint no longer accepts
//! connections belongs to a dead store and is removed by the next store that
//! starts in the same directory.

use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::ShmResult;

/// Prefix of arena directory names inside `shm_dir`
pub(crate) const ARENA_PREFIX: &str = "store-";

const PENDING_PREFIX: &str = ".pending-";
const ENDPOINT_FILE: &str = "endpoint";

/// Arena directory name of store `store_id`
pub(crate) fn arena_name(store_id: u64) -> String {
    format!("{ARENA_PREFIX}{store_id:016x}")
}

/// Create the arena of a store serving `socket_path`.
///
/// The directory only appears under its final name once the endpoint file
/// is written, so a concurrently starting store never mistakes it for a
/// dead one.
pub(crate) fn create_arena(shm_dir: &Path, store_id: u64, socket_path: &Path) -> ShmResult<PathBuf> {
    let pending = shm_dir.join(format!("{PENDING_PREFIX}{store_id:016x}"));
    std::fs::create_dir(&pending)?;
    let endpoint = std::path::absolute(socket_path)?;
    std::fs::write(pending.join(ENDPOINT_FILE), endpoint.as_os_str().as_bytes())?;

    let arena = shm_dir.join(arena_name(store_id));
    std::fs::rename(&pending, &arena)?;
    Ok(arena)
}

fn recorded_endpoint(arena: &Path) -> Option<PathBuf> {
    std::fs::read(arena.join(ENDPOINT_FILE))
        .ok()
        .map(|bytes| PathBuf::from(OsString::from_vec(bytes)))
}

/// Remove arenas of stores that are no longer running, returning how many.
///
/// `own_socket` is the endpoint the calling store just bound: an arena
/// recording it belonged to a previous store on that endpoint.
pub(crate) fn clear_stale_arenas(shm_dir: &Path, own_socket: &Path) -> ShmResult<usize> {
    let own_socket = std::path::absolute(own_socket)?;
    let mut removed = 0;
    for entry in std::fs::read_dir(shm_dir)? {
        let entry = entry?;
        let is_arena = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(ARENA_PREFIX));
        if !is_arena || !entry.file_type()?.is_dir() {
            continue;
        }

        let path = entry.path();
        let live = match recorded_endpoint(&path) {
            Some(endpoint) if endpoint == own_socket => false,
            Some(endpoint) => UnixStream::connect(&endpoint).is_ok(),
            None => false,
        };
        if live {
            debug!(arena = %path.display(), "Arena owned by a running store");
            continue;
        }

        match std::fs::remove_dir_all(&path) {
            Ok(()) => removed += 1,
            // another starting store removed it first
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(removed)
}

/// Remove a store's arena on shutdown
pub(crate) fn remove_arena(arena: &Path) {
    if let Err(e) = std::fs::remove_dir_all(arena) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(arena = %arena.display(), error = %e, "Failed to remove arena");
        }
    }
}
