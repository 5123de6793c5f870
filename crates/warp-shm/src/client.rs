//! Blocking client for the shared-memory store
//!
//! Every operation is one request/response round trip over the store's Unix
//! socket. Stored bytes never travel over the socket: the store answers with
//! the segment holding an object and the client maps it.

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{ShmError, ShmResult};
use crate::id::ObjectId;
use crate::protocol::{self, frame_kind, Request, Response, StoreStats};
use crate::segment::{SegmentInfo, SharedRegion};
use crate::tensor::{Tensor, TensorMeta, TensorSource};

/// Largest response frame the client accepts
const MAX_RESPONSE_BYTES: u32 = 64 * 1024 * 1024;

/// How [`StoreClient::put_tensor`] treats the source and the returned tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOptions {
    /// Duplicate the source bytes into a new segment. When false and the
    /// source is already a view of an object in the same store, the new
    /// identifier becomes an alias of that object instead.
    pub copy: bool,
    /// Return a view aliasing the stored bytes rather than a host copy
    pub zero_copy: bool,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            copy: true,
            zero_copy: true,
        }
    }
}

impl PutOptions {
    /// Set `copy`
    pub fn copy(mut self, copy: bool) -> Self {
        self.copy = copy;
        self
    }

    /// Set `zero_copy`
    pub fn zero_copy(mut self, zero_copy: bool) -> Self {
        self.zero_copy = zero_copy;
        self
    }
}

/// Connection to one store.
///
/// Requests are serialised by an internal lock, so operations issued on one
/// client are strictly ordered. A client belongs to the process that opened
/// it; after a fork the child must connect again.
pub struct StoreClient {
    config: ClientConfig,
    stream: Mutex<UnixStream>,
    // set once a round trip fails midway and the channel can no longer be trusted
    broken: AtomicBool,
    pid: u32,
    store_id: u64,
    shm_dir: PathBuf,
    capacity_bytes: u64,
}

impl StoreClient {
    /// Connect to the store and complete the handshake.
    ///
    /// Fails with [`ShmError::Connection`] when nothing serves the endpoint
    /// and with [`ShmError::Timeout`] when the handshake overruns the
    /// connect deadline. There is no retry.
    pub fn connect(config: ClientConfig) -> ShmResult<Self> {
        config.validate()?;
        let mut stream = UnixStream::connect(&config.socket_path).map_err(|e| {
            ShmError::Connection(format!(
                "store not reachable at {}: {e}",
                config.socket_path.display()
            ))
        })?;

        stream.set_read_timeout(config.connect_timeout())?;
        stream.set_write_timeout(config.connect_timeout())?;

        let pid = std::process::id();
        protocol::write_frame(&mut stream, frame_kind::REQUEST, &Request::Hello { pid })
            .map_err(|e| ShmError::from_channel_io(e, "hello"))?;
        let welcome: Response =
            protocol::read_frame(&mut stream, frame_kind::RESPONSE, MAX_RESPONSE_BYTES)?;
        let (store_id, shm_dir, capacity_bytes) = match welcome.into_result()? {
            Response::Welcome {
                store_id,
                shm_dir,
                capacity_bytes,
            } => (store_id, shm_dir, capacity_bytes),
            other => return Err(unexpected("hello", &other)),
        };

        stream.set_read_timeout(config.io_timeout())?;
        stream.set_write_timeout(config.io_timeout())?;

        debug!(
            socket = %config.socket_path.display(),
            store_id = format_args!("{store_id:016x}"),
            pid,
            "Connected to store"
        );

        Ok(Self {
            config,
            stream: Mutex::new(stream),
            broken: AtomicBool::new(false),
            pid,
            store_id,
            shm_dir,
            capacity_bytes,
        })
    }

    /// Connection settings
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Random token identifying the connected store instance
    pub fn store_id(&self) -> u64 {
        self.store_id
    }

    /// Process that opened this connection
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Store arena directory
    pub fn shm_dir(&self) -> &Path {
        &self.shm_dir
    }

    /// Store capacity in bytes
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Write a tensor buffer into the store under `id`.
    ///
    /// Fails with [`ShmError::DuplicateIdentifier`] if `id` exists, and with
    /// [`ShmError::Capacity`] if the store has no room. The object becomes
    /// visible to `get` and `list` only once fully written.
    pub fn put_tensor<S>(&self, id: &ObjectId, source: &S, options: PutOptions) -> ShmResult<Tensor>
    where
        S: TensorSource + ?Sized,
    {
        let meta = source.meta();
        meta.ensure_storable()?;
        let bytes = source.bytes();
        if bytes.len() != meta.nbytes() {
            return Err(ShmError::InvalidDescriptor(format!(
                "buffer holds {} bytes, metadata describes {}",
                bytes.len(),
                meta.nbytes()
            )));
        }

        if !options.copy {
            match source.backing_object() {
                Some((store_id, source_id)) if store_id == self.store_id => {
                    let reply = self.request(&Request::Link {
                        id: id.clone(),
                        source: source_id.clone(),
                    })?;
                    let (meta, segment) = expect_segment("link", reply)?;
                    debug!(%id, source = %source_id, "Stored alias");
                    return self.open(id, meta, &segment, options.zero_copy);
                }
                _ => debug!(%id, "Source is not a view of this store, copying"),
            }
        }

        let reply = self.request(&Request::Create {
            id: id.clone(),
            meta: meta.clone(),
            nbytes: bytes.len() as u64,
        })?;
        let (meta, segment) = expect_segment("create", reply)?;

        match self.fill_and_seal(id, &meta, &segment, bytes, options.zero_copy) {
            Ok(tensor) => {
                debug!(%id, nbytes = bytes.len(), "Stored object");
                Ok(tensor)
            }
            Err(e) => {
                self.abort_quietly(id);
                Err(e)
            }
        }
    }

    fn fill_and_seal(
        &self,
        id: &ObjectId,
        meta: &TensorMeta,
        segment: &SegmentInfo,
        bytes: &[u8],
        zero_copy: bool,
    ) -> ShmResult<Tensor> {
        let mut region = SharedRegion::map(segment)?;
        if region.len() != bytes.len() {
            return Err(ShmError::Protocol(format!(
                "store allocated {} bytes for a {} byte object",
                region.len(),
                bytes.len()
            )));
        }
        region.as_mut_slice().copy_from_slice(bytes);

        let reply = self.request(&Request::Seal { id: id.clone() })?;
        expect_done("seal", reply)?;

        let view = Tensor::from_shared(meta.clone(), id.clone(), self.store_id, region)?;
        Ok(if zero_copy {
            view
        } else {
            view.to_owned_tensor()
        })
    }

    fn abort_quietly(&self, id: &ObjectId) {
        if self.broken.load(Ordering::Acquire) {
            // the store aborts it when this connection closes
            return;
        }
        if let Err(e) = self.request(&Request::Abort { id: id.clone() }) {
            warn!(%id, error = %e, "Failed to abort unsealed object");
        }
    }

    /// View of the object stored under `id`.
    ///
    /// The view aliases the stored bytes. Fails with [`ShmError::NotFound`]
    /// for identifiers the store does not hold, including objects whose put
    /// has not completed.
    pub fn get_tensor(&self, id: &ObjectId) -> ShmResult<Tensor> {
        let reply = self.request(&Request::Get { id: id.clone() })?;
        let (meta, segment) = expect_segment("get", reply)?;
        self.open(id, meta, &segment, true)
    }

    fn open(
        &self,
        id: &ObjectId,
        meta: TensorMeta,
        segment: &SegmentInfo,
        zero_copy: bool,
    ) -> ShmResult<Tensor> {
        let region = match SharedRegion::map(segment) {
            Ok(region) => region,
            // deleted between the reply and the mapping
            Err(ShmError::Protocol(_)) if !segment.path.exists() => {
                return Err(ShmError::NotFound(id.clone()))
            }
            Err(e) => return Err(e),
        };
        let view = Tensor::from_shared(meta, id.clone(), self.store_id, region)?;
        Ok(if zero_copy {
            view
        } else {
            view.to_owned_tensor()
        })
    }

    /// Identifiers currently stored, for diagnostics
    pub fn list(&self) -> ShmResult<Vec<ObjectId>> {
        match self.request(&Request::List)? {
            Response::Ids(ids) => Ok(ids),
            other => Err(unexpected("list", &other)),
        }
    }

    /// Whether the store holds `id`
    pub fn contains(&self, id: &ObjectId) -> ShmResult<bool> {
        match self.request(&Request::Contains { id: id.clone() })? {
            Response::Bool(found) => Ok(found),
            other => Err(unexpected("contains", &other)),
        }
    }

    /// Remove `id` from the store.
    ///
    /// Views already open stay valid; the bytes are reclaimed once no
    /// identifier references them.
    pub fn delete(&self, id: &ObjectId) -> ShmResult<()> {
        let reply = self.request(&Request::Delete { id: id.clone() })?;
        expect_done("delete", reply)
    }

    /// Store usage counters
    pub fn stats(&self) -> ShmResult<StoreStats> {
        match self.request(&Request::Stats)? {
            Response::Stats(stats) => Ok(stats),
            other => Err(unexpected("stats", &other)),
        }
    }

    fn request(&self, request: &Request) -> ShmResult<Response> {
        let op = request.op_name();
        let current = std::process::id();
        if current != self.pid {
            return Err(ShmError::Connection(format!(
                "connection opened by process {} used from process {current}; connect again",
                self.pid
            )));
        }
        if self.broken.load(Ordering::Acquire) {
            return Err(ShmError::Connection(
                "connection unusable after an earlier failed round trip".into(),
            ));
        }

        let mut stream = self.stream.lock();
        let reply = protocol::write_frame(&mut *stream, frame_kind::REQUEST, request)
            .map_err(|e| ShmError::from_channel_io(e, op))
            .and_then(|()| {
                protocol::read_frame::<_, Response>(
                    &mut *stream,
                    frame_kind::RESPONSE,
                    MAX_RESPONSE_BYTES,
                )
            });
        match reply {
            Ok(response) => response.into_result(),
            Err(e) => {
                self.broken.store(true, Ordering::Release);
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClient")
            .field("socket_path", &self.config.socket_path)
            .field("store_id", &format_args!("{:016x}", self.store_id))
            .field("pid", &self.pid)
            .finish()
    }
}

fn expect_segment(op: &str, reply: Response) -> ShmResult<(TensorMeta, SegmentInfo)> {
    match reply {
        Response::Segment { meta, segment } => Ok((meta, segment)),
        other => Err(unexpected(op, &other)),
    }
}

fn expect_done(op: &str, reply: Response) -> ShmResult<()> {
    match reply {
        Response::Done => Ok(()),
        other => Err(unexpected(op, &other)),
    }
}

fn unexpected(op: &str, reply: &Response) -> ShmError {
    ShmError::Protocol(format!("unexpected reply to {op}: {reply:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::server::spawn_background;

    #[test]
    fn test_connect_without_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::with_socket(dir.path().join("absent.sock"));
        let err = StoreClient::connect(config).unwrap_err();
        assert!(matches!(err, ShmError::Connection(_)));
    }

    #[test]
    fn test_handshake_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silent.sock");
        // accepts connections but never answers
        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let config = ClientConfig {
            connect_timeout_ms: 100,
            ..ClientConfig::with_socket(&path)
        };
        let err = StoreClient::connect(config).unwrap_err();
        assert!(matches!(err, ShmError::Timeout(_)), "got {err}");
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = spawn_background(StoreConfig::in_dir(dir.path())).unwrap();
        let client = StoreClient::connect(store.client_config()).unwrap();
        assert_eq!(client.store_id(), store.store_id());

        let id = ObjectId::new("weights").unwrap();
        let t = Tensor::from_vec(&[2, 2], vec![1.5f32, -2.0, 3.25, 0.0]).unwrap();
        let stored = client.put_tensor(&id, &t, PutOptions::default()).unwrap();
        assert!(stored.is_shared());
        assert_eq!(stored.object_id(), Some(&id));

        let fetched = client.get_tensor(&id).unwrap();
        assert_eq!(fetched, t);
        assert_eq!(fetched.meta(), t.meta());
        assert!(client.contains(&id).unwrap());
        assert_eq!(client.list().unwrap(), vec![id.clone()]);

        client.delete(&id).unwrap();
        assert!(!client.contains(&id).unwrap());
        // open views survive deletion
        assert_eq!(fetched.to_vec::<f32>().unwrap(), vec![1.5, -2.0, 3.25, 0.0]);
    }

    #[test]
    fn test_put_rejects_device_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = spawn_background(StoreConfig::in_dir(dir.path())).unwrap();
        let client = StoreClient::connect(store.client_config()).unwrap();

        let meta = TensorMeta::contiguous(
            crate::device::Device::cuda(0),
            crate::dtype::DataType::FLOAT32,
            &[2],
        );
        struct Foreign(TensorMeta, Vec<u8>);
        impl TensorSource for Foreign {
            fn meta(&self) -> &TensorMeta {
                &self.0
            }
            fn bytes(&self) -> &[u8] {
                &self.1
            }
        }
        let source = Foreign(meta, vec![0; 8]);
        let err = client
            .put_tensor(&ObjectId::new("gpu").unwrap(), &source, PutOptions::default())
            .unwrap_err();
        assert!(matches!(err, ShmError::DeviceIncompatible { .. }));
        assert!(client.list().unwrap().is_empty());
    }

    #[test]
    fn test_put_options_builders() {
        let options = PutOptions::default().copy(false).zero_copy(false);
        assert!(!options.copy);
        assert!(!options.zero_copy);
    }
}
