//! Transparent tensor transport
//!
//! A [`ForkingCodec`] serializes values that are about to cross a process
//! boundary. Once a [`TransportHook`] is registered with it, every
//! [`Tensor`] inside the value is written to the store and replaced on the
//! wire by a [`TensorRef`]; decoding resolves the reference back into a view
//! of the stored object. Callers pass tensors exactly as they would without
//! the store.
//!
//! ```no_run
//! use std::sync::Arc;
//! use warp_shm::{ClientConfig, ForkingCodec, StoreClient, Tensor, TransportHook};
//!
//! # fn main() -> warp_shm::ShmResult<()> {
//! let client = Arc::new(StoreClient::connect(ClientConfig::from_env())?);
//! let codec = ForkingCodec::new();
//! codec.register(TransportHook::new(client));
//!
//! let t = Tensor::from_vec(&[2, 3], vec![1i64, 2, 3, 5, 4, 6])?;
//! let wire = codec.encode(&("batch", &t))?;
//! let (_, back): (String, Tensor) = codec.decode(&wire)?;
//! assert_eq!(back, t);
//! # Ok(())
//! # }
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::ser::{self, Serializer};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::client::{PutOptions, StoreClient};
use crate::error::{ShmError, ShmResult};
use crate::id::{IdGenerator, ObjectId};
use crate::tensor::{Tensor, TensorMeta, TensorSource};

/// Attempts at drawing an unused identifier before giving up
const MAX_ID_ATTEMPTS: usize = 4;

/// What travels in place of a tensor's bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorRef {
    /// Store instance holding the object
    pub store_id: u64,
    /// Stored object
    pub id: ObjectId,
}

/// Turns tensors into store references and back
pub struct TransportHook {
    client: Arc<StoreClient>,
    ids: IdGenerator,
}

impl TransportHook {
    /// Hook writing through `client` with default-length generated identifiers
    pub fn new(client: Arc<StoreClient>) -> Self {
        Self::with_ids(client, IdGenerator::new())
    }

    /// Hook drawing identifiers from `ids`
    pub fn with_ids(client: Arc<StoreClient>, ids: IdGenerator) -> Self {
        Self { client, ids }
    }

    /// Store connection
    pub fn client(&self) -> &Arc<StoreClient> {
        &self.client
    }

    /// Store `tensor` and return the reference to send instead.
    ///
    /// A tensor that already is a view of this store travels under its
    /// existing identifier without touching the store.
    pub fn reduce(&self, tensor: &Tensor) -> ShmResult<TensorRef> {
        self.reduce_tracked(tensor).map(|(reference, _)| reference)
    }

    /// Like [`TransportHook::reduce`], also telling whether a new object was
    /// written
    fn reduce_tracked(&self, tensor: &Tensor) -> ShmResult<(TensorRef, bool)> {
        let store_id = self.client.store_id();
        if let Some((owner, id)) = tensor.backing_object() {
            if owner == store_id {
                let reference = TensorRef {
                    store_id,
                    id: id.clone(),
                };
                return Ok((reference, false));
            }
        }

        let mut attempts = 0;
        loop {
            let id = self.ids.generate();
            match self.client.put_tensor(&id, tensor, PutOptions::default()) {
                Ok(_) => {
                    debug!(%id, shape = ?tensor.shape(), "Reduced tensor");
                    return Ok((TensorRef { store_id, id }, true));
                }
                Err(ShmError::DuplicateIdentifier(taken)) if attempts + 1 < MAX_ID_ATTEMPTS => {
                    debug!(id = %taken, "Generated identifier taken, drawing another");
                    attempts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reconstruct the view a reference points to
    pub fn rebuild(&self, reference: &TensorRef) -> ShmResult<Tensor> {
        if reference.store_id != self.client.store_id() {
            return Err(ShmError::Connection(format!(
                "tensor {} lives in store {:016x}, connected to store {:016x}",
                reference.id,
                reference.store_id,
                self.client.store_id()
            )));
        }
        self.client.get_tensor(&reference.id)
    }
}

/// Capability returned by [`ForkingCodec::register`].
///
/// Holding it keeps the hook alive; clones refer to the same hook.
#[derive(Clone)]
pub struct Registration {
    hook: Arc<TransportHook>,
}

impl Registration {
    /// The registered hook
    pub fn hook(&self) -> &TransportHook {
        &self.hook
    }

    /// Whether both capabilities refer to the same registration
    pub fn same_as(&self, other: &Registration) -> bool {
        Arc::ptr_eq(&self.hook, &other.hook)
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("client", self.hook.client())
            .finish()
    }
}

/// Serialization layer for values sent to other processes.
///
/// Without a registered hook, tensors are encoded inline with their bytes.
#[derive(Default)]
pub struct ForkingCodec {
    registration: OnceLock<Registration>,
}

impl ForkingCodec {
    /// Codec with no hook registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the tensor hook.
    ///
    /// Only the first registration takes effect. Later calls return the
    /// existing registration and drop their hook, so tensors are never
    /// reduced twice.
    pub fn register(&self, hook: TransportHook) -> Registration {
        let mut installed = false;
        let registration = self.registration.get_or_init(|| {
            installed = true;
            Registration {
                hook: Arc::new(hook),
            }
        });
        if !installed {
            debug!("Transport hook already registered");
        }
        registration.clone()
    }

    /// Current registration
    pub fn registration(&self) -> Option<&Registration> {
        self.registration.get()
    }

    /// Whether a hook is registered
    pub fn is_registered(&self) -> bool {
        self.registration.get().is_some()
    }

    /// Encode `value`, storing each distinct tensor once.
    ///
    /// On failure the objects already written for `value` are deleted.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> ShmResult<Vec<u8>> {
        self.encode_tracked(value).map(|(bytes, _)| bytes)
    }

    /// Encode `value` and return the references of the objects it wrote
    pub(crate) fn encode_tracked<T: Serialize + ?Sized>(
        &self,
        value: &T,
    ) -> ShmResult<(Vec<u8>, Vec<TensorRef>)> {
        let mut scope = self.enter();
        let result = rmp_serde::to_vec_named(value);
        let stored = scope
            .as_mut()
            .map(ScopeGuard::take_stored)
            .unwrap_or_default();
        match finish(scope, result) {
            Ok(bytes) => Ok((bytes, stored)),
            Err(e) => {
                self.release(&stored);
                Err(e)
            }
        }
    }

    /// Delete objects written by an encode whose payload was never delivered
    pub(crate) fn release(&self, stored: &[TensorRef]) {
        let Some(registration) = self.registration.get() else {
            return;
        };
        let client = registration.hook.client();
        for reference in stored {
            if let Err(e) = client.delete(&reference.id) {
                warn!(id = %reference.id, error = %e, "Failed to delete undelivered tensor");
            }
        }
    }

    /// Decode a value produced by [`ForkingCodec::encode`]
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> ShmResult<T> {
        let scope = self.enter();
        let result = rmp_serde::from_slice(bytes);
        finish(scope, result)
    }

    fn enter(&self) -> Option<ScopeGuard> {
        self.registration
            .get()
            .map(|registration| ScopeGuard::enter(Arc::clone(&registration.hook)))
    }
}

fn finish<T, E>(scope: Option<ScopeGuard>, result: Result<T, E>) -> ShmResult<T>
where
    E: Into<ShmError>,
{
    let stashed = scope.and_then(|mut guard| guard.take_error());
    match result {
        Ok(value) => Ok(value),
        // a hook failure carries the typed error; the serde error only has its text
        Err(e) => Err(stashed.unwrap_or_else(|| e.into())),
    }
}

/// Hook state for one encode or decode call on this thread
struct Scope {
    hook: Arc<TransportHook>,
    // (address, length) of each tensor buffer already reduced in this call
    sent: HashMap<(usize, usize), TensorRef>,
    // objects newly written in this call
    stored: Vec<TensorRef>,
    error: Option<ShmError>,
}

thread_local! {
    static ACTIVE: RefCell<Option<Scope>> = const { RefCell::new(None) };
}

struct ScopeGuard {
    previous: Option<Scope>,
}

impl ScopeGuard {
    fn enter(hook: Arc<TransportHook>) -> Self {
        let scope = Scope {
            hook,
            sent: HashMap::new(),
            stored: Vec::new(),
            error: None,
        };
        let previous = ACTIVE.with(|active| active.replace(Some(scope)));
        Self { previous }
    }

    fn take_stored(&mut self) -> Vec<TensorRef> {
        ACTIVE.with(|active| {
            active
                .borrow_mut()
                .as_mut()
                .map(|scope| std::mem::take(&mut scope.stored))
                .unwrap_or_default()
        })
    }

    fn take_error(&mut self) -> Option<ShmError> {
        ACTIVE.with(|active| {
            active
                .borrow_mut()
                .as_mut()
                .and_then(|scope| scope.error.take())
        })
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        ACTIVE.with(|active| {
            active.replace(previous);
        });
    }
}

fn active_hook() -> Option<Arc<TransportHook>> {
    ACTIVE.with(|active| {
        active
            .borrow()
            .as_ref()
            .map(|scope| Arc::clone(&scope.hook))
    })
}

fn stash_error(err: ShmError) -> String {
    let message = err.to_string();
    ACTIVE.with(|active| {
        if let Some(scope) = active.borrow_mut().as_mut() {
            scope.error.get_or_insert(err);
        }
    });
    message
}

fn reduce_in_scope(hook: &TransportHook, tensor: &Tensor) -> ShmResult<TensorRef> {
    let bytes = tensor.as_bytes();
    let key = (bytes.as_ptr() as usize, bytes.len());
    if !bytes.is_empty() {
        let sent = ACTIVE.with(|active| {
            active
                .borrow()
                .as_ref()
                .and_then(|scope| scope.sent.get(&key).cloned())
        });
        if let Some(reference) = sent {
            return Ok(reference);
        }
    }

    let (reference, written) = hook.reduce_tracked(tensor)?;
    ACTIVE.with(|active| {
        if let Some(scope) = active.borrow_mut().as_mut() {
            if !bytes.is_empty() {
                scope.sent.insert(key, reference.clone());
            }
            if written {
                scope.stored.push(reference.clone());
            }
        }
    });
    Ok(reference)
}

/// Raw bytes serialized as a binary blob without copying
struct RawBytes<'a>(&'a [u8]);

impl Serialize for RawBytes<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.0)
    }
}

#[derive(Serialize)]
enum WireTensorOut<'a> {
    Ref(TensorRef),
    Inline {
        meta: &'a TensorMeta,
        data: RawBytes<'a>,
    },
}

#[derive(Deserialize)]
enum WireTensor {
    Ref(TensorRef),
    Inline { meta: TensorMeta, data: bytes::Bytes },
}

impl Serialize for Tensor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match active_hook() {
            Some(hook) => match reduce_in_scope(&hook, self) {
                Ok(reference) => WireTensorOut::Ref(reference),
                Err(e) => return Err(ser::Error::custom(stash_error(e))),
            },
            None => WireTensorOut::Inline {
                meta: self.meta(),
                data: RawBytes(self.as_bytes()),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Tensor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match WireTensor::deserialize(deserializer)? {
            WireTensor::Inline { meta, data } => {
                Tensor::from_bytes(meta, &data).map_err(de::Error::custom)
            }
            WireTensor::Ref(reference) => {
                let hook = active_hook().ok_or_else(|| {
                    de::Error::custom(format!(
                        "tensor reference {} decoded without a registered transport hook",
                        reference.id
                    ))
                })?;
                hook.rebuild(&reference)
                    .map_err(|e| de::Error::custom(stash_error(e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::server::spawn_background;

    fn sample() -> Tensor {
        Tensor::from_vec(&[2, 3], vec![1i64, 2, 3, 5, 4, 6]).unwrap()
    }

    #[test]
    fn test_inline_without_hook() {
        let codec = ForkingCodec::new();
        let wire = codec.encode(&sample()).unwrap();
        let back: Tensor = codec.decode(&wire).unwrap();
        assert_eq!(back, sample());
        assert!(!back.is_shared());
    }

    #[test]
    fn test_reference_without_hook_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = spawn_background(StoreConfig::in_dir(dir.path())).unwrap();
        let client = Arc::new(StoreClient::connect(store.client_config()).unwrap());

        let sender = ForkingCodec::new();
        sender.register(TransportHook::new(client));
        let wire = sender.encode(&sample()).unwrap();

        let err = ForkingCodec::new().decode::<Tensor>(&wire).unwrap_err();
        assert!(matches!(err, ShmError::Serialization(_)));
    }

    #[test]
    fn test_roundtrip_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = spawn_background(StoreConfig::in_dir(dir.path())).unwrap();
        let client = Arc::new(StoreClient::connect(store.client_config()).unwrap());
        let codec = ForkingCodec::new();
        codec.register(TransportHook::with_ids(
            Arc::clone(&client),
            IdGenerator::seeded(7, 10).unwrap(),
        ));

        let t = sample();
        let wire = codec.encode(&vec![("x".to_string(), &t)]).unwrap();
        // only the reference travels
        assert!(wire.len() < t.as_bytes().len() + 64);

        let back: Vec<(String, Tensor)> = codec.decode(&wire).unwrap();
        assert_eq!(back[0].1, t);
        assert!(back[0].1.is_shared());
        assert_eq!(client.list().unwrap().len(), 1);
    }

    #[test]
    fn test_same_instance_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = spawn_background(StoreConfig::in_dir(dir.path())).unwrap();
        let client = Arc::new(StoreClient::connect(store.client_config()).unwrap());
        let codec = ForkingCodec::new();
        let first = codec.register(TransportHook::new(Arc::clone(&client)));
        let second = codec.register(TransportHook::new(Arc::clone(&client)));
        assert!(first.same_as(&second));

        let t = sample();
        let wire = codec.encode(&(&t, &t)).unwrap();
        assert_eq!(client.stats().unwrap().objects, 1);

        let (a, b): (Tensor, Tensor) = codec.decode(&wire).unwrap();
        assert_eq!(a.object_id(), b.object_id());
    }

    #[test]
    fn test_store_view_keeps_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let store = spawn_background(StoreConfig::in_dir(dir.path())).unwrap();
        let client = Arc::new(StoreClient::connect(store.client_config()).unwrap());
        let id = ObjectId::new("test111").unwrap();
        let view = client
            .put_tensor(&id, &sample(), PutOptions::default())
            .unwrap();

        let hook = TransportHook::new(Arc::clone(&client));
        let reference = hook.reduce(&view).unwrap();
        assert_eq!(reference.id, id);
        assert_eq!(client.list().unwrap(), vec![id]);
    }

    #[test]
    fn test_hook_failure_surfaces_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            capacity_bytes: 16,
            ..StoreConfig::in_dir(dir.path())
        };
        let store = spawn_background(config).unwrap();
        let client = Arc::new(StoreClient::connect(store.client_config()).unwrap());
        let codec = ForkingCodec::new();
        codec.register(TransportHook::new(client));

        let err = codec.encode(&sample()).unwrap_err();
        assert!(matches!(err, ShmError::Capacity { .. }), "got {err}");
    }

    #[test]
    fn test_failed_encode_deletes_written_tensors() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            capacity_bytes: 64,
            ..StoreConfig::in_dir(dir.path())
        };
        let store = spawn_background(config).unwrap();
        let client = Arc::new(StoreClient::connect(store.client_config()).unwrap());
        let codec = ForkingCodec::new();
        codec.register(TransportHook::new(Arc::clone(&client)));

        // the first fits, the second overflows the store
        let (a, b) = (sample(), sample());
        let err = codec.encode(&(&a, &b)).unwrap_err();
        assert!(matches!(err, ShmError::Capacity { .. }), "got {err}");

        let stats = client.stats().unwrap();
        assert_eq!(stats.objects, 0);
        assert_eq!(stats.used_bytes, 0);
    }
}
