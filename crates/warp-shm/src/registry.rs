//! Lazily connected client handles
//!
//! [`ClientRegistry`] caches one [`StoreClient`] per process and hands out
//! shared handles to it. Library types never consult a registry on their
//! own; [`global`] exists for call sites that want a process-wide default.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::debug;

use crate::client::StoreClient;
use crate::config::ClientConfig;
use crate::error::ShmResult;

struct Cached {
    pid: u32,
    client: Arc<StoreClient>,
}

/// Lazily connected, cached store client
pub struct ClientRegistry {
    config: Mutex<ClientConfig>,
    cached: Mutex<Option<Cached>>,
}

impl ClientRegistry {
    /// Registry that connects to `config` on first use
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config: Mutex::new(config),
            cached: Mutex::new(None),
        }
    }

    /// Reconfigure and connect now, replacing any cached client
    pub fn init(&self, config: ClientConfig) -> ShmResult<Arc<StoreClient>> {
        let client = Arc::new(StoreClient::connect(config.clone())?);
        *self.config.lock() = config;
        *self.cached.lock() = Some(Cached {
            pid: client.pid(),
            client: Arc::clone(&client),
        });
        Ok(client)
    }

    /// The cached client, connecting on first use.
    ///
    /// A client cached by a parent process is never reused after a fork;
    /// the child gets its own connection.
    pub fn client(&self) -> ShmResult<Arc<StoreClient>> {
        let mut cached = self.cached.lock();
        let pid = std::process::id();
        if let Some(entry) = cached.as_ref() {
            if entry.pid == pid {
                return Ok(Arc::clone(&entry.client));
            }
            debug!(parent = entry.pid, pid, "Dropping client inherited across fork");
        }

        let config = self.config.lock().clone();
        let client = Arc::new(StoreClient::connect(config)?);
        *cached = Some(Cached {
            pid,
            client: Arc::clone(&client),
        });
        Ok(client)
    }

    /// Whether a client for this process is cached
    pub fn is_connected(&self) -> bool {
        self.cached
            .lock()
            .as_ref()
            .is_some_and(|entry| entry.pid == std::process::id())
    }

    /// Endpoint settings used for the next connection
    pub fn config(&self) -> ClientConfig {
        self.config.lock().clone()
    }
}

/// Process-local registry configured from the environment
pub fn global() -> &'static ClientRegistry {
    static GLOBAL: OnceLock<ClientRegistry> = OnceLock::new();
    GLOBAL.get_or_init(|| ClientRegistry::new(ClientConfig::from_env()))
}

/// Connect the process-local registry to `config`
pub fn init_client(config: ClientConfig) -> ShmResult<Arc<StoreClient>> {
    global().init(config)
}

/// Client from the process-local registry, connecting on first use
pub fn client() -> ShmResult<Arc<StoreClient>> {
    global().client()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::error::ShmError;
    use crate::server::spawn_background;

    #[test]
    fn test_lazy_connect_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let store = spawn_background(StoreConfig::in_dir(dir.path())).unwrap();
        let registry = ClientRegistry::new(store.client_config());
        assert!(!registry.is_connected());

        let first = registry.client().unwrap();
        let second = registry.client().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.is_connected());
    }

    #[test]
    fn test_connect_failure_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ClientRegistry::new(ClientConfig::with_socket(dir.path().join("none.sock")));
        assert!(matches!(registry.client(), Err(ShmError::Connection(_))));
        assert!(!registry.is_connected());

        let store = spawn_background(StoreConfig::in_dir(dir.path())).unwrap();
        let client = registry.init(store.client_config()).unwrap();
        assert!(Arc::ptr_eq(&client, &registry.client().unwrap()));
        assert_eq!(registry.config().socket_path, store.socket_path());
    }
}
