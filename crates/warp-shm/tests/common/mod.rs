//! Shared fixtures for end-to-end tests

#![allow(dead_code)]

use std::path::Path;

use tempfile::TempDir;
use warp_shm::{spawn_background, BackgroundStore, ClientConfig, StoreClient, StoreConfig};

/// Store running in the background with its socket and arena in a temp dir
pub struct TestStore {
    // dropped after the store so the directory outlives it
    pub store: BackgroundStore,
    pub dir: TempDir,
}

impl TestStore {
    pub fn start() -> Self {
        Self::with_capacity(64 * 1024 * 1024)
    }

    pub fn with_capacity(capacity_bytes: u64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            capacity_bytes,
            ..StoreConfig::in_dir(dir.path())
        };
        let store = spawn_background(config).unwrap();
        Self { store, dir }
    }

    pub fn socket_path(&self) -> &Path {
        self.store.socket_path()
    }

    pub fn client_config(&self) -> ClientConfig {
        self.store.client_config()
    }

    pub fn connect(&self) -> StoreClient {
        StoreClient::connect(self.client_config()).unwrap()
    }
}
