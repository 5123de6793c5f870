//! Configuration for the store client and the store daemon

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ShmError, ShmResult};

/// Default store endpoint
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/warp-shm.sock";

/// Environment variable overriding the store endpoint
pub const ENV_SOCKET: &str = "WARP_SHM_SOCKET";
/// Environment variable overriding the arena directory
pub const ENV_SHM_DIR: &str = "WARP_SHM_DIR";
/// Environment variable overriding the store capacity in bytes
pub const ENV_CAPACITY: &str = "WARP_SHM_CAPACITY";

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Store endpoint (Unix socket path)
    pub socket_path: PathBuf,
    /// Deadline for connecting and completing the handshake, 0 disables it
    pub connect_timeout_ms: u64,
    /// Deadline for one request/response round trip, 0 disables it
    pub io_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            connect_timeout_ms: 5_000,
            io_timeout_ms: 30_000,
        }
    }
}

impl ClientConfig {
    /// Config for a specific endpoint, other fields defaulted
    pub fn with_socket(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Default::default()
        }
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply `WARP_SHM_SOCKET`
    pub fn apply_env_overrides(&mut self) {
        if let Some(path) = std::env::var_os(ENV_SOCKET) {
            self.socket_path = PathBuf::from(path);
        }
    }

    /// Parse from TOML
    pub fn from_toml_str(s: &str) -> ShmResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| ShmError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: &Path) -> ShmResult<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Validate configuration values
    pub fn validate(&self) -> ShmResult<()> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(ShmError::Config("socket_path must not be empty".into()));
        }
        Ok(())
    }

    /// Connect deadline, if enabled
    pub fn connect_timeout(&self) -> Option<Duration> {
        millis(self.connect_timeout_ms)
    }

    /// Round trip deadline, if enabled
    pub fn io_timeout(&self) -> Option<Duration> {
        millis(self.io_timeout_ms)
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Store daemon configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Endpoint to listen on (Unix socket path)
    pub socket_path: PathBuf,
    /// Directory holding per-store arenas of segment files, ideally on tmpfs
    pub shm_dir: PathBuf,
    /// Total bytes the store may hold
    pub capacity_bytes: u64,
    /// Largest accepted protocol frame payload
    pub max_frame_bytes: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            shm_dir: default_shm_dir(),
            capacity_bytes: 1024 * 1024 * 1024, // 1 GiB
            max_frame_bytes: 16 * 1024 * 1024,  // 16 MiB
        }
    }
}

fn default_shm_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.join("warp-shm")
    } else {
        std::env::temp_dir().join("warp-shm")
    }
}

impl StoreConfig {
    /// Config rooted in `dir`: socket and arena both live inside it
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            socket_path: dir.join("store.sock"),
            shm_dir: dir.join("arena"),
            ..Default::default()
        }
    }

    /// Matching client config
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::with_socket(&self.socket_path)
    }

    /// Apply `WARP_SHM_SOCKET`, `WARP_SHM_DIR` and `WARP_SHM_CAPACITY`
    pub fn apply_env_overrides(&mut self) -> ShmResult<()> {
        if let Some(path) = std::env::var_os(ENV_SOCKET) {
            self.socket_path = PathBuf::from(path);
        }
        if let Some(dir) = std::env::var_os(ENV_SHM_DIR) {
            self.shm_dir = PathBuf::from(dir);
        }
        if let Ok(capacity) = std::env::var(ENV_CAPACITY) {
            self.capacity_bytes = capacity.trim().parse().map_err(|_| {
                ShmError::Config(format!("{ENV_CAPACITY}={capacity:?} is not a byte count"))
            })?;
        }
        Ok(())
    }

    /// Parse from TOML
    pub fn from_toml_str(s: &str) -> ShmResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| ShmError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: &Path) -> ShmResult<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Validate configuration values
    pub fn validate(&self) -> ShmResult<()> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(ShmError::Config("socket_path must not be empty".into()));
        }
        if self.shm_dir.as_os_str().is_empty() {
            return Err(ShmError::Config("shm_dir must not be empty".into()));
        }
        if self.capacity_bytes == 0 {
            return Err(ShmError::Config("capacity_bytes must be positive".into()));
        }
        if self.max_frame_bytes < 1024 {
            return Err(ShmError::Config(format!(
                "max_frame_bytes {} is below the 1024 byte minimum",
                self.max_frame_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_client_config() {
        let config = ClientConfig::default();
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(5)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_disables() {
        let config = ClientConfig {
            io_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.io_timeout(), None);
    }

    #[test]
    fn test_store_config_from_toml() {
        let config = StoreConfig::from_toml_str(
            r#"
            socket_path = "/run/warp/shm.sock"
            capacity_bytes = 4096
            "#,
        )
        .unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/run/warp/shm.sock"));
        assert_eq!(config.capacity_bytes, 4096);
        assert_eq!(config.max_frame_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn test_store_config_validation() {
        let err = StoreConfig::from_toml_str("capacity_bytes = 0").unwrap_err();
        assert!(matches!(err, ShmError::Config(_)));

        let err = StoreConfig::from_toml_str("capacity_bytes = \"lots\"").unwrap_err();
        assert!(matches!(err, ShmError::Config(_)));
    }

    #[test]
    fn test_in_dir_layout() {
        let config = StoreConfig::in_dir(Path::new("/tmp/x"));
        assert_eq!(config.socket_path, PathBuf::from("/tmp/x/store.sock"));
        assert_eq!(config.shm_dir, PathBuf::from("/tmp/x/arena"));
        assert_eq!(config.client_config().socket_path, config.socket_path);
    }
}
