//! Relay configuration.
//!
//! Values are resolved from built-in defaults, then an optional JSON file,
//! then `XZIBIT_BUS_*` environment variables. Command-line flags are applied
//! on top by the binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::framing::DEFAULT_MAX_BUFFERED;

/// Well-known socket path shared by every client on the host.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/xzibit-bus";

/// sun_path is 104 on macOS, 108 on Linux; use conservative limit
pub const MAX_SOCKET_PATH: usize = 104;

/// Configuration for the bus relay.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path of the listening Unix socket.
    pub socket_path: PathBuf,
    /// Largest single read from a client, in bytes.
    pub read_chunk_size: usize,
    /// Cap on bytes buffered per connection before it is dropped.
    pub max_buffered_bytes: usize,
    /// How long a single frame write to one peer may take, in milliseconds.
    pub write_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            read_chunk_size: 1024,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED,
            write_timeout_ms: 5000,
        }
    }
}

impl Config {
    /// Load configuration from `path` (if given) plus environment overrides.
    ///
    /// A file that was asked for but can't be read is an error; with no path
    /// the defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(socket_path) = std::env::var("XZIBIT_BUS_SOCKET") {
            self.socket_path = PathBuf::from(socket_path);
        }

        if let Ok(read_chunk) = std::env::var("XZIBIT_BUS_READ_CHUNK") {
            if let Ok(size) = read_chunk.parse::<usize>() {
                self.read_chunk_size = size;
            }
        }

        if let Ok(max_buffered) = std::env::var("XZIBIT_BUS_MAX_BUFFERED") {
            if let Ok(max) = max_buffered.parse::<usize>() {
                self.max_buffered_bytes = max;
            }
        }

        if let Ok(write_timeout) = std::env::var("XZIBIT_BUS_WRITE_TIMEOUT_MS") {
            if let Ok(timeout) = write_timeout.parse::<u64>() {
                self.write_timeout_ms = timeout;
            }
        }
    }

    /// Check that the configuration can actually be served.
    pub fn validate(&self) -> Result<()> {
        let path_len = self.socket_path.as_os_str().len();
        if path_len >= MAX_SOCKET_PATH {
            bail!(
                "Socket path too long ({path_len} bytes, max {}): {}",
                MAX_SOCKET_PATH - 1,
                self.socket_path.display()
            );
        }
        if self.read_chunk_size == 0 {
            bail!("read_chunk_size must be greater than zero");
        }
        if self.max_buffered_bytes == 0 {
            bail!("max_buffered_bytes must be greater than zero");
        }
        Ok(())
    }

    /// Per-peer write timeout.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/xzibit-bus"));
        assert_eq!(config.read_chunk_size, 1024);
        assert_eq!(config.max_buffered_bytes, 16 * 1024 * 1024);
        assert_eq!(config.write_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("bus.json");
        fs::write(&path, r#"{"read_chunk_size": 4096}"#).unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.read_chunk_size, 4096);
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("bus.json");
        fs::write(&path, r#"{"socket": "/tmp/x"}"#).unwrap();

        assert!(Config::load_from_file(&path).is_err());
    }

    #[test]
    fn test_missing_file_is_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = Config::load_from_file(&tmp.path().join("nope.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_validate_rejects_long_socket_path() {
        let config = Config {
            socket_path: PathBuf::from(format!("/tmp/{}", "a".repeat(200))),
            ..Config::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("too long"), "Error should mention path too long: {err}");
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let config = Config {
            read_chunk_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_buffered_bytes: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
