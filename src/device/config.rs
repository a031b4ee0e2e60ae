//! Device configuration
//!
//! Loaded from JSON; every field is optional and falls back to the defaults
//! below.
//!
//! ```json
//! {
//!   "sectors": 2048,
//!   "buffer_capacity": 4096,
//!   "response_timeout_ms": 30000
//! }
//! ```
//!
//! `response_timeout_ms: null` makes the front end wait for the agent forever.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buffer::{page_size, SECTOR_SIZE};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("device must advertise at least one sector")]
    ZeroSectors,

    #[error("buffer capacity {0} must be a non-zero multiple of {sector}", sector = SECTOR_SIZE)]
    InvalidCapacity(usize),

    #[error("device size overflows: {0} sectors")]
    TooLarge(u64),

    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Startup parameters of one device instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Advertised size in 512-byte sectors
    pub sectors: u64,
    /// Shared buffer size in bytes; `None` means one system page
    pub buffer_capacity: Option<usize>,
    /// Bound on waiting for the agent; `None` waits forever
    pub response_timeout_ms: Option<u64>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sectors: 2048, // 1 MiB
            buffer_capacity: None,
            response_timeout_ms: Some(30_000),
        }
    }
}

impl DeviceConfig {
    /// Read and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: DeviceConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sectors == 0 {
            return Err(ConfigError::ZeroSectors);
        }
        if self.sectors.checked_mul(SECTOR_SIZE as u64).is_none() {
            return Err(ConfigError::TooLarge(self.sectors));
        }
        let capacity = self.buffer_capacity();
        if capacity == 0 || capacity % SECTOR_SIZE != 0 {
            return Err(ConfigError::InvalidCapacity(capacity));
        }
        Ok(())
    }

    /// Shared buffer size with the page-size default applied
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity.unwrap_or_else(page_size)
    }

    /// Device size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.sectors.saturating_mul(SECTOR_SIZE as u64)
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }
}
