//! Array configuration
//!
//! Attach-time configuration for a striped array. Validated once when the
//! array is assembled; an invalid configuration is a fatal construction
//! error, never a runtime error.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunk::{CHUNK_SIZE, MAX_DATA_DEVICES, SECTOR_SIZE};
use crate::error::{Error, Result};

/// Default number of chunk buffers kept in the staging pool.
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 32;

/// Configuration for a striped array with one parity device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayConfig {
    /// Number of data devices (1..=32). The parity device is additional.
    pub data_devices: usize,

    /// Usable capacity of each device in bytes. Every device in the
    /// array, parity included, must provide at least this much. Must be
    /// a nonzero multiple of the chunk size.
    pub device_capacity: u64,

    /// Maximum number of chunk buffers retained by the staging pool.
    pub buffer_pool_size: usize,

    /// Deadline for a submitted parity job. `None` preserves the
    /// accelerator contract as specified: a lost job blocks its
    /// submitter indefinitely.
    pub offload_timeout: Option<Duration>,
}

impl ArrayConfig {
    /// Create a configuration for `data_devices` devices of
    /// `device_capacity` bytes each.
    pub fn new(data_devices: usize, device_capacity: u64) -> Self {
        Self {
            data_devices,
            device_capacity,
            buffer_pool_size: DEFAULT_BUFFER_POOL_SIZE,
            offload_timeout: None,
        }
    }

    /// Logical volume capacity in bytes: per-device capacity times the
    /// data-device count. Parity capacity is not part of the volume.
    pub fn capacity_bytes(&self) -> u64 {
        self.device_capacity * self.data_devices as u64
    }

    /// Logical volume capacity in sectors.
    pub fn capacity_sectors(&self) -> u64 {
        self.capacity_bytes() / SECTOR_SIZE as u64
    }

    /// Per-device capacity in sectors.
    pub fn device_capacity_sectors(&self) -> u64 {
        self.device_capacity / SECTOR_SIZE as u64
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.data_devices == 0 {
            return Err(Error::InvalidConfig(
                "data_devices must be >= 1".into(),
            ));
        }
        if self.data_devices > MAX_DATA_DEVICES {
            return Err(Error::InvalidConfig(format!(
                "data_devices {} exceeds maximum {}",
                self.data_devices, MAX_DATA_DEVICES
            )));
        }
        if self.device_capacity == 0 {
            return Err(Error::InvalidConfig(
                "device_capacity must be > 0".into(),
            ));
        }
        if self.device_capacity % CHUNK_SIZE as u64 != 0 {
            return Err(Error::InvalidConfig(format!(
                "device_capacity {} must be a multiple of the chunk size {}",
                self.device_capacity, CHUNK_SIZE
            )));
        }
        if self.buffer_pool_size == 0 {
            return Err(Error::InvalidConfig(
                "buffer_pool_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ArrayConfig {
    fn default() -> Self {
        // 4 data devices of 1 MiB each
        Self::new(4, 1024 * 1024)
    }
}

// =============================================================================
// Tests
// =============================================================================
