//! Chunk Mapper - sector/chunk/device arithmetic
//!
//! Pure striping arithmetic for the array: every global sector of the
//! logical volume maps to exactly one `(device_index, local_sector)` pair
//! and back. Chunks are the unit of striping; consecutive chunks rotate
//! round-robin across the data devices.
//!
//! ```text
//!   global sector ──▶ chunk ──▶ device (chunk mod N)
//!                         └───▶ local chunk (chunk / N) ──▶ local sector
//! ```
//!
//! The mapping is a bijection for any device count 1..=32; `unmap` is the
//! exact inverse of `map`. Chunk intervals are closed (both endpoints
//! inclusive), which keeps end-of-chunk boundary checks to a single
//! comparison in the splitter.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Geometry constants
// =============================================================================

/// Logical sector size in bytes
pub const SECTOR_SIZE: usize = 512;

/// log2(SECTOR_SIZE)
pub const SECTOR_SHIFT: u32 = 9;

/// Striping unit in bytes
pub const CHUNK_SIZE: usize = 4096;

/// log2(CHUNK_SIZE)
pub const CHUNK_SHIFT: u32 = 12;

/// Sectors per chunk
pub const SECTORS_PER_CHUNK: u64 = 8;

/// log2(SECTORS_PER_CHUNK)
pub const SECTORS_PER_CHUNK_SHIFT: u32 = 3;

/// Maximum number of data devices in one array
pub const MAX_DATA_DEVICES: usize = 32;

// =============================================================================
// Geometry
// =============================================================================

/// Striping geometry for a fixed data-device count.
///
/// Stateless after construction; all operations are pure arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    device_count: u64,
}

impl Geometry {
    /// Create a geometry for `device_count` data devices.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the count is zero or exceeds
    /// [`MAX_DATA_DEVICES`].
    pub fn new(device_count: usize) -> Result<Self> {
        if device_count == 0 {
            return Err(Error::InvalidConfig(
                "data device count must be >= 1".into(),
            ));
        }
        if device_count > MAX_DATA_DEVICES {
            return Err(Error::InvalidConfig(format!(
                "data device count {} exceeds maximum {}",
                device_count, MAX_DATA_DEVICES
            )));
        }
        Ok(Self {
            device_count: device_count as u64,
        })
    }

    /// Number of data devices in this geometry.
    #[inline]
    pub fn device_count(&self) -> usize {
        self.device_count as usize
    }

    /// Global chunk index containing `sector`.
    #[inline]
    pub fn chunk_index(&self, sector: u64) -> u64 {
        sector >> SECTORS_PER_CHUNK_SHIFT
    }

    /// Index of the data device owning the chunk that contains `sector`.
    #[inline]
    pub fn device_index(&self, sector: u64) -> usize {
        (self.chunk_index(sector) % self.device_count) as usize
    }

    /// Chunk index within the owning device.
    #[inline]
    pub fn local_chunk_index(&self, sector: u64) -> u64 {
        self.chunk_index(sector) / self.device_count
    }

    /// Device-local sector for a global sector.
    #[inline]
    pub fn local_sector(&self, sector: u64) -> u64 {
        (sector & (SECTORS_PER_CHUNK - 1))
            + (self.local_chunk_index(sector) << SECTORS_PER_CHUNK_SHIFT)
    }

    /// Map a global sector to `(device_index, local_sector)`.
    #[inline]
    pub fn map(&self, sector: u64) -> (usize, u64) {
        (self.device_index(sector), self.local_sector(sector))
    }

    /// Inverse of [`map`](Self::map): recover the global sector from a
    /// `(device_index, local_sector)` pair.
    #[inline]
    pub fn unmap(&self, device_index: usize, local_sector: u64) -> u64 {
        let local_chunk = local_sector >> SECTORS_PER_CHUNK_SHIFT;
        let within = local_sector & (SECTORS_PER_CHUNK - 1);
        let chunk = local_chunk * self.device_count + device_index as u64;
        (chunk << SECTORS_PER_CHUNK_SHIFT) + within
    }

    /// First sector of the chunk containing `sector`.
    #[inline]
    pub fn chunk_start_sector(&self, sector: u64) -> u64 {
        sector & !(SECTORS_PER_CHUNK - 1)
    }

    /// Last sector of the chunk containing `sector` (inclusive).
    #[inline]
    pub fn chunk_end_sector(&self, sector: u64) -> u64 {
        self.chunk_start_sector(sector) + SECTORS_PER_CHUNK - 1
    }
}

// =============================================================================
// Tests
// =============================================================================
