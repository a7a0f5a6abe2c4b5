//! Per-device I/O boundary
//!
//! The engine talks to its member devices through the [`BlockDevice`]
//! trait: sector-addressed reads and writes against one device. The
//! [`DeviceArray`] groups up to 32 data devices with one distinguished
//! parity device; the set is immutable after attach.
//!
//! [`MemDevice`] is the in-memory implementation used by the test suite
//! and by deployments that stage the array over a reserved memory
//! region. It supports fault injection and artificial latency so the
//! error paths and completion-ordering guarantees can be exercised.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::chunk::SECTOR_SIZE;
use crate::config::ArrayConfig;
use crate::error::{Error, Result};

// =============================================================================
// Device information
// =============================================================================

/// Static description of a block device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device name (used in logs and error reports)
    pub name: String,

    /// Total capacity in bytes
    pub capacity_bytes: u64,
}

impl DeviceInfo {
    /// Capacity in sectors.
    pub fn num_sectors(&self) -> u64 {
        self.capacity_bytes / SECTOR_SIZE as u64
    }
}

// =============================================================================
// BlockDevice trait
// =============================================================================

/// Sector-addressed block device.
///
/// `buf`/`data` lengths are in bytes and need not be sector-multiples,
/// but the starting position is always a sector boundary. Reads and
/// writes past the device capacity fail with `Error::DeviceIo`.
#[async_trait]
pub trait BlockDevice: Send + Sync + fmt::Debug {
    /// Device description.
    fn info(&self) -> DeviceInfo;

    /// Read `buf.len()` bytes starting at `sector`.
    async fn read_at(&self, sector: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` starting at `sector`.
    async fn write_at(&self, sector: u64, data: &[u8]) -> Result<()>;
}

// =============================================================================
// MemDevice
// =============================================================================

/// In-memory block device.
#[derive(Debug)]
pub struct MemDevice {
    name: String,
    data: RwLock<Vec<u8>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    /// Artificial per-operation latency in microseconds (0 = none).
    op_delay_us: AtomicU64,
}

impl MemDevice {
    /// Create a zero-filled device of `capacity_bytes`.
    pub fn new(name: &str, capacity_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            data: RwLock::new(vec![0u8; capacity_bytes as usize]),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            op_delay_us: AtomicU64::new(0),
        })
    }

    /// Make subsequent reads fail (fault injection).
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent writes fail (fault injection).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Add artificial latency to every operation.
    pub fn set_op_delay(&self, delay: Duration) {
        self.op_delay_us
            .store(delay.as_micros() as u64, Ordering::SeqCst);
    }

    /// Snapshot a byte range for inspection in tests.
    pub fn snapshot(&self, offset: usize, len: usize) -> Vec<u8> {
        self.data.read()[offset..offset + len].to_vec()
    }

    fn check_range(&self, sector: u64, len: usize) -> Result<usize> {
        let start = sector as usize * SECTOR_SIZE;
        let end = start.checked_add(len).ok_or_else(|| Error::DeviceIo {
            device: self.name.clone(),
            reason: "byte range overflow".into(),
        })?;
        if end > self.data.read().len() {
            return Err(Error::DeviceIo {
                device: self.name.clone(),
                reason: format!(
                    "range {}..{} exceeds capacity {}",
                    start,
                    end,
                    self.data.read().len()
                ),
            });
        }
        Ok(start)
    }

    async fn maybe_delay(&self) {
        let us = self.op_delay_us.load(Ordering::SeqCst);
        if us > 0 {
            tokio::time::sleep(Duration::from_micros(us)).await;
        }
    }
}

#[async_trait]
impl BlockDevice for MemDevice {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.name.clone(),
            capacity_bytes: self.data.read().len() as u64,
        }
    }

    async fn read_at(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.maybe_delay().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::DeviceIo {
                device: self.name.clone(),
                reason: "injected read failure".into(),
            });
        }
        let start = self.check_range(sector, buf.len())?;
        buf.copy_from_slice(&self.data.read()[start..start + buf.len()]);
        Ok(())
    }

    async fn write_at(&self, sector: u64, data: &[u8]) -> Result<()> {
        self.maybe_delay().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::DeviceIo {
                device: self.name.clone(),
                reason: "injected write failure".into(),
            });
        }
        let start = self.check_range(sector, data.len())?;
        self.data.write()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

// =============================================================================
// DeviceArray
// =============================================================================

/// The attached set of devices: N data devices plus one parity device.
///
/// Immutable after construction; the device count is fixed by the
/// validated [`ArrayConfig`].
#[derive(Debug, Clone)]
pub struct DeviceArray {
    data: Vec<Arc<dyn BlockDevice>>,
    parity: Arc<dyn BlockDevice>,
}

impl DeviceArray {
    /// Assemble the array, validating each member against the config.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the device count does not match
    /// the configuration or any member is smaller than the configured
    /// per-device capacity.
    pub fn new(
        config: &ArrayConfig,
        data: Vec<Arc<dyn BlockDevice>>,
        parity: Arc<dyn BlockDevice>,
    ) -> Result<Self> {
        config.validate()?;

        if data.len() != config.data_devices {
            return Err(Error::InvalidConfig(format!(
                "expected {} data devices, got {}",
                config.data_devices,
                data.len()
            )));
        }

        for dev in data.iter().chain(std::iter::once(&parity)) {
            let info = dev.info();
            if info.capacity_bytes < config.device_capacity {
                return Err(Error::InvalidConfig(format!(
                    "device {} capacity {} below configured {}",
                    info.name, info.capacity_bytes, config.device_capacity
                )));
            }
        }

        Ok(Self { data, parity })
    }

    /// Number of data devices.
    pub fn data_count(&self) -> usize {
        self.data.len()
    }

    /// Data device by index.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range; callers obtain indices from
    /// the chunk mapper, which only produces valid ones.
    pub fn data_device(&self, index: usize) -> &Arc<dyn BlockDevice> {
        &self.data[index]
    }

    /// The parity device.
    pub fn parity_device(&self) -> &Arc<dyn BlockDevice> {
        &self.parity
    }
}

/// Build a test/demo array of in-memory devices for the given config.
pub fn mem_array(config: &ArrayConfig) -> Result<(DeviceArray, Vec<Arc<MemDevice>>, Arc<MemDevice>)> {
    let mems: Vec<Arc<MemDevice>> = (0..config.data_devices)
        .map(|i| MemDevice::new(&format!("mem{}", i), config.device_capacity))
        .collect();
    let parity = MemDevice::new("mem-parity", config.device_capacity);

    let data: Vec<Arc<dyn BlockDevice>> = mems
        .iter()
        .map(|d| d.clone() as Arc<dyn BlockDevice>)
        .collect();
    let array = DeviceArray::new(config, data, parity.clone() as Arc<dyn BlockDevice>)?;
    Ok((array, mems, parity))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_mem_device_roundtrip() {
        let dev = MemDevice::new("t0", 8192);
        let payload = vec![0x5A; 1024];
        dev.write_at(2, &payload).await.unwrap();

        let mut buf = vec![0u8; 1024];
        dev.read_at(2, &mut buf).await.unwrap();
        assert_eq!(buf, payload);

        // Surrounding bytes untouched
        assert_eq!(dev.snapshot(0, 1024), vec![0u8; 1024]);
    }

    #[tokio::test]
    async fn test_mem_device_bounds() {
        let dev = MemDevice::new("t0", 4096);
        let mut buf = vec![0u8; 512];
        assert_matches!(
            dev.read_at(8, &mut buf).await,
            Err(Error::DeviceIo { .. })
        );
        assert_matches!(
            dev.write_at(8, &buf).await,
            Err(Error::DeviceIo { .. })
        );
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let dev = MemDevice::new("t0", 4096);
        dev.set_fail_reads(true);

        let mut buf = vec![0u8; 512];
        assert_matches!(dev.read_at(0, &mut buf).await, Err(Error::DeviceIo { .. }));

        dev.set_fail_reads(false);
        dev.read_at(0, &mut buf).await.unwrap();
    }

    #[test]
    fn test_array_validates_members() {
        let config = ArrayConfig::new(2, 8192);

        // Wrong count
        let one: Vec<Arc<dyn BlockDevice>> = vec![MemDevice::new("d0", 8192) as _];
        let parity = MemDevice::new("p", 8192);
        assert_matches!(
            DeviceArray::new(&config, one, parity.clone() as _),
            Err(Error::InvalidConfig(_))
        );

        // Undersized member
        let short: Vec<Arc<dyn BlockDevice>> = vec![
            MemDevice::new("d0", 8192) as _,
            MemDevice::new("d1", 4096) as _,
        ];
        assert_matches!(
            DeviceArray::new(&config, short, parity as _),
            Err(Error::InvalidConfig(_))
        );

        let (array, mems, _) = mem_array(&config).unwrap();
        assert_eq!(array.data_count(), 2);
        assert_eq!(mems.len(), 2);
    }
}
