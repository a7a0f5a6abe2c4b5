//! Striped logical volume - request splitting and chaining
//!
//! [`StripedVolume`] exposes the array as one logical block device.
//! An incoming request that spans multiple chunks is cleaved into one
//! sub-request per chunk, each rewritten to its owning device's local
//! sector space and dispatched there. The parent request completes
//! through a fan-in barrier: only after every child has completed, and
//! exactly once; completion order across devices is irrelevant.
//!
//! Sub-requests are produced in strictly increasing chunk order. Write
//! sub-requests run the verify/parity stage before their payload lands
//! on the device, so the old data they stage is really the old data.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use futures::future::join_all;
use tokio::sync::{mpsc, Notify};
use tracing::{info, instrument, warn};

use crate::buffer::ChunkBufPool;
use crate::chunk::{Geometry, CHUNK_SIZE, SECTOR_SIZE};
use crate::config::ArrayConfig;
use crate::device::DeviceArray;
use crate::error::{Error, Result};
use crate::offload::{split_control_page, EngineHandle, OffloadClient, ParityEngine};
use crate::verify::VerifyStage;

// =============================================================================
// Requests
// =============================================================================

/// One chunk-confined fragment of a split request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubRequest {
    /// Global chunk index this fragment lives in
    pub chunk_index: u64,
    /// Owning data device
    pub device_index: usize,
    /// Start sector in the device's local space
    pub local_sector: u64,
    /// Byte offset of this fragment within the parent payload
    pub payload_offset: usize,
    /// Fragment length in bytes
    pub len: usize,
}

// =============================================================================
// Statistics
// =============================================================================

/// Per-volume counters.
#[derive(Debug, Default)]
pub struct VolumeStats {
    /// Read requests accepted
    pub reads: AtomicU64,
    /// Write requests accepted
    pub writes: AtomicU64,
    /// Sub-requests produced by the splitter
    pub sub_requests: AtomicU64,
    /// Verify tasks that failed without failing the write
    pub verify_failures: AtomicU64,
}

// =============================================================================
// StripedVolume
// =============================================================================

/// The striped logical volume over an attached device array.
#[derive(Debug)]
pub struct StripedVolume {
    config: ArrayConfig,
    geometry: Geometry,
    array: DeviceArray,
    verify: VerifyStage,
    stats: Arc<VolumeStats>,
}

impl StripedVolume {
    /// Assemble the volume: validates the configuration, wires the
    /// control page, offload client and verify stage, and spawns the
    /// parity engine.
    ///
    /// Returns the volume together with the engine handle; the engine
    /// stops once the volume (the only job sender) is dropped.
    pub fn new(config: ArrayConfig, array: DeviceArray) -> Result<(Arc<Self>, EngineHandle)> {
        config.validate()?;
        let geometry = Geometry::new(config.data_devices)?;

        let pool = Arc::new(ChunkBufPool::new(
            CHUNK_SIZE,
            // three buffers per staged job
            3.min(config.buffer_pool_size),
            config.buffer_pool_size,
        )?);

        let (host, device) = split_control_page();
        let (jobs_tx, jobs_rx) = mpsc::channel(1);
        let completion = Arc::new(Notify::new());

        let client = Arc::new(OffloadClient::new(
            host,
            jobs_tx,
            completion.clone(),
            config.offload_timeout,
        ));
        let engine = ParityEngine::spawn(
            device,
            jobs_rx,
            completion,
            array.parity_device().clone(),
            pool.clone(),
        );

        let verify = VerifyStage::new(array.clone(), pool, client);

        info!(
            data_devices = config.data_devices,
            capacity_bytes = config.capacity_bytes(),
            "striped volume attached"
        );

        Ok((
            Arc::new(Self {
                config,
                geometry,
                array,
                verify,
                stats: Arc::new(VolumeStats::default()),
            }),
            engine,
        ))
    }

    /// Volume capacity in sectors.
    pub fn capacity_sectors(&self) -> u64 {
        self.config.capacity_sectors()
    }

    /// Volume capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.config.capacity_bytes()
    }

    /// Volume counters.
    pub fn stats(&self) -> &Arc<VolumeStats> {
        &self.stats
    }

    /// Verify-stage counters.
    pub fn verify_stats(&self) -> &Arc<crate::verify::VerifyStats> {
        self.verify.stats()
    }

    // =========================================================================
    // Splitter
    // =========================================================================

    /// Split a request into chunk-confined sub-requests.
    ///
    /// Pure: no I/O is issued. Fragments come out in strictly increasing
    /// chunk order, each already rewritten to device-local sectors.
    pub fn split_request(&self, sector: u64, len: usize) -> Result<Vec<SubRequest>> {
        if len == 0 || len % SECTOR_SIZE != 0 {
            return Err(Error::SplitFailed {
                sector,
                reason: format!("length {} is not a positive sector multiple", len),
            });
        }

        let nr_sectors = (len / SECTOR_SIZE) as u64;
        let end = sector
            .checked_add(nr_sectors)
            .ok_or(Error::OutOfRange {
                sector,
                sectors: nr_sectors,
                capacity: self.capacity_sectors(),
            })?;
        if end > self.capacity_sectors() {
            return Err(Error::OutOfRange {
                sector,
                sectors: nr_sectors,
                capacity: self.capacity_sectors(),
            });
        }

        let mut subs = Vec::new();
        let mut pos = sector;
        let mut payload_offset = 0usize;

        // Iterative cleave, one chunk per pass; bounded memory however
        // large the request.
        loop {
            let chunk_end = self.geometry.chunk_end_sector(pos);
            let last = if chunk_end + 1 >= end {
                end - 1
            } else {
                chunk_end
            };
            let cnt = (last - pos + 1) as usize;

            subs.push(SubRequest {
                chunk_index: self.geometry.chunk_index(pos),
                device_index: self.geometry.device_index(pos),
                local_sector: self.geometry.local_sector(pos),
                payload_offset,
                len: cnt * SECTOR_SIZE,
            });

            payload_offset += cnt * SECTOR_SIZE;
            pos = last + 1;
            if pos == end {
                break;
            }
        }

        self.stats
            .sub_requests
            .fetch_add(subs.len() as u64, Ordering::Relaxed);
        Ok(subs)
    }

    // =========================================================================
    // Data path
    // =========================================================================

    /// Write `data` starting at `sector`.
    ///
    /// The future resolves once every sub-request has completed (fan-in
    /// barrier); any child failure fails the whole request. A failed
    /// verify task is logged and counted but does not fail the write.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub async fn write(&self, sector: u64, data: &[u8]) -> Result<()> {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        let subs = self.split_request(sector, data.len())?;

        let children = subs.iter().map(|sub| {
            let payload = &data[sub.payload_offset..sub.payload_offset + sub.len];
            async move {
                // Stage the parity update against the still-old device
                // contents before the write lands.
                if let Err(e) = self
                    .verify
                    .stage_write(sub.device_index, sub.local_sector, payload)
                    .await
                {
                    if e.is_protocol_violation() {
                        return Err(e);
                    }
                    warn!(
                        device = sub.device_index,
                        sector = sub.local_sector,
                        error = %e,
                        "verify task failed, parity stale for this span"
                    );
                    self.stats.verify_failures.fetch_add(1, Ordering::Relaxed);
                }

                self.array
                    .data_device(sub.device_index)
                    .write_at(sub.local_sector, payload)
                    .await
            }
        });

        // Barrier: wait for every child, then surface the first failure.
        let results = join_all(children).await;
        results.into_iter().collect::<Result<()>>()
    }

    /// Read `len` bytes starting at `sector`.
    ///
    /// Same split and barrier as the write path, minus the verify stage.
    #[instrument(skip(self))]
    pub async fn read(&self, sector: u64, len: usize) -> Result<BytesMut> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let subs = self.split_request(sector, len)?;

        let children = subs.iter().map(|sub| async move {
            let mut buf = vec![0u8; sub.len];
            self.array
                .data_device(sub.device_index)
                .read_at(sub.local_sector, &mut buf)
                .await?;
            Ok::<_, Error>((sub.payload_offset, buf))
        });

        let results = join_all(children).await;

        let mut out = BytesMut::zeroed(len);
        for result in results {
            let (offset, buf) = result?;
            out[offset..offset + buf.len()].copy_from_slice(&buf);
        }
        Ok(out)
    }
}

// =============================================================================
// Tests
// =============================================================================
