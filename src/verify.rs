//! Verify/parity task stage
//!
//! Every chunk-confined write sub-request stages one parity update
//! before the new data lands on its device:
//!
//! 1. capture the new data (a copy - the caller may reuse its buffer
//!    the moment submission returns);
//! 2. read the old data and the old parity concurrently (2-of-2 join);
//! 3. hand the (old, new, parity) triple to the offload slot as one job.
//!
//! A verify failure does not fail the user-visible write: the data write
//! proceeds and the broken parity relationship is logged and counted.
//! That choice mirrors the source array and is deliberate - parity here
//! protects against a later device loss, not against this write.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::buffer::ChunkBufPool;
use crate::chunk::{CHUNK_SIZE, SECTORS_PER_CHUNK, SECTOR_SHIFT};
use crate::device::DeviceArray;
use crate::error::{Error, Result};
use crate::offload::{JobDescriptor, OffloadClient, ParityJob};

// =============================================================================
// Statistics
// =============================================================================

/// Counters for the verify stage.
#[derive(Debug, Default)]
pub struct VerifyStats {
    /// Verify tasks staged and submitted
    pub tasks_submitted: AtomicU64,
    /// Verify tasks aborted (allocation or read failure)
    pub tasks_failed: AtomicU64,
}

// =============================================================================
// Verify stage
// =============================================================================

/// Stages parity-update jobs for write sub-requests.
#[derive(Debug)]
pub struct VerifyStage {
    array: DeviceArray,
    pool: Arc<ChunkBufPool>,
    client: Arc<OffloadClient>,
    stats: Arc<VerifyStats>,
}

impl VerifyStage {
    /// Create the stage over the attached array.
    pub fn new(array: DeviceArray, pool: Arc<ChunkBufPool>, client: Arc<OffloadClient>) -> Self {
        Self {
            array,
            pool,
            client,
            stats: Arc::new(VerifyStats::default()),
        }
    }

    /// Stage counters.
    pub fn stats(&self) -> &Arc<VerifyStats> {
        &self.stats
    }

    /// Stage and run one verify task for a write of `new_data` at
    /// `local_sector` on data device `device_index`.
    ///
    /// Hard precondition: the span must fit inside a single chunk. A
    /// larger or chunk-crossing span is a protocol violation, not an
    /// I/O error.
    ///
    /// Blocks until the offload slot has accepted and completed the
    /// parity update.
    pub async fn stage_write(
        &self,
        device_index: usize,
        local_sector: u64,
        new_data: &[u8],
    ) -> Result<()> {
        let offset = ((local_sector & (SECTORS_PER_CHUNK - 1)) << SECTOR_SHIFT) as usize;
        let size = new_data.len();
        if size == 0 || offset + size > CHUNK_SIZE {
            return Err(Error::Protocol(format!(
                "verify span offset {} + size {} exceeds one chunk",
                offset, size
            )));
        }

        self.stats.tasks_submitted.fetch_add(1, Ordering::Relaxed);

        let result = self
            .run_task(device_index, local_sector, offset, new_data)
            .await;
        if result.is_err() {
            self.stats.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn run_task(
        &self,
        device_index: usize,
        local_sector: u64,
        offset: usize,
        new_data: &[u8],
    ) -> Result<()> {
        let size = new_data.len();
        let range = offset..offset + size;

        // Capture the new data first; the caller's buffer is not ours
        // to keep.
        let mut new_buf = self.pool.get()?;
        new_buf[range.clone()].copy_from_slice(new_data);

        let mut old_buf = self.pool.get()?;
        let mut parity_buf = self.pool.get()?;

        let data_dev = self.array.data_device(device_index).clone();
        let parity_dev = self.array.parity_device().clone();

        // Both reads must land before staging; issue them together.
        let (old_read, parity_read) = tokio::join!(
            data_dev.read_at(local_sector, &mut old_buf[range.clone()]),
            parity_dev.read_at(local_sector, &mut parity_buf[range.clone()]),
        );
        old_read.map_err(|e| Error::VerifyRead {
            device: data_dev.info().name,
            reason: e.to_string(),
        })?;
        parity_read.map_err(|e| Error::VerifyRead {
            device: parity_dev.info().name,
            reason: e.to_string(),
        })?;

        let descriptor = JobDescriptor {
            sector: local_sector,
            offset: offset as u64,
            size: size as u64,
        };
        debug!(
            device = device_index,
            sector = local_sector,
            offset,
            size,
            "verify task staged"
        );

        self.client
            .submit(ParityJob {
                descriptor,
                old_data: old_buf,
                new_data: new_buf,
                old_parity: parity_buf,
            })
            .await
    }
}

// =============================================================================
// Tests
// =============================================================================
