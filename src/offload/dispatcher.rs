//! Accelerator dispatcher - the consumer side of the mailbox
//!
//! [`ParityEngine`] plays the role of the offload computation engine: a
//! single perpetual background task that drains the job channel, walks
//! the device-side doorbell transitions, recomputes parity in 8-byte
//! lanes, persists it to the parity device and raises the completion
//! signal. Message delivery replaces the register shadow-diffing a
//! polling dispatcher would need; the doorbell and `io_num`/`io_done`
//! accounting registers are still maintained so the host can observe
//! the slot.
//!
//! The engine yields cooperatively after every job so a busy parity
//! stream cannot starve the rest of the runtime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::buffer::ChunkBufPool;
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::offload::page::{DeviceView, SlotState};
use crate::offload::protocol::ParityJob;

// =============================================================================
// XOR kernel
// =============================================================================

/// Apply the rolling parity update `parity ^= old ^ new` in 8-byte lanes.
///
/// All three slices must have the same length. The update is its own
/// inverse: applying it again with `old` and `new` swapped restores the
/// original parity.
pub fn xor_update(parity: &mut [u8], old: &[u8], new: &[u8]) {
    assert_eq!(parity.len(), old.len());
    assert_eq!(parity.len(), new.len());

    let mut p = parity.chunks_exact_mut(8);
    let mut o = old.chunks_exact(8);
    let mut n = new.chunks_exact(8);

    for ((p, o), n) in (&mut p).zip(&mut o).zip(&mut n) {
        let lane = u64::from_ne_bytes(p.try_into().unwrap())
            ^ u64::from_ne_bytes(o.try_into().unwrap())
            ^ u64::from_ne_bytes(n.try_into().unwrap());
        p.copy_from_slice(&lane.to_ne_bytes());
    }

    // Sector-granular jobs never leave a tail, but stay correct if one
    // ever appears.
    for ((p, o), n) in p
        .into_remainder()
        .iter_mut()
        .zip(o.remainder())
        .zip(n.remainder())
    {
        *p ^= o ^ n;
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters maintained by the parity engine.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Jobs completed successfully
    pub jobs_completed: AtomicU64,
    /// Jobs that failed against the parity device
    pub jobs_failed: AtomicU64,
    /// Total bytes run through the XOR kernel
    pub bytes_xored: AtomicU64,
}

impl EngineStats {
    /// Create zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }
}

// =============================================================================
// Engine
// =============================================================================

/// The background parity computation engine.
pub struct ParityEngine {
    device: DeviceView,
    jobs: mpsc::Receiver<ParityJob>,
    completion: Arc<Notify>,
    parity_dev: Arc<dyn BlockDevice>,
    pool: Arc<ChunkBufPool>,
    stats: Arc<EngineStats>,
}

/// Handle to a running engine: statistics plus join-on-shutdown.
#[derive(Debug)]
pub struct EngineHandle {
    stats: Arc<EngineStats>,
    join: JoinHandle<()>,
}

impl EngineHandle {
    /// Engine statistics.
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Wait for the engine to drain and stop. The engine stops once
    /// every job sender has been dropped.
    pub async fn stopped(self) {
        let _ = self.join.await;
    }
}

impl ParityEngine {
    /// Spawn the engine as a background task.
    pub fn spawn(
        device: DeviceView,
        jobs: mpsc::Receiver<ParityJob>,
        completion: Arc<Notify>,
        parity_dev: Arc<dyn BlockDevice>,
        pool: Arc<ChunkBufPool>,
    ) -> EngineHandle {
        let stats = Arc::new(EngineStats::new());
        let engine = Self {
            device,
            jobs,
            completion,
            parity_dev,
            pool,
            stats: stats.clone(),
        };
        let join = tokio::spawn(engine.run());
        EngineHandle { stats, join }
    }

    async fn run(mut self) {
        info!("parity engine started");
        while let Some(job) = self.jobs.recv().await {
            if let Err(e) = self.process(job).await {
                if e.is_protocol_violation() {
                    // Mailbox contract broken: the slot contents can no
                    // longer be trusted. Stop consuming.
                    error!(error = %e, "protocol violation, engine halting");
                    break;
                }
                error!(error = %e, "parity job failed");
            }
            // One job per scheduling slice; never starve the core.
            tokio::task::yield_now().await;
        }
        info!("parity engine stopped");
    }

    async fn process(&self, mut job: ParityJob) -> Result<()> {
        // The message and the registers describe the same job; disagreement
        // means a descriptor was overwritten while live.
        let reg = self.device.read_descriptor();
        if reg != job.descriptor {
            return Err(Error::Protocol(format!(
                "descriptor mismatch: registers {:?}, message {:?}",
                reg, job.descriptor
            )));
        }
        if !self.device.job_pending() {
            return Err(Error::Protocol(
                "job delivered with io_num <= io_done".into(),
            ));
        }

        self.device
            .advance(SlotState::Submitted, SlotState::InProgress)?;

        let offset = job.descriptor.offset as usize;
        let size = job.descriptor.size as usize;
        let range = offset..offset + size;

        xor_update(
            &mut job.old_parity[range.clone()],
            &job.old_data[range.clone()],
            &job.new_data[range.clone()],
        );
        self.stats
            .bytes_xored
            .fetch_add(size as u64, Ordering::Relaxed);

        // Persist before DONE: the host may trust the parity device the
        // moment the completion signal arrives.
        let result = self
            .parity_dev
            .write_at(job.descriptor.sector, &job.old_parity[range])
            .await;

        let ParityJob {
            old_data,
            new_data,
            old_parity,
            descriptor,
        } = job;
        self.pool.put(old_data);
        self.pool.put(new_data);
        self.pool.put(old_parity);

        match result {
            Ok(()) => {
                self.device.advance(SlotState::InProgress, SlotState::Done)?;
                let io_done = self.device.bump_io_done();
                self.stats.jobs_completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    io_done,
                    sector = descriptor.sector,
                    size = descriptor.size,
                    "parity persisted"
                );
                // Out-of-band wakeup for the blocked initiator.
                self.completion.notify_one();
                Ok(())
            }
            Err(e) => {
                // No completion signal: the slot stays IN_PROGRESS and the
                // submitter blocks (or times out, if configured). Matches
                // the accelerator contract for a lost job.
                self.stats.jobs_failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ChunkBuf;
    use crate::chunk::CHUNK_SIZE;
    use crate::device::MemDevice;
    use crate::offload::page::{split_control_page, JobDescriptor};

    #[test]
    fn test_xor_update_basic() {
        let mut parity = vec![0u8; 64];
        let old = vec![0u8; 64];
        let new = vec![0xFFu8; 64];

        xor_update(&mut parity, &old, &new);
        assert!(parity.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_xor_update_self_inverse() {
        let mut parity: Vec<u8> = (0..64).map(|i| (i * 7) as u8).collect();
        let original = parity.clone();
        let old: Vec<u8> = (0..64).map(|i| (i * 3) as u8).collect();
        let new: Vec<u8> = (0..64).map(|i| (i * 11) as u8).collect();

        // P' = P ^ O ^ N, then undoing the write (new'=old) restores P.
        xor_update(&mut parity, &old, &new);
        xor_update(&mut parity, &new, &old);
        assert_eq!(parity, original);
    }

    #[test]
    fn test_xor_update_tail_lanes() {
        // 13 bytes: one full lane plus a 5-byte tail
        let mut parity = vec![0x0Fu8; 13];
        let old = vec![0xF0u8; 13];
        let new = vec![0xAAu8; 13];

        xor_update(&mut parity, &old, &new);
        assert!(parity.iter().all(|&b| b == 0x0F ^ 0xF0 ^ 0xAA));
    }

    fn staged_job(desc: JobDescriptor, old: u8, new: u8, parity: u8) -> ParityJob {
        let mut job = ParityJob {
            descriptor: desc,
            old_data: ChunkBuf::new_chunk().unwrap(),
            new_data: ChunkBuf::new_chunk().unwrap(),
            old_parity: ChunkBuf::new_chunk().unwrap(),
        };
        job.old_data.fill(old);
        job.new_data.fill(new);
        job.old_parity.fill(parity);
        job
    }

    #[tokio::test]
    async fn test_engine_processes_and_persists() {
        let (host, device) = split_control_page();
        let (tx, rx) = mpsc::channel(1);
        let completion = Arc::new(Notify::new());
        let parity_dev = MemDevice::new("parity", 64 * 1024);
        let pool = Arc::new(ChunkBufPool::new(CHUNK_SIZE, 0, 8).unwrap());

        let handle = ParityEngine::spawn(
            device,
            rx,
            completion.clone(),
            parity_dev.clone(),
            pool.clone(),
        );

        let desc = JobDescriptor {
            sector: 8,
            offset: 0,
            size: CHUNK_SIZE as u64,
        };
        host.advance(SlotState::Free, SlotState::Submitted).unwrap();
        host.write_descriptor(&desc).unwrap();
        host.bump_io_num();
        tx.send(staged_job(desc, 0x00, 0xFF, 0x00)).await.unwrap();

        completion.notified().await;
        assert_eq!(host.state().unwrap(), SlotState::Done);
        host.advance(SlotState::Done, SlotState::Free).unwrap();

        // Parity device now holds old ^ old_data ^ new_data = 0xFF
        let written = parity_dev.snapshot(8 * 512, CHUNK_SIZE);
        assert!(written.iter().all(|&b| b == 0xFF));

        // Buffers returned to the pool
        assert_eq!(pool.available(), 3);
        assert_eq!(handle.stats().jobs_completed.load(Ordering::Relaxed), 1);

        drop(tx);
        handle.stopped().await;
    }

    #[tokio::test]
    async fn test_engine_halts_on_descriptor_mismatch() {
        let (host, device) = split_control_page();
        let (tx, rx) = mpsc::channel(1);
        let completion = Arc::new(Notify::new());
        let parity_dev = MemDevice::new("parity", 64 * 1024);
        let pool = Arc::new(ChunkBufPool::new(CHUNK_SIZE, 0, 8).unwrap());

        let handle =
            ParityEngine::spawn(device, rx, completion, parity_dev, pool);

        let desc = JobDescriptor {
            sector: 0,
            offset: 0,
            size: 512,
        };
        host.advance(SlotState::Free, SlotState::Submitted).unwrap();
        // Registers describe a different job than the message.
        host.write_descriptor(&JobDescriptor {
            sector: 99,
            offset: 0,
            size: 512,
        })
        .unwrap();
        host.bump_io_num();
        tx.send(staged_job(desc, 0, 0, 0)).await.unwrap();

        // Protocol violation: the engine halts instead of computing.
        handle.stopped().await;
        assert_eq!(host.state().unwrap(), SlotState::Submitted);
    }
}
