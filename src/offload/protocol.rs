//! Offload protocol - the initiator side of the mailbox
//!
//! [`OffloadClient`] owns the submission right for the single job slot.
//! A submitter must hold the right and observe the slot `FREE` before it
//! may write the descriptor; every other initiator blocks on the
//! condition wait until the completion handler frees the slot and wakes
//! exactly one of them. The descriptor travels to the dispatcher as an
//! ordinary message on a capacity-1 channel; the doorbell register is
//! still advanced on every transition so the peripheral contract stays
//! observable (and violations stay detectable).
//!
//! The completion notification is an out-of-band signal distinct from
//! the state register: the register alone cannot wake a blocked
//! initiator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, warn};

use crate::buffer::ChunkBuf;
use crate::error::{Error, Result};
use crate::offload::page::{HostView, JobDescriptor, SlotState};

// =============================================================================
// Job
// =============================================================================

/// One staged parity-update job: the descriptor plus the three
/// chunk-sized payload buffers. Buffers are pool-allocated per task and
/// owned by the job until the dispatcher releases them.
#[derive(Debug)]
pub struct ParityJob {
    /// Where the job applies (device-local)
    pub descriptor: JobDescriptor,
    /// Old contents of the target data range
    pub old_data: ChunkBuf,
    /// New contents about to be written
    pub new_data: ChunkBuf,
    /// Current parity for the range
    pub old_parity: ChunkBuf,
}

// =============================================================================
// Client
// =============================================================================

/// Initiator-side handle for the parity offload slot.
pub struct OffloadClient {
    host: HostView,
    /// The submission right. Held for the whole FREE→…→FREE cycle.
    submit_gate: Mutex<()>,
    /// Wakes one waiter when the slot returns to FREE.
    free_wakeup: Notify,
    /// Out-of-band completion signal raised by the dispatcher.
    completion: Arc<Notify>,
    /// Single-slot delivery channel to the dispatcher.
    jobs: mpsc::Sender<ParityJob>,
    /// Optional deadline for the accelerator response.
    timeout: Option<Duration>,
}

impl std::fmt::Debug for OffloadClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadClient")
            .field("state", &self.host.state())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl OffloadClient {
    /// Create the client over the host view of the control page.
    pub fn new(
        host: HostView,
        jobs: mpsc::Sender<ParityJob>,
        completion: Arc<Notify>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            host,
            submit_gate: Mutex::new(()),
            free_wakeup: Notify::new(),
            completion,
            jobs,
            timeout,
        }
    }

    /// Current doorbell state (diagnostics).
    pub fn slot_state(&self) -> Result<SlotState> {
        self.host.state()
    }

    /// Submit one parity job and wait for the accelerator to complete it.
    ///
    /// Serializes against every other submitter in the system: the slot
    /// holds one job, so at most one caller is past the gate at a time.
    /// With no timeout configured a lost job blocks forever, matching
    /// the accelerator contract.
    ///
    /// # Errors
    ///
    /// - `Error::Protocol` for descriptor or state-machine violations
    /// - `Error::OffloadTimeout` if a deadline is configured and passes
    /// - `Error::EngineStopped` if the dispatcher has shut down
    pub async fn submit(&self, job: ParityJob) -> Result<()> {
        job.descriptor.validate()?;

        let _right = self.submit_gate.lock().await;
        self.wait_free().await?;

        self.host.advance(SlotState::Free, SlotState::Submitted)?;
        self.host.write_descriptor(&job.descriptor)?;
        let io_num = self.host.bump_io_num();
        debug!(
            io_num,
            sector = job.descriptor.sector,
            offset = job.descriptor.offset,
            size = job.descriptor.size,
            "parity job submitted"
        );

        // Capacity-1 channel plus the gate means this never blocks; it
        // only fails when the engine is gone.
        if self.jobs.send(job).await.is_err() {
            error!("parity engine unavailable, job dropped");
            return Err(Error::EngineStopped);
        }

        self.wait_completion().await?;

        self.host.advance(SlotState::Done, SlotState::Free)?;
        // Wake exactly one blocked submitter, if any.
        self.free_wakeup.notify_one();
        Ok(())
    }

    /// Condition wait for a FREE slot. Never overwrites a live
    /// descriptor: with the gate held the slot is normally already FREE,
    /// and the loop guards the contract rather than the common path.
    ///
    /// An abandoned job can leave the slot in a non-FREE state with no
    /// owner to free it, so this wait carries the same deadline as the
    /// completion wait, reclaims an orphaned DONE slot, and fails with
    /// `EngineStopped` if the dispatcher goes away while waiting.
    async fn wait_free(&self) -> Result<()> {
        loop {
            match self.host.state()? {
                SlotState::Free => return Ok(()),
                // A completion that landed after its submitter gave up
                // leaves DONE with no owner; reclaim it.
                SlotState::Done => {
                    self.host.advance(SlotState::Done, SlotState::Free)?;
                    return Ok(());
                }
                other => {
                    debug!(state = %other, "slot busy, waiting for FREE");
                    self.wait_wakeup(&self.free_wakeup).await?;
                }
            }
        }
    }

    /// Wait for the completion signal and a DONE slot.
    ///
    /// A wakeup with the slot not yet DONE is a leftover permit from an
    /// abandoned job and is ignored; only the DONE observation completes
    /// the wait.
    async fn wait_completion(&self) -> Result<()> {
        loop {
            self.wait_wakeup(&self.completion).await?;
            if self.host.state()? == SlotState::Done {
                return Ok(());
            }
        }
    }

    /// One bounded wait on a wakeup signal. Fails with `EngineStopped`
    /// when the dispatcher drops the job channel, and with
    /// `OffloadTimeout` once the configured deadline passes.
    async fn wait_wakeup(&self, signal: &Notify) -> Result<()> {
        let woken = async {
            tokio::select! {
                _ = signal.notified() => Ok(()),
                _ = self.jobs.closed() => {
                    error!("parity engine gone while waiting on the slot");
                    Err(Error::EngineStopped)
                }
            }
        };
        match self.timeout {
            None => woken.await,
            Some(deadline) => match tokio::time::timeout(deadline, woken).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        waited_ms = deadline.as_millis() as u64,
                        "accelerator deadline passed"
                    );
                    Err(Error::OffloadTimeout {
                        waited_ms: deadline.as_millis() as u64,
                    })
                }
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
