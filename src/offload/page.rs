//! Control-page emulation
//!
//! The accelerator is addressed through one fixed-size control page of
//! eight-byte registers. The page has two disjoint zones plus a shared
//! doorbell:
//!
//! - host zone: the job descriptor (start sector, byte offset, size) and
//!   the `io_num` submission counter, written only by [`HostView`];
//! - device zone: the `io_done` completion counter, written only by
//!   [`DeviceView`];
//! - doorbell: the slot state register, advanced by exactly one side at
//!   each transition.
//!
//! The split is enforced at the type level: the page is constructed once
//! and torn into the two views, and each view exposes write access only
//! to its own zone. Raw `read_u64`/`write_u64` register decode is kept
//! for the peripheral contract; a write to a register the view does not
//! own is a protocol violation, not a silent store.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::chunk::CHUNK_SIZE;
use crate::error::{Error, Result};

// =============================================================================
// Register layout
// =============================================================================

/// Doorbell state register
pub const REG_STATE: u64 = 0x00;
/// Job start sector (device-local, host zone)
pub const REG_SECTOR: u64 = 0x08;
/// Job byte offset within the chunk (host zone)
pub const REG_OFFSET: u64 = 0x10;
/// Job size in bytes (host zone)
pub const REG_SIZE: u64 = 0x18;
/// Jobs submitted (host zone)
pub const REG_IO_NUM: u64 = 0x20;
/// Jobs completed (device zone)
pub const REG_IO_DONE: u64 = 0x28;

/// Size of the control page in bytes.
pub const CONTROL_PAGE_SIZE: usize = 4096;

// =============================================================================
// Slot state
// =============================================================================

/// Doorbell state of the single job slot.
///
/// The cycle is `Free → Submitted → InProgress → Done → Free`. The host
/// performs the first and last transitions, the device the middle two;
/// skipping a state is illegal from either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// No job in the slot; a submitter may claim it
    Free = 0,
    /// Descriptor written, doorbell rung, awaiting the accelerator
    Submitted = 1,
    /// Accelerator has claimed the job and is computing
    InProgress = 2,
    /// Parity persisted; awaiting host acknowledgement
    Done = 3,
}

impl SlotState {
    fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(SlotState::Free),
            1 => Ok(SlotState::Submitted),
            2 => Ok(SlotState::InProgress),
            3 => Ok(SlotState::Done),
            other => Err(Error::Protocol(format!(
                "corrupt slot state value {}",
                other
            ))),
        }
    }

    /// Whether `self → to` is a legal host-side transition.
    fn host_may(self, to: SlotState) -> bool {
        matches!(
            (self, to),
            (SlotState::Free, SlotState::Submitted) | (SlotState::Done, SlotState::Free)
        )
    }

    /// Whether `self → to` is a legal device-side transition.
    fn device_may(self, to: SlotState) -> bool {
        matches!(
            (self, to),
            (SlotState::Submitted, SlotState::InProgress)
                | (SlotState::InProgress, SlotState::Done)
        )
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotState::Free => write!(f, "FREE"),
            SlotState::Submitted => write!(f, "SUBMITTED"),
            SlotState::InProgress => write!(f, "IN_PROGRESS"),
            SlotState::Done => write!(f, "DONE"),
        }
    }
}

// =============================================================================
// Job descriptor
// =============================================================================

/// The live job descriptor held in the host zone of the control page.
///
/// `sector` is device-local (the same location on the target data device
/// and the parity device); `offset` positions the job's bytes within the
/// chunk-sized staging buffers; `size` never exceeds one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDescriptor {
    /// Device-local start sector
    pub sector: u64,
    /// Byte offset within the chunk staging area
    pub offset: u64,
    /// Job size in bytes
    pub size: u64,
}

impl JobDescriptor {
    /// Validate the descriptor against the single-chunk staging area.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::Protocol("job size must be > 0".into()));
        }
        if self.offset + self.size > CHUNK_SIZE as u64 {
            return Err(Error::Protocol(format!(
                "job offset {} + size {} exceeds chunk size {}",
                self.offset, self.size, CHUNK_SIZE
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Shared register file
// =============================================================================

#[derive(Debug)]
struct Registers {
    state: AtomicU8,
    sector: AtomicU64,
    offset: AtomicU64,
    size: AtomicU64,
    io_num: AtomicU64,
    io_done: AtomicU64,
}

impl Registers {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SlotState::Free as u8),
            sector: AtomicU64::new(0),
            offset: AtomicU64::new(0),
            size: AtomicU64::new(0),
            io_num: AtomicU64::new(0),
            io_done: AtomicU64::new(0),
        }
    }

    fn state(&self) -> Result<SlotState> {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn read_u64(&self, reg: u64) -> Result<u64> {
        match reg {
            REG_STATE => Ok(self.state.load(Ordering::Acquire) as u64),
            REG_SECTOR => Ok(self.sector.load(Ordering::Acquire)),
            REG_OFFSET => Ok(self.offset.load(Ordering::Acquire)),
            REG_SIZE => Ok(self.size.load(Ordering::Acquire)),
            REG_IO_NUM => Ok(self.io_num.load(Ordering::Acquire)),
            REG_IO_DONE => Ok(self.io_done.load(Ordering::Acquire)),
            other => Err(Error::Protocol(format!(
                "read of unmapped register {:#x}",
                other
            ))),
        }
    }
}

/// Create one control page, torn directly into its two single-owner
/// views. Called once per array; the underlying registers are shared,
/// the write rights are not.
pub fn split_control_page() -> (HostView, DeviceView) {
    let regs = Arc::new(Registers::new());
    (HostView { regs: regs.clone() }, DeviceView { regs })
}

// =============================================================================
// HostView
// =============================================================================

/// The initiator's half of the control page.
///
/// Exclusive writer of the descriptor registers and `io_num`; may only
/// advance the doorbell `Free→Submitted` and `Done→Free`.
#[derive(Debug)]
pub struct HostView {
    regs: Arc<Registers>,
}

impl HostView {
    /// Current doorbell state.
    pub fn state(&self) -> Result<SlotState> {
        self.regs.state()
    }

    /// Advance the doorbell `from → to`, failing on any illegal or
    /// missed transition.
    pub fn advance(&self, from: SlotState, to: SlotState) -> Result<()> {
        if !from.host_may(to) {
            return Err(Error::Protocol(format!(
                "host may not transition {} -> {}",
                from, to
            )));
        }
        self.regs
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|cur| {
                Error::Protocol(format!(
                    "host transition {} -> {} raced: slot is {}",
                    from,
                    to,
                    SlotState::from_u8(cur)
                        .map(|s| s.to_string())
                        .unwrap_or_else(|_| format!("{:#x}", cur))
                ))
            })?;
        Ok(())
    }

    /// Write the job descriptor into the host zone.
    ///
    /// Must only be called while the slot is held by this initiator;
    /// overwriting a live descriptor would corrupt an unrelated job.
    pub fn write_descriptor(&self, desc: &JobDescriptor) -> Result<()> {
        desc.validate()?;
        self.regs.sector.store(desc.sector, Ordering::Release);
        self.regs.offset.store(desc.offset, Ordering::Release);
        self.regs.size.store(desc.size, Ordering::Release);
        Ok(())
    }

    /// Count a submitted job.
    pub fn bump_io_num(&self) -> u64 {
        self.regs.io_num.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Raw register read (peripheral contract).
    pub fn read_u64(&self, reg: u64) -> Result<u64> {
        self.regs.read_u64(reg)
    }

    /// Raw register write (peripheral contract). Only host-zone
    /// registers are accepted.
    pub fn write_u64(&self, reg: u64, value: u64) -> Result<()> {
        match reg {
            REG_SECTOR => self.regs.sector.store(value, Ordering::Release),
            REG_OFFSET => self.regs.offset.store(value, Ordering::Release),
            REG_SIZE => self.regs.size.store(value, Ordering::Release),
            REG_IO_NUM => self.regs.io_num.store(value, Ordering::Release),
            REG_STATE | REG_IO_DONE => {
                return Err(Error::Protocol(format!(
                    "host write to device-owned register {:#x}",
                    reg
                )))
            }
            other => {
                return Err(Error::Protocol(format!(
                    "write to unmapped register {:#x}",
                    other
                )))
            }
        }
        Ok(())
    }
}

// =============================================================================
// DeviceView
// =============================================================================

/// The accelerator's half of the control page.
///
/// Exclusive writer of `io_done`; may only advance the doorbell
/// `Submitted→InProgress` and `InProgress→Done`.
#[derive(Debug)]
pub struct DeviceView {
    regs: Arc<Registers>,
}

impl DeviceView {
    /// Current doorbell state.
    pub fn state(&self) -> Result<SlotState> {
        self.regs.state()
    }

    /// Advance the doorbell `from → to`, failing on any illegal or
    /// missed transition.
    pub fn advance(&self, from: SlotState, to: SlotState) -> Result<()> {
        if !from.device_may(to) {
            return Err(Error::Protocol(format!(
                "device may not transition {} -> {}",
                from, to
            )));
        }
        self.regs
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|cur| {
                Error::Protocol(format!(
                    "device transition {} -> {} raced: slot is {}",
                    from,
                    to,
                    SlotState::from_u8(cur)
                        .map(|s| s.to_string())
                        .unwrap_or_else(|_| format!("{:#x}", cur))
                ))
            })?;
        Ok(())
    }

    /// Read the live job descriptor from the host zone.
    pub fn read_descriptor(&self) -> JobDescriptor {
        JobDescriptor {
            sector: self.regs.sector.load(Ordering::Acquire),
            offset: self.regs.offset.load(Ordering::Acquire),
            size: self.regs.size.load(Ordering::Acquire),
        }
    }

    /// Whether a submitted job is outstanding (`io_num > io_done`).
    pub fn job_pending(&self) -> bool {
        self.regs.io_num.load(Ordering::Acquire) > self.regs.io_done.load(Ordering::Acquire)
    }

    /// Count a completed job.
    pub fn bump_io_done(&self) -> u64 {
        self.regs.io_done.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Raw register read (peripheral contract).
    pub fn read_u64(&self, reg: u64) -> Result<u64> {
        self.regs.read_u64(reg)
    }

    /// Raw register write (peripheral contract). Only the device-zone
    /// register is accepted.
    pub fn write_u64(&self, reg: u64, value: u64) -> Result<()> {
        match reg {
            REG_IO_DONE => self.regs.io_done.store(value, Ordering::Release),
            REG_STATE | REG_SECTOR | REG_OFFSET | REG_SIZE | REG_IO_NUM => {
                return Err(Error::Protocol(format!(
                    "device write to host-owned register {:#x}",
                    reg
                )))
            }
            other => {
                return Err(Error::Protocol(format!(
                    "write to unmapped register {:#x}",
                    other
                )))
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_full_cycle() {
        let (host, device) = split_control_page();
        assert_eq!(host.state().unwrap(), SlotState::Free);

        host.advance(SlotState::Free, SlotState::Submitted).unwrap();
        device
            .advance(SlotState::Submitted, SlotState::InProgress)
            .unwrap();
        device
            .advance(SlotState::InProgress, SlotState::Done)
            .unwrap();
        host.advance(SlotState::Done, SlotState::Free).unwrap();
        assert_eq!(device.state().unwrap(), SlotState::Free);
    }

    #[test]
    fn test_skipped_states_rejected() {
        let (host, device) = split_control_page();

        // Device must never jump FREE -> IN_PROGRESS
        assert_matches!(
            device.advance(SlotState::Free, SlotState::InProgress),
            Err(Error::Protocol(_))
        );
        // Host must never complete a job itself
        assert_matches!(
            host.advance(SlotState::Submitted, SlotState::Done),
            Err(Error::Protocol(_))
        );
        // Legal pair but wrong current state
        assert_matches!(
            host.advance(SlotState::Done, SlotState::Free),
            Err(Error::Protocol(_))
        );
    }

    #[test]
    fn test_zone_ownership_enforced() {
        let (host, device) = split_control_page();

        assert_matches!(host.write_u64(REG_IO_DONE, 1), Err(Error::Protocol(_)));
        assert_matches!(host.write_u64(REG_STATE, 1), Err(Error::Protocol(_)));
        assert_matches!(device.write_u64(REG_SECTOR, 1), Err(Error::Protocol(_)));
        assert_matches!(device.write_u64(REG_IO_NUM, 1), Err(Error::Protocol(_)));

        // Each side can write its own zone and both can read everything
        host.write_u64(REG_SECTOR, 42).unwrap();
        device.write_u64(REG_IO_DONE, 7).unwrap();
        assert_eq!(device.read_u64(REG_SECTOR).unwrap(), 42);
        assert_eq!(host.read_u64(REG_IO_DONE).unwrap(), 7);
    }

    #[test]
    fn test_unmapped_register() {
        let (host, _device) = split_control_page();
        assert_matches!(host.read_u64(0x100), Err(Error::Protocol(_)));
        assert_matches!(host.write_u64(0x100, 0), Err(Error::Protocol(_)));
    }

    #[test]
    fn test_descriptor_roundtrip_and_accounting() {
        let (host, device) = split_control_page();
        let desc = JobDescriptor {
            sector: 16,
            offset: 512,
            size: 1024,
        };
        host.write_descriptor(&desc).unwrap();
        assert_eq!(device.read_descriptor(), desc);

        assert!(!device.job_pending());
        host.bump_io_num();
        assert!(device.job_pending());
        device.bump_io_done();
        assert!(!device.job_pending());
    }

    #[test]
    fn test_descriptor_size_limit() {
        let desc = JobDescriptor {
            sector: 0,
            offset: 1024,
            size: CHUNK_SIZE as u64,
        };
        assert_matches!(desc.validate(), Err(Error::Protocol(_)));

        let desc = JobDescriptor {
            sector: 0,
            offset: 0,
            size: 0,
        };
        assert_matches!(desc.validate(), Err(Error::Protocol(_)));
    }
}
