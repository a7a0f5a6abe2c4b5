//! ParStor - Striped Block Array with Offloaded Parity
//!
//! A striped (RAID-4 style) block storage layer: N data devices carry
//! fixed-size chunks round-robin, one dedicated device carries parity,
//! and every write runs a verify/parity stage that keeps the parity
//! relationship `P = D0 ^ D1 ^ ... ^ Dn-1` current through rolling
//! updates (`P' = P ^ old ^ new`).
//!
//! # Architecture
//!
//! The data path follows a three-stage pattern:
//!
//! ```text
//! Splitter (StripedVolume) → Verify Stage → Parity Engine (offload slot)
//! ```
//!
//! An incoming request is cleaved into chunk-confined sub-requests with
//! a fan-in completion barrier. Each write sub-request stages a parity
//! job through a single-slot mailbox (`FREE → SUBMITTED → IN_PROGRESS →
//! DONE → FREE`) whose host and device register zones are enforced by
//! the type system, not by convention.
//!
//! # Modules
//!
//! - [`buffer`] - Aligned chunk buffers and the per-task pool
//! - [`chunk`] - Sector/chunk geometry arithmetic
//! - [`config`] - Array configuration and validation
//! - [`device`] - Block device trait, in-memory devices, the array
//! - [`error`] - Error types
//! - [`offload`] - Control page, mailbox protocol, parity engine
//! - [`verify`] - Verify/parity task stage
//! - [`volume`] - Request splitting, chaining and the data path

pub mod buffer;
pub mod chunk;
pub mod config;
pub mod device;
pub mod error;
pub mod offload;
pub mod verify;
pub mod volume;

#[cfg(test)]
mod proptest;

// Re-export commonly used types
pub use buffer::{ChunkBuf, ChunkBufPool};
pub use chunk::{Geometry, CHUNK_SIZE, SECTORS_PER_CHUNK, SECTOR_SIZE};
pub use config::ArrayConfig;
pub use device::{BlockDevice, DeviceArray, MemDevice};
pub use error::{Error, Result};
pub use offload::{EngineHandle, OffloadClient, ParityEngine, SlotState};
pub use verify::VerifyStage;
pub use volume::{StripedVolume, SubRequest};
