//! Parity offload subsystem
//!
//! The host side of the array never computes parity itself. Each write
//! stages an (old data, new data, old parity) triple and hands it to an
//! accelerator through a single-slot mailbox:
//!
//! ```text
//! ┌──────────────┐  descriptor + doorbell   ┌──────────────────┐
//! │  Initiators   │ ───────────────────────▶ │   ParityEngine   │
//! │ (verify path) │                          │  (dispatcher)    │
//! │               │ ◀─────────────────────── │                  │
//! └──────────────┘   completion notification └──────────────────┘
//!         │                                          │
//!         └──────────── control page ────────────────┘
//!              host zone │ state │ device zone
//! ```
//!
//! One job occupies the slot at a time; every parity update in the
//! system serializes through it. The control page is split into two
//! typed views so neither side can write the other's registers.

pub mod dispatcher;
pub mod page;
pub mod protocol;

pub use dispatcher::{xor_update, EngineHandle, EngineStats, ParityEngine};
pub use page::{split_control_page, DeviceView, HostView, JobDescriptor, SlotState};
pub use protocol::{OffloadClient, ParityJob};
