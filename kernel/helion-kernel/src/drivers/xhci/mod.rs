//! xHCI host-controller core.
//!
//! Ring machinery, register layout, context tables, and the slot state
//! machine for USB3 host controllers, driven by the cycle-bit protocol:
//!
//! - [`trb`]: the 16-byte descriptors and their builders.
//! - [`ring`]: producer rings (command/transfer) and the event ring
//!   consumer with its segment table.
//! - [`context`]: slot/endpoint/input contexts and DCBAAP entries.
//! - [`regs`]: register offsets, bitmasks, and fenced MMIO access.
//! - [`port`]: port reset with bounded polling.
//! - `controller` / `device` (kernel runtime): PCI discovery, the
//!   reset/configure/run sequence, command submission, the
//!   enable-slot/address/configure state machine, and transfer
//!   submission.

pub mod context;
pub mod port;
pub mod regs;
pub mod ring;
pub mod trb;

#[cfg(target_os = "none")]
mod controller;
#[cfg(target_os = "none")]
mod device;

#[cfg(target_os = "none")]
pub use controller::{
    XhciEvent, poll_controllers, register_event_callback, register_probe,
};

/// Errors surfaced by the xHCI core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XhciError {
    /// A bounded register poll (reset, command completion) expired.
    MmioTimeout,
    /// A command completed with a non-success code.
    CommandFailed(trb::CompletionCode),
    /// A transfer completed with a non-success code.
    TransferFailed(trb::CompletionCode),
    /// No device slot is available.
    NoSlot,
    /// DMA memory for rings or contexts could not be allocated.
    OutOfMemory,
    /// The ring has no free slot for another TRB.
    RingFull,
    /// No controller matched the PCI scan.
    NotPresent,
}
