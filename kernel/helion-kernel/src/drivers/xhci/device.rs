//! Per-slot device state: contexts, transfer rings, and the
//! `Default -> SlotEnabled -> Addressed -> Configured` progression.
//!
//! A slot's life cycle is driven by the controller's command machinery:
//! Enable Slot yields the slot ID, Address Device evaluates the input
//! context with slot + EP0, Configure Endpoint brings up further
//! endpoints. Disable Slot tears everything down and releases the DCBAAP
//! entry. All tables and rings live in the DMA heap (sub-4 GiB,
//! physically contiguous).

use crate::addr::{PhysAddr, VirtAddr};
use crate::mm::heap;

use super::XhciError;
use super::context::{DeviceContext, InputContext, PortSpeed};
use super::ring::{ProducerRing, RING_LEN};
use super::trb::Trb;

/// Slot state per the command state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Slot enabled, no address assigned.
    Enabled,
    /// Address Device succeeded; EP0 is live.
    Addressed,
    /// Configure Endpoint succeeded; data endpoints are live.
    Configured,
}

/// A DMA allocation: virtual alias, physical address.
pub struct DmaBlock {
    /// Heap pointer (HHDM-resident).
    pub virt: VirtAddr,
    /// Device-visible address.
    pub phys: PhysAddr,
}

impl DmaBlock {
    /// Allocates zeroed DMA memory.
    pub fn zeroed(size: usize, align: usize) -> Result<Self, XhciError> {
        let (virt, phys) = heap::alloc_dma(size, align).ok_or(XhciError::OutOfMemory)?;
        // SAFETY: the allocation is `size` bytes and exclusively ours.
        unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, size) };
        Ok(Self { virt, phys })
    }
}

impl Drop for DmaBlock {
    fn drop(&mut self) {
        heap::free(self.virt.as_mut_ptr());
    }
}

/// A transfer ring with its backing DMA memory.
pub struct TransferRing {
    /// Keeps the ring memory alive; the producer holds raw pointers in.
    _memory: DmaBlock,
    /// Producer state over that memory.
    pub ring: ProducerRing,
}

impl TransferRing {
    /// Allocates a fresh transfer ring.
    pub fn new() -> Result<Self, XhciError> {
        let bytes = RING_LEN * core::mem::size_of::<Trb>();
        let memory = DmaBlock::zeroed(bytes, 64)?;
        // SAFETY: zeroed, exclusively owned, physically contiguous.
        let ring = unsafe {
            ProducerRing::new(
                memory.virt.as_mut_ptr::<Trb>(),
                memory.phys.as_u64(),
                RING_LEN,
            )
        };
        Ok(Self {
            _memory: memory,
            ring,
        })
    }
}

/// One enabled device slot.
pub struct DeviceSlot {
    /// Slot ID assigned by Enable Slot (1-based).
    pub slot_id: u8,
    /// Current state-machine position.
    pub state: SlotState,
    /// Root hub port the device hangs off (1-based).
    pub root_port: u8,
    /// Port speed at enumeration time.
    pub speed: PortSpeed,
    /// Output device context, wired into DCBAAP.
    pub device_ctx: DmaBlock,
    /// Input context used by Address Device / Configure Endpoint.
    pub input_ctx: DmaBlock,
    /// EP0 (control) transfer ring; DCI 1.
    pub ep0: TransferRing,
    /// Interrupt IN transfer ring, once configured; DCI 3.
    pub interrupt_in: Option<TransferRing>,
    /// Buffer for in-flight interrupt transfers.
    pub interrupt_buf: Option<DmaBlock>,
}

impl DeviceSlot {
    /// Builds the slot bookkeeping after a successful Enable Slot.
    ///
    /// Allocates the output device context (64-byte aligned, sub-4 GiB),
    /// the input context, and the EP0 transfer ring. The caller wires
    /// `device_ctx.phys` into DCBAAP before issuing Address Device.
    pub fn new(slot_id: u8, root_port: u8, speed: PortSpeed) -> Result<Self, XhciError> {
        let device_ctx = DmaBlock::zeroed(core::mem::size_of::<DeviceContext>(), 64)?;
        let input_ctx = DmaBlock::zeroed(core::mem::size_of::<InputContext>(), 64)?;
        let ep0 = TransferRing::new()?;

        Ok(Self {
            slot_id,
            state: SlotState::Enabled,
            root_port,
            speed,
            device_ctx,
            input_ctx,
            ep0,
            interrupt_in: None,
            interrupt_buf: None,
        })
    }

    /// Returns the input context for mutation.
    ///
    /// The DMA block is exclusively owned by this slot, so handing out a
    /// mutable reference is sound while `&mut self` is held.
    pub fn input_context(&mut self) -> &mut InputContext {
        // SAFETY: allocated with InputContext's size and alignment in new().
        unsafe { &mut *self.input_ctx.virt.as_mut_ptr::<InputContext>() }
    }

    /// Ring to use for the given DCI, if it exists.
    pub fn ring_for_dci(&mut self, dci: u8) -> Option<&mut ProducerRing> {
        match dci {
            1 => Some(&mut self.ep0.ring),
            3 => self.interrupt_in.as_mut().map(|tr| &mut tr.ring),
            _ => None,
        }
    }
}
