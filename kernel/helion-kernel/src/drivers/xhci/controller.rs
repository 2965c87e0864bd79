//! xHCI controller: discovery, bring-up, commands, events, transfers.
//!
//! One instance per PCI function with class 0x0C / subclass 0x03 /
//! interface 0x30. The bring-up order follows the xHCI init contract:
//! halt, reset, wait ready; program CONFIG, DCBAAP, the command ring, and
//! the event ring (with its segment table); then run. Connected root hub
//! ports are reset and taken through Enable Slot -> Address Device ->
//! Configure Endpoint, after which transfer submission is open.

extern crate alloc;

use alloc::vec::Vec;

use crate::addr::PhysAddr;
use crate::arch::x86_64::interrupts;
use crate::arch::x86_64::platform;
use crate::initcall::{self, InitStage};
use crate::mm::vmm;
use crate::pci;
use crate::sync::SpinLock;
use core::sync::atomic::{AtomicBool, Ordering};

use super::XhciError;
use super::context::{
    ADD_EP0, ADD_SLOT, EndpointContext, EndpointType, PortSpeed, SlotContext,
};
use super::device::{DeviceSlot, DmaBlock, SlotState, TransferRing};
use super::port::{reset_port, warm_reset_port};
use super::regs::{MmioOps, MmioSpace, cap, iman, op, portsc, rt, usbcmd, usbsts};
use super::ring::{ERDP_EHB, ErstEntry, EventRing, ProducerRing, RING_LEN};
use super::trb::{CompletionCode, Trb, TrbType};

/// Bounded spins while waiting for controller state bits.
const RESET_SPINS: usize = 100_000;

/// Bounded spins while waiting for a command completion event.
const COMMAND_SPINS: usize = 200_000;

/// MMIO window size covering capability, operational, runtime, and
/// doorbell registers.
const MMIO_WINDOW: u64 = 0x1_0000;

/// Intel chipset register routing USB3-capable ports to xHCI.
const USB3_PSSEN: u8 = 0xD0;

/// Intel chipset register routing USB2 ports from EHCI to xHCI.
const XUSB2PR: u8 = 0xD8;

/// Interrupt-IN endpoint DCI used for configured devices (EP1 IN).
const INT_IN_DCI: u8 = 3;

/// Interrupt transfer buffer size (a boot-protocol input report).
const INT_BUF_LEN: usize = 8;

/// Events the controller surfaces to consumers above the core.
#[derive(Debug, Clone, Copy)]
pub enum XhciEvent {
    /// A root hub port changed state; carries the settled PORTSC value.
    PortStatusChange {
        /// 0-based port index.
        port: u8,
        /// Cached PORTSC at event time.
        portsc: u32,
    },
    /// A transfer retired.
    TransferComplete {
        /// Device slot.
        slot: u8,
        /// Endpoint DCI.
        dci: u8,
        /// Completion code.
        code: CompletionCode,
        /// Bytes *not* transferred (residual).
        residual: u32,
    },
    /// A transfer was cancelled via Stop Endpoint.
    TransferCanceled {
        /// Device slot.
        slot: u8,
        /// Endpoint DCI.
        dci: u8,
    },
}

/// Consumer callback for controller events.
pub type EventCallback = fn(&XhciEvent);

/// Registered event consumers (TTY/HID layers above the core).
static EVENT_CALLBACKS: SpinLock<Vec<EventCallback>> = SpinLock::new(Vec::new());

/// Set from the IRQ handler; drained by [`poll_controllers`].
static EVENTS_PENDING: AtomicBool = AtomicBool::new(false);

/// Registers a callback for controller events.
pub fn register_event_callback(callback: EventCallback) {
    EVENT_CALLBACKS.lock().push(callback);
}

fn deliver(event: &XhciEvent) {
    for callback in EVENT_CALLBACKS.lock().iter() {
        callback(event);
    }
}

/// One xHCI host controller.
pub struct XhciController {
    /// Capability register window.
    caps: MmioSpace,
    /// Operational registers (`caps + CAPLENGTH`).
    op_regs: MmioSpace,
    /// Runtime registers (`caps + RTSOFF`).
    rt_regs: MmioSpace,
    /// Doorbell array (`caps + DBOFF`).
    doorbells: MmioSpace,
    /// Number of root hub ports.
    max_ports: u8,
    /// Command ring with its backing memory.
    cmd_ring: ProducerRing,
    _cmd_memory: DmaBlock,
    /// Event ring consumer with its backing memory and segment table.
    event_ring: EventRing,
    _event_memory: DmaBlock,
    _erst: DmaBlock,
    /// DCBAAP array memory; entry 0 reserved for scratchpads (unused).
    dcbaa: DmaBlock,
    /// Device slots indexed by slot ID - 1.
    slots: Vec<Option<DeviceSlot>>,
    /// Cached PORTSC per port.
    port_status: Vec<u32>,
    /// Completion of the most recent command, keyed by TRB pointer.
    last_completion: Option<(u64, u8, CompletionCode)>,
}

impl XhciController {
    /// Brings up the controller found at the given PCI function.
    pub fn init(device: &pci::PciDeviceInfo) -> Result<Self, XhciError> {
        let addr = device.address;
        let bar0 = pci::read_bar0(addr.bus, addr.device, addr.function);
        if bar0 == 0 {
            return Err(XhciError::NotPresent);
        }

        let base = vmm::map_mmio_region(PhysAddr::new(bar0), MMIO_WINDOW);
        pci::enable_mastering(addr.bus, addr.device, addr.function);

        // Route ports over from the companion EHCI on Intel chipsets; the
        // registers do not exist elsewhere and the writes are ignored.
        pci::write_u32(addr.bus, addr.device, addr.function, XUSB2PR, 0xFFFF_FFFF);
        pci::write_u32(addr.bus, addr.device, addr.function, USB3_PSSEN, 0xFFFF_FFFF);

        // SAFETY: the window was just mapped uncached over BAR0.
        let caps = unsafe { MmioSpace::new(base.as_mut_ptr()) };
        let cap_length = caps.read8(cap::CAPLENGTH) as usize;
        let rtsoff = (caps.read32(cap::RTSOFF) & !0x1F) as usize;
        let dboff = (caps.read32(cap::DBOFF) & !0x3) as usize;
        let op_regs = caps.offset(cap_length);
        let rt_regs = caps.offset(rtsoff);
        let doorbells = caps.offset(dboff);

        let hcsparams1 = caps.read32(cap::HCSPARAMS1);
        let max_slots = (hcsparams1 & 0xFF) as u8;
        let max_ports = ((hcsparams1 >> 24) & 0xFF) as u8;
        let version = caps.read32(cap::CAPLENGTH) >> 16;

        crate::kinfo!(
            "xhci: version {:x}.{:02x}, {} slots, {} ports",
            version >> 8,
            version & 0xFF,
            max_slots,
            max_ports
        );

        Self::reset(&op_regs)?;

        // DCBAAP: (MaxSlots + 1) pointers, 64-byte aligned, below 4 GiB.
        let dcbaa = DmaBlock::zeroed((usize::from(max_slots) + 1) * 8, 64)?;

        // Command ring with its terminating link TRB; RCS starts at 1.
        let cmd_memory = DmaBlock::zeroed(RING_LEN * core::mem::size_of::<Trb>(), 64)?;
        // SAFETY: zeroed exclusive DMA memory.
        let cmd_ring = unsafe {
            ProducerRing::new(
                cmd_memory.virt.as_mut_ptr::<Trb>(),
                cmd_memory.phys.as_u64(),
                RING_LEN,
            )
        };

        // Event ring: one segment plus a single-entry ERST.
        let event_memory = DmaBlock::zeroed(RING_LEN * core::mem::size_of::<Trb>(), 64)?;
        // SAFETY: zeroed exclusive DMA memory.
        let event_ring = unsafe {
            EventRing::new(
                event_memory.virt.as_mut_ptr::<Trb>(),
                event_memory.phys.as_u64(),
                RING_LEN,
            )
        };
        let erst = DmaBlock::zeroed(core::mem::size_of::<ErstEntry>(), 64)?;
        // SAFETY: the block was sized for one ErstEntry.
        unsafe {
            erst.virt
                .as_mut_ptr::<ErstEntry>()
                .write(ErstEntry::new(event_memory.phys.as_u64(), RING_LEN as u32));
        }

        // Program the controller: slots, DCBAAP, command ring, interrupter.
        op_regs.write32(op::CONFIG, u32::from(max_slots));
        op_regs.write64(op::DCBAAP, dcbaa.phys.as_u64());
        op_regs.write64(op::CRCR, cmd_memory.phys.as_u64() | 1); // RCS = 1

        rt_regs.write32(rt::ERSTSZ, 1);
        rt_regs.write64(rt::ERSTBA, erst.phys.as_u64());
        rt_regs.write64(rt::ERDP, event_memory.phys.as_u64() | ERDP_EHB);
        rt_regs.write32(rt::IMOD, 0);
        rt_regs.write32(rt::IMAN, iman::IE);

        // Run with interrupts enabled, then wait until the controller
        // reports itself live.
        let cmd = op_regs.read32(op::USBCMD);
        op_regs.write32(op::USBCMD, cmd | usbcmd::RUN | usbcmd::INTE);
        let mut live = false;
        for _ in 0..RESET_SPINS {
            let sts = op_regs.read32(op::USBSTS);
            if sts & (usbsts::HCH | usbsts::CNR) == 0 {
                live = true;
                break;
            }
            core::hint::spin_loop();
        }
        if !live {
            return Err(XhciError::MmioTimeout);
        }

        let mut controller = Self {
            caps,
            op_regs,
            rt_regs,
            doorbells,
            max_ports,
            cmd_ring,
            _cmd_memory: cmd_memory,
            event_ring,
            _event_memory: event_memory,
            _erst: erst,
            dcbaa,
            slots: (0..usize::from(max_slots)).map(|_| None).collect(),
            port_status: alloc::vec![0; usize::from(max_ports)],
            last_completion: None,
        };

        controller.request_irq(device);
        controller.power_ports();
        controller.scan_ports();

        Ok(controller)
    }

    /// Controller reset: halt, HCRST, wait for ready.
    fn reset(op_regs: &MmioSpace) -> Result<(), XhciError> {
        // 1. Halt.
        let cmd = op_regs.read32(op::USBCMD);
        op_regs.write32(op::USBCMD, cmd & !usbcmd::RUN);
        spin_until(|| op_regs.read32(op::USBSTS) & usbsts::HCH != 0)?;

        // 2. Reset; the bit self-clears.
        let cmd = op_regs.read32(op::USBCMD);
        op_regs.write32(op::USBCMD, cmd | usbcmd::HCRST);
        spin_until(|| op_regs.read32(op::USBCMD) & usbcmd::HCRST == 0)?;

        // 3. Wait until register accesses are allowed again.
        spin_until(|| op_regs.read32(op::USBSTS) & usbsts::CNR == 0)?;
        Ok(())
    }

    /// Requests an interrupt vector: MSI-X, then MSI, then legacy INTx.
    fn request_irq(&self, device: &pci::PciDeviceInfo) {
        let Ok(vector) = interrupts::allocate_msi_vector() else {
            crate::kwarn!("xhci: no free MSI vectors, running polled");
            return;
        };
        if let Err(e) = interrupts::register_handler(vector, irq_handler) {
            crate::kwarn!("xhci: vector {} unusable: {:?}", vector, e);
            return;
        }

        let addr = device.address;
        if pci_msi::enable_msix(addr, &self.caps, vector)
            || pci_msi::enable_msi(addr, vector)
        {
            crate::kinfo!("xhci: message-signaled interrupts on vector {}", vector);
        } else if device.interrupt_line < 16 {
            // Legacy INTx: route the reported line through the I/O APIC.
            if let Err(e) = interrupts::register_handler(
                interrupts::vectors::IRQ_BASE + device.interrupt_line,
                irq_handler,
            ) {
                crate::kdebug!("xhci: INTx line shared: {:?}", e);
            }
            platform::unmask_isa_irq(device.interrupt_line);
            crate::kinfo!("xhci: legacy INTx on line {}", device.interrupt_line);
        } else {
            crate::kwarn!("xhci: no usable interrupt, running polled");
        }
    }

    /// Powers every root hub port.
    fn power_ports(&self) {
        for port in 0..usize::from(self.max_ports) {
            let raw = self.op_regs.read32(op::portsc(port));
            self.op_regs
                .write32(op::portsc(port), portsc::rmw(raw) | portsc::PP);
        }
    }

    /// Resets connected ports and enumerates the devices behind them.
    fn scan_ports(&mut self) {
        for port in 0..usize::from(self.max_ports) {
            let raw = self.op_regs.read32(op::portsc(port));
            self.port_status[port] = raw;
            if raw & portsc::CCS == 0 {
                continue;
            }
            if let Err(e) = self.bring_up_port(port) {
                crate::kwarn!("xhci: port {} bring-up failed: {:?}", port + 1, e);
            }
        }
    }

    /// Resets one port (one warm-reset retry) and runs the slot state
    /// machine for the attached device.
    fn bring_up_port(&mut self, port: usize) -> Result<(), XhciError> {
        let settled = match reset_port(&self.op_regs, port) {
            Ok(settled) => settled,
            Err(_) => {
                // Transient failure: one warm reset attempt, then give up.
                warm_reset_port(&self.op_regs, port)?
            }
        };
        self.port_status[port] = settled;
        deliver(&XhciEvent::PortStatusChange {
            port: port as u8,
            portsc: settled,
        });

        if settled & portsc::CCS == 0 {
            // The device vanished during reset.
            return Ok(());
        }

        let speed = PortSpeed::from_portsc(portsc::speed(settled));
        let slot_id = self.enable_slot()?;
        let mut slot = DeviceSlot::new(slot_id, (port + 1) as u8, speed)?;

        // Wire the output context into DCBAAP before addressing.
        self.set_dcbaa_entry(slot_id, slot.device_ctx.phys.as_u64());

        self.address_device(&mut slot)?;
        self.configure_interrupt_endpoint(&mut slot)?;
        self.arm_interrupt_endpoint(&mut slot)?;

        crate::kinfo!(
            "xhci: port {} -> slot {} ({:?}, {:?})",
            port + 1,
            slot_id,
            speed,
            slot.state
        );
        self.slots[usize::from(slot_id) - 1] = Some(slot);
        Ok(())
    }

    fn set_dcbaa_entry(&mut self, slot_id: u8, device_ctx_phys: u64) {
        // SAFETY: the DCBAAP block holds max_slots + 1 entries and
        // slot_id <= max_slots.
        unsafe {
            self.dcbaa
                .virt
                .as_mut_ptr::<u64>()
                .add(usize::from(slot_id))
                .write_volatile(device_ctx_phys);
        }
    }

    /// Rings a doorbell: 0 for the command ring, otherwise a slot ID with
    /// the target endpoint DCI.
    fn ring_doorbell(&self, slot: u8, target: u8) {
        self.doorbells
            .write32(usize::from(slot) * 4, u32::from(target));
    }

    // --- Command machinery ---------------------------------------------

    /// Submits a command TRB and spins for its completion event.
    fn submit_command(&mut self, trb: Trb) -> Result<(u8, CompletionCode), XhciError> {
        let trb_phys = self.cmd_ring.enqueue(trb).ok_or(XhciError::RingFull)?;
        self.ring_doorbell(0, 0);

        for _ in 0..COMMAND_SPINS {
            self.drain_events();
            if let Some((phys, slot, code)) = self.last_completion {
                if phys == trb_phys {
                    self.last_completion = None;
                    return Ok((slot, code));
                }
            }
            core::hint::spin_loop();
        }

        crate::kerr!("xhci: command timeout (TRB at {:#x})", trb_phys);
        Err(XhciError::MmioTimeout)
    }

    /// Enable Slot: returns the assigned slot ID.
    fn enable_slot(&mut self) -> Result<u8, XhciError> {
        let (slot, code) = self.submit_command(Trb::enable_slot())?;
        if code != CompletionCode::Success {
            return Err(XhciError::CommandFailed(code));
        }
        if slot == 0 || usize::from(slot) > self.slots.len() {
            return Err(XhciError::NoSlot);
        }
        Ok(slot)
    }

    /// Address Device: input context carries slot + EP0.
    fn address_device(&mut self, slot: &mut DeviceSlot) -> Result<(), XhciError> {
        let (ep0_dequeue, dcs) = (slot.ep0.ring.phys_base(), true);
        let slot_id = slot.slot_id;
        let root_port = slot.root_port;
        let speed = slot.speed;
        let input_phys = slot.input_ctx.phys.as_u64();

        let input = slot.input_context();
        *input = super::context::InputContext::zeroed();
        input.control.set_add_flags(ADD_SLOT | ADD_EP0);
        input.slot = SlotContext::new(0, speed, root_port, 1);
        input.endpoints[0] = EndpointContext::new(
            EndpointType::Control,
            speed.ep0_max_packet(),
            ep0_dequeue,
            dcs,
            0,
        );

        let (_, code) = self.submit_command(Trb::address_device(input_phys, slot_id))?;
        if code != CompletionCode::Success {
            return Err(XhciError::CommandFailed(code));
        }
        slot.state = SlotState::Addressed;
        Ok(())
    }

    /// Configure Endpoint: adds the interrupt IN endpoint (DCI 3).
    fn configure_interrupt_endpoint(&mut self, slot: &mut DeviceSlot) -> Result<(), XhciError> {
        let ring = TransferRing::new()?;
        let ring_phys = ring.ring.phys_base();
        let slot_id = slot.slot_id;
        let root_port = slot.root_port;
        let speed = slot.speed;
        let input_phys = slot.input_ctx.phys.as_u64();

        let input = slot.input_context();
        *input = super::context::InputContext::zeroed();
        input.control.set_add_flags(ADD_SLOT);
        input.slot = SlotContext::new(0, speed, root_port, INT_IN_DCI);
        input.set_endpoint(
            INT_IN_DCI,
            EndpointContext::new(EndpointType::InterruptIn, 8, ring_phys, true, 4),
        );

        let (_, code) = self.submit_command(Trb::configure_endpoint(input_phys, slot_id))?;
        if code != CompletionCode::Success {
            return Err(XhciError::CommandFailed(code));
        }
        slot.interrupt_in = Some(ring);
        slot.state = SlotState::Configured;
        Ok(())
    }

    /// Queues an interrupt IN transfer so the device has somewhere to
    /// report into.
    fn arm_interrupt_endpoint(&mut self, slot: &mut DeviceSlot) -> Result<(), XhciError> {
        if slot.interrupt_buf.is_none() {
            slot.interrupt_buf = Some(DmaBlock::zeroed(INT_BUF_LEN, 64)?);
        }
        let buf_phys = slot.interrupt_buf.as_ref().map(|b| b.phys.as_u64());
        let slot_id = slot.slot_id;

        let Some(ring) = slot.ring_for_dci(INT_IN_DCI) else {
            return Ok(());
        };
        let Some(buf_phys) = buf_phys else {
            return Ok(());
        };
        ring.enqueue(Trb::normal(buf_phys, INT_BUF_LEN as u32))
            .ok_or(XhciError::RingFull)?;
        self.ring_doorbell(slot_id, INT_IN_DCI);
        Ok(())
    }

    /// Disable Slot: returns the device to `Default` and releases its
    /// DCBAAP entry.
    pub fn disable_slot(&mut self, slot_id: u8) -> Result<(), XhciError> {
        let (_, code) = self.submit_command(Trb::disable_slot(slot_id))?;
        if code != CompletionCode::Success {
            return Err(XhciError::CommandFailed(code));
        }
        self.set_dcbaa_entry(slot_id, 0);
        self.slots[usize::from(slot_id) - 1] = None;
        Ok(())
    }

    // --- Transfers ------------------------------------------------------

    /// Submits a control transfer on EP0: setup, optional data, status.
    ///
    /// `setup` is the 8-byte setup packet; bit 7 of byte 0 selects the
    /// data direction. The status stage always runs opposite to the data
    /// stage and carries IOC.
    pub fn submit_control(
        &mut self,
        slot_id: u8,
        setup: [u8; 8],
        data: Option<(u64, u32)>,
    ) -> Result<(), XhciError> {
        let dir_in = setup[0] & 0x80 != 0;
        let trt = match data {
            None => super::trb::TRT_NO_DATA,
            Some(_) if dir_in => super::trb::TRT_IN_DATA,
            Some(_) => super::trb::TRT_OUT_DATA,
        };

        let slot = self
            .slots
            .get_mut(usize::from(slot_id) - 1)
            .and_then(Option::as_mut)
            .ok_or(XhciError::NoSlot)?;
        let ring = &mut slot.ep0.ring;

        ring.enqueue(Trb::setup_stage(setup, trt))
            .ok_or(XhciError::RingFull)?;
        if let Some((buffer_phys, length)) = data {
            ring.enqueue(Trb::data_stage(buffer_phys, length, dir_in))
                .ok_or(XhciError::RingFull)?;
        }
        // Status runs opposite to the data stage; with no data stage it is
        // always IN.
        let status_in = data.is_none() || !dir_in;
        ring.enqueue(Trb::status_stage(status_in))
            .ok_or(XhciError::RingFull)?;

        self.ring_doorbell(slot_id, 1);
        Ok(())
    }

    /// Submits an interrupt/bulk transfer: one normal TRB with IOC.
    pub fn submit_normal(
        &mut self,
        slot_id: u8,
        dci: u8,
        buffer_phys: u64,
        length: u32,
    ) -> Result<(), XhciError> {
        let slot = self
            .slots
            .get_mut(usize::from(slot_id) - 1)
            .and_then(Option::as_mut)
            .ok_or(XhciError::NoSlot)?;
        let ring = slot.ring_for_dci(dci).ok_or(XhciError::NoSlot)?;
        ring.enqueue(Trb::normal(buffer_phys, length))
            .ok_or(XhciError::RingFull)?;
        self.ring_doorbell(slot_id, dci);
        Ok(())
    }

    /// Cancels outstanding transfers on an endpoint: Stop Endpoint, then
    /// Set TR Dequeue Pointer to the producer's current position.
    pub fn cancel_transfers(&mut self, slot_id: u8, dci: u8) -> Result<(), XhciError> {
        let (_, code) = self.submit_command(Trb::stop_endpoint(slot_id, dci))?;
        if code != CompletionCode::Success && code != CompletionCode::Stopped {
            return Err(XhciError::CommandFailed(code));
        }

        let slot = self
            .slots
            .get_mut(usize::from(slot_id) - 1)
            .and_then(Option::as_mut)
            .ok_or(XhciError::NoSlot)?;
        let Some(ring) = slot.ring_for_dci(dci) else {
            return Err(XhciError::NoSlot);
        };
        let (dequeue, dcs) = ring.dequeue_pointer();
        ring.clear_pending();

        let (_, code) = self.submit_command(Trb::set_tr_dequeue(dequeue, dcs, slot_id, dci))?;
        if code != CompletionCode::Success {
            return Err(XhciError::CommandFailed(code));
        }

        deliver(&XhciEvent::TransferCanceled {
            slot: slot_id,
            dci,
        });
        Ok(())
    }

    // --- Event processing ----------------------------------------------

    /// Consumes every event the controller has produced, then writes the
    /// dequeue pointer back with the event-handler-busy clear bit.
    pub fn drain_events(&mut self) {
        let mut consumed = false;

        while let Some(event) = self.event_ring.dequeue() {
            consumed = true;
            match event.trb_type() {
                Some(TrbType::CommandCompletionEvent) => {
                    self.cmd_ring.retire();
                    self.last_completion =
                        Some((event.parameter, event.slot_id(), event.completion_code()));
                }
                Some(TrbType::TransferEvent) => {
                    let code = event.completion_code();
                    let slot = event.slot_id();
                    let dci = event.endpoint_id();
                    if !code.is_transfer_success() {
                        crate::kwarn!(
                            "xhci: transfer failed, slot {} dci {}: {:?}",
                            slot,
                            dci,
                            code
                        );
                    }
                    deliver(&XhciEvent::TransferComplete {
                        slot,
                        dci,
                        code,
                        residual: event.transfer_length(),
                    });
                    // Interrupt endpoints stay armed.
                    if dci == INT_IN_DCI {
                        self.rearm_interrupt(slot);
                    }
                }
                Some(TrbType::PortStatusChangeEvent) => {
                    let port = usize::from(event.port_id().saturating_sub(1));
                    if port < self.port_status.len() {
                        let raw = self.op_regs.read32(op::portsc(port));
                        self.port_status[port] = raw;
                        deliver(&XhciEvent::PortStatusChange {
                            port: port as u8,
                            portsc: raw,
                        });
                    }
                }
                Some(TrbType::HostControllerEvent) => {
                    crate::kwarn!(
                        "xhci: host controller event, code {:?}",
                        event.completion_code()
                    );
                }
                Some(TrbType::MfindexWrapEvent) => {}
                other => {
                    crate::kdebug!("xhci: unhandled event type {:?}", other);
                }
            }
        }

        if consumed {
            self.rt_regs
                .write64(rt::ERDP, self.event_ring.dequeue_phys() | ERDP_EHB);
        }
    }

    fn rearm_interrupt(&mut self, slot_id: u8) {
        let Some(slot) = self
            .slots
            .get_mut(usize::from(slot_id).wrapping_sub(1))
            .and_then(Option::as_mut)
        else {
            return;
        };
        let buf_phys = slot.interrupt_buf.as_ref().map(|b| b.phys.as_u64());
        let Some(buf_phys) = buf_phys else { return };
        if let Some(ring) = slot.ring_for_dci(INT_IN_DCI) {
            ring.retire();
            if ring.enqueue(Trb::normal(buf_phys, INT_BUF_LEN as u32)).is_some() {
                // Direct doorbell write: `ring` still borrows the slot
                // table, but the doorbell window is a separate field.
                self.doorbells
                    .write32(usize::from(slot_id) * 4, u32::from(INT_IN_DCI));
            }
        }
    }

    /// Acknowledges the interrupter (IMAN.IP is RW1C) and the status bit.
    fn ack_interrupt(&self) {
        let sts = self.op_regs.read32(op::USBSTS);
        if sts & usbsts::EINT != 0 {
            self.op_regs.write32(op::USBSTS, usbsts::EINT);
        }
        let im = self.rt_regs.read32(rt::IMAN);
        if im & iman::IP != 0 {
            self.rt_regs.write32(rt::IMAN, im);
        }
    }
}

/// Spins until `cond` holds, bounded by [`RESET_SPINS`].
fn spin_until(cond: impl Fn() -> bool) -> Result<(), XhciError> {
    for _ in 0..RESET_SPINS {
        if cond() {
            return Ok(());
        }
        core::hint::spin_loop();
    }
    Err(XhciError::MmioTimeout)
}

// ---------------------------------------------------------------------------
// MSI / MSI-X programming
// ---------------------------------------------------------------------------

mod pci_msi {
    //! Just enough PCI capability walking to land controller interrupts
    //! on a kernel-allocated vector.

    use super::MmioOps;
    use crate::arch::x86_64::platform;
    use crate::pci::{self, PciAddress, regs};

    /// Capability IDs.
    const CAP_MSI: u8 = 0x05;
    const CAP_MSIX: u8 = 0x11;

    /// MSI address: fixed delivery to one LAPIC.
    fn message_address() -> u32 {
        0xFEE0_0000 | (u32::from(platform::bsp_apic_id()) << 12)
    }

    /// Finds a capability by ID, returning its config-space offset.
    fn find_capability(addr: PciAddress, id: u8) -> Option<u8> {
        let mut offset = pci::read_u8(addr.bus, addr.device, addr.function, regs::CAPABILITIES_PTR);
        // Bounded walk; a looping capability list is firmware damage.
        for _ in 0..32 {
            if offset == 0 {
                return None;
            }
            let cap_id = pci::read_u8(addr.bus, addr.device, addr.function, offset);
            if cap_id == id {
                return Some(offset);
            }
            offset = pci::read_u8(addr.bus, addr.device, addr.function, offset + 1);
        }
        None
    }

    /// Enables MSI-X with entry 0 -> `vector`. Returns `false` when the
    /// capability is absent or the table lives outside BAR0.
    pub fn enable_msix(addr: PciAddress, bar0_window: &impl MmioOps, vector: u8) -> bool {
        let Some(cap) = find_capability(addr, CAP_MSIX) else {
            return false;
        };

        let table_desc = pci::read_u32(addr.bus, addr.device, addr.function, cap + 4);
        let bir = table_desc & 0x7;
        if bir != 0 {
            // The table sits in a BAR this driver has not mapped.
            return false;
        }
        let table_offset = (table_desc & !0x7) as usize;

        // Entry 0: address, data, unmasked control word.
        bar0_window.write32(table_offset, message_address());
        bar0_window.write32(table_offset + 4, 0);
        bar0_window.write32(table_offset + 8, u32::from(vector));
        bar0_window.write32(table_offset + 12, 0);

        // Message control: enable (bit 15), function mask off (bit 14).
        let control = pci::read_u16(addr.bus, addr.device, addr.function, cap + 2);
        pci::write_u16(
            addr.bus,
            addr.device,
            addr.function,
            cap + 2,
            (control | 0x8000) & !0x4000,
        );
        true
    }

    /// Enables plain MSI with `vector`. Returns `false` when absent.
    pub fn enable_msi(addr: PciAddress, vector: u8) -> bool {
        let Some(cap) = find_capability(addr, CAP_MSI) else {
            return false;
        };

        let control = pci::read_u16(addr.bus, addr.device, addr.function, cap + 2);
        let is_64bit = control & (1 << 7) != 0;

        pci::write_u32(addr.bus, addr.device, addr.function, cap + 4, message_address());
        if is_64bit {
            pci::write_u32(addr.bus, addr.device, addr.function, cap + 8, 0);
            pci::write_u16(addr.bus, addr.device, addr.function, cap + 12, u16::from(vector));
        } else {
            pci::write_u16(addr.bus, addr.device, addr.function, cap + 8, u16::from(vector));
        }

        // Enable, single message.
        pci::write_u16(
            addr.bus,
            addr.device,
            addr.function,
            cap + 2,
            (control & !0x70) | 0x1,
        );
        true
    }
}

// ---------------------------------------------------------------------------
// Controller registry and the probe initcall
// ---------------------------------------------------------------------------

/// All brought-up controllers.
static CONTROLLERS: SpinLock<Vec<XhciController>> = SpinLock::new(Vec::new());

/// IRQ handler: note the event and return; the idle loop drains rings
/// outside interrupt context.
fn irq_handler(_vector: u8) {
    EVENTS_PENDING.store(true, Ordering::Release);
    if let Some(controllers) = CONTROLLERS.try_lock() {
        for controller in controllers.iter() {
            controller.ack_interrupt();
        }
    }
}

/// PCI scan for xHCI functions: class 0x0C, subclass 0x03, interface
/// 0x30.
fn probe() -> i32 {
    let Some(device) = pci::find_by_class(0x0C, 0x03, 0x30) else {
        crate::kinfo!("xhci: no controller found");
        return 0;
    };
    crate::kinfo!(
        "xhci: controller at {:02x}:{:02x}.{} ({:04x}:{:04x})",
        device.address.bus,
        device.address.device,
        device.address.function,
        device.vendor_id,
        device.device_id
    );

    match XhciController::init(&device) {
        Ok(controller) => {
            CONTROLLERS.lock().push(controller);
            0
        }
        Err(e) => {
            crate::kerr!("xhci: init failed: {:?}", e);
            -1
        }
    }
}

/// Registers the xHCI probe at the Driver init stage.
pub fn register_probe() {
    initcall::register(InitStage::Driver, probe, "xhci-probe");
}

/// Drains controller event rings. Called from the idle loop and after
/// the IRQ handler flags pending work.
pub fn poll_controllers() {
    // Clear first: events arriving mid-drain re-set the flag.
    EVENTS_PENDING.swap(false, Ordering::AcqRel);
    let mut controllers = CONTROLLERS.lock();
    for controller in controllers.iter_mut() {
        controller.drain_events();
    }
}
