//! Platform bring-up: ACPI tables, interrupt controllers, and the timer.
//!
//! Runs after the heap is up. Parses the ACPI tables handed over by the
//! boot loader (falling back to a legacy scan), parks the 8259 PIC, maps
//! and enables the LAPIC, configures the I/O APIC with the MADT's
//! interrupt source overrides, calibrates the LAPIC timer against the PIT,
//! and finally enables interrupts.

use core::sync::atomic::{AtomicU64, Ordering};

use helion_acpi::{AcpiHandler, AcpiTables, madt};

use crate::addr::{PhysAddr, VirtAddr};
use crate::arch::x86_64::interrupts::{self, vectors};
use crate::arch::x86_64::ioapic::{IoApic, Polarity, RedirectionEntry, TriggerMode};
use crate::arch::x86_64::lapic::LocalApic;
use crate::arch::x86_64::{instructions, pic, pit};
use crate::mm::{PAGE_SIZE, hhdm, vmm};
use crate::sync::IrqSpinLock;

/// ACPI physical mappings resolve through the HHDM.
struct HhdmAcpiHandler;

// SAFETY: The HHDM covers all physical memory and is initialized before
// ACPI parsing starts.
unsafe impl AcpiHandler for HhdmAcpiHandler {
    unsafe fn map_physical_region(&self, phys: u64, _size: usize) -> *const u8 {
        hhdm::phys_to_virt(PhysAddr::new(phys)).as_ptr()
    }
}

/// ECAM window described by the MCFG.
#[derive(Debug, Clone, Copy)]
pub struct EcamInfo {
    /// Physical base of the ECAM region.
    pub phys_base: PhysAddr,
    /// First decoded bus.
    pub start_bus: u8,
    /// Last decoded bus.
    pub end_bus: u8,
}

/// Interrupt-controller state captured during init.
struct PlatformState {
    /// LAPIC MMIO mapping.
    lapic_base: VirtAddr,
    /// I/O APIC MMIO mapping.
    ioapic_base: VirtAddr,
    /// I/O APIC GSI base.
    gsi_base: u32,
    /// ECAM window, when the firmware provides an MCFG.
    ecam: Option<EcamInfo>,
    /// HPET MMIO base, when present. Recorded for diagnostics; the kernel
    /// clocks off the PIT-calibrated LAPIC timer.
    hpet_base: Option<PhysAddr>,
    /// GSI each ISA IRQ was routed to, after override translation.
    isa_gsi: [u32; 16],
    /// APIC ID of the bootstrap processor (MSI destination).
    bsp_apic_id: u8,
}

static PLATFORM: IrqSpinLock<Option<PlatformState>> = IrqSpinLock::new(None);

/// Timer ticks since the LAPIC timer started (1 ms granularity).
static TIMER_TICKS: AtomicU64 = AtomicU64::new(0);

/// Callbacks run from the timer interrupt, with the current tick count.
type TickCallback = fn(u64);

const MAX_TICK_CALLBACKS: usize = 8;

static TICK_CALLBACKS: IrqSpinLock<[Option<TickCallback>; MAX_TICK_CALLBACKS]> =
    IrqSpinLock::new([None; MAX_TICK_CALLBACKS]);

/// Returns ticks elapsed since the timer started.
pub fn timer_ticks() -> u64 {
    TIMER_TICKS.load(Ordering::Relaxed)
}

/// Registers a callback invoked on every timer tick.
///
/// Returns `false` when the callback table is full.
pub fn register_tick_callback(callback: TickCallback) -> bool {
    let mut table = TICK_CALLBACKS.lock();
    for slot in table.iter_mut() {
        if slot.is_none() {
            *slot = Some(callback);
            return true;
        }
    }
    false
}

/// Sends LAPIC EOI if the LAPIC is up.
///
/// Uses `try_lock`: an EOI from an ISR that interrupted the platform lock
/// holder must not deadlock. Missing one EOI during init is harmless
/// because interrupts are not enabled until init completes.
pub fn send_lapic_eoi() {
    if let Some(guard) = PLATFORM.try_lock() {
        if let Some(state) = guard.as_ref() {
            // SAFETY: the mapping made during init is permanent.
            let lapic = unsafe { LocalApic::new(state.lapic_base) };
            lapic.eoi();
        }
    }
}

/// Runs a closure against the I/O APIC, if initialized.
pub fn with_io_apic<R>(f: impl FnOnce(&IoApic) -> R) -> Option<R> {
    let guard = PLATFORM.lock();
    let state = guard.as_ref()?;
    // SAFETY: the mapping made during init is permanent.
    let ioapic = unsafe { IoApic::new(state.ioapic_base, state.gsi_base) };
    Some(f(&ioapic))
}

/// Returns the ECAM window, when one was discovered.
pub fn ecam_info() -> Option<EcamInfo> {
    PLATFORM.lock().as_ref()?.ecam
}

/// LAPIC timer tick handler.
fn timer_handler(_vector: u8) {
    let tick = TIMER_TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    if let Some(callbacks) = TICK_CALLBACKS.try_lock() {
        for callback in callbacks.iter().flatten() {
            callback(tick);
        }
    }
}

/// Routes ISA IRQs through the I/O APIC, honoring MADT overrides.
///
/// Every line is installed masked; drivers unmask the GSIs they own.
/// Override flags: bits 0-1 polarity (0b11 = active low), bits 2-3 trigger
/// (0b11 = level). Returns the ISA IRQ -> GSI translation that was applied.
fn route_isa_irqs(ioapic: &IoApic, madt_table: &madt::Madt, bsp_apic_id: u8) -> [u32; 16] {
    let entry_count = ioapic.redirection_entry_count();
    let mut isa_gsi = [0u32; 16];

    for irq in 0u8..16 {
        let mut gsi = u32::from(irq);
        let mut polarity = Polarity::ActiveHigh;
        let mut trigger = TriggerMode::Edge;

        for entry in madt_table.entries() {
            if let madt::MadtEntry::InterruptSourceOverride(iso) = entry {
                if iso.source == irq {
                    gsi = iso.gsi;
                    if iso.flags & 0x03 == 0b11 {
                        polarity = Polarity::ActiveLow;
                    }
                    if (iso.flags >> 2) & 0x03 == 0b11 {
                        trigger = TriggerMode::Level;
                    }
                    break;
                }
            }
        }

        isa_gsi[usize::from(irq)] = gsi;
        if gsi >= entry_count {
            continue;
        }

        ioapic.set_entry(
            gsi,
            RedirectionEntry {
                vector: vectors::IRQ_BASE + irq,
                polarity,
                trigger_mode: trigger,
                masked: true,
                destination: bsp_apic_id,
            },
        );
    }

    isa_gsi
}

/// Unmasks the GSI a legacy ISA IRQ was routed to.
pub fn unmask_isa_irq(irq: u8) {
    let gsi = {
        let guard = PLATFORM.lock();
        let Some(state) = guard.as_ref() else { return };
        state.isa_gsi[usize::from(irq) & 0xF]
    };
    with_io_apic(|ioapic| ioapic.unmask(gsi));
}

/// Calibrates the LAPIC timer against the PIT and starts it periodic.
///
/// Divide-by-128 with a 50 ms PIT window keeps the measured delta well
/// inside 32 bits while amortizing PIT quantization error.
fn calibrate_and_start_timer(lapic: &LocalApic) {
    if let Err(e) = interrupts::register_handler(vectors::TIMER, timer_handler) {
        crate::kerr!("timer: vector {} unavailable: {:?}", vectors::TIMER, e);
        return;
    }

    const DIVIDE: u8 = 128;
    const WINDOW_MS: u32 = 50;

    lapic.start_timer_calibration(DIVIDE);
    // SAFETY: nothing else owns the PIT during init.
    unsafe { pit::busy_wait_ms(WINDOW_MS) };
    let elapsed = u32::MAX - lapic.timer_current_count();
    lapic.stop_timer();

    let ticks_per_ms = elapsed / WINDOW_MS;
    if ticks_per_ms == 0 {
        crate::kwarn!("timer: calibration measured zero ticks, timer not started");
        return;
    }

    crate::kinfo!(
        "timer: LAPIC calibrated, {} ticks/ms (divide {})",
        ticks_per_ms,
        DIVIDE
    );
    lapic.start_timer_periodic(vectors::TIMER, ticks_per_ms, DIVIDE);

    // The legacy timer line must not double-fire alongside the LAPIC.
    pic::mask_timer();
}

/// Initializes ACPI, the interrupt controllers, and the timer.
///
/// `rsdp` comes from the boot loader; when absent the legacy EBDA/BIOS
/// areas are scanned.
pub fn init(rsdp: Option<PhysAddr>) {
    let tables = match rsdp {
        Some(addr) => AcpiTables::new(addr.as_u64(), HhdmAcpiHandler),
        None => AcpiTables::scan(HhdmAcpiHandler),
    };
    let tables = match tables {
        Ok(t) => {
            crate::kinfo!(
                "acpi: {} at {:#x}",
                if t.is_xsdt() { "XSDT" } else { "RSDT" },
                t.rsdt_addr()
            );
            t
        }
        Err(e) => {
            crate::kerr!("acpi: RSDP invalid or missing: {:?}", e);
            return;
        }
    };

    let madt_table = match tables.madt() {
        Ok(m) => m,
        Err(e) => {
            crate::kerr!("acpi: no MADT, cannot start the APICs: {:?}", e);
            return;
        }
    };

    let ecam = tables.mcfg().ok().and_then(|mcfg| {
        mcfg.first_entry().map(|entry| EcamInfo {
            phys_base: PhysAddr::new(entry.base_address),
            start_bus: entry.start_bus,
            end_bus: entry.end_bus,
        })
    });
    if let Some(info) = &ecam {
        crate::kdebug!(
            "acpi: ECAM at {} (buses {}..={})",
            info.phys_base,
            info.start_bus,
            info.end_bus
        );
    }

    let hpet_base = tables.hpet().ok().map(|hpet| {
        let base = PhysAddr::new(hpet.base_address.address);
        crate::kdebug!("acpi: HPET at {}", base);
        base
    });

    // Park the legacy PIC before the APICs take over.
    // SAFETY: interrupts are still disabled this early.
    unsafe { pic::remap_and_disable() };

    // LAPIC: map, enable, accept everything.
    let lapic_phys = PhysAddr::new(madt_table.effective_local_apic_address());
    let lapic_base = vmm::map_mmio_region(lapic_phys, PAGE_SIZE as u64);
    // SAFETY: just mapped.
    let lapic = unsafe { LocalApic::new(lapic_base) };
    lapic.enable(vectors::SPURIOUS);
    lapic.accept_all();
    let bsp_apic_id = lapic.id();
    crate::kinfo!(
        "lapic: enabled, id {}, version {:#x}",
        bsp_apic_id,
        lapic.version() & 0xFF
    );

    // I/O APIC: map, mask everything, route the ISA range.
    let mut ioapic_base = VirtAddr::zero();
    let mut gsi_base = 0u32;
    let mut isa_gsi = [0u32; 16];
    for entry in madt_table.entries() {
        if let madt::MadtEntry::IoApic(io) = entry {
            let phys = PhysAddr::new(u64::from(io.io_apic_address));
            let base = vmm::map_mmio_region(phys, PAGE_SIZE as u64);
            // SAFETY: just mapped.
            let ioapic = unsafe { IoApic::new(base, io.gsi_base) };
            let entries = ioapic.redirection_entry_count();
            crate::kdebug!(
                "ioapic: id {}, gsi base {}, {} entries",
                ioapic.id(),
                io.gsi_base,
                entries
            );

            for gsi in io.gsi_base..io.gsi_base + entries {
                ioapic.mask(gsi);
            }
            if io.gsi_base == 0 {
                isa_gsi = route_isa_irqs(&ioapic, &madt_table, bsp_apic_id);
                ioapic_base = base;
                gsi_base = io.gsi_base;
            }
        }
    }

    *PLATFORM.lock() = Some(PlatformState {
        lapic_base,
        ioapic_base,
        gsi_base,
        ecam,
        hpet_base,
        isa_gsi,
        bsp_apic_id,
    });

    calibrate_and_start_timer(&lapic);

    // SAFETY: IDT, LAPIC, and I/O APIC are configured.
    unsafe { instructions::irq::enable() };
    crate::kinfo!("interrupts enabled");
}

/// Returns the recorded HPET base, when the firmware reported one.
pub fn hpet_base() -> Option<PhysAddr> {
    PLATFORM.lock().as_ref()?.hpet_base
}

/// APIC ID of the bootstrap processor, for MSI address programming.
pub fn bsp_apic_id() -> u8 {
    PLATFORM.lock().as_ref().map_or(0, |s| s.bsp_apic_id)
}
