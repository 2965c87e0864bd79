//! PCI Express Enhanced Configuration Access Mechanism (ECAM).
//!
//! ECAM exposes the full 4 KiB configuration space of every function as
//! MMIO at `base + (bus << 20 | device << 15 | function << 12)`. The base
//! comes from the ACPI MCFG table; accesses go through the HHDM.

use crate::addr::{PhysAddr, VirtAddr};
use crate::arch::x86_64::platform;
use crate::mm::hhdm;

/// Computes the ECAM virtual address for a BDF + register offset.
///
/// Returns `None` when no MCFG was found or the bus is out of range.
fn ecam_address(bus: u8, device: u8, function: u8, offset: u8) -> Option<VirtAddr> {
    let info = platform::ecam_info()?;
    if bus < info.start_bus || bus > info.end_bus {
        return None;
    }
    let phys = info.phys_base.as_u64()
        + ((u64::from(bus) << 20)
            | (u64::from(device) << 15)
            | (u64::from(function) << 12)
            | u64::from(offset));
    Some(hhdm::phys_to_virt(PhysAddr::new(phys)))
}

/// Reads a 32-bit config register via ECAM, if available.
pub fn read_u32(bus: u8, device: u8, function: u8, offset: u8) -> Option<u32> {
    let addr = ecam_address(bus, device, function, offset & 0xFC)?;
    // SAFETY: the MCFG-described window is HHDM-reachable.
    Some(unsafe { addr.as_ptr::<u32>().read_volatile() })
}

/// Reads a 16-bit config register via ECAM, if available.
pub fn read_u16(bus: u8, device: u8, function: u8, offset: u8) -> Option<u16> {
    let addr = ecam_address(bus, device, function, offset & 0xFE)?;
    // SAFETY: as in read_u32.
    Some(unsafe { addr.as_ptr::<u16>().read_volatile() })
}

/// Reads an 8-bit config register via ECAM, if available.
pub fn read_u8(bus: u8, device: u8, function: u8, offset: u8) -> Option<u8> {
    let addr = ecam_address(bus, device, function, offset)?;
    // SAFETY: as in read_u32.
    Some(unsafe { addr.as_ptr::<u8>().read_volatile() })
}

/// Writes a 32-bit config register via ECAM. Returns `false` when ECAM is
/// unavailable.
pub fn write_u32(bus: u8, device: u8, function: u8, offset: u8, value: u32) -> bool {
    match ecam_address(bus, device, function, offset & 0xFC) {
        Some(addr) => {
            // SAFETY: as in read_u32.
            unsafe { addr.as_mut_ptr::<u32>().write_volatile(value) };
            true
        }
        None => false,
    }
}
