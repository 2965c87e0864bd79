//! PCI bus enumeration.
//!
//! Walks buses, devices, and functions, handling multi-function devices
//! and recursing through PCI-to-PCI bridges.

extern crate alloc;
use alloc::vec::Vec;

use super::regs;

/// Bus/device/function address of a PCI function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    /// Bus number.
    pub bus: u8,
    /// Device slot (0-31).
    pub device: u8,
    /// Function (0-7).
    pub function: u8,
}

/// Identification of an enumerated PCI function.
#[derive(Debug, Clone, Copy)]
pub struct PciDeviceInfo {
    /// The function's address.
    pub address: PciAddress,
    /// Vendor ID.
    pub vendor_id: u16,
    /// Device ID.
    pub device_id: u16,
    /// Class code.
    pub class: u8,
    /// Subclass code.
    pub subclass: u8,
    /// Programming interface.
    pub prog_if: u8,
    /// Header type byte (bit 7 = multi-function).
    pub header_type: u8,
    /// Legacy interrupt line.
    pub interrupt_line: u8,
}

/// Enumerates every reachable PCI function.
pub fn enumerate() -> Vec<PciDeviceInfo> {
    let mut devices = Vec::new();

    // A multi-function host controller exposes one root bus per function.
    let header_type = super::read_u8(0, 0, 0, regs::HEADER_TYPE);
    if header_type & 0x80 == 0 {
        scan_bus(0, &mut devices);
    } else {
        for function in 0..8u8 {
            if super::read_u16(0, 0, function, regs::VENDOR_ID) != 0xFFFF {
                scan_bus(function, &mut devices);
            }
        }
    }

    devices
}

/// Returns the first function matching (class, subclass, prog_if).
pub fn find_by_class(class: u8, subclass: u8, prog_if: u8) -> Option<PciDeviceInfo> {
    enumerate()
        .into_iter()
        .find(|d| d.class == class && d.subclass == subclass && d.prog_if == prog_if)
}

fn scan_bus(bus: u8, devices: &mut Vec<PciDeviceInfo>) {
    for device in 0..32u8 {
        scan_device(bus, device, devices);
    }
}

fn scan_device(bus: u8, device: u8, devices: &mut Vec<PciDeviceInfo>) {
    if super::read_u16(bus, device, 0, regs::VENDOR_ID) == 0xFFFF {
        return;
    }

    let info = read_function(bus, device, 0);
    let multi_function = info.header_type & 0x80 != 0;
    visit(info, devices);

    if multi_function {
        for function in 1..8u8 {
            if super::read_u16(bus, device, function, regs::VENDOR_ID) == 0xFFFF {
                continue;
            }
            visit(read_function(bus, device, function), devices);
        }
    }
}

/// Records a function, recursing through bridges.
fn visit(info: PciDeviceInfo, devices: &mut Vec<PciDeviceInfo>) {
    if info.class == 0x06 && info.subclass == 0x04 {
        let secondary = super::read_u8(
            info.address.bus,
            info.address.device,
            info.address.function,
            regs::SECONDARY_BUS,
        );
        if secondary != 0 {
            scan_bus(secondary, devices);
        }
    }
    devices.push(info);
}

fn read_function(bus: u8, device: u8, function: u8) -> PciDeviceInfo {
    PciDeviceInfo {
        address: PciAddress {
            bus,
            device,
            function,
        },
        vendor_id: super::read_u16(bus, device, function, regs::VENDOR_ID),
        device_id: super::read_u16(bus, device, function, regs::DEVICE_ID),
        class: super::read_u8(bus, device, function, regs::CLASS),
        subclass: super::read_u8(bus, device, function, regs::SUBCLASS),
        prog_if: super::read_u8(bus, device, function, regs::PROG_IF),
        header_type: super::read_u8(bus, device, function, regs::HEADER_TYPE),
        interrupt_line: super::read_u8(bus, device, function, regs::INTERRUPT_LINE),
    }
}
