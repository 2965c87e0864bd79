//! Legacy PCI Configuration Access Mechanism via ports 0xCF8/0xCFC.

use crate::arch::x86_64::instructions::Port;

const CONFIG_ADDRESS: u16 = 0x0CF8;
const CONFIG_DATA: u16 = 0x0CFC;

/// Port-based config space accessor.
pub struct PciCam;

impl PciCam {
    /// Builds the CONFIG_ADDRESS value for a BDF + register offset.
    #[inline]
    fn make_address(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
        (1u32 << 31)
            | (u32::from(bus) << 16)
            | (u32::from(device & 0x1F) << 11)
            | (u32::from(function & 0x07) << 8)
            | (u32::from(offset) & 0xFC)
    }

    /// Reads a 32-bit config register.
    ///
    /// # Safety
    ///
    /// No other config space access may be interleaved between the address
    /// write and the data read.
    pub unsafe fn read_u32(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
        let addr_port = Port::<u32>::new(CONFIG_ADDRESS);
        let data_port = Port::<u32>::new(CONFIG_DATA);
        // SAFETY: the CF8/CFC pair is always present on x86 chipsets.
        unsafe {
            addr_port.write(Self::make_address(bus, device, function, offset));
            data_port.read()
        }
    }

    /// Reads a 16-bit config register.
    ///
    /// # Safety
    ///
    /// As [`read_u32`](Self::read_u32).
    pub unsafe fn read_u16(bus: u8, device: u8, function: u8, offset: u8) -> u16 {
        // SAFETY: forwarded contract.
        let dword = unsafe { Self::read_u32(bus, device, function, offset) };
        let shift = u32::from(offset & 2) * 8;
        (dword >> shift) as u16
    }

    /// Reads an 8-bit config register.
    ///
    /// # Safety
    ///
    /// As [`read_u32`](Self::read_u32).
    pub unsafe fn read_u8(bus: u8, device: u8, function: u8, offset: u8) -> u8 {
        // SAFETY: forwarded contract.
        let dword = unsafe { Self::read_u32(bus, device, function, offset) };
        let shift = u32::from(offset & 3) * 8;
        (dword >> shift) as u8
    }

    /// Writes a 32-bit config register.
    ///
    /// # Safety
    ///
    /// Config writes reach hardware; the caller must own the register.
    pub unsafe fn write_u32(bus: u8, device: u8, function: u8, offset: u8, value: u32) {
        let addr_port = Port::<u32>::new(CONFIG_ADDRESS);
        let data_port = Port::<u32>::new(CONFIG_DATA);
        // SAFETY: forwarded contract.
        unsafe {
            addr_port.write(Self::make_address(bus, device, function, offset));
            data_port.write(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_encoding() {
        let addr = PciCam::make_address(1, 2, 3, 0x10);
        assert_eq!(addr, (1 << 31) | (1 << 16) | (2 << 11) | (3 << 8) | 0x10);
    }

    #[test]
    fn address_masks_unaligned_offset() {
        let addr = PciCam::make_address(0, 0, 0, 0x13);
        assert_eq!(addr & 0xFF, 0x10);
    }
}
