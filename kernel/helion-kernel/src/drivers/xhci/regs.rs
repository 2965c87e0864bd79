//! xHCI register layout and fenced MMIO access.
//!
//! All register access goes through [`MmioOps`], whose hardware
//! implementation ([`MmioSpace`]) brackets every volatile access with a
//! full fence per the controller's ordering contract. Tests substitute a
//! buffer-backed implementation to model register side effects.

use crate::arch::x86_64::instructions::mfence;

/// Capability register offsets (from the capability base).
pub mod cap {
    /// Operational register offset (u8).
    pub const CAPLENGTH: usize = 0x00;
    /// Interface version (u16 at 0x02, read via the first dword).
    pub const HCIVERSION: usize = 0x02;
    /// Structural parameters 1: slots, interrupters, ports.
    pub const HCSPARAMS1: usize = 0x04;
    /// Structural parameters 2.
    pub const HCSPARAMS2: usize = 0x08;
    /// Structural parameters 3.
    pub const HCSPARAMS3: usize = 0x0C;
    /// Capability parameters 1 (bit 2: CSZ, 64-byte contexts).
    pub const HCCPARAMS1: usize = 0x10;
    /// Doorbell array offset.
    pub const DBOFF: usize = 0x14;
    /// Runtime register space offset.
    pub const RTSOFF: usize = 0x18;
    /// Capability parameters 2.
    pub const HCCPARAMS2: usize = 0x1C;
}

/// Operational register offsets (from the operational base).
pub mod op {
    /// USB command.
    pub const USBCMD: usize = 0x00;
    /// USB status.
    pub const USBSTS: usize = 0x04;
    /// Page size.
    pub const PAGESIZE: usize = 0x08;
    /// Command ring control (64-bit).
    pub const CRCR: usize = 0x18;
    /// Device context base address array pointer (64-bit).
    pub const DCBAAP: usize = 0x30;
    /// Configure: number of enabled slots.
    pub const CONFIG: usize = 0x38;
    /// First port register set; each port occupies 0x10 bytes.
    pub const PORTSC_BASE: usize = 0x400;
    /// Stride between port register sets.
    pub const PORTSC_STRIDE: usize = 0x10;

    /// PORTSC offset for a 0-based port index.
    pub const fn portsc(port: usize) -> usize {
        PORTSC_BASE + port * PORTSC_STRIDE
    }
}

/// Runtime register offsets (from the runtime base), interrupter 0.
pub mod rt {
    /// Interrupter management (IE bit 1, IP bit 0).
    pub const IMAN: usize = 0x20;
    /// Interrupter moderation.
    pub const IMOD: usize = 0x24;
    /// Event ring segment table size.
    pub const ERSTSZ: usize = 0x28;
    /// Event ring segment table base (64-bit).
    pub const ERSTBA: usize = 0x30;
    /// Event ring dequeue pointer (64-bit).
    pub const ERDP: usize = 0x38;
}

/// `USBCMD` bits.
pub mod usbcmd {
    /// Run/stop.
    pub const RUN: u32 = 1 << 0;
    /// Host controller reset; self-clearing.
    pub const HCRST: u32 = 1 << 1;
    /// Interrupter enable.
    pub const INTE: u32 = 1 << 2;
}

/// `USBSTS` bits.
pub mod usbsts {
    /// Host controller halted.
    pub const HCH: u32 = 1 << 0;
    /// Event interrupt pending.
    pub const EINT: u32 = 1 << 3;
    /// Port change detect.
    pub const PCD: u32 = 1 << 4;
    /// Controller not ready.
    pub const CNR: u32 = 1 << 11;
}

/// `IMAN` bits.
pub mod iman {
    /// Interrupt pending (RW1C).
    pub const IP: u32 = 1 << 0;
    /// Interrupt enable.
    pub const IE: u32 = 1 << 1;
}

/// `PORTSC` bits.
pub mod portsc {
    /// Current connect status (RO).
    pub const CCS: u32 = 1 << 0;
    /// Port enabled (RW1C: writing 1 disables the port).
    pub const PED: u32 = 1 << 1;
    /// Port reset; self-clearing.
    pub const PR: u32 = 1 << 4;
    /// Port power.
    pub const PP: u32 = 1 << 9;
    /// Port speed field shift (bits 10..13).
    pub const SPEED_SHIFT: u32 = 10;
    /// Connect status change (RW1C).
    pub const CSC: u32 = 1 << 17;
    /// Port enable change (RW1C).
    pub const PEC: u32 = 1 << 18;
    /// Warm reset change (RW1C).
    pub const WRC: u32 = 1 << 19;
    /// Over-current change (RW1C).
    pub const OCC: u32 = 1 << 20;
    /// Port reset change (RW1C).
    pub const PRC: u32 = 1 << 21;
    /// Port link state change (RW1C).
    pub const PLC: u32 = 1 << 22;
    /// Config error change (RW1C).
    pub const CEC: u32 = 1 << 23;
    /// Warm port reset (USB3).
    pub const WPR: u32 = 1 << 31;

    /// Bits that must not be written back as-is on read-modify-write:
    /// writing 1 to an RW1C change bit clears it, and writing 1 to PED
    /// disables the port.
    pub const RW1C: u32 = PED | CSC | PEC | WRC | OCC | PRC | PLC | CEC;

    /// Masks a PORTSC value for RMW so reserved and RW1C bits read back
    /// as zero writes.
    pub const fn rmw(raw: u32) -> u32 {
        raw & !RW1C
    }

    /// Extracts the port speed ID.
    pub const fn speed(raw: u32) -> u8 {
        ((raw >> SPEED_SHIFT) & 0xF) as u8
    }
}

/// Register-level access to one MMIO window.
///
/// Capability registers are read-only; operational/runtime are read-write.
/// Implementations must make reads and writes visible in program order as
/// seen by the device.
pub trait MmioOps {
    /// Reads a 32-bit register.
    fn read32(&self, offset: usize) -> u32;

    /// Writes a 32-bit register.
    fn write32(&self, offset: usize, value: u32);

    /// Reads a 64-bit register as two dwords, low first.
    fn read64(&self, offset: usize) -> u64 {
        u64::from(self.read32(offset)) | (u64::from(self.read32(offset + 4)) << 32)
    }

    /// Writes a 64-bit register as two dwords, low first.
    fn write64(&self, offset: usize, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }

    /// Reads an 8-bit register.
    fn read8(&self, offset: usize) -> u8 {
        (self.read32(offset & !3) >> ((offset & 3) * 8)) as u8
    }
}

/// The hardware MMIO window: fenced volatile access at a virtual base.
#[derive(Debug, Clone, Copy)]
pub struct MmioSpace {
    base: *mut u8,
}

// SAFETY: Accesses are volatile and fenced; the window is device memory.
unsafe impl Send for MmioSpace {}
unsafe impl Sync for MmioSpace {}

impl MmioSpace {
    /// Creates an MMIO window.
    ///
    /// # Safety
    ///
    /// `base` must be an uncached mapping of the device's register space,
    /// valid for every offset this window is used with.
    pub unsafe fn new(base: *mut u8) -> Self {
        Self { base }
    }

    /// Returns a window displaced by `offset` bytes.
    pub fn offset(&self, offset: usize) -> Self {
        // SAFETY: the constructor contract covers all used offsets.
        Self {
            base: unsafe { self.base.add(offset) },
        }
    }
}

impl MmioOps for MmioSpace {
    fn read32(&self, offset: usize) -> u32 {
        mfence();
        // SAFETY: the constructor contract covers this offset.
        let value = unsafe { self.base.add(offset).cast::<u32>().read_volatile() };
        mfence();
        value
    }

    fn write32(&self, offset: usize, value: u32) {
        mfence();
        // SAFETY: the constructor contract covers this offset.
        unsafe { self.base.add(offset).cast::<u32>().write_volatile(value) };
        mfence();
    }

    fn read64(&self, offset: usize) -> u64 {
        mfence();
        // SAFETY: the constructor contract covers this offset; xHCI 64-bit
        // registers permit a single aligned 64-bit access.
        let value = unsafe { self.base.add(offset).cast::<u64>().read_volatile() };
        mfence();
        value
    }

    fn write64(&self, offset: usize, value: u64) {
        mfence();
        // SAFETY: as in read64.
        unsafe { self.base.add(offset).cast::<u64>().write_volatile(value) };
        mfence();
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! A register file backed by plain memory, with optional side-effect
    //! hooks, for host tests.

    use super::MmioOps;
    use std::cell::RefCell;

    /// Buffer-backed register space. A hook observes every read and may
    /// mutate the register file, modeling self-clearing hardware bits.
    pub struct FakeRegs {
        pub regs: RefCell<Vec<u32>>,
        pub read_hook: Option<fn(&mut Vec<u32>, usize, u32)>,
    }

    impl FakeRegs {
        pub fn new(dwords: usize) -> Self {
            Self {
                regs: RefCell::new(vec![0u32; dwords]),
                read_hook: None,
            }
        }

        pub fn set(&self, offset: usize, value: u32) {
            self.regs.borrow_mut()[offset / 4] = value;
        }

        pub fn get(&self, offset: usize) -> u32 {
            self.regs.borrow()[offset / 4]
        }
    }

    impl MmioOps for FakeRegs {
        fn read32(&self, offset: usize) -> u32 {
            let value = self.regs.borrow()[offset / 4];
            if let Some(hook) = self.read_hook {
                hook(&mut self.regs.borrow_mut(), offset, value);
            }
            value
        }

        fn write32(&self, offset: usize, value: u32) {
            self.regs.borrow_mut()[offset / 4] = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testutil::FakeRegs;

    #[test]
    fn portsc_rmw_strips_rw1c_bits() {
        let raw = portsc::CCS | portsc::PP | portsc::CSC | portsc::PRC | portsc::PED;
        let masked = portsc::rmw(raw);
        assert_eq!(masked, portsc::CCS | portsc::PP);
    }

    #[test]
    fn portsc_speed_extraction() {
        let raw = 3 << portsc::SPEED_SHIFT;
        assert_eq!(portsc::speed(raw), 3);
    }

    #[test]
    fn default_read64_combines_dwords() {
        let regs = FakeRegs::new(16);
        regs.set(0x18, 0xDEAD_BEEF);
        regs.set(0x1C, 0x1234);
        assert_eq!(regs.read64(0x18), 0x1234_DEAD_BEEF);
    }

    #[test]
    fn default_write64_splits_dwords() {
        let regs = FakeRegs::new(16);
        regs.write64(0x30, 0xABCD_0000_1111_2222);
        assert_eq!(regs.get(0x30), 0x1111_2222);
        assert_eq!(regs.get(0x34), 0xABCD_0000);
    }

    #[test]
    fn read8_extracts_byte() {
        let regs = FakeRegs::new(4);
        regs.set(0, 0x4433_2211);
        assert_eq!(regs.read8(0), 0x11);
        assert_eq!(regs.read8(1), 0x22);
        assert_eq!(regs.read8(3), 0x44);
    }

    #[test]
    fn portsc_offsets() {
        assert_eq!(op::portsc(0), 0x400);
        assert_eq!(op::portsc(3), 0x430);
    }
}
