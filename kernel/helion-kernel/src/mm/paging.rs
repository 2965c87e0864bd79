//! x86_64 page table structures.
//!
//! Types for manipulating 4-level page tables (PML4 -> PDPT -> PD -> PT).
//! The walk/build logic lives in [`vmm`](crate::mm::vmm); these types are
//! plain data and host-testable.

use crate::addr::PhysAddr;

/// Physical address mask: bits 12..51 of a page table entry.
pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Bytes covered by one PD entry (2 MiB huge page).
pub const SIZE_2MIB: u64 = 2 * 1024 * 1024;

/// Bytes covered by one PDPT entry (1 GiB huge page).
pub const SIZE_1GIB: u64 = 1024 * 1024 * 1024;

bitflags::bitflags! {
    /// Page table entry flags.
    ///
    /// The PS (huge) bit is level-dependent: 2 MiB in a PD entry, 1 GiB in
    /// a PDPT entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        /// Entry is present / valid.
        const PRESENT       = 1 << 0;
        /// Page is writable.
        const WRITABLE      = 1 << 1;
        /// Page is accessible from user mode (ring 3).
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Cache disabled.
        const NO_CACHE      = 1 << 4;
        /// Set by the CPU on first access.
        const ACCESSED      = 1 << 5;
        /// Set by the CPU on first write.
        const DIRTY         = 1 << 6;
        /// PS bit -- 2 MiB page in PD, 1 GiB page in PDPT.
        const HUGE_PAGE     = 1 << 7;
        /// Global page (survives CR3 switches when CR4.PGE is set).
        const GLOBAL        = 1 << 8;
        /// No-execute bit (requires EFER.NXE).
        const NO_EXECUTE    = 1 << 63;
    }
}

bitflags::bitflags! {
    /// Page fault error code flags pushed by the CPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultErrorCode: u64 {
        /// 1 = protection violation, 0 = not-present page.
        const PRESENT           = 1 << 0;
        /// 1 = write access caused the fault.
        const WRITE             = 1 << 1;
        /// 1 = fault occurred in user mode.
        const USER              = 1 << 2;
        /// 1 = a reserved bit was set in a page table entry.
        const RESERVED_WRITE    = 1 << 3;
        /// 1 = fault was caused by an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// A single page table entry (64 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// An empty (not present) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates an entry pointing to `phys_addr` with the given `flags`.
    pub const fn new(phys_addr: PhysAddr, flags: PageTableFlags) -> Self {
        Self((phys_addr.as_u64() & ADDR_MASK) | flags.bits())
    }

    /// Returns `true` if the PRESENT bit is set.
    pub const fn is_present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Returns `true` if this is a huge leaf entry (PS set).
    pub const fn is_huge(self) -> bool {
        self.0 & (1 << 7) != 0
    }

    /// Returns the physical address stored in this entry.
    pub const fn address(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    /// Returns the flags portion of this entry.
    pub const fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }
}

/// A 4 KiB-aligned page table containing 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    /// The 512 entries of this table.
    pub entries: [PageTableEntry; 512],
}

impl PageTable {
    /// Zero-initializes all entries.
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_entry_not_present() {
        let entry = PageTableEntry::empty();
        assert!(!entry.is_present());
        assert_eq!(entry.address().as_u64(), 0);
    }

    #[test]
    fn entry_address_and_flags_disjoint() {
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
        let entry = PageTableEntry::new(PhysAddr::new(0x0000_1234_5000), flags);
        assert_eq!(entry.address().as_u64(), 0x0000_1234_5000);
        assert_eq!(entry.flags(), flags);
        assert_eq!(entry.flags().bits() & ADDR_MASK, 0);
    }

    #[test]
    fn huge_bit_detected() {
        let entry = PageTableEntry::new(
            PhysAddr::new(0x20_0000),
            PageTableFlags::PRESENT | PageTableFlags::HUGE_PAGE,
        );
        assert!(entry.is_huge());
    }

    #[test]
    fn addr_mask_bit_range() {
        for bit in 0..64 {
            let expected = (12..52).contains(&bit);
            let actual = (ADDR_MASK >> bit) & 1 == 1;
            assert_eq!(actual, expected, "bit {bit} mismatch in ADDR_MASK");
        }
    }

    #[test]
    fn page_fault_error_code_bits() {
        let code = PageFaultErrorCode::from_bits_truncate(0b00011);
        assert!(code.contains(PageFaultErrorCode::PRESENT));
        assert!(code.contains(PageFaultErrorCode::WRITE));
        assert!(!code.contains(PageFaultErrorCode::USER));
    }
}
