//! `helion-acpi` --- a standalone, `no_std` ACPI table parser.
//!
//! Parses the tables the kernel consumes during early boot: RSDP,
//! RSDT/XSDT, MADT, HPET, and MCFG. All table access goes through an
//! [`AcpiHandler`] that maps physical memory on demand, so the crate is
//! agnostic to whether the kernel uses an identity map, an HHDM, or
//! temporary mappings --- and host tests can back it with plain buffers.
//!
//! # Usage
//!
//! ```ignore
//! let tables = AcpiTables::new(rsdp_physical_address, my_handler)?;
//! let madt = tables.madt()?;
//! for entry in madt.entries() {
//!     // ...
//! }
//! ```

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod hpet;
pub mod madt;
pub mod mcfg;
pub mod rsdp;
pub mod rsdt;
pub mod sdt;

pub use hpet::HpetTable;
pub use madt::{Madt, MadtEntry, MadtEntryIter};
pub use mcfg::{Mcfg, McfgEntry};
pub use sdt::SdtHeader;

/// Errors that can occur during ACPI table parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiError {
    /// The checksum of a table or the RSDP did not validate (sum != 0).
    InvalidChecksum,
    /// The table signature did not match the expected value.
    InvalidSignature,
    /// The RSDP revision field contained an unrecognised value.
    InvalidRevision,
    /// The RSDP structure was invalid (bad signature or checksum).
    InvalidRsdp,
    /// No RSDP was found in the EBDA or BIOS scan areas.
    RsdpNotFound,
    /// A table with the requested signature was not found in the RSDT/XSDT.
    TableNotFound,
    /// A table or structure was too short to contain the expected data.
    TruncatedData,
}

/// Trait for mapping physical memory regions so ACPI tables can be read.
///
/// An implementation must return a pointer valid for at least `size` bytes
/// starting at physical address `phys`. The mapping may be an identity map,
/// a higher-half direct map, or a temporary mapping --- the crate does not
/// care which.
///
/// # Safety
///
/// Implementors must ensure the returned pointer is valid and readable for
/// the requested `size` bytes, and remains valid for `'static`.
pub unsafe trait AcpiHandler {
    /// Map a physical memory region and return a pointer to it.
    ///
    /// # Safety
    ///
    /// The caller guarantees `phys` is a plausible ACPI-related physical
    /// address; the implementation guarantees the returned pointer is
    /// readable for `size` bytes.
    unsafe fn map_physical_region(&self, phys: u64, size: usize) -> *const u8;
}

/// Collection of ACPI tables discovered via the RSDP.
///
/// This is the primary entry point for ACPI table access. Construct it with
/// [`AcpiTables::new`] from a known RSDP address (e.g. handed over by the
/// boot loader), or with [`AcpiTables::scan`] to search the EBDA and the
/// `0xE0000..0x100000` BIOS area. Individual tables are parsed lazily.
pub struct AcpiTables<H: AcpiHandler> {
    /// Handler used to map physical memory.
    handler: H,
    /// Physical address of the RSDT or XSDT.
    rsdt_addr: u64,
    /// `true` if `rsdt_addr` points to an XSDT, `false` for RSDT.
    is_xsdt: bool,
}

impl<H: AcpiHandler> AcpiTables<H> {
    /// Discover and validate the ACPI table hierarchy starting from the RSDP.
    ///
    /// # Errors
    ///
    /// Returns an [`AcpiError`] if the RSDP is invalid.
    pub fn new(rsdp_phys: u64, handler: H) -> Result<Self, AcpiError> {
        let (rsdt_addr, is_xsdt) = rsdp::parse_rsdp(&handler, rsdp_phys)?;
        Ok(Self {
            handler,
            rsdt_addr,
            is_xsdt,
        })
    }

    /// Search the legacy scan areas for the RSDP and build the table set.
    ///
    /// Checks the first KiB of the EBDA (segment pointer at `0x40E`) and the
    /// BIOS read-only area `0xE0000..0x100000`, on 16-byte boundaries.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::RsdpNotFound`] when no valid RSDP exists in
    /// either area.
    pub fn scan(handler: H) -> Result<Self, AcpiError> {
        let rsdp_phys = rsdp::scan_for_rsdp(&handler).ok_or(AcpiError::RsdpNotFound)?;
        Self::new(rsdp_phys, handler)
    }

    /// Search the RSDT/XSDT for a table with the given 4-byte signature.
    ///
    /// Returns the physical address of the table if found, or `None`.
    #[must_use]
    pub fn find_table(&self, signature: &[u8; 4]) -> Option<u64> {
        rsdt::find_table_in_rsdt(&self.handler, self.rsdt_addr, self.is_xsdt, signature)
    }

    /// Parse and return the MADT (Multiple APIC Description Table).
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::TableNotFound`] if no MADT exists, or another
    /// [`AcpiError`] variant if the table is malformed.
    pub fn madt(&self) -> Result<Madt, AcpiError> {
        let phys = self
            .find_table(madt::MADT_SIGNATURE)
            .ok_or(AcpiError::TableNotFound)?;
        Madt::parse(&self.handler, phys)
    }

    /// Parse and return the HPET table.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::TableNotFound`] if no HPET table exists, or
    /// another [`AcpiError`] variant if the table is malformed.
    pub fn hpet(&self) -> Result<HpetTable, AcpiError> {
        let phys = self
            .find_table(hpet::HPET_SIGNATURE)
            .ok_or(AcpiError::TableNotFound)?;
        HpetTable::parse(&self.handler, phys)
    }

    /// Parse and return the MCFG (PCI Express ECAM) table.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::TableNotFound`] if no MCFG table exists, or
    /// another [`AcpiError`] variant if the table is malformed.
    pub fn mcfg(&self) -> Result<Mcfg, AcpiError> {
        let phys = self
            .find_table(mcfg::MCFG_SIGNATURE)
            .ok_or(AcpiError::TableNotFound)?;
        Mcfg::parse(&self.handler, phys)
    }

    /// Returns a reference to the underlying [`AcpiHandler`].
    #[must_use]
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Returns the physical address of the RSDT or XSDT.
    #[must_use]
    pub fn rsdt_addr(&self) -> u64 {
        self.rsdt_addr
    }

    /// Returns whether the root table is an XSDT (`true`) or RSDT (`false`).
    #[must_use]
    pub fn is_xsdt(&self) -> bool {
        self.is_xsdt
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! A fake physical address space backed by a flat buffer, for host tests.

    use super::AcpiHandler;

    /// Treats offsets into a leaked byte buffer as physical addresses.
    pub struct BufferHandler {
        base: *const u8,
        len: usize,
    }

    impl BufferHandler {
        /// Leaks `data` so the `'static` mapping contract holds for the
        /// duration of the test process.
        pub fn new(data: Vec<u8>) -> Self {
            let leaked: &'static [u8] = Vec::leak(data);
            Self {
                base: leaked.as_ptr(),
                len: leaked.len(),
            }
        }
    }

    // SAFETY: The buffer is leaked, so pointers into it stay valid for
    // 'static. Bounds are asserted on every mapping.
    unsafe impl AcpiHandler for BufferHandler {
        unsafe fn map_physical_region(&self, phys: u64, size: usize) -> *const u8 {
            let offset = phys as usize;
            assert!(
                offset + size <= self.len,
                "mapping {:#x}+{} outside the {}-byte test buffer",
                phys,
                size,
                self.len
            );
            // SAFETY: asserted in bounds above.
            unsafe { self.base.add(offset) }
        }
    }

    /// Computes the checksum byte that makes `data` sum to zero.
    pub fn checksum_fixup(data: &[u8]) -> u8 {
        let sum: u8 = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        0u8.wrapping_sub(sum)
    }
}
