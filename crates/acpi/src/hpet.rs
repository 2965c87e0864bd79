//! High Precision Event Timer (HPET) table parsing.
//!
//! The HPET table carries the MMIO base address and configuration of the
//! HPET timer block, a higher-resolution alternative to the legacy 8254 PIT.

use core::ptr;

use crate::sdt::SdtHeader;
use crate::{AcpiError, AcpiHandler};

/// HPET table signature.
pub const HPET_SIGNATURE: &[u8; 4] = b"HPET";

/// Generic Address Structure used to describe the HPET base address.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct GenericAddress {
    /// Address space ID (0 = system memory, 1 = system I/O).
    pub address_space_id: u8,
    /// Register bit width.
    pub register_bit_width: u8,
    /// Register bit offset.
    pub register_bit_offset: u8,
    /// Reserved / access size.
    pub reserved: u8,
    /// Address within the given address space.
    pub address: u64,
}

/// Raw HPET table fields following the SDT header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct HpetRaw {
    event_timer_block_id: u32,
    base_address: GenericAddress,
    hpet_number: u8,
    minimum_tick: u16,
    page_protection: u8,
}

/// Parsed HPET table.
#[derive(Debug, Clone, Copy)]
pub struct HpetTable {
    /// Hardware ID of the event timer block.
    pub event_timer_block_id: u32,
    /// Base address of the HPET register block.
    pub base_address: GenericAddress,
    /// HPET sequence number (used when multiple HPETs are present).
    pub hpet_number: u8,
    /// Minimum clock tick in periodic mode, in femtoseconds.
    pub minimum_tick: u16,
    /// Page protection and OEM attribute.
    pub page_protection: u8,
}

impl HpetTable {
    /// Size of the HPET-specific fields following the SDT header.
    const FIELDS_SIZE: usize = 20;

    /// Parse an HPET table from the given physical address.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::InvalidSignature`] if the table signature is not
    /// `HPET`, or [`AcpiError::InvalidChecksum`] if the checksum is invalid.
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        let (table_ptr, total_len) = crate::sdt::load_table(handler, phys, HPET_SIGNATURE)?;

        if total_len < SdtHeader::SIZE + Self::FIELDS_SIZE {
            return Err(AcpiError::TruncatedData);
        }

        // SAFETY: the table covers the raw fields as checked above.
        let raw: HpetRaw = unsafe { ptr::read_unaligned(table_ptr.add(SdtHeader::SIZE).cast()) };

        Ok(Self {
            event_timer_block_id: raw.event_timer_block_id,
            base_address: raw.base_address,
            hpet_number: raw.hpet_number,
            minimum_tick: raw.minimum_tick,
            page_protection: raw.page_protection,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{BufferHandler, checksum_fixup};

    #[test]
    fn parses_base_address() {
        let total_len = SdtHeader::SIZE + core::mem::size_of::<HpetRaw>();
        let mut table = vec![0u8; total_len];
        table[0..4].copy_from_slice(HPET_SIGNATURE);
        table[4..8].copy_from_slice(&(total_len as u32).to_le_bytes());
        // GenericAddress.address at header + 4 (block id) + 4 (GAS prefix).
        let addr_off = SdtHeader::SIZE + 4 + 4;
        table[addr_off..addr_off + 8].copy_from_slice(&0xFED0_0000u64.to_le_bytes());
        table[9] = checksum_fixup(&table);

        let mut image = vec![0u8; 0x1000];
        image[0x200..0x200 + table.len()].copy_from_slice(&table);
        let handler = BufferHandler::new(image);

        let hpet = HpetTable::parse(&handler, 0x200).expect("valid HPET");
        let base = hpet.base_address.address;
        assert_eq!(base, 0xFED0_0000);
    }
}
