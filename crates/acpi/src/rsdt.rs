//! RSDT / XSDT table enumeration.
//!
//! The Root System Description Table (RSDT, 32-bit entries) and its 64-bit
//! counterpart (XSDT) contain pointers to all other ACPI tables. This module
//! locates a table by its 4-byte signature.

use core::ptr;

use crate::AcpiHandler;
use crate::sdt::SdtHeader;

/// Size in bytes of a single table-pointer entry in the RSDT (32-bit).
const RSDT_ENTRY_SIZE: usize = 4;

/// Size in bytes of a single table-pointer entry in the XSDT (64-bit).
const XSDT_ENTRY_SIZE: usize = 8;

/// Search the RSDT/XSDT for a table whose SDT header matches `signature`.
///
/// Returns the physical address of the matching table, or `None` if no table
/// with that signature exists.
pub fn find_table_in_rsdt(
    handler: &impl AcpiHandler,
    rsdt_addr: u64,
    is_xsdt: bool,
    signature: &[u8; 4],
) -> Option<u64> {
    // Map the RSDT/XSDT header to learn the total table length.
    // SAFETY: the caller provides a valid physical address.
    let header_ptr = unsafe { handler.map_physical_region(rsdt_addr, SdtHeader::SIZE) };
    // SAFETY: header_ptr is valid for SdtHeader::SIZE bytes.
    let header = unsafe { SdtHeader::read_from(header_ptr) };

    let total_len = header.length() as usize;
    let entries_len = total_len.saturating_sub(SdtHeader::SIZE);
    if entries_len == 0 {
        return None;
    }

    let entry_size = if is_xsdt {
        XSDT_ENTRY_SIZE
    } else {
        RSDT_ENTRY_SIZE
    };
    let entry_count = entries_len / entry_size;

    // Map the entire table so we can walk the entries.
    // SAFETY: the address is valid and total_len is from the header.
    let table_ptr = unsafe { handler.map_physical_region(rsdt_addr, total_len) };

    for i in 0..entry_count {
        // SAFETY: i * entry_size + entry_size <= entries_len.
        let entry_ptr = unsafe { table_ptr.add(SdtHeader::SIZE + i * entry_size) };
        let entry_phys = if is_xsdt {
            // SAFETY: valid for 8 bytes within the mapped table.
            unsafe { ptr::read_unaligned(entry_ptr.cast::<u64>()) }
        } else {
            // SAFETY: valid for 4 bytes within the mapped table.
            u64::from(unsafe { ptr::read_unaligned(entry_ptr.cast::<u32>()) })
        };

        if entry_phys == 0 {
            continue;
        }

        // Map just the header of the candidate table.
        // SAFETY: entry_phys came from the RSDT/XSDT.
        let candidate_ptr = unsafe { handler.map_physical_region(entry_phys, SdtHeader::SIZE) };
        // SAFETY: candidate_ptr is valid for SdtHeader::SIZE bytes.
        let candidate = unsafe { SdtHeader::read_from(candidate_ptr) };
        if &candidate.signature() == signature {
            return Some(entry_phys);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{BufferHandler, checksum_fixup};

    /// Lays out an RSDT at 0x100 pointing at two tables, returns the image.
    fn build_image() -> Vec<u8> {
        let mut image = vec![0u8; 0x2000];

        // Two referenced tables with distinct signatures.
        for (addr, sig) in [(0x500usize, b"APIC"), (0x600usize, b"HPET")] {
            image[addr..addr + 4].copy_from_slice(sig);
            image[addr + 4..addr + 8].copy_from_slice(&(SdtHeader::SIZE as u32).to_le_bytes());
            let sum = checksum_fixup(&image[addr..addr + SdtHeader::SIZE]);
            image[addr + 9] = sum;
        }

        // RSDT with two 32-bit entries.
        let rsdt_len = SdtHeader::SIZE + 2 * RSDT_ENTRY_SIZE;
        image[0x100..0x104].copy_from_slice(b"RSDT");
        image[0x104..0x108].copy_from_slice(&(rsdt_len as u32).to_le_bytes());
        image[0x100 + SdtHeader::SIZE..0x100 + SdtHeader::SIZE + 4]
            .copy_from_slice(&0x500u32.to_le_bytes());
        image[0x100 + SdtHeader::SIZE + 4..0x100 + SdtHeader::SIZE + 8]
            .copy_from_slice(&0x600u32.to_le_bytes());
        let sum = checksum_fixup(&image[0x100..0x100 + rsdt_len]);
        image[0x109] = sum;

        image
    }

    #[test]
    fn finds_table_by_signature() {
        let handler = BufferHandler::new(build_image());
        assert_eq!(find_table_in_rsdt(&handler, 0x100, false, b"HPET"), Some(0x600));
        assert_eq!(find_table_in_rsdt(&handler, 0x100, false, b"APIC"), Some(0x500));
    }

    #[test]
    fn missing_table_returns_none() {
        let handler = BufferHandler::new(build_image());
        assert_eq!(find_table_in_rsdt(&handler, 0x100, false, b"MCFG"), None);
    }
}
