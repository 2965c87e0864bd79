//! System Description Table (SDT) header and checksum utilities.

use core::ptr;

/// Standard ACPI System Description Table header.
///
/// This 36-byte header is present at the start of every ACPI table
/// (RSDT, XSDT, MADT, HPET, MCFG, etc.).
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct SdtHeader {
    /// 4-byte ASCII signature identifying the table type.
    pub signature: [u8; 4],
    /// Total length of the table, including the header, in bytes.
    pub length: u32,
    /// Revision of the table structure.
    pub revision: u8,
    /// Checksum byte. The entire table, including the header, must sum to zero.
    pub checksum: u8,
    /// OEM-supplied identification string.
    pub oem_id: [u8; 6],
    /// OEM-supplied table identification string.
    pub oem_table_id: [u8; 8],
    /// OEM-supplied revision number.
    pub oem_revision: u32,
    /// Vendor ID of the utility that created the table.
    pub creator_id: u32,
    /// Revision of the utility that created the table.
    pub creator_revision: u32,
}

impl SdtHeader {
    /// The size of an SDT header in bytes.
    pub const SIZE: usize = 36;

    /// Reads an [`SdtHeader`] from a raw pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of [`SdtHeader::SIZE`] bytes.
    #[must_use]
    pub unsafe fn read_from(ptr: *const u8) -> Self {
        // SAFETY: the caller guarantees SIZE readable bytes; the struct has
        // no invalid bit patterns.
        unsafe { ptr::read_unaligned(ptr.cast::<Self>()) }
    }

    /// Returns the 4-byte signature.
    #[must_use]
    pub fn signature(&self) -> [u8; 4] {
        self.signature
    }

    /// Returns the total length of this table (header included).
    #[must_use]
    pub fn length(&self) -> u32 {
        self.length
    }
}

/// Validates an ACPI checksum over `len` bytes at `ptr`.
///
/// ACPI tables are laid out so that all bytes of a table sum to zero
/// (mod 256).
///
/// # Safety
///
/// `ptr` must be valid for reads of `len` bytes.
#[must_use]
pub unsafe fn validate_checksum(ptr: *const u8, len: usize) -> bool {
    let mut sum: u8 = 0;
    for i in 0..len {
        // SAFETY: i < len, and the caller guarantees len readable bytes.
        sum = sum.wrapping_add(unsafe { ptr.add(i).read() });
    }
    sum == 0
}

/// Maps a table, verifies its signature, and validates its checksum.
///
/// Returns the mapped table pointer and total length.
///
/// # Errors
///
/// Returns [`AcpiError::InvalidSignature`](crate::AcpiError::InvalidSignature)
/// on a signature mismatch and
/// [`AcpiError::InvalidChecksum`](crate::AcpiError::InvalidChecksum) when the
/// byte sum is nonzero.
pub fn load_table(
    handler: &impl crate::AcpiHandler,
    phys: u64,
    expected_signature: &[u8; 4],
) -> Result<(*const u8, usize), crate::AcpiError> {
    // Map just the header first to learn the total length.
    // SAFETY: the caller provides a plausible table address.
    let header_ptr = unsafe { handler.map_physical_region(phys, SdtHeader::SIZE) };
    // SAFETY: header_ptr is valid for SdtHeader::SIZE bytes.
    let header = unsafe { SdtHeader::read_from(header_ptr) };

    if &header.signature() != expected_signature {
        return Err(crate::AcpiError::InvalidSignature);
    }

    let total_len = header.length() as usize;
    if total_len < SdtHeader::SIZE {
        return Err(crate::AcpiError::TruncatedData);
    }

    // SAFETY: phys is valid, total_len comes from the header.
    let table_ptr = unsafe { handler.map_physical_region(phys, total_len) };

    // SAFETY: table_ptr is valid for total_len bytes.
    if !unsafe { validate_checksum(table_ptr, total_len) } {
        return Err(crate::AcpiError::InvalidChecksum);
    }

    Ok((table_ptr, total_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_zeroes_is_valid() {
        let data = [0u8; 36];
        assert!(unsafe { validate_checksum(data.as_ptr(), data.len()) });
    }

    #[test]
    fn checksum_detects_corruption() {
        let mut data = [0u8; 36];
        data[10] = 1;
        assert!(!unsafe { validate_checksum(data.as_ptr(), data.len()) });
    }

    #[test]
    fn header_roundtrip() {
        let mut data = [0u8; SdtHeader::SIZE];
        data[0..4].copy_from_slice(b"APIC");
        data[4..8].copy_from_slice(&44u32.to_le_bytes());
        let header = unsafe { SdtHeader::read_from(data.as_ptr()) };
        assert_eq!(&header.signature(), b"APIC");
        assert_eq!(header.length(), 44);
    }
}
