//! Multiple APIC Description Table (MADT) parsing.
//!
//! The MADT describes the interrupt controller topology of the system:
//! local APICs, I/O APICs, interrupt source overrides, NMI configuration,
//! and an optional 64-bit local APIC address override.

use core::ptr;

use crate::sdt::SdtHeader;
use crate::{AcpiError, AcpiHandler};

/// MADT table signature (`b"APIC"`).
pub const MADT_SIGNATURE: &[u8; 4] = b"APIC";

/// Raw MADT fields that follow the SDT header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct MadtHeaderFields {
    /// Physical address of the local APIC.
    local_apic_address: u32,
    /// MADT flags (bit 0: dual 8259 PICs installed).
    flags: u32,
}

/// Parsed MADT table.
///
/// The entry data is accessed through the [`MadtEntryIter`] iterator returned
/// by [`Madt::entries`].
#[derive(Debug)]
pub struct Madt {
    /// Physical address of the local APIC (32-bit; see
    /// [`MadtEntry::LocalApicAddressOverride`] for the 64-bit form).
    pub local_apic_address: u32,
    /// MADT flags (bit 0: dual 8259 PICs installed).
    pub flags: u32,
    /// Pointer to the start of the entry array.
    entries_ptr: *const u8,
    /// Total length of the entry data in bytes.
    entries_len: usize,
}

impl Madt {
    /// Size of the fixed MADT fields after the SDT header (address + flags).
    const FIELDS_SIZE: usize = 8;

    /// Parse a MADT from the given physical address.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::InvalidSignature`] if the table signature is not
    /// `APIC`, or [`AcpiError::InvalidChecksum`] if the checksum is invalid.
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        let (table_ptr, total_len) = crate::sdt::load_table(handler, phys, MADT_SIGNATURE)?;

        if total_len < SdtHeader::SIZE + Self::FIELDS_SIZE {
            return Err(AcpiError::TruncatedData);
        }

        // SAFETY: the table is at least SdtHeader::SIZE + FIELDS_SIZE bytes.
        let fields: MadtHeaderFields =
            unsafe { ptr::read_unaligned(table_ptr.add(SdtHeader::SIZE).cast()) };

        let entries_offset = SdtHeader::SIZE + Self::FIELDS_SIZE;
        let entries_len = total_len - entries_offset;
        // SAFETY: entries_offset <= total_len as checked above.
        let entries_ptr = unsafe { table_ptr.add(entries_offset) };

        Ok(Self {
            local_apic_address: fields.local_apic_address,
            flags: fields.flags,
            entries_ptr,
            entries_len,
        })
    }

    /// Returns the effective local APIC physical address, honoring a 64-bit
    /// address override entry when one is present.
    #[must_use]
    pub fn effective_local_apic_address(&self) -> u64 {
        for entry in self.entries() {
            if let MadtEntry::LocalApicAddressOverride(ovr) = entry {
                return ovr.address;
            }
        }
        u64::from(self.local_apic_address)
    }

    /// Returns an iterator over the MADT interrupt controller entries.
    #[must_use]
    pub fn entries(&self) -> MadtEntryIter {
        MadtEntryIter {
            ptr: self.entries_ptr,
            remaining: self.entries_len,
        }
    }
}

/// A single MADT interrupt controller structure entry.
#[derive(Debug, Clone, Copy)]
pub enum MadtEntry {
    /// Type 0: Processor Local APIC.
    LocalApic(LocalApic),
    /// Type 1: I/O APIC.
    IoApic(IoApic),
    /// Type 2: Interrupt Source Override.
    InterruptSourceOverride(InterruptSourceOverride),
    /// Type 3: Non-Maskable Interrupt (NMI) Source.
    NmiSource(NmiSource),
    /// Type 4: Local APIC NMI.
    LocalApicNmi(LocalApicNmi),
    /// Type 5: 64-bit Local APIC Address Override.
    LocalApicAddressOverride(LocalApicAddressOverride),
    /// An entry type that we do not parse.
    Unknown {
        /// The entry type byte.
        entry_type: u8,
        /// The entry length including the 2-byte header.
        length: u8,
    },
}

/// Processor Local APIC structure (MADT entry type 0).
#[derive(Debug, Clone, Copy)]
pub struct LocalApic {
    /// ACPI processor UID.
    pub acpi_processor_id: u8,
    /// The processor's local APIC ID.
    pub apic_id: u8,
    /// Flags (bit 0: enabled, bit 1: online capable).
    pub flags: u32,
}

/// I/O APIC structure (MADT entry type 1).
#[derive(Debug, Clone, Copy)]
pub struct IoApic {
    /// The I/O APIC ID.
    pub io_apic_id: u8,
    /// Physical address of the I/O APIC registers.
    pub io_apic_address: u32,
    /// Global System Interrupt base for this I/O APIC.
    pub gsi_base: u32,
}

/// Interrupt Source Override (MADT entry type 2).
#[derive(Debug, Clone, Copy)]
pub struct InterruptSourceOverride {
    /// Constant: 0 (ISA bus).
    pub bus: u8,
    /// ISA source IRQ number.
    pub source: u8,
    /// Global System Interrupt number this source maps to.
    pub gsi: u32,
    /// MPS INTI flags (bits 0-1 polarity, bits 2-3 trigger mode).
    pub flags: u16,
}

/// Non-Maskable Interrupt Source (MADT entry type 3).
#[derive(Debug, Clone, Copy)]
pub struct NmiSource {
    /// MPS INTI flags.
    pub flags: u16,
    /// Global System Interrupt this NMI is wired to.
    pub gsi: u32,
}

/// Local APIC NMI configuration (MADT entry type 4).
#[derive(Debug, Clone, Copy)]
pub struct LocalApicNmi {
    /// ACPI processor UID (`0xFF` = all processors).
    pub acpi_processor_id: u8,
    /// MPS INTI flags.
    pub flags: u16,
    /// Local APIC LINT pin number (0 or 1).
    pub lint: u8,
}

/// 64-bit Local APIC Address Override (MADT entry type 5).
#[derive(Debug, Clone, Copy)]
pub struct LocalApicAddressOverride {
    /// The 64-bit physical address of the local APIC.
    pub address: u64,
}

/// Iterator over MADT interrupt controller entries.
pub struct MadtEntryIter {
    /// Pointer to the current entry.
    ptr: *const u8,
    /// Bytes remaining in the entry area.
    remaining: usize,
}

impl MadtEntryIter {
    /// Reads a `T` at `offset` bytes past the current entry header.
    ///
    /// # Safety
    ///
    /// The caller must ensure `offset + size_of::<T>()` is within the entry.
    unsafe fn read_at<T: Copy>(&self, offset: usize) -> T {
        // SAFETY: per the caller's contract, the read is in bounds.
        unsafe { ptr::read_unaligned(self.ptr.add(offset).cast::<T>()) }
    }
}

impl Iterator for MadtEntryIter {
    type Item = MadtEntry;

    fn next(&mut self) -> Option<Self::Item> {
        // Each entry starts with a 2-byte {type, length} header.
        if self.remaining < 2 {
            return None;
        }

        // SAFETY: at least 2 bytes remain.
        let entry_type: u8 = unsafe { self.read_at(0) };
        // SAFETY: at least 2 bytes remain.
        let length: u8 = unsafe { self.read_at(1) };

        // A zero or overlong length would loop forever or walk off the table.
        if length < 2 || usize::from(length) > self.remaining {
            self.remaining = 0;
            return None;
        }

        let entry = match entry_type {
            0 if length >= 8 => MadtEntry::LocalApic(LocalApic {
                // SAFETY: length checked to cover the fields below.
                acpi_processor_id: unsafe { self.read_at(2) },
                apic_id: unsafe { self.read_at(3) },
                flags: unsafe { self.read_at(4) },
            }),
            1 if length >= 12 => MadtEntry::IoApic(IoApic {
                // SAFETY: length checked to cover the fields below.
                io_apic_id: unsafe { self.read_at(2) },
                io_apic_address: unsafe { self.read_at(4) },
                gsi_base: unsafe { self.read_at(8) },
            }),
            2 if length >= 10 => MadtEntry::InterruptSourceOverride(InterruptSourceOverride {
                // SAFETY: length checked to cover the fields below.
                bus: unsafe { self.read_at(2) },
                source: unsafe { self.read_at(3) },
                gsi: unsafe { self.read_at(4) },
                flags: unsafe { self.read_at(8) },
            }),
            3 if length >= 8 => MadtEntry::NmiSource(NmiSource {
                // SAFETY: length checked to cover the fields below.
                flags: unsafe { self.read_at(2) },
                gsi: unsafe { self.read_at(4) },
            }),
            4 if length >= 6 => MadtEntry::LocalApicNmi(LocalApicNmi {
                // SAFETY: length checked to cover the fields below.
                acpi_processor_id: unsafe { self.read_at(2) },
                flags: unsafe { self.read_at(3) },
                lint: unsafe { self.read_at(5) },
            }),
            5 if length >= 12 => MadtEntry::LocalApicAddressOverride(LocalApicAddressOverride {
                // SAFETY: length checked to cover the fields below.
                address: unsafe { self.read_at(4) },
            }),
            _ => MadtEntry::Unknown { entry_type, length },
        };

        // SAFETY: length <= remaining, so the new pointer stays in bounds.
        self.ptr = unsafe { self.ptr.add(usize::from(length)) };
        self.remaining -= usize::from(length);

        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{BufferHandler, checksum_fixup};

    /// Builds a MADT at 0x100 with one LAPIC, one IOAPIC, and one ISO entry.
    fn build_image() -> Vec<u8> {
        let mut entries = Vec::new();

        // LAPIC: processor 0, apic id 0, enabled.
        entries.extend_from_slice(&[0, 8, 0, 0, 1, 0, 0, 0]);
        // IOAPIC: id 1, address 0xFEC0_0000, gsi base 0.
        entries.extend_from_slice(&[1, 12, 1, 0]);
        entries.extend_from_slice(&0xFEC0_0000u32.to_le_bytes());
        entries.extend_from_slice(&0u32.to_le_bytes());
        // ISO: IRQ 0 -> GSI 2, flags 0.
        entries.extend_from_slice(&[2, 10, 0, 0]);
        entries.extend_from_slice(&2u32.to_le_bytes());
        entries.extend_from_slice(&0u16.to_le_bytes());

        let total_len = SdtHeader::SIZE + 8 + entries.len();
        let mut table = vec![0u8; total_len];
        table[0..4].copy_from_slice(MADT_SIGNATURE);
        table[4..8].copy_from_slice(&(total_len as u32).to_le_bytes());
        table[SdtHeader::SIZE..SdtHeader::SIZE + 4]
            .copy_from_slice(&0xFEE0_0000u32.to_le_bytes());
        table[SdtHeader::SIZE + 4..SdtHeader::SIZE + 8].copy_from_slice(&1u32.to_le_bytes());
        table[SdtHeader::SIZE + 8..].copy_from_slice(&entries);
        table[9] = checksum_fixup(&table);

        let mut image = vec![0u8; 0x1000];
        image[0x100..0x100 + table.len()].copy_from_slice(&table);
        image
    }

    #[test]
    fn parses_entries() {
        let handler = BufferHandler::new(build_image());
        let madt = Madt::parse(&handler, 0x100).expect("valid MADT");
        assert_eq!(madt.local_apic_address, 0xFEE0_0000);

        let entries: Vec<_> = madt.entries().collect();
        assert_eq!(entries.len(), 3);
        assert!(matches!(entries[0], MadtEntry::LocalApic(_)));
        match entries[1] {
            MadtEntry::IoApic(io) => {
                assert_eq!(io.io_apic_address, 0xFEC0_0000);
                assert_eq!(io.gsi_base, 0);
            }
            _ => panic!("expected IoApic"),
        }
        match entries[2] {
            MadtEntry::InterruptSourceOverride(iso) => {
                assert_eq!(iso.source, 0);
                assert_eq!(iso.gsi, 2);
            }
            _ => panic!("expected InterruptSourceOverride"),
        }
    }

    #[test]
    fn effective_address_without_override() {
        let handler = BufferHandler::new(build_image());
        let madt = Madt::parse(&handler, 0x100).expect("valid MADT");
        assert_eq!(madt.effective_local_apic_address(), 0xFEE0_0000);
    }

    #[test]
    fn rejects_corrupt_checksum() {
        let mut image = build_image();
        image[0x100 + SdtHeader::SIZE] ^= 0xFF;
        let handler = BufferHandler::new(image);
        assert_eq!(
            Madt::parse(&handler, 0x100).unwrap_err(),
            AcpiError::InvalidChecksum
        );
    }

    #[test]
    fn zero_length_entry_terminates_iteration() {
        let mut image = build_image();
        // Stamp a zero length into the first entry header.
        image[0x100 + SdtHeader::SIZE + 8 + 1] = 0;
        // Re-checksum.
        let len = {
            let p = &image[0x100 + 4..0x100 + 8];
            u32::from_le_bytes([p[0], p[1], p[2], p[3]]) as usize
        };
        image[0x100 + 9] = 0;
        image[0x100 + 9] = checksum_fixup(&image[0x100..0x100 + len]);

        let handler = BufferHandler::new(image);
        let madt = Madt::parse(&handler, 0x100).expect("valid MADT");
        assert_eq!(madt.entries().count(), 0);
    }
}
