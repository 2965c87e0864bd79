//! Interrupt Descriptor Table (IDT) structures.
//!
//! The IDT is a flat array of 256 gates. Vectors 0..32 are CPU exceptions
//! (some pushing an error code), 32..48 are the legacy IRQ range, and 48+
//! are free for message-signaled interrupts.

use crate::addr::VirtAddr;
use crate::arch::x86_64::structures::gdt::{DescriptorTablePointer, SegmentSelector};

/// Number of IDT vectors.
pub const IDT_ENTRIES: usize = 256;

/// Handler for interrupts without an error code.
pub type HandlerFunc = extern "x86-interrupt" fn(InterruptStackFrame);

/// Handler for exceptions that push an error code.
pub type HandlerFuncWithErrCode = extern "x86-interrupt" fn(InterruptStackFrame, u64);

/// Diverging handler for fatal exceptions (e.g. double fault).
pub type DivergingHandlerFuncWithErrCode = extern "x86-interrupt" fn(InterruptStackFrame, u64) -> !;

/// The frame the CPU pushes on interrupt entry.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct InterruptStackFrame {
    /// Instruction pointer at the time of the interrupt.
    pub instruction_pointer: VirtAddr,
    /// Code segment selector.
    pub code_segment: u64,
    /// RFLAGS.
    pub cpu_flags: u64,
    /// Stack pointer at the time of the interrupt.
    pub stack_pointer: VirtAddr,
    /// Stack segment selector.
    pub stack_segment: u64,
}

/// Gate options (bits 32..47 of an entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct EntryOptions(u16);

impl EntryOptions {
    /// Interrupt gate type (0xE), not present, DPL 0, no IST.
    #[inline]
    const fn minimal() -> Self {
        Self(0x0E00)
    }

    /// Present interrupt gate, DPL 0, no IST.
    #[inline]
    fn present() -> Self {
        let mut opts = Self::minimal();
        opts.set_present(true);
        opts
    }

    /// Selects an interrupt stack table slot (1-7; 0 disables).
    #[inline]
    pub fn set_ist_index(&mut self, index: u8) -> &mut Self {
        debug_assert!(index < 8);
        self.0 = (self.0 & !0x07) | (u16::from(index) & 0x07);
        self
    }

    /// Sets the gate's descriptor privilege level.
    #[inline]
    pub fn set_dpl(&mut self, dpl: u8) -> &mut Self {
        debug_assert!(dpl < 4);
        self.0 = (self.0 & !0x6000) | ((u16::from(dpl) & 0x03) << 13);
        self
    }

    /// Sets or clears the present bit.
    #[inline]
    pub fn set_present(&mut self, present: bool) -> &mut Self {
        if present {
            self.0 |= 1 << 15;
        } else {
            self.0 &= !(1 << 15);
        }
        self
    }
}

/// One 16-byte IDT gate.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct IdtEntry {
    offset_low: u16,
    segment_selector: u16,
    options: EntryOptions,
    offset_mid: u16,
    offset_high: u32,
    _reserved: u32,
}

impl IdtEntry {
    /// A not-present gate.
    pub const fn missing() -> Self {
        Self {
            offset_low: 0,
            segment_selector: 0,
            options: EntryOptions::minimal(),
            offset_mid: 0,
            offset_high: 0,
            _reserved: 0,
        }
    }

    /// Installs a handler without an error code.
    pub fn set_handler(&mut self, handler: HandlerFunc, cs: SegmentSelector) -> &mut EntryOptions {
        self.set_handler_addr(handler as u64, cs)
    }

    /// Installs a handler receiving an error code.
    pub fn set_handler_with_err_code(
        &mut self,
        handler: HandlerFuncWithErrCode,
        cs: SegmentSelector,
    ) -> &mut EntryOptions {
        self.set_handler_addr(handler as u64, cs)
    }

    /// Installs a diverging handler receiving an error code.
    pub fn set_diverging_handler_with_err_code(
        &mut self,
        handler: DivergingHandlerFuncWithErrCode,
        cs: SegmentSelector,
    ) -> &mut EntryOptions {
        self.set_handler_addr(handler as u64, cs)
    }

    fn set_handler_addr(&mut self, addr: u64, cs: SegmentSelector) -> &mut EntryOptions {
        self.offset_low = addr as u16;
        self.offset_mid = (addr >> 16) as u16;
        self.offset_high = (addr >> 32) as u32;
        self.segment_selector = cs.as_u16();
        self.options = EntryOptions::present();
        &mut self.options
    }

    /// Reassembles the 64-bit handler address (diagnostics and tests).
    pub fn handler_addr(&self) -> u64 {
        u64::from(self.offset_low)
            | (u64::from(self.offset_mid) << 16)
            | (u64::from(self.offset_high) << 32)
    }

    /// Returns `true` if the gate is present.
    pub fn is_present(&self) -> bool {
        self.options.0 & (1 << 15) != 0
    }
}

/// The Interrupt Descriptor Table: 256 gates.
#[repr(C, align(16))]
pub struct InterruptDescriptorTable {
    /// All 256 vectors; exception accessors index into the low 32.
    pub entries: [IdtEntry; IDT_ENTRIES],
}

impl InterruptDescriptorTable {
    /// Creates a table of not-present gates.
    pub const fn new() -> Self {
        Self {
            entries: [IdtEntry::missing(); IDT_ENTRIES],
        }
    }

    /// Loads this IDT with `lidt`.
    ///
    /// # Safety
    ///
    /// The table must live for the rest of the kernel's lifetime and its
    /// present gates must point at valid handlers.
    #[inline]
    pub unsafe fn load(&'static self) {
        let ptr = DescriptorTablePointer {
            limit: (core::mem::size_of::<Self>() - 1) as u16,
            base: self.entries.as_ptr() as u64,
        };
        // SAFETY: ptr describes a live static table.
        unsafe {
            core::arch::asm!("lidt [{}]", in(reg) &ptr,
                options(readonly, nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "x86-interrupt" fn dummy(_frame: InterruptStackFrame) {}

    #[test]
    fn missing_entry_not_present() {
        let entry = IdtEntry::missing();
        assert!(!entry.is_present());
        assert_eq!(entry.handler_addr(), 0);
    }

    #[test]
    fn handler_address_roundtrip() {
        let mut entry = IdtEntry::missing();
        entry.set_handler(dummy, SegmentSelector::new(1, 0));
        assert!(entry.is_present());
        assert_eq!(entry.handler_addr(), dummy as u64);
        assert_eq!(entry.segment_selector, SegmentSelector::new(1, 0).as_u16());
    }

    #[test]
    fn options_dpl_and_ist() {
        let mut opts = EntryOptions::present();
        opts.set_dpl(3).set_ist_index(1);
        assert_eq!((opts.0 >> 13) & 0b11, 3);
        assert_eq!(opts.0 & 0b111, 1);
        assert_ne!(opts.0 & (1 << 15), 0);
    }

    #[test]
    fn idt_entry_is_16_bytes() {
        assert_eq!(core::mem::size_of::<IdtEntry>(), 16);
        assert_eq!(
            core::mem::size_of::<InterruptDescriptorTable>(),
            16 * IDT_ENTRIES
        );
    }
}
