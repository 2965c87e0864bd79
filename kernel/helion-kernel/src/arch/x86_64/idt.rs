//! IDT installation: exception handlers and IRQ stubs.

use crate::arch::x86_64::gdt;
use crate::arch::x86_64::instructions::{halt_loop, read_cs};
use crate::arch::x86_64::interrupts::{dispatch, vectors};
use crate::arch::x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame};
use crate::mm::paging::PageFaultErrorCode;
use crate::sync::LazyLock;

/// Reads CR2, the faulting address of the most recent page fault.
#[inline]
fn read_cr2() -> u64 {
    let value: u64;
    // SAFETY: reading CR2 has no side effects in ring 0.
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

// ---------------------------------------------------------------------------
// Exception handlers (vectors 0..32)
// ---------------------------------------------------------------------------

macro_rules! exception_handler {
    ($name:ident, $label:literal) => {
        extern "x86-interrupt" fn $name(frame: InterruptStackFrame) {
            panic!(
                "EXCEPTION: {} at {:#x}\n{:#x?}",
                $label, frame.instruction_pointer.as_u64(), frame
            );
        }
    };
}

macro_rules! exception_handler_with_code {
    ($name:ident, $label:literal) => {
        extern "x86-interrupt" fn $name(frame: InterruptStackFrame, error_code: u64) {
            panic!(
                "EXCEPTION: {} (error code {:#x}) at {:#x}\n{:#x?}",
                $label,
                error_code,
                frame.instruction_pointer.as_u64(),
                frame
            );
        }
    };
}

exception_handler!(divide_error, "divide error");
exception_handler!(debug_exception, "debug");
exception_handler!(nmi, "non-maskable interrupt");
exception_handler!(overflow, "overflow");
exception_handler!(bound_range, "bound range exceeded");
exception_handler!(invalid_opcode, "invalid opcode");
exception_handler!(device_not_available, "device not available");
exception_handler!(x87_floating_point, "x87 floating point");
exception_handler!(simd_floating_point, "SIMD floating point");
exception_handler!(machine_check, "machine check");
exception_handler!(unhandled_exception, "unhandled exception");

exception_handler_with_code!(invalid_tss, "invalid TSS");
exception_handler_with_code!(segment_not_present, "segment not present");
exception_handler_with_code!(stack_segment_fault, "stack-segment fault");
exception_handler_with_code!(general_protection, "general protection fault");
exception_handler_with_code!(alignment_check, "alignment check");

/// Breakpoints log and continue; everything else is fatal.
extern "x86-interrupt" fn breakpoint(frame: InterruptStackFrame) {
    crate::kwarn!("breakpoint at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn page_fault(frame: InterruptStackFrame, error_code: u64) {
    let code = PageFaultErrorCode::from_bits_truncate(error_code);
    panic!(
        "EXCEPTION: page fault accessing {:#x} ({:?}) at {:#x}",
        read_cr2(),
        code,
        frame.instruction_pointer.as_u64()
    );
}

extern "x86-interrupt" fn double_fault(frame: InterruptStackFrame, error_code: u64) -> ! {
    // The double-fault stub runs on its own IST stack, so this still works
    // after a kernel stack overflow.
    crate::kerr!(
        "DOUBLE FAULT (error code {:#x}) at {:#x}",
        error_code,
        frame.instruction_pointer.as_u64()
    );
    halt_loop();
}

/// LAPIC spurious vector: acknowledged implicitly, no EOI.
extern "x86-interrupt" fn spurious(_frame: InterruptStackFrame) {}

// ---------------------------------------------------------------------------
// IRQ stubs (vectors 32..64)
// ---------------------------------------------------------------------------

/// Generates an `extern "x86-interrupt"` stub forwarding to [`dispatch`].
macro_rules! irq_stub {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
            dispatch($vector);
        }
    };
}

irq_stub!(irq_32, 32);
irq_stub!(irq_33, 33);
irq_stub!(irq_34, 34);
irq_stub!(irq_35, 35);
irq_stub!(irq_36, 36);
irq_stub!(irq_37, 37);
irq_stub!(irq_38, 38);
irq_stub!(irq_39, 39);
irq_stub!(irq_40, 40);
irq_stub!(irq_41, 41);
irq_stub!(irq_42, 42);
irq_stub!(irq_43, 43);
irq_stub!(irq_44, 44);
irq_stub!(irq_45, 45);
irq_stub!(irq_46, 46);
irq_stub!(irq_47, 47);
irq_stub!(irq_48, 48);
irq_stub!(irq_49, 49);
irq_stub!(irq_50, 50);
irq_stub!(irq_51, 51);
irq_stub!(irq_52, 52);
irq_stub!(irq_53, 53);
irq_stub!(irq_54, 54);
irq_stub!(irq_55, 55);
irq_stub!(irq_56, 56);
irq_stub!(irq_57, 57);
irq_stub!(irq_58, 58);
irq_stub!(irq_59, 59);
irq_stub!(irq_60, 60);
irq_stub!(irq_61, 61);
irq_stub!(irq_62, 62);
irq_stub!(irq_63, 63);

/// Stubs for the dispatchable range, indexed by `vector - 32`.
const IRQ_STUBS: [extern "x86-interrupt" fn(InterruptStackFrame); 32] = [
    irq_32, irq_33, irq_34, irq_35, irq_36, irq_37, irq_38, irq_39, irq_40, irq_41, irq_42,
    irq_43, irq_44, irq_45, irq_46, irq_47, irq_48, irq_49, irq_50, irq_51, irq_52, irq_53,
    irq_54, irq_55, irq_56, irq_57, irq_58, irq_59, irq_60, irq_61, irq_62, irq_63,
];

// ---------------------------------------------------------------------------
// Static IDT
// ---------------------------------------------------------------------------

static IDT: LazyLock<InterruptDescriptorTable> = LazyLock::new(|| {
    let mut idt = InterruptDescriptorTable::new();
    let cs = read_cs();

    idt.entries[0].set_handler(divide_error, cs);
    idt.entries[1].set_handler(debug_exception, cs);
    idt.entries[2].set_handler(nmi, cs);
    idt.entries[3].set_handler(breakpoint, cs);
    idt.entries[4].set_handler(overflow, cs);
    idt.entries[5].set_handler(bound_range, cs);
    idt.entries[6].set_handler(invalid_opcode, cs);
    idt.entries[7].set_handler(device_not_available, cs);
    idt.entries[8]
        .set_diverging_handler_with_err_code(double_fault, cs)
        .set_ist_index(gdt::DOUBLE_FAULT_IST_INDEX);
    idt.entries[10].set_handler_with_err_code(invalid_tss, cs);
    idt.entries[11].set_handler_with_err_code(segment_not_present, cs);
    idt.entries[12].set_handler_with_err_code(stack_segment_fault, cs);
    idt.entries[13].set_handler_with_err_code(general_protection, cs);
    idt.entries[14].set_handler_with_err_code(page_fault, cs);
    idt.entries[16].set_handler(x87_floating_point, cs);
    idt.entries[17].set_handler_with_err_code(alignment_check, cs);
    idt.entries[18].set_handler(machine_check, cs);
    idt.entries[19].set_handler(simd_floating_point, cs);

    // Remaining reserved exception vectors get a generic fatal handler.
    for vector in [9, 15, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31] {
        idt.entries[vector].set_handler(unhandled_exception, cs);
    }

    // Legacy IRQ range and the MSI window forward into the dispatcher.
    for (i, &stub) in IRQ_STUBS.iter().enumerate() {
        idt.entries[usize::from(vectors::IRQ_BASE) + i].set_handler(stub, cs);
    }

    idt.entries[usize::from(vectors::SPURIOUS)].set_handler(spurious, cs);

    idt
});

/// Loads the IDT.
///
/// # Safety
///
/// Must be called once during early initialization, after the GDT is
/// loaded (the gates capture the current CS).
pub unsafe fn init() {
    // SAFETY: the table is static and its gates are valid.
    unsafe { IDT.load() };
    crate::kdebug!("IDT loaded ({} gates)", crate::arch::x86_64::structures::idt::IDT_ENTRIES);
}
