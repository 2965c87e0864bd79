//! GDT initialization: static table, selectors, and TSS setup.

use core::cell::UnsafeCell;

use crate::arch::x86_64::instructions::{load_data_segments, load_tss, set_cs};
use crate::arch::x86_64::structures::gdt::{
    Descriptor, GlobalDescriptorTable, SegmentSelector, TaskStateSegment,
};
use crate::sync::LazyLock;

/// Double-fault handler stack size (16 KiB).
const DOUBLE_FAULT_STACK_SIZE: usize = 16 * 1024;

/// IST slot used by the double-fault handler (1-indexed in the IDT).
pub const DOUBLE_FAULT_IST_INDEX: u8 = 1;

/// Dedicated stack for the double-fault handler.
#[repr(align(16))]
struct AlignedStack([u8; DOUBLE_FAULT_STACK_SIZE]);

static DOUBLE_FAULT_STACK: AlignedStack = AlignedStack([0; DOUBLE_FAULT_STACK_SIZE]);

/// `Sync` wrapper for the TSS.
///
/// The TSS is only written with interrupts disabled; the CPU reads it on
/// privilege transitions, which cannot race those writes.
#[repr(transparent)]
struct SyncUnsafeCell<T>(UnsafeCell<T>);

// SAFETY: Mutation is confined to interrupt-disabled sections.
unsafe impl<T> Sync for SyncUnsafeCell<T> {}

static TSS: LazyLock<SyncUnsafeCell<TaskStateSegment>> = LazyLock::new(|| {
    let mut tss = TaskStateSegment::new();
    // IST entries are 1-indexed in the IDT but 0-indexed in the TSS array.
    tss.interrupt_stack_table[(DOUBLE_FAULT_IST_INDEX - 1) as usize] = {
        let stack_start = &raw const DOUBLE_FAULT_STACK as u64;
        stack_start + DOUBLE_FAULT_STACK_SIZE as u64
    };
    SyncUnsafeCell(UnsafeCell::new(tss))
});

/// Cached selectors from GDT construction.
pub struct Selectors {
    /// Kernel code segment.
    pub kernel_code: SegmentSelector,
    /// Kernel data segment.
    pub kernel_data: SegmentSelector,
    /// User code segment.
    pub user_code: SegmentSelector,
    /// User data segment.
    pub user_data: SegmentSelector,
    /// TSS selector.
    pub tss: SegmentSelector,
}

static GDT: LazyLock<(GlobalDescriptorTable, Selectors)> = LazyLock::new(|| {
    let mut gdt = GlobalDescriptorTable::new();
    let kernel_code = gdt.append(Descriptor::kernel_code_segment());
    let kernel_data = gdt.append(Descriptor::kernel_data_segment());
    let user_data = gdt.append(Descriptor::user_data_segment());
    let user_code = gdt.append(Descriptor::user_code_segment());
    // SAFETY: The TSS is fully initialized by its LazyLock closure; the
    // descriptor only captures its address.
    let tss = gdt.append(Descriptor::tss_segment(unsafe { &*TSS.0.get() }));
    let selectors = Selectors {
        kernel_code,
        kernel_data,
        user_code,
        user_data,
        tss,
    };
    (gdt, selectors)
});

/// Builds and loads the GDT, reloads the segment registers, and loads TR.
///
/// # Safety
///
/// Must be called exactly once during early kernel initialization, with
/// interrupts disabled.
pub unsafe fn init() {
    let (gdt, selectors) = &*GDT;

    // SAFETY: The descriptors above are valid; the reloads match the table
    // layout (kernel code into CS, kernel data into DS/SS, TSS into TR).
    unsafe {
        gdt.load();
        set_cs(selectors.kernel_code);
        load_data_segments(selectors.kernel_data);
        load_tss(selectors.tss);
    }

    crate::kdebug!("GDT loaded, TR set");
}

/// Returns the cached segment selectors.
pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Updates RSP0 in the TSS (the ring 0 stack used on privilege switches).
///
/// # Safety
///
/// `rsp` must point to the top of a valid, mapped kernel stack, and
/// interrupts must be disabled across the call.
pub unsafe fn set_tss_rsp0(rsp: u64) {
    // SAFETY: per the function contract there is no concurrent access.
    unsafe {
        (*TSS.0.get()).privilege_stack_table[0] = rsp;
    }
}
