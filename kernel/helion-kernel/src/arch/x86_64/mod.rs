//! x86_64 architecture support: CPU structures, instructions, interrupt
//! controllers, and platform bring-up.

pub mod gdt;
pub mod idt;
pub mod instructions;
pub mod interrupts;
pub mod ioapic;
pub mod lapic;
pub mod pic;
pub mod pit;
#[cfg(target_os = "none")]
pub mod platform;
pub mod structures;

pub use instructions::{Port, halt_loop};

/// Early CPU initialization: GDT (with TSS) and IDT.
///
/// Runs before any memory management; interrupts stay disabled until
/// [`platform::init`] has the APICs configured.
pub fn cpu_init() {
    // SAFETY: Called once, early, with interrupts disabled.
    unsafe {
        gdt::init();
        idt::init();
    }
}
