//! CPU descriptor table structures (GDT, IDT, TSS).

pub mod gdt;
pub mod idt;
