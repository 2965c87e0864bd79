//! Hardware interrupt dispatch.
//!
//! IRQ stubs installed in the IDT forward to a vector-indexed handler
//! table. Drivers register plain functions against a vector; the dispatcher
//! runs the handler and signals EOI to the local APIC.

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Well-known interrupt vectors.
pub mod vectors {
    /// LAPIC timer tick (also the remapped legacy IRQ0 line, which stays
    /// masked once the LAPIC timer runs).
    pub const TIMER: u8 = 32;
    /// First vector of the legacy IRQ range (32..48).
    pub const IRQ_BASE: u8 = 32;
    /// First vector handed out for message-signaled interrupts.
    pub const MSI_BASE: u8 = 48;
    /// One past the last dispatchable vector.
    pub const DISPATCH_END: u8 = 64;
    /// LAPIC spurious-interrupt vector.
    pub const SPURIOUS: u8 = 0xFF;
}

/// A registered IRQ handler. Receives the vector that fired.
pub type IrqHandler = fn(u8);

/// Number of dispatchable vectors (32..64).
const DISPATCH_SLOTS: usize = (vectors::DISPATCH_END - vectors::IRQ_BASE) as usize;

/// Handler table indexed by `vector - IRQ_BASE`. Stored as function
/// addresses so installation is lock-free and ISR-safe.
static HANDLERS: [AtomicUsize; DISPATCH_SLOTS] =
    [const { AtomicUsize::new(0) }; DISPATCH_SLOTS];

/// Next MSI vector to hand out.
static NEXT_MSI_VECTOR: AtomicU8 = AtomicU8::new(vectors::MSI_BASE);

/// Errors from handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqError {
    /// The vector is outside the dispatchable range.
    BadVector,
    /// Another handler already owns the vector.
    AlreadyRegistered,
    /// All MSI vectors are taken.
    Exhausted,
}

/// Registers `handler` for `vector`.
pub fn register_handler(vector: u8, handler: IrqHandler) -> Result<(), IrqError> {
    if !(vectors::IRQ_BASE..vectors::DISPATCH_END).contains(&vector) {
        return Err(IrqError::BadVector);
    }
    let slot = &HANDLERS[(vector - vectors::IRQ_BASE) as usize];
    if slot
        .compare_exchange(0, handler as usize, Ordering::AcqRel, Ordering::Relaxed)
        .is_err()
    {
        return Err(IrqError::AlreadyRegistered);
    }
    Ok(())
}

/// Allocates a fresh vector in the MSI range (48..64).
pub fn allocate_msi_vector() -> Result<u8, IrqError> {
    let vector = NEXT_MSI_VECTOR.fetch_add(1, Ordering::Relaxed);
    if vector >= vectors::DISPATCH_END {
        NEXT_MSI_VECTOR.store(vectors::DISPATCH_END, Ordering::Relaxed);
        return Err(IrqError::Exhausted);
    }
    Ok(vector)
}

/// Runs the handler registered for `vector`, then signals EOI.
///
/// Called from the IDT stubs. Unhandled vectors still get an EOI so the
/// LAPIC does not wedge its ISR stack.
pub fn dispatch(vector: u8) {
    if (vectors::IRQ_BASE..vectors::DISPATCH_END).contains(&vector) {
        let raw = HANDLERS[(vector - vectors::IRQ_BASE) as usize].load(Ordering::Acquire);
        if raw != 0 {
            // SAFETY: only valid IrqHandler addresses are stored.
            let handler: IrqHandler = unsafe { core::mem::transmute(raw) };
            handler(vector);
        } else {
            crate::kdebug!("irq: spurious vector {} (no handler)", vector);
        }
    }

    #[cfg(target_os = "none")]
    crate::arch::x86_64::platform::send_lapic_eoi();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn register_and_dispatch() {
        static FIRED: AtomicU32 = AtomicU32::new(0);
        fn handler(vector: u8) {
            FIRED.store(u32::from(vector), Ordering::SeqCst);
        }

        register_handler(45, handler).unwrap();
        dispatch(45);
        assert_eq!(FIRED.load(Ordering::SeqCst), 45);
    }

    #[test]
    fn double_registration_rejected() {
        fn handler(_vector: u8) {}
        register_handler(46, handler).unwrap();
        assert_eq!(
            register_handler(46, handler),
            Err(IrqError::AlreadyRegistered)
        );
    }

    #[test]
    fn out_of_range_vector_rejected() {
        fn handler(_vector: u8) {}
        assert_eq!(register_handler(10, handler), Err(IrqError::BadVector));
        assert_eq!(register_handler(200, handler), Err(IrqError::BadVector));
    }

    #[test]
    fn msi_vectors_are_unique() {
        let a = allocate_msi_vector().unwrap();
        let b = allocate_msi_vector().unwrap();
        assert_ne!(a, b);
        assert!(a >= vectors::MSI_BASE && a < vectors::DISPATCH_END);
    }

    #[test]
    fn dispatch_without_handler_is_harmless() {
        dispatch(63);
    }
}
