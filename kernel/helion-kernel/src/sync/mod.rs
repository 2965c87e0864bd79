//! Synchronization primitives.
//!
//! The kernel is single-CPU and cooperative; these locks exist to guard
//! process-wide state against interrupt-handler reentrancy and to satisfy
//! `Sync` for `static` containers. [`IrqSpinLock`] additionally disables
//! local interrupts for the lifetime of its guard.

mod irq_spinlock;
mod lazy;
mod spinlock;

pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
pub use lazy::LazyLock;
pub use spinlock::{SpinLock, SpinLockGuard};
