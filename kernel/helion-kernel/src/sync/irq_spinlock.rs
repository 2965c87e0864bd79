//! Interrupt-safe spin lock.
//!
//! Disables local interrupts before acquiring the inner lock and restores
//! the previous interrupt state on release. Locks shared with interrupt
//! handlers must use this type; taking a plain [`SpinLock`](super::SpinLock)
//! in an interrupted critical section would deadlock.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A spin lock that disables interrupts while held.
pub struct IrqSpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: The atomic flag guarantees exclusive access to the inner value.
unsafe impl<T: Send> Send for IrqSpinLock<T> {}
unsafe impl<T: Send> Sync for IrqSpinLock<T> {}

impl<T> IrqSpinLock<T> {
    /// Creates a new unlocked `IrqSpinLock`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, disabling interrupts first.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let saved_if = save_flags_and_cli();

        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return IrqSpinLockGuard {
                    lock: self,
                    saved_if,
                    _not_send: PhantomData,
                };
            }
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let saved_if = save_flags_and_cli();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqSpinLockGuard {
                lock: self,
                saved_if,
                _not_send: PhantomData,
            })
        } else {
            restore_flags(saved_if);
            None
        }
    }
}

/// RAII guard that restores the saved interrupt state on drop.
///
/// `!Send`: the saved interrupt flag belongs to the CPU that took the lock.
pub struct IrqSpinLockGuard<'a, T> {
    lock: &'a IrqSpinLock<T>,
    saved_if: bool,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The lock is held, so we have exclusive access to the data.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The lock is held, so we have exclusive access to the data.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        restore_flags(self.saved_if);
    }
}

/// Saves whether interrupts were enabled, then disables them.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
fn save_flags_and_cli() -> bool {
    let flags: u64;
    // SAFETY: Reading RFLAGS and executing CLI is safe in ring 0.
    unsafe {
        core::arch::asm!(
            "pushfq",
            "pop {}",
            "cli",
            out(reg) flags,
            options(nomem),
        );
    }
    flags & (1 << 9) != 0
}

/// Re-enables interrupts if they were enabled when the lock was taken.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
fn restore_flags(was_enabled: bool) {
    if was_enabled {
        // SAFETY: Restoring a previously observed interrupt-enabled state.
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
        }
    }
}

#[cfg(not(target_os = "none"))]
#[inline]
fn save_flags_and_cli() -> bool {
    false
}

#[cfg(not(target_os = "none"))]
#[inline]
fn restore_flags(_was_enabled: bool) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_roundtrip() {
        let lock = IrqSpinLock::new(1u32);
        *lock.lock() = 2;
        assert_eq!(*lock.lock(), 2);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = IrqSpinLock::new(());
        let _guard = lock.lock();
        assert!(lock.try_lock().is_none());
    }
}
