//! Lazy initialization primitive for `no_std`.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ops::Deref;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

/// A value initialized on first access.
///
/// `no_std` counterpart of `std::sync::LazyLock`, driven by an atomic state
/// machine. If two contexts race, one runs the initializer and the other
/// spins until the value is ready. The kernel builds with `panic = abort`,
/// so an initializer panic halts rather than leaving waiters spinning.
pub struct LazyLock<T, F = fn() -> T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
    init: UnsafeCell<Option<F>>,
}

// SAFETY: The state machine guarantees the value is fully written before any
// reader observes READY, and the initializer is consumed exactly once.
unsafe impl<T: Send + Sync, F: Send> Send for LazyLock<T, F> {}
unsafe impl<T: Send + Sync, F: Send> Sync for LazyLock<T, F> {}

impl<T, F: FnOnce() -> T> LazyLock<T, F> {
    /// Creates a new `LazyLock` with the given initializer.
    pub const fn new(init: F) -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
            init: UnsafeCell::new(Some(init)),
        }
    }

    fn force(&self) -> &T {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY means the value was fully written.
            return unsafe { (*self.value.get()).assume_init_ref() };
        }

        if self
            .state
            .compare_exchange(UNINIT, INITIALIZING, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            // SAFETY: We won the race; no other context touches `init`.
            let init = unsafe { (*self.init.get()).take().expect("initializer consumed") };
            let value = init();
            // SAFETY: Exclusive access while in INITIALIZING state.
            unsafe { (*self.value.get()).write(value) };
            self.state.store(READY, Ordering::Release);
        } else {
            while self.state.load(Ordering::Acquire) != READY {
                core::hint::spin_loop();
            }
        }

        // SAFETY: State is READY.
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

impl<T, F: FnOnce() -> T> Deref for LazyLock<T, F> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.force()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn initializes_on_first_access() {
        let lazy = LazyLock::new(|| 42);
        assert_eq!(*lazy, 42);
    }

    #[test]
    fn initializer_runs_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let lazy = LazyLock::new(|| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            "ready"
        });
        assert_eq!(*lazy, "ready");
        assert_eq!(*lazy, "ready");
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
