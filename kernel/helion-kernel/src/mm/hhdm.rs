//! Higher Half Direct Map (HHDM) global offset and address conversion.
//!
//! The boot loader maps all physical memory at a fixed virtual offset. This
//! module stores that offset globally so any code can convert between
//! physical and virtual addresses without threading the offset through
//! every call site.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::addr::{PhysAddr, VirtAddr};

/// Sentinel value for "not yet initialized".
const HHDM_UNINIT: u64 = u64::MAX;

/// Global HHDM offset, set once during early boot.
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(HHDM_UNINIT);

/// Initializes the global HHDM offset.
///
/// # Panics
///
/// Panics when called more than once.
pub fn init(offset: u64) {
    let prev =
        HHDM_OFFSET.compare_exchange(HHDM_UNINIT, offset, Ordering::Release, Ordering::Relaxed);
    assert!(prev.is_ok(), "HHDM: double init");
}

/// Returns the HHDM offset.
///
/// # Panics
///
/// Panics when called before [`init`].
#[inline]
pub fn offset() -> u64 {
    let val = HHDM_OFFSET.load(Ordering::Acquire);
    assert!(val != HHDM_UNINIT, "HHDM: accessed before init");
    val
}

/// Converts a physical address to its HHDM virtual address.
#[inline]
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new_truncate(phys.as_u64() + offset())
}

/// Converts an HHDM virtual address back to a physical address.
#[inline]
pub fn virt_to_phys(virt: VirtAddr) -> PhysAddr {
    PhysAddr::new(virt.as_u64() - offset())
}
