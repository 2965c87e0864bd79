//! Tagged kernel heap.
//!
//! Every allocation is preceded by a guarded [`BlockHeader`] recording the
//! requested size, effective alignment, and the sub-allocator that owns the
//! block. Three sub-allocators sit underneath:
//!
//! - [`slab`]: size classes 16..2048 for small objects,
//! - [`buddy`]: power-of-two blocks for everything larger,
//! - [`dma`]: physically contiguous sub-4 GiB memory for device buffers.
//!
//! The tag in the header picks the freeing allocator, so callers never pass
//! it back. Guard corruption and frees of foreign pointers are fatal.

pub mod buddy;
pub mod dma;
pub mod slab;

use crate::mm::pmm::Frame;

use buddy::BuddyAllocator;
use dma::DmaAllocator;
use slab::SlabAllocator;

/// Guard value stamped before and after the header fields.
pub const GUARD: u64 = 0xDEAD_BEEF_CAFE_BABE;

/// Minimum (and default) allocation alignment.
pub const MIN_ALIGN: usize = 16;

/// Which sub-allocator serves (and frees) a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeapTag {
    /// Small-object slab classes.
    Slab = 0,
    /// Buddy allocator for large blocks.
    Buddy = 1,
    /// Physically contiguous DMA memory below 4 GiB.
    Dma = 2,
    /// General-purpose alias routed to the buddy allocator.
    Safe = 3,
}

impl HeapTag {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Slab),
            1 => Some(Self::Buddy),
            2 => Some(Self::Dma),
            3 => Some(Self::Safe),
            _ => None,
        }
    }
}

/// Header preceding every heap allocation.
#[repr(C)]
struct BlockHeader {
    guard_front: u64,
    /// Requested payload size in bytes.
    size: u32,
    /// Effective alignment; power of two, at least 16.
    align: u16,
    /// The owning sub-allocator.
    tag: u8,
    _reserved: u8,
    guard_back: u64,
}

/// Header size. The payload follows at `align_up(HEADER_SIZE, align)` from
/// the block base, so the header always sits directly before the payload.
const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Effective alignment for a request: power of two, at least [`MIN_ALIGN`].
#[inline]
fn effective_align(align: usize) -> usize {
    align.max(MIN_ALIGN).next_power_of_two()
}

/// Offset of the payload from the block base.
#[inline]
fn payload_offset(align: usize) -> usize {
    align_up(HEADER_SIZE, align)
}

/// Total block size requested from a sub-allocator.
#[inline]
fn block_total(size: usize, align: usize) -> usize {
    align_up(payload_offset(align) + size, align)
}

/// The tagged heap state: the three sub-allocators.
pub struct TaggedHeap {
    slab: SlabAllocator,
    buddy: BuddyAllocator,
    dma: DmaAllocator,
}

impl TaggedHeap {
    /// Creates an empty heap; the sub-allocators are seeded by the caller.
    pub const fn new() -> Self {
        Self {
            slab: SlabAllocator::new(),
            buddy: BuddyAllocator::new(),
            dma: DmaAllocator::new(),
        }
    }

    /// Seeds the buddy region.
    ///
    /// # Safety
    ///
    /// See [`BuddyAllocator::init`].
    pub unsafe fn init_buddy(&mut self, base_virt: usize, length: usize) {
        // SAFETY: forwarded contract.
        unsafe { self.buddy.init(base_virt, length) };
    }

    /// Seeds the DMA region.
    ///
    /// # Safety
    ///
    /// See [`DmaAllocator::init`].
    pub unsafe fn init_dma(&mut self, base_virt: usize, base_phys: u64, length: usize) {
        // SAFETY: forwarded contract.
        unsafe { self.dma.init(base_virt, base_phys, length) };
    }

    /// Allocates `size` bytes with the given alignment from the tagged
    /// sub-allocator. Returns null on exhaustion.
    ///
    /// Slab requests that the slab cannot serve (alignment above 16 or
    /// totals above the largest class) fall through to the buddy allocator;
    /// the header records the allocator that actually owns the block.
    pub fn alloc(
        &mut self,
        size: usize,
        align: usize,
        tag: HeapTag,
        page_alloc: &mut impl FnMut() -> Option<Frame>,
    ) -> *mut u8 {
        let align = effective_align(align);
        let offset = payload_offset(align);
        let total = block_total(size, align);

        let (block, effective_tag) = match tag {
            HeapTag::Slab if align <= MIN_ALIGN && total <= SlabAllocator::max_size() => {
                match self.slab.allocate(total, page_alloc) {
                    Some(block) => (block, HeapTag::Slab),
                    None => return core::ptr::null_mut(),
                }
            }
            HeapTag::Slab | HeapTag::Buddy | HeapTag::Safe => {
                match self.buddy.allocate(total, align) {
                    Some(block) => (block, HeapTag::Buddy),
                    None => return core::ptr::null_mut(),
                }
            }
            HeapTag::Dma => match self.dma.allocate(total, align) {
                Some(block) => (block, HeapTag::Dma),
                None => return core::ptr::null_mut(),
            },
        };

        // SAFETY: the sub-allocator handed us `total` bytes at `block`;
        // offset + size <= total by construction.
        let payload = unsafe { block.add(offset) };
        let header = Self::header_ptr(payload);
        // SAFETY: the header slot lies inside the block, before the payload.
        unsafe {
            header.write(BlockHeader {
                guard_front: GUARD,
                size: size as u32,
                align: align as u16,
                tag: effective_tag as u8,
                _reserved: 0,
                guard_back: GUARD,
            });
        }
        payload
    }

    /// Returns the header slot for a payload pointer.
    #[inline]
    fn header_ptr(payload: *mut u8) -> *mut BlockHeader {
        // The payload is at least MIN_ALIGN aligned and the header directly
        // precedes it.
        unsafe { payload.sub(HEADER_SIZE).cast::<BlockHeader>() }
    }

    /// Reads and validates the header of `ptr`.
    ///
    /// # Panics
    ///
    /// Panics on guard corruption or an unknown tag: the heap cannot trust
    /// any of the header fields, so continuing would free through garbage.
    fn checked_header(ptr: *mut u8) -> (usize, usize, HeapTag) {
        let header = Self::header_ptr(ptr);
        // SAFETY: every heap payload carries a header directly before it;
        // corruption is caught by the guard comparison below.
        let (guard_front, size, align, tag, guard_back) = unsafe {
            (
                (*header).guard_front,
                (*header).size as usize,
                (*header).align as usize,
                (*header).tag,
                (*header).guard_back,
            )
        };

        if guard_front != GUARD || guard_back != GUARD {
            panic!("heap: guard corrupted at {:p}", ptr);
        }
        let Some(tag) = HeapTag::from_u8(tag) else {
            panic!("heap: invalid tag at {:p}", ptr);
        };
        (size, align, tag)
    }

    /// Frees a heap allocation. Null is a no-op.
    ///
    /// # Panics
    ///
    /// Panics on guard corruption or when no sub-allocator owns `ptr`.
    pub fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let (size, align, tag) = Self::checked_header(ptr);
        let offset = payload_offset(align);
        let total = block_total(size, align);
        // SAFETY: offset matches the one used at allocation time.
        let block = unsafe { ptr.sub(offset) };

        let freed = match tag {
            HeapTag::Slab => self.slab.deallocate(block),
            HeapTag::Buddy | HeapTag::Safe => self.buddy.deallocate(block, total, align),
            HeapTag::Dma => self.dma.deallocate(block, total, align),
        };
        if !freed {
            panic!("heap: free of unowned pointer {:p}", ptr);
        }
    }

    /// Resizes an allocation.
    ///
    /// `realloc(null, n)` allocates; `realloc(ptr, 0)` frees and returns
    /// null; shrinking returns the same pointer; growing allocates with the
    /// original alignment and tag, copies the old payload, and frees.
    pub fn realloc(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
        page_alloc: &mut impl FnMut() -> Option<Frame>,
    ) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(new_size, MIN_ALIGN, HeapTag::Slab, page_alloc);
        }
        if new_size == 0 {
            self.free(ptr);
            return core::ptr::null_mut();
        }

        let (size, align, tag) = Self::checked_header(ptr);
        if new_size <= size {
            return ptr;
        }

        let new_ptr = self.alloc(new_size, align, tag, page_alloc);
        if new_ptr.is_null() {
            return core::ptr::null_mut();
        }
        // SAFETY: both blocks are live and at least `size` bytes long.
        unsafe { core::ptr::copy_nonoverlapping(ptr, new_ptr, size) };
        self.free(ptr);
        new_ptr
    }

    /// Allocates DMA memory and returns its physical address alongside.
    pub fn alloc_dma(
        &mut self,
        size: usize,
        align: usize,
        page_alloc: &mut impl FnMut() -> Option<Frame>,
    ) -> Option<(*mut u8, crate::addr::PhysAddr)> {
        let ptr = self.alloc(size, align, HeapTag::Dma, page_alloc);
        if ptr.is_null() {
            return None;
        }
        let phys = self
            .dma
            .virt_to_phys(ptr as usize)
            .expect("DMA allocation outside the DMA region");
        Some((ptr, phys))
    }

    /// Translates a pointer inside the DMA region to its physical address.
    pub fn dma_virt_to_phys(&self, ptr: *const u8) -> Option<crate::addr::PhysAddr> {
        self.dma.virt_to_phys(ptr as usize)
    }
}

// ---------------------------------------------------------------------------
// Kernel-side global heap and GlobalAlloc
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
mod global {
    use super::{HeapTag, MIN_ALIGN, TaggedHeap, slab::SlabAllocator};
    use crate::addr::{PhysAddr, VirtAddr};
    use crate::mm::PAGE_SIZE;
    use crate::mm::heap::buddy::MAX_ORDER;
    use crate::mm::pmm::{self, Frame};
    use crate::sync::SpinLock;
    use core::alloc::{GlobalAlloc, Layout};

    /// Buddy region size: 16 MiB.
    const BUDDY_PAGES: usize = 4096;

    /// DMA region size: 2 MiB.
    const DMA_PAGES: usize = 512;

    /// DMA memory must stay below 4 GiB.
    const DMA_CEILING: u64 = 0x1_0000_0000;

    static HEAP: SpinLock<Option<TaggedHeap>> = SpinLock::new(None);

    fn page_source() -> Option<Frame> {
        pmm::with_pmm(|pmm| pmm.alloc_page())
    }

    /// Initializes the global heap: seeds the buddy and DMA regions from
    /// the PMM.
    ///
    /// # Panics
    ///
    /// Panics on double init or when the backing regions cannot be
    /// allocated.
    pub fn init() {
        let buddy_region = pmm::with_pmm(|pmm| {
            pmm.alloc_contiguous(BUDDY_PAGES, (PAGE_SIZE << MAX_ORDER) as u64, 0)
        })
        .expect("heap: no contiguous region for the buddy allocator");

        let dma_region = pmm::with_pmm(|pmm| {
            pmm.alloc_contiguous(DMA_PAGES, PAGE_SIZE as u64, DMA_CEILING)
        })
        .expect("heap: no sub-4GiB region for the DMA allocator");

        let mut heap = TaggedHeap::new();
        // SAFETY: both regions were just allocated, are exclusively ours,
        // and are HHDM-mapped; the DMA region is below 4 GiB.
        unsafe {
            heap.init_buddy(buddy_region.virt.as_u64() as usize, BUDDY_PAGES * PAGE_SIZE);
            heap.init_dma(
                dma_region.virt.as_u64() as usize,
                dma_region.phys.as_u64(),
                DMA_PAGES * PAGE_SIZE,
            );
        }

        let mut guard = HEAP.lock();
        assert!(guard.is_none(), "heap: double init");
        *guard = Some(heap);
    }

    fn with_heap<R>(f: impl FnOnce(&mut TaggedHeap) -> R) -> R {
        let mut guard = HEAP.lock();
        f(guard.as_mut().expect("heap not initialized"))
    }

    /// Allocates from the tagged heap. Null on exhaustion.
    pub fn alloc(size: usize, align: usize, tag: HeapTag) -> *mut u8 {
        with_heap(|heap| heap.alloc(size, align, tag, &mut page_source))
    }

    /// Frees a tagged-heap pointer. Panics on corruption.
    pub fn free(ptr: *mut u8) {
        with_heap(|heap| heap.free(ptr));
    }

    /// Resizes a tagged-heap allocation.
    pub fn realloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
        with_heap(|heap| heap.realloc(ptr, new_size, &mut page_source))
    }

    /// Allocates device-visible memory: physically contiguous, below
    /// 4 GiB, aligned to at least 64 bytes.
    pub fn alloc_dma(size: usize, align: usize) -> Option<(VirtAddr, PhysAddr)> {
        with_heap(|heap| {
            heap.alloc_dma(size, align, &mut page_source).map(|(ptr, phys)| {
                (VirtAddr::new_truncate(ptr as u64), phys)
            })
        })
    }

    /// Physical address of a DMA-heap pointer.
    pub fn dma_virt_to_phys(virt: VirtAddr) -> Option<PhysAddr> {
        with_heap(|heap| heap.dma_virt_to_phys(virt.as_ptr()))
    }

    /// Routes Rust's container allocations into the tagged heap.
    pub struct KernelAllocator;

    unsafe impl GlobalAlloc for KernelAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let tag = if layout.align() <= MIN_ALIGN && layout.size() <= SlabAllocator::max_size()
            {
                HeapTag::Slab
            } else {
                HeapTag::Buddy
            };
            alloc(layout.size(), layout.align(), tag)
        }

        unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
            free(ptr);
        }
    }

    /// The kernel's global allocator.
    #[global_allocator]
    static KERNEL_ALLOCATOR: KernelAllocator = KernelAllocator;
}

#[cfg(target_os = "none")]
pub use global::{alloc, alloc_dma, dma_virt_to_phys, free, init, realloc};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{PhysAddr, VirtAddr};
    use crate::mm::PAGE_SIZE;
    use core::alloc::Layout;

    /// Backing memory for a test heap: slab pages, a buddy region, and a
    /// DMA region, all from the host allocator.
    struct TestHeap {
        heap: TaggedHeap,
        pages: Vec<*mut u8>,
        regions: Vec<(*mut u8, Layout)>,
    }

    const BUDDY_BYTES: usize = 64 * PAGE_SIZE;
    const DMA_BYTES: usize = 16 * PAGE_SIZE;
    const DMA_FAKE_PHYS: u64 = 0x200_0000;

    impl TestHeap {
        fn new() -> Self {
            let mut heap = TaggedHeap::new();
            let mut regions = Vec::new();

            let buddy_layout = Layout::from_size_align(BUDDY_BYTES, PAGE_SIZE).unwrap();
            // SAFETY: valid non-zero layout.
            let buddy_buf = unsafe { std::alloc::alloc_zeroed(buddy_layout) };
            assert!(!buddy_buf.is_null());
            regions.push((buddy_buf, buddy_layout));
            // SAFETY: region exclusively owned.
            unsafe { heap.init_buddy(buddy_buf as usize, BUDDY_BYTES) };

            let dma_layout = Layout::from_size_align(DMA_BYTES, PAGE_SIZE).unwrap();
            // SAFETY: valid non-zero layout.
            let dma_buf = unsafe { std::alloc::alloc_zeroed(dma_layout) };
            assert!(!dma_buf.is_null());
            regions.push((dma_buf, dma_layout));
            // SAFETY: region exclusively owned.
            unsafe { heap.init_dma(dma_buf as usize, DMA_FAKE_PHYS, DMA_BYTES) };

            Self {
                heap,
                pages: Vec::new(),
                regions,
            }
        }

        fn alloc(&mut self, size: usize, align: usize, tag: HeapTag) -> *mut u8 {
            let pages = &mut self.pages;
            self.heap.alloc(size, align, tag, &mut || {
                let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
                // SAFETY: valid non-zero layout.
                let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
                assert!(!ptr.is_null());
                pages.push(ptr);
                Some(Frame {
                    phys: PhysAddr::new(ptr as u64),
                    virt: VirtAddr::new_truncate(ptr as u64),
                })
            })
        }

        fn free(&mut self, ptr: *mut u8) {
            self.heap.free(ptr);
        }

        fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
            let pages = &mut self.pages;
            self.heap.realloc(ptr, new_size, &mut || {
                let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
                // SAFETY: valid non-zero layout.
                let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
                assert!(!ptr.is_null());
                pages.push(ptr);
                Some(Frame {
                    phys: PhysAddr::new(ptr as u64),
                    virt: VirtAddr::new_truncate(ptr as u64),
                })
            })
        }
    }

    impl Drop for TestHeap {
        fn drop(&mut self) {
            let page_layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
            for &page in &self.pages {
                // SAFETY: allocated with page_layout.
                unsafe { std::alloc::dealloc(page, page_layout) };
            }
            for &(buf, layout) in &self.regions {
                // SAFETY: allocated with the stored layout.
                unsafe { std::alloc::dealloc(buf, layout) };
            }
        }
    }

    #[test]
    fn alloc_writes_intact_guards_and_aligns() {
        let mut th = TestHeap::new();
        for (size, align, tag) in [
            (16usize, 16usize, HeapTag::Slab),
            (100, 16, HeapTag::Slab),
            (4096, 16, HeapTag::Buddy),
            (64, 64, HeapTag::Dma),
            (300, 256, HeapTag::Buddy),
        ] {
            let p = th.alloc(size, align, tag);
            assert!(!p.is_null(), "{size}/{align}/{tag:?} failed");
            assert_eq!(p as usize % align, 0, "misaligned for align {align}");

            // The payload is fully writable and readable.
            // SAFETY: p points at `size` usable bytes.
            unsafe {
                core::ptr::write_bytes(p, 0x5A, size);
                assert_eq!(p.read(), 0x5A);
                assert_eq!(p.add(size - 1).read(), 0x5A);
            }

            // Guards sit directly before the payload.
            // SAFETY: the header precedes the payload.
            unsafe {
                let guard_back = p.sub(8).cast::<u64>().read();
                let guard_front = p.sub(HEADER_SIZE).cast::<u64>().read();
                assert_eq!(guard_front, GUARD);
                assert_eq!(guard_back, GUARD);
            }
            th.free(p);
        }
    }

    #[test]
    fn free_makes_capacity_reusable() {
        let mut th = TestHeap::new();
        // Slab-class sizes: free(alloc(n)) returns the slot.
        let a = th.alloc(32, 16, HeapTag::Slab);
        th.free(a);
        let b = th.alloc(32, 16, HeapTag::Slab);
        assert_eq!(a, b);
        th.free(b);
    }

    #[test]
    fn slab_overflow_falls_through_to_buddy() {
        let mut th = TestHeap::new();
        // Larger than any slab class: served by the buddy allocator, and
        // the header must route the free there too.
        let p = th.alloc(8192, 16, HeapTag::Slab);
        assert!(!p.is_null());
        th.free(p);
    }

    #[test]
    #[should_panic(expected = "guard corrupted")]
    fn corrupted_guard_panics_on_free() {
        let mut th = TestHeap::new();
        let p = th.alloc(16, 16, HeapTag::Slab);
        // SAFETY: deliberately smashing the back guard.
        unsafe { p.sub(8).cast::<u64>().write(0xDEAD) };
        th.free(p);
    }

    #[test]
    fn realloc_null_allocates() {
        let mut th = TestHeap::new();
        let p = th.realloc(core::ptr::null_mut(), 48);
        assert!(!p.is_null());
        th.free(p);
    }

    #[test]
    fn realloc_zero_frees() {
        let mut th = TestHeap::new();
        let p = th.alloc(48, 16, HeapTag::Slab);
        assert!(th.realloc(p, 0).is_null());
    }

    #[test]
    fn realloc_shrink_keeps_pointer() {
        let mut th = TestHeap::new();
        let p = th.alloc(128, 16, HeapTag::Slab);
        assert_eq!(th.realloc(p, 64), p);
        th.free(p);
    }

    #[test]
    fn realloc_grow_copies_payload() {
        let mut th = TestHeap::new();
        let p = th.alloc(64, 16, HeapTag::Slab);
        // SAFETY: 64 writable bytes.
        unsafe { core::ptr::write_bytes(p, 0x7E, 64) };

        let q = th.realloc(p, 4096);
        assert!(!q.is_null());
        assert_ne!(p, q);
        // SAFETY: q holds at least the old payload.
        unsafe {
            assert_eq!(q.read(), 0x7E);
            assert_eq!(q.add(63).read(), 0x7E);
        }
        th.free(q);
    }

    #[test]
    fn dma_alloc_returns_matching_phys() {
        let mut th = TestHeap::new();
        let pages = &mut th.pages;
        let (ptr, phys) = th
            .heap
            .alloc_dma(256, 64, &mut || {
                let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
                // SAFETY: valid non-zero layout.
                let p = unsafe { std::alloc::alloc_zeroed(layout) };
                pages.push(p);
                Some(Frame {
                    phys: PhysAddr::new(p as u64),
                    virt: VirtAddr::new_truncate(p as u64),
                })
            })
            .expect("DMA capacity available");
        // phys mirrors the offset inside the fake DMA region.
        let expected = DMA_FAKE_PHYS + (ptr as u64 - th.regions[1].0 as u64);
        assert_eq!(phys.as_u64(), expected);
        th.free(ptr);
    }

    #[test]
    fn exhaustion_returns_null_not_panic() {
        let mut th = TestHeap::new();
        // The DMA region is 16 pages; a larger request must fail cleanly.
        let p = th.alloc(32 * PAGE_SIZE, 64, HeapTag::Dma);
        assert!(p.is_null());
    }
}
