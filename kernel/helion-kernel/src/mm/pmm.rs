//! Region-based physical frame allocator.
//!
//! Each usable firmware memory region carries its own allocation bitmap,
//! stored in the first page(s) of the region itself and accessed through the
//! HHDM. Bit `i` set means frame `i` of the region is allocated or reserved.
//! Regions are kept sorted ascending by physical start address; allocation
//! is linear first-fit across regions.

use noalloc::vec::ArrayVec;

use crate::addr::{PhysAddr, VirtAddr};
use crate::mm::{PAGE_SIZE, PmmError};

/// Maximum number of usable regions tracked.
const MAX_REGIONS: usize = 64;

/// A 4 KiB physical frame paired with its HHDM-resident virtual alias.
///
/// The pair is constructed by the allocator, so `virt == hhdm + phys` holds
/// by construction and callers never convert addresses by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Physical address of the first byte of the frame run.
    pub phys: PhysAddr,
    /// HHDM-resident virtual address of the same byte.
    pub virt: VirtAddr,
}

/// A descriptor for one physical memory range from the firmware map.
#[derive(Debug, Clone, Copy)]
pub struct PhysRegionDesc {
    /// Physical start address.
    pub start: PhysAddr,
    /// Size in bytes.
    pub size: u64,
    /// Whether the range is usable RAM.
    pub usable: bool,
}

/// One usable region and its bitmap.
struct Region {
    phys_start: PhysAddr,
    phys_end: PhysAddr,
    page_count: usize,
    /// Bitmap words, living inside the region's own first page(s).
    bitmap: &'static mut [u64],
}

impl Region {
    #[inline]
    fn word_and_bit(index: usize) -> (usize, u64) {
        (index / 64, 1u64 << (index % 64))
    }

    #[inline]
    fn is_used(&self, index: usize) -> bool {
        let (word, bit) = Self::word_and_bit(index);
        self.bitmap[word] & bit != 0
    }

    #[inline]
    fn set_used(&mut self, index: usize) {
        let (word, bit) = Self::word_and_bit(index);
        self.bitmap[word] |= bit;
    }

    #[inline]
    fn clear_used(&mut self, index: usize) {
        let (word, bit) = Self::word_and_bit(index);
        self.bitmap[word] &= !bit;
    }

    #[inline]
    fn contains(&self, phys: PhysAddr) -> bool {
        phys >= self.phys_start && phys < self.phys_end
    }

    /// Finds the first free frame index, scanning word-at-a-time.
    fn first_free(&self) -> Option<usize> {
        for (word_idx, &word) in self.bitmap.iter().enumerate() {
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let index = word_idx * 64 + bit;
            if index < self.page_count {
                return Some(index);
            }
        }
        None
    }
}

/// The physical frame allocator.
///
/// Pure logic over an HHDM offset; the kernel-side global lives behind
/// [`with_pmm`]. Host tests construct one directly with a fabricated offset.
pub struct FrameAllocator {
    regions: ArrayVec<Region, MAX_REGIONS>,
    hhdm_offset: u64,
    total_usable_pages: usize,
    max_phys: PhysAddr,
}

impl FrameAllocator {
    /// Builds the allocator from the firmware memory map.
    ///
    /// For every usable descriptor a region is created whose bitmap lives in
    /// the region's own leading page(s); those pages are marked allocated
    /// before anything else can claim them. Regions end up sorted ascending
    /// by physical start.
    ///
    /// # Safety
    ///
    /// - `hhdm_offset` must map all of physical memory.
    /// - `memmap` must accurately describe RAM; usable ranges must not
    ///   overlap each other or anything in use.
    /// - Must be called exactly once per allocator over a given range.
    pub unsafe fn new(memmap: &[PhysRegionDesc], hhdm_offset: u64) -> Result<Self, PmmError> {
        let mut regions: ArrayVec<Region, MAX_REGIONS> = ArrayVec::new();
        let mut total_usable_pages = 0usize;
        let mut max_phys = PhysAddr::zero();

        for desc in memmap {
            if !desc.usable || desc.size < PAGE_SIZE as u64 {
                continue;
            }
            if regions.len() == MAX_REGIONS {
                crate::kwarn!("PMM: more than {} usable regions, ignoring rest", MAX_REGIONS);
                break;
            }

            let phys_start = desc.start.align_up(PAGE_SIZE as u64);
            let page_count = ((desc.size - (phys_start - desc.start)) / PAGE_SIZE as u64) as usize;
            if page_count == 0 {
                continue;
            }
            let phys_end = phys_start + (page_count * PAGE_SIZE) as u64;

            let bitmap_words = page_count.div_ceil(64);
            let bitmap_bytes = bitmap_words * 8;
            let bitmap_pages = bitmap_bytes.div_ceil(PAGE_SIZE);
            if bitmap_pages >= page_count {
                // A region too small to hold its own bitmap and still serve
                // allocations is not worth tracking.
                continue;
            }

            // SAFETY: The region is usable RAM covered by the HHDM, and per
            // the caller's contract nothing else references it yet.
            let bitmap = unsafe {
                core::slice::from_raw_parts_mut(
                    (hhdm_offset + phys_start.as_u64()) as *mut u64,
                    bitmap_words,
                )
            };
            bitmap.fill(0);

            let mut region = Region {
                phys_start,
                phys_end,
                page_count,
                bitmap,
            };

            // The bitmap's own pages are permanently allocated.
            for i in 0..bitmap_pages {
                region.set_used(i);
            }

            total_usable_pages += page_count;
            if phys_end > max_phys {
                max_phys = phys_end;
            }
            regions.push(region);
        }

        if regions.len() == 0 {
            return Err(PmmError::NoBitmapRegion);
        }

        regions
            .as_mut_slice()
            .sort_unstable_by_key(|r| r.phys_start);

        Ok(Self {
            regions,
            hhdm_offset,
            total_usable_pages,
            max_phys,
        })
    }

    /// Allocates a single 4 KiB frame, first-fit across regions.
    pub fn alloc_page(&mut self) -> Option<Frame> {
        for region in self.regions.iter_mut() {
            if let Some(index) = region.first_free() {
                region.set_used(index);
                let phys = region.phys_start + (index * PAGE_SIZE) as u64;
                let hhdm_offset = self.hhdm_offset;
                return Some(Frame {
                    phys,
                    virt: VirtAddr::new_truncate(hhdm_offset + phys.as_u64()),
                });
            }
        }
        None
    }

    /// Frees a single frame by physical address.
    ///
    /// Freeing an already-free frame is tolerated but logged; freeing an
    /// address outside every region returns an error.
    pub fn free_page(&mut self, phys: PhysAddr) -> Result<(), PmmError> {
        let phys = phys.align_down(PAGE_SIZE as u64);
        for region in self.regions.iter_mut() {
            if region.contains(phys) {
                let index = ((phys - region.phys_start) / PAGE_SIZE as u64) as usize;
                if !region.is_used(index) {
                    crate::kwarn!("PMM: double free of frame {}", phys);
                    return Ok(());
                }
                region.clear_used(index);
                return Ok(());
            }
        }
        Err(PmmError::InvalidFrame)
    }

    /// Allocates `pages` physically contiguous frames.
    ///
    /// The run's base satisfies `align` (raised to at least one page) and
    /// its end stays at or below `max_phys` when `max_phys` is nonzero.
    /// Used for DMA memory, which must additionally sit below 4 GiB.
    pub fn alloc_contiguous(
        &mut self,
        pages: usize,
        align: u64,
        max_phys: u64,
    ) -> Option<Frame> {
        if pages == 0 {
            return None;
        }
        let align = align.max(PAGE_SIZE as u64).next_power_of_two();
        let hhdm_offset = self.hhdm_offset;

        for region in self.regions.iter_mut() {
            if region.page_count < pages {
                continue;
            }
            if max_phys > 0 && region.phys_start.as_u64() >= max_phys {
                continue;
            }

            for start in 0..=(region.page_count - pages) {
                let phys = region.phys_start + (start * PAGE_SIZE) as u64;
                let end = phys.as_u64() + (pages * PAGE_SIZE) as u64;

                if max_phys > 0 && end > max_phys {
                    break;
                }
                if !phys.is_aligned(align) {
                    continue;
                }

                let mut all_free = true;
                for i in 0..pages {
                    if region.is_used(start + i) {
                        all_free = false;
                        break;
                    }
                }
                if !all_free {
                    continue;
                }

                for i in 0..pages {
                    region.set_used(start + i);
                }
                return Some(Frame {
                    phys,
                    virt: VirtAddr::new_truncate(hhdm_offset + phys.as_u64()),
                });
            }
        }
        None
    }

    /// Total usable pages across all regions (including bitmap pages).
    pub fn total_usable_pages(&self) -> usize {
        self.total_usable_pages
    }

    /// Highest physical address covered by any region.
    pub fn max_phys_addr(&self) -> PhysAddr {
        self.max_phys
    }

    /// Counts currently free frames. Linear; used for diagnostics only.
    pub fn free_pages(&self) -> usize {
        let mut free = 0;
        for region in self.regions.iter() {
            for i in 0..region.page_count {
                if !region.is_used(i) {
                    free += 1;
                }
            }
        }
        free
    }
}

// ---------------------------------------------------------------------------
// Kernel-side global
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
mod global {
    use super::{FrameAllocator, PhysRegionDesc};
    use crate::boot::{BootInfo, MemoryRegionKind};
    use crate::sync::SpinLock;
    use noalloc::vec::ArrayVec;

    /// Global physical memory manager.
    static PMM: SpinLock<Option<FrameAllocator>> = SpinLock::new(None);

    /// Initializes the PMM from boot info.
    ///
    /// # Panics
    ///
    /// Panics on double init or when no usable region exists.
    pub fn init(boot_info: &impl BootInfo) {
        let mut descs: ArrayVec<PhysRegionDesc, 256> = ArrayVec::new();
        for region in boot_info.memory_map() {
            if descs.len() == 256 {
                break;
            }
            descs.push(PhysRegionDesc {
                start: region.start,
                size: region.size,
                usable: region.kind == MemoryRegionKind::Usable,
            });
        }

        // SAFETY: The boot memory map is authoritative and the HHDM covers
        // all of physical RAM; called once during boot.
        let allocator = unsafe {
            FrameAllocator::new(descs.as_slice(), boot_info.hhdm_offset())
                .expect("PMM: no usable memory")
        };

        let mut pmm = PMM.lock();
        assert!(pmm.is_none(), "PMM: double init");
        *pmm = Some(allocator);
    }

    /// Runs a closure with exclusive access to the global PMM.
    ///
    /// # Panics
    ///
    /// Panics if the PMM has not been initialized.
    pub fn with_pmm<R>(f: impl FnOnce(&mut FrameAllocator) -> R) -> R {
        let mut pmm = PMM.lock();
        f(pmm.as_mut().expect("PMM not initialized"))
    }

    /// Late-boot memory report, once every allocator has taken its cut.
    fn report_memory() -> i32 {
        with_pmm(|pmm| {
            crate::kinfo!(
                "pmm: {} of {} pages free after init",
                pmm.free_pages(),
                pmm.total_usable_pages()
            );
        });
        0
    }

    crate::initcall!(Late, PMM_REPORT, "pmm-report", report_memory);
}

#[cfg(target_os = "none")]
pub use global::{init, with_pmm};

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;

    /// A fabricated physical space: one buffer, with `phys_base` mapped at
    /// its start so `hhdm_offset = buf - phys_base`.
    struct TestSpace {
        buf: *mut u8,
        layout: Layout,
        phys_base: u64,
    }

    impl TestSpace {
        fn new(phys_base: u64, bytes: usize) -> Self {
            let layout = Layout::from_size_align(bytes, PAGE_SIZE).unwrap();
            // SAFETY: layout is valid and non-zero.
            let buf = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!buf.is_null());
            Self {
                buf,
                layout,
                phys_base,
            }
        }

        fn hhdm_offset(&self) -> u64 {
            self.buf as u64 - self.phys_base
        }
    }

    impl Drop for TestSpace {
        fn drop(&mut self) {
            // SAFETY: allocated with the stored layout in `new`.
            unsafe { std::alloc::dealloc(self.buf, self.layout) };
        }
    }

    const REGION_BASE: u64 = 0x10_0000;

    fn single_region_allocator(pages: usize) -> (TestSpace, FrameAllocator) {
        let space = TestSpace::new(REGION_BASE, pages * PAGE_SIZE);
        let memmap = [PhysRegionDesc {
            start: PhysAddr::new(REGION_BASE),
            size: (pages * PAGE_SIZE) as u64,
            usable: true,
        }];
        // SAFETY: the fabricated HHDM offset maps the whole region into buf.
        let allocator = unsafe { FrameAllocator::new(&memmap, space.hhdm_offset()).unwrap() };
        (space, allocator)
    }

    #[test]
    fn sixteen_page_region_boundary() {
        let (_space, mut pmm) = single_region_allocator(16);

        // One page is consumed by the region's own bitmap.
        let mut frames = Vec::new();
        for _ in 0..15 {
            let frame = pmm.alloc_page().expect("region not exhausted yet");
            assert!(frame.phys.as_u64() >= REGION_BASE);
            assert!(frame.phys.as_u64() < REGION_BASE + 16 * PAGE_SIZE as u64);
            frames.push(frame);
        }
        assert_eq!(pmm.alloc_page(), None);

        // Free one and the next allocation succeeds again.
        pmm.free_page(frames[3].phys).unwrap();
        assert_eq!(pmm.alloc_page(), Some(frames[3]));
    }

    #[test]
    fn virt_is_hhdm_alias_of_phys() {
        let (space, mut pmm) = single_region_allocator(8);
        let frame = pmm.alloc_page().unwrap();
        assert_eq!(frame.virt.as_u64(), space.hhdm_offset() + frame.phys.as_u64());

        // The frame is writable through the alias.
        // SAFETY: the frame maps into the test buffer.
        unsafe {
            frame.virt.as_mut_ptr::<u64>().write(0xA5A5_A5A5_A5A5_A5A5);
            assert_eq!(frame.virt.as_ptr::<u64>().read(), 0xA5A5_A5A5_A5A5_A5A5);
        }
    }

    #[test]
    fn bitmap_page_never_handed_out() {
        let (_space, mut pmm) = single_region_allocator(8);
        while let Some(frame) = pmm.alloc_page() {
            assert_ne!(frame.phys.as_u64(), REGION_BASE, "bitmap page escaped");
        }
    }

    #[test]
    fn double_free_is_tolerated() {
        let (_space, mut pmm) = single_region_allocator(8);
        let frame = pmm.alloc_page().unwrap();
        pmm.free_page(frame.phys).unwrap();
        // Second free of the same frame: logged, not fatal, no state change.
        pmm.free_page(frame.phys).unwrap();
        assert_eq!(pmm.free_pages(), 7);
    }

    #[test]
    fn foreign_address_free_is_an_error() {
        let (_space, mut pmm) = single_region_allocator(8);
        assert_eq!(
            pmm.free_page(PhysAddr::new(0x9999_0000)),
            Err(PmmError::InvalidFrame)
        );
    }

    #[test]
    fn contiguous_respects_alignment_and_ceiling() {
        let (space, mut pmm) = single_region_allocator(64);

        let frame = pmm
            .alloc_contiguous(4, 4 * PAGE_SIZE as u64, REGION_BASE + 64 * PAGE_SIZE as u64)
            .expect("contiguous run available");
        assert_eq!(frame.phys.as_u64() % (4 * PAGE_SIZE as u64), 0);
        assert_eq!(frame.virt.as_u64(), space.hhdm_offset() + frame.phys.as_u64());
        assert!(frame.phys.as_u64() + 4 * PAGE_SIZE as u64 <= REGION_BASE + 64 * PAGE_SIZE as u64);
    }

    #[test]
    fn contiguous_ceiling_excludes_region() {
        let (_space, mut pmm) = single_region_allocator(16);
        // Everything in this region sits above the ceiling.
        assert!(pmm.alloc_contiguous(1, PAGE_SIZE as u64, REGION_BASE).is_none());
    }

    #[test]
    fn contiguous_run_is_actually_free() {
        let (_space, mut pmm) = single_region_allocator(16);
        // Fragment the region: allocate all, free two non-adjacent frames.
        let mut frames = Vec::new();
        while let Some(f) = pmm.alloc_page() {
            frames.push(f);
        }
        pmm.free_page(frames[2].phys).unwrap();
        pmm.free_page(frames[6].phys).unwrap();

        // No 2-page contiguous run exists.
        assert!(pmm.alloc_contiguous(2, PAGE_SIZE as u64, 0).is_none());

        // Freeing the neighbour creates one.
        pmm.free_page(frames[3].phys).unwrap();
        let run = pmm.alloc_contiguous(2, PAGE_SIZE as u64, 0).unwrap();
        assert_eq!(run.phys, frames[2].phys);
    }

    #[test]
    fn regions_sorted_ascending() {
        let space = TestSpace::new(0x10_0000, 32 * PAGE_SIZE);
        // Two descriptors, deliberately out of order; the second half of the
        // buffer plays the role of a higher region.
        let memmap = [
            PhysRegionDesc {
                start: PhysAddr::new(0x10_0000 + 16 * PAGE_SIZE as u64),
                size: (16 * PAGE_SIZE) as u64,
                usable: true,
            },
            PhysRegionDesc {
                start: PhysAddr::new(0x10_0000),
                size: (16 * PAGE_SIZE) as u64,
                usable: true,
            },
        ];
        // SAFETY: both regions map into the test buffer.
        let mut pmm = unsafe { FrameAllocator::new(&memmap, space.hhdm_offset()).unwrap() };

        // First-fit must serve from the low region first.
        let frame = pmm.alloc_page().unwrap();
        assert!(frame.phys.as_u64() < 0x10_0000 + 16 * PAGE_SIZE as u64);
        assert_eq!(pmm.total_usable_pages(), 32);
    }

    #[test]
    fn unusable_regions_ignored() {
        let space = TestSpace::new(REGION_BASE, 8 * PAGE_SIZE);
        let memmap = [
            PhysRegionDesc {
                start: PhysAddr::new(REGION_BASE),
                size: (8 * PAGE_SIZE) as u64,
                usable: true,
            },
            PhysRegionDesc {
                start: PhysAddr::new(0xE000_0000),
                size: 0x10000,
                usable: false,
            },
        ];
        // SAFETY: the usable region maps into the test buffer; the reserved
        // one is never touched.
        let pmm = unsafe { FrameAllocator::new(&memmap, space.hhdm_offset()).unwrap() };
        assert_eq!(pmm.total_usable_pages(), 8);
        assert_eq!(pmm.max_phys_addr().as_u64(), REGION_BASE + 8 * PAGE_SIZE as u64);
    }
}
