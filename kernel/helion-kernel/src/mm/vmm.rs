//! Virtual memory manager.
//!
//! [`Mapper`] walks and builds 4-level page tables through the HHDM. It is
//! pure logic over a physical-frame source, so the walk, huge-page handling,
//! and split logic are host-testable against fabricated page-table memory.
//! The kernel-side global ([`init`], [`with_vmm`], [`map_mmio_region`]) wires
//! it to the PMM, the boot page tables, and `invlpg`.

use crate::addr::{PhysAddr, VirtAddr};
use crate::mm::paging::{
    ADDR_MASK, PageTable, PageTableEntry, PageTableFlags, SIZE_1GIB, SIZE_2MIB,
};
use crate::mm::{MapError, PAGE_SIZE, UnmapError};

/// Mapping granularity for [`Mapper::map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    /// 4 KiB leaf in a PT.
    Size4K,
    /// 2 MiB huge leaf in a PD.
    Size2M,
    /// 1 GiB huge leaf in a PDPT.
    Size1G,
}

/// Result of translating a virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateResult {
    /// Mapped through a 4 KiB page.
    Page4K {
        /// Physical address the query resolves to (low bits merged in).
        phys: PhysAddr,
        /// Leaf entry flags.
        flags: PageTableFlags,
    },
    /// Mapped through a 2 MiB huge page.
    Page2M {
        /// Physical address the query resolves to (low bits merged in).
        phys: PhysAddr,
        /// Leaf entry flags.
        flags: PageTableFlags,
    },
    /// Mapped through a 1 GiB huge page.
    Page1G {
        /// Physical address the query resolves to (low bits merged in).
        phys: PhysAddr,
        /// Leaf entry flags.
        flags: PageTableFlags,
    },
    /// The address is not mapped.
    NotMapped,
}

impl TranslateResult {
    /// Collapses the result to the resolved physical address, if mapped.
    pub fn phys(self) -> Option<PhysAddr> {
        match self {
            Self::Page4K { phys, .. } | Self::Page2M { phys, .. } | Self::Page1G { phys, .. } => {
                Some(phys)
            }
            Self::NotMapped => None,
        }
    }
}

/// Walks and builds page tables reachable through the HHDM.
///
/// Every inner table frame is owned exclusively by the mapper once it is
/// wired into the hierarchy.
pub struct Mapper {
    /// Physical address of the root PML4.
    root: PhysAddr,
    /// HHDM offset used to dereference physical table addresses.
    hhdm_offset: u64,
}

impl Mapper {
    /// Creates a mapper over an existing PML4.
    ///
    /// # Safety
    ///
    /// `root` must be a valid, 4 KiB-aligned PML4 frame reachable through
    /// `hhdm_offset`, and no other code may mutate the hierarchy while this
    /// mapper is in use.
    pub unsafe fn new(root: PhysAddr, hhdm_offset: u64) -> Self {
        Self { root, hhdm_offset }
    }

    /// Returns the physical address of the root PML4.
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Returns a mutable reference to the [`PageTable`] at `phys`.
    fn table_at(&self, phys: PhysAddr) -> &mut PageTable {
        // SAFETY: Table frames are only reachable through entries this
        // mapper wrote (or the boot tables it adopted), all of which are
        // 4 KiB aligned and covered by the HHDM.
        unsafe { &mut *((self.hhdm_offset + phys.as_u64()) as *mut PageTable) }
    }

    /// Flags given to inner (non-leaf) entries: the leaf restricts access,
    /// the inner levels must not.
    fn intermediate_flags(leaf: PageTableFlags) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if leaf.contains(PageTableFlags::USER) {
            flags |= PageTableFlags::USER;
        }
        flags
    }

    /// Ensures `table[index]` points to a next-level table, allocating and
    /// zeroing one from `alloc` if absent. Returns the next table's address.
    fn ensure_table(
        &self,
        table_phys: PhysAddr,
        index: usize,
        intermediate: PageTableFlags,
        alloc: &mut impl FnMut() -> Option<PhysAddr>,
    ) -> Result<PhysAddr, MapError> {
        let table = self.table_at(table_phys);
        let entry = table.entries[index];
        if entry.is_present() {
            // OR in missing intermediate flags (e.g. USER joining a subtree).
            let combined = entry.flags() | intermediate;
            if combined != entry.flags() {
                table.entries[index] = PageTableEntry::new(entry.address(), combined);
            }
            return Ok(entry.address());
        }

        let frame = alloc().ok_or(MapError::FrameAllocationFailed)?;
        // Zero the new table so stale memory is not read as present entries.
        // SAFETY: The frame was just allocated for us and is HHDM-reachable.
        unsafe {
            core::ptr::write_bytes((self.hhdm_offset + frame.as_u64()) as *mut u8, 0, PAGE_SIZE);
        }
        table.entries[index] = PageTableEntry::new(frame, intermediate);
        Ok(frame)
    }

    /// Maps `virt` to `phys` at the given granularity.
    ///
    /// A 4 KiB mapping that lands inside an existing 2 MiB huge entry
    /// splits it: a PT holding the 512 derived 4 KiB mappings is
    /// materialized, then the huge entry is replaced. The caller must flush
    /// the TLB for `virt` afterwards.
    pub fn map(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
        size: PageSize,
        alloc: &mut impl FnMut() -> Option<PhysAddr>,
    ) -> Result<(), MapError> {
        let intermediate = Self::intermediate_flags(flags);
        let leaf_flags = (flags | PageTableFlags::PRESENT) - PageTableFlags::HUGE_PAGE;

        let pdpt = self.ensure_table(self.root, virt.pml4_index(), intermediate, alloc)?;

        if size == PageSize::Size1G {
            debug_assert!(phys.is_aligned(SIZE_1GIB));
            let table = self.table_at(pdpt);
            table.entries[virt.pdpt_index()] =
                PageTableEntry::new(phys, leaf_flags | PageTableFlags::HUGE_PAGE);
            return Ok(());
        }

        let pd = self.ensure_table(pdpt, virt.pdpt_index(), intermediate, alloc)?;

        if size == PageSize::Size2M {
            debug_assert!(phys.is_aligned(SIZE_2MIB));
            let table = self.table_at(pd);
            table.entries[virt.pd_index()] =
                PageTableEntry::new(phys, leaf_flags | PageTableFlags::HUGE_PAGE);
            return Ok(());
        }

        // 4 KiB path. A huge PD entry in the way is split first.
        let pd_table = self.table_at(pd);
        let pd_entry = pd_table.entries[virt.pd_index()];
        if pd_entry.is_present() && pd_entry.is_huge() {
            self.split_2mib(pd, virt.pd_index(), alloc)?;
        }

        let pt = self.ensure_table(pd, virt.pd_index(), intermediate, alloc)?;
        let table = self.table_at(pt);
        table.entries[virt.pt_index()] = PageTableEntry::new(phys, leaf_flags);
        Ok(())
    }

    /// Replaces a 2 MiB huge entry with a PT of 512 derived 4 KiB entries.
    fn split_2mib(
        &mut self,
        pd_phys: PhysAddr,
        pd_index: usize,
        alloc: &mut impl FnMut() -> Option<PhysAddr>,
    ) -> Result<(), MapError> {
        let pd = self.table_at(pd_phys);
        let huge = pd.entries[pd_index];
        debug_assert!(huge.is_present() && huge.is_huge());

        let pt_frame = alloc().ok_or(MapError::FrameAllocationFailed)?;
        let derived_flags = huge.flags() - PageTableFlags::HUGE_PAGE;

        // Populate the new PT before wiring it in, so the hierarchy never
        // exposes a half-built table.
        {
            // SAFETY: pt_frame was just allocated for us.
            let pt =
                unsafe { &mut *((self.hhdm_offset + pt_frame.as_u64()) as *mut PageTable) };
            let base = huge.address();
            for (i, entry) in pt.entries.iter_mut().enumerate() {
                *entry = PageTableEntry::new(base + (i * PAGE_SIZE) as u64, derived_flags);
            }
        }

        pd.entries[pd_index] =
            PageTableEntry::new(pt_frame, Self::intermediate_flags(derived_flags));
        Ok(())
    }

    /// Unmaps whatever leaf (4 KiB or huge) covers `virt`.
    ///
    /// Returns the physical address that was mapped. The caller must flush
    /// the TLB for `virt`. Unmapped addresses are reported, not faulted.
    pub fn unmap(&mut self, virt: VirtAddr) -> Result<PhysAddr, UnmapError> {
        let pml4 = self.table_at(self.root);
        let pml4e = pml4.entries[virt.pml4_index()];
        if !pml4e.is_present() {
            return Err(UnmapError::NotMapped);
        }

        let pdpt = self.table_at(pml4e.address());
        let pdpte = pdpt.entries[virt.pdpt_index()];
        if !pdpte.is_present() {
            return Err(UnmapError::NotMapped);
        }
        if pdpte.is_huge() {
            pdpt.entries[virt.pdpt_index()] = PageTableEntry::empty();
            return Ok(pdpte.address());
        }

        let pd = self.table_at(pdpte.address());
        let pde = pd.entries[virt.pd_index()];
        if !pde.is_present() {
            return Err(UnmapError::NotMapped);
        }
        if pde.is_huge() {
            pd.entries[virt.pd_index()] = PageTableEntry::empty();
            return Ok(pde.address());
        }

        let pt = self.table_at(pde.address());
        let pte = pt.entries[virt.pt_index()];
        if !pte.is_present() {
            return Err(UnmapError::NotMapped);
        }
        pt.entries[virt.pt_index()] = PageTableEntry::empty();
        Ok(pte.address())
    }

    /// Translates a virtual address, merging low bits for huge entries.
    pub fn translate(&self, virt: VirtAddr) -> TranslateResult {
        let pml4 = self.table_at(self.root);
        let pml4e = pml4.entries[virt.pml4_index()];
        if !pml4e.is_present() {
            return TranslateResult::NotMapped;
        }

        let pdpt = self.table_at(pml4e.address());
        let pdpte = pdpt.entries[virt.pdpt_index()];
        if !pdpte.is_present() {
            return TranslateResult::NotMapped;
        }
        if pdpte.is_huge() {
            let base = pdpte.address().as_u64() & ADDR_MASK & !(SIZE_1GIB - 1);
            return TranslateResult::Page1G {
                phys: PhysAddr::new(base | (virt.as_u64() & (SIZE_1GIB - 1))),
                flags: pdpte.flags(),
            };
        }

        let pd = self.table_at(pdpte.address());
        let pde = pd.entries[virt.pd_index()];
        if !pde.is_present() {
            return TranslateResult::NotMapped;
        }
        if pde.is_huge() {
            let base = pde.address().as_u64() & !(SIZE_2MIB - 1);
            return TranslateResult::Page2M {
                phys: PhysAddr::new(base | (virt.as_u64() & (SIZE_2MIB - 1))),
                flags: pde.flags(),
            };
        }

        let pt = self.table_at(pde.address());
        let pte = pt.entries[virt.pt_index()];
        if !pte.is_present() {
            return TranslateResult::NotMapped;
        }
        TranslateResult::Page4K {
            phys: PhysAddr::new(pte.address().as_u64() | virt.page_offset()),
            flags: pte.flags(),
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel-side global
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
mod global {
    use super::{Mapper, PageSize, TranslateResult};
    use crate::addr::{PhysAddr, VirtAddr};
    use crate::arch::x86_64::instructions::invlpg;
    use crate::boot::BootInfo;
    use crate::mm::paging::PageTableFlags;
    use crate::mm::{MapError, PAGE_SIZE, UnmapError};
    use crate::sync::SpinLock;

    /// Base of the monotonically growing MMIO mapping window.
    const MMIO_WINDOW_BASE: u64 = 0xFFFF_A000_0000_0000;

    struct Vmm {
        mapper: Mapper,
        /// Next free virtual address in the MMIO window.
        mmio_cursor: VirtAddr,
    }

    /// Global virtual memory manager.
    static VMM: SpinLock<Option<Vmm>> = SpinLock::new(None);

    /// Allocation callback bridging the mapper to the global PMM.
    fn pmm_alloc() -> Option<PhysAddr> {
        crate::mm::pmm::with_pmm(|pmm| pmm.alloc_page().map(|frame| frame.phys))
    }

    /// Initializes the VMM.
    ///
    /// Adopts the boot loader's page-table root: Limine already installed
    /// the HHDM and the kernel's higher-half map, so the kernel keeps that
    /// hierarchy and grows it in place.
    ///
    /// # Panics
    ///
    /// Panics on double init.
    pub fn init(boot_info: &impl BootInfo) {
        // SAFETY: The boot loader hands over a live PML4 reachable through
        // the HHDM; from here on only the VMM mutates it.
        let mapper = unsafe { Mapper::new(boot_info.page_table_root(), boot_info.hhdm_offset()) };

        let mut vmm = VMM.lock();
        assert!(vmm.is_none(), "VMM: double init");
        *vmm = Some(Vmm {
            mapper,
            mmio_cursor: VirtAddr::new(MMIO_WINDOW_BASE),
        });
    }

    fn with_vmm_inner<R>(f: impl FnOnce(&mut Vmm) -> R) -> R {
        let mut vmm = VMM.lock();
        f(vmm.as_mut().expect("VMM not initialized"))
    }

    /// Runs a closure with exclusive access to the global [`Mapper`].
    pub fn with_vmm<R>(f: impl FnOnce(&mut Mapper) -> R) -> R {
        with_vmm_inner(|vmm| f(&mut vmm.mapper))
    }

    /// Maps one page and flushes the TLB entry.
    pub fn map(
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
        size: PageSize,
    ) -> Result<(), MapError> {
        with_vmm_inner(|vmm| vmm.mapper.map(virt, phys, flags, size, &mut pmm_alloc))?;
        invlpg(virt);
        Ok(())
    }

    /// Unmaps whatever covers `virt` and flushes the TLB entry.
    ///
    /// A not-mapped address is a safe no-op reported as `Err(NotMapped)`.
    pub fn unmap(virt: VirtAddr) -> Result<PhysAddr, UnmapError> {
        let result = with_vmm_inner(|vmm| vmm.mapper.unmap(virt));
        if result.is_ok() {
            invlpg(virt);
        }
        result
    }

    /// Translates a virtual address through the live hierarchy.
    pub fn translate(virt: VirtAddr) -> Option<PhysAddr> {
        with_vmm_inner(|vmm| vmm.mapper.translate(virt)).phys()
    }

    /// Maps a physical MMIO range and returns its virtual base.
    ///
    /// Pages are mapped uncached + write-through so device registers are
    /// never served from the cache, at monotonically increasing addresses
    /// above the MMIO window base.
    pub fn map_mmio_region(phys: PhysAddr, len: u64) -> VirtAddr {
        let flags = PageTableFlags::PRESENT
            | PageTableFlags::WRITABLE
            | PageTableFlags::NO_CACHE
            | PageTableFlags::WRITE_THROUGH;

        with_vmm_inner(|vmm| {
            let phys_base = phys.align_down(PAGE_SIZE as u64);
            let offset_in_page = phys.as_u64() - phys_base.as_u64();
            let pages = ((offset_in_page + len) as usize).div_ceil(PAGE_SIZE);

            let virt_base = vmm.mmio_cursor;
            for i in 0..pages {
                let virt = virt_base + (i * PAGE_SIZE) as u64;
                let page_phys = phys_base + (i * PAGE_SIZE) as u64;
                vmm.mapper
                    .map(virt, page_phys, flags, PageSize::Size4K, &mut pmm_alloc)
                    .expect("MMIO mapping failed");
                invlpg(virt);
            }
            // Keep a guard page between MMIO windows.
            vmm.mmio_cursor = virt_base + ((pages + 1) * PAGE_SIZE) as u64;
            virt_base + offset_in_page
        })
    }

    /// Translation result with size/flags detail, for diagnostics.
    pub fn translate_detailed(virt: VirtAddr) -> TranslateResult {
        with_vmm_inner(|vmm| vmm.mapper.translate(virt))
    }
}

#[cfg(target_os = "none")]
pub use global::{init, map, map_mmio_region, translate, translate_detailed, unmap, with_vmm};

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;

    /// A pool of fabricated physical frames backing the page tables.
    struct FramePool {
        buf: *mut u8,
        layout: Layout,
        next: usize,
        capacity: usize,
    }

    impl FramePool {
        fn new(frames: usize) -> Self {
            let layout = Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE).unwrap();
            // SAFETY: layout is valid and non-zero.
            let buf = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!buf.is_null());
            Self {
                buf,
                layout,
                next: 0,
                capacity: frames,
            }
        }

        /// Identity "physical" space: phys == offset into the buffer, and
        /// hhdm_offset == buffer base.
        fn hhdm_offset(&self) -> u64 {
            self.buf as u64
        }

        fn alloc(&mut self) -> Option<PhysAddr> {
            if self.next == self.capacity {
                return None;
            }
            let phys = PhysAddr::new((self.next * PAGE_SIZE) as u64);
            self.next += 1;
            Some(phys)
        }
    }

    impl Drop for FramePool {
        fn drop(&mut self) {
            // SAFETY: allocated with the stored layout in `new`.
            unsafe { std::alloc::dealloc(self.buf, self.layout) };
        }
    }

    fn mapper_with_pool(frames: usize) -> (FramePool, Mapper) {
        let mut pool = FramePool::new(frames);
        let root = pool.alloc().unwrap();
        // SAFETY: root is a zeroed frame inside the pool buffer.
        let mapper = unsafe { Mapper::new(root, pool.hhdm_offset()) };
        (pool, mapper)
    }

    const WRITABLE: PageTableFlags = PageTableFlags::PRESENT.union(PageTableFlags::WRITABLE);

    #[test]
    fn map_translate_unmap_roundtrip() {
        let (mut pool, mut mapper) = mapper_with_pool(16);
        let mut alloc = || pool.alloc();

        let virt = VirtAddr::new(0xFFFF_8000_0040_0000);
        let phys = PhysAddr::new(0x5000);
        mapper
            .map(virt, phys, WRITABLE, PageSize::Size4K, &mut alloc)
            .unwrap();

        assert_eq!(mapper.translate(virt).phys(), Some(phys));
        // Low bits merge into the translation.
        assert_eq!(
            mapper.translate(virt + 4095).phys(),
            Some(phys + 4095)
        );

        assert_eq!(mapper.unmap(virt), Ok(phys));
        assert_eq!(mapper.translate(virt).phys(), None);
    }

    #[test]
    fn unmap_unmapped_is_reported() {
        let (_pool, mut mapper) = mapper_with_pool(4);
        assert_eq!(
            mapper.unmap(VirtAddr::new(0xFFFF_8000_0000_0000)),
            Err(UnmapError::NotMapped)
        );
    }

    #[test]
    fn remap_after_unmap() {
        let (mut pool, mut mapper) = mapper_with_pool(16);
        let mut alloc = || pool.alloc();

        let virt = VirtAddr::new(0xFFFF_8000_0000_3000);
        mapper
            .map(virt, PhysAddr::new(0x6000), WRITABLE, PageSize::Size4K, &mut alloc)
            .unwrap();
        mapper.unmap(virt).unwrap();
        mapper
            .map(virt, PhysAddr::new(0x7000), WRITABLE, PageSize::Size4K, &mut alloc)
            .unwrap();
        assert_eq!(mapper.translate(virt).phys(), Some(PhysAddr::new(0x7000)));
    }

    #[test]
    fn huge_2mib_translation_merges_low_bits() {
        let (mut pool, mut mapper) = mapper_with_pool(8);
        let mut alloc = || pool.alloc();

        let virt = VirtAddr::new(0xFFFF_8000_0020_0000);
        let phys = PhysAddr::new(0x20_0000);
        mapper
            .map(virt, phys, WRITABLE, PageSize::Size2M, &mut alloc)
            .unwrap();

        match mapper.translate(virt + 0x1234) {
            TranslateResult::Page2M { phys: got, .. } => {
                assert_eq!(got, PhysAddr::new(0x20_1234));
            }
            other => panic!("expected 2 MiB mapping, got {other:?}"),
        }
    }

    #[test]
    fn huge_1gib_translation() {
        let (mut pool, mut mapper) = mapper_with_pool(8);
        let mut alloc = || pool.alloc();

        let virt = VirtAddr::new(0xFFFF_8000_4000_0000);
        let phys = PhysAddr::new(0x4000_0000);
        mapper
            .map(virt, phys, WRITABLE, PageSize::Size1G, &mut alloc)
            .unwrap();

        match mapper.translate(virt + 0x12_3456) {
            TranslateResult::Page1G { phys: got, .. } => {
                assert_eq!(got, PhysAddr::new(0x4012_3456));
            }
            other => panic!("expected 1 GiB mapping, got {other:?}"),
        }
    }

    #[test]
    fn split_huge_on_4k_map() {
        let (mut pool, mut mapper) = mapper_with_pool(16);
        let mut alloc = || pool.alloc();

        let virt = VirtAddr::new(0xFFFF_8000_0020_0000);
        mapper
            .map(virt, PhysAddr::new(0x20_0000), WRITABLE, PageSize::Size2M, &mut alloc)
            .unwrap();

        // Remap the first 4 KiB of the huge range; the rest must survive as
        // derived 4 KiB entries.
        mapper
            .map(virt, PhysAddr::new(0x80_0000), WRITABLE, PageSize::Size4K, &mut alloc)
            .unwrap();

        assert_eq!(
            mapper.translate(virt).phys(),
            Some(PhysAddr::new(0x80_0000))
        );
        // Derived entry: second page still points into the old huge range.
        match mapper.translate(virt + 4096) {
            TranslateResult::Page4K { phys, .. } => assert_eq!(phys, PhysAddr::new(0x20_1000)),
            other => panic!("expected split 4 KiB mapping, got {other:?}"),
        }
        // Spot-check the far end of the derived range.
        assert_eq!(
            mapper.translate(virt + 511 * 4096).phys(),
            Some(PhysAddr::new(0x20_0000 + 511 * 4096))
        );
    }

    #[test]
    fn unmap_clears_huge_leaf() {
        let (mut pool, mut mapper) = mapper_with_pool(8);
        let mut alloc = || pool.alloc();

        let virt = VirtAddr::new(0xFFFF_8000_0040_0000);
        mapper
            .map(virt, PhysAddr::new(0x40_0000), WRITABLE, PageSize::Size2M, &mut alloc)
            .unwrap();
        assert_eq!(mapper.unmap(virt), Ok(PhysAddr::new(0x40_0000)));
        assert_eq!(mapper.translate(virt).phys(), None);
    }

    #[test]
    fn map_fails_cleanly_without_frames() {
        let (mut pool, mut mapper) = mapper_with_pool(1); // root only
        let mut alloc = || pool.alloc();

        let result = mapper.map(
            VirtAddr::new(0xFFFF_8000_0000_0000),
            PhysAddr::new(0x1000),
            WRITABLE,
            PageSize::Size4K,
            &mut alloc,
        );
        assert_eq!(result, Err(MapError::FrameAllocationFailed));
    }

    #[test]
    fn user_flag_propagates_to_intermediates() {
        let (mut pool, mut mapper) = mapper_with_pool(16);
        let root = mapper.root();
        let mut alloc = || pool.alloc();

        let virt = VirtAddr::new(0x0000_0000_0040_0000);
        mapper
            .map(
                virt,
                PhysAddr::new(0x9000),
                WRITABLE | PageTableFlags::USER,
                PageSize::Size4K,
                &mut alloc,
            )
            .unwrap();

        let pml4 = mapper.table_at(root);
        let entry = pml4.entries[virt.pml4_index()];
        assert!(entry.flags().contains(PageTableFlags::USER));
    }
}
