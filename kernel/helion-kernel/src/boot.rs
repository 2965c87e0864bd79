//! Bootloader-agnostic boot information and the kernel entry point.
//!
//! The boot stub converts its native protocol structures into [`BootInfo`]
//! and calls [`kernel_init`], which runs the staged bring-up and then
//! idles, processing controller events.

extern crate alloc;
use alloc::boxed::Box;

use noalloc::vec::ArrayVec;

use crate::addr::{PhysAddr, VirtAddr};

/// The kind of a physical memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Normal usable RAM.
    Usable,
    /// Reserved by firmware or hardware.
    Reserved,
    /// ACPI tables, reclaimable after parsing.
    AcpiReclaimable,
    /// ACPI non-volatile storage.
    AcpiNvs,
    /// Defective memory.
    BadMemory,
    /// Bootloader memory, reclaimable after boot.
    BootloaderReclaimable,
    /// Kernel image and loaded modules.
    KernelAndModules,
    /// Memory-mapped framebuffer.
    Framebuffer,
}

/// A contiguous physical memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Physical start address.
    pub start: PhysAddr,
    /// Size in bytes.
    pub size: u64,
    /// Kind of region.
    pub kind: MemoryRegionKind,
}

/// Pixel format of a framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 32-bit, red in the low byte.
    Rgb32,
    /// 32-bit, blue in the low byte.
    Bgr32,
    /// Arbitrary masks described by per-channel size and shift.
    Bitmask {
        /// Red channel bits.
        red_size: u8,
        /// Red channel shift from bit 0.
        red_shift: u8,
        /// Green channel bits.
        green_size: u8,
        /// Green channel shift from bit 0.
        green_shift: u8,
        /// Blue channel bits.
        blue_size: u8,
        /// Blue channel shift from bit 0.
        blue_shift: u8,
    },
}

/// A linear framebuffer handed over by the boot loader.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    /// Virtual address of the framebuffer (HHDM-mapped by the loader).
    pub address: VirtAddr,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per scanline.
    pub pitch: u32,
    /// Bits per pixel (24 or 32).
    pub bpp: u8,
    /// Pixel format.
    pub pixel_format: PixelFormat,
}

/// The initial ramdisk module.
#[derive(Debug, Clone, Copy)]
pub struct InitrdInfo {
    /// Physical address of the archive.
    pub phys_addr: PhysAddr,
    /// Size in bytes.
    pub size: u64,
}

/// Maximum memory regions the kernel tracks.
pub const MAX_MEMORY_REGIONS: usize = 256;

/// Maximum framebuffers the kernel tracks.
pub const MAX_FRAMEBUFFERS: usize = 4;

/// Bootloader-agnostic boot information.
pub trait BootInfo {
    /// Physical memory map, sorted by start address.
    fn memory_map(&self) -> &[MemoryRegion];

    /// HHDM offset: `virtual = physical + hhdm_offset()`.
    fn hhdm_offset(&self) -> u64;

    /// Physical address of the active root page table (PML4).
    fn page_table_root(&self) -> PhysAddr;

    /// Available framebuffers.
    fn framebuffers(&self) -> &[FramebufferInfo];

    /// ACPI RSDP physical address, when the loader reports one.
    fn rsdp_address(&self) -> Option<PhysAddr>;

    /// Kernel command line, if any.
    fn command_line(&self) -> Option<&str>;

    /// Initial ramdisk (CPIO archive), when one was loaded.
    fn initrd(&self) -> Option<InitrdInfo>;
}

/// Concrete boot info container populated by a boot stub. Fixed-capacity:
/// exists before the heap.
pub struct BootInfoData {
    /// Physical memory map.
    pub memory_map: ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS>,
    /// HHDM offset.
    pub hhdm_offset: u64,
    /// Root page table physical address.
    pub page_table_root: PhysAddr,
    /// Framebuffers.
    pub framebuffers: ArrayVec<FramebufferInfo, MAX_FRAMEBUFFERS>,
    /// ACPI RSDP physical address.
    pub rsdp_address: Option<PhysAddr>,
    /// Kernel command line.
    pub command_line: Option<&'static str>,
    /// Initrd module.
    pub initrd: Option<InitrdInfo>,
}

impl BootInfo for BootInfoData {
    fn memory_map(&self) -> &[MemoryRegion] {
        self.memory_map.as_slice()
    }

    fn hhdm_offset(&self) -> u64 {
        self.hhdm_offset
    }

    fn page_table_root(&self) -> PhysAddr {
        self.page_table_root
    }

    fn framebuffers(&self) -> &[FramebufferInfo] {
        self.framebuffers.as_slice()
    }

    fn rsdp_address(&self) -> Option<PhysAddr> {
        self.rsdp_address
    }

    fn command_line(&self) -> Option<&str> {
        self.command_line
    }

    fn initrd(&self) -> Option<InitrdInfo> {
        self.initrd
    }
}

/// Kernel entry point, called by the boot stub.
///
/// Static dispatch over the stub's [`BootInfo`] implementation.
pub fn kernel_init(boot_info: &impl BootInfo) -> ! {
    // 1. CPU structures: GDT with TSS, IDT.
    crate::arch::cpu_init();

    // 2. HHDM offset, so physical memory is reachable.
    crate::mm::hhdm::init(boot_info.hhdm_offset());
    crate::kinfo!("hhdm: offset {:#x}", boot_info.hhdm_offset());

    // 3. Physical frame allocator from the firmware memory map.
    crate::mm::pmm::init(boot_info);
    crate::mm::pmm::with_pmm(|pmm| {
        crate::kinfo!(
            "pmm: {} MiB usable, top of RAM {}",
            pmm.total_usable_pages() * 4 / 1024,
            pmm.max_phys_addr()
        );
    });

    // 4. Virtual memory manager over the loader's page tables.
    crate::mm::vmm::init(boot_info);

    // 5. Tagged heap (slab + buddy + DMA).
    crate::mm::heap::init();
    crate::kinfo!("heap: slab/buddy/dma ready");

    // 6. Full logger; keep serial, add the framebuffer console if present.
    crate::log::init_logger();
    crate::log::add_sink(Box::new(crate::drivers::uart16550::SerialSink::new(
        crate::log::LogLevel::Trace,
    )));
    if let Some(fb_info) = boot_info.framebuffers().first() {
        if let Some(console) = crate::drivers::fbcon::FramebufferConsole::new(fb_info) {
            crate::log::add_sink(Box::new(crate::drivers::fbcon::FramebufferSink::new(
                console,
                crate::log::LogLevel::Info,
            )));
        }
    }

    // 7. Command-line configuration.
    let config = crate::config::KernelConfig::parse(boot_info.command_line().unwrap_or(""));
    crate::log::set_max_level(config.log_level);

    // 8. ACPI, APICs, timer; interrupts come on here.
    crate::arch::x86_64::platform::init(boot_info.rsdp_address());

    // 9. Registered initializers, including driver probes (xHCI via the
    //    PCI scan) at the Driver stage.
    if config.xhci {
        crate::drivers::xhci::register_probe();
    }
    let ran = crate::initcall::run_all();
    crate::kinfo!("initcalls: {} executed", ran);

    // 10. VFS root and the initrd contents.
    crate::fs::vfs::init();
    if let Some(initrd) = boot_info.initrd() {
        let virt = crate::mm::hhdm::phys_to_virt(initrd.phys_addr);
        // SAFETY: The loader placed the archive in KernelAndModules memory,
        // which the PMM never reuses, and the HHDM covers it.
        let data =
            unsafe { core::slice::from_raw_parts(virt.as_ptr::<u8>(), initrd.size as usize) };
        match crate::fs::initramfs::unpack_cpio(data) {
            Ok(count) => crate::kinfo!("initrd: unpacked {} files", count),
            Err(e) => crate::kerr!("initrd: unpack failed: {:?}", e),
        }
    } else {
        crate::kwarn!("initrd: no module loaded");
    }

    crate::kinfo!("helion: boot complete");

    // 11. Idle: sleep until interrupts, draining controller events.
    loop {
        crate::drivers::xhci::poll_controllers();
        crate::arch::x86_64::instructions::hlt();
    }
}
