//! Limine boot stub.
//!
//! Converts the bootloader's responses into the kernel's [`BootInfoData`]
//! and enters [`kernel_init`](helion_kernel::kernel_init). Runs on the
//! loader-provided stack and page tables; the kernel adopts both.

#![no_std]
#![no_main]

mod requests;

use helion_kernel::addr::{PhysAddr, VirtAddr};
use helion_kernel::boot::{
    BootInfoData, FramebufferInfo, InitrdInfo, MemoryRegion, MemoryRegionKind, PixelFormat,
};
use helion_kernel::drivers::uart16550::{COM1, Uart16550};
use limine::memory_map::EntryType;
use noalloc::vec::ArrayVec;

/// Reads the active PML4 physical address from CR3.
fn read_cr3() -> PhysAddr {
    let value: u64;
    // SAFETY: reading CR3 has no side effects in ring 0.
    unsafe {
        core::arch::asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    PhysAddr::new(value & !0xFFF)
}

/// Converts the Limine memory map into kernel regions.
fn build_memory_map() -> ArrayVec<MemoryRegion, { helion_kernel::boot::MAX_MEMORY_REGIONS }> {
    let mut regions = ArrayVec::new();
    let response = requests::MEMORY_MAP
        .get_response()
        .expect("bootloader provided no memory map");

    for entry in response.entries() {
        if regions.len() == helion_kernel::boot::MAX_MEMORY_REGIONS {
            break;
        }
        // EntryType is a newtype over the protocol's raw value, not an
        // enum, so this is an equality chain rather than a match.
        let entry_type = entry.entry_type;
        let kind = if entry_type == EntryType::USABLE {
            MemoryRegionKind::Usable
        } else if entry_type == EntryType::ACPI_RECLAIMABLE {
            MemoryRegionKind::AcpiReclaimable
        } else if entry_type == EntryType::ACPI_NVS {
            MemoryRegionKind::AcpiNvs
        } else if entry_type == EntryType::BAD_MEMORY {
            MemoryRegionKind::BadMemory
        } else if entry_type == EntryType::BOOTLOADER_RECLAIMABLE {
            MemoryRegionKind::BootloaderReclaimable
        } else if entry_type == EntryType::EXECUTABLE_AND_MODULES {
            MemoryRegionKind::KernelAndModules
        } else if entry_type == EntryType::FRAMEBUFFER {
            MemoryRegionKind::Framebuffer
        } else {
            MemoryRegionKind::Reserved
        };
        regions.push(MemoryRegion {
            start: PhysAddr::new(entry.base),
            size: entry.length,
            kind,
        });
    }
    regions
}

/// Converts the Limine framebuffer list.
fn build_framebuffers() -> ArrayVec<FramebufferInfo, { helion_kernel::boot::MAX_FRAMEBUFFERS }> {
    let mut framebuffers = ArrayVec::new();
    let Some(response) = requests::FRAMEBUFFER.get_response() else {
        return framebuffers;
    };

    for fb in response.framebuffers() {
        if framebuffers.len() == helion_kernel::boot::MAX_FRAMEBUFFERS {
            break;
        }
        let pixel_format = PixelFormat::Bitmask {
            red_size: fb.red_mask_size(),
            red_shift: fb.red_mask_shift(),
            green_size: fb.green_mask_size(),
            green_shift: fb.green_mask_shift(),
            blue_size: fb.blue_mask_size(),
            blue_shift: fb.blue_mask_shift(),
        };
        framebuffers.push(FramebufferInfo {
            address: VirtAddr::new_truncate(fb.addr() as u64),
            width: fb.width() as u32,
            height: fb.height() as u32,
            pitch: fb.pitch() as u32,
            bpp: fb.bpp() as u8,
            pixel_format,
        });
    }
    framebuffers
}

/// Extracts the initrd module (the first module, per convention).
fn build_initrd(hhdm_offset: u64) -> Option<InitrdInfo> {
    let response = requests::MODULES.get_response()?;
    let module = response.modules().first()?;
    // Module addresses are HHDM-virtual; the kernel wants physical.
    let virt = module.addr() as u64;
    Some(InitrdInfo {
        phys_addr: PhysAddr::new(virt.wrapping_sub(hhdm_offset)),
        size: module.size(),
    })
}

/// Extracts the RSDP physical address.
fn build_rsdp(hhdm_offset: u64) -> Option<PhysAddr> {
    let response = requests::RSDP.get_response()?;
    let addr = response.address() as u64;
    // Older protocol revisions report an HHDM-virtual pointer.
    let phys = if addr >= hhdm_offset {
        addr - hhdm_offset
    } else {
        addr
    };
    Some(PhysAddr::new(phys))
}

/// Extracts the kernel command line from the executable file response.
fn build_cmdline() -> Option<&'static str> {
    let response = requests::EXECUTABLE_FILE.get_response()?;
    let cmdline = response.file().cmdline();
    let text = core::str::from_utf8(cmdline.to_bytes()).ok()?;
    if text.is_empty() { None } else { Some(text) }
}

/// Limine entry point: build [`BootInfoData`] and hand over to the kernel.
#[unsafe(no_mangle)]
extern "C" fn _start() -> ! {
    assert!(requests::BASE_REVISION.is_supported());

    // Serial first so every later failure is visible.
    let serial = Uart16550::new(COM1);
    // SAFETY: COM1 is the standard debug UART; init runs once.
    unsafe { serial.init() };
    helion_kernel::log::init_early_serial();

    let hhdm_offset = requests::HHDM
        .get_response()
        .expect("bootloader provided no HHDM")
        .offset();

    let boot_info = BootInfoData {
        memory_map: build_memory_map(),
        hhdm_offset,
        page_table_root: read_cr3(),
        framebuffers: build_framebuffers(),
        rsdp_address: build_rsdp(hhdm_offset),
        command_line: build_cmdline(),
        initrd: build_initrd(hhdm_offset),
    };

    helion_kernel::kernel_init(&boot_info)
}
