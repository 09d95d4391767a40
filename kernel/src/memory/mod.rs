//! Memory management
//!
//! Bottom layer of the core: physical frames (PMM), virtual mappings
//! (VMM) and the kernel heap, brought up in that order at boot. Also
//! home to the direct-map address helpers and the MMIO mapping window
//! used by device drivers.

pub mod heap;
pub mod layout;
pub mod pmm;
pub mod tlb;
pub mod vmm;

use bootloader_api::info::MemoryRegions;
use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

use layout::PAGE_SIZE;

/// Global physical memory offset for use throughout the kernel
static PHYSICAL_MEMORY_OFFSET: OnceCell<VirtAddr> = OnceCell::uninit();

/// Next available MMIO virtual address
static MMIO_NEXT_ADDR: Mutex<u64> = Mutex::new(layout::MMIO_BASE);

/// Initialize the memory subsystem.
///
/// Brings up, in order: the frame bitmap over the boot memory map, the
/// address-space manager over the boot page tables, and the kernel heap.
pub fn init(physical_memory_offset: VirtAddr, memory_regions: &'static MemoryRegions) {
    log::info!("Initializing memory management...");
    log::info!("Physical memory offset: {:?}", physical_memory_offset);

    PHYSICAL_MEMORY_OFFSET.init_once(|| physical_memory_offset);
    layout::log_layout();

    log::info!("Initializing frame allocator...");
    pmm::init(memory_regions);

    log::info!("Initializing virtual memory manager...");
    unsafe { vmm::init(physical_memory_offset) };

    log::info!("Initializing heap allocator...");
    heap::init().expect("heap initialization failed");

    log::info!("Memory management initialized");
}

/// Get the physical memory offset.
pub fn physical_memory_offset() -> VirtAddr {
    *PHYSICAL_MEMORY_OFFSET
        .get()
        .expect("physical memory offset not initialized")
}

/// Convert a physical address to a virtual address using the offset
/// mapping.
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    physical_memory_offset() + phys.as_u64()
}

/// Convert a kernel virtual address to a physical address.
///
/// Addresses inside the physical direct map are converted by offset
/// subtraction. Everything else (heap, MMIO window) goes through the
/// page-table walk, because those regions are mapped, not direct.
pub fn virt_to_phys(virt: VirtAddr) -> Option<PhysAddr> {
    let offset = physical_memory_offset();
    let addr = virt.as_u64();

    let in_heap =
        addr >= layout::HEAP_START && addr < layout::HEAP_START + layout::HEAP_MAX_SIZE as u64;
    if !in_heap && addr >= offset.as_u64() {
        let candidate = addr - offset.as_u64();
        // Physical RAM tops out well below 4 GiB on our targets; bigger
        // results mean the address was never in the direct map.
        if candidate < 0x1_0000_0000 {
            return Some(PhysAddr::new(candidate));
        }
    }

    vmm::translate(virt)
}

/// Map a physical MMIO region into kernel virtual address space.
///
/// Allocates virtual space from the MMIO window and maps it uncached
/// (write-through, cache-disable), as device registers require.
/// Returns the virtual address of the mapping.
pub fn map_mmio(phys_addr: PhysAddr, size: usize) -> Result<VirtAddr, &'static str> {
    let size_aligned = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let num_pages = size_aligned / PAGE_SIZE;

    let virt_base = {
        let mut next = MMIO_NEXT_ADDR.lock();
        let addr = *next;
        *next += size_aligned as u64;
        addr
    };

    log::info!(
        "MMIO: Mapping {:#x} -> {:#x} ({} pages)",
        phys_addr.as_u64(),
        virt_base,
        num_pages
    );

    let flags = PageTableFlags::PRESENT
        | PageTableFlags::WRITABLE
        | PageTableFlags::NO_CACHE
        | PageTableFlags::WRITE_THROUGH;

    for i in 0..num_pages {
        let page_virt = VirtAddr::new(virt_base + (i * PAGE_SIZE) as u64);
        let page_phys = phys_addr + (i * PAGE_SIZE) as u64;
        vmm::map_page(page_virt, page_phys, flags).map_err(|_| "failed to map MMIO page")?;
    }

    Ok(VirtAddr::new(virt_base))
}

/// Display comprehensive memory debug information.
pub fn debug_memory_info() {
    log::info!("=== Memory Debug Information ===");

    let pmm_stats = pmm::stats();
    log::info!(
        "PMM: {} frames total, {} used, {} free",
        pmm_stats.total_frames,
        pmm_stats.used_frames,
        pmm_stats.free_frames
    );

    let heap_stats = heap::stats();
    log::info!(
        "Heap: {} KiB total, {} KiB used in {} blocks ({} free blocks), {} allocs / {} frees / {} growths",
        heap_stats.total_bytes / 1024,
        heap_stats.used_bytes / 1024,
        heap_stats.block_count,
        heap_stats.free_blocks,
        heap_stats.allocations,
        heap_stats.frees,
        heap_stats.growths
    );

    match heap::validate() {
        Ok(()) => log::info!("Heap: invariants hold"),
        Err(err) => log::error!("Heap: VALIDATION FAILED: {}", err),
    }

    log::info!("=============================");
}
