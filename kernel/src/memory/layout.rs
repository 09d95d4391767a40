//! Canonical kernel memory layout constants
//!
//! Defines the virtual-address windows the core systems carve up between
//! themselves: the higher-half split, the kernel heap window, and the MMIO
//! mapping window used by device drivers. All page tables share this layout.

/// Size of a page / page frame in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Base address for the kernel higher half.
///
/// PML4 entries 256..512 cover this range and are shared by reference
/// between every address space.
pub const KERNEL_HIGHER_HALF_BASE: u64 = 0xFFFF_8000_0000_0000;

/// First PML4 index belonging to the kernel half.
pub const KERNEL_PML4_START: usize = 256;

/// Low memory floor - no frame below 1 MiB is ever handed out.
/// This avoids frame 0x0 (null confusion), BIOS/firmware reserved areas
/// and legacy device memory (VGA, etc).
pub const LOW_MEMORY_FLOOR: u64 = 0x100000; // 1 MiB

/// Start of the kernel heap window.
pub const HEAP_START: u64 = 0x_4444_4444_0000;

/// Initial heap size mapped at init: 1 MiB.
pub const HEAP_INITIAL_SIZE: usize = 1024 * 1024;

/// Minimum heap growth step: 16 pages (64 KiB).
///
/// Growing in larger steps keeps the number of grow operations (and the
/// page-table churn they cause) low for allocation-heavy workloads.
pub const HEAP_MIN_GROWTH_PAGES: usize = 16;

/// Ceiling for heap growth: 64 MiB.
///
/// This bounds the virtual window reserved for the heap; requests that
/// would push the heap past this limit fail with a null return instead.
pub const HEAP_MAX_SIZE: usize = 64 * 1024 * 1024;

/// MMIO mapping window. Device BARs (e.g. the AHCI HBA) are mapped here
/// uncached, bump-allocated upward from this base.
pub const MMIO_BASE: u64 = 0xFFFF_E000_0000_0000;

/// Check if an address is in kernel space.
#[inline]
#[allow(dead_code)]
pub fn is_kernel_address(addr: u64) -> bool {
    addr >= KERNEL_HIGHER_HALF_BASE
}

/// Log the memory layout during initialization.
pub fn log_layout() {
    log::info!(
        "LAYOUT: heap window {:#x}..{:#x} (initial {} KiB, growth step {} pages)",
        HEAP_START,
        HEAP_START + HEAP_MAX_SIZE as u64,
        HEAP_INITIAL_SIZE / 1024,
        HEAP_MIN_GROWTH_PAGES
    );
    log::info!("LAYOUT: MMIO window base {:#x}", MMIO_BASE);
    log::info!(
        "LAYOUT: kernel half {:#x}.. (PML4[{}..512])",
        KERNEL_HIGHER_HALF_BASE,
        KERNEL_PML4_START
    );
}

// The heap window must stay clear of both canonical boundaries.
const _: () = assert!(
    HEAP_START + (HEAP_MAX_SIZE as u64) < 0x0000_8000_0000_0000,
    "Heap window crosses into the non-canonical hole!"
);
