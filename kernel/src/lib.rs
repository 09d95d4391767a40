#![cfg_attr(not(test), no_std)]

//! AAAos kernel core systems
//!
//! The layers every other part of the kernel stands on: physical and
//! virtual memory management, the kernel heap, the AHCI SATA driver and
//! the FAT32 filesystem, plus the block-device and VFS seams that
//! connect them. Boot trampoline, interrupt dispatch, the shell and the
//! other device drivers live outside this crate and call in through
//! [`init`] and the module APIs.
//!
//! Built with `std` under `cfg(test)` so the pure layers (allocators,
//! page-table walker, FAT32 over a RAM disk) run as ordinary host
//! tests.

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod fs;
pub mod log_buffer;
pub mod logger;
pub mod memory;
pub mod serial;

use bootloader_api::info::MemoryRegions;
use x86_64::VirtAddr;

/// Bring the core systems up, in dependency order.
///
/// The caller (the boot path) supplies the physical-memory offset and
/// the firmware memory map. After this returns, allocation, storage and
/// the root filesystem are available.
pub fn init(physical_memory_offset: VirtAddr, memory_regions: &'static MemoryRegions) {
    serial::init();
    logger::init(log::LevelFilter::Info);

    memory::init(physical_memory_offset, memory_regions);

    match drivers::ahci::init() {
        Ok(count) => log::info!("AHCI: {} SATA device(s) ready", count),
        Err(err) => log::warn!("AHCI: {}", err),
    }

    match fs::fat32::init_root_fs() {
        Ok(()) => log::info!("Root filesystem mounted"),
        Err(err) => log::warn!("Root filesystem unavailable: {}", err),
    }
}

/// Halt forever; the tail of panic and shutdown paths.
pub fn hlt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}
