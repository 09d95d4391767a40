//! Physical Memory Manager
//!
//! Page-frame allocator over a bitmap covering all of physical memory.
//! One bit per 4 KiB frame: set means used/reserved, clear means free.
//! The bitmap itself is carved out of the largest usable region reported
//! by the bootloader memory map and lives in the physical direct map.
//!
//! Allocation is first-fit: a linear scan for `count` contiguous clear
//! bits. All regions the firmware does not mark usable stay reserved, as
//! does everything below the 1 MiB low-memory floor.

use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
#[cfg(feature = "testing")]
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

use crate::memory::layout::{LOW_MEMORY_FLOOR, PAGE_SIZE};

/// The global frame bitmap, created once at boot.
static FRAME_BITMAP: Mutex<Option<FrameBitmap>> = Mutex::new(None);

/// Test-only flag to simulate OOM conditions.
///
/// When set, every allocation returns `None`, so callers' failure paths
/// (heap growth, page-table creation) can be exercised.
#[cfg(feature = "testing")]
static SIMULATE_OOM: AtomicBool = AtomicBool::new(false);

/// Enable OOM simulation for testing.
///
/// # Warning
/// Only use this for brief tests! Extended OOM simulation will crash the
/// kernel.
#[cfg(feature = "testing")]
pub fn enable_oom_simulation() {
    log::warn!("PMM: OOM simulation ENABLED - all frame allocations will fail");
    SIMULATE_OOM.store(true, Ordering::SeqCst);
}

/// Disable OOM simulation.
#[cfg(feature = "testing")]
pub fn disable_oom_simulation() {
    SIMULATE_OOM.store(false, Ordering::SeqCst);
    log::info!("PMM: OOM simulation disabled - frame allocations restored");
}

/// Frame-level statistics for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmmStats {
    /// Frames the firmware map made available to the allocator
    pub total_frames: usize,
    /// Frames currently handed out or reserved out of the usable set
    pub used_frames: usize,
    /// Frames currently free
    pub free_frames: usize,
}

/// A bitmap over physical page frames.
///
/// Covers frames `0..frame_count`; frames outside any usable region stay
/// permanently set (reserved). Separated from the global so the invariant
/// logic can be driven directly by unit tests over borrowed storage.
pub struct FrameBitmap {
    /// One bit per frame, set = used. Lives in the direct map in the
    /// kernel; tests hand in leaked heap storage.
    bits: &'static mut [u64],
    /// Number of frames covered by the bitmap
    frame_count: usize,
    /// Frames ever marked usable (denominator for the stats)
    usable_frames: usize,
    /// Frames currently free
    free_frames: usize,
}

impl FrameBitmap {
    /// Create a bitmap with every frame reserved.
    ///
    /// `bits` must hold at least `frame_count / 64` (rounded up) words.
    pub fn new(bits: &'static mut [u64], frame_count: usize) -> Self {
        assert!(bits.len() * 64 >= frame_count, "bitmap storage too small");
        for word in bits.iter_mut() {
            *word = !0u64;
        }
        FrameBitmap {
            bits,
            frame_count,
            usable_frames: 0,
            free_frames: 0,
        }
    }

    #[inline]
    fn is_used(&self, frame: usize) -> bool {
        self.bits[frame / 64] & (1u64 << (frame % 64)) != 0
    }

    #[inline]
    fn set_used(&mut self, frame: usize) {
        self.bits[frame / 64] |= 1u64 << (frame % 64);
    }

    #[inline]
    fn set_free(&mut self, frame: usize) {
        self.bits[frame / 64] &= !(1u64 << (frame % 64));
    }

    /// Whether a frame index is currently free.
    pub fn is_frame_free(&self, frame: usize) -> bool {
        frame < self.frame_count && !self.is_used(frame)
    }

    /// Mark `[addr, addr + len)` usable and free.
    ///
    /// Called only during init while walking the firmware map. Partial
    /// pages at either edge are clipped inward: a frame is only freed if
    /// it lies entirely inside the region.
    pub fn mark_region_usable(&mut self, addr: u64, len: u64) {
        let first = addr.div_ceil(PAGE_SIZE as u64) as usize;
        let last = ((addr + len) / PAGE_SIZE as u64) as usize;
        for frame in first..last.min(self.frame_count) {
            if self.is_used(frame) {
                self.set_free(frame);
                self.usable_frames += 1;
                self.free_frames += 1;
            }
        }
    }

    /// Mark every frame overlapping `[addr, addr + len)` as used.
    ///
    /// Idempotent: frames that are already used are left untouched and
    /// the counters stay consistent.
    pub fn reserve_range(&mut self, addr: u64, len: u64) {
        let first = (addr / PAGE_SIZE as u64) as usize;
        let last = (addr + len).div_ceil(PAGE_SIZE as u64) as usize;
        for frame in first..last.min(self.frame_count) {
            if !self.is_used(frame) {
                self.set_used(frame);
                self.free_frames -= 1;
            }
        }
    }

    /// Allocate `count` contiguous frames, first-fit.
    ///
    /// Returns the physical address of the first frame, or `None` if no
    /// run of `count` free frames exists. `count == 0` always fails.
    pub fn allocate(&mut self, count: usize) -> Option<u64> {
        self.allocate_below(count, u64::MAX)
    }

    /// Allocate `count` contiguous frames ending below `limit`.
    ///
    /// Used for DMA memory on controllers without 64-bit addressing.
    pub fn allocate_below(&mut self, count: usize, limit: u64) -> Option<u64> {
        if count == 0 || count > self.free_frames {
            return None;
        }
        let limit_frame = (limit / PAGE_SIZE as u64).min(self.frame_count as u64) as usize;
        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for frame in 0..limit_frame {
            if self.is_used(frame) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = frame;
            }
            run_len += 1;
            if run_len == count {
                for f in run_start..run_start + count {
                    self.set_used(f);
                }
                self.free_frames -= count;
                return Some((run_start * PAGE_SIZE) as u64);
            }
        }
        None
    }

    /// Free `count` frames starting at `addr`.
    ///
    /// Frames that are already free are skipped; the number of such
    /// double-freed frames is returned so the caller can report them
    /// after dropping the bitmap lock.
    pub fn free(&mut self, addr: u64, count: usize) -> usize {
        let first = (addr / PAGE_SIZE as u64) as usize;
        let mut already_free = 0usize;
        for frame in first..(first + count).min(self.frame_count) {
            if self.is_used(frame) {
                self.set_free(frame);
                self.free_frames += 1;
            } else {
                already_free += 1;
            }
        }
        already_free
    }

    /// Current statistics. `total = used + free` always holds.
    pub fn stats(&self) -> PmmStats {
        PmmStats {
            total_frames: self.usable_frames,
            used_frames: self.usable_frames - self.free_frames,
            free_frames: self.free_frames,
        }
    }
}

/// Initialize the global frame bitmap from the bootloader memory map.
///
/// Regions not marked `Usable` stay reserved, as does everything below
/// the low-memory floor. The bitmap's own backing frames are carved from
/// the largest usable region and reserved before the allocator goes live.
pub fn init(memory_regions: &MemoryRegions) {
    // Highest usable physical address bounds the bitmap.
    let mut max_addr = 0u64;
    let mut largest: Option<(u64, u64)> = None;
    for region in memory_regions.iter() {
        if region.kind != MemoryRegionKind::Usable || region.end <= LOW_MEMORY_FLOOR {
            continue;
        }
        let start = region.start.max(LOW_MEMORY_FLOOR);
        max_addr = max_addr.max(region.end);
        let len = region.end - start;
        if largest.map_or(true, |(_, l)| len > l) {
            largest = Some((start, len));
        }
    }

    let frame_count = (max_addr / PAGE_SIZE as u64) as usize;
    let bitmap_bytes = frame_count.div_ceil(8);
    let bitmap_words = bitmap_bytes.div_ceil(8);

    let (bitmap_phys, region_len) = largest.expect("no usable memory regions");
    assert!(
        (bitmap_words * 8) as u64 <= region_len,
        "largest usable region cannot hold the frame bitmap"
    );

    // The bitmap lives at the front of the largest usable region and is
    // accessed through the physical direct map.
    let bitmap_virt = crate::memory::phys_to_virt(PhysAddr::new(bitmap_phys));
    let storage: &'static mut [u64] =
        unsafe { core::slice::from_raw_parts_mut(bitmap_virt.as_mut_ptr(), bitmap_words) };

    let mut bitmap = FrameBitmap::new(storage, frame_count);
    let mut usable_bytes = 0u64;
    let mut region_count = 0usize;
    for region in memory_regions.iter() {
        if region.kind != MemoryRegionKind::Usable || region.end <= LOW_MEMORY_FLOOR {
            continue;
        }
        let start = region.start.max(LOW_MEMORY_FLOOR);
        bitmap.mark_region_usable(start, region.end - start);
        usable_bytes += region.end - start;
        region_count += 1;
    }

    // The bitmap's own frames must never be handed out.
    bitmap.reserve_range(bitmap_phys, (bitmap_words * 8) as u64);

    let stats = bitmap.stats();
    *FRAME_BITMAP.lock() = Some(bitmap);

    log::info!(
        "PMM: {} MiB usable in {} regions, {} frames tracked, bitmap at {:#x} ({} KiB)",
        usable_bytes / (1024 * 1024),
        region_count,
        stats.total_frames,
        bitmap_phys,
        (bitmap_words * 8) / 1024
    );
}

/// Allocate `count` contiguous physical frames.
///
/// Returns `None` when no contiguous run exists (or when OOM simulation
/// is active in test builds). Never panics.
pub fn allocate_frames(count: usize) -> Option<PhysAddr> {
    #[cfg(feature = "testing")]
    if SIMULATE_OOM.load(Ordering::SeqCst) {
        log::trace!("PMM: OOM simulation active, returning None");
        return None;
    }

    let mut guard = FRAME_BITMAP.lock();
    let bitmap = guard.as_mut()?;
    bitmap.allocate(count).map(PhysAddr::new)
}

/// Allocate a single physical frame.
pub fn allocate_frame() -> Option<PhysAddr> {
    allocate_frames(1)
}

/// Allocate `count` contiguous frames wholly below `limit`.
pub fn allocate_frames_below(count: usize, limit: u64) -> Option<PhysAddr> {
    #[cfg(feature = "testing")]
    if SIMULATE_OOM.load(Ordering::SeqCst) {
        return None;
    }

    let mut guard = FRAME_BITMAP.lock();
    let bitmap = guard.as_mut()?;
    bitmap.allocate_below(count, limit).map(PhysAddr::new)
}

/// Free `count` frames starting at `addr`.
///
/// Releasing a frame that is already free is reported but does not
/// corrupt allocator state.
pub fn free_frames(addr: PhysAddr, count: usize) {
    let already_free = {
        let mut guard = FRAME_BITMAP.lock();
        match guard.as_mut() {
            Some(bitmap) => bitmap.free(addr.as_u64(), count),
            None => return,
        }
    };
    // Lock dropped before logging.
    if already_free > 0 {
        log::warn!(
            "PMM: double free of {} frame(s) in range {:#x}..{:#x}",
            already_free,
            addr.as_u64(),
            addr.as_u64() + (count * PAGE_SIZE) as u64
        );
    }
}

/// Free a single frame.
pub fn free_frame(addr: PhysAddr) {
    free_frames(addr, 1)
}

/// Mark every frame overlapping `[addr, addr + len)` as used. Idempotent.
pub fn reserve_range(addr: PhysAddr, len: u64) {
    let mut guard = FRAME_BITMAP.lock();
    if let Some(bitmap) = guard.as_mut() {
        bitmap.reserve_range(addr.as_u64(), len);
    }
}

/// A wrapper that lets the VMM walker pull frames from the global
/// allocator through the `x86_64` frame-allocator traits.
pub struct GlobalFrameAllocator;

unsafe impl FrameAllocator<Size4KiB> for GlobalFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        allocate_frame().map(PhysFrame::containing_address)
    }
}

impl FrameDeallocator<Size4KiB> for GlobalFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        free_frame(frame.start_address());
    }
}

/// Snapshot of the allocator counters.
pub fn stats() -> PmmStats {
    let guard = FRAME_BITMAP.lock();
    match guard.as_ref() {
        Some(bitmap) => bitmap.stats(),
        None => PmmStats {
            total_frames: 0,
            used_frames: 0,
            free_frames: 0,
        },
    }
}
