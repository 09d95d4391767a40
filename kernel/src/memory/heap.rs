//! Kernel heap
//!
//! Variable-size allocator over the virtually contiguous heap window.
//! The managed region is a doubly-linked (via `prev_phys`) sequence of
//! headers, each followed by its payload; a separate singly-linked free
//! list, sorted by ascending address, threads through exactly the free
//! blocks. Allocation is first-fit with splitting; free coalesces with
//! both physical neighbors, so no two adjacent free blocks survive any
//! public operation.
//!
//! Every header carries a magic word that must agree with its used flag.
//! A mismatch means corruption (or a pointer the heap never produced)
//! and the operation is refused.
//!
//! The heap grows on demand: fresh frames come from the PMM and are
//! mapped at the current heap end through the VMM, so growth never
//! assumes physically contiguous frames.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use spin::Mutex;
use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

use crate::memory::layout::{
    HEAP_INITIAL_SIZE, HEAP_MAX_SIZE, HEAP_MIN_GROWTH_PAGES, HEAP_START, PAGE_SIZE,
};
use crate::memory::{pmm, vmm};

/// Alignment granularity; every block size is a multiple of this.
pub const ALIGN: usize = 16;

/// Smallest payload a block may carry.
const MIN_PAYLOAD: usize = 32;

/// Header stamp for a block that is handed out.
const USED_MAGIC: u32 = 0xA110_CA7E;

/// Header stamp for a block on the free list.
const FREE_MAGIC: u32 = 0xF4EE_B10C;

/// Low bit of `size_flags`: the block is in use.
const USED_FLAG: usize = 1;

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

#[inline]
fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Heap failure and corruption taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// Pointer does not lie inside the managed region
    OutOfRange,
    /// Header magic does not match a live allocation
    BadMagic,
    /// Block is already free
    DoubleFree,
    /// Chain walk found an inconsistency
    Corrupted(&'static str),
}

impl core::fmt::Display for HeapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HeapError::OutOfRange => write!(f, "pointer outside heap"),
            HeapError::BadMagic => write!(f, "header magic mismatch"),
            HeapError::DoubleFree => write!(f, "block already free"),
            HeapError::Corrupted(what) => write!(f, "heap corrupted: {}", what),
        }
    }
}

/// Block header preceding every payload.
///
/// `size_flags` holds the payload size (always a multiple of [`ALIGN`],
/// so the low bit is free to carry the used flag).
#[repr(C)]
struct BlockHeader {
    size_flags: usize,
    magic: u32,
    _reserved: u32,
    /// Physically previous header; null for the first block.
    prev_phys: *mut BlockHeader,
    /// Next block on the free list; meaningful for free blocks only.
    next_free: *mut BlockHeader,
}

impl BlockHeader {
    #[inline]
    fn size(&self) -> usize {
        self.size_flags & !USED_FLAG
    }

    #[inline]
    fn is_used(&self) -> bool {
        self.size_flags & USED_FLAG != 0
    }

    #[inline]
    fn set_used(&mut self, size: usize) {
        self.size_flags = size | USED_FLAG;
        self.magic = USED_MAGIC;
    }

    #[inline]
    fn set_free(&mut self, size: usize) {
        self.size_flags = size;
        self.magic = FREE_MAGIC;
    }
}

/// Heap usage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub total_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub block_count: usize,
    pub free_blocks: usize,
    pub allocations: u64,
    pub frees: u64,
    pub growths: u64,
}

/// The allocator core over one contiguous region.
///
/// Carries no locking and no growth policy of its own; [`KernelHeap`]
/// supplies both. Kept separate so the block and free-list invariants
/// can be exercised directly by unit tests over plain host memory.
pub struct HeapArena {
    start: usize,
    end: usize,
    free_list: *mut BlockHeader,
    allocations: u64,
    frees: u64,
    growths: u64,
}

// Raw block pointers never leave the arena's own region.
unsafe impl Send for HeapArena {}

impl HeapArena {
    /// Create an arena over `[start, start + size)`.
    ///
    /// # Safety
    /// The region must be mapped, writable, at least
    /// `HEADER_SIZE + MIN_PAYLOAD` bytes, 16-byte aligned and unused.
    pub unsafe fn new(start: usize, size: usize) -> Self {
        debug_assert!(start % ALIGN == 0);
        debug_assert!(size % ALIGN == 0);
        let first = start as *mut BlockHeader;
        (*first).set_free(size - HEADER_SIZE);
        (*first).prev_phys = ptr::null_mut();
        (*first).next_free = ptr::null_mut();
        HeapArena {
            start,
            end: start + size,
            free_list: first,
            allocations: 0,
            frees: 0,
            growths: 0,
        }
    }

    /// Physically next header, or null past the region end.
    #[inline]
    fn next_phys(&self, block: *mut BlockHeader) -> *mut BlockHeader {
        let next = unsafe { (block as usize) + HEADER_SIZE + (*block).size() };
        if next >= self.end {
            ptr::null_mut()
        } else {
            next as *mut BlockHeader
        }
    }

    /// Re-point the physically next block's back-link at `block`.
    #[inline]
    fn fix_backlink(&self, block: *mut BlockHeader) {
        let next = self.next_phys(block);
        if !next.is_null() {
            unsafe { (*next).prev_phys = block };
        }
    }

    /// Remove `block` from the free list.
    fn unlink_free(&mut self, block: *mut BlockHeader) {
        let mut cursor = self.free_list;
        if cursor == block {
            self.free_list = unsafe { (*block).next_free };
            return;
        }
        while !cursor.is_null() {
            let next = unsafe { (*cursor).next_free };
            if next == block {
                unsafe { (*cursor).next_free = (*block).next_free };
                return;
            }
            cursor = next;
        }
    }

    /// Insert `block` into the free list at its address-sorted position.
    fn insert_free(&mut self, block: *mut BlockHeader) {
        if self.free_list.is_null() || self.free_list > block {
            unsafe { (*block).next_free = self.free_list };
            self.free_list = block;
            return;
        }
        let mut cursor = self.free_list;
        unsafe {
            while !(*cursor).next_free.is_null() && (*cursor).next_free < block {
                cursor = (*cursor).next_free;
            }
            (*block).next_free = (*cursor).next_free;
            (*cursor).next_free = block;
        }
    }

    /// Allocate `size` bytes, 16-byte aligned. Null when nothing fits.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        let request = round_up(size.max(MIN_PAYLOAD), ALIGN);

        let mut block = self.free_list;
        while !block.is_null() {
            if unsafe { (*block).size() } >= request {
                break;
            }
            block = unsafe { (*block).next_free };
        }
        if block.is_null() {
            return ptr::null_mut();
        }

        self.unlink_free(block);
        unsafe {
            let available = (*block).size();
            if available >= request + HEADER_SIZE + MIN_PAYLOAD {
                // Split: the tail becomes a new free block.
                let tail = ((block as usize) + HEADER_SIZE + request) as *mut BlockHeader;
                (*tail).set_free(available - request - HEADER_SIZE);
                (*tail).prev_phys = block;
                (*tail).next_free = ptr::null_mut();
                (*block).size_flags = request;
                self.fix_backlink(tail);
                self.insert_free(tail);
            }
            (*block).set_used((*block).size());
        }
        self.allocations += 1;
        ((block as usize) + HEADER_SIZE) as *mut u8
    }

    /// Allocate with an alignment above the granularity.
    ///
    /// Over-allocates by `align + 8`, rounds the returned pointer up and
    /// stashes the original pointer immediately before it so the free
    /// path can find the real block.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> *mut u8 {
        if align <= ALIGN {
            return self.allocate(size);
        }
        let raw = self.allocate(size + align + core::mem::size_of::<usize>());
        if raw.is_null() {
            return ptr::null_mut();
        }
        let aligned = round_up(raw as usize + core::mem::size_of::<usize>(), align);
        unsafe {
            *((aligned - core::mem::size_of::<usize>()) as *mut usize) = raw as usize;
        }
        aligned as *mut u8
    }

    /// Look up and check the header for a payload pointer.
    fn header_for(&self, payload: *mut u8) -> Result<*mut BlockHeader, HeapError> {
        let addr = payload as usize;
        if addr < self.start + HEADER_SIZE || addr >= self.end || addr % ALIGN != 0 {
            return Err(HeapError::OutOfRange);
        }
        let header = (addr - HEADER_SIZE) as *mut BlockHeader;
        unsafe {
            if (*header).magic == FREE_MAGIC && !(*header).is_used() {
                return Err(HeapError::DoubleFree);
            }
            if (*header).magic != USED_MAGIC || !(*header).is_used() {
                return Err(HeapError::BadMagic);
            }
        }
        Ok(header)
    }

    /// Free a payload pointer. Null is a no-op; a pointer the heap did
    /// not produce is refused without touching any state.
    pub fn free(&mut self, payload: *mut u8) -> Result<(), HeapError> {
        if payload.is_null() {
            return Ok(());
        }
        let block = self.header_for(payload)?;
        unsafe {
            (*block).set_free((*block).size());
        }
        self.frees += 1;
        self.release(block);
        Ok(())
    }

    /// Free through an aligned-allocation pointer.
    pub fn free_aligned(&mut self, payload: *mut u8, align: usize) -> Result<(), HeapError> {
        if align <= ALIGN {
            return self.free(payload);
        }
        if payload.is_null() {
            return Ok(());
        }
        let addr = payload as usize;
        if addr <= self.start || addr >= self.end {
            return Err(HeapError::OutOfRange);
        }
        let raw = unsafe { *((addr - core::mem::size_of::<usize>()) as *const usize) };
        self.free(raw as *mut u8)
    }

    /// Put an already-marked-free block back, coalescing both ways.
    fn release(&mut self, block: *mut BlockHeader) {
        unsafe {
            // Absorb the physically next block if it is free.
            let next = self.next_phys(block);
            if !next.is_null() && !(*next).is_used() {
                self.unlink_free(next);
                (*block).set_free((*block).size() + HEADER_SIZE + (*next).size());
                self.fix_backlink(block);
            }
            // Let a free physical predecessor absorb this block; it is
            // already on the free list at the right position.
            let prev = (*block).prev_phys;
            if !prev.is_null() && !(*prev).is_used() {
                (*prev).set_free((*prev).size() + HEADER_SIZE + (*block).size());
                self.fix_backlink(prev);
            } else {
                self.insert_free(block);
            }
        }
    }

    /// Resize an allocation.
    ///
    /// Null grows from nothing, zero shrinks to nothing. A shrink keeps
    /// the block; a grow first tries to absorb a free physical neighbor
    /// and otherwise moves the payload.
    pub fn reallocate(&mut self, payload: *mut u8, new_size: usize) -> Result<*mut u8, HeapError> {
        if payload.is_null() {
            return Ok(self.allocate(new_size));
        }
        if new_size == 0 {
            self.free(payload)?;
            return Ok(ptr::null_mut());
        }

        let block = self.header_for(payload)?;
        let request = round_up(new_size.max(MIN_PAYLOAD), ALIGN);
        let current = unsafe { (*block).size() };

        if request <= current {
            return Ok(payload);
        }

        unsafe {
            let next = self.next_phys(block);
            if !next.is_null()
                && !(*next).is_used()
                && current + HEADER_SIZE + (*next).size() >= request
            {
                // Grow in place into the free neighbor.
                self.unlink_free(next);
                let merged = current + HEADER_SIZE + (*next).size();
                (*block).set_used(merged);
                self.fix_backlink(block);
                if merged >= request + HEADER_SIZE + MIN_PAYLOAD {
                    let tail = ((block as usize) + HEADER_SIZE + request) as *mut BlockHeader;
                    (*tail).set_free(merged - request - HEADER_SIZE);
                    (*tail).prev_phys = block;
                    (*tail).next_free = ptr::null_mut();
                    (*block).set_used(request);
                    self.fix_backlink(tail);
                    self.insert_free(tail);
                }
                return Ok(payload);
            }
        }

        // Move: allocate fresh, copy the old payload, release the old.
        let fresh = self.allocate(new_size);
        if fresh.is_null() {
            return Ok(ptr::null_mut());
        }
        unsafe {
            ptr::copy_nonoverlapping(payload, fresh, current.min(new_size));
        }
        self.free(payload)?;
        Ok(fresh)
    }

    /// Append `size` bytes of freshly mapped memory at the region end.
    ///
    /// The new space becomes one free block, coalesced with the last
    /// block when that one is free.
    ///
    /// # Safety
    /// `[end, end + size)` must be mapped, writable and 16-byte aligned.
    pub unsafe fn append_region(&mut self, size: usize) {
        let block = self.end as *mut BlockHeader;
        let last = self.last_block();
        (*block).set_free(size - HEADER_SIZE);
        (*block).prev_phys = last;
        (*block).next_free = ptr::null_mut();
        self.end += size;
        self.growths += 1;
        self.release(block);
    }

    /// Walk to the physically last block.
    fn last_block(&self) -> *mut BlockHeader {
        let mut block = self.start as *mut BlockHeader;
        loop {
            let next = self.next_phys(block);
            if next.is_null() {
                return block;
            }
            block = next;
        }
    }

    /// Total bytes under management.
    pub fn total_bytes(&self) -> usize {
        self.end - self.start
    }

    /// Walk the block chain and the free list, checking every invariant:
    /// magic/flag agreement, back-links, bounds, size accounting, free
    /// list membership and sortedness, and that coalescing left no two
    /// adjacent free blocks.
    pub fn validate(&self) -> Result<(), HeapError> {
        let mut addr = self.start;
        let mut prev: *mut BlockHeader = ptr::null_mut();
        let mut prev_free = false;
        let mut sum = 0usize;
        let mut free_blocks_in_chain = 0usize;

        while addr < self.end {
            let block = addr as *mut BlockHeader;
            let header = unsafe { &*block };
            let expected = if header.is_used() { USED_MAGIC } else { FREE_MAGIC };
            if header.magic != expected {
                return Err(HeapError::Corrupted("magic/flag mismatch"));
            }
            if header.prev_phys != prev {
                return Err(HeapError::Corrupted("broken back-chain"));
            }
            let size = header.size();
            if size < MIN_PAYLOAD || addr + HEADER_SIZE + size > self.end {
                return Err(HeapError::Corrupted("block size out of bounds"));
            }
            if !header.is_used() {
                if prev_free {
                    return Err(HeapError::Corrupted("adjacent free blocks"));
                }
                free_blocks_in_chain += 1;
            }
            prev_free = !header.is_used();
            sum += HEADER_SIZE + size;
            prev = block;
            addr += HEADER_SIZE + size;
        }
        if sum != self.end - self.start {
            return Err(HeapError::Corrupted("sizes do not sum to the region"));
        }

        // The free list must enumerate exactly the free blocks, sorted.
        let mut cursor = self.free_list;
        let mut listed = 0usize;
        let mut last = ptr::null_mut::<BlockHeader>();
        while !cursor.is_null() {
            if (cursor as usize) < self.start || (cursor as usize) >= self.end {
                return Err(HeapError::Corrupted("free list leaves the region"));
            }
            if unsafe { (*cursor).is_used() } {
                return Err(HeapError::Corrupted("used block on the free list"));
            }
            if !last.is_null() && cursor <= last {
                return Err(HeapError::Corrupted("free list not address-sorted"));
            }
            listed += 1;
            last = cursor;
            cursor = unsafe { (*cursor).next_free };
        }
        if listed != free_blocks_in_chain {
            return Err(HeapError::Corrupted("free list membership mismatch"));
        }
        Ok(())
    }

    /// Usage counters, computed from a chain walk.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            total_bytes: self.end - self.start,
            allocations: self.allocations,
            frees: self.frees,
            growths: self.growths,
            ..HeapStats::default()
        };
        let mut addr = self.start;
        while addr < self.end {
            let header = unsafe { &*(addr as *const BlockHeader) };
            stats.block_count += 1;
            if header.is_used() {
                stats.used_bytes += header.size();
            } else {
                stats.free_blocks += 1;
                stats.free_bytes += header.size();
            }
            addr += HEADER_SIZE + header.size();
        }
        stats
    }
}

/// The kernel heap: an arena behind a test-and-set lock plus the growth
/// policy that backs new virtual space with PMM frames through the VMM.
pub struct KernelHeap {
    arena: Mutex<Option<HeapArena>>,
}

static KERNEL_HEAP: KernelHeap = KernelHeap {
    arena: Mutex::new(None),
};

impl KernelHeap {
    fn allocate(&self, layout: Layout) -> *mut u8 {
        let mut guard = self.arena.lock();
        let arena = match guard.as_mut() {
            Some(arena) => arena,
            None => return ptr::null_mut(),
        };

        let ptr = Self::allocate_in(arena, layout);
        if !ptr.is_null() {
            return ptr;
        }

        // No block fits: grow and retry once.
        let need = layout.size() + layout.align() + HEADER_SIZE + core::mem::size_of::<usize>();
        if !grow(arena, need) {
            drop(guard);
            log::warn!(
                "heap: allocation of {} bytes (align {}) failed, growth exhausted",
                layout.size(),
                layout.align()
            );
            return ptr::null_mut();
        }
        Self::allocate_in(arena, layout)
    }

    fn allocate_in(arena: &mut HeapArena, layout: Layout) -> *mut u8 {
        if layout.align() <= ALIGN {
            arena.allocate(layout.size())
        } else {
            arena.allocate_aligned(layout.size(), layout.align())
        }
    }

    fn deallocate(&self, payload: *mut u8, layout: Layout) {
        let result = {
            let mut guard = self.arena.lock();
            match guard.as_mut() {
                Some(arena) => arena.free_aligned(payload, layout.align()),
                None => Ok(()),
            }
        };
        // Lock dropped before logging.
        if let Err(err) = result {
            log::error!("heap: refusing free of {:p}: {}", payload, err);
        }
    }

    fn reallocate(&self, payload: *mut u8, new_size: usize) -> *mut u8 {
        let result = {
            let mut guard = self.arena.lock();
            match guard.as_mut() {
                Some(arena) => arena.reallocate(payload, new_size),
                None => Ok(ptr::null_mut()),
            }
        };
        match result {
            Ok(ptr) => ptr,
            Err(err) => {
                log::error!("heap: refusing realloc of {:p}: {}", payload, err);
                ptr::null_mut()
            }
        }
    }
}

/// Grow the heap by at least `need` bytes, page-granular.
///
/// Fresh frames are mapped one page at a time at the current heap end;
/// on any failure the pages mapped so far are unwound and the heap is
/// left exactly as before.
fn grow(arena: &mut HeapArena, need: usize) -> bool {
    let pages = (need.div_ceil(PAGE_SIZE)).max(HEAP_MIN_GROWTH_PAGES);
    if arena.total_bytes() + pages * PAGE_SIZE > HEAP_MAX_SIZE {
        return false;
    }

    let base = arena.end;
    for i in 0..pages {
        let virt = VirtAddr::new((base + i * PAGE_SIZE) as u64);
        let frame = match pmm::allocate_frame() {
            Some(frame) => frame,
            None => {
                unwind_growth(base, i);
                return false;
            }
        };
        if vmm::map_page(virt, frame, PageTableFlags::PRESENT | PageTableFlags::WRITABLE).is_err() {
            pmm::free_frame(frame);
            unwind_growth(base, i);
            return false;
        }
    }

    unsafe { arena.append_region(pages * PAGE_SIZE) };
    true
}

fn unwind_growth(base: usize, mapped: usize) {
    for j in 0..mapped {
        let virt = VirtAddr::new((base + j * PAGE_SIZE) as u64);
        if let Some(phys) = vmm::unmap_page(virt) {
            pmm::free_frame(phys);
        }
    }
}

/// Map the initial heap window and bring the allocator up.
pub fn init() -> Result<(), &'static str> {
    let pages = HEAP_INITIAL_SIZE / PAGE_SIZE;
    for i in 0..pages {
        let virt = VirtAddr::new(HEAP_START + (i * PAGE_SIZE) as u64);
        let frame = pmm::allocate_frame().ok_or("out of memory for initial heap")?;
        vmm::map_page(virt, frame, PageTableFlags::PRESENT | PageTableFlags::WRITABLE)
            .map_err(|_| "failed to map heap page")?;
    }

    let arena = unsafe { HeapArena::new(HEAP_START as usize, HEAP_INITIAL_SIZE) };
    *KERNEL_HEAP.arena.lock() = Some(arena);

    log::info!(
        "Heap initialized at {:#x} with {} KiB (max {} MiB)",
        HEAP_START,
        HEAP_INITIAL_SIZE / 1024,
        HEAP_MAX_SIZE / (1024 * 1024)
    );
    Ok(())
}

/// Snapshot of the heap counters.
pub fn stats() -> HeapStats {
    let guard = KERNEL_HEAP.arena.lock();
    guard.as_ref().map(|a| a.stats()).unwrap_or_default()
}

/// Run the full invariant walk over the live heap.
pub fn validate() -> Result<(), HeapError> {
    let guard = KERNEL_HEAP.arena.lock();
    match guard.as_ref() {
        Some(arena) => arena.validate(),
        None => Ok(()),
    }
}

struct KernelAllocator;

#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: KernelAllocator = KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        KERNEL_HEAP.allocate(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        KERNEL_HEAP.deallocate(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= ALIGN {
            return KERNEL_HEAP.reallocate(ptr, new_size);
        }
        // Over-aligned blocks carry a stashed base pointer; move them
        // the conservative way.
        let fresh = KERNEL_HEAP.allocate(Layout::from_size_align_unchecked(
            new_size,
            layout.align(),
        ));
        if !fresh.is_null() {
            ptr::copy_nonoverlapping(ptr, fresh, layout.size().min(new_size));
            KERNEL_HEAP.deallocate(ptr, layout);
        }
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Arena over a leaked, page-aligned host buffer.
    fn make_arena(size: usize) -> HeapArena {
        let buf = alloc::vec![0u8; size + PAGE_SIZE].leak();
        let base = round_up(buf.as_mut_ptr() as usize, PAGE_SIZE);
        unsafe { HeapArena::new(base, size) }
    }

    #[test]
    fn split_and_first_fit_reuse() {
        let mut arena = make_arena(64 * 1024);
        assert_eq!(arena.stats().block_count, 1);

        let a = arena.allocate(100);
        let b = arena.allocate(100);
        let c = arena.allocate(100);
        assert!(!a.is_null() && !b.is_null() && !c.is_null());
        arena.validate().unwrap();

        arena.free(b).unwrap();
        arena.validate().unwrap();

        // First fit hands the freed hole back.
        let d = arena.allocate(100);
        assert_eq!(d, b);
        arena.validate().unwrap();

        arena.free(a).unwrap();
        arena.free(c).unwrap();
        arena.free(d).unwrap();
        arena.validate().unwrap();

        // Everything coalesced back into a single free block.
        let stats = arena.stats();
        assert_eq!(stats.block_count, 1);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.used_bytes, 0);
        assert_eq!(stats.free_bytes, stats.total_bytes - HEADER_SIZE);
    }

    #[test]
    fn allocate_free_restores_exact_state() {
        let mut arena = make_arena(32 * 1024);
        let before = arena.stats();

        let ptr = arena.allocate(1000);
        assert!(!ptr.is_null());
        arena.free(ptr).unwrap();
        arena.validate().unwrap();

        let after = arena.stats();
        assert_eq!(after.free_bytes, before.free_bytes);
        assert_eq!(after.block_count, before.block_count);
        assert_eq!(after.free_blocks, before.free_blocks);
    }

    #[test]
    fn free_of_null_is_noop() {
        let mut arena = make_arena(16 * 1024);
        assert_eq!(arena.free(ptr::null_mut()), Ok(()));
        assert_eq!(arena.stats().frees, 0);
    }

    #[test]
    fn foreign_pointer_is_refused() {
        let mut arena = make_arena(16 * 1024);
        let ptr = arena.allocate(64);

        let mut stack_value = 0u8;
        let err = arena.free(&mut stack_value as *mut u8);
        assert_eq!(err, Err(HeapError::OutOfRange));

        // A pointer inside the heap but not a payload start is refused.
        let inner = unsafe { ptr.add(16) };
        assert!(arena.free(inner).is_err());

        arena.validate().unwrap();
        arena.free(ptr).unwrap();
    }

    #[test]
    fn double_free_is_refused() {
        let mut arena = make_arena(16 * 1024);
        let ptr = arena.allocate(64);
        arena.free(ptr).unwrap();
        let stats = arena.stats();
        assert_eq!(arena.free(ptr), Err(HeapError::DoubleFree));
        assert_eq!(arena.stats(), stats);
        arena.validate().unwrap();
    }

    #[test]
    fn payload_is_writable_and_stable() {
        let mut arena = make_arena(16 * 1024);
        let a = arena.allocate(256);
        let b = arena.allocate(256);
        unsafe {
            core::ptr::write_bytes(a, 0xAB, 256);
            core::ptr::write_bytes(b, 0xCD, 256);
            for i in 0..256 {
                assert_eq!(*a.add(i), 0xAB);
                assert_eq!(*b.add(i), 0xCD);
            }
        }
        arena.free(a).unwrap();
        unsafe {
            for i in 0..256 {
                assert_eq!(*b.add(i), 0xCD);
            }
        }
        arena.free(b).unwrap();
    }

    #[test]
    fn aligned_allocation() {
        let mut arena = make_arena(64 * 1024);
        for align in [32usize, 64, 256, 4096] {
            let ptr = arena.allocate_aligned(100, align);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % align, 0, "alignment {} violated", align);
            unsafe { core::ptr::write_bytes(ptr, 0x5A, 100) };
            arena.free_aligned(ptr, align).unwrap();
            arena.validate().unwrap();
        }
        // All aligned round-trips leave a pristine heap.
        assert_eq!(arena.stats().block_count, 1);
    }

    #[test]
    fn realloc_null_allocates_and_zero_frees() {
        let mut arena = make_arena(16 * 1024);
        let ptr = arena.reallocate(ptr::null_mut(), 128).unwrap();
        assert!(!ptr.is_null());
        let out = arena.reallocate(ptr, 0).unwrap();
        assert!(out.is_null());
        assert_eq!(arena.stats().block_count, 1);
    }

    #[test]
    fn realloc_shrink_keeps_block() {
        let mut arena = make_arena(16 * 1024);
        let ptr = arena.allocate(512);
        let same = arena.reallocate(ptr, 64).unwrap();
        assert_eq!(same, ptr);
        arena.validate().unwrap();
        arena.free(ptr).unwrap();
    }

    #[test]
    fn realloc_grows_in_place_into_free_neighbor() {
        let mut arena = make_arena(64 * 1024);
        let a = arena.allocate(128);
        // `a` is the first block and its physical successor is the big
        // free tail, so growing must not move the payload.
        unsafe { core::ptr::write_bytes(a, 0x11, 128) };
        let grown = arena.reallocate(a, 4096).unwrap();
        assert_eq!(grown, a);
        unsafe {
            for i in 0..128 {
                assert_eq!(*grown.add(i), 0x11);
            }
        }
        arena.validate().unwrap();
        arena.free(grown).unwrap();
    }

    #[test]
    fn realloc_moves_when_pinned() {
        let mut arena = make_arena(64 * 1024);
        let a = arena.allocate(128);
        let _pin = arena.allocate(128); // blocks in-place growth
        unsafe { core::ptr::write_bytes(a, 0x22, 128) };

        let moved = arena.reallocate(a, 8192).unwrap();
        assert!(!moved.is_null());
        assert_ne!(moved, a);
        unsafe {
            for i in 0..128 {
                assert_eq!(*moved.add(i), 0x22);
            }
        }
        arena.validate().unwrap();
    }

    #[test]
    fn growth_appends_and_coalesces() {
        // Region carved so a second window directly follows the first.
        let buf = alloc::vec![0u8; 48 * 1024].leak();
        let base = round_up(buf.as_mut_ptr() as usize, PAGE_SIZE);
        let mut arena = unsafe { HeapArena::new(base, 16 * 1024) };

        // Exhausted: a block bigger than the arena cannot be served.
        assert!(arena.allocate(32 * 1024).is_null());

        unsafe { arena.append_region(16 * 1024) };
        arena.validate().unwrap();
        // The appended window merged with the free tail: still one block.
        assert_eq!(arena.stats().block_count, 1);
        assert_eq!(arena.stats().growths, 1);

        let ptr = arena.allocate(20 * 1024);
        assert!(!ptr.is_null());
        arena.free(ptr).unwrap();
        arena.validate().unwrap();
    }

    #[test]
    fn exhaustion_returns_null_without_damage() {
        let mut arena = make_arena(8 * 1024);
        let ptr = arena.allocate(64 * 1024);
        assert!(ptr.is_null());
        arena.validate().unwrap();
        assert_eq!(arena.stats().allocations, 0);
    }

    #[test]
    fn many_small_allocations_churn() {
        let mut arena = make_arena(64 * 1024);
        let mut live = alloc::vec::Vec::new();
        for round in 0..8 {
            for i in 0..32 {
                let ptr = arena.allocate(24 + (i * 8) % 200);
                assert!(!ptr.is_null());
                live.push(ptr);
            }
            // Free every other allocation to shake the free list.
            let mut keep = alloc::vec::Vec::new();
            for (i, ptr) in live.drain(..).enumerate() {
                if (i + round) % 2 == 0 {
                    arena.free(ptr).unwrap();
                } else {
                    keep.push(ptr);
                }
            }
            live = keep;
            arena.validate().unwrap();
        }
        for ptr in live {
            arena.free(ptr).unwrap();
        }
        arena.validate().unwrap();
        assert_eq!(arena.stats().block_count, 1);
    }
}
