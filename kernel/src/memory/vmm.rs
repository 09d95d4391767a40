//! Virtual Memory Manager
//!
//! Hand-rolled 4-level page-table walker and address-space manager.
//! All table access goes through the physical direct map: a table at
//! physical address `p` is read and written at `phys_offset + p`, which
//! also lets the walker run unmodified over a simulated physical arena
//! in host tests.
//!
//! Kernel mappings occupy PML4 entries 256..512 and are shared by
//! reference between every address space; user mappings live in the
//! lower half and are private to their PML4.

use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::structures::paging::{
    FrameAllocator, FrameDeallocator, PageTable, PageTableFlags, PhysFrame, Size4KiB,
};
use x86_64::{PhysAddr, VirtAddr};

use crate::memory::layout::{KERNEL_PML4_START, PAGE_SIZE};
use crate::memory::pmm::GlobalFrameAllocator;
use crate::memory::tlb;

/// Number of entries per page table at every level.
const ENTRIES_PER_TABLE: usize = 512;

/// VMM failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    /// Virtual address is not page-aligned
    MisalignedVirt,
    /// Physical address is not page-aligned
    MisalignedPhys,
    /// Out of physical frames for an intermediate table
    NoMemory,
    /// A huge-page mapping blocks the requested 4 KiB operation
    HugePage,
    /// Refusing to destroy the kernel root or the active root
    RootInUse,
}

impl core::fmt::Display for VmmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VmmError::MisalignedVirt => write!(f, "virtual address not page-aligned"),
            VmmError::MisalignedPhys => write!(f, "physical address not page-aligned"),
            VmmError::NoMemory => write!(f, "out of physical memory for page tables"),
            VmmError::HugePage => write!(f, "huge page mapping in the way"),
            VmmError::RootInUse => write!(f, "address space root is in use"),
        }
    }
}

#[inline]
fn pml4_index(virt: u64) -> usize {
    ((virt >> 39) & 0x1FF) as usize
}

#[inline]
fn pdpt_index(virt: u64) -> usize {
    ((virt >> 30) & 0x1FF) as usize
}

#[inline]
fn pd_index(virt: u64) -> usize {
    ((virt >> 21) & 0x1FF) as usize
}

#[inline]
fn pt_index(virt: u64) -> usize {
    ((virt >> 12) & 0x1FF) as usize
}

#[inline]
fn is_page_aligned(addr: u64) -> bool {
    addr % PAGE_SIZE as u64 == 0
}

/// The address-space manager.
///
/// Holds the direct-map offset used for table access, the kernel root
/// created at boot, and the root currently loaded in CR3.
pub struct AddressSpaceManager {
    phys_offset: VirtAddr,
    kernel_root: PhysAddr,
    active_root: PhysAddr,
}

impl AddressSpaceManager {
    /// Create a manager for an existing kernel root table.
    ///
    /// # Safety
    /// The complete physical memory must be mapped at `phys_offset`, and
    /// `kernel_root` must point at a valid, live PML4.
    pub unsafe fn new(phys_offset: VirtAddr, kernel_root: PhysAddr) -> Self {
        AddressSpaceManager {
            phys_offset,
            kernel_root,
            active_root: kernel_root,
        }
    }

    /// The boot-time kernel root.
    pub fn kernel_root(&self) -> PhysAddr {
        self.kernel_root
    }

    /// The root currently installed as the page-table base.
    pub fn active_root(&self) -> PhysAddr {
        self.active_root
    }

    /// Access a page table through the direct map.
    fn table_mut(&self, phys: PhysAddr) -> &'static mut PageTable {
        let virt = self.phys_offset + phys.as_u64();
        unsafe { &mut *(virt.as_mut_ptr::<PageTable>()) }
    }

    fn table(&self, phys: PhysAddr) -> &'static PageTable {
        let virt = self.phys_offset + phys.as_u64();
        unsafe { &*(virt.as_ptr::<PageTable>()) }
    }

    /// Allocate and zero a fresh page-table frame.
    fn new_table<A: FrameAllocator<Size4KiB>>(
        &self,
        allocator: &mut A,
    ) -> Result<PhysAddr, VmmError> {
        let frame = allocator.allocate_frame().ok_or(VmmError::NoMemory)?;
        let table = self.table_mut(frame.start_address());
        for i in 0..ENTRIES_PER_TABLE {
            table[i].set_unused();
        }
        Ok(frame.start_address())
    }

    /// Walk to the PT entry for `virt`, creating intermediate tables on
    /// demand. Intermediate entries are `PRESENT | WRITABLE`, plus
    /// `USER_ACCESSIBLE` when the final mapping is user-visible.
    fn walk_create<A: FrameAllocator<Size4KiB>>(
        &mut self,
        root: PhysAddr,
        virt: u64,
        user: bool,
        allocator: &mut A,
    ) -> Result<&'static mut x86_64::structures::paging::page_table::PageTableEntry, VmmError>
    {
        let mut intermediate = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if user {
            intermediate |= PageTableFlags::USER_ACCESSIBLE;
        }

        let mut table_phys = root;
        for index in [pml4_index(virt), pdpt_index(virt), pd_index(virt)] {
            let table = self.table_mut(table_phys);
            let entry = &mut table[index];
            if entry.is_unused() {
                let next = self.new_table(allocator)?;
                entry.set_addr(next, intermediate);
            } else if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                return Err(VmmError::HugePage);
            } else if user && !entry.flags().contains(PageTableFlags::USER_ACCESSIBLE) {
                // An intermediate created for a kernel mapping must open
                // up when a user mapping moves in underneath it.
                entry.set_flags(entry.flags() | PageTableFlags::USER_ACCESSIBLE);
            }
            table_phys = entry.addr();
        }

        let pt = self.table_mut(table_phys);
        Ok(&mut pt[pt_index(virt)])
    }

    /// Map one page in the given root. Both addresses must be
    /// page-aligned. Remapping a present page overwrites and logs.
    pub fn map_page_in<A: FrameAllocator<Size4KiB>>(
        &mut self,
        root: PhysAddr,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
        allocator: &mut A,
    ) -> Result<(), VmmError> {
        if !is_page_aligned(virt.as_u64()) {
            return Err(VmmError::MisalignedVirt);
        }
        if !is_page_aligned(phys.as_u64()) {
            return Err(VmmError::MisalignedPhys);
        }

        let user = flags.contains(PageTableFlags::USER_ACCESSIBLE);
        let entry = self.walk_create(root, virt.as_u64(), user, allocator)?;
        if !entry.is_unused() {
            log::debug!(
                "VMM: remapping {:#x} (was {:#x}, now {:#x})",
                virt.as_u64(),
                entry.addr().as_u64(),
                phys.as_u64()
            );
        }
        entry.set_addr(phys, flags | PageTableFlags::PRESENT);
        tlb::flush_page(virt);
        Ok(())
    }

    /// Map one page in the active root.
    pub fn map_page<A: FrameAllocator<Size4KiB>>(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
        allocator: &mut A,
    ) -> Result<(), VmmError> {
        let root = self.active_root;
        self.map_page_in(root, virt, phys, flags, allocator)
    }

    /// Map `count` consecutive pages.
    ///
    /// Atomic with respect to failure: if any page fails to map, the
    /// pages mapped so far are unmapped before the error returns.
    pub fn map_range_in<A: FrameAllocator<Size4KiB>>(
        &mut self,
        root: PhysAddr,
        virt: VirtAddr,
        phys: PhysAddr,
        count: usize,
        flags: PageTableFlags,
        allocator: &mut A,
    ) -> Result<(), VmmError> {
        for i in 0..count {
            let step = (i * PAGE_SIZE) as u64;
            if let Err(err) = self.map_page_in(root, virt + step, phys + step, flags, allocator) {
                for j in 0..i {
                    let undo = (j * PAGE_SIZE) as u64;
                    self.unmap_page_in(root, virt + undo);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Unmap one page from the given root.
    ///
    /// Returns the physical address that was mapped, or `None` if the
    /// page was not mapped. The TLB entry is invalidated either way.
    pub fn unmap_page_in(&mut self, root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
        let v = virt.as_u64();
        if !is_page_aligned(v) {
            return None;
        }

        let mut table_phys = root;
        for index in [pml4_index(v), pdpt_index(v), pd_index(v)] {
            let entry = &self.table(table_phys)[index];
            if entry.is_unused() || entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                return None;
            }
            table_phys = entry.addr();
        }

        let pt = self.table_mut(table_phys);
        let entry = &mut pt[pt_index(v)];
        if entry.is_unused() {
            return None;
        }
        let phys = entry.addr();
        entry.set_unused();
        tlb::flush_page(virt);
        Some(phys)
    }

    /// Unmap one page from the active root.
    pub fn unmap_page(&mut self, virt: VirtAddr) -> Option<PhysAddr> {
        let root = self.active_root;
        self.unmap_page_in(root, virt)
    }

    /// Translate a virtual address in the given root.
    ///
    /// Returns the physical address including the page offset, or `None`
    /// when nothing is mapped. Huge-page entries terminate the walk with
    /// the matching 2 MiB / 1 GiB offset.
    pub fn translate_in(&self, root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
        let v = virt.as_u64();

        let pml4e = &self.table(root)[pml4_index(v)];
        if pml4e.is_unused() {
            return None;
        }

        let pdpte = &self.table(pml4e.addr())[pdpt_index(v)];
        if pdpte.is_unused() {
            return None;
        }
        if pdpte.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Some(PhysAddr::new(pdpte.addr().as_u64() + (v & 0x3FFF_FFFF)));
        }

        let pde = &self.table(pdpte.addr())[pd_index(v)];
        if pde.is_unused() {
            return None;
        }
        if pde.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Some(PhysAddr::new(pde.addr().as_u64() + (v & 0x1F_FFFF)));
        }

        let pte = &self.table(pde.addr())[pt_index(v)];
        if pte.is_unused() {
            return None;
        }
        Some(PhysAddr::new(pte.addr().as_u64() + (v & 0xFFF)))
    }

    /// Translate a virtual address in the active root.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.translate_in(self.active_root, virt)
    }

    /// Whether `virt` has a present mapping in the active root.
    pub fn is_mapped(&self, virt: VirtAddr) -> bool {
        self.translate(virt).is_some()
    }

    /// Create a new address space.
    ///
    /// The kernel half (PML4 entries 256..512) is copied from the kernel
    /// root so kernel addresses stay valid; the lower half starts empty.
    pub fn create_address_space<A: FrameAllocator<Size4KiB>>(
        &mut self,
        allocator: &mut A,
    ) -> Result<PhysAddr, VmmError> {
        let root = self.new_table(allocator)?;
        let src = self.table(self.kernel_root);
        let dst = self.table_mut(root);
        for i in KERNEL_PML4_START..ENTRIES_PER_TABLE {
            dst[i] = src[i].clone();
        }
        Ok(root)
    }

    /// Destroy an address space, freeing every lower-half intermediate
    /// table and the root itself. Leaf data frames are owned by the
    /// process memory manager and are not touched here.
    ///
    /// Refuses the kernel root and the active root.
    pub fn destroy_address_space<D: FrameDeallocator<Size4KiB>>(
        &mut self,
        root: PhysAddr,
        deallocator: &mut D,
    ) -> Result<(), VmmError> {
        if root == self.kernel_root || root == self.active_root {
            return Err(VmmError::RootInUse);
        }

        let pml4 = self.table(root);
        for i in 0..KERNEL_PML4_START {
            let pml4e = &pml4[i];
            if pml4e.is_unused() || pml4e.flags().contains(PageTableFlags::HUGE_PAGE) {
                continue;
            }
            let pdpt = self.table(pml4e.addr());
            for j in 0..ENTRIES_PER_TABLE {
                let pdpte = &pdpt[j];
                if pdpte.is_unused() || pdpte.flags().contains(PageTableFlags::HUGE_PAGE) {
                    continue;
                }
                let pd = self.table(pdpte.addr());
                for k in 0..ENTRIES_PER_TABLE {
                    let pde = &pd[k];
                    if pde.is_unused() || pde.flags().contains(PageTableFlags::HUGE_PAGE) {
                        continue;
                    }
                    unsafe {
                        deallocator
                            .deallocate_frame(PhysFrame::containing_address(pde.addr()));
                    }
                }
                unsafe {
                    deallocator.deallocate_frame(PhysFrame::containing_address(pdpte.addr()));
                }
            }
            unsafe {
                deallocator.deallocate_frame(PhysFrame::containing_address(pml4e.addr()));
            }
        }
        unsafe {
            deallocator.deallocate_frame(PhysFrame::containing_address(root));
        }
        Ok(())
    }

    /// Install `root` as the current page-table base.
    ///
    /// A no-op when `root` is already active.
    pub fn switch_address_space(&mut self, root: PhysAddr) {
        if root == self.active_root {
            return;
        }
        self.active_root = root;
        #[cfg(not(test))]
        unsafe {
            use x86_64::registers::control::{Cr3, Cr3Flags};
            Cr3::write(PhysFrame::containing_address(root), Cr3Flags::empty());
        }
    }
}

/// The global address-space manager, created once at boot.
static ADDRESS_SPACES: OnceCell<Mutex<AddressSpaceManager>> = OnceCell::uninit();

/// Initialize the VMM over the currently loaded root table.
///
/// # Safety
/// The complete physical memory must be mapped at `phys_offset`.
pub unsafe fn init(phys_offset: VirtAddr) {
    use x86_64::registers::control::Cr3;
    let (frame, _) = Cr3::read();
    let kernel_root = frame.start_address();
    ADDRESS_SPACES.init_once(|| Mutex::new(AddressSpaceManager::new(phys_offset, kernel_root)));
    log::info!("VMM: initialized, kernel root at {:#x}", kernel_root.as_u64());
}

/// Run `f` against the global manager.
pub fn with_manager<R>(f: impl FnOnce(&mut AddressSpaceManager) -> R) -> R {
    let mut guard = ADDRESS_SPACES
        .get()
        .expect("VMM not initialized")
        .lock();
    f(&mut guard)
}

/// Map one page in the active address space.
pub fn map_page(virt: VirtAddr, phys: PhysAddr, flags: PageTableFlags) -> Result<(), VmmError> {
    with_manager(|m| m.map_page(virt, phys, flags, &mut GlobalFrameAllocator))
}

/// Map `count` consecutive pages in the active address space.
pub fn map_range(
    virt: VirtAddr,
    phys: PhysAddr,
    count: usize,
    flags: PageTableFlags,
) -> Result<(), VmmError> {
    with_manager(|m| {
        let root = m.active_root();
        m.map_range_in(root, virt, phys, count, flags, &mut GlobalFrameAllocator)
    })
}

/// Unmap one page from the active address space.
pub fn unmap_page(virt: VirtAddr) -> Option<PhysAddr> {
    with_manager(|m| m.unmap_page(virt))
}

/// Translate a virtual address in the active address space.
pub fn translate(virt: VirtAddr) -> Option<PhysAddr> {
    with_manager(|m| m.translate(virt))
}

/// Create a new address space sharing the kernel half.
pub fn create_address_space() -> Result<PhysAddr, VmmError> {
    with_manager(|m| m.create_address_space(&mut GlobalFrameAllocator))
}

/// Destroy an address space created by [`create_address_space`].
pub fn destroy_address_space(root: PhysAddr) -> Result<(), VmmError> {
    with_manager(|m| m.destroy_address_space(root, &mut GlobalFrameAllocator))
}

/// Switch to another address space.
pub fn switch_address_space(root: PhysAddr) {
    with_manager(|m| m.switch_address_space(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    /// A simulated physical memory arena: frames are 4 KiB slices of a
    /// leaked host allocation and `phys_offset` is zero, so "physical"
    /// addresses are directly dereferenceable.
    struct TestArena {
        free: Vec<u64>,
    }

    impl TestArena {
        fn new(frames: usize) -> Self {
            let backing = alloc::vec![0u8; (frames + 1) * PAGE_SIZE].leak();
            let base = backing.as_ptr() as u64;
            let aligned = (base + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
            let free = (0..frames as u64)
                .map(|i| aligned + i * PAGE_SIZE as u64)
                .collect();
            TestArena { free }
        }
    }

    unsafe impl FrameAllocator<Size4KiB> for TestArena {
        fn allocate_frame(&mut self) -> Option<PhysFrame> {
            self.free
                .pop()
                .map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
        }
    }

    impl FrameDeallocator<Size4KiB> for TestArena {
        unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
            self.free.push(frame.start_address().as_u64());
        }
    }

    fn make_manager(arena: &mut TestArena) -> AddressSpaceManager {
        let root = arena.allocate_frame().unwrap().start_address();
        unsafe {
            core::ptr::write_bytes(root.as_u64() as *mut u8, 0, PAGE_SIZE);
            AddressSpaceManager::new(VirtAddr::new(0), root)
        }
    }

    const USER_FLAGS: PageTableFlags = PageTableFlags::from_bits_truncate(
        PageTableFlags::PRESENT.bits()
            | PageTableFlags::WRITABLE.bits()
            | PageTableFlags::USER_ACCESSIBLE.bits(),
    );

    #[test]
    fn map_translate_unmap() {
        let mut arena = TestArena::new(32);
        let mut vmm = make_manager(&mut arena);

        let virt = VirtAddr::new(0x4000_0000);
        let phys = PhysAddr::new(0x1234_5000);
        vmm.map_page(virt, phys, PageTableFlags::WRITABLE, &mut arena)
            .expect("map failed");

        assert!(vmm.is_mapped(virt));
        assert_eq!(vmm.translate(virt), Some(phys));
        // Offset bits pass through the translation.
        assert_eq!(
            vmm.translate(VirtAddr::new(0x4000_0123)),
            Some(PhysAddr::new(0x1234_5123))
        );

        assert_eq!(vmm.unmap_page(virt), Some(phys));
        assert!(!vmm.is_mapped(virt));
        assert_eq!(vmm.translate(virt), None);
        assert_eq!(vmm.unmap_page(virt), None);
    }

    #[test]
    fn misaligned_addresses_are_rejected() {
        let mut arena = TestArena::new(8);
        let mut vmm = make_manager(&mut arena);

        let err = vmm.map_page(
            VirtAddr::new(0x4000_0100),
            PhysAddr::new(0x5000),
            PageTableFlags::WRITABLE,
            &mut arena,
        );
        assert_eq!(err, Err(VmmError::MisalignedVirt));

        let err = vmm.map_page(
            VirtAddr::new(0x4000_0000),
            PhysAddr::new(0x5010),
            PageTableFlags::WRITABLE,
            &mut arena,
        );
        assert_eq!(err, Err(VmmError::MisalignedPhys));
        assert!(!vmm.is_mapped(VirtAddr::new(0x4000_0000)));
    }

    #[test]
    fn map_range_rolls_back_on_failure() {
        // Arena with only enough frames for the tables of the first few
        // mappings; the later ones must fail and roll the rest back.
        let mut arena = TestArena::new(4);
        let mut vmm = make_manager(&mut arena);

        let virt = VirtAddr::new(0x4000_0000);
        let phys = PhysAddr::new(0x10_0000);
        let root = vmm.active_root();
        let result = vmm.map_range_in(
            root,
            virt,
            phys,
            2048, // crosses into a second PT, needing a 4th table frame
            PageTableFlags::WRITABLE,
            &mut arena,
        );
        assert_eq!(result, Err(VmmError::NoMemory));
        for i in 0..2048u64 {
            assert!(!vmm.is_mapped(virt + i * PAGE_SIZE as u64));
        }
    }

    #[test]
    fn address_spaces_are_isolated() {
        let mut arena = TestArena::new(64);
        let mut vmm = make_manager(&mut arena);

        let u1 = vmm.create_address_space(&mut arena).unwrap();
        let u2 = vmm.create_address_space(&mut arena).unwrap();

        let virt = VirtAddr::new(0x4000_0000);
        let p1 = PhysAddr::new(0x7777_7000);
        vmm.map_page_in(u1, virt, p1, USER_FLAGS, &mut arena)
            .unwrap();

        assert_eq!(vmm.translate_in(u1, virt), Some(p1));
        // User mappings never leak across address spaces.
        assert_eq!(vmm.translate_in(u2, virt), None);
    }

    #[test]
    fn kernel_half_is_shared_by_reference() {
        let mut arena = TestArena::new(64);
        let mut vmm = make_manager(&mut arena);

        // Populate the kernel half before any user space exists so the
        // shared PDPT is in place.
        let k1 = VirtAddr::new(0xFFFF_8000_0000_0000);
        vmm.map_page(k1, PhysAddr::new(0x9000), PageTableFlags::WRITABLE, &mut arena)
            .unwrap();

        let u1 = vmm.create_address_space(&mut arena).unwrap();

        // Kernel-half PML4 entries must match the kernel root exactly.
        let kernel_root = vmm.kernel_root();
        for i in KERNEL_PML4_START..512 {
            let a = &vmm.table(kernel_root)[i];
            let b = &vmm.table(u1)[i];
            assert_eq!(a.addr(), b.addr());
            assert_eq!(a.flags(), b.flags());
        }

        // A kernel mapping added after U1 was created is visible in U1
        // because the upper-half tables are shared, not copied.
        let k2 = VirtAddr::new(0xFFFF_8000_0000_2000);
        vmm.map_page(k2, PhysAddr::new(0xA000), PageTableFlags::WRITABLE, &mut arena)
            .unwrap();
        assert_eq!(vmm.translate_in(u1, k2), Some(PhysAddr::new(0xA000)));
    }

    #[test]
    fn destroy_refuses_live_roots() {
        let mut arena = TestArena::new(64);
        let mut vmm = make_manager(&mut arena);
        let kernel_root = vmm.kernel_root();

        assert_eq!(
            vmm.destroy_address_space(kernel_root, &mut arena),
            Err(VmmError::RootInUse)
        );

        let u1 = vmm.create_address_space(&mut arena).unwrap();
        vmm.switch_address_space(u1);
        assert_eq!(
            vmm.destroy_address_space(u1, &mut arena),
            Err(VmmError::RootInUse)
        );

        vmm.switch_address_space(kernel_root);
        assert_eq!(vmm.destroy_address_space(u1, &mut arena), Ok(()));
    }

    #[test]
    fn destroy_returns_table_frames() {
        let mut arena = TestArena::new(64);
        let mut vmm = make_manager(&mut arena);

        let before = arena.free.len();
        let u1 = vmm.create_address_space(&mut arena).unwrap();
        vmm.map_page_in(
            u1,
            VirtAddr::new(0x4000_0000),
            PhysAddr::new(0x8000),
            USER_FLAGS,
            &mut arena,
        )
        .unwrap();
        // root + pdpt + pd + pt
        assert_eq!(arena.free.len(), before - 4);

        vmm.destroy_address_space(u1, &mut arena).unwrap();
        assert_eq!(arena.free.len(), before);
    }
}
