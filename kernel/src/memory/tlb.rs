//! Translation Lookaside Buffer (TLB) management
//!
//! Safe wrappers around the x86_64 TLB flush operations. The TLB caches
//! virtual-to-physical translations; every mutation of a page-table entry
//! must invalidate the affected page before the mutating call returns, or
//! the CPU may keep using the stale translation.

use x86_64::VirtAddr;

/// Invalidate the TLB entry for a single page.
#[inline]
pub fn flush_page(addr: VirtAddr) {
    #[cfg(not(test))]
    x86_64::instructions::tlb::flush(addr);
    #[cfg(test)]
    let _ = addr; // no TLB to maintain when running as a host test
}

/// Flush the entire TLB by reloading CR3.
///
/// Expensive; reserved for bulk operations such as address-space teardown.
#[inline]
pub fn flush_all() {
    #[cfg(not(test))]
    x86_64::instructions::tlb::flush_all();
}
