//! The huge pool: a second loader-supplied physical region, separate from the page pool, set
//! aside for allocations that must be physically contiguous across more than one frame (guest
//! physical memory backing, large VM direct-map regions).
//!
//! Structurally identical to the page pool (same free-run search over a self-hosted tag array);
//! kept as a distinct static because the two wrap distinct loader-supplied regions and are
//! accounted/dumped separately.

use utils::mem::{PhysAddr, VirtAddr};

use super::page_pool::{PagePool, PageTag};
use crate::error::MkResult;

pub static HUGE_POOL: PagePool = PagePool::uninit();

/// Initializes the huge pool over `[base_phys, base_phys + len)`, already mapped 1:1 at
/// `base_virt`. Must be called exactly once, during boot.
pub unsafe fn init(base_virt: VirtAddr, base_phys: PhysAddr, len: usize) {
    unsafe { HUGE_POOL.init(base_virt, base_phys, len) };
}

pub fn allocate(page_count: usize, tag: PageTag) -> MkResult<VirtAddr> {
    HUGE_POOL.allocate_contig(page_count, tag)
}

pub fn deallocate(virt: VirtAddr, page_count: usize, tag: PageTag) -> MkResult<()> {
    HUGE_POOL.deallocate_contig(virt, page_count, tag)
}

pub fn dump() {
    HUGE_POOL.dump();
}
