//! Root page tables: the system's own address space, and the template every extension's address
//! space is cloned from.
//!
//! `arch`'s paging code always operates on "the currently loaded" address space (whatever `CR3`
//! points at) rather than an explicit table parameter, so building or editing a table that isn't
//! currently active means loading it, editing, then restoring the previous `CR3`. Every method
//! here pays that cost; callers are expected to batch their mapping calls per table rather than
//! ping-pong between tables.

use arch::paging::{Flags, PageSize, PagingError};
use arch::x86_64::X86_64;
use arch::x86_64::cpu::{Cr3, Register};
use utils::mem::{PhysAddr, VirtAddr};

use crate::error::{MkError, MkResult};
use crate::pool::{PAGE_POOL, PageTag};

/// `{R, W, E}` permissions for a mapping. Reads are implicit whenever a page is present, so only
/// write and execute are meaningful bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageAttr {
    pub write: bool,
    pub execute: bool,
}

impl PageAttr {
    pub const fn rwx() -> Self {
        Self { write: true, execute: true }
    }

    pub const fn rw() -> Self {
        Self { write: true, execute: false }
    }

    pub const fn rx() -> Self {
        Self { write: false, execute: true }
    }

    fn into_flags(self) -> Flags<X86_64> {
        Flags::<X86_64>::new()
            .set_read_write(self.write)
            .set_execute_disable(!self.execute)
    }
}

/// Memory type tag for a mapping. Expressed through `PWT`/`PCD` rather than the PAT-select bit,
/// matching the two PAT entries the microkernel actually programs at boot (see
/// `arch::x86_64::paging::pat`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
    WriteBack,
    Uncacheable,
}

impl MemType {
    fn apply(self, flags: Flags<X86_64>) -> Flags<X86_64> {
        match self {
            MemType::WriteBack => flags.set_write_through(false).set_cache_disable(false),
            MemType::Uncacheable => flags.set_write_through(true).set_cache_disable(true),
        }
    }
}

/// One 4-level `x86_64` address space, rooted at its own PML4 (or PML5, under `paging_5`).
pub struct RootPageTable {
    phys_root: PhysAddr,
}

impl RootPageTable {
    /// Allocates a fresh, empty root table from the page pool.
    pub fn new_empty() -> MkResult<Self> {
        let virt = PAGE_POOL.allocate(PageTag::PageTable)?;
        let phys_root = PAGE_POOL
            .virt_to_phys(virt)
            .ok_or(MkError::ResourceExhausted)?;
        Ok(Self { phys_root })
    }

    /// Wraps the table already loaded in `CR3` at boot (the system RPT the loader built).
    pub unsafe fn current() -> Self {
        let top = unsafe { Cr3::read() }.top_pml();
        Self { phys_root: PhysAddr((top << 12) as usize) }
    }

    pub const fn phys_root(&self) -> PhysAddr {
        self.phys_root
    }

    /// Loads this table into `CR3`.
    pub fn activate(&self) {
        let cr3 = Cr3::new().with_top_pml((self.phys_root.0 >> 12) as u64);
        unsafe { cr3.write() };
    }

    /// Runs `f` with this table loaded, restoring the previously active table afterward.
    fn with_active<R>(&self, f: impl FnOnce() -> R) -> R {
        let prev = unsafe { Cr3::read() };
        self.activate();
        let ret = f();
        unsafe { prev.write() };
        ret
    }

    fn map(
        &self,
        virt: VirtAddr,
        phys: PhysAddr,
        page_size: PageSize<X86_64>,
        attr: PageAttr,
        mtype: MemType,
    ) -> MkResult<()> {
        let flags = mtype.apply(attr.into_flags());
        self.with_active(|| unsafe { arch::map_page_to::<X86_64>(phys, virt, flags, page_size) })
            .map_err(|_| MkError::InvalidState)
    }

    pub fn map_4k(&self, virt: VirtAddr, phys: PhysAddr, attr: PageAttr, mtype: MemType) -> MkResult<()> {
        self.map(virt, phys, PageSize::size_4kb(), attr, mtype)
    }

    pub fn map_2m(&self, virt: VirtAddr, phys: PhysAddr, attr: PageAttr, mtype: MemType) -> MkResult<()> {
        self.map(virt, phys, PageSize::size_2mb(), attr, mtype)
    }

    pub fn map_1g(&self, virt: VirtAddr, phys: PhysAddr, attr: PageAttr, mtype: MemType) -> MkResult<()> {
        self.map(virt, phys, PageSize::size_1gb(), attr, mtype)
    }

    /// Idempotent with respect to already-unmapped addresses; never frees the backing frame
    /// (the caller is assumed to still own it, as with a guest-supplied mapping).
    pub fn unmap(&self, virt: VirtAddr, page_size: PageSize<X86_64>) -> MkResult<()> {
        // TODO: reclaim now-empty intermediate tables back to the page pool; `arch` doesn't
        // currently expose a way to check whether a parent table has gone fully empty.
        self.with_active(|| unsafe { arch::unmap_page::<X86_64>(virt, page_size) })
            .or_else(|e| match e {
                PagingError::PageNotPresent => Ok(()),
                e => Err(e),
            })
            .map_err(|_| MkError::InvalidState)
    }

    /// Like `unmap`, but also returns the backing frame to the page pool.
    pub fn release(&self, virt: VirtAddr, page_size: PageSize<X86_64>) -> MkResult<()> {
        let phys = self.virt_to_phys(virt);
        self.unmap(virt, page_size)?;
        if let Some(phys) = phys
            && let Some(frame_virt) = PAGE_POOL.phys_to_virt(phys)
        {
            let _ = PAGE_POOL.deallocate(frame_virt, PageTag::DirectMap);
        }
        Ok(())
    }

    pub fn virt_to_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.with_active(|| arch::translate::<X86_64>(virt))
    }

    pub fn entry(&self, virt: VirtAddr) -> MkResult<PhysAddr> {
        self.virt_to_phys(virt).ok_or(MkError::InvalidState)
    }

    /// Merges `other`'s top-level table entries into `self`, wherever `self` doesn't already have
    /// an entry there. Used to seed an extension's RPT with the system's kernel-half mapping.
    pub fn add_tables(&self, other: &RootPageTable) {
        let self_top: *mut u64 = self.phys_root.add_hhdm_offset().into();
        let other_top: *const u64 = other.phys_root.add_hhdm_offset().into();

        for i in 0..512usize {
            unsafe {
                let dst = self_top.add(i);
                if *dst == 0 {
                    let src = *other_top.add(i);
                    if src != 0 {
                        *dst = src;
                    }
                }
            }
        }
    }

    /// Maps the loader-captured root VP state page into this table's per-PP scratch region.
    pub fn add_root_vp_state(&self, state: PhysAddr, scratch_virt: VirtAddr) -> MkResult<()> {
        self.map_4k(scratch_virt, state, PageAttr::rw(), MemType::WriteBack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_attr_flags_round_trip() {
        let attr = PageAttr::rwx();
        assert!(attr.write);
        assert!(attr.execute);
    }
}
