//! Safe, general arch abstractions so `mk` doesn't need to deal with the nitty gritty of
//! register/paging manipulation directly.

#![no_std]
#![feature(sync_unsafe_cell)]

use paging::{Flags, PageSize, PagingError};
use utils::mem::{PhysAddr, VirtAddr};

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
pub mod paging;

#[cfg(target_arch = "x86_64")]
pub const BASIC_PAGE_SIZE: usize = x86_64::X86_64::BASIC_PAGE_SIZE.size();

/// A trait that every arch should implement.
pub trait Arch: Sized {
    const BASIC_PAGE_SIZE: PageSize<Self>;

    /// Initialize everything arch related.
    ///
    /// SHOULD ONLY BE CALLED ONCE DURING BOOT!
    unsafe fn early_boot_init();

    unsafe fn map_page_to(
        phys_addr: PhysAddr,
        virt_addr: VirtAddr,
        flags: Flags<Self>,
        page_size: PageSize<Self>,
    ) -> Result<(), PagingError>;

    unsafe fn unmap_page(virt_addr: VirtAddr, page_size: PageSize<Self>) -> Result<(), PagingError>;

    fn translate(virt_addr: VirtAddr) -> Option<PhysAddr>;

    /// Flush a single translation from the TLB.
    unsafe fn invalidate_page(virt_addr: VirtAddr);
}

/// Wrapper to call the arch specific `init` function
#[inline]
pub unsafe fn early_boot_init() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        x86_64::X86_64::early_boot_init();
    }
}

#[inline]
pub unsafe fn map_page_to<A: Arch>(
    phys_addr: PhysAddr,
    virt_addr: VirtAddr,
    flags: Flags<A>,
    page_size: PageSize<A>,
) -> Result<(), PagingError> {
    unsafe { A::map_page_to(phys_addr, virt_addr, flags, page_size) }
}

#[inline]
pub unsafe fn unmap_page<A: Arch>(
    virt_addr: VirtAddr,
    page_size: PageSize<A>,
) -> Result<(), PagingError> {
    unsafe { A::unmap_page(virt_addr, page_size) }
}

pub fn translate<A: Arch>(virt_addr: VirtAddr) -> Option<PhysAddr> {
    A::translate(virt_addr)
}
