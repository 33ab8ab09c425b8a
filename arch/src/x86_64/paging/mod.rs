use core::{
    fmt::Debug,
    ops::{Deref, DerefMut},
};

use crate::{
    Arch,
    paging::{Flags, PageSize, PagingError},
    x86_64::cpu::{Cr3, Register},
};
use page_size::MAX_BOTTOM_PAGING_LEVEL;
use utils::mem::{PhysAddr, VirtAddr, memset};
use utils::sync::spinlock::{SpinLock, SpinLockable};

use super::X86_64;

pub mod flags;
pub mod page_size;
pub mod pat;

/// The number of entries per page table
pub const ENTRIES_PER_TABLE: usize = 512;

/// A source of physical frames to back page table pages, wired up by `mk` at boot (backed by
/// its page pool). Paging code never allocates physical memory on its own.
pub trait FrameSource: Send + Sync {
    fn alloc_frame(&self) -> Option<PhysAddr>;
    unsafe fn free_frame(&self, addr: PhysAddr);
}

struct NoFrameSource;
impl FrameSource for NoFrameSource {
    fn alloc_frame(&self) -> Option<PhysAddr> {
        None
    }
    unsafe fn free_frame(&self, _addr: PhysAddr) {}
}
impl SpinLockable for &'static dyn FrameSource {}

static FRAME_SOURCE: SpinLock<&'static dyn FrameSource> = SpinLock::new(&NoFrameSource);

/// Installs the physical frame source backing page table allocations. Must be called once
/// during boot, before any mapping calls.
pub fn set_frame_source(source: &'static dyn FrameSource) {
    *FRAME_SOURCE.lock() = source;
}

fn frame_alloc() -> PhysAddr {
    FRAME_SOURCE
        .lock()
        .alloc_frame()
        .expect("out of page table frames")
}

unsafe fn frame_free(addr: PhysAddr) {
    unsafe {
        FRAME_SOURCE.lock().free_frame(addr);
    }
}

/// An entry in a page table
#[repr(C)]
#[derive(Debug)]
pub(super) struct Entry(usize);

/// A page table
#[repr(C, align(4096))]
#[derive(Debug)]
pub(super) struct PageTable([Entry; ENTRIES_PER_TABLE]);

#[allow(dead_code)]
impl Entry {
    const fn get_flags(&self) -> Flags<X86_64> {
        unsafe { Flags::<X86_64>::from_raw(self.0 & 0xFFF) }
    }

    #[inline]
    const fn set_flags(&mut self, flags: Flags<X86_64>) {
        self.0 |= flags.data();
    }

    /// Returns the entry's physical address
    #[inline]
    const fn get_addr(&self) -> PhysAddr {
        PhysAddr(self.0 & !0xFFF)
    }

    #[inline]
    const fn set_addr(&mut self, addr: PhysAddr) {
        self.0 = (self.0 & 0xFFF) | addr.0;
    }

    fn next_level_table(&mut self) -> &mut PageTable {
        let ptr: *mut PageTable = self.get_addr().add_hhdm_offset().into();

        unsafe {
            ptr.cast::<PageTable>()
                .as_mut()
                .expect("Failed to get next level table")
        }
    }

    /// Sets the given flags on and marks the entry as "taken".
    /// The rest of the initialization will be done later when the entry is activated
    ///
    /// NOTE: As already mentioned, this isn't the same as "present".
    fn take(&mut self, flags: Flags<X86_64>, page_size: PageSize<X86_64>) {
        assert!(!flags.get_taken(), "Entry is already taken");
        assert!(!flags.get_present(), "Entry is already present");

        self.set_flags(flags);
        self.set_flags(page_size.flag());
        self.set_flags(
            Flags::<X86_64>::new()
                .set_taken(true)
                .set_last_entry(true)
                .set_present(true),
        );

        let phys_addr = frame_alloc();

        self.set_addr(phys_addr);
    }

    /// Activates a "taken" entry.
    ///
    /// Most setting up was already done by `take()`, all we need to do now is allocate a physical
    /// page and map the virtual address to it, as well as set the `present` bit.
    fn activate_taken(&mut self) {
        let flags = self.get_flags();
        assert!(flags.get_taken(), "Entry is not taken");
        assert!(!flags.get_present(), "Entry is already present");

        let phys_addr = frame_alloc();

        self.set_addr(phys_addr);
        self.set_flags(Flags::<X86_64>::new().set_present(true));
    }

    /// Immediately maps the entry to the given physical address with the given flags.
    unsafe fn map(&mut self, phys_addr: PhysAddr, flags: Flags<X86_64>, page_size: PageSize<X86_64>) {
        assert!(!flags.get_taken(), "Entry is already taken");
        assert!(!flags.get_present(), "Entry is already present");

        self.set_addr(phys_addr);
        self.set_flags(flags);
        self.set_flags(page_size.flag());
        self.set_flags(Flags::<X86_64>::new().set_present(true).set_last_entry(true));
    }

    /// Marks the entry as not present and frees the physical page if the entry was activated not
    /// manually (ie. activated using a call to `activate`).
    fn release(&mut self) {
        let flags = self.get_flags();
        assert!(flags.get_present(), "Entry is not present");

        if flags.get_taken() {
            let phys_addr = self.get_addr();
            unsafe {
                frame_free(phys_addr);
            }

            flags.set_taken(false);
        }
        flags.set_present(false);

        self.set_flags(flags);
    }
}

impl PageTable {
    /// Allocates a new page table
    pub fn new() -> (&'static mut Self, PhysAddr) {
        let phys_addr = frame_alloc();

        // For easier bootstrapping, page tables are HHDM mapped
        let ptr: *mut u8 = phys_addr.add_hhdm_offset().into();
        unsafe {
            memset(ptr, 0, size_of::<PageTable>());
        }

        (
            unsafe { ptr.cast::<PageTable>().as_mut().unwrap() },
            phys_addr,
        )
    }

    /// Tries to get a reference to the `Entry` associated with the given virtual address.
    ///
    /// If the entry is not present, `None` is returned.
    fn get_entry(&mut self, virt_addr: VirtAddr) -> Option<&mut Entry> {
        let mut table = self;

        for level in
            (PageSize::<X86_64>::size_4kb().bottom_paging_level()..MAX_BOTTOM_PAGING_LEVEL).rev()
        {
            let i = next_level_index(virt_addr, level);

            let flags = table[i].get_flags();
            if flags.get_last_entry() {
                return Some(&mut table[i]);
            } else if flags.get_present() {
                table = table[i].next_level_table();
            } else {
                return None;
            }
        }

        unreachable!()
    }

    /// Gets the parent page table of the given `base_addr`.
    ///
    /// If one of the page tables are missing during translation, a new page table is created.
    fn get_create_table_range(
        &mut self,
        base_addr: VirtAddr,
        page_size: PageSize<X86_64>,
    ) -> &mut PageTable {
        let mut table = self;
        for level in (page_size.bottom_paging_level() + 1..=MAX_BOTTOM_PAGING_LEVEL).rev() {
            let i = next_level_index(base_addr, level);
            let flags = table[i].get_flags();
            if !flags.get_present() {
                table[i].set_addr(PageTable::new().1);
                flags.set_present(true).set_read_write(true);
                table[i].set_flags(flags);
            }

            table = table[i].next_level_table();
        }

        table
    }

    /// Tries to get the parent table of the given `base_addr`.
    ///
    /// If one of the page tables are missing during the translation, `None` is returned
    fn get_table_range(
        &mut self,
        base_addr: VirtAddr,
        page_size: PageSize<X86_64>,
    ) -> Option<&mut PageTable> {
        let mut table = self;
        for level in (page_size.bottom_paging_level() + 1..=MAX_BOTTOM_PAGING_LEVEL).rev() {
            let i = next_level_index(base_addr, level);
            let flags = table[i].get_flags();
            if !flags.get_present() {
                return None;
            }

            table = table[i].next_level_table();
        }

        Some(table)
    }

    /// Activates the mapping for the given virtual address
    ///
    /// If the entry isn't "taken" (or perhaps already activated) the function will panic
    pub fn activate_mapping(&mut self, base_addr: VirtAddr) {
        let entry = self.get_entry(base_addr).expect("Failed to get entry");

        entry.activate_taken();
    }

    /// Maps each of the virtual addresses composed of `virt_addr + i * page_size` so that when
    /// the page is activated a new physical address will be allocated and mapped to the entry
    pub fn map_allocate(
        &mut self,
        base_addr: VirtAddr,
        count: usize,
        page_size: PageSize<X86_64>,
        flags: Flags<X86_64>,
    ) {
        let table = self.get_create_table_range(base_addr, page_size);

        let to_skip = next_level_index(base_addr, page_size.bottom_paging_level());
        for entry in table.iter_mut().skip(to_skip).take(count) {
            entry.take(flags, page_size);
        }
    }

    /// Maps the given virtual address to the given physical address
    pub unsafe fn map(
        &mut self,
        base_addr: VirtAddr,
        phys_addr: PhysAddr,
        page_size: PageSize<X86_64>,
        flags: Flags<X86_64>,
    ) -> Result<(), PagingError> {
        let table = self.get_create_table_range(base_addr, page_size);

        let i = next_level_index(base_addr, page_size.bottom_paging_level());
        unsafe { table[i].map(phys_addr, flags, page_size) };

        Ok(())
    }

    /// Unmaps the given virtual address range, as well as frees the physical page mapped to it
    /// if the page was mapped with `map_allocate`
    pub(super) unsafe fn unmap(
        &mut self,
        base_addr: VirtAddr,
        count: usize,
        page_size: PageSize<X86_64>,
    ) -> Result<(), PagingError> {
        let table = self
            .get_table_range(base_addr, page_size)
            .ok_or(PagingError::PageNotPresent)?;

        let to_skip = next_level_index(base_addr, page_size.bottom_paging_level());

        assert!(
            512 - to_skip >= count,
            "Unmapping the requested page count starting at this address would exceed this parent table.
            Call this function individually for each parent page table"
        );

        for entry in table.iter_mut().skip(to_skip).take(count) {
            entry.release();
        }

        Ok(())
    }

    /// Get the physical address associated with the given virtual address.
    ///
    /// If the virtual address is not mapped, `None` is returned.
    pub(super) fn translate(&mut self, base_addr: VirtAddr) -> Option<PhysAddr> {
        let entry = self.get_entry(base_addr)?;

        let flags = entry.get_flags();
        if !flags.get_present() {
            return None;
        }

        Some(entry.get_addr())
    }
}

/// Get the top level paging table PML4/PML5 (depending on the paging level), from the address
/// space currently loaded in CR3.
pub(super) fn get_pml() -> &'static mut PageTable {
    let phys_addr = unsafe { PhysAddr((Cr3::read().top_pml() << 12) as usize) };

    let ptr: *mut PageTable = phys_addr.add_hhdm_offset().into();

    unsafe { ptr.cast::<PageTable>().as_mut().expect("Failed to get PML") }
}

#[inline]
const fn next_level_index(addr: VirtAddr, level: usize) -> usize {
    assert!(level < 5);

    (addr.0 >> (PageSize::size_4kb().offset_bit_count() + (level * 9))) & 0b1_1111_1111
}

impl Deref for PageTable {
    type Target = [Entry; ENTRIES_PER_TABLE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

// possibly TODO:
// PCIDs
// SMEP/SMAP
