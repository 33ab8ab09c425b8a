//! The 4 KiB page pool: the one and only backing store for page table frames, VMCS/VMCB regions,
//! extension images, and every other single/multi-page allocation inside the microkernel.
//!
//! The pool owns a contiguous physical region the loader identity-mapped into `mk`'s root page
//! table at boot. It must work before the kernel heap exists (the heap's own slab allocator is
//! wired to pull pages *from* this pool), so it never touches `alloc`: per-frame tag bytes are
//! carved out of the front of the region itself instead of living in a `Vec`.

use core::slice;

use arch::BASIC_PAGE_SIZE;
use arch::x86_64::paging::FrameSource;
use slab::PageSource;
use utils::mem::{PhysAddr, VirtAddr, memset};
use utils::sync::spinlock::{SpinLock, SpinLockable};

use crate::error::{MkError, MkResult};

/// Per-purpose accounting bucket for `dump()`. Chosen to cover every distinct kind of page this
/// pool hands out; add a variant here before reaching for `Misc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageTag {
    PageTable = 0,
    RootVpState = 1,
    Vmcs = 2,
    Vmcb = 3,
    DirectMap = 4,
    ExtensionImage = 5,
    ExtensionStack = 6,
    ExtensionTls = 7,
    DebugRing = 8,
    VmexitLog = 9,
    HandleTable = 10,
    Misc = 11,
}

impl PageTag {
    const COUNT: usize = 12;

    const fn as_str(self) -> &'static str {
        match self {
            PageTag::PageTable => "page_table",
            PageTag::RootVpState => "root_vp_state",
            PageTag::Vmcs => "vmcs",
            PageTag::Vmcb => "vmcb",
            PageTag::DirectMap => "direct_map",
            PageTag::ExtensionImage => "extension_image",
            PageTag::ExtensionStack => "extension_stack",
            PageTag::ExtensionTls => "extension_tls",
            PageTag::DebugRing => "debug_ring",
            PageTag::VmexitLog => "vmexit_log",
            PageTag::HandleTable => "handle_table",
            PageTag::Misc => "misc",
        }
    }
}

/// Marks a frame entry as free. Never a legal `PageTag` discriminant.
const FREE: u8 = 0xFF;

struct PagePoolInner {
    base_virt: VirtAddr,
    base_phys: PhysAddr,
    /// Frames reserved up front to hold `tags`; never handed out.
    meta_frames: usize,
    frame_count: usize,
    /// One byte per frame: `FREE` or a `PageTag` discriminant. Lives inside the pool's own
    /// region, in the `meta_frames` reserved at the front.
    tags: &'static mut [u8],
    /// Next-fit search cursor, to avoid rescanning already-full regions on every call.
    next_hint: usize,
    bytes_in_use: [usize; PageTag::COUNT],
}

impl SpinLockable for PagePoolInner {}

impl PagePoolInner {
    const fn uninit() -> Self {
        Self {
            base_virt: VirtAddr(0),
            base_phys: PhysAddr(0),
            meta_frames: 0,
            frame_count: 0,
            tags: &mut [],
            next_hint: 0,
            bytes_in_use: [0; PageTag::COUNT],
        }
    }

    fn frame_virt(&self, idx: usize) -> VirtAddr {
        self.base_virt + idx * BASIC_PAGE_SIZE
    }

    fn frame_phys(&self, idx: usize) -> PhysAddr {
        self.base_phys + idx * BASIC_PAGE_SIZE
    }

    fn alloc_run(&mut self, count: usize, tag: PageTag) -> Option<VirtAddr> {
        if count == 0 || self.meta_frames + count > self.frame_count {
            return None;
        }

        let start = self.meta_frames;
        let end = self.frame_count;
        let mut i = self.next_hint.clamp(start, end);

        for _ in 0..(end - start) {
            if i + count > end {
                i = start;
                continue;
            }

            if self.tags[i..i + count].iter().all(|&t| t == FREE) {
                self.tags[i..i + count].fill(tag as u8);
                self.next_hint = i + count;
                self.bytes_in_use[tag as usize] += count * BASIC_PAGE_SIZE;

                let virt = self.frame_virt(i);
                unsafe { memset(virt.into(), 0, count * BASIC_PAGE_SIZE) };
                return Some(virt);
            }

            i += 1;
        }

        None
    }

    fn free_run(&mut self, virt: VirtAddr, count: usize, tag: PageTag) -> MkResult<()> {
        if virt.0 < self.base_virt.0 {
            return Err(MkError::InvalidId(0));
        }

        let offset = virt - self.base_virt;
        if offset % BASIC_PAGE_SIZE != 0 {
            return Err(MkError::InvalidId(0));
        }

        let idx = offset / BASIC_PAGE_SIZE;
        if idx < self.meta_frames || idx + count > self.frame_count {
            return Err(MkError::InvalidId(0));
        }

        for &t in &self.tags[idx..idx + count] {
            debug_assert_eq!(
                t, tag as u8,
                "page_pool: deallocate called with the wrong tag for this frame"
            );
        }

        self.tags[idx..idx + count].fill(FREE);
        self.bytes_in_use[tag as usize] = self.bytes_in_use[tag as usize]
            .saturating_sub(count * BASIC_PAGE_SIZE);
        self.next_hint = self.next_hint.min(idx);

        Ok(())
    }

    fn virt_to_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
        if virt.0 < self.base_virt.0 {
            return None;
        }
        let offset = virt - self.base_virt;
        if offset % BASIC_PAGE_SIZE != 0 {
            return None;
        }
        let idx = offset / BASIC_PAGE_SIZE;
        (idx < self.frame_count).then(|| self.frame_phys(idx))
    }

    fn phys_to_virt(&self, phys: PhysAddr) -> Option<VirtAddr> {
        if phys.0 < self.base_phys.0 {
            return None;
        }
        let offset = phys - self.base_phys;
        if offset % BASIC_PAGE_SIZE != 0 {
            return None;
        }
        let idx = offset / BASIC_PAGE_SIZE;
        (idx < self.frame_count).then(|| self.frame_virt(idx))
    }
}

/// A 4 KiB page pool over a contiguous, already-mapped physical region.
pub struct PagePool {
    inner: SpinLock<PagePoolInner>,
}

impl PagePool {
    pub const fn uninit() -> Self {
        Self {
            inner: SpinLock::new(PagePoolInner::uninit()),
        }
    }

    /// Initializes the pool over `[base_phys, base_phys + len)`, already mapped 1:1 at
    /// `base_virt` in the current address space. Must be called exactly once, during boot.
    pub unsafe fn init(&self, base_virt: VirtAddr, base_phys: PhysAddr, len: usize) {
        let frame_count = len / BASIC_PAGE_SIZE;
        let meta_frames = usize::div_ceil(frame_count, BASIC_PAGE_SIZE);

        let tags_ptr: *mut u8 = base_virt.into();
        unsafe { memset(tags_ptr, FREE, frame_count) };
        let tags = unsafe { slice::from_raw_parts_mut(tags_ptr, frame_count) };

        let mut inner = self.inner.lock();
        *inner = PagePoolInner {
            base_virt,
            base_phys,
            meta_frames,
            frame_count,
            tags,
            next_hint: meta_frames,
            bytes_in_use: [0; PageTag::COUNT],
        };
    }

    pub fn allocate(&self, tag: PageTag) -> MkResult<VirtAddr> {
        self.inner
            .lock()
            .alloc_run(1, tag)
            .ok_or(MkError::ResourceExhausted)
    }

    pub fn allocate_contig(&self, count: usize, tag: PageTag) -> MkResult<VirtAddr> {
        self.inner
            .lock()
            .alloc_run(count, tag)
            .ok_or(MkError::ResourceExhausted)
    }

    pub fn deallocate(&self, virt: VirtAddr, tag: PageTag) -> MkResult<()> {
        self.inner.lock().free_run(virt, 1, tag)
    }

    pub fn deallocate_contig(&self, virt: VirtAddr, count: usize, tag: PageTag) -> MkResult<()> {
        self.inner.lock().free_run(virt, count, tag)
    }

    pub fn virt_to_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.inner.lock().virt_to_phys(virt)
    }

    pub fn phys_to_virt(&self, phys: PhysAddr) -> Option<VirtAddr> {
        self.inner.lock().phys_to_virt(phys)
    }

    pub fn dump(&self) {
        let inner = self.inner.lock();
        logger::log_info!(
            "page_pool: {} frames ({} reserved for metadata)",
            inner.frame_count, inner.meta_frames
        );
        for i in 0..PageTag::COUNT {
            let tag: PageTag = unsafe { core::mem::transmute(i as u8) };
            logger::log_info!("  {:<16} {} bytes", tag.as_str(), inner.bytes_in_use[i]);
        }
    }
}

/// The system page pool, wired up as both `arch`'s [`FrameSource`] and `slab`'s [`PageSource`]
/// during boot.
pub static PAGE_POOL: PagePool = PagePool::uninit();

impl FrameSource for PagePool {
    fn alloc_frame(&self) -> Option<PhysAddr> {
        let virt = self.allocate(PageTag::PageTable).ok()?;
        self.virt_to_phys(virt)
    }

    unsafe fn free_frame(&self, addr: PhysAddr) {
        if let Some(virt) = self.phys_to_virt(addr) {
            let _ = self.deallocate(virt, PageTag::PageTable);
        }
    }
}

impl PageSource for PagePool {
    fn alloc_pages(&self, count: usize) -> Option<core::ptr::NonNull<u8>> {
        let virt = self.allocate_contig(count, PageTag::Misc).ok()?;
        let ptr: *mut u8 = virt.into();
        core::ptr::NonNull::new(ptr)
    }

    unsafe fn free_pages(&self, ptr: core::ptr::NonNull<u8>, count: usize) {
        let virt = VirtAddr::from(ptr);
        let _ = self.deallocate_contig(virt, count, PageTag::Misc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pool(frame_count: usize) -> (PagePool, std::vec::Vec<u8>) {
        let meta_frames = usize::div_ceil(frame_count, BASIC_PAGE_SIZE);
        let total = (meta_frames + frame_count) * BASIC_PAGE_SIZE;
        let mut backing = std::vec![0u8; total];
        let base_virt = VirtAddr(backing.as_mut_ptr().addr());

        let pool = PagePool::uninit();
        unsafe { pool.init(base_virt, PhysAddr(0x1000_0000), (meta_frames + frame_count) * BASIC_PAGE_SIZE) };
        (pool, backing)
    }

    #[test]
    fn allocate_then_deallocate_reuses_frame() {
        let (pool, _backing) = make_pool(4);

        let a = pool.allocate(PageTag::Misc).unwrap();
        pool.deallocate(a, PageTag::Misc).unwrap();
        let b = pool.allocate(PageTag::Misc).unwrap();

        assert_eq!(a.0, b.0);
    }

    #[test]
    fn exhausts_after_frame_count_allocations() {
        let (pool, _backing) = make_pool(2);

        assert!(pool.allocate(PageTag::Misc).is_ok());
        assert!(pool.allocate(PageTag::Misc).is_ok());
        assert!(pool.allocate(PageTag::Misc).is_err());
    }

    #[test]
    fn virt_to_phys_roundtrips() {
        let (pool, _backing) = make_pool(4);

        let virt = pool.allocate(PageTag::DirectMap).unwrap();
        let phys = pool.virt_to_phys(virt).unwrap();
        assert_eq!(pool.phys_to_virt(phys).unwrap().0, virt.0);
    }

    #[test]
    fn contig_allocation_is_actually_contiguous() {
        let (pool, _backing) = make_pool(8);

        let virt = pool.allocate_contig(3, PageTag::ExtensionImage).unwrap();
        let phys = pool.virt_to_phys(virt).unwrap();
        assert_eq!(
            pool.virt_to_phys(virt + BASIC_PAGE_SIZE).unwrap().0,
            phys.0 + BASIC_PAGE_SIZE
        );
    }
}
