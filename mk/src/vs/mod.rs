//! `vs_t`: one CPU's worth of virtualized architectural state, backed by a VMCS on Intel or a
//! VMCB on AMD, and the fixed-capacity pool that owns them.
//!
//! State machine per VS: `free -> allocated(inactive) -> active(pp) -> inactive -> cleared ->
//! allocated(inactive) -> destroyed`. The two hardware backends are never mixed on one boot;
//! which one is live is decided once, at `init()`, from `arch::x86_64::CPU_VENDOR`.

mod svm;
mod vmx;

use mk_abi::{BF_INVALID_ID, BfReg};
use utils::collections::id::{Id, tracker::IdTracker};
use utils::mem::{PhysAddr, VirtAddr};
use utils::sync::spinlock::{SpinLock, SpinLockable};

use arch::x86_64::{CPU_VENDOR, CpuVendor};

use crate::MAX_VSS;
use crate::ONLINE_PPS;
use crate::error::{MkError, MkResult};
use crate::pool::{PAGE_POOL, PageTag};
use crate::vp::VP_POOL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VsStatus {
    Deallocated,
    /// Allocated, not currently loaded on any PP's hardware VMCS/VMCB pointer.
    Allocated,
    /// Loaded on `active_pp`'s hardware pointer; may or may not be the PP actually running it.
    Active,
    /// Evicted from the hardware cache (`VMCLEAR`/equivalent) and ready to migrate.
    Cleared,
}

#[derive(Clone, Copy)]
struct VsT {
    status: VsStatus,
    assigned_vm: u16,
    assigned_vp: u16,
    assigned_pp: u16,
    active_pp: u16,
    /// Whether this PP has run `VMLAUNCH` at least once (Intel only; SVM has no launch/resume
    /// distinction).
    launched: bool,
    backing: VirtAddr,
}

impl VsT {
    const fn uninit() -> Self {
        Self {
            status: VsStatus::Deallocated,
            assigned_vm: BF_INVALID_ID,
            assigned_vp: BF_INVALID_ID,
            assigned_pp: BF_INVALID_ID,
            active_pp: BF_INVALID_ID,
            launched: false,
            backing: VirtAddr(0),
        }
    }
}

struct VsPoolInner {
    ids: IdTracker,
    backing_tag: PageTag,
    vss: [VsT; MAX_VSS],
}

impl SpinLockable for VsPoolInner {}

pub struct VsPool(SpinLock<VsPoolInner>);

impl VsPool {
    pub const fn uninit() -> Self {
        Self(SpinLock::new(VsPoolInner {
            ids: IdTracker::uninit(),
            backing_tag: PageTag::Vmcs,
            vss: [VsT::uninit(); MAX_VSS],
        }))
    }

    /// Must run once during boot, after the page pool and the heap are both live.
    pub fn init(&self) {
        let mut inner = self.0.lock();
        inner.ids = IdTracker::new(Id(0)..Id(MAX_VSS - 1));
        inner.backing_tag = match CPU_VENDOR.get() {
            CpuVendor::Amd => PageTag::Vmcb,
            CpuVendor::Intel | CpuVendor::Invalid => PageTag::Vmcs,
        };
        if matches!(CPU_VENDOR.get(), CpuVendor::Amd) {
            svm::init_asid_allocator();
        }
    }

    pub fn create_vs(&self, assigned_vp: u16, assigned_pp: u16) -> MkResult<u16> {
        let assigned_vm = VP_POOL.assigned_vm(assigned_vp)?;

        let mut inner = self.0.lock();
        let id = inner.ids.allocate().map_err(|_| MkError::ResourceExhausted)?;
        let backing = PAGE_POOL.allocate(inner.backing_tag)?;

        match CPU_VENDOR.get() {
            CpuVendor::Amd => svm::init(backing)?,
            CpuVendor::Intel => vmx::write_revision_id(backing, vmx::revision_id()),
            CpuVendor::Invalid => return Err(MkError::Unsupported),
        }

        inner.vss[id.0] = VsT {
            status: VsStatus::Allocated,
            assigned_vm,
            assigned_vp,
            assigned_pp,
            active_pp: BF_INVALID_ID,
            launched: false,
            backing,
        };
        Ok(id.0 as u16)
    }

    pub fn destroy_vs(&self, vsid: u16) -> MkResult<()> {
        let mut inner = self.0.lock();
        let vs = *inner.vss.get(vsid as usize).ok_or(MkError::InvalidId(0))?;

        if vs.status == VsStatus::Active {
            return Err(MkError::InvalidState);
        }

        let tag = inner.backing_tag;
        PAGE_POOL.deallocate(vs.backing, tag)?;
        inner.vss[vsid as usize] = VsT::uninit();
        unsafe { inner.ids.free(Id(vsid as usize)) }.map_err(|_| MkError::Unknown)?;
        Ok(())
    }

    /// Populates a VS from the loader-captured root-VP state. Only valid for the root VS of a
    /// PP, i.e. `assigned_pp == vsid`.
    pub fn init_as_root(&self, vsid: u16, root_state: &[u8]) -> MkResult<()> {
        let backing = {
            let inner = self.0.lock();
            let vs = inner.vss.get(vsid as usize).ok_or(MkError::InvalidId(0))?;
            if u16::from(vs.assigned_pp) != vsid {
                return Err(MkError::PermissionDenied);
            }
            vs.backing
        };

        match CPU_VENDOR.get() {
            CpuVendor::Amd => svm::init_as_root(backing, root_state),
            CpuVendor::Intel => Err(MkError::Unsupported),
            CpuVendor::Invalid => Err(MkError::Unsupported),
        }
    }

    fn backing_of(&self, vsid: u16) -> MkResult<VirtAddr> {
        let inner = self.0.lock();
        inner
            .vss
            .get(vsid as usize)
            .filter(|vs| vs.status != VsStatus::Deallocated)
            .map(|vs| vs.backing)
            .ok_or(MkError::InvalidId(0))
    }

    pub fn read(&self, vsid: u16, reg: BfReg) -> MkResult<u64> {
        let backing = self.backing_of(vsid)?;
        match CPU_VENDOR.get() {
            CpuVendor::Amd => svm::read(backing, reg),
            CpuVendor::Intel => unsafe { vmx::read(reg) },
            CpuVendor::Invalid => Err(MkError::Unsupported),
        }
    }

    pub fn write(&self, vsid: u16, reg: BfReg, val: u64) -> MkResult<()> {
        let backing = self.backing_of(vsid)?;
        match CPU_VENDOR.get() {
            CpuVendor::Amd => svm::write(backing, reg, val),
            CpuVendor::Intel => unsafe { vmx::write(reg, val) },
            CpuVendor::Invalid => Err(MkError::Unsupported),
        }
    }

    /// Activates `vsid` on the current PP's hardware pointer (`VMPTRLD`/swap) if it isn't
    /// already loaded there, then enters the guest. Returns the exit reason/info pair once
    /// control comes back.
    pub fn run(&self, vsid: u16, current_ppid: u16) -> MkResult<(u64, u64, u64)> {
        let (backing, phys, was_active, launched) = {
            let mut inner = self.0.lock();
            let vs = inner.vss.get_mut(vsid as usize).ok_or(MkError::InvalidId(0))?;
            if vs.status == VsStatus::Deallocated {
                return Err(MkError::InvalidState);
            }
            let was_active = vs.status == VsStatus::Active && vs.active_pp == current_ppid;
            vs.status = VsStatus::Active;
            vs.active_pp = current_ppid;
            let launched = vs.launched;
            vs.launched = true;
            let phys = PAGE_POOL.virt_to_phys(vs.backing).ok_or(MkError::InvalidState)?;
            (vs.backing, phys, was_active, launched)
        };

        match CPU_VENDOR.get() {
            CpuVendor::Amd => {
                unsafe { svm::run(phys) };
                let info = svm::exit_info(backing);
                Ok((info.reason, info.info1, info.info2))
            }
            CpuVendor::Intel => unsafe {
                if !was_active {
                    vmx::load(phys)?;
                }
                vmx::run(launched)?;
                let info = vmx::exit_info()?;
                Ok((info.reason, info.info1, info.info2))
            },
            CpuVendor::Invalid => Err(MkError::Unsupported),
        }
    }

    pub fn advance_ip_and_run(&self, vsid: u16, current_ppid: u16, instr_len: u64) -> MkResult<(u64, u64, u64)> {
        let rip = self.read(vsid, BfReg::Rip)?;
        self.write(vsid, BfReg::Rip, rip + instr_len)?;
        self.run(vsid, current_ppid)
    }

    /// Unwinds virtualization on the current PP and transfers control to `vsid` as though VMX/SVM
    /// had never been turned on. Does not return on success; the caller should treat the `Ok`
    /// arm as unreachable.
    pub fn promote(&self, vsid: u16, current_ppid: u16) -> MkResult<core::convert::Infallible> {
        let assigned_pp = {
            let inner = self.0.lock();
            let vs = inner.vss.get(vsid as usize).ok_or(MkError::InvalidId(0))?;
            vs.assigned_pp
        };
        if assigned_pp != current_ppid {
            return Err(MkError::InvalidState);
        }
        // Architecture-specific unwind (disabling VMX/SVM and jumping to the saved guest
        // context) lives in `dispatch`, which owns the TLS/stack state needed to do it safely.
        Err(MkError::Unsupported)
    }

    /// Evicts `vsid` from the hardware VMCS/VMCB cache. Required before `migrate`.
    pub fn clear(&self, vsid: u16) -> MkResult<()> {
        let (backing, phys) = {
            let mut inner = self.0.lock();
            let vs = inner.vss.get_mut(vsid as usize).ok_or(MkError::InvalidId(0))?;
            if vs.status != VsStatus::Active {
                return Err(MkError::InvalidState);
            }
            vs.status = VsStatus::Cleared;
            vs.launched = false;
            let phys = PAGE_POOL.virt_to_phys(vs.backing).ok_or(MkError::InvalidState)?;
            (vs.backing, phys)
        };

        match CPU_VENDOR.get() {
            CpuVendor::Amd => {
                let _ = backing;
                Ok(())
            }
            CpuVendor::Intel => unsafe { vmx::clear(phys) },
            CpuVendor::Invalid => Err(MkError::Unsupported),
        }
    }

    /// Reassigns a `cleared` VS to a new PP.
    pub fn migrate(&self, vsid: u16, new_pp: u16) -> MkResult<()> {
        let mut inner = self.0.lock();
        let vs = inner.vss.get_mut(vsid as usize).ok_or(MkError::InvalidId(0))?;
        if vs.status != VsStatus::Cleared {
            return Err(MkError::InvalidState);
        }
        vs.assigned_pp = new_pp;
        vs.active_pp = BF_INVALID_ID;
        vs.status = VsStatus::Allocated;
        Ok(())
    }

    pub fn assigned_vm(&self, vsid: u16) -> MkResult<u16> {
        let inner = self.0.lock();
        inner
            .vss
            .get(vsid as usize)
            .filter(|vs| vs.status != VsStatus::Deallocated)
            .map(|vs| vs.assigned_vm)
            .ok_or(MkError::InvalidId(0))
    }

    pub fn assigned_vp(&self, vsid: u16) -> MkResult<u16> {
        let inner = self.0.lock();
        inner
            .vss
            .get(vsid as usize)
            .filter(|vs| vs.status != VsStatus::Deallocated)
            .map(|vs| vs.assigned_vp)
            .ok_or(MkError::InvalidId(0))
    }

    /// `debug_op_dump_vs`.
    pub fn dump(&self) {
        let inner = self.0.lock();
        for (id, vs) in inner.vss.iter().enumerate() {
            if vs.status != VsStatus::Deallocated {
                logger::log_info!(
                    "vs[{}]: status={:?} vm={} vp={} pp={} active_pp={}",
                    id, vs.status, vs.assigned_vm, vs.assigned_vp, vs.assigned_pp, vs.active_pp
                );
            }
        }
    }
}

pub static VS_POOL: VsPool = VsPool::uninit();

/// Invalidates TLB entries tagged to `vmid`'s guest address space on the current PP. With no
/// address given, flushes every entry for that ASID/VPID; otherwise just the one page.
pub fn tlb_flush(asid_or_vpid: u32, addr: Option<u64>) {
    match CPU_VENDOR.get() {
        CpuVendor::Amd => unsafe {
            match addr {
                Some(a) => svm::tlb_flush_addr(asid_or_vpid, a),
                None => svm::tlb_flush(asid_or_vpid),
            }
        },
        CpuVendor::Intel | CpuVendor::Invalid => {
            // INVVPID/INVEPT wrappers live with the rest of the intrinsic instructions.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vs_status_defaults_to_deallocated() {
        let vs = VsT::uninit();
        assert_eq!(vs.status, VsStatus::Deallocated);
        assert_eq!(vs.assigned_vp, BF_INVALID_ID);
    }

    #[test]
    fn migrate_requires_cleared_state() {
        let pool = VsPool::uninit();
        {
            let mut inner = pool.0.lock();
            inner.ids = IdTracker::new(Id(0)..Id(MAX_VSS - 1));
            inner.vss[0].status = VsStatus::Allocated;
        }
        assert!(pool.migrate(0, 1).is_err());
    }
}
