//! `vm_t`: an address-space identity, and the fixed-capacity pool that owns them.

use mk_abi::BF_ROOT_VMID;
use utils::collections::id::{Id, tracker::IdTracker};
use utils::sync::spinlock::{SpinLock, SpinLockable};

use crate::ONLINE_PPS;
use crate::MAX_VMS;
use crate::error::{MkError, MkResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VmStatus {
    Deallocated,
    Allocated,
}

/// One VM slot. Its id is always its index in the pool, never stored redundantly.
#[derive(Clone, Copy)]
struct VmT {
    status: VmStatus,
    active: [bool; ONLINE_PPS],
}

impl VmT {
    const fn uninit() -> Self {
        Self { status: VmStatus::Deallocated, active: [false; ONLINE_PPS] }
    }
}

struct VmPoolInner {
    ids: IdTracker,
    vms: [VmT; MAX_VMS],
}

impl SpinLockable for VmPoolInner {}

/// The pool of `vm_t` address-space identities. ID `0` (`BF_ROOT_VMID`) is reserved for the root
/// VM and pre-allocated at `init()`.
pub struct VmPool(SpinLock<VmPoolInner>);

impl VmPool {
    pub const fn uninit() -> Self {
        Self(SpinLock::new(VmPoolInner {
            ids: IdTracker::uninit(),
            vms: [VmT::uninit(); MAX_VMS],
        }))
    }

    /// Must run once during boot, after the kernel heap is usable (`IdTracker` is bitmap-backed).
    /// Does not itself allocate a VM: `ROOT_VMID` just names whichever VM the extension's
    /// bootstrap callback happens to create first, which is always id `0` since the tracker
    /// starts out empty.
    pub fn init(&self) {
        let mut inner = self.0.lock();
        inner.ids = IdTracker::new(Id(0)..Id(MAX_VMS - 1));
    }

    pub fn create_vm(&self) -> MkResult<u16> {
        let mut inner = self.0.lock();
        let id = inner.ids.allocate().map_err(|_| MkError::ResourceExhausted)?;
        inner.vms[id.0].status = VmStatus::Allocated;
        inner.vms[id.0].active = [false; ONLINE_PPS];
        Ok(id.0 as u16)
    }

    pub fn destroy_vm(&self, vmid: u16) -> MkResult<()> {
        let mut inner = self.0.lock();
        let vm = inner
            .vms
            .get(vmid as usize)
            .copied()
            .ok_or(MkError::InvalidId(0))?;

        if vm.status != VmStatus::Allocated {
            return Err(MkError::InvalidState);
        }
        if vm.active.iter().any(|&a| a) {
            return Err(MkError::InvalidState);
        }

        inner.vms[vmid as usize].status = VmStatus::Deallocated;
        unsafe { inner.ids.free(Id(vmid as usize)) }.map_err(|_| MkError::Unknown)?;
        Ok(())
    }

    pub fn set_active(&self, vmid: u16, ppid: u16) -> MkResult<()> {
        let mut inner = self.0.lock();
        let vm = inner.vms.get_mut(vmid as usize).ok_or(MkError::InvalidId(0))?;
        if vm.status != VmStatus::Allocated {
            return Err(MkError::InvalidState);
        }
        vm.active[ppid as usize] = true;
        Ok(())
    }

    pub fn set_inactive(&self, vmid: u16, ppid: u16) -> MkResult<()> {
        let mut inner = self.0.lock();
        let vm = inner.vms.get_mut(vmid as usize).ok_or(MkError::InvalidId(0))?;
        vm.active[ppid as usize] = false;
        Ok(())
    }

    pub fn is_active(&self, vmid: u16, ppid: u16) -> MkResult<bool> {
        let inner = self.0.lock();
        let vm = inner.vms.get(vmid as usize).ok_or(MkError::InvalidId(0))?;
        Ok(vm.active[ppid as usize])
    }

    /// `debug_op_dump_vm`.
    pub fn dump(&self) {
        let inner = self.0.lock();
        for (id, vm) in inner.vms.iter().enumerate() {
            if vm.status == VmStatus::Allocated {
                logger::log_info!("vm[{}]: active={:?}", id, vm.active);
            }
        }
    }
}

pub static VM_POOL: VmPool = VmPool::uninit();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_vm_created_gets_the_root_vmid() {
        let pool = VmPool::uninit();
        pool.init();
        assert_eq!(pool.create_vm().unwrap(), BF_ROOT_VMID);
    }

    #[test]
    fn create_then_destroy_frees_the_id() {
        let pool = VmPool::uninit();
        pool.init();

        let id = pool.create_vm().unwrap();
        pool.destroy_vm(id).unwrap();

        let id2 = pool.create_vm().unwrap();
        assert_eq!(id, id2);
    }

    #[test]
    fn destroy_while_active_fails() {
        let pool = VmPool::uninit();
        pool.init();

        let id = pool.create_vm().unwrap();
        pool.set_active(id, 0).unwrap();
        assert!(pool.destroy_vm(id).is_err());

        pool.set_inactive(id, 0).unwrap();
        assert!(pool.destroy_vm(id).is_ok());
    }
}
