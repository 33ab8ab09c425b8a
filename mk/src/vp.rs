//! `vp_t`: a virtual-processor binding to a VM, and the fixed-capacity pool that owns them.

use mk_abi::BF_INVALID_ID;
use utils::collections::id::{Id, tracker::IdTracker};
use utils::sync::spinlock::{SpinLock, SpinLockable};

use crate::MAX_VPS;
use crate::ONLINE_PPS;
use crate::error::{MkError, MkResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VpStatus {
    Deallocated,
    Allocated,
}

#[derive(Clone, Copy)]
struct VpT {
    status: VpStatus,
    assigned_vm: u16,
    active: [bool; ONLINE_PPS],
}

impl VpT {
    const fn uninit() -> Self {
        Self { status: VpStatus::Deallocated, assigned_vm: BF_INVALID_ID, active: [false; ONLINE_PPS] }
    }
}

struct VpPoolInner {
    ids: IdTracker,
    vps: [VpT; MAX_VPS],
}

impl SpinLockable for VpPoolInner {}

pub struct VpPool(SpinLock<VpPoolInner>);

impl VpPool {
    pub const fn uninit() -> Self {
        Self(SpinLock::new(VpPoolInner {
            ids: IdTracker::uninit(),
            vps: [VpT::uninit(); MAX_VPS],
        }))
    }

    pub fn init(&self) {
        let mut inner = self.0.lock();
        inner.ids = IdTracker::new(Id(0)..Id(MAX_VPS - 1));
    }

    pub fn create_vp(&self, assigned_vm: u16) -> MkResult<u16> {
        let mut inner = self.0.lock();
        let id = inner.ids.allocate().map_err(|_| MkError::ResourceExhausted)?;
        inner.vps[id.0] = VpT {
            status: VpStatus::Allocated,
            assigned_vm,
            active: [false; ONLINE_PPS],
        };
        Ok(id.0 as u16)
    }

    pub fn destroy_vp(&self, vpid: u16) -> MkResult<()> {
        let mut inner = self.0.lock();
        let vp = inner
            .vps
            .get(vpid as usize)
            .copied()
            .ok_or(MkError::InvalidId(0))?;

        if vp.status != VpStatus::Allocated {
            return Err(MkError::InvalidState);
        }
        if vp.active.iter().any(|&a| a) {
            return Err(MkError::InvalidState);
        }

        inner.vps[vpid as usize] = VpT::uninit();
        unsafe { inner.ids.free(Id(vpid as usize)) }.map_err(|_| MkError::Unknown)?;
        Ok(())
    }

    pub fn assigned_vm(&self, vpid: u16) -> MkResult<u16> {
        let inner = self.0.lock();
        inner
            .vps
            .get(vpid as usize)
            .filter(|vp| vp.status == VpStatus::Allocated)
            .map(|vp| vp.assigned_vm)
            .ok_or(MkError::InvalidId(0))
    }

    pub fn set_active(&self, vpid: u16, ppid: u16) -> MkResult<()> {
        let mut inner = self.0.lock();
        let vp = inner.vps.get_mut(vpid as usize).ok_or(MkError::InvalidId(0))?;
        if vp.status != VpStatus::Allocated {
            return Err(MkError::InvalidState);
        }
        vp.active[ppid as usize] = true;
        Ok(())
    }

    pub fn set_inactive(&self, vpid: u16, ppid: u16) -> MkResult<()> {
        let mut inner = self.0.lock();
        let vp = inner.vps.get_mut(vpid as usize).ok_or(MkError::InvalidId(0))?;
        vp.active[ppid as usize] = false;
        Ok(())
    }

    /// `debug_op_dump_vp`.
    pub fn dump(&self) {
        let inner = self.0.lock();
        for (id, vp) in inner.vps.iter().enumerate() {
            if vp.status == VpStatus::Allocated {
                logger::log_info!("vp[{}]: assigned_vm={} active={:?}", id, vp.assigned_vm, vp.active);
            }
        }
    }
}

pub static VP_POOL: VpPool = VpPool::uninit();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroy_clears_assigned_vm() {
        let pool = VpPool::uninit();
        pool.init();

        let id = pool.create_vp(3).unwrap();
        assert_eq!(pool.assigned_vm(id).unwrap(), 3);

        pool.destroy_vp(id).unwrap();
        assert!(pool.assigned_vm(id).is_err());
    }

    #[test]
    fn destroy_while_active_on_any_pp_fails() {
        let pool = VpPool::uninit();
        pool.init();

        let id = pool.create_vp(0).unwrap();
        pool.set_active(id, 0).unwrap();
        assert!(pool.destroy_vp(id).is_err());
    }
}
