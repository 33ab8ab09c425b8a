//! The extension: exactly one per build, loaded once by the loader and invoked through three
//! registered callbacks (`bootstrap`, `vmexit`, `fail`). The pool here tracks the handle it was
//! issued and the callback instruction pointers it registers at startup; it never touches the
//! extension's image, stack, or TLS contents, those are loader/RPT concerns.

use mk_abi::{BF_INVALID_HANDLE, BF_INVALID_ID};
use utils::sync::spinlock::{SpinLock, SpinLockable};

use crate::MAX_EXTS;
use crate::error::{MkError, MkResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtStatus {
    Deallocated,
    Allocated,
}

/// An extension's registered callback entry points, `0` meaning "not yet registered".
#[derive(Debug, Clone, Copy)]
struct Callbacks {
    bootstrap_ip: u64,
    vmexit_ip: u64,
    fail_ip: u64,
}

impl Callbacks {
    const fn uninit() -> Self {
        Self { bootstrap_ip: 0, vmexit_ip: 0, fail_ip: 0 }
    }
}

#[derive(Clone, Copy)]
struct ExtT {
    status: ExtStatus,
    handle: u64,
    callbacks: Callbacks,
}

impl ExtT {
    const fn uninit() -> Self {
        Self { status: ExtStatus::Deallocated, handle: BF_INVALID_HANDLE, callbacks: Callbacks::uninit() }
    }
}

struct ExtPoolInner {
    exts: [ExtT; MAX_EXTS],
}

impl SpinLockable for ExtPoolInner {}

pub struct ExtPool(SpinLock<ExtPoolInner>);

/// `bootstrap(ppid)`. Runs once per PP with no active triple.
pub type BootstrapFn = unsafe extern "C" fn(u16);
/// `vmexit(active_vsid, exit_reason)`.
pub type VmexitFn = unsafe extern "C" fn(u16, u64);
/// `fail(vector, error_code)`.
pub type FailFn = unsafe extern "C" fn(u8, u64);

impl ExtPool {
    pub const fn uninit() -> Self {
        Self(SpinLock::new(ExtPoolInner { exts: [ExtT::uninit(); MAX_EXTS] }))
    }

    pub fn init(&self) {
        let mut inner = self.0.lock();
        for ext in inner.exts.iter_mut() {
            *ext = ExtT::uninit();
        }
    }

    /// `handle_op_open_handle`. Only bit 1 ("spec-ID-1") is negotiated; any other bitmap fails.
    /// Exactly one extension exists (`extid = 0`), matching the single-extension-per-build model.
    pub fn open_handle(&self, version: u32) -> MkResult<u64> {
        if version != mk_abi::version::BF_SPEC_ID1_MASK {
            return Err(MkError::Unsupported);
        }

        let mut inner = self.0.lock();
        let ext = inner.exts.get_mut(0).ok_or(MkError::InvalidId(0))?;
        if ext.status == ExtStatus::Allocated {
            return Err(MkError::InvalidState);
        }

        let handle = 0x6642_0000_0000_0000 | 0;
        *ext = ExtT { status: ExtStatus::Allocated, handle, callbacks: Callbacks::uninit() };
        Ok(handle)
    }

    /// Validates `handle` against `extid`'s issued handle. Every syscall but `open_handle` runs
    /// this first.
    pub fn check_handle(&self, extid: u16, handle: u64) -> MkResult<()> {
        let mut inner = self.0.lock();
        self.checked(&mut inner, extid, handle)?;
        Ok(())
    }

    pub fn close_handle(&self, extid: u16, handle: u64) -> MkResult<()> {
        let mut inner = self.0.lock();
        let ext = self.checked(&mut inner, extid, handle)?;
        *ext = ExtT::uninit();
        Ok(())
    }

    /// Validates on the handle alone, not `status`: a closed (or never-opened) extension's
    /// `handle` reverts to `BF_INVALID_HANDLE`, which no real caller-held handle equals, so a
    /// stale handle is rejected as `InvalidHandle` rather than the less specific `InvalidState`.
    fn checked<'a>(&self, inner: &'a mut ExtPoolInner, extid: u16, handle: u64) -> MkResult<&'a mut ExtT> {
        let ext = inner.exts.get_mut(extid as usize).ok_or(MkError::InvalidId(0))?;
        if ext.handle != handle {
            return Err(MkError::InvalidHandle);
        }
        Ok(ext)
    }

    pub fn register_bootstrap(&self, extid: u16, handle: u64, ip: u64) -> MkResult<()> {
        let mut inner = self.0.lock();
        self.checked(&mut inner, extid, handle)?.callbacks.bootstrap_ip = ip;
        Ok(())
    }

    pub fn register_vmexit(&self, extid: u16, handle: u64, ip: u64) -> MkResult<()> {
        let mut inner = self.0.lock();
        self.checked(&mut inner, extid, handle)?.callbacks.vmexit_ip = ip;
        Ok(())
    }

    pub fn register_fail(&self, extid: u16, handle: u64, ip: u64) -> MkResult<()> {
        let mut inner = self.0.lock();
        self.checked(&mut inner, extid, handle)?.callbacks.fail_ip = ip;
        Ok(())
    }

    /// Invokes the registered `bootstrap` callback. Fails `UNSUPPORTED` if the extension hasn't
    /// registered one yet, the category-5 protocol violation a caller must turn into a halt.
    pub fn invoke_bootstrap(&self, extid: u16, ppid: u16) -> MkResult<()> {
        let ip = {
            let mut inner = self.0.lock();
            let ext = inner.exts.get_mut(extid as usize).ok_or(MkError::InvalidId(0))?;
            if ext.status != ExtStatus::Allocated {
                return Err(MkError::InvalidState);
            }
            ext.callbacks.bootstrap_ip
        };
        if ip == 0 {
            return Err(MkError::Unsupported);
        }
        let f: BootstrapFn = unsafe { core::mem::transmute(ip as usize) };
        unsafe { f(ppid) };
        Ok(())
    }

    /// Invokes the registered `vmexit` callback with `(active_vsid, exit_reason)`.
    pub fn invoke_vmexit(&self, extid: u16, active_vsid: u16, exit_reason: u64) -> MkResult<()> {
        let ip = {
            let mut inner = self.0.lock();
            let ext = inner.exts.get_mut(extid as usize).ok_or(MkError::InvalidId(0))?;
            if ext.status != ExtStatus::Allocated {
                return Err(MkError::InvalidState);
            }
            ext.callbacks.vmexit_ip
        };
        if ip == 0 {
            return Err(MkError::Unsupported);
        }
        let f: VmexitFn = unsafe { core::mem::transmute(ip as usize) };
        unsafe { f(active_vsid, exit_reason) };
        Ok(())
    }

    /// Invokes the registered `fail` callback with `(vector, error_code)`, per §7 category 4.
    pub fn invoke_fail(&self, extid: u16, _ppid: u16, vector: u8, error_code: u64) -> MkResult<()> {
        if extid == BF_INVALID_ID {
            return Err(MkError::InvalidId(0));
        }
        let ip = {
            let mut inner = self.0.lock();
            let ext = inner.exts.get_mut(extid as usize).ok_or(MkError::InvalidId(0))?;
            if ext.status != ExtStatus::Allocated {
                return Err(MkError::InvalidState);
            }
            ext.callbacks.fail_ip
        };
        if ip == 0 {
            return Err(MkError::Unsupported);
        }
        let f: FailFn = unsafe { core::mem::transmute(ip as usize) };
        unsafe { f(vector, error_code) };
        Ok(())
    }
    /// `debug_op_dump_ext`.
    pub fn dump(&self) {
        let inner = self.0.lock();
        for (id, ext) in inner.exts.iter().enumerate() {
            if ext.status == ExtStatus::Allocated {
                logger::log_info!(
                    "ext[{}]: handle={:#x} bootstrap={:#x} vmexit={:#x} fail={:#x}",
                    id, ext.handle, ext.callbacks.bootstrap_ip, ext.callbacks.vmexit_ip, ext.callbacks.fail_ip
                );
            }
        }
    }
}

pub static EXT_POOL: ExtPool = ExtPool::uninit();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_handle_rejects_unsupported_version() {
        let pool = ExtPool::uninit();
        pool.init();
        assert!(pool.open_handle(0xFF).is_err());
    }

    #[test]
    fn open_handle_then_register_round_trips() {
        let pool = ExtPool::uninit();
        pool.init();

        let handle = pool.open_handle(mk_abi::version::BF_SPEC_ID1_MASK).unwrap();
        pool.register_bootstrap(0, handle, 0x1000).unwrap();
        pool.register_vmexit(0, handle, 0x2000).unwrap();
        pool.register_fail(0, handle, 0x3000).unwrap();
    }

    #[test]
    fn invoke_without_registration_is_unsupported() {
        let pool = ExtPool::uninit();
        pool.init();

        let handle = pool.open_handle(mk_abi::version::BF_SPEC_ID1_MASK).unwrap();
        let _ = handle;
        assert_eq!(pool.invoke_fail(0, 0, 13, 0).unwrap_err(), MkError::Unsupported);
    }

    #[test]
    fn wrong_handle_is_rejected() {
        let pool = ExtPool::uninit();
        pool.init();

        let _handle = pool.open_handle(mk_abi::version::BF_SPEC_ID1_MASK).unwrap();
        assert_eq!(pool.close_handle(0, 0xDEAD).unwrap_err(), MkError::InvalidHandle);
    }
}
