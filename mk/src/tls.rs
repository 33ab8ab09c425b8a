//! The per-PP TLS block.
//!
//! One block per physical processor, placed at a fixed virtual address in the microkernel's
//! address space and addressed through `GS_BASE` on Intel hosts (AMD hosts use the same base via
//! `MSR_GS_BASE`, since `mk` never runs ring 3 code that would need `SWAPGS`). Layout offsets
//! come from `mk-abi` and are part of the ABI, not an implementation detail.

use core::cell::SyncUnsafeCell;

use mk_abi::tls::*;
use utils::mem::VirtAddr;

/// Saved guest GPRs, spilled here by the VMExit trampoline before the dispatcher runs.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct GuestGprs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// The "active triple" plus bookkeeping every PP carries.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ActiveState {
    pub active_extid: u16,
    pub active_vmid: u16,
    pub active_vpid: u16,
    pub active_vsid: u16,
    pub active_ppid: u16,
    pub online_pps: u16,
}

impl Default for ActiveState {
    fn default() -> Self {
        Self {
            active_extid: mk_abi::BF_INVALID_ID,
            active_vmid: mk_abi::BF_INVALID_ID,
            active_vpid: mk_abi::BF_INVALID_ID,
            active_vsid: mk_abi::BF_INVALID_ID,
            active_ppid: mk_abi::BF_INVALID_ID,
            online_pps: 0,
        }
    }
}

/// One PP's TLS block. Field offsets must match `mk_abi::tls` exactly; the `_pad` field carries
/// us out to the ABI's fixed offsets so a future field addition can't shift anything after it.
#[repr(C)]
pub struct Tls {
    gprs: GuestGprs,
    _pad_to_active: [u8; TLS_OFFSET_ACTIVE_EXTID - (TLS_OFFSET_R15 + 8)],
    active: ActiveState,
}

const _: () = assert!(core::mem::offset_of!(Tls, gprs) == 0);

/// Per-PP TLS blocks, indexed by PP id. Each PP only ever touches its own slot; cross-PP access
/// never happens by construction, so no lock is needed.
pub struct TlsTable<const ONLINE_PPS: usize>(SyncUnsafeCell<[Tls; ONLINE_PPS]>);

impl<const ONLINE_PPS: usize> TlsTable<ONLINE_PPS> {
    pub const fn new() -> Self {
        Self(SyncUnsafeCell::new(
            [const {
                Tls {
                    gprs: GuestGprs {
                        rax: 0,
                        rbx: 0,
                        rcx: 0,
                        rdx: 0,
                        rbp: 0,
                        rsi: 0,
                        rdi: 0,
                        r8: 0,
                        r9: 0,
                        r10: 0,
                        r11: 0,
                        r12: 0,
                        r13: 0,
                        r14: 0,
                        r15: 0,
                    },
                    _pad_to_active: [0; TLS_OFFSET_ACTIVE_EXTID - (TLS_OFFSET_R15 + 8)],
                    active: ActiveState {
                        active_extid: mk_abi::BF_INVALID_ID,
                        active_vmid: mk_abi::BF_INVALID_ID,
                        active_vpid: mk_abi::BF_INVALID_ID,
                        active_vsid: mk_abi::BF_INVALID_ID,
                        active_ppid: mk_abi::BF_INVALID_ID,
                        online_pps: 0,
                    },
                }
            }; ONLINE_PPS],
        ))
    }

    /// SAFETY: `ppid` must be the id of the currently executing PP.
    #[inline]
    pub unsafe fn get(&self, ppid: u16) -> &Tls {
        unsafe { &(*self.0.get())[ppid as usize] }
    }

    /// SAFETY: `ppid` must be the id of the currently executing PP.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, ppid: u16) -> &mut Tls {
        unsafe { &mut (*self.0.get())[ppid as usize] }
    }
}

impl Tls {
    #[inline]
    pub fn gprs(&self) -> &GuestGprs {
        &self.gprs
    }

    #[inline]
    pub fn gprs_mut(&mut self) -> &mut GuestGprs {
        &mut self.gprs
    }

    #[inline]
    pub fn active(&self) -> ActiveState {
        self.active
    }

    #[inline]
    pub fn set_active(&mut self, active: ActiveState) {
        self.active = active;
    }

    /// Clears the active triple back to all-invalid, leaving `active_ppid`/`online_pps` intact.
    pub fn clear_active_triple(&mut self) {
        self.active.active_vmid = mk_abi::BF_INVALID_ID;
        self.active.active_vpid = mk_abi::BF_INVALID_ID;
        self.active.active_vsid = mk_abi::BF_INVALID_ID;
    }
}

/// The microkernel-wide TLS table, one slot per online PP.
pub static TLS: TlsTable<{ crate::ONLINE_PPS }> = TlsTable::new();

/// Reads the virtual base this PP's TLS block lives at, via `GS_BASE`.
pub fn tls_base() -> VirtAddr {
    use arch::x86_64::cpu::msr::{IntelMsr, rdmsr};
    let data: u64 = unsafe { rdmsr(IntelMsr::Ia32GsBase) }.into();
    VirtAddr(data as usize)
}
