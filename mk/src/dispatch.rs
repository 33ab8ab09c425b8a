//! Control-flow core: the syscall table and the VM-exit dispatcher.
//!
//! The actual trap entry (the `vmcall`/`vmmcall` trampoline, and the VM-exit trampoline that
//! spills guest GPRs into TLS) is per-architecture assembly whose instruction sequence is out of
//! scope here; both call straight into the Rust functions below once registers are in a known
//! place.

use mk_abi::{BfReg, idx, opcode, status};

use crate::error::MkError;
use crate::ext::EXT_POOL;
use crate::pool::{PAGE_POOL, PageTag, huge_pool};
use crate::tls::TLS;
use crate::vm::VM_POOL;
use crate::vmexit_log::{VMEXIT_LOGS, VmexitLogEntry};
use crate::vp::VP_POOL;
use crate::vs::{VS_POOL, tlb_flush};

/// Exactly one extension per build (§1); its id is always `0`.
const EXTID: u16 = 0;

/// Registers as the syscall ABI sees them. `rax` carries the opcode in and the status out;
/// `rbx` carries the extension's handle in on every call but `open_handle` (which carries the
/// requested version bitmap in and the issued handle out); `rcx`/`rdx`/`rsi`/`rdi` are
/// call-specific inputs/outputs.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallRegs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
}

impl SyscallRegs {
    fn ok(&mut self) {
        self.rax = status::BF_STATUS_SUCCESS;
    }

    fn fail(&mut self, e: MkError) {
        self.rax = e.to_status();
    }

    fn reg(&mut self, r: Result<(), MkError>) {
        match r {
            Ok(()) => self.ok(),
            Err(e) => self.fail(e),
        }
    }
}

fn try_reg(val: u64) -> Result<BfReg, MkError> {
    BfReg::try_from(val).map_err(|_| MkError::InvalidId(2))
}

/// The sole entry point a syscall trampoline calls into. Dispatches on the `(family, index)` pair
/// packed into `rax`, validates the signature and handle, then runs the call.
pub fn dispatch_syscall(ppid: u16, regs: &mut SyscallRegs) {
    if !opcode::is_bareflank_syscall(regs.rax) {
        regs.fail(MkError::Unknown);
        return;
    }

    let family = opcode::syscall_opcode(regs.rax);
    let index = opcode::syscall_index(regs.rax);

    // `open_handle` is the one call made before a handle exists.
    if family == opcode::BF_HANDLE_OP_VAL && index == idx::BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL {
        match EXT_POOL.open_handle(regs.rbx as u32) {
            Ok(handle) => {
                regs.rbx = handle;
                regs.ok();
            }
            Err(e) => regs.fail(e),
        }
        return;
    }

    let handle = regs.rbx;
    if let Err(e) = EXT_POOL.check_handle(EXTID, handle) {
        regs.fail(e);
        return;
    }

    match family {
        opcode::BF_CONTROL_OP_VAL => control_op(ppid, index, regs),
        opcode::BF_HANDLE_OP_VAL => handle_op(index, handle, regs),
        opcode::BF_DEBUG_OP_VAL => debug_op(ppid, index, regs),
        opcode::BF_CALLBACK_OP_VAL => callback_op(index, handle, regs),
        opcode::BF_VM_OP_VAL => vm_op(index, regs),
        opcode::BF_VP_OP_VAL => vp_op(index, regs),
        opcode::BF_VS_OP_VAL => vs_op(ppid, index, regs),
        opcode::BF_INTRINSIC_OP_VAL => intrinsic_op(index, regs),
        opcode::BF_MEM_OP_VAL => mem_op(index, regs),
        _ => regs.fail(MkError::Unknown),
    }
}

fn control_op(ppid: u16, index: u64, regs: &mut SyscallRegs) {
    match index {
        idx::BF_CONTROL_OP_EXIT_IDX_VAL => {
            logger::log_info!("pp {} extension exited", ppid);
            loop {
                unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) };
            }
        }
        // `wait`/`again` exist to re-enter callback dispatch; with one extension and one
        // callback set per PP there's nothing to wait on, so both are a no-op success.
        idx::BF_CONTROL_OP_WAIT_IDX_VAL | idx::BF_CONTROL_OP_AGAIN_IDX_VAL => regs.ok(),
        _ => regs.fail(MkError::Unknown),
    }
}

fn handle_op(index: u64, handle: u64, regs: &mut SyscallRegs) {
    match index {
        idx::BF_HANDLE_OP_CLOSE_HANDLE_IDX_VAL => {
            let r = EXT_POOL.close_handle(EXTID, handle);
            regs.reg(r);
        }
        _ => regs.fail(MkError::Unknown),
    }
}

fn debug_op(ppid: u16, index: u64, regs: &mut SyscallRegs) {
    match index {
        idx::BF_DEBUG_OP_OUT_IDX_VAL => {
            logger::log_info!("debug_op_out: {:#x}", regs.rcx);
            regs.ok();
        }
        idx::BF_DEBUG_OP_WRITE_C_IDX_VAL => {
            crate::debug_ring::DEBUG_RING.write_c(regs.rcx as u8);
            regs.ok();
        }
        idx::BF_DEBUG_OP_WRITE_STR_IDX_VAL => {
            // SAFETY: extension-owned `[rcx, rcx + rdx)` is readable; the loader maps the
            // extension's entire image and scratch range with no fs/gs aliasing over it.
            let ptr = regs.rcx as *const u8;
            let len = regs.rdx as usize;
            let s = unsafe { core::slice::from_raw_parts(ptr, len) };
            crate::debug_ring::DEBUG_RING.write_str(s);
            regs.ok();
        }
        idx::BF_DEBUG_OP_DUMP_VM_IDX_VAL => {
            VM_POOL.dump();
            regs.ok();
        }
        idx::BF_DEBUG_OP_DUMP_VP_IDX_VAL => {
            VP_POOL.dump();
            regs.ok();
        }
        idx::BF_DEBUG_OP_DUMP_VS_IDX_VAL => {
            VS_POOL.dump();
            regs.ok();
        }
        idx::BF_DEBUG_OP_DUMP_VMEXIT_LOG_IDX_VAL => {
            unsafe { VMEXIT_LOGS[ppid as usize].dump() };
            regs.ok();
        }
        idx::BF_DEBUG_OP_DUMP_EXT_IDX_VAL => {
            EXT_POOL.dump();
            regs.ok();
        }
        idx::BF_DEBUG_OP_DUMP_PAGE_POOL_IDX_VAL => {
            PAGE_POOL.dump();
            regs.ok();
        }
        idx::BF_DEBUG_OP_DUMP_HUGE_POOL_IDX_VAL => {
            huge_pool::dump();
            regs.ok();
        }
        _ => regs.fail(MkError::Unknown),
    }
}

fn callback_op(index: u64, handle: u64, regs: &mut SyscallRegs) {
    let ip = regs.rcx;
    let r = match index {
        idx::BF_CALLBACK_OP_REGISTER_BOOTSTRAP_IDX_VAL => EXT_POOL.register_bootstrap(EXTID, handle, ip),
        idx::BF_CALLBACK_OP_REGISTER_VMEXIT_IDX_VAL => EXT_POOL.register_vmexit(EXTID, handle, ip),
        idx::BF_CALLBACK_OP_REGISTER_FAIL_IDX_VAL => EXT_POOL.register_fail(EXTID, handle, ip),
        _ => Err(MkError::Unknown),
    };
    regs.reg(r);
}

fn vm_op(index: u64, regs: &mut SyscallRegs) {
    match index {
        idx::BF_VM_OP_CREATE_VM_IDX_VAL => match VM_POOL.create_vm() {
            Ok(vmid) => {
                regs.rcx = vmid as u64;
                regs.ok();
            }
            Err(e) => regs.fail(e),
        },
        idx::BF_VM_OP_DESTROY_VM_IDX_VAL => regs.reg(VM_POOL.destroy_vm(regs.rcx as u16)),
        idx::BF_VM_OP_TLB_FLUSH_IDX_VAL => {
            tlb_flush(regs.rcx as u32, None);
            regs.ok();
        }
        // Direct-map mappings require a per-VM RPT, which boot-time wiring doesn't yet track;
        // until then these three report unsupported rather than silently no-op.
        idx::BF_VM_OP_MAP_DIRECT_IDX_VAL
        | idx::BF_VM_OP_UNMAP_DIRECT_IDX_VAL
        | idx::BF_VM_OP_UNMAP_DIRECT_BROADCAST_IDX_VAL => regs.fail(MkError::Unsupported),
        _ => regs.fail(MkError::Unknown),
    }
}

fn vp_op(index: u64, regs: &mut SyscallRegs) {
    match index {
        idx::BF_VP_OP_CREATE_VP_IDX_VAL => match VP_POOL.create_vp(regs.rcx as u16) {
            Ok(vpid) => {
                regs.rcx = vpid as u64;
                regs.ok();
            }
            Err(e) => regs.fail(e),
        },
        idx::BF_VP_OP_DESTROY_VP_IDX_VAL => regs.reg(VP_POOL.destroy_vp(regs.rcx as u16)),
        _ => regs.fail(MkError::Unknown),
    }
}

fn vs_op(ppid: u16, index: u64, regs: &mut SyscallRegs) {
    match index {
        idx::BF_VS_OP_CREATE_VS_IDX_VAL => match VS_POOL.create_vs(regs.rcx as u16, regs.rdx as u16) {
            Ok(vsid) => {
                regs.rcx = vsid as u64;
                regs.ok();
            }
            Err(e) => regs.fail(e),
        },
        idx::BF_VS_OP_DESTROY_VS_IDX_VAL => regs.reg(VS_POOL.destroy_vs(regs.rcx as u16)),
        idx::BF_VS_OP_INIT_AS_ROOT_IDX_VAL => {
            // SAFETY: the extension passes the loader-captured root-VP state blob it was handed
            // at `_start`; length is fixed at one page per `vs::init_as_root`.
            let state = unsafe { core::slice::from_raw_parts(regs.rdx as *const u8, 0x1000) };
            regs.reg(VS_POOL.init_as_root(regs.rcx as u16, state));
        }
        idx::BF_VS_OP_READ_IDX_VAL => match try_reg(regs.rdx).and_then(|r| VS_POOL.read(regs.rcx as u16, r)) {
            Ok(val) => {
                regs.rdx = val;
                regs.ok();
            }
            Err(e) => regs.fail(e),
        },
        idx::BF_VS_OP_WRITE_IDX_VAL => {
            let r = try_reg(regs.rdx).and_then(|r| VS_POOL.write(regs.rcx as u16, r, regs.rsi));
            regs.reg(r);
        }
        idx::BF_VS_OP_RUN_IDX_VAL | idx::BF_VS_OP_RUN_CURRENT_IDX_VAL => {
            let vsid = if index == idx::BF_VS_OP_RUN_CURRENT_IDX_VAL {
                unsafe { TLS.get(ppid) }.active().active_vsid
            } else {
                regs.rcx as u16
            };
            run_vs(ppid, vsid, regs);
        }
        idx::BF_VS_OP_ADVANCE_IP_AND_RUN_IDX_VAL | idx::BF_VS_OP_ADVANCE_IP_AND_RUN_CURRENT_IDX_VAL => {
            let vsid = if index == idx::BF_VS_OP_ADVANCE_IP_AND_RUN_CURRENT_IDX_VAL {
                unsafe { TLS.get(ppid) }.active().active_vsid
            } else {
                regs.rcx as u16
            };
            match VS_POOL.advance_ip_and_run(vsid, ppid, regs.rdx) {
                Ok((reason, info1, info2)) => on_vmexit(ppid, vsid, reason, info1, info2),
                Err(e) => regs.fail(e),
            }
        }
        idx::BF_VS_OP_PROMOTE_IDX_VAL => match VS_POOL.promote(regs.rcx as u16, ppid) {
            Ok(_) => unreachable!("promote never returns on success"),
            Err(e) => regs.fail(e),
        },
        idx::BF_VS_OP_CLEAR_IDX_VAL => regs.reg(VS_POOL.clear(regs.rcx as u16)),
        idx::BF_VS_OP_MIGRATE_IDX_VAL => regs.reg(VS_POOL.migrate(regs.rcx as u16, regs.rdx as u16)),
        idx::BF_VS_OP_SET_ACTIVE_IDX_VAL => {
            set_active(ppid, regs.rcx as u16, regs.rdx as u16, regs.rsi as u16, regs)
        }
        idx::BF_VS_OP_ADVANCE_IP_AND_SET_ACTIVE_IDX_VAL => {
            // Resolved per the design notes' open question on atomicity: advance-then-activate
            // is not atomic. If `set_active` fails after the IP write, the VS is left with its
            // IP already advanced and inactive; the caller observes the failure status and may
            // retry `set_active` alone without re-advancing.
            let vsid = regs.rsi as u16;
            let advance = regs.rdi;
            if let Err(e) = VS_POOL
                .read(vsid, BfReg::Rip)
                .and_then(|rip| VS_POOL.write(vsid, BfReg::Rip, rip + advance))
            {
                regs.fail(e);
                return;
            }
            set_active(ppid, regs.rcx as u16, regs.rdx as u16, vsid, regs);
        }
        idx::BF_VS_OP_TLB_FLUSH_IDX_VAL => {
            let addr = if regs.rdx != 0 { Some(regs.rdx) } else { None };
            tlb_flush(regs.rcx as u32, addr);
            regs.ok();
        }
        _ => regs.fail(MkError::Unknown),
    }
}

/// `vs_op_set_active(vmid, vpid, vsid)`: validates the triple is mutually consistent (the VS is
/// assigned to the given VP, which is assigned to the given VM), marks both VM and VP active on
/// this PP, and updates the TLS active triple. Does not itself run anything.
fn set_active(ppid: u16, vmid: u16, vpid: u16, vsid: u16, regs: &mut SyscallRegs) {
    let r = (|| -> Result<(), MkError> {
        if VS_POOL.assigned_vp(vsid)? != vpid {
            return Err(MkError::InvalidId(1));
        }
        if VP_POOL.assigned_vm(vpid)? != vmid {
            return Err(MkError::InvalidId(0));
        }

        VM_POOL.set_active(vmid, ppid)?;
        VP_POOL.set_active(vpid, ppid)?;

        let tls = unsafe { TLS.get_mut(ppid) };
        let mut active = tls.active();
        active.active_vmid = vmid;
        active.active_vpid = vpid;
        active.active_vsid = vsid;
        tls.set_active(active);
        Ok(())
    })();
    regs.reg(r);
}

/// `run`'s only normal continuation is `on_vmexit` invoking the extension's `vmexit` callback,
/// which itself only ever leaves by issuing another `run`/`advance_ip_and_run` (recursing back
/// through `dispatch_syscall`) or `promote` (diverging). A `run` that fails before VM-entry
/// (bad vsid, wrong PP) is the one case that does return a status to the caller.
fn run_vs(ppid: u16, vsid: u16, regs: &mut SyscallRegs) {
    match VS_POOL.run(vsid, ppid) {
        Ok((reason, info1, info2)) => on_vmexit(ppid, vsid, reason, info1, info2),
        Err(e) => regs.fail(e),
    }
}

fn intrinsic_op(index: u64, regs: &mut SyscallRegs) {
    match index {
        idx::BF_INTRINSIC_OP_RDMSR_IDX_VAL => match crate::intrinsic::rdmsr_checked(regs.rcx as u32) {
            Ok(val) => {
                regs.rdx = val;
                regs.ok();
            }
            Err(e) => regs.fail(e),
        },
        idx::BF_INTRINSIC_OP_WRMSR_IDX_VAL => {
            regs.reg(crate::intrinsic::wrmsr_checked(regs.rcx as u32, regs.rdx));
        }
        _ => regs.fail(MkError::Unknown),
    }
}

fn mem_op(index: u64, regs: &mut SyscallRegs) {
    match index {
        idx::BF_MEM_OP_ALLOC_PAGE_IDX_VAL => match PAGE_POOL.allocate(PageTag::Misc) {
            Ok(virt) => {
                regs.rcx = virt.0 as u64;
                regs.rdx = PAGE_POOL.virt_to_phys(virt).map(|p| p.0 as u64).unwrap_or(0);
                regs.ok();
            }
            Err(e) => regs.fail(e),
        },
        idx::BF_MEM_OP_ALLOC_HUGE_IDX_VAL => match huge_pool::allocate(regs.rcx as usize, PageTag::Misc) {
            Ok(virt) => {
                regs.rcx = virt.0 as u64;
                regs.ok();
            }
            Err(e) => regs.fail(e),
        },
        _ => regs.fail(MkError::Unknown),
    }
}

/// The Rust-side half of VM-exit handling: reads the exit reason, logs it, and invokes the
/// extension's registered `vmexit` callback. Its only valid returns are another `run`/`promote`
/// issued as a syscall from inside the callback; falling through to here returning normally is
/// the protocol violation the fast-fail path exists to catch.
fn on_vmexit(ppid: u16, active_vsid: u16, exit_reason: u64, info1: u64, info2: u64) -> ! {
    unsafe {
        VMEXIT_LOGS[ppid as usize].push(VmexitLogEntry {
            vsid: active_vsid,
            exit_reason,
            exitinfo1: info1,
            exitinfo2: info2,
        });
    }

    let _ = EXT_POOL.invoke_vmexit(EXTID, active_vsid, exit_reason);
    crate::fail::protocol_violation(ppid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_bareflank_opcode_fails() {
        let mut regs = SyscallRegs { rax: 0xBAD0_0000_0000_0000, ..Default::default() };
        dispatch_syscall(0, &mut regs);
        assert_eq!(regs.rax, status::BF_STATUS_FAILURE_UNKNOWN);
    }

    #[test]
    fn open_handle_then_create_vm_round_trips() {
        EXT_POOL.init();
        VM_POOL.init();

        let mut open = SyscallRegs {
            rax: opcode::BF_HANDLE_OP_VAL | idx::BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL,
            rbx: mk_abi::version::BF_SPEC_ID1_MASK as u64,
            ..Default::default()
        };
        dispatch_syscall(0, &mut open);
        assert_eq!(open.rax, status::BF_STATUS_SUCCESS);
        let handle = open.rbx;

        let mut create = SyscallRegs {
            rax: opcode::BF_VM_OP_VAL | idx::BF_VM_OP_CREATE_VM_IDX_VAL,
            rbx: handle,
            ..Default::default()
        };
        dispatch_syscall(0, &mut create);
        assert_eq!(create.rax, status::BF_STATUS_SUCCESS);
    }
}
