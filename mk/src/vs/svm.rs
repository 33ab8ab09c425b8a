//! The AMD-V backend: a condensed VMCB plus the `VMRUN` entry sequence.
//!
//! Field layout mirrors the parts of the AMD APM's VMCB that `mk_abi::BfReg` actually names;
//! performance-counter and IBS state the ABI has no register tag for is left out.

use core::arch::asm;
use core::cell::UnsafeCell;

use mk_abi::BfReg;
use modular_bitfield::prelude::*;
use utils::collections::id::{Id, tracker::IdTracker};
use utils::mem::{PhysAddr, VirtAddr};
use utils::sanity_assert;
use utils::sync::spinlock::{SpinLock, SpinLockable};

use crate::error::{MkError, MkResult};

struct AsidTracker(IdTracker);
impl SpinLockable for AsidTracker {}

/// The guest ASID allocator. ASID 0 is reserved for the host.
static ASID_ALLOCATOR: SpinLock<AsidTracker> = SpinLock::new(AsidTracker(IdTracker::uninit()));

pub fn init_asid_allocator() {
    use core::arch::x86_64::__cpuid;

    let mut allocator = ASID_ALLOCATOR.lock();
    let start = Id(1);
    let end = unsafe { Id(__cpuid(0x8000_000a).ebx as usize + 1) };
    allocator.0 = IdTracker::new(start..end);
}

#[allow(dead_code)]
#[repr(C, packed)]
#[bitfield]
struct Intercepts {
    cr_reads: B16,
    cr_writes: B16,
    dr_reads: B16,
    dr_writes: B16,
    exceptions: B32,
    intr: B1,
    nmi: B1,
    smi: B1,
    init: B1,
    virtual_intr: B1,
    cr0_sel_write: B1,
    idtr_read: B1,
    gdtr_read: B1,
    ldtr_read: B1,
    tr_read: B1,
    idtr_write: B1,
    gdtr_write: B1,
    ldtr_write: B1,
    tr_write: B1,
    rdtsc: B1,
    rdpmc: B1,
    pushf: B1,
    popf: B1,
    cpuid: B1,
    rsm: B1,
    iret: B1,
    intn: B1,
    invd: B1,
    pause: B1,
    hlt: B1,
    invlpg: B1,
    invlpga: B1,
    ioio_prot: B1,
    msr_prot: B1,
    task_switch: B1,
    f_err_freeze: B1,
    shutdown: B1,
    vmrun: B1,
    vmmcall: B1,
    vmload: B1,
    vmsave: B1,
    stgi: B1,
    clgi: B1,
    skinit: B1,
    rdtscp: B1,
    icebp: B1,
    wbinvd: B1,
    monitor: B1,
    mwait: B1,
    mwait_conditional: B1,
    xsetbv: B1,
    rdpru: B1,
    efer_write: B1,
    #[skip]
    reserved_0: B16,
    invlpgb_all: B1,
    invlpgb_illegal: B1,
    invpcid: B1,
    mcommit: B1,
    tlbsync: B1,
    bus_lock: B1,
    idle_hlt: B1,
    #[skip]
    reserved_1: B25,
}

#[bitfield]
#[repr(u64)]
struct ExitIntInfo {
    vector: B8,
    typ: B3,
    error_code_valid: B1,
    #[skip]
    reserved: B19,
    valid: B1,
    error_code: B32,
}

#[bitfield]
#[repr(u64)]
struct SvmFlags {
    np_enable: B1,
    sev_enable: B1,
    essev_enable: B1,
    guest_mode_execute_trap: B1,
    sss_check_fn: B1,
    vte_enable: B1,
    ro_guest_page_tables_enable: B1,
    invlpgb_tlbsync_enable: B1,
    #[skip]
    reserved: B56,
}

#[allow(dead_code)]
#[repr(C, packed)]
struct ControlArea {
    intercepts: Intercepts,
    reserved_1: [u8; 0x3c - 0x18],
    pause_filter_threshold: u16,
    pause_filter_count: u16,
    iopm_base_pa: u64,
    msrpm_base_pa: u64,
    tsc_offset: u64,
    guest_asid: u32,
    tlb_control: u32,
    vintr: u64,
    reserved_7: u64,
    exitcode: i64,
    exitinfo1: u64,
    exitinfo2: u64,
    exitintinfo: ExitIntInfo,
    flags: SvmFlags,
    reserved_9: u64,
    guest_phys_addr_ghcb: u64,
    event_injection: u64,
    n_cr3: u64,
    lbr_virtualization_enable: u64,
    vmcb_clean_bits: u32,
    reserved_11: u32,
    nrip: u64,
    reserved_12: [u8; 0x400 - 0xd0],
}

#[allow(dead_code)]
#[repr(C, packed)]
struct StateSaveArea {
    es_selector: u16,
    es_attrib: u16,
    es_limit: u32,
    es_base: u64,
    cs_selector: u16,
    cs_attrib: u16,
    cs_limit: u32,
    cs_base: u64,
    ss_selector: u16,
    ss_attrib: u16,
    ss_limit: u32,
    ss_base: u64,
    ds_selector: u16,
    ds_attrib: u16,
    ds_limit: u32,
    ds_base: u64,
    fs_selector: u16,
    fs_attrib: u16,
    fs_limit: u32,
    fs_base: u64,
    gs_selector: u16,
    gs_attrib: u16,
    gs_limit: u32,
    gs_base: u64,
    gdtr_selector: u16,
    gdtr_attrib: u16,
    gdtr_limit: u32,
    gdtr_base: u64,
    ldtr_selector: u16,
    ldtr_attrib: u16,
    ldtr_limit: u32,
    ldtr_base: u64,
    idtr_selector: u16,
    idtr_attrib: u16,
    idtr_limit: u32,
    idtr_base: u64,
    tr_selector: u16,
    tr_attrib: u16,
    tr_limit: u32,
    tr_base: u64,
    reserved_1: [u8; 0xcb - 0xa0],
    cpl: u8,
    reserved_2: u32,
    efer: u64,
    reserved_3: [u8; 0xe0 - 0xd8],
    reserved_perf: [u8; 0x148 - 0xe0],
    cr4: u64,
    cr3: u64,
    cr0: u64,
    dr7: u64,
    dr6: u64,
    rflags: u64,
    rip: u64,
    reserved_4: [u8; 0x1d8 - 0x180],
    rsp: u64,
    reserved_5: [u8; 0x1f8 - 0x1e0],
    rax: u64,
    star: u64,
    lstar: u64,
    cstar: u64,
    sfmask: u64,
    kernel_gs_base: u64,
    sysenter_cs: u64,
    sysenter_esp: u64,
    sysenter_eip: u64,
    cr2: u64,
    reserved_6: [u8; 0x268 - 0x248],
    g_pat: u64,
    dbg_ctl: u64,
    br_from: u64,
    br_to: u64,
    last_exception_from: u64,
    last_exception_to: u64,
    reserved_7: [u8; 0xc00 - 0x298],
}

#[repr(C, align(0x1000))]
pub struct Vmcb {
    control: UnsafeCell<ControlArea>,
    state_save: UnsafeCell<StateSaveArea>,
}

const _: () = assert!(core::mem::size_of::<Vmcb>() == 0x1000);

fn ctrl(vmcb: *mut Vmcb) -> *mut ControlArea {
    unsafe { (*vmcb).control.get() }
}

fn state(vmcb: *mut Vmcb) -> *mut StateSaveArea {
    unsafe { (*vmcb).state_save.get() }
}

/// Zeroes the page and programs the intercepts every VS needs regardless of the extension's
/// choices: `VMRUN` (mandatory per the APM), `#VMEXIT` on CPUID/HLT, and ASID assignment.
pub fn init(vmcb_virt: VirtAddr) -> MkResult<()> {
    let vmcb: *mut Vmcb = vmcb_virt.into();
    unsafe {
        core::ptr::write_bytes(vmcb.cast::<u8>(), 0, 0x1000);
        let c = ctrl(vmcb);
        (*c).intercepts.set_vmrun(1);
        (*c).intercepts.set_cpuid(1);
        (*c).intercepts.set_hlt(1);
        (*c).intercepts.set_exceptions(0xffff_ffff);
        (*c).guest_asid = ASID_ALLOCATOR
            .lock()
            .0
            .allocate()
            .map_err(|_| MkError::ResourceExhausted)?
            .0 as u32;
    }
    Ok(())
}

/// Populates the VMCB from the loader-captured root-VP state so resuming it returns to the host.
pub fn init_as_root(vmcb_virt: VirtAddr, root_state: &[u8]) -> MkResult<()> {
    sanity_assert!(root_state.len() >= 0x1000);
    let vmcb: *mut Vmcb = vmcb_virt.into();
    unsafe {
        core::ptr::copy_nonoverlapping(root_state.as_ptr(), vmcb.cast::<u8>(), 0x1000);
    }
    Ok(())
}

pub fn read(vmcb_virt: VirtAddr, reg: BfReg) -> MkResult<u64> {
    let vmcb: *mut Vmcb = vmcb_virt.into();
    unsafe {
        let s = state(vmcb);
        let c = ctrl(vmcb);
        Ok(match reg {
            BfReg::Rax => (*s).rax,
            BfReg::Rip => (*s).rip,
            BfReg::Rsp => (*s).rsp,
            BfReg::Rflags => (*s).rflags,
            BfReg::Cr0 => (*s).cr0,
            BfReg::Cr2 => (*s).cr2,
            BfReg::Cr3 => (*s).cr3,
            BfReg::Cr4 => (*s).cr4,
            BfReg::Dr6 => (*s).dr6,
            BfReg::Dr7 => (*s).dr7,
            BfReg::CsSelector => u64::from((*s).cs_selector),
            BfReg::CsBase => (*s).cs_base,
            BfReg::CsLimit => u64::from((*s).cs_limit),
            BfReg::CsAttrib => u64::from((*s).cs_attrib),
            BfReg::SsSelector => u64::from((*s).ss_selector),
            BfReg::SsBase => (*s).ss_base,
            BfReg::SsLimit => u64::from((*s).ss_limit),
            BfReg::SsAttrib => u64::from((*s).ss_attrib),
            BfReg::GdtrBase => (*s).gdtr_base,
            BfReg::GdtrLimit => u64::from((*s).gdtr_limit),
            BfReg::IdtrBase => (*s).idtr_base,
            BfReg::IdtrLimit => u64::from((*s).idtr_limit),
            BfReg::Ia32Pat => (*s).g_pat,
            BfReg::Ia32Efer => (*s).efer,
            BfReg::Ia32SysenterCs => (*s).sysenter_cs,
            BfReg::Ia32SysenterEsp => (*s).sysenter_esp,
            BfReg::Ia32SysenterEip => (*s).sysenter_eip,
            BfReg::Ia32GsBase => (*s).kernel_gs_base,
            BfReg::Ia32Debugctl => (*s).dbg_ctl,
            BfReg::VmcsTscOffset => (*c).tsc_offset,
            _ => return Err(MkError::Unsupported),
        })
    }
}

pub fn write(vmcb_virt: VirtAddr, reg: BfReg, val: u64) -> MkResult<()> {
    let vmcb: *mut Vmcb = vmcb_virt.into();
    unsafe {
        let s = state(vmcb);
        let c = ctrl(vmcb);
        match reg {
            BfReg::Rax => (*s).rax = val,
            BfReg::Rip => (*s).rip = val,
            BfReg::Rsp => (*s).rsp = val,
            BfReg::Rflags => (*s).rflags = val,
            BfReg::Cr0 => (*s).cr0 = val,
            BfReg::Cr2 => (*s).cr2 = val,
            BfReg::Cr3 => (*s).cr3 = val,
            BfReg::Cr4 => (*s).cr4 = val,
            BfReg::Dr6 => (*s).dr6 = val,
            BfReg::Dr7 => (*s).dr7 = val,
            BfReg::CsSelector => (*s).cs_selector = val as u16,
            BfReg::CsBase => (*s).cs_base = val,
            BfReg::CsLimit => (*s).cs_limit = val as u32,
            BfReg::CsAttrib => (*s).cs_attrib = val as u16,
            BfReg::SsSelector => (*s).ss_selector = val as u16,
            BfReg::SsBase => (*s).ss_base = val,
            BfReg::SsLimit => (*s).ss_limit = val as u32,
            BfReg::SsAttrib => (*s).ss_attrib = val as u16,
            BfReg::GdtrBase => (*s).gdtr_base = val,
            BfReg::GdtrLimit => (*s).gdtr_limit = val as u32,
            BfReg::IdtrBase => (*s).idtr_base = val,
            BfReg::IdtrLimit => (*s).idtr_limit = val as u32,
            BfReg::Ia32Pat => (*s).g_pat = val,
            BfReg::Ia32Efer => (*s).efer = val,
            BfReg::Ia32SysenterCs => (*s).sysenter_cs = val,
            BfReg::Ia32SysenterEsp => (*s).sysenter_esp = val,
            BfReg::Ia32SysenterEip => (*s).sysenter_eip = val,
            BfReg::Ia32GsBase => (*s).kernel_gs_base = val,
            BfReg::Ia32Debugctl => (*s).dbg_ctl = val,
            BfReg::VmcsTscOffset => (*c).tsc_offset = val,
            _ => return Err(MkError::Unsupported),
        }
    }
    Ok(())
}

pub fn n_cr3_set(vmcb_virt: VirtAddr, n_cr3: PhysAddr) {
    let vmcb: *mut Vmcb = vmcb_virt.into();
    unsafe {
        let c = ctrl(vmcb);
        (*c).n_cr3 = n_cr3.0 as u64;
        (*c).flags.set_np_enable(1);
    }
}

/// Exit info snapshot handed back to the dispatcher after `VMRUN` returns.
pub struct ExitInfo {
    pub reason: u64,
    pub info1: u64,
    pub info2: u64,
}

pub fn exit_info(vmcb_virt: VirtAddr) -> ExitInfo {
    let vmcb: *mut Vmcb = vmcb_virt.into();
    unsafe {
        let c = ctrl(vmcb);
        ExitInfo { reason: (*c).exitcode as u64, info1: (*c).exitinfo1, info2: (*c).exitinfo2 }
    }
}

/// Executes `VMRUN` against the VMCB at `vmcb_phys`. Returns once the guest exits.
pub unsafe fn run(vmcb_phys: PhysAddr) {
    sanity_assert!(vmcb_phys.0 % 0x1000 == 0);
    unsafe {
        asm!("vmrun", in("rax") vmcb_phys.0, options(nostack));
    }
}

/// Invalidates every TLB entry tagged with the given guest ASID (`INVLPGA` with `rax = 0`).
pub unsafe fn tlb_flush(asid: u32) {
    unsafe {
        asm!("invlpga", in("rax") 0u64, in("ecx") asid, options(nostack));
    }
}

pub unsafe fn tlb_flush_addr(asid: u32, addr: u64) {
    unsafe {
        asm!("invlpga", in("rax") addr, in("ecx") asid, options(nostack));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmcb_is_one_page() {
        assert_eq!(core::mem::size_of::<Vmcb>(), 0x1000);
    }
}
