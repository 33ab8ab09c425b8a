//! The Intel VT-x backend. The teacher's VMX support never grew past `CPUID`/`IA32_FEATURE_CONTROL`
//! checks, so the VMCS field table and the `VMREAD`/`VMWRITE`/`VMPTRLD`/`VMLAUNCH`/`VMRESUME`
//! wrappers below are authored against the SDM's encodings directly rather than adapted from it.

use core::arch::asm;

use mk_abi::BfReg;
use utils::mem::PhysAddr;

use crate::error::{MkError, MkResult};

/// A VMCS field encoding, per SDM Vol. 3C Appendix B.
type Field = u32;

const GUEST_ES_SELECTOR: Field = 0x0800;
const GUEST_CS_SELECTOR: Field = 0x0802;
const GUEST_SS_SELECTOR: Field = 0x0804;
const GUEST_DS_SELECTOR: Field = 0x0806;
const GUEST_FS_SELECTOR: Field = 0x0808;
const GUEST_GS_SELECTOR: Field = 0x080a;
const GUEST_LDTR_SELECTOR: Field = 0x080c;
const GUEST_TR_SELECTOR: Field = 0x080e;

const VMCS_LINK_POINTER: Field = 0x2800;
const TSC_OFFSET: Field = 0x2010;
const TSC_MULTIPLIER: Field = 0x2044;
const VMREAD_BITMAP_ADDR: Field = 0x2026;
const VMWRITE_BITMAP_ADDR: Field = 0x2028;
const XSS_EXITING_BITMAP: Field = 0x202c;
const EPT_POINTER: Field = 0x201a;
const APIC_ACCESS_ADDR: Field = 0x2014;
const VIRTUAL_APIC_ADDR: Field = 0x2012;
const POSTED_INTERRUPT_DESC_ADDR: Field = 0x2016;
const PML_ADDRESS: Field = 0x200e;
const EOI_EXIT_BITMAP0: Field = 0x201c;
const EOI_EXIT_BITMAP1: Field = 0x201e;
const EOI_EXIT_BITMAP2: Field = 0x2020;
const EOI_EXIT_BITMAP3: Field = 0x2022;

const PIN_BASED_VM_EXEC_CONTROL: Field = 0x4000;
const CPU_BASED_VM_EXEC_CONTROL: Field = 0x4002;
const SECONDARY_VM_EXEC_CONTROL: Field = 0x401e;
const VM_EXIT_CONTROLS: Field = 0x400c;
const VM_ENTRY_CONTROLS: Field = 0x4012;
const VM_FUNCTION_CONTROLS: Field = 0x2018;
const PAGE_FAULT_ERROR_CODE_MASK: Field = 0x4006;
const PAGE_FAULT_ERROR_CODE_MATCH: Field = 0x4008;

const CR0_GUEST_HOST_MASK: Field = 0x6000;
const CR4_GUEST_HOST_MASK: Field = 0x6002;
const CR0_READ_SHADOW: Field = 0x6004;
const CR4_READ_SHADOW: Field = 0x6006;
const CR3_TARGET_VALUE0: Field = 0x6008;
const CR3_TARGET_VALUE1: Field = 0x600a;
const CR3_TARGET_VALUE2: Field = 0x600c;
const CR3_TARGET_VALUE3: Field = 0x600e;

const GUEST_CR0: Field = 0x6800;
const GUEST_CR3: Field = 0x6802;
const GUEST_CR4: Field = 0x6804;
const GUEST_ES_BASE: Field = 0x6806;
const GUEST_CS_BASE: Field = 0x6808;
const GUEST_SS_BASE: Field = 0x680a;
const GUEST_DS_BASE: Field = 0x680c;
const GUEST_FS_BASE: Field = 0x680e;
const GUEST_GS_BASE: Field = 0x6810;
const GUEST_LDTR_BASE: Field = 0x6812;
const GUEST_TR_BASE: Field = 0x6814;
const GUEST_GDTR_BASE: Field = 0x6816;
const GUEST_IDTR_BASE: Field = 0x6818;
const GUEST_DR7: Field = 0x681a;
const GUEST_RSP: Field = 0x681c;
const GUEST_RIP: Field = 0x681e;
const GUEST_RFLAGS: Field = 0x6820;
const GUEST_IA32_SYSENTER_ESP: Field = 0x6824;
const GUEST_IA32_SYSENTER_EIP: Field = 0x6826;

const GUEST_ES_LIMIT: Field = 0x4800;
const GUEST_CS_LIMIT: Field = 0x4802;
const GUEST_SS_LIMIT: Field = 0x4804;
const GUEST_DS_LIMIT: Field = 0x4806;
const GUEST_FS_LIMIT: Field = 0x4808;
const GUEST_GS_LIMIT: Field = 0x480a;
const GUEST_LDTR_LIMIT: Field = 0x480c;
const GUEST_TR_LIMIT: Field = 0x480e;
const GUEST_GDTR_LIMIT: Field = 0x4810;
const GUEST_IDTR_LIMIT: Field = 0x4812;
const GUEST_ES_AR_BYTES: Field = 0x4814;
const GUEST_CS_AR_BYTES: Field = 0x4816;
const GUEST_SS_AR_BYTES: Field = 0x4818;
const GUEST_DS_AR_BYTES: Field = 0x481a;
const GUEST_FS_AR_BYTES: Field = 0x481c;
const GUEST_GS_AR_BYTES: Field = 0x481e;
const GUEST_LDTR_AR_BYTES: Field = 0x4820;
const GUEST_TR_AR_BYTES: Field = 0x4822;
const GUEST_IA32_SYSENTER_CS: Field = 0x482a;

const GUEST_IA32_EFER: Field = 0x2806;
const GUEST_IA32_PAT: Field = 0x2804;
const GUEST_IA32_DEBUGCTL: Field = 0x2802;
const GUEST_IA32_PERF_GLOBAL_CTRL: Field = 0x2808;

const VM_EXIT_REASON: Field = 0x4402;
const VM_EXIT_INTR_INFO: Field = 0x4404;
const EXIT_QUALIFICATION: Field = 0x6400;

unsafe fn vmread(field: Field) -> MkResult<u64> {
    let value: u64;
    let fail: u8;
    unsafe {
        asm!(
            "vmread {1}, {2}",
            "setna {0}",
            out(reg_byte) fail,
            out(reg) value,
            in(reg) u64::from(field),
            options(nostack, preserves_flags),
        );
    }
    if fail != 0 { Err(MkError::InvalidState) } else { Ok(value) }
}

unsafe fn vmwrite(field: Field, value: u64) -> MkResult<()> {
    let fail: u8;
    unsafe {
        asm!(
            "vmwrite {1}, {2}",
            "setna {0}",
            out(reg_byte) fail,
            in(reg) u64::from(field),
            in(reg) value,
            options(nostack),
        );
    }
    if fail != 0 { Err(MkError::InvalidState) } else { Ok(()) }
}

/// Loads `vmcs_phys` as the current VMCS (`VMPTRLD`).
pub unsafe fn load(vmcs_phys: PhysAddr) -> MkResult<()> {
    let fail: u8;
    unsafe {
        asm!(
            "vmptrld [{1}]",
            "setna {0}",
            out(reg_byte) fail,
            in(reg) &raw const vmcs_phys.0,
            options(nostack),
        );
    }
    if fail != 0 { Err(MkError::InvalidState) } else { Ok(()) }
}

/// Evicts a VMCS from the hardware cache (`VMCLEAR`).
pub unsafe fn clear(vmcs_phys: PhysAddr) -> MkResult<()> {
    let fail: u8;
    unsafe {
        asm!(
            "vmclear [{1}]",
            "setna {0}",
            out(reg_byte) fail,
            in(reg) &raw const vmcs_phys.0,
            options(nostack),
        );
    }
    if fail != 0 { Err(MkError::InvalidState) } else { Ok(()) }
}

/// Writes the VMCS revision ID into the first 4 bytes of a freshly allocated VMCS page.
pub fn write_revision_id(vmcs_virt: utils::mem::VirtAddr, revision_id: u32) {
    let ptr: *mut u32 = vmcs_virt.into();
    unsafe { ptr.write(revision_id) };
}

/// Reads `IA32_VMX_BASIC[30:0]`, the revision ID this processor expects in byte 0 of a VMCS/VMXON
/// region.
pub fn revision_id() -> u32 {
    use arch::x86_64::cpu::msr::{IntelMsr, rdmsr};
    let data: u64 = unsafe { rdmsr(IntelMsr::Ia32VmxBasic) }.into();
    (data & 0x7fff_ffff) as u32
}

/// `VMLAUNCH` the first time a VMCS is run, `VMRESUME` afterward.
pub unsafe fn run(launched: bool) -> MkResult<()> {
    let fail: u8;
    unsafe {
        if launched {
            asm!("vmresume", "setna {0}", out(reg_byte) fail, options(nostack));
        } else {
            asm!("vmlaunch", "setna {0}", out(reg_byte) fail, options(nostack));
        }
    }
    if fail != 0 { Err(MkError::InvalidState) } else { Ok(()) }
}

pub struct ExitInfo {
    pub reason: u64,
    pub info1: u64,
    pub info2: u64,
}

/// Reads the exit reason/qualification/interrupt-info triple. Must run with the exiting VMCS
/// still current.
pub unsafe fn exit_info() -> MkResult<ExitInfo> {
    unsafe {
        Ok(ExitInfo {
            reason: vmread(VM_EXIT_REASON)? & 0xffff,
            info1: vmread(EXIT_QUALIFICATION)?,
            info2: vmread(VM_EXIT_INTR_INFO)?,
        })
    }
}

fn field_for(reg: BfReg) -> Option<Field> {
    Some(match reg {
        BfReg::Rip => GUEST_RIP,
        BfReg::Rsp => GUEST_RSP,
        BfReg::Rflags => GUEST_RFLAGS,
        BfReg::Cr0 => GUEST_CR0,
        BfReg::Cr3 => GUEST_CR3,
        BfReg::Cr4 => GUEST_CR4,
        BfReg::Dr7 => GUEST_DR7,
        BfReg::EsSelector => GUEST_ES_SELECTOR,
        BfReg::EsBase => GUEST_ES_BASE,
        BfReg::EsLimit => GUEST_ES_LIMIT,
        BfReg::EsAttrib => GUEST_ES_AR_BYTES,
        BfReg::CsSelector => GUEST_CS_SELECTOR,
        BfReg::CsBase => GUEST_CS_BASE,
        BfReg::CsLimit => GUEST_CS_LIMIT,
        BfReg::CsAttrib => GUEST_CS_AR_BYTES,
        BfReg::SsSelector => GUEST_SS_SELECTOR,
        BfReg::SsBase => GUEST_SS_BASE,
        BfReg::SsLimit => GUEST_SS_LIMIT,
        BfReg::SsAttrib => GUEST_SS_AR_BYTES,
        BfReg::DsSelector => GUEST_DS_SELECTOR,
        BfReg::DsBase => GUEST_DS_BASE,
        BfReg::DsLimit => GUEST_DS_LIMIT,
        BfReg::DsAttrib => GUEST_DS_AR_BYTES,
        BfReg::FsSelector => GUEST_FS_SELECTOR,
        BfReg::FsBase => GUEST_FS_BASE,
        BfReg::FsLimit => GUEST_FS_LIMIT,
        BfReg::FsAttrib => GUEST_FS_AR_BYTES,
        BfReg::GsSelector => GUEST_GS_SELECTOR,
        BfReg::GsBase => GUEST_GS_BASE,
        BfReg::GsLimit => GUEST_GS_LIMIT,
        BfReg::GsAttrib => GUEST_GS_AR_BYTES,
        BfReg::LdtrSelector => GUEST_LDTR_SELECTOR,
        BfReg::LdtrBase => GUEST_LDTR_BASE,
        BfReg::LdtrLimit => GUEST_LDTR_LIMIT,
        BfReg::LdtrAttrib => GUEST_LDTR_AR_BYTES,
        BfReg::TrSelector => GUEST_TR_SELECTOR,
        BfReg::TrBase => GUEST_TR_BASE,
        BfReg::TrLimit => GUEST_TR_LIMIT,
        BfReg::TrAttrib => GUEST_TR_AR_BYTES,
        BfReg::GdtrBase => GUEST_GDTR_BASE,
        BfReg::GdtrLimit => GUEST_GDTR_LIMIT,
        BfReg::IdtrBase => GUEST_IDTR_BASE,
        BfReg::IdtrLimit => GUEST_IDTR_LIMIT,
        BfReg::Ia32Pat => GUEST_IA32_PAT,
        BfReg::Ia32Efer => GUEST_IA32_EFER,
        BfReg::Ia32SysenterCs => GUEST_IA32_SYSENTER_CS,
        BfReg::Ia32SysenterEsp => GUEST_IA32_SYSENTER_ESP,
        BfReg::Ia32SysenterEip => GUEST_IA32_SYSENTER_EIP,
        BfReg::Ia32Debugctl => GUEST_IA32_DEBUGCTL,
        BfReg::Ia32PerfGlobalCtrl => GUEST_IA32_PERF_GLOBAL_CTRL,
        BfReg::VmcsPinBasedCtls => PIN_BASED_VM_EXEC_CONTROL,
        BfReg::VmcsProcBasedCtls => CPU_BASED_VM_EXEC_CONTROL,
        BfReg::VmcsProcBasedCtls2 => SECONDARY_VM_EXEC_CONTROL,
        BfReg::VmcsExitCtls => VM_EXIT_CONTROLS,
        BfReg::VmcsEntryCtls => VM_ENTRY_CONTROLS,
        BfReg::VmcsVmFunctionCtrls => VM_FUNCTION_CONTROLS,
        BfReg::VmcsEptPointer => EPT_POINTER,
        BfReg::VmcsEoiExitBitmap0 => EOI_EXIT_BITMAP0,
        BfReg::VmcsEoiExitBitmap1 => EOI_EXIT_BITMAP1,
        BfReg::VmcsEoiExitBitmap2 => EOI_EXIT_BITMAP2,
        BfReg::VmcsEoiExitBitmap3 => EOI_EXIT_BITMAP3,
        BfReg::VmcsTscOffset => TSC_OFFSET,
        BfReg::VmcsTscMultiplier => TSC_MULTIPLIER,
        BfReg::VmcsApicAccessAddr => APIC_ACCESS_ADDR,
        BfReg::VmcsVirtualApicAddr => VIRTUAL_APIC_ADDR,
        BfReg::VmcsPostedInterruptDescAddr => POSTED_INTERRUPT_DESC_ADDR,
        BfReg::VmreadBitmapAddr => VMREAD_BITMAP_ADDR,
        BfReg::VmwriteBitmapAddr => VMWRITE_BITMAP_ADDR,
        BfReg::XssExitingBitmap => XSS_EXITING_BITMAP,
        BfReg::PmlAddress => PML_ADDRESS,
        BfReg::PageFaultErrorCodeMask => PAGE_FAULT_ERROR_CODE_MASK,
        BfReg::PageFaultErrorCodeMatch => PAGE_FAULT_ERROR_CODE_MATCH,
        BfReg::Cr0GuestHostMask => CR0_GUEST_HOST_MASK,
        BfReg::Cr0ReadShadow => CR0_READ_SHADOW,
        BfReg::Cr4GuestHostMask => CR4_GUEST_HOST_MASK,
        BfReg::Cr4ReadShadow => CR4_READ_SHADOW,
        BfReg::Cr3TargetValue0 => CR3_TARGET_VALUE0,
        BfReg::Cr3TargetValue1 => CR3_TARGET_VALUE1,
        BfReg::Cr3TargetValue2 => CR3_TARGET_VALUE2,
        BfReg::Cr3TargetValue3 => CR3_TARGET_VALUE3,
        _ => return None,
    })
}

/// SAFETY: the VMCS belonging to `reg`'s VS must already be the current one (`VMPTRLD`ed).
pub unsafe fn read(reg: BfReg) -> MkResult<u64> {
    let field = field_for(reg).ok_or(MkError::Unsupported)?;
    unsafe { vmread(field) }
}

/// SAFETY: the VMCS belonging to `reg`'s VS must already be the current one (`VMPTRLD`ed).
pub unsafe fn write(reg: BfReg, val: u64) -> MkResult<()> {
    let field = field_for(reg).ok_or(MkError::Unsupported)?;
    unsafe { vmwrite(field, val) }
}

/// Sets the VMCS link pointer to `!0` (no shadow VMCS), as mandated for a non-nested VMCS.
pub unsafe fn disable_vmcs_shadowing() -> MkResult<()> {
    unsafe { vmwrite(VMCS_LINK_POINTER, u64::MAX) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_for_covers_the_common_registers() {
        assert_eq!(field_for(BfReg::Rip), Some(GUEST_RIP));
        assert_eq!(field_for(BfReg::Rax), None);
    }
}
