//! Thin wrappers around the handful of privileged instructions the `BF_INTRINSIC_OP` syscall
//! family exposes to extensions: MSR and control-register access. Everything VMX/SVM-specific
//! (`VMREAD`/`VMWRITE`/`VMRUN`/`VMLAUNCH`) lives with its backend in `vs`, since those always run
//! against "whichever VS is current," not a bare hardware register.

use arch::x86_64::cpu::msr::{IntelMsr, MsrData, rdmsr, wrmsr};

use crate::error::{MkError, MkResult};

/// MSRs extensions are permitted to touch directly. Anything else must fail `UNSUPPORTED` rather
/// than let an extension poke at microkernel-private state (e.g. `MSR_GS_BASE`, which backs TLS).
fn checked_msr(msr: u32) -> MkResult<IntelMsr> {
    match msr {
        0x1B => Ok(IntelMsr::Ia32ApicBase),
        0x277 => Ok(IntelMsr::Ia32Pat),
        0xC000_0080 => Ok(IntelMsr::Ia32Efer),
        0xC000_0100 => Ok(IntelMsr::Ia32FsBase),
        _ => Err(MkError::Unsupported),
    }
}

pub fn rdmsr_checked(msr: u32) -> MkResult<u64> {
    let msr = checked_msr(msr)?;
    Ok(unsafe { rdmsr(msr) }.into())
}

pub fn wrmsr_checked(msr: u32, val: u64) -> MkResult<()> {
    let msr = checked_msr(msr)?;
    let data: MsrData = val.into();
    unsafe { wrmsr(msr, data) };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_msr_is_rejected() {
        assert_eq!(checked_msr(0xdead).unwrap_err(), MkError::Unsupported);
    }

    #[test]
    fn known_msr_is_accepted() {
        assert!(checked_msr(0x277).is_ok());
    }
}
