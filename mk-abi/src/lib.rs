//! The syscall ABI shared between `mk` and extensions.
//!
//! This crate is intentionally dependency-free and `no_std` so it can be vendored into
//! extension code unmodified, on either side of the syscall boundary.

#![cfg_attr(not(test), no_std)]

/// Reserved ID value meaning "no object".
pub const BF_INVALID_ID: u16 = 0xFFFF;

/// The PP id an extension's bootstrap callback runs on.
pub const BF_BS_PPID: u16 = 0x0;

/// The VM id of the root VM, always allocated first.
pub const BF_ROOT_VMID: u16 = 0x0;

/// Reserved handle value meaning "no handle".
pub const BF_INVALID_HANDLE: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Status codes returned in `rax` from every syscall.
pub mod status {
    pub const BF_STATUS_SUCCESS: u64 = 0x0;
    pub const BF_STATUS_FAILURE_UNKNOWN: u64 = 0xDEAD_0000_0000_0001;
    pub const BF_STATUS_FAILURE_INVALID_PERM: u64 = 0xDEAD_0000_0000_0002;
    pub const BF_STATUS_INVALID_HANDLE: u64 = 0xDEAD_0000_0000_0003;
    pub const BF_STATUS_INVALID_INPUT_REG0: u64 = 0xDEAD_0000_0100_0001;
    pub const BF_STATUS_INVALID_INPUT_REG1: u64 = 0xDEAD_0000_0100_0002;
    pub const BF_STATUS_INVALID_INPUT_REG2: u64 = 0xDEAD_0000_0100_0003;
    pub const BF_STATUS_INVALID_INPUT_REG3: u64 = 0xDEAD_0000_0100_0004;
    pub const BF_STATUS_INVALID_INPUT_REG4: u64 = 0xDEAD_0000_0100_0005;
    pub const BF_STATUS_INVALID_INPUT_REG5: u64 = 0xDEAD_0000_0100_0006;
    pub const BF_STATUS_INVALID_OUTPUT_REG0: u64 = 0xDEAD_0000_0800_0001;
    pub const BF_STATUS_INVALID_OUTPUT_REG1: u64 = 0xDEAD_0000_0800_0002;
    pub const BF_STATUS_INVALID_OUTPUT_REG2: u64 = 0xDEAD_0000_0800_0003;
    pub const BF_STATUS_INVALID_OUTPUT_REG3: u64 = 0xDEAD_0000_0800_0004;
    pub const BF_STATUS_INVALID_OUTPUT_REG4: u64 = 0xDEAD_0000_0800_0005;
    pub const BF_STATUS_INVALID_OUTPUT_REG5: u64 = 0xDEAD_0000_0800_0006;
}

/// Syscall opcode/signature layout (`rax` on entry).
pub mod opcode {
    pub const BF_SYSCALL_SIG_VAL: u64 = 0x6642_0000_0000_0000;
    pub const BF_SYSCALL_SIG_MASK: u64 = 0xFFFF_0000_0000_0000;
    pub const BF_SYSCALL_FLAGS_MASK: u64 = 0x0000_FFFF_0000_0000;
    pub const BF_SYSCALL_OPCODE_MASK: u64 = 0xFFFF_FFFF_0000_0000;
    pub const BF_SYSCALL_OPCODE_NOSIG_MASK: u64 = 0x0000_FFFF_0000_0000;
    pub const BF_SYSCALL_INDEX_MASK: u64 = 0x0000_0000_FFFF_FFFF;

    #[inline]
    pub const fn syscall_sig(rax: u64) -> u64 {
        rax & BF_SYSCALL_SIG_MASK
    }

    #[inline]
    pub const fn syscall_opcode(rax: u64) -> u64 {
        rax & BF_SYSCALL_OPCODE_MASK
    }

    #[inline]
    pub const fn syscall_opcode_nosig(rax: u64) -> u64 {
        rax & BF_SYSCALL_OPCODE_NOSIG_MASK
    }

    #[inline]
    pub const fn syscall_index(rax: u64) -> u64 {
        rax & BF_SYSCALL_INDEX_MASK
    }

    #[inline]
    pub const fn is_bareflank_syscall(rax: u64) -> bool {
        syscall_sig(rax) == BF_SYSCALL_SIG_VAL
    }

    pub const BF_CONTROL_OP_VAL: u64 = 0x6642_0000_0000_0000;
    pub const BF_CONTROL_OP_NOSIG_VAL: u64 = 0x0000_0000_0000_0000;
    pub const BF_HANDLE_OP_VAL: u64 = 0x6642_0001_0000_0000;
    pub const BF_HANDLE_OP_NOSIG_VAL: u64 = 0x0000_0001_0000_0000;
    pub const BF_DEBUG_OP_VAL: u64 = 0x6642_0002_0000_0000;
    pub const BF_DEBUG_OP_NOSIG_VAL: u64 = 0x0000_0002_0000_0000;
    pub const BF_CALLBACK_OP_VAL: u64 = 0x6642_0003_0000_0000;
    pub const BF_CALLBACK_OP_NOSIG_VAL: u64 = 0x0000_0003_0000_0000;
    pub const BF_VM_OP_VAL: u64 = 0x6642_0004_0000_0000;
    pub const BF_VM_OP_NOSIG_VAL: u64 = 0x0000_0004_0000_0000;
    pub const BF_VP_OP_VAL: u64 = 0x6642_0005_0000_0000;
    pub const BF_VP_OP_NOSIG_VAL: u64 = 0x0000_0005_0000_0000;
    pub const BF_VS_OP_VAL: u64 = 0x6642_0006_0000_0000;
    pub const BF_VS_OP_NOSIG_VAL: u64 = 0x0000_0006_0000_0000;
    pub const BF_INTRINSIC_OP_VAL: u64 = 0x6642_0007_0000_0000;
    pub const BF_INTRINSIC_OP_NOSIG_VAL: u64 = 0x0000_0007_0000_0000;
    pub const BF_MEM_OP_VAL: u64 = 0x6642_0008_0000_0000;
    pub const BF_MEM_OP_NOSIG_VAL: u64 = 0x0000_0008_0000_0000;
}

/// Spec-version negotiation constants, exchanged via `control_op_get_version`.
pub mod version {
    pub const BF_SPEC_ID1_VAL: u32 = 0x3123_6642;
    pub const BF_SPEC_ID1_MASK: u32 = 0x2;
    pub const BF_ALL_SPECS_SUPPORTED_VAL: u32 = 0x2;
    pub const BF_INVALID_VERSION: u32 = 0x8000_0000;
}

/// Per-call index constants, one per syscall family.
pub mod idx {
    pub const BF_CONTROL_OP_EXIT_IDX_VAL: u64 = 0x0;
    pub const BF_CONTROL_OP_WAIT_IDX_VAL: u64 = 0x1;
    pub const BF_CONTROL_OP_AGAIN_IDX_VAL: u64 = 0x2;

    pub const BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL: u64 = 0x0;
    pub const BF_HANDLE_OP_CLOSE_HANDLE_IDX_VAL: u64 = 0x1;

    pub const BF_DEBUG_OP_OUT_IDX_VAL: u64 = 0x0;
    pub const BF_DEBUG_OP_DUMP_VM_IDX_VAL: u64 = 0x1;
    pub const BF_DEBUG_OP_DUMP_VP_IDX_VAL: u64 = 0x2;
    pub const BF_DEBUG_OP_DUMP_VS_IDX_VAL: u64 = 0x3;
    pub const BF_DEBUG_OP_DUMP_VMEXIT_LOG_IDX_VAL: u64 = 0x4;
    pub const BF_DEBUG_OP_WRITE_C_IDX_VAL: u64 = 0x5;
    pub const BF_DEBUG_OP_WRITE_STR_IDX_VAL: u64 = 0x6;
    pub const BF_DEBUG_OP_DUMP_EXT_IDX_VAL: u64 = 0x7;
    pub const BF_DEBUG_OP_DUMP_PAGE_POOL_IDX_VAL: u64 = 0x8;
    pub const BF_DEBUG_OP_DUMP_HUGE_POOL_IDX_VAL: u64 = 0x9;

    pub const BF_CALLBACK_OP_REGISTER_BOOTSTRAP_IDX_VAL: u64 = 0x0;
    pub const BF_CALLBACK_OP_REGISTER_VMEXIT_IDX_VAL: u64 = 0x1;
    pub const BF_CALLBACK_OP_REGISTER_FAIL_IDX_VAL: u64 = 0x2;

    pub const BF_VM_OP_CREATE_VM_IDX_VAL: u64 = 0x0;
    pub const BF_VM_OP_DESTROY_VM_IDX_VAL: u64 = 0x1;
    pub const BF_VM_OP_MAP_DIRECT_IDX_VAL: u64 = 0x2;
    pub const BF_VM_OP_UNMAP_DIRECT_IDX_VAL: u64 = 0x3;
    pub const BF_VM_OP_UNMAP_DIRECT_BROADCAST_IDX_VAL: u64 = 0x4;
    pub const BF_VM_OP_TLB_FLUSH_IDX_VAL: u64 = 0x5;

    pub const BF_VP_OP_CREATE_VP_IDX_VAL: u64 = 0x0;
    pub const BF_VP_OP_DESTROY_VP_IDX_VAL: u64 = 0x1;

    pub const BF_VS_OP_CREATE_VS_IDX_VAL: u64 = 0x0;
    pub const BF_VS_OP_DESTROY_VS_IDX_VAL: u64 = 0x1;
    pub const BF_VS_OP_INIT_AS_ROOT_IDX_VAL: u64 = 0x2;
    pub const BF_VS_OP_READ_IDX_VAL: u64 = 0x3;
    pub const BF_VS_OP_WRITE_IDX_VAL: u64 = 0x4;
    pub const BF_VS_OP_RUN_IDX_VAL: u64 = 0x5;
    pub const BF_VS_OP_RUN_CURRENT_IDX_VAL: u64 = 0x6;
    pub const BF_VS_OP_ADVANCE_IP_AND_RUN_IDX_VAL: u64 = 0x7;
    pub const BF_VS_OP_ADVANCE_IP_AND_RUN_CURRENT_IDX_VAL: u64 = 0x8;
    pub const BF_VS_OP_PROMOTE_IDX_VAL: u64 = 0x9;
    pub const BF_VS_OP_CLEAR_IDX_VAL: u64 = 0xA;
    pub const BF_VS_OP_MIGRATE_IDX_VAL: u64 = 0xB;
    pub const BF_VS_OP_SET_ACTIVE_IDX_VAL: u64 = 0xC;
    pub const BF_VS_OP_ADVANCE_IP_AND_SET_ACTIVE_IDX_VAL: u64 = 0xD;
    pub const BF_VS_OP_TLB_FLUSH_IDX_VAL: u64 = 0xE;

    pub const BF_INTRINSIC_OP_RDMSR_IDX_VAL: u64 = 0x0;
    pub const BF_INTRINSIC_OP_WRMSR_IDX_VAL: u64 = 0x1;

    pub const BF_MEM_OP_ALLOC_PAGE_IDX_VAL: u64 = 0x0;
    pub const BF_MEM_OP_ALLOC_HUGE_IDX_VAL: u64 = 0x1;
}

/// Byte offsets into the per-PP TLS block (see the microkernel's `tls` module).
pub mod tls {
    pub const TLS_OFFSET_RAX: usize = 0x800;
    pub const TLS_OFFSET_RBX: usize = 0x808;
    pub const TLS_OFFSET_RCX: usize = 0x810;
    pub const TLS_OFFSET_RDX: usize = 0x818;
    pub const TLS_OFFSET_RBP: usize = 0x820;
    pub const TLS_OFFSET_RSI: usize = 0x828;
    pub const TLS_OFFSET_RDI: usize = 0x830;
    pub const TLS_OFFSET_R8: usize = 0x838;
    pub const TLS_OFFSET_R9: usize = 0x840;
    pub const TLS_OFFSET_R10: usize = 0x848;
    pub const TLS_OFFSET_R11: usize = 0x850;
    pub const TLS_OFFSET_R12: usize = 0x858;
    pub const TLS_OFFSET_R13: usize = 0x860;
    pub const TLS_OFFSET_R14: usize = 0x868;
    pub const TLS_OFFSET_R15: usize = 0x870;

    pub const TLS_OFFSET_ACTIVE_EXTID: usize = 0xFF0;
    pub const TLS_OFFSET_ACTIVE_VMID: usize = 0xFF2;
    pub const TLS_OFFSET_ACTIVE_VPID: usize = 0xFF4;
    pub const TLS_OFFSET_ACTIVE_VSID: usize = 0xFF6;
    pub const TLS_OFFSET_ACTIVE_PPID: usize = 0xFF8;

    pub const TLS_OFFSET_ONLINE_PPS: usize = 0xFFA;
}

/// The loader → microkernel handoff, one block per PP. Out of scope for `mk` itself (the loader
/// builds and owns this), but the layout is part of the ABI between them.
pub mod boot {
    /// A loader-supplied physical region, already identity-mapped at `virt_base` in the
    /// microkernel's RPT.
    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct MkMemRegion {
        pub virt_base: usize,
        pub phys_base: usize,
        pub len: usize,
    }

    /// One extension ELF image, already loaded into memory by the loader.
    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct MkExtImage {
        pub phys_base: usize,
        pub len: usize,
        pub entry: usize,
    }

    /// Exactly one extension per build (see `mk::ext`).
    pub const MK_MAX_EXT_IMAGES: usize = 1;

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct MkArgs {
        pub ppid: u16,
        pub online_pps: u16,
        /// Physical root of the microkernel's own RPT, already loaded in `CR3`.
        pub rpt_root: usize,
        pub page_pool: MkMemRegion,
        pub huge_pool: MkMemRegion,
        /// Physical address of one page of root-VP state captured by the loader before handoff.
        pub root_vp_state: usize,
        pub ext_images: [MkExtImage; MK_MAX_EXT_IMAGES],
        pub ext_image_count: usize,
    }
}

/// The tagged register enumeration accepted by `vs_op_read`/`vs_op_write`.
///
/// Mirrors the field groups a VS exposes regardless of which hardware backend (VMX or SVM)
/// actually holds the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum BfReg {
    Rax = 0,
    Rbx = 1,
    Rcx = 2,
    Rdx = 3,
    Rbp = 4,
    Rsi = 5,
    Rdi = 6,
    R8 = 7,
    R9 = 8,
    R10 = 9,
    R11 = 10,
    R12 = 11,
    R13 = 12,
    R14 = 13,
    R15 = 14,
    Rip = 15,
    Rsp = 16,
    Rflags = 17,

    Cr0 = 18,
    Cr2 = 19,
    Cr3 = 20,
    Cr4 = 21,
    Cr8 = 22,

    Dr6 = 23,
    Dr7 = 24,

    EsSelector = 25,
    EsBase = 26,
    EsLimit = 27,
    EsAttrib = 28,
    CsSelector = 29,
    CsBase = 30,
    CsLimit = 31,
    CsAttrib = 32,
    SsSelector = 33,
    SsBase = 34,
    SsLimit = 35,
    SsAttrib = 36,
    DsSelector = 37,
    DsBase = 38,
    DsLimit = 39,
    DsAttrib = 40,
    FsSelector = 41,
    FsBase = 42,
    FsLimit = 43,
    FsAttrib = 44,
    GsSelector = 45,
    GsBase = 46,
    GsLimit = 47,
    GsAttrib = 48,
    LdtrSelector = 49,
    LdtrBase = 50,
    LdtrLimit = 51,
    LdtrAttrib = 52,
    TrSelector = 53,
    TrBase = 54,
    TrLimit = 55,
    TrAttrib = 56,

    GdtrBase = 57,
    GdtrLimit = 58,
    IdtrBase = 59,
    IdtrLimit = 60,

    Ia32Pat = 61,
    Ia32Efer = 62,
    Ia32SysenterCs = 63,
    Ia32SysenterEsp = 64,
    Ia32SysenterEip = 65,
    Ia32FsBase = 66,
    Ia32GsBase = 67,
    Ia32Debugctl = 68,
    Ia32PerfGlobalCtrl = 69,

    VmcsPinBasedCtls = 70,
    VmcsProcBasedCtls = 71,
    VmcsProcBasedCtls2 = 72,
    VmcsExitCtls = 73,
    VmcsEntryCtls = 74,
    VmcsVmFunctionCtrls = 75,
    VmcsEptPointer = 76,
    VmcsEoiExitBitmap0 = 77,
    VmcsEoiExitBitmap1 = 78,
    VmcsEoiExitBitmap2 = 79,
    VmcsEoiExitBitmap3 = 80,
    VmcsTscOffset = 81,
    VmcsTscMultiplier = 82,
    VmcsApicAccessAddr = 83,
    VmcsVirtualApicAddr = 84,
    VmcsPostedInterruptDescAddr = 85,
    VmreadBitmapAddr = 86,
    VmwriteBitmapAddr = 87,
    XssExitingBitmap = 88,
    PmlAddress = 89,
    PageFaultErrorCodeMask = 90,
    PageFaultErrorCodeMatch = 91,
    Cr0GuestHostMask = 92,
    Cr0ReadShadow = 93,
    Cr4GuestHostMask = 94,
    Cr4ReadShadow = 95,
    Cr3TargetValue0 = 96,
    Cr3TargetValue1 = 97,
    Cr3TargetValue2 = 98,
    Cr3TargetValue3 = 99,
}

impl TryFrom<u64> for BfReg {
    type Error = ();

    fn try_from(val: u64) -> Result<Self, Self::Error> {
        if val > Self::Cr3TargetValue3 as u64 {
            return Err(());
        }
        // SAFETY: `BfReg` is `repr(u64)` and every discriminant in `0..=99` is assigned above.
        Ok(unsafe { core::mem::transmute::<u64, Self>(val) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sig_roundtrip() {
        let rax = opcode::BF_VS_OP_VAL | idx::BF_VS_OP_RUN_IDX_VAL;
        assert!(opcode::is_bareflank_syscall(rax));
        assert_eq!(opcode::syscall_opcode(rax), opcode::BF_VS_OP_VAL);
        assert_eq!(opcode::syscall_index(rax), idx::BF_VS_OP_RUN_IDX_VAL);
    }

    #[test]
    fn non_bareflank_sig_rejected() {
        assert!(!opcode::is_bareflank_syscall(0x1234_0000_0000_0000));
    }

    #[test]
    fn reg_try_from_round_trips() {
        assert_eq!(BfReg::try_from(0).unwrap(), BfReg::Rax);
        assert_eq!(BfReg::try_from(99).unwrap(), BfReg::Cr3TargetValue3);
        assert!(BfReg::try_from(100).is_err());
    }
}
