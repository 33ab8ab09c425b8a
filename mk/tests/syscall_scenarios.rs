//! Exercises the syscall dispatch surface through its one public entry point, the same way an
//! extension would drive it.
//!
//! Deliberately stays away from `vs_op_run`/`read`/`write`/`init_as_root`: those reach into real
//! VMX/SVM instructions, not something safe to fire from a hosted test process. Object-pool
//! lifecycle and the syscall ABI's bookkeeping (handles, opcodes, status codes) are what's under
//! test here; `mk`'s own unit tests cover the VS state machine in isolation.
//!
//! All of these share the crate's global pool statics, so they run as one scenario rather than
//! independent tests to avoid cross-test interference.

use mk::dispatch::{SyscallRegs, dispatch_syscall};
use mk::ext::EXT_POOL;
use mk::vm::VM_POOL;
use mk::vp::VP_POOL;
use mk_abi::{BF_ROOT_VMID, idx, opcode, status, version};

fn syscall(rax: u64, rbx: u64, rcx: u64, rdx: u64, rsi: u64, rdi: u64) -> SyscallRegs {
    let mut regs = SyscallRegs { rax, rbx, rcx, rdx, rsi, rdi };
    dispatch_syscall(0, &mut regs);
    regs
}

#[test]
fn boot_and_root_launch_scenario() {
    EXT_POOL.init();
    VM_POOL.init();
    VP_POOL.init();

    // Scenario 1: open_handle, register the three callbacks.
    let open = syscall(
        opcode::BF_HANDLE_OP_VAL | idx::BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL,
        u64::from(version::BF_SPEC_ID1_MASK),
        0,
        0,
        0,
        0,
    );
    assert_eq!(open.rax, status::BF_STATUS_SUCCESS);
    let handle = open.rbx;

    for cb_idx in [
        idx::BF_CALLBACK_OP_REGISTER_BOOTSTRAP_IDX_VAL,
        idx::BF_CALLBACK_OP_REGISTER_VMEXIT_IDX_VAL,
        idx::BF_CALLBACK_OP_REGISTER_FAIL_IDX_VAL,
    ] {
        let r = syscall(opcode::BF_CALLBACK_OP_VAL | cb_idx, handle, 0x1000, 0, 0, 0);
        assert_eq!(r.rax, status::BF_STATUS_SUCCESS);
    }

    // A bogus opening version is rejected before anything else runs.
    let bad_version = syscall(opcode::BF_HANDLE_OP_VAL | idx::BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL, 0xFF, 0, 0, 0, 0);
    assert_ne!(bad_version.rax, status::BF_STATUS_SUCCESS);

    // Scenario 2, minus the VS leg: root launch's object graph.
    let create_vm = syscall(opcode::BF_VM_OP_VAL | idx::BF_VM_OP_CREATE_VM_IDX_VAL, handle, 0, 0, 0, 0);
    assert_eq!(create_vm.rax, status::BF_STATUS_SUCCESS);
    assert_eq!(create_vm.rcx, u64::from(BF_ROOT_VMID));

    let create_vp = syscall(opcode::BF_VP_OP_VAL | idx::BF_VP_OP_CREATE_VP_IDX_VAL, handle, create_vm.rcx, 0, 0, 0);
    assert_eq!(create_vp.rax, status::BF_STATUS_SUCCESS);
    let vpid = create_vp.rcx;

    // Scenario 4: a wrong handle is rejected on every call but open_handle.
    let wrong_handle = syscall(opcode::BF_VP_OP_VAL | idx::BF_VP_OP_DESTROY_VP_IDX_VAL, handle ^ 1, vpid, 0, 0, 0);
    assert_eq!(wrong_handle.rax, status::BF_STATUS_INVALID_HANDLE);

    let destroy_vp = syscall(opcode::BF_VP_OP_VAL | idx::BF_VP_OP_DESTROY_VP_IDX_VAL, handle, vpid, 0, 0, 0);
    assert_eq!(destroy_vp.rax, status::BF_STATUS_SUCCESS);

    let destroy_vm = syscall(opcode::BF_VM_OP_VAL | idx::BF_VM_OP_DESTROY_VM_IDX_VAL, handle, create_vm.rcx, 0, 0, 0);
    assert_eq!(destroy_vm.rax, status::BF_STATUS_SUCCESS);

    let close = syscall(opcode::BF_HANDLE_OP_VAL | idx::BF_HANDLE_OP_CLOSE_HANDLE_IDX_VAL, handle, 0, 0, 0, 0);
    assert_eq!(close.rax, status::BF_STATUS_SUCCESS);

    // Scenario 4 again: after close_handle, even open_handle's own family rejects the stale handle.
    let after_close = syscall(opcode::BF_VM_OP_VAL | idx::BF_VM_OP_CREATE_VM_IDX_VAL, handle, 0, 0, 0, 0);
    assert_eq!(after_close.rax, status::BF_STATUS_INVALID_HANDLE);
}

#[test]
fn non_bareflank_signature_is_always_rejected() {
    let bogus = syscall(0x1234_0000_0000_0000, 0, 0, 0, 0, 0);
    assert_eq!(bogus.rax, status::BF_STATUS_FAILURE_UNKNOWN);
}
