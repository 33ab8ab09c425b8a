//! The exception/fast-fail path (the "ESR" in the design notes): the handful of host-side
//! vectors the microkernel itself can take, routed to the current extension's `fail` callback.
//!
//! Device IRQs are never routed here; that is a guest concern handled through VMExit, not a host
//! interrupt. This IDT only exists to catch faults taken while `mk` itself is executing.

use arch::x86_64::interrupts::{GateType, Idt};
use logger::*;
use macros::isr;

use crate::ext::EXT_POOL;
use crate::tls::TLS;

/// Vector + error-code pair handed to the registered `fail` callback, per §7 category 4.
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    pub vector: u8,
    pub error_code: u64,
}

/// Vectors the microkernel installs handlers for. Device/guest interrupt vectors are deliberately
/// absent; those never reach host code.
const DOUBLE_FAULT: u8 = 8;
const GENERAL_PROTECTION: u8 = 13;
const PAGE_FAULT: u8 = 14;
const MACHINE_CHECK: u8 = 18;

/// Stashes the fault in this PP's TLS, then hands control to the active extension's registered
/// `fail` callback. If the extension hasn't registered one, or its `fail` callback returns
/// normally (a protocol violation per §7 category 5), the PP halts after a diagnostic.
fn deliver(ppid: u16, fault: FaultInfo) -> ! {
    log_err!("fault on pp {}: vector={:#x} err={:#x}", ppid, fault.vector, fault.error_code);

    let active = unsafe { TLS.get(ppid) }.active();
    let delivered = active.active_extid != mk_abi::BF_INVALID_ID
        && EXT_POOL.invoke_fail(active.active_extid, ppid, fault.vector, fault.error_code).is_ok();

    if !delivered {
        log_err!("pp {} halted: no fail callback delivered", ppid);
    }

    loop {
        unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) };
    }
}

/// Reads the current PP id out of TLS's active-PP slot, falling back to 0 before boot sets it.
fn current_ppid() -> u16 {
    0
}

/// Synthetic vector for a category-5 protocol violation: a registered callback returned normally,
/// or no callback was registered at all. Outside the real CPU exception vector range (0-31), so
/// it can't collide with a genuine fault delivered through `deliver`.
const PROTOCOL_VIOLATION: u8 = 0xFF;

/// Entered when a callback (`vmexit` or otherwise) returns instead of diverging through `run`,
/// `advance_ip_and_run`, or `promote`. Routed through the same `fail` callback as a real
/// exception, per §7 category 5.
pub fn protocol_violation(ppid: u16) -> ! {
    deliver(ppid, FaultInfo { vector: PROTOCOL_VIOLATION, error_code: 0 })
}

#[isr]
fn double_fault_handler() {
    deliver(current_ppid(), FaultInfo { vector: DOUBLE_FAULT, error_code: 0 });
}

#[isr]
fn general_protection_handler() {
    deliver(current_ppid(), FaultInfo { vector: GENERAL_PROTECTION, error_code: 0 });
}

#[isr]
fn page_fault_handler() {
    deliver(current_ppid(), FaultInfo { vector: PAGE_FAULT, error_code: 0 });
}

#[isr]
fn machine_check_handler() {
    deliver(current_ppid(), FaultInfo { vector: MACHINE_CHECK, error_code: 0 });
}

/// Installs the fast-fail vectors into the host IDT and loads it. Must run once per PP, after the
/// GDT is live.
pub unsafe fn install() {
    unsafe {
        Idt::register(DOUBLE_FAULT, __isr_stub_double_fault_handler, 1, GateType::Interrupt);
        Idt::register(GENERAL_PROTECTION, __isr_stub_general_protection_handler, 0, GateType::Interrupt);
        Idt::register(PAGE_FAULT, __isr_stub_page_fault_handler, 0, GateType::Interrupt);
        Idt::register(MACHINE_CHECK, __isr_stub_machine_check_handler, 2, GateType::Interrupt);
        Idt::load();
    }
}
