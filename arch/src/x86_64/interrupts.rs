//! The host IDT: exception and fast-fail vector routing.
//!
//! `mk` never routes device IRQs (PIT/RTC/etc) through here, that is a guest concern. This IDT
//! only exists to catch host-side exceptions (the ESR / fast-fail path) and NMIs.

use core::{
    arch::asm,
    mem::{size_of, transmute},
    ptr::from_ref,
};

use logger::*;
use modular_bitfield::prelude::*;
use utils::sync::spinlock::{SpinLock, SpinLockable};

use super::cpu::{cli, sti};

/// The number of entries in the IDT
const IDT_ENTRIES_NUM: usize = 256;

static IDT: SpinLock<Idt> = SpinLock::new(Idt([GateDescriptor::DEFAULT; IDT_ENTRIES_NUM]));

/// The IDT
pub struct Idt([GateDescriptor; IDT_ENTRIES_NUM]);

impl SpinLockable for Idt {}

#[bitfield]
#[derive(Debug, Clone, Copy)]
#[repr(u128)]
/// Gate descriptor for the IDT
struct GateDescriptor {
    offset_0: B16,
    segment_selector: B16,
    ist: B3,
    _reserved_0: B5,
    gate_type: B4,
    zero: B1,
    dpl: B2,
    present: B1,
    offset_1: B16,
    offset_2: B32,
    _reserved_1: B32,
}

#[allow(dead_code)]
pub enum GateType {
    Interrupt = 0b1110,
    Trap = 0b1111,
}

#[allow(dead_code)]
pub enum Dpl {
    Kernel = 0b00,
    User = 0b11,
}

impl GateDescriptor {
    const DEFAULT: Self = unsafe { transmute(0_u128) };

    fn register(&mut self, offset: u64, segment_selector: u16, ist: u8, gate_type: GateType, dpl: Dpl) {
        self.set_offset_0(offset as u16);
        self.set_segment_selector(segment_selector);
        self.set_ist(ist);
        self.set_gate_type(gate_type as u8);
        self.set_dpl(dpl as u8);
        self.set_present(1);
        self.set_offset_1((offset >> 16) as u16);
        self.set_offset_2((offset >> 32) as u32);
    }
}

impl Idt {
    /// Registers a handler stub at `vector`, generated by the `#[isr]` proc macro.
    ///
    /// NOTE: Must make sure there is a valid working GDT already loaded.
    pub unsafe fn register(vector: u8, handler: unsafe extern "C" fn(), ist: u8, gate_type: GateType) {
        let cs: u16;
        unsafe {
            asm!("mov {:x}, cs", out(reg) cs);
        }

        let mut idt = IDT.lock();
        idt.0[vector as usize].register(handler as u64, cs, ist, gate_type, Dpl::Kernel);
    }

    /// Loads the IDT into the current PP.
    ///
    /// NOTE: Must be called once per PP, after all vectors of interest are registered.
    pub unsafe fn load() {
        let idt = IDT.lock();
        let idtr = super::DescriptorTablePtr {
            base: from_ref(&*idt).addr() as u64,
            limit: (size_of::<[GateDescriptor; IDT_ENTRIES_NUM]>() - 1) as u16,
        };

        unsafe {
            asm!(
                "lidt [{}]",
                in(reg) &idtr,
            );
        }

        log_info!("Loaded IDT successfully");
    }
}

/// Check if the `CLI` flag is set
pub fn check_interrupts_disabled() -> bool {
    let flags: u64;
    unsafe {
        asm!(
            "pushfq",
            "pop {flags}",
            flags = out(reg) flags,
        );
    }
    (flags & 0x200) == 0
}

pub fn do_inside_interrupts_disabled_window<T, F>(f: F) -> T
where
    F: FnOnce() -> T,
{
    let old = check_interrupts_disabled();
    cli();
    let ret = f();

    if !old {
        sti();
    }

    ret
}
