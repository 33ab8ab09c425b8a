//! Takes the loader handoff and brings one PP from "just arrived" to "extension running".
//!
//! Called once per PP, with that PP's own [`MkArgs`](mk_abi::boot::MkArgs). The pools, RPT
//! allocators, and extension table are process-wide singletons; only the first PP to arrive
//! (`BF_BS_PPID`) initializes them, everyone else just wires their own TLS and IDT and jumps into
//! the extension.

use arch::BASIC_PAGE_SIZE;
use arch::x86_64::paging::set_frame_source;
use mk_abi::BF_BS_PPID;
use mk_abi::boot::MkArgs;
use slab::set_page_source;
use utils::mem::{PhysAddr, VirtAddr};

/// Fixed virtual base each PP's copy of the loader-captured root-VP state is mapped to, one page
/// per PP starting here. Lives well above any identity-mapped region the loader could plausibly
/// hand us, so it never collides with the page/huge pool windows.
const ROOT_VP_STATE_SCRATCH_BASE: usize = 0xFFFF_FF00_0000_0000;

use crate::ext::EXT_POOL;
use crate::pool::huge_pool;
use crate::pool::PAGE_POOL;
use crate::tls::TLS;
use crate::vm::VM_POOL;
use crate::vp::VP_POOL;
use crate::vs::VS_POOL;
use crate::{fail, root_page_table};

/// Exactly one extension per build; see `mk::ext`.
const EXTID: u16 = 0;

/// `_start`'s signature: no arguments, may return (a return with no callbacks registered is a
/// category-5 protocol violation, same as `vmexit`/`bootstrap` returning).
type ExtStartFn = unsafe extern "C" fn();

/// Brings up the pools and RPT machinery shared by every PP. Must run exactly once, on
/// `BF_BS_PPID`, before any other PP calls [`boot`].
fn init_shared_state(args: &MkArgs) {
    unsafe {
        PAGE_POOL.init(
            VirtAddr(args.page_pool.virt_base),
            PhysAddr(args.page_pool.phys_base),
            args.page_pool.len,
        );
        huge_pool::init(
            VirtAddr(args.huge_pool.virt_base),
            PhysAddr(args.huge_pool.phys_base),
            args.huge_pool.len,
        );
    }

    set_frame_source(&PAGE_POOL);
    set_page_source(&PAGE_POOL);

    VM_POOL.init();
    VP_POOL.init();
    VS_POOL.init();
    EXT_POOL.init();
}

/// Per-PP bring-up: installs the fast-fail IDT, marks this PP's TLS active-PP slot, maps the
/// loader-captured root-VP state into scratch, then jumps into the extension.
///
/// Never returns: either the extension's VM-exit/bootstrap/fail callback loop takes over
/// permanently, `_start` calls `control_op_exit` and halts, or a protocol violation routes
/// through [`fail::protocol_violation`], which also never returns.
pub unsafe fn boot(args: &MkArgs) -> ! {
    if args.ppid == BF_BS_PPID {
        init_shared_state(args);
    }

    unsafe { fail::install() };

    let rpt = unsafe { root_page_table::RootPageTable::current() };
    let scratch = VirtAddr(ROOT_VP_STATE_SCRATCH_BASE + args.ppid as usize * BASIC_PAGE_SIZE);
    let _ = rpt.add_root_vp_state(PhysAddr(args.root_vp_state), scratch);

    let tls = unsafe { TLS.get_mut(args.ppid) };
    let mut active = tls.active();
    active.active_ppid = args.ppid;
    active.online_pps = args.online_pps;
    tls.set_active(active);

    let Some(image) = args.ext_images.first().filter(|_| args.ext_image_count > 0) else {
        logger::log_err!("pp {}: no extension image supplied", args.ppid);
        fail::protocol_violation(args.ppid);
    };

    // SAFETY: the loader has placed and relocated the extension's ELF image; `entry` is its
    // `_start` address in the address space already active on this PP.
    let start: ExtStartFn = unsafe { core::mem::transmute(image.entry) };
    unsafe { start() };

    // `_start` returned; the extension either registered its callbacks and is relying on us to
    // invoke `bootstrap` now, or it never registered anything. Either way this call's own return
    // (`Ok` or `Err`) is the thing that must not happen, per §7 category 5.
    let _ = EXT_POOL.invoke_bootstrap(EXTID, args.ppid);
    fail::protocol_violation(args.ppid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ext_start_fn_has_expected_abi() {
        let _f: ExtStartFn = unsafe { core::mem::transmute(0usize) };
    }
}
