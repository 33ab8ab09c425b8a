#![no_std]
#![no_main]
#![feature(allocator_api)]

use core::arch::asm;
use core::panic::PanicInfo;

use logger::*;
use mk_abi::boot::MkArgs;
use slab::heap::KernelHeapAllocator;

#[global_allocator]
static HEAP: KernelHeapAllocator = KernelHeapAllocator::new();

/// Entry point the loader calls once per PP, per the System V ABI: `args` is that PP's own
/// handoff block, already resident in memory the loader identity-mapped for us.
///
/// SAFETY: `args` must point to a valid, initialized `MkArgs` for the calling PP, and this must
/// be the only thread of execution on that PP so far.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mk_entry(args: *const MkArgs) -> ! {
    unsafe { mk::boot::boot(&*args) }
}

#[panic_handler]
fn rust_panic(info: &PanicInfo) -> ! {
    log_err!("{}", info);
    hcf();
}

fn hcf() -> ! {
    loop {
        unsafe {
            #[cfg(target_arch = "x86_64")]
            asm!("cli", "hlt");
        }
    }
}
