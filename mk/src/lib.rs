//! The microkernel core: VM/VP/VS pool objects, the root and extension page tables, the
//! page/huge page allocators, the VMExit dispatch loop, and the syscall ABI surface extensions
//! talk to.

#![cfg_attr(not(test), no_std)]
#![feature(sync_unsafe_cell)]

extern crate alloc;

pub mod debug_ring;
pub mod dispatch;
pub mod error;
pub mod ext;
pub mod fail;
pub mod intrinsic;
pub mod pool;
pub mod root_page_table;
pub mod tls;
pub mod vm;
pub mod vmexit_log;
pub mod vp;
pub mod vs;

pub mod boot;

#[cfg(feature = "max_vms_64")]
pub const MAX_VMS: usize = 64;

#[cfg(feature = "max_vps_64")]
pub const MAX_VPS: usize = 64;

#[cfg(feature = "max_vss_64")]
pub const MAX_VSS: usize = 64;

#[cfg(feature = "max_exts_1")]
pub const MAX_EXTS: usize = 1;

#[cfg(feature = "online_pps_1")]
pub const ONLINE_PPS: usize = 1;

pub use error::{MkError, MkResult};
