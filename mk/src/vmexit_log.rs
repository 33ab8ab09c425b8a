//! Per-PP ring buffer of recent VMExits, for `debug_op_dump_vmexit_log`.

use core::cell::SyncUnsafeCell;

const LOG_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, Default)]
pub struct VmexitLogEntry {
    pub vsid: u16,
    pub exit_reason: u64,
    pub exitinfo1: u64,
    pub exitinfo2: u64,
}

pub struct VmexitLog {
    entries: SyncUnsafeCell<[VmexitLogEntry; LOG_DEPTH]>,
    head: SyncUnsafeCell<usize>,
}

impl VmexitLog {
    pub const fn new() -> Self {
        Self {
            entries: SyncUnsafeCell::new([const {
                VmexitLogEntry { vsid: 0, exit_reason: 0, exitinfo1: 0, exitinfo2: 0 }
            }; LOG_DEPTH]),
            head: SyncUnsafeCell::new(0),
        }
    }

    /// SAFETY: caller must be the PP that owns this log (never shared cross-PP).
    pub unsafe fn push(&self, entry: VmexitLogEntry) {
        unsafe {
            let head = self.head.get();
            let entries = self.entries.get();
            (*entries)[*head % LOG_DEPTH] = entry;
            *head += 1;
        }
    }

    /// Logs the most recent entries, oldest first, for `debug_op_dump_vmexit_log`.
    pub unsafe fn dump(&self) {
        unsafe {
            let head = *self.head.get();
            let count = core::cmp::min(head, LOG_DEPTH);
            let entries = &*self.entries.get();
            for i in 0..count {
                let idx = (head.wrapping_sub(count).wrapping_add(i)) % LOG_DEPTH;
                let e = entries[idx];
                logger::log_info!(
                    "vmexit[{}]: vsid={} reason={:#x} info1={:#x} info2={:#x}",
                    i, e.vsid, e.exit_reason, e.exitinfo1, e.exitinfo2
                );
            }
        }
    }
}

unsafe impl Sync for VmexitLog {}

/// One log per PP; each PP only ever touches its own slot.
pub static VMEXIT_LOGS: [VmexitLog; crate::ONLINE_PPS] = [const { VmexitLog::new() }; crate::ONLINE_PPS];
