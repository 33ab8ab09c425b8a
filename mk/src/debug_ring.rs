//! Single-producer (microkernel), single-consumer (loader) debug ring.
//!
//! The loader polls `spos`/`epos` and drains bytes between them; `mk` never blocks on the
//! consumer, so a full ring just wraps and overwrites the oldest unread byte.

use core::cell::SyncUnsafeCell;

const RING_SIZE: usize = 4096;

#[repr(C)]
pub struct DebugRing {
    buf: SyncUnsafeCell<[u8; RING_SIZE]>,
    /// Producer position (written only by `mk`).
    epos: core::sync::atomic::AtomicU64,
    /// Consumer position (written only by the loader; `mk` only reads it).
    spos: core::sync::atomic::AtomicU64,
}

impl DebugRing {
    pub const fn new() -> Self {
        Self {
            buf: SyncUnsafeCell::new([0; RING_SIZE]),
            epos: core::sync::atomic::AtomicU64::new(0),
            spos: core::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Pushes one byte, overwriting the oldest byte if the consumer has fallen behind by a full
    /// ring's worth.
    pub fn write_c(&self, c: u8) {
        use core::sync::atomic::Ordering;

        let pos = self.epos.load(Ordering::Relaxed);
        unsafe {
            (*self.buf.get())[pos as usize % RING_SIZE] = c;
        }
        self.epos.store(pos + 1, Ordering::Release);
    }

    /// Pushes a byte slice one byte at a time (mirrors `write_c` semantics for a whole string).
    pub fn write_str(&self, s: &[u8]) {
        for &c in s {
            self.write_c(c);
        }
    }

    pub fn epos(&self) -> u64 {
        self.epos.load(core::sync::atomic::Ordering::Relaxed)
    }

    pub fn spos(&self) -> u64 {
        self.spos.load(core::sync::atomic::Ordering::Relaxed)
    }
}

unsafe impl Sync for DebugRing {}

pub static DEBUG_RING: DebugRing = DebugRing::new();
