//! A simple spinlock implementation

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Marker trait for types that can be wrapped in a `SpinLock`.
pub trait SpinLockable {
    /// Additional cleanup code for the spinlock, run **before** the lock is released.
    /// There is no need to release the lock here, that happens regardless.
    unsafe fn custom_unlock(&mut self) {}
}

/// A simple spinlock implementation
pub struct SpinLock<T>
where
    T: SpinLockable,
{
    lock: AtomicBool,
    data: UnsafeCell<T>,
}

/// A guard for the spinlock, which unlocks the spinlock when dropped
pub struct SpinLockGuard<'a, T>
where
    T: SpinLockable,
{
    lock: &'a SpinLock<T>,
    data: &'a mut T,
}

unsafe impl<T: Send + SpinLockable> Send for SpinLock<T> {}
unsafe impl<T: Send + SpinLockable> Sync for SpinLock<T> {}

impl<T> SpinLock<T>
where
    T: SpinLockable,
{
    /// Create a new spinlock with the given data
    pub const fn new(data: T) -> Self {
        SpinLock {
            lock: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Spin until you can lock the spinlock, then lock it
    pub fn lock(&self) -> SpinLockGuard<T> {
        loop {
            hint::spin_loop();

            if !self.lock.swap(true, Ordering::Acquire) {
                break;
            }
        }

        SpinLockGuard {
            lock: self,
            data: unsafe { self.data.get().as_mut().unwrap() },
        }
    }

    /// Release the spinlock
    unsafe fn unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }
}

impl<T> Drop for SpinLockGuard<'_, T>
where
    T: SpinLockable,
{
    fn drop(&mut self) {
        unsafe {
            self.data.custom_unlock();
            self.lock.unlock();
        };
    }
}

impl<T> Deref for SpinLockGuard<'_, T>
where
    T: SpinLockable,
{
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T>
where
    T: SpinLockable,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}
