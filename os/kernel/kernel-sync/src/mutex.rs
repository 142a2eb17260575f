use crate::RawLock;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

/// A lock that owns its data, generic over the primitive underneath.
///
/// The kernel keeps its process table in a `Mutex<_, Spinlock>` and takes
/// it through [`Mutex::lock_irq`], so an interrupt handler can never spin
/// on a lock held by the code it interrupted.
pub struct Mutex<T, R> {
    raw: R,
    data: UnsafeCell<T>,
}

// Safety: `data` is only reachable through a guard, and guards are
// serialized by `raw`.
unsafe impl<T: Send, R: Sync> Sync for Mutex<T, R> {}

impl<T, R: RawLock> Mutex<T, R> {
    pub const fn with_raw(raw: R, value: T) -> Self {
        Self {
            raw,
            data: UnsafeCell::new(value),
        }
    }

    /// Blocks (spins) until the lock is ours.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, R> {
        self.raw.lock();
        // Safety: we just took the lock.
        unsafe { MutexGuard::new(self) }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, R>> {
        // Safety: only built when the attempt succeeded.
        self.raw.try_lock().then(|| unsafe { MutexGuard::new(self) })
    }

    /// Racy snapshot, for assertions.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// Exclusive access to a [`Mutex`]'s data; unlocks on drop.
pub struct MutexGuard<'a, T, R: RawLock> {
    raw: &'a R,
    data: &'a mut T,
}

impl<'a, T, R: RawLock> MutexGuard<'a, T, R> {
    /// # Safety
    /// The caller must hold `mutex.raw`.
    unsafe fn new(mutex: &'a Mutex<T, R>) -> Self {
        Self {
            raw: &mutex.raw,
            data: unsafe { &mut *mutex.data.get() },
        }
    }
}

impl<T, R: RawLock> Deref for MutexGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<T, R: RawLock> DerefMut for MutexGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<T, R: RawLock> Drop for MutexGuard<'_, T, R> {
    fn drop(&mut self) {
        // Safety: a guard only exists while the lock is held.
        unsafe { self.raw.unlock() }
    }
}
