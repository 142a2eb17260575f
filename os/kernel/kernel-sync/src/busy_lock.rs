use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// A busy-wait flag that owns the value it protects.
///
/// This is the lock behind a process inbox. It never queues and never
/// parks, so it is usable from contexts where blocking would be unsound
/// (an interrupt handler delivering a message, for example).
pub struct BusyLock<T> {
    busy: AtomicBool,
    value: UnsafeCell<T>,
}

// Safety: access to `value` is serialized by `busy`.
unsafe impl<T: Send> Sync for BusyLock<T> {}
unsafe impl<T: Send> Send for BusyLock<T> {}

impl<T: Default> Default for BusyLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> BusyLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            busy: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Claims the flag if nobody holds it.
    #[inline]
    pub fn try_lock(&self) -> Option<BusyLockGuard<'_, T>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| BusyLockGuard { lock: self })
    }

    /// Spins until the flag is ours.
    #[inline]
    pub fn lock(&self) -> BusyLockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.busy.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    #[inline]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

pub struct BusyLockGuard<'a, T> {
    lock: &'a BusyLock<T>,
}

impl<T> Deref for BusyLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for BusyLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for BusyLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.busy.store(false, Ordering::Release);
    }
}
