//! Counting semaphore with a FIFO wait queue.

use crate::process::{DeferredRelease, Pid};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use kernel_sync::{InterruptControl, IrqGuard, Spinlock};

/// What a semaphore needs from the scheduler.
///
/// Implemented by [`Kernel`](crate::Kernel); tests substitute a recorder.
pub trait Parking {
    /// `false` until the bootstrap process exists.
    fn is_active(&self) -> bool;

    fn current_pid(&self) -> Option<Pid>;

    fn interrupts(&self) -> &dyn InterruptControl;

    /// Parks the caller; `release` runs once the dispatcher has committed
    /// to switching away. Must be called with interrupts disabled.
    fn block_unlock(&self, release: DeferredRelease);

    fn unblock(&self, pid: Pid);
}

struct State {
    counter: isize,
    waiters: VecDeque<Pid>,
}

/// A counting semaphore.
///
/// `counter` may go negative; its magnitude is then the number of parked
/// waiters. Waiters are woken strictly in the order they blocked.
pub struct Semaphore {
    lock: Arc<Spinlock>,
    state: UnsafeCell<State>,
}

// Safety: `state` is only touched while `lock` is held.
unsafe impl Sync for Semaphore {}
unsafe impl Send for Semaphore {}

impl Semaphore {
    #[must_use]
    pub fn new(initial: isize) -> Self {
        Self {
            lock: Arc::new(Spinlock::new()),
            state: UnsafeCell::new(State {
                counter: initial,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Runs `f` on the state with the spinlock held. The caller keeps
    /// interrupts disabled.
    fn locked<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        self.lock.acquire();
        // Safety: exclusive while the spinlock is held.
        let r = f(unsafe { &mut *self.state.get() });
        unsafe { self.lock.release() };
        r
    }

    /// Takes one unit, parking the caller while none is available.
    pub fn down<P: Parking + ?Sized>(&self, sched: &P) {
        let irq = IrqGuard::new(sched.interrupts());
        self.lock.acquire();
        // Safety: exclusive while the spinlock is held.
        let state = unsafe { &mut *self.state.get() };
        state.counter -= 1;

        let current = sched.current_pid().filter(|_| sched.is_active());
        let Some(me) = current else {
            // Early boot: nothing to switch to, so wait for an interrupt
            // handler to bring the count back.
            unsafe { self.lock.release() };
            drop(irq);
            loop {
                let irq = IrqGuard::new(sched.interrupts());
                let available = self.locked(|s| s.counter) >= 0;
                drop(irq);
                if available {
                    return;
                }
                spin_loop();
            }
        };

        if state.counter < 0 {
            state.waiters.push_back(me);
            let lock = Arc::clone(&self.lock);
            // The dispatcher releases the lock after we are off the CPU.
            sched.block_unlock(DeferredRelease::new(move || unsafe { lock.release() }));
        } else {
            unsafe { self.lock.release() };
        }
        drop(irq);
    }

    /// Takes one unit if available without blocking.
    pub fn try_down<P: Parking + ?Sized>(&self, sched: &P) -> bool {
        let _irq = IrqGuard::new(sched.interrupts());
        self.locked(|s| {
            if s.counter > 0 {
                s.counter -= 1;
                true
            } else {
                false
            }
        })
    }

    /// Returns one unit, waking the longest waiter if there is one.
    pub fn up<P: Parking + ?Sized>(&self, sched: &P) {
        let _irq = IrqGuard::new(sched.interrupts());
        self.locked(|s| {
            s.counter += 1;
            if s.counter <= 0
                && let Some(next) = s.waiters.pop_front()
            {
                sched.unblock(next);
            }
        });
    }

    /// Current counter; negative values count waiters.
    pub fn value<P: Parking + ?Sized>(&self, sched: &P) -> isize {
        let _irq = IrqGuard::new(sched.interrupts());
        self.locked(|s| s.counter)
    }

    /// Parked processes in wake order.
    pub fn waiters<P: Parking + ?Sized>(&self, sched: &P) -> impl Iterator<Item = Pid> + use<P> {
        let _irq = IrqGuard::new(sched.interrupts());
        self.locked(|s| s.waiters.clone()).into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::{Cell, RefCell};
    use std::vec::Vec;

    /// Records parking decisions instead of switching.
    struct Recorder {
        active: bool,
        current: Cell<Pid>,
        irq_enabled: Cell<bool>,
        masked: Cell<usize>,
        parked: RefCell<Vec<Pid>>,
        woken: RefCell<Vec<Pid>>,
        pending: RefCell<Vec<DeferredRelease>>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                active: true,
                current: Cell::new(Pid::INIT),
                irq_enabled: Cell::new(true),
                masked: Cell::new(0),
                parked: RefCell::default(),
                woken: RefCell::default(),
                pending: RefCell::default(),
            }
        }

        fn run_as(&self, raw: u64) -> &Self {
            self.current.set(Pid::new(raw));
            self
        }

        /// Plays the dispatcher: consume deferred releases.
        fn dispatch(&self) {
            for release in self.pending.borrow_mut().drain(..) {
                release.run();
            }
        }
    }

    impl InterruptControl for Recorder {
        fn are_enabled(&self) -> bool {
            self.irq_enabled.get()
        }
        fn disable(&self) {
            self.masked.set(self.masked.get() + 1);
            self.irq_enabled.set(false);
        }
        fn enable(&self) {
            self.irq_enabled.set(true);
        }
    }

    impl Parking for Recorder {
        fn is_active(&self) -> bool {
            self.active
        }
        fn current_pid(&self) -> Option<Pid> {
            Some(self.current.get())
        }
        fn interrupts(&self) -> &dyn InterruptControl {
            self
        }
        fn block_unlock(&self, release: DeferredRelease) {
            assert!(!self.irq_enabled.get(), "parking with interrupts enabled");
            self.parked.borrow_mut().push(self.current.get());
            self.pending.borrow_mut().push(release);
        }
        fn unblock(&self, pid: Pid) {
            self.woken.borrow_mut().push(pid);
        }
    }

    fn pids(raw: &[u64]) -> Vec<Pid> {
        raw.iter().copied().map(Pid::new).collect()
    }

    #[test]
    fn down_within_capacity_does_not_park() {
        let s = Semaphore::new(2);
        let r = Recorder::new();
        s.down(r.run_as(1));
        s.down(r.run_as(2));
        assert_eq!(s.value(&r), 0);
        assert!(r.parked.borrow().is_empty());
        assert!(r.irq_enabled.get(), "interrupt state restored");
    }

    #[test]
    fn lock_stays_held_until_dispatch() {
        let s = Semaphore::new(0);
        let r = Recorder::new();
        s.down(r.run_as(3));

        assert_eq!(*r.parked.borrow(), pids(&[3]));
        assert!(s.lock.is_locked(), "released before the switch");
        r.dispatch();
        assert!(!s.lock.is_locked());
        assert_eq!(s.value(&r), -1);
    }

    #[test]
    fn wakeups_follow_block_order() {
        let s = Semaphore::new(1);
        let r = Recorder::new();

        s.down(r.run_as(1));
        for raw in [2, 3, 4] {
            s.down(r.run_as(raw));
            r.dispatch();
        }
        assert_eq!(s.value(&r), -3);
        assert_eq!(s.waiters(&r).collect::<Vec<_>>(), pids(&[2, 3, 4]));

        s.up(r.run_as(1));
        s.up(&r);
        assert_eq!(*r.woken.borrow(), pids(&[2, 3]));
        assert_eq!(s.value(&r), -1);
    }

    #[test]
    fn up_without_waiters_only_counts() {
        let s = Semaphore::new(0);
        let r = Recorder::new();
        s.up(&r);
        s.up(&r);
        assert_eq!(s.value(&r), 2);
        assert!(r.woken.borrow().is_empty());
    }

    #[test]
    fn try_down_never_parks() {
        let s = Semaphore::new(1);
        let r = Recorder::new();
        assert!(s.try_down(&r));
        assert!(!s.try_down(&r));
        assert_eq!(s.value(&r), 0);
        assert!(r.parked.borrow().is_empty());
    }

    #[test]
    fn snapshots_mask_interrupts() {
        let s = Semaphore::new(0);
        let r = Recorder::new();
        s.down(r.run_as(2));
        r.dispatch();

        let before = r.masked.get();
        assert_eq!(s.value(&r), -1);
        assert_eq!(s.waiters(&r).collect::<Vec<_>>(), pids(&[2]));
        assert_eq!(r.masked.get(), before + 2);
        assert!(r.irq_enabled.get());
    }

    #[test]
    fn before_boot_down_spins_until_up() {
        use std::sync::Arc as StdArc;
        use std::sync::atomic::{AtomicBool, Ordering};

        struct Boot(AtomicBool);
        impl InterruptControl for Boot {
            fn are_enabled(&self) -> bool {
                self.0.load(Ordering::SeqCst)
            }
            fn disable(&self) {
                self.0.store(false, Ordering::SeqCst);
            }
            fn enable(&self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }
        impl Parking for Boot {
            fn is_active(&self) -> bool {
                false
            }
            fn current_pid(&self) -> Option<Pid> {
                None
            }
            fn interrupts(&self) -> &dyn InterruptControl {
                self
            }
            fn block_unlock(&self, _: DeferredRelease) {
                unreachable!("no parking before boot");
            }
            fn unblock(&self, _: Pid) {}
        }

        let s = StdArc::new(Semaphore::new(0));
        let upper = {
            let s = StdArc::clone(&s);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                s.up(&Boot(AtomicBool::new(false)));
            })
        };
        s.down(&Boot(AtomicBool::new(true)));
        upper.join().unwrap();
        assert_eq!(s.value(&Boot(AtomicBool::new(true))), 0);
    }
}
