use crate::{Mutex, MutexGuard, RawLock};

/// Local interrupt masking of the CPU the kernel runs on.
///
/// The kernel never touches the interrupt flag directly; it goes through
/// this trait so the same scheduler code runs on bare metal (see
/// [`x86::X86Interrupts`]) and on a hosted machine that emulates the flag.
pub trait InterruptControl {
    /// Whether interrupts are currently delivered.
    fn are_enabled(&self) -> bool;

    /// Masks interrupts.
    fn disable(&self);

    /// Unmasks interrupts. Pending interrupts may be delivered right away.
    fn enable(&self);
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// The guard snapshots the interrupt state. If interrupts were enabled it
/// disables them; on drop it re-enables them **only** if they were enabled
/// before, so guards nest.
///
/// # Examples
///
/// ```
/// use core::sync::atomic::{AtomicBool, Ordering};
/// use kernel_sync::{InterruptControl, IrqGuard};
///
/// struct Flag(AtomicBool);
///
/// impl InterruptControl for Flag {
///     fn are_enabled(&self) -> bool { self.0.load(Ordering::SeqCst) }
///     fn disable(&self) { self.0.store(false, Ordering::SeqCst) }
///     fn enable(&self) { self.0.store(true, Ordering::SeqCst) }
/// }
///
/// let cpu = Flag(AtomicBool::new(true));
/// {
///     let _outer = IrqGuard::new(&cpu);
///     let _inner = IrqGuard::new(&cpu);
///     assert!(!cpu.are_enabled());
/// }
/// assert!(cpu.are_enabled());
/// ```
pub struct IrqGuard<'a> {
    ctl: &'a dyn InterruptControl,
    /// Whether interrupts were enabled when the guard was created.
    were_enabled: bool,
}

impl<'a> IrqGuard<'a> {
    #[inline]
    #[must_use]
    pub fn new(ctl: &'a dyn InterruptControl) -> Self {
        let were_enabled = ctl.are_enabled();
        if were_enabled {
            ctl.disable();
        }
        Self { ctl, were_enabled }
    }

    /// Whether dropping this guard will re-enable interrupts.
    #[inline]
    #[must_use]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        if self.were_enabled {
            self.ctl.enable();
        }
    }
}

/// A mutex guard that also keeps interrupts disabled while held.
///
/// Created by [`Mutex::lock_irq`]: interrupts are masked first, then the
/// lock is taken. On drop the lock is released first and interrupts are
/// restored afterwards, so an interrupt can never arrive while the lock is
/// still held by the interrupted code.
pub struct IrqMutex<'a, T, R: RawLock> {
    // Field order is drop order: unlock, then restore interrupts.
    guard: MutexGuard<'a, T, R>,
    _irq: IrqGuard<'a>,
}

impl<T, R: RawLock> core::ops::Deref for IrqMutex<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, R: RawLock> core::ops::DerefMut for IrqMutex<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T, R: RawLock> Mutex<T, R> {
    /// Acquires the mutex with interrupts disabled for the guard's lifetime.
    #[inline]
    pub fn lock_irq<'a>(&'a self, ctl: &'a dyn InterruptControl) -> IrqMutex<'a, T, R> {
        let irq = IrqGuard::new(ctl);
        let guard = self.lock();
        IrqMutex { guard, _irq: irq }
    }
}

/// Bare-metal interrupt control for `x86_64`.
#[cfg(target_arch = "x86_64")]
pub mod x86 {
    use super::InterruptControl;

    /// `IF` bit of `RFLAGS`.
    pub const RFLAGS_IF: u64 = 1 << 9;

    /// Disables hardware interrupts (`cli`).
    ///
    /// # Safety & Privilege
    ///
    /// Must only be called where `cli` is permitted (ring 0). In user mode
    /// it faults.
    #[inline]
    pub fn cli_stop_interrupts() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    /// Enables hardware interrupts (`sti`).
    ///
    /// # Safety & Privilege
    ///
    /// Must only be called where `sti` is permitted (ring 0).
    #[inline]
    pub fn sti_enable_interrupts() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }

    /// Returns the current `RFLAGS` value (via `pushfq/pop`).
    #[inline]
    #[must_use]
    pub fn rflags() -> u64 {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
        r
    }

    /// The interrupt flag of the executing CPU.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct X86Interrupts;

    impl InterruptControl for X86Interrupts {
        #[inline]
        fn are_enabled(&self) -> bool {
            rflags() & RFLAGS_IF != 0
        }

        #[inline]
        fn disable(&self) {
            cli_stop_interrupts();
        }

        #[inline]
        fn enable(&self) {
            sti_enable_interrupts();
        }
    }
}
