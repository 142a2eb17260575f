//! Round-robin dispatcher and the blocking protocol.
//!
//! A process parks by marking itself [`Blocked`](RunState::Blocked) and
//! yielding; it is not put back on the ready queue until somebody calls
//! [`Kernel::unblock`]. A parking process that still holds a lock hands a
//! [`DeferredRelease`] to [`Kernel::block_unlock`]; the dispatcher runs it
//! after deciding to switch away and before the switch itself, with
//! interrupts disabled, so a waker can never find the lock free while the
//! parker is still on the CPU.

use crate::kernel::Kernel;
use crate::machine::Machine;
use crate::process::{DeferredRelease, Pid, RunState};
use crate::semaphore::Parking;
use kernel_sync::{InterruptControl, IrqGuard};
use log::{trace, warn};

impl<M: Machine> Kernel<M> {
    /// Picks the next process to run. Called on every timer tick and by
    /// [`yield_now`](Self::yield_now).
    pub fn schedule(&self) {
        if !self.is_enabled() {
            return;
        }

        let _irq = IrqGuard::new(&self.machine);
        let mut guard = self.tables.lock();
        let tables = &mut *guard;
        let Some(current) = tables.current else {
            return;
        };

        let mut release = None;
        if let Some(process) = tables.processes.get_mut(&current) {
            let requeue = match &mut process.state {
                RunState::Blocked { release: pending } => {
                    release = pending.take();
                    false
                }
                RunState::Running => true,
                RunState::FreshlyForked | RunState::Ready | RunState::Terminated => false,
            };
            if requeue {
                // Round-robin re-entry.
                process.state = RunState::Ready;
                tables.ready.push(current);
            }
        }

        let next = loop {
            match tables.ready.pop() {
                Some(pid) if tables.processes.contains_key(&pid) => break Some(pid),
                Some(pid) => warn!("Dropping unknown pid {pid} from the ready queue"),
                None => break None,
            }
        };

        let Some(next) = next else {
            // Nobody to switch to: the blocked caller idles and retries.
            drop(guard);
            if let Some(release) = release {
                release.run();
            }
            return;
        };

        if next == current {
            if let Some(process) = tables.processes.get_mut(&current) {
                process.state = RunState::Running;
            }
            return;
        }

        let Some((from, retiring)) = tables
            .processes
            .get(&current)
            .map(|p| (p.context.get(), p.is_terminated()))
        else {
            return;
        };
        let Some(incoming) = tables.processes.get_mut(&next) else {
            return;
        };
        let fresh = matches!(incoming.state, RunState::FreshlyForked);
        incoming.state = RunState::Running;
        if let Some(space) = &incoming.address_space {
            self.machine.activate_address_space(space);
        }
        let to = incoming.context.get().cast_const();
        tables.current = Some(next);
        drop(guard);

        trace!("Switching {current} -> {next}{}", if fresh { " (fork)" } else { "" });
        if let Some(release) = release {
            release.run();
        }

        // Safety: both records are boxed in the process table and outlive
        // the switch; the outgoing one is only reaped after it terminated,
        // and a terminated process is never resumed.
        unsafe {
            if retiring {
                self.machine.retire_context(from, to, fresh);
            } else if fresh {
                self.machine.enter_forked(from, to);
            } else {
                self.machine.switch_context(from, to);
            }
        }
    }

    /// Gives up the CPU to the next ready process, if any.
    pub fn yield_now(&self) {
        if self.is_enabled() {
            self.schedule();
        }
    }

    /// Parks the running process until [`unblock`](Self::unblock).
    pub fn block(&self) {
        self.park(None);
    }

    /// Parks the running process and releases a lock it holds once the
    /// dispatcher has committed to switching away.
    pub fn block_unlock(&self, release: DeferredRelease) {
        let _irq = IrqGuard::new(&self.machine);
        self.park(Some(release));
    }

    fn park(&self, release: Option<DeferredRelease>) {
        let parked = if self.is_enabled() {
            self.lock_tables().park_current(release)
        } else {
            Err(release)
        };
        match parked {
            Ok(me) => self.wait_while_blocked(me),
            Err(release) => {
                if let Some(release) = release {
                    release.run();
                }
            }
        }
    }

    /// Yields until `me` has been unblocked. With nothing else to run the
    /// CPU idles with interrupts enabled so a handler can do the unblock.
    pub(crate) fn wait_while_blocked(&self, me: Pid) {
        self.yield_now();
        while self.is_blocked(me) {
            let was_enabled = self.machine.are_enabled();
            self.machine.enable();
            self.machine.wait_for_interrupt();
            self.yield_now();
            if !was_enabled {
                self.machine.disable();
            }
        }
    }

    pub(crate) fn is_blocked(&self, pid: Pid) -> bool {
        self.lock_tables()
            .processes
            .get(&pid)
            .is_some_and(|p| p.is_blocked())
    }

    /// Makes a blocked process runnable again. No-op for processes that
    /// are not blocked or do not exist.
    pub fn unblock(&self, pid: Pid) {
        let release = self.lock_tables().wake(pid);
        if let Some(release) = release {
            release.run();
        }
    }
}

impl<M: Machine> Parking for Kernel<M> {
    fn is_active(&self) -> bool {
        self.is_enabled()
    }

    fn current_pid(&self) -> Option<Pid> {
        Self::current_pid(self)
    }

    fn interrupts(&self) -> &dyn InterruptControl {
        self.interrupt_control()
    }

    fn block_unlock(&self, release: DeferredRelease) {
        Self::block_unlock(self, release);
    }

    fn unblock(&self, pid: Pid) {
        Self::unblock(self, pid);
    }
}

#[cfg(test)]
mod tests {
    use crate::ProcessState;
    use crate::testing::{booted, child_of_init};

    #[test]
    fn schedule_without_competition_keeps_current() {
        let kernel = booted();
        kernel.schedule();
        kernel.yield_now();
        assert_eq!(kernel.current_pid(), Some(crate::Pid::INIT));
        assert_eq!(kernel.state_of(crate::Pid::INIT), Some(ProcessState::Running));
        assert!(kernel.ready_pids().is_empty());
    }

    #[test]
    fn unblock_of_ready_process_is_a_no_op() {
        let kernel = booted();
        let child = child_of_init(&kernel);
        kernel.unblock(child);
        assert_eq!(kernel.ready_pids(), [child]);
    }

    #[test]
    fn blocked_current_is_woken_in_place() {
        let kernel = booted();
        let me = kernel.lock_tables().park_current(None).unwrap();
        assert_eq!(kernel.blocked_pids(), [me]);

        kernel.unblock(me);
        assert_eq!(kernel.state_of(me), Some(ProcessState::Running));
        assert!(kernel.blocked_pids().is_empty());
        assert!(kernel.ready_pids().is_empty(), "current is never queued");
    }

    #[test]
    fn wake_hands_back_an_unconsumed_release() {
        use core::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let kernel = booted();
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let me = kernel
            .lock_tables()
            .park_current(Some(crate::DeferredRelease::new(move || {
                flag.store(true, Ordering::SeqCst);
            })))
            .unwrap();

        kernel.unblock(me);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn blocked_process_is_not_requeued() {
        let kernel = booted();
        let child = child_of_init(&kernel);
        {
            let mut tables = kernel.lock_tables();
            tables.ready.remove(child);
            let p = tables.processes.get_mut(&child).unwrap();
            p.state = crate::process::RunState::Blocked { release: None };
            tables.blocked.insert(child);
        }
        kernel.schedule();
        assert_eq!(kernel.current_pid(), Some(crate::Pid::INIT));
        assert_eq!(kernel.state_of(child), Some(ProcessState::Blocked));

        kernel.unblock(child);
        assert_eq!(kernel.ready_pids(), [child]);
        assert_eq!(kernel.state_of(child), Some(ProcessState::Ready));
    }
}
