//! fork / exit / waitpid and the descriptor operations they depend on.

use crate::error::{FdError, ForkError, ForkResource, WaitError};
use crate::fd::Fd;
use crate::ipc::Inbox;
use crate::kernel::Kernel;
use crate::machine::Machine;
use crate::process::{KernelStack, Pid, Process, Reclaimed, RunState};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use log::{debug, error, info};

impl<M: Machine> Kernel<M> {
    /// Duplicates the running process.
    ///
    /// The child gets an eager copy of the address space, a fresh zeroed
    /// kernel stack, shared references to every open file and the cwd, an
    /// empty inbox, and the next PID. It is queued as freshly forked: its
    /// first dispatch resumes it as if `fork` had returned zero.
    ///
    /// # Errors
    /// [`ForkError::OutOfMemory`] names the allocation that failed; every
    /// earlier allocation has been undone and no PID was consumed.
    pub fn fork(&self) -> Result<Pid, ForkError> {
        let mut stack = KernelStack::allocate(self.config.kernel_stack_size)
            .map_err(|_| ForkError::OutOfMemory(ForkResource::KernelStack))?;

        let (parent_pid, parent) = {
            let tables = self.lock_tables();
            let pid = tables.current.ok_or(ForkError::NotRunning)?;
            let record = tables
                .processes
                .get(&pid)
                .map(|p| &raw const **p)
                .ok_or(ForkError::NotRunning)?;
            (pid, record)
        };

        // The copies below run with the table unlocked and interrupts on.
        // Safety: records are boxed and a running process cannot be reaped.
        // Its address space, descriptors and cwd only ever change on its
        // own behalf, and it is busy forking.
        let (parent_space, parent_files, parent_cwd) = unsafe {
            (
                &(*parent).address_space,
                &(*parent).files,
                &(*parent).cwd,
            )
        };
        let parent_space = parent_space.as_ref().ok_or(ForkError::NotRunning)?;

        let space = self
            .machine
            .copy_address_space(parent_space)
            .map_err(|_| ForkError::OutOfMemory(ForkResource::AddressSpace))?;

        let files = match parent_files.duplicate(|f| self.machine.dup_file(f)) {
            Ok(files) => files,
            Err(_) => {
                self.machine.release_address_space(space);
                return Err(ForkError::OutOfMemory(ForkResource::FileTable));
            }
        };
        let cwd = parent_cwd.as_ref().map(|f| self.machine.dup_file(f));

        let pid = self.allocate_pid();
        let context = self.machine.fork_context(pid, &mut stack);

        let mut tables = self.lock_tables();
        tables.processes.insert(
            pid,
            Box::new(Process {
                pid,
                parent: Some(parent_pid),
                address_space: Some(space),
                files,
                cwd,
                kernel_stack: stack,
                context: UnsafeCell::new(context),
                state: RunState::FreshlyForked,
                status: 0,
                blocked_for_child: None,
                inbox: Arc::new(Inbox::new()),
            }),
        );
        tables.ready.push(pid);
        drop(tables);

        debug!("fork: {parent_pid} -> {pid}");
        Ok(pid)
    }

    /// Terminates the running process with `status`. Never returns.
    ///
    /// Resources go back to their collaborators before the process is
    /// marked terminated, so a preemption in between cannot strand them.
    /// The record itself stays as a zombie until the parent reaps it.
    /// Exit of init reboots the machine.
    pub fn exit(&self, status: i32) -> ! {
        let me = match self.current_pid() {
            Some(pid) if pid != Pid::INIT => pid,
            _ => {
                error!("init exited with status {status}, rebooting");
                self.machine.reboot();
            }
        };

        let reclaimed = self
            .lock_tables()
            .current_mut()
            .map(|p| (p.reclaim(), Arc::clone(&p.inbox)));
        if let Some((resources, inbox)) = reclaimed {
            self.release(resources);
            let dropped = inbox.drain();
            if dropped > 0 {
                debug!("pid {me} exited with {dropped} unread message(s)");
            }
        }
        self.irq_release_owner(me);

        // From here on nothing may preempt us before we are off the CPU.
        self.machine.disable();
        let mut guard = self.tables.lock();
        let tables = &mut *guard;
        let mut parent_release = None;
        if let Some(process) = tables.processes.get_mut(&me) {
            process.status = status;
            process.state = RunState::Terminated;
            if let Some(parent) = process.parent
                && let Some(waiter) = tables.processes.get_mut(&parent)
                && waiter.blocked_for_child == Some(me)
            {
                waiter.blocked_for_child = None;
                parent_release = tables.wake(parent);
            }
        }
        drop(guard);
        if let Some(release) = parent_release {
            release.run();
        }
        info!("pid {me} exited with status {status}");

        loop {
            self.yield_now();
            // Nothing else is ready; idle so interrupts keep flowing.
            self.machine.enable();
            self.machine.wait_for_interrupt();
            self.machine.disable();
        }
    }

    fn release(&self, resources: Reclaimed<M>) {
        if let Some(space) = resources.address_space {
            self.machine.release_address_space(space);
        }
        for file in resources.files {
            self.machine.close_file(file);
        }
        if let Some(cwd) = resources.cwd {
            self.machine.close_file(cwd);
        }
    }

    /// Waits for the child `pid` to terminate, reaps it, and returns its
    /// PID and exit status.
    ///
    /// # Errors
    /// [`WaitError::NotFound`] if `pid` does not exist, was already reaped,
    /// or is not a child of the caller.
    pub fn waitpid(&self, pid: Pid) -> Result<(Pid, i32), WaitError> {
        loop {
            let parked = {
                let mut guard = self.lock_tables();
                let tables = &mut *guard;
                let me = tables.current.ok_or(WaitError::NotFound)?;
                let terminated = tables
                    .processes
                    .get(&pid)
                    .filter(|child| child.parent == Some(me))
                    .map(|child| child.is_terminated())
                    .ok_or(WaitError::NotFound)?;

                if terminated {
                    let child = tables.processes.remove(&pid);
                    if let Some(process) = tables.current_mut() {
                        process.blocked_for_child = None;
                    }
                    drop(guard);
                    let (status, stack) =
                        child.map_or((0, 0), |c| (c.status, c.kernel_stack.len()));
                    debug!("Reaped pid {pid} (status {status}), freed {stack} byte stack");
                    return Ok((pid, status));
                }

                if let Some(process) = tables.current_mut() {
                    process.blocked_for_child = Some(pid);
                }
                tables.park_current(None)
            };
            match parked {
                Ok(me) => self.wait_while_blocked(me),
                Err(_) => return Err(WaitError::NotFound),
            }
        }
    }

    /// Placeholder for "wait for any child". Not supported: only specific
    /// PIDs can be waited for.
    ///
    /// # Errors
    /// Always [`WaitError::NotFound`].
    pub const fn wait_any(&self) -> Result<(Pid, i32), WaitError> {
        Err(WaitError::NotFound)
    }

    /// Puts `file` into the lowest free descriptor slot of the running
    /// process. On failure the handle is closed.
    ///
    /// # Errors
    /// [`FdError::TableFull`] once `max_fds` descriptors are open.
    pub fn install_fd(&self, file: M::File) -> Result<Fd, FdError> {
        let mut tables = self.lock_tables();
        let Some(process) = tables.current_mut() else {
            drop(tables);
            self.machine.close_file(file);
            return Err(FdError::NotRunning);
        };
        match process.files.free_slot() {
            Ok(fd) => {
                process.files.place(fd, file);
                Ok(fd)
            }
            Err(e) => {
                drop(tables);
                self.machine.close_file(file);
                Err(e)
            }
        }
    }

    /// Closes a descriptor of the running process.
    ///
    /// # Errors
    /// [`FdError::BadDescriptor`] if `fd` is not open.
    pub fn close_fd(&self, fd: Fd) -> Result<(), FdError> {
        let file = self
            .lock_tables()
            .current_mut()
            .ok_or(FdError::NotRunning)
            .and_then(|p| p.files.take(fd))?;
        self.machine.close_file(file);
        Ok(())
    }

    pub fn has_fd(&self, fd: Fd) -> bool {
        self.lock_tables()
            .current_mut()
            .is_some_and(|p| p.files.get(fd).is_some())
    }

    pub fn open_fds(&self) -> usize {
        self.lock_tables()
            .current_mut()
            .map_or(0, |p| p.files.open_count())
    }

    /// Replaces the working directory of the running process.
    pub fn set_cwd(&self, dir: M::File) {
        let old = match self.lock_tables().current_mut() {
            Some(p) => p.cwd.replace(dir),
            None => Some(dir),
        };
        if let Some(old) = old {
            self.machine.close_file(old);
        }
    }

    /// Runs `f` against the running process' descriptor, if open.
    pub fn with_fd<R>(&self, fd: Fd, f: impl FnOnce(&M::File) -> R) -> Option<R> {
        let mut tables = self.lock_tables();
        tables.current_mut().and_then(|p| p.files.get(fd)).map(f)
    }
}
