//! The per-CPU kernel object: process table, scheduler queues and the
//! bootstrap that turns the boot code into init.

use crate::config::KernelConfig;
use crate::error::BootError;
use crate::fd::FdTable;
use crate::ipc::Inbox;
use crate::irq::IrqTable;
use crate::machine::Machine;
use crate::process::{DeferredRelease, KernelStack, Pid, Process, ProcessState, RunState};
use crate::queues::{BlockedSet, ReadyQueue};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use kernel_sync::{InterruptControl, IrqMutex, SpinMutex, Spinlock};
use log::info;

/// Process table and scheduler queues. Only ever locked with interrupts
/// disabled, and never held across a context switch.
pub(crate) struct Tables<M: Machine> {
    pub(crate) processes: BTreeMap<Pid, Box<Process<M>>>,
    pub(crate) current: Option<Pid>,
    pub(crate) ready: ReadyQueue,
    pub(crate) blocked: BlockedSet,
}

impl<M: Machine> Tables<M> {
    const fn new() -> Self {
        Self {
            processes: BTreeMap::new(),
            current: None,
            ready: ReadyQueue::new(),
            blocked: BlockedSet::new(),
        }
    }

    pub(crate) fn current_mut(&mut self) -> Option<&mut Process<M>> {
        let pid = self.current?;
        self.processes.get_mut(&pid).map(Box::as_mut)
    }

    /// Marks the running process blocked. Hands `release` back if there
    /// is no running process to park.
    pub(crate) fn park_current(
        &mut self,
        release: Option<DeferredRelease>,
    ) -> Result<Pid, Option<DeferredRelease>> {
        let Some(process) = self.current_mut() else {
            return Err(release);
        };
        process.state = RunState::Blocked { release };
        let pid = process.pid;
        debug_assert!(!self.blocked.contains(pid), "{pid} parked twice");
        self.blocked.insert(pid);
        Ok(pid)
    }

    /// Moves a blocked process back to runnable. The running process is
    /// marked running in place; any other is appended to the ready queue.
    ///
    /// Returns a release the process had not handed over yet, for the
    /// caller to run once the table lock is dropped.
    pub(crate) fn wake(&mut self, pid: Pid) -> Option<DeferredRelease> {
        let process = self.processes.get_mut(&pid)?;
        let RunState::Blocked { release } = &mut process.state else {
            return None;
        };
        let release = release.take();
        if self.current == Some(pid) {
            process.state = RunState::Running;
        } else {
            process.state = RunState::Ready;
            self.ready.push(pid);
        }
        let registered = self.blocked.remove(pid);
        debug_assert!(registered, "{pid} blocked but not in the blocked set");
        release
    }
}

/// The bootstrap process as the boot code hands it over.
pub struct InitProcess<M: Machine> {
    /// Placeholder context; filled in by the first switch away from init.
    pub context: M::Context,
    pub address_space: M::AddressSpace,
    pub cwd: Option<M::File>,
}

/// The process core of one CPU.
///
/// Created once by the boot sequence; every subsystem (scheduler, IRQ
/// table, lifecycle, mailbox) hangs off this object instead of living in
/// file-scope globals.
pub struct Kernel<M: Machine> {
    pub(crate) machine: M,
    pub(crate) config: KernelConfig,
    pub(crate) tables: SpinMutex<Tables<M>>,
    pub(crate) enabled: AtomicBool,
    pub(crate) ticks: AtomicU64,
    next_pid: AtomicU64,
    pub(crate) irqs: IrqTable<M>,
}

impl<M: Machine> Kernel<M> {
    /// A kernel with no processes. The scheduler stays disabled until
    /// [`bootstrap`](Self::bootstrap).
    pub fn new(machine: M, config: KernelConfig) -> Self {
        Self {
            machine,
            irqs: IrqTable::new(config.irq_lines),
            config,
            tables: SpinMutex::new(Tables::new()),
            enabled: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            next_pid: AtomicU64::new(Pid::INIT.as_u64()),
        }
    }

    pub const fn machine(&self) -> &M {
        &self.machine
    }

    pub const fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Installs the running boot code as PID 1 and enables the scheduler.
    ///
    /// # Errors
    /// [`BootError::AlreadyBooted`] on a second call.
    pub fn bootstrap(&self, init: InitProcess<M>) -> Result<Pid, BootError> {
        let mut tables = self.lock_tables();
        if !tables.processes.is_empty() {
            return Err(BootError::AlreadyBooted);
        }

        let pid = self.allocate_pid();
        self.machine.activate_address_space(&init.address_space);
        tables.processes.insert(
            pid,
            Box::new(Process {
                pid,
                parent: None,
                address_space: Some(init.address_space),
                files: FdTable::new(self.config.max_fds),
                cwd: init.cwd,
                kernel_stack: KernelStack::boot(),
                context: UnsafeCell::new(init.context),
                state: RunState::Running,
                status: 0,
                blocked_for_child: None,
                inbox: Arc::new(Inbox::new()),
            }),
        );
        tables.current = Some(pid);
        self.enabled.store(true, Ordering::Release);
        drop(tables);

        info!("Scheduler enabled, init is pid {pid}");
        Ok(pid)
    }

    pub(crate) fn allocate_pid(&self) -> Pid {
        Pid::new(self.next_pid.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn lock_tables(&self) -> IrqMutex<'_, Tables<M>, Spinlock> {
        self.tables.lock_irq(&self.machine)
    }

    pub(crate) fn interrupt_control(&self) -> &dyn InterruptControl {
        &self.machine
    }

    /// Whether the scheduler is dispatching.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.lock_tables().current
    }

    /// Timer interrupts handled so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Ready queue contents, head first.
    pub fn ready_pids(&self) -> Vec<Pid> {
        self.lock_tables().ready.iter().collect()
    }

    pub fn blocked_pids(&self) -> Vec<Pid> {
        self.lock_tables().blocked.iter().collect()
    }

    /// `None` once the process has been reaped (or never existed).
    pub fn state_of(&self, pid: Pid) -> Option<ProcessState> {
        self.lock_tables()
            .processes
            .get(&pid)
            .map(|p| p.state.summary())
    }

    pub fn parent_of(&self, pid: Pid) -> Option<Pid> {
        self.lock_tables().processes.get(&pid).and_then(|p| p.parent)
    }

    /// Live and zombie records.
    pub fn process_count(&self) -> usize {
        self.lock_tables().processes.len()
    }
}
