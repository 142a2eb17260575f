//! The collaborators, emulated with OS threads.
//!
//! Every process runs on its own thread, but only the thread holding the
//! CPU baton executes: a context switch hands the baton to the incoming
//! process' thread and parks the outgoing one until it is resumed. The
//! interrupt flag is a plain atomic and raised interrupts queue up until
//! the running process idles or calls
//! [`service_interrupts`](HostMachine::service_interrupts).
//!
//! The final switch away from an exited process unwinds its thread back
//! to the entry point, which passes the baton on and lets the thread end.

use kernel_core::machine::{AddressSpaces, Cpu, Files, InterruptController};
use kernel_core::{AllocError, Kernel, KernelStack, Pid};
use kernel_sync::InterruptControl;
use log::{debug, trace};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread;
use std::time::Duration;

pub type HostKernel = Kernel<HostMachine>;

/// What a forked child runs in place of "returning zero from fork". The
/// returned value becomes its exit status.
pub type ProcessBody = Box<dyn FnOnce(&HostKernel) -> i32 + Send>;

/// Exit status of a process whose body panicked.
pub const PANIC_STATUS: i32 = 101;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Unwind payload that carries a retiring thread to its entry point.
struct Retired {
    next: u64,
}

/// Saved state of a suspended process: the thread it lives on.
#[derive(Debug)]
pub struct HostContext {
    slot: u64,
}

impl HostContext {
    /// The thread that booted the kernel, which becomes init.
    #[must_use]
    pub const fn boot() -> Self {
        Self { slot: 0 }
    }
}

/// State shared with every process thread.
struct Processor {
    interrupts: AtomicBool,
    /// Slot of the thread allowed to run.
    running: Mutex<u64>,
    turn: Condvar,
    pending: Mutex<VecDeque<usize>>,
    raised: Condvar,
    idle_timeout: Duration,
    /// Forked threads that have not finished yet.
    threads: AtomicUsize,
}

impl Processor {
    fn hand_over(&self, from: u64, to: u64) {
        let mut running = lock(&self.running);
        *running = to;
        self.turn.notify_all();
        drop(
            self.turn
                .wait_while(running, |r| *r != from)
                .unwrap_or_else(PoisonError::into_inner),
        );
    }

    /// Hands the baton to `to` for good; the caller's thread is ending.
    fn leave(&self, to: u64) {
        // Switches happen with interrupts masked.
        self.interrupts.store(false, Ordering::SeqCst);
        *lock(&self.running) = to;
        self.turn.notify_all();
    }

    fn wait_turn(&self, slot: u64) {
        let running = lock(&self.running);
        drop(
            self.turn
                .wait_while(running, |r| *r != slot)
                .unwrap_or_else(PoisonError::into_inner),
        );
    }

    fn raise(&self, line: usize) {
        lock(&self.pending).push_back(line);
        self.raised.notify_all();
    }
}

/// Raises interrupts from outside the process threads, e.g. from a
/// thread playing a device.
#[derive(Clone)]
pub struct IrqRaiser(Arc<Processor>);

impl IrqRaiser {
    pub fn raise(&self, line: usize) {
        self.0.raise(line);
    }
}

/// A copied-on-fork block of user memory.
#[derive(Debug)]
pub struct HostSpace {
    bytes: Vec<u8>,
}

impl HostSpace {
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug)]
struct FileNode {
    path: String,
}

/// A shared file handle. Its reference count is the number of open
/// handles across all processes plus any the test itself keeps.
#[derive(Debug, Clone)]
pub struct HostFile(Arc<FileNode>);

impl HostFile {
    #[must_use]
    pub fn open(path: &str) -> Self {
        Self(Arc::new(FileNode {
            path: path.to_owned(),
        }))
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.0.path
    }

    #[must_use]
    pub fn refs(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

/// Interrupt controller that counts end-of-interrupt signals per line.
#[derive(Debug, Default)]
pub struct HostPic {
    acked: Mutex<Vec<usize>>,
}

impl HostPic {
    #[must_use]
    pub fn acknowledged(&self, line: usize) -> usize {
        lock(&self.acked).iter().filter(|l| **l == line).count()
    }
}

impl InterruptController for HostPic {
    fn end_of_interrupt(&self, line: usize) {
        lock(&self.acked).push(line);
    }
}

/// # Panics
/// - [`Cpu::wait_for_interrupt`] panics when the CPU has been idle for the
///   configured timeout with nothing pending: every process is blocked and
///   nobody can wake them.
/// - [`Cpu::reboot`] panics with `"reboot"`.
/// - [`Cpu::fork_context`] panics if the host cannot spawn another thread.
pub struct HostMachine {
    cpu: Arc<Processor>,
    /// Type-erased so the machine's auto traits do not depend on the
    /// kernel that owns it.
    kernel: OnceLock<Weak<dyn Any + Send + Sync>>,
    next_slot: AtomicU64,
    next_body: Mutex<Option<ProcessBody>>,
    live_spaces: AtomicUsize,
    fail_next_copy: AtomicBool,
}

impl HostMachine {
    pub(crate) fn new(idle_timeout: Duration) -> Self {
        Self {
            cpu: Arc::new(Processor {
                interrupts: AtomicBool::new(true),
                running: Mutex::new(HostContext::boot().slot),
                turn: Condvar::new(),
                pending: Mutex::new(VecDeque::new()),
                raised: Condvar::new(),
                idle_timeout,
                threads: AtomicUsize::new(0),
            }),
            kernel: OnceLock::new(),
            next_slot: AtomicU64::new(1),
            next_body: Mutex::new(None),
            live_spaces: AtomicUsize::new(0),
            fail_next_copy: AtomicBool::new(false),
        }
    }

    /// Lets forked threads and interrupt delivery reach the kernel.
    pub(crate) fn attach(&self, kernel: &Arc<HostKernel>) {
        let weak: Weak<dyn Any + Send + Sync> = Arc::<HostKernel>::downgrade(kernel);
        if self.kernel.set(weak).is_err() {
            debug!("Machine already attached to a kernel");
        }
    }

    fn kernel(&self) -> Option<Arc<HostKernel>> {
        self.kernel.get().and_then(upgrade)
    }

    pub(crate) fn new_address_space(&self, bytes: usize) -> HostSpace {
        self.live_spaces.fetch_add(1, Ordering::SeqCst);
        HostSpace {
            bytes: vec![0; bytes],
        }
    }

    /// Sets what the child of the next `fork` runs. Without a body the
    /// child exits with status 0 right away.
    pub fn on_next_fork(&self, body: ProcessBody) {
        *lock(&self.next_body) = Some(body);
    }

    pub(crate) fn forget_next_fork(&self) {
        lock(&self.next_body).take();
    }

    /// Queues an interrupt on `line`. It is delivered the next time the
    /// running process idles or calls [`service_interrupts`](Self::service_interrupts)
    /// with interrupts enabled.
    pub fn raise(&self, line: usize) {
        self.cpu.raise(line);
    }

    #[must_use]
    pub fn raiser(&self) -> IrqRaiser {
        IrqRaiser(Arc::clone(&self.cpu))
    }

    /// Delivers queued interrupts on the calling process' thread while
    /// interrupts are enabled. A timer interrupt may switch away; the rest
    /// is delivered once this process runs again.
    pub fn service_interrupts(&self) {
        while self.are_enabled() {
            let Some(line) = lock(&self.cpu.pending).pop_front() else {
                break;
            };
            match self.kernel() {
                Some(kernel) => kernel.handle_interrupt(line),
                None => debug!("Interrupt on line {line} after shutdown"),
            }
        }
    }

    #[must_use]
    pub fn pending_interrupts(&self) -> usize {
        lock(&self.cpu.pending).len()
    }

    /// Threads of forked processes that are still alive. A process' thread
    /// ends with its last switch, before its parent reaps it.
    #[must_use]
    pub fn process_threads(&self) -> usize {
        self.cpu.threads.load(Ordering::SeqCst)
    }

    /// Address spaces created and not yet released.
    #[must_use]
    pub fn live_spaces(&self) -> usize {
        self.live_spaces.load(Ordering::SeqCst)
    }

    /// Makes the next address space copy fail as if out of frames.
    pub fn fail_next_copy(&self) {
        self.fail_next_copy.store(true, Ordering::SeqCst);
    }
}

fn upgrade(kernel: &Weak<dyn Any + Send + Sync>) -> Option<Arc<HostKernel>> {
    kernel.upgrade()?.downcast().ok()
}

/// Runs a child's body; a panic becomes [`PANIC_STATUS`].
fn run_body(kernel: &HostKernel, body: ProcessBody) -> i32 {
    match panic::catch_unwind(AssertUnwindSafe(|| body(kernel))) {
        Ok(status) => status,
        // The body exited through a syscall: keep unwinding.
        Err(payload) if payload.is::<Retired>() => panic::resume_unwind(payload),
        Err(_) => PANIC_STATUS,
    }
}

impl InterruptControl for HostMachine {
    fn are_enabled(&self) -> bool {
        self.cpu.interrupts.load(Ordering::SeqCst)
    }

    fn disable(&self) {
        self.cpu.interrupts.store(false, Ordering::SeqCst);
    }

    fn enable(&self) {
        self.cpu.interrupts.store(true, Ordering::SeqCst);
    }
}

impl Cpu for HostMachine {
    type Context = HostContext;

    fn wait_for_interrupt(&self) {
        let pending = lock(&self.cpu.pending);
        let (pending, idle) = self
            .cpu
            .raised
            .wait_timeout_while(pending, self.cpu.idle_timeout, |p| p.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        let stuck = idle.timed_out() && pending.is_empty();
        drop(pending);
        assert!(
            !stuck,
            "CPU idle for {:?} with no interrupt pending",
            self.cpu.idle_timeout
        );
        self.service_interrupts();
    }

    unsafe fn switch_context(&self, from: *mut HostContext, to: *const HostContext) {
        // Safety: both records outlive the switch per the trait contract.
        let (from, to) = unsafe { ((*from).slot, (*to).slot) };
        trace!("slot {from} -> slot {to}");
        self.cpu.hand_over(from, to);
    }

    unsafe fn enter_forked(&self, from: *mut HostContext, to: *const HostContext) {
        // A forked thread already waits for its turn; entering it is an
        // ordinary handover.
        unsafe { self.switch_context(from, to) };
    }

    unsafe fn retire_context(
        &self,
        from: *mut HostContext,
        to: *const HostContext,
        _fresh: bool,
    ) -> ! {
        // Safety: both records outlive the switch per the trait contract.
        let (from, to) = unsafe { ((*from).slot, (*to).slot) };
        trace!("slot {from} retires, slot {to} takes over");
        panic::resume_unwind(Box::new(Retired { next: to }))
    }

    fn fork_context(&self, child: Pid, stack: &mut KernelStack) -> HostContext {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        trace!("pid {child}: slot {slot}, {} byte kernel stack", stack.len());

        let body = lock(&self.next_body).take();
        let cpu = Arc::clone(&self.cpu);
        let kernel = self.kernel.get().cloned();
        let spawned = thread::Builder::new()
            .name(format!("pid-{child}"))
            .spawn(move || {
                cpu.wait_turn(slot);
                // Returning from fork lands in user mode.
                cpu.interrupts.store(true, Ordering::SeqCst);
                let ended = panic::catch_unwind(AssertUnwindSafe(|| {
                    let Some(kernel) = kernel.as_ref().and_then(upgrade) else {
                        return;
                    };
                    let status = body.map_or(0, |body| run_body(&kernel, body));
                    kernel.exit(status)
                }));
                cpu.threads.fetch_sub(1, Ordering::SeqCst);
                match ended.map_err(|payload| payload.downcast::<Retired>()) {
                    Ok(()) => debug!("pid {child}: kernel gone before dispatch"),
                    Err(Ok(retired)) => cpu.leave(retired.next),
                    Err(Err(payload)) => panic::resume_unwind(payload),
                }
            });
        if let Err(e) = spawned {
            panic!("cannot spawn a thread for pid {child}: {e}");
        }
        self.cpu.threads.fetch_add(1, Ordering::SeqCst);
        HostContext { slot }
    }

    fn reboot(&self) -> ! {
        panic!("reboot");
    }
}

impl AddressSpaces for HostMachine {
    type AddressSpace = HostSpace;

    fn copy_address_space(&self, parent: &HostSpace) -> Result<HostSpace, AllocError> {
        if self.fail_next_copy.swap(false, Ordering::SeqCst) {
            return Err(AllocError);
        }
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(parent.bytes.len())
            .map_err(|_| AllocError)?;
        bytes.extend_from_slice(&parent.bytes);
        self.live_spaces.fetch_add(1, Ordering::SeqCst);
        Ok(HostSpace { bytes })
    }

    fn activate_address_space(&self, space: &HostSpace) {
        trace!("Activating {} byte address space", space.len());
    }

    fn release_address_space(&self, space: HostSpace) {
        drop(space);
        self.live_spaces.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Files for HostMachine {
    type File = HostFile;

    fn dup_file(&self, file: &HostFile) -> HostFile {
        file.clone()
    }

    fn close_file(&self, file: HostFile) {
        trace!("Closing {} ({} refs left)", file.path(), file.refs() - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn shareable<T: Send + Sync>() {}

    #[test]
    fn kernel_and_machine_cross_threads() {
        shareable::<HostMachine>();
        shareable::<HostKernel>();
    }

    #[test]
    fn leaving_passes_the_baton_with_interrupts_masked() {
        let machine = HostMachine::new(Duration::from_millis(50));
        machine.cpu.leave(7);
        assert_eq!(*lock(&machine.cpu.running), 7);
        assert!(!machine.are_enabled());
    }
}
