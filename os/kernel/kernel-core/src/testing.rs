//! Single-threaded stand-ins for the collaborators. Nothing here ever
//! switches: unit tests drive the tables directly and only exercise paths
//! that stay on the calling thread.

use crate::machine::{AddressSpaces, Cpu, Files, InterruptController};
use crate::{AllocError, InitProcess, Kernel, KernelConfig, KernelStack, Pid};
use kernel_sync::InterruptControl;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
pub struct TestSpace;

pub struct TestMachine {
    interrupts: AtomicBool,
    live_spaces: AtomicUsize,
    fail_next_copy: AtomicBool,
    /// Stands in for the trap frame of the running process.
    live_frame: AtomicU64,
    /// Fork-time copies made while interrupts were masked.
    masked_copies: AtomicUsize,
}

impl TestMachine {
    fn new() -> Self {
        Self {
            interrupts: AtomicBool::new(true),
            live_spaces: AtomicUsize::new(0),
            fail_next_copy: AtomicBool::new(false),
            live_frame: AtomicU64::new(0),
            masked_copies: AtomicUsize::new(0),
        }
    }

    fn note_copy(&self) {
        if !self.are_enabled() {
            self.masked_copies.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn set_live_frame(&self, frame: u64) {
        self.live_frame.store(frame, Ordering::SeqCst);
    }

    pub fn masked_copies(&self) -> usize {
        self.masked_copies.load(Ordering::SeqCst)
    }

    fn boot_space(&self) -> TestSpace {
        self.live_spaces.fetch_add(1, Ordering::SeqCst);
        TestSpace
    }

    pub fn live_spaces(&self) -> usize {
        self.live_spaces.load(Ordering::SeqCst)
    }

    pub fn fail_next_copy(&self) {
        self.fail_next_copy.store(true, Ordering::SeqCst);
    }
}

impl InterruptControl for TestMachine {
    fn are_enabled(&self) -> bool {
        self.interrupts.load(Ordering::SeqCst)
    }

    fn disable(&self) {
        self.interrupts.store(false, Ordering::SeqCst);
    }

    fn enable(&self) {
        self.interrupts.store(true, Ordering::SeqCst);
    }
}

impl Cpu for TestMachine {
    /// The captured frame.
    type Context = u64;

    fn wait_for_interrupt(&self) {
        panic!("unit tests never idle");
    }

    unsafe fn switch_context(&self, _: *mut u64, _: *const u64) {
        panic!("unit tests never switch");
    }

    unsafe fn enter_forked(&self, _: *mut u64, _: *const u64) {
        panic!("unit tests never switch");
    }

    unsafe fn retire_context(&self, _: *mut u64, _: *const u64, _: bool) -> ! {
        panic!("unit tests never switch");
    }

    fn fork_context(&self, _: Pid, _: &mut KernelStack) -> u64 {
        self.note_copy();
        self.live_frame.load(Ordering::SeqCst)
    }

    fn reboot(&self) -> ! {
        panic!("reboot");
    }
}

impl AddressSpaces for TestMachine {
    type AddressSpace = TestSpace;

    fn copy_address_space(&self, _: &TestSpace) -> Result<TestSpace, AllocError> {
        self.note_copy();
        if self.fail_next_copy.swap(false, Ordering::SeqCst) {
            return Err(AllocError);
        }
        Ok(self.boot_space())
    }

    fn activate_address_space(&self, _: &TestSpace) {}

    fn release_address_space(&self, _: TestSpace) {
        self.live_spaces.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A file whose reference count is the `Arc`'s strong count.
#[derive(Debug, Clone)]
pub struct TestFile(Arc<()>);

impl TestFile {
    pub fn open() -> Self {
        Self(Arc::new(()))
    }

    pub fn refs(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl Files for TestMachine {
    type File = TestFile;

    fn dup_file(&self, file: &TestFile) -> TestFile {
        self.note_copy();
        file.clone()
    }

    fn close_file(&self, file: TestFile) {
        drop(file);
    }
}

/// Records every end-of-interrupt.
#[derive(Debug, Default)]
pub struct Eoi {
    acked: Mutex<Vec<usize>>,
}

impl Eoi {
    pub fn count(&self, line: usize) -> usize {
        self.acked.lock().unwrap().iter().filter(|l| **l == line).count()
    }
}

impl InterruptController for Eoi {
    fn end_of_interrupt(&self, line: usize) {
        self.acked.lock().unwrap().push(line);
    }
}

pub fn booted_with(config: KernelConfig) -> Kernel<TestMachine> {
    let kernel = Kernel::new(TestMachine::new(), config);
    let address_space = kernel.machine().boot_space();
    let init = kernel
        .bootstrap(InitProcess {
            context: 0,
            address_space,
            cwd: None,
        })
        .unwrap();
    assert_eq!(init, Pid::INIT);
    kernel
}

pub fn booted() -> Kernel<TestMachine> {
    booted_with(KernelConfig::new())
}

/// Forks the running init process.
pub fn child_of_init(kernel: &Kernel<TestMachine>) -> Pid {
    kernel.fork().unwrap()
}
