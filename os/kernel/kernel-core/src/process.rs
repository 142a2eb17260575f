//! Process records and their lifecycle states.

use crate::error::AllocError;
use crate::fd::FdTable;
use crate::ipc::Inbox;
use crate::machine::Machine;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::fmt;

/// Process identifier. Allocated monotonically from 1 and never reused.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u64);

impl Pid {
    /// Sender of messages posted by the kernel itself, e.g. from an
    /// interrupt handler. Never assigned to a process.
    pub const KERNEL: Self = Self(0);

    /// The bootstrap process.
    pub const INIT: Self = Self(1);

    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An owned, zero-initialized kernel stack.
///
/// The bootstrap process runs on the boot stack and owns an empty one.
pub struct KernelStack {
    bytes: Vec<u8>,
}

impl KernelStack {
    /// The stack of the bootstrap process: nothing to own.
    #[must_use]
    pub const fn boot() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Allocates `size` zeroed bytes.
    ///
    /// # Errors
    /// [`AllocError`] if the allocation cannot be satisfied.
    pub fn allocate(size: usize) -> Result<Self, AllocError> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(size).map_err(|_| AllocError)?;
        bytes.resize(size, 0);
        Ok(Self { bytes })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The usable stack memory, lowest address first.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// One past the highest byte; stacks grow down from here.
    pub fn top(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr_range().end
    }
}

impl fmt::Debug for KernelStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelStack").field("len", &self.len()).finish()
    }
}

/// A lock release handed to the scheduler by a parking process.
///
/// It runs exactly once: when the dispatcher has committed to switching
/// away from the parking process, with interrupts still disabled. Any
/// process that sees the lock free therefore also sees the parker in
/// whatever wait queue it registered with.
pub struct DeferredRelease(Box<dyn FnOnce() + Send>);

impl DeferredRelease {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(release))
    }

    pub fn run(self) {
        (self.0)();
    }
}

impl fmt::Debug for DeferredRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeferredRelease")
    }
}

/// Scheduling state of a process record.
#[derive(Debug)]
pub(crate) enum RunState {
    /// Created by `fork`, never dispatched. The first dispatch takes the
    /// fork-return path and moves it to `Running`.
    FreshlyForked,
    Ready,
    Running,
    /// Parked off the ready queue until `unblock`. `release`, if present, is
    /// consumed by the next dispatch.
    Blocked { release: Option<DeferredRelease> },
    /// Zombie until reaped by the parent.
    Terminated,
}

impl RunState {
    pub(crate) const fn summary(&self) -> ProcessState {
        match self {
            Self::FreshlyForked | Self::Ready => ProcessState::Ready,
            Self::Running => ProcessState::Running,
            Self::Blocked { .. } => ProcessState::Blocked,
            Self::Terminated => ProcessState::Terminated,
        }
    }
}

/// Observable state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Blocked,
    Terminated,
}

pub(crate) struct Process<M: Machine> {
    pub(crate) pid: Pid,
    pub(crate) parent: Option<Pid>,
    pub(crate) address_space: Option<M::AddressSpace>,
    pub(crate) files: FdTable<M::File>,
    pub(crate) cwd: Option<M::File>,
    pub(crate) kernel_stack: KernelStack,
    /// Written only by the context switch, read by `fork`.
    pub(crate) context: UnsafeCell<M::Context>,
    pub(crate) state: RunState,
    pub(crate) status: i32,
    pub(crate) blocked_for_child: Option<Pid>,
    pub(crate) inbox: Arc<Inbox>,
}

impl<M: Machine> Process<M> {
    pub(crate) const fn is_blocked(&self) -> bool {
        matches!(self.state, RunState::Blocked { .. })
    }

    pub(crate) const fn is_terminated(&self) -> bool {
        matches!(self.state, RunState::Terminated)
    }
}

/// Everything `exit` takes out of a record to hand back to collaborators.
pub(crate) struct Reclaimed<M: Machine> {
    pub(crate) address_space: Option<M::AddressSpace>,
    pub(crate) files: Vec<M::File>,
    pub(crate) cwd: Option<M::File>,
}

impl<M: Machine> Process<M> {
    pub(crate) fn reclaim(&mut self) -> Reclaimed<M> {
        Reclaimed {
            address_space: self.address_space.take(),
            files: self.files.drain(),
            cwd: self.cwd.take(),
        }
    }
}
