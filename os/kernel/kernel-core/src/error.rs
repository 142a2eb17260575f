//! Error kinds surfaced by lifecycle, IPC and IRQ operations.
//!
//! Scheduler and semaphore primitives have no error type: they either make
//! progress or block.

use kernel_syscall::Errno;

/// A kernel allocation could not be satisfied.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("out of memory")]
pub struct AllocError;

/// Which allocation of `fork` ran out of memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ForkResource {
    KernelStack,
    AddressSpace,
    FileTable,
}

impl core::fmt::Display for ForkResource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::KernelStack => "kernel stack",
            Self::AddressSpace => "address space",
            Self::FileTable => "file table",
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForkError {
    #[error("out of memory ({0})")]
    OutOfMemory(ForkResource),
    #[error("no running process to fork")]
    NotRunning,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// No such process, or it is not a child of the caller.
    #[error("no such child")]
    NotFound,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IpcError {
    #[error("no live process with that pid")]
    InvalidTarget,
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("out of memory")]
    OutOfMemory,
    #[error("inbox is empty")]
    EmptyInbox,
}

impl From<AllocError> for IpcError {
    fn from(_: AllocError) -> Self {
        Self::OutOfMemory
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IrqError {
    #[error("irq line {0} does not exist or is not set up")]
    NoSuchLine(usize),
    #[error("out of memory")]
    OutOfMemory,
}

impl From<AllocError> for IrqError {
    fn from(_: AllocError) -> Self {
        Self::OutOfMemory
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FdError {
    #[error("bad file descriptor")]
    BadDescriptor,
    #[error("file descriptor table is full")]
    TableFull,
    #[error("out of memory")]
    OutOfMemory,
    #[error("no running process")]
    NotRunning,
}

impl From<AllocError> for FdError {
    fn from(_: AllocError) -> Self {
        Self::OutOfMemory
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootError {
    #[error("the init process already exists")]
    AlreadyBooted,
}

impl From<ForkError> for Errno {
    fn from(e: ForkError) -> Self {
        match e {
            ForkError::OutOfMemory(_) => Self::ENOMEM,
            ForkError::NotRunning => Self::ESRCH,
        }
    }
}

impl From<WaitError> for Errno {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::NotFound => Self::ECHILD,
        }
    }
}

impl From<IpcError> for Errno {
    fn from(e: IpcError) -> Self {
        match e {
            IpcError::InvalidTarget => Self::ESRCH,
            IpcError::TooLarge { .. } => Self::EMSGSIZE,
            IpcError::OutOfMemory => Self::ENOMEM,
            IpcError::EmptyInbox => Self::EAGAIN,
        }
    }
}

impl From<IrqError> for Errno {
    fn from(e: IrqError) -> Self {
        match e {
            IrqError::NoSuchLine(_) => Self::ENOENT,
            IrqError::OutOfMemory => Self::ENOMEM,
        }
    }
}

impl From<FdError> for Errno {
    fn from(e: FdError) -> Self {
        match e {
            FdError::BadDescriptor => Self::EBADF,
            FdError::TableFull => Self::EMFILE,
            FdError::OutOfMemory => Self::ENOMEM,
            FdError::NotRunning => Self::ESRCH,
        }
    }
}
