//! # Process core
//!
//! Scheduling, process lifecycle, interrupt dispatch and message passing
//! for a single-CPU kernel that is preemptible at timer interrupts.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── Kernel<M> ────────────────────────────┐
//! │  syscall ─► lifecycle (fork / exit / waitpid)    ipc (send/recv)  │
//! │                 │                                     │           │
//! │                 ▼                                     ▼           │
//! │  scheduler ◄── tables: processes · ready queue · blocked set      │
//! │      ▲                                                            │
//! │      └── irq table (FCFS per line, timer line drives schedule)    │
//! └──────────────────────────────┬────────────────────────────────────┘
//!                                ▼
//!          M: Cpu + AddressSpaces + Files  (the collaborators)
//! ```
//!
//! Everything hangs off one [`Kernel`] created by the boot sequence. The
//! architecture, memory manager and VFS are reached only through the
//! traits in [`machine`], so the same core runs on bare metal and in
//! the thread-backed `kernel-hosted` machine.
//!
//! ## Blocking
//!
//! Processes park through three paths, all built on the same
//! [`Kernel::block_unlock`] protocol: [`Semaphore::down`] on an exhausted
//! semaphore, [`Kernel::waitpid`] on a live child, and
//! [`Kernel::receive`] on an empty inbox. A lock held while parking is
//! released by the dispatcher only after it has committed to switching
//! away, which closes the lost-wakeup window between "registered as a
//! waiter" and "off the CPU".

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod config;
mod error;
mod fd;
mod ipc;
mod irq;
mod kernel;
mod lifecycle;
pub mod machine;
mod process;
mod queues;
mod scheduler;
mod semaphore;
mod syscall;

#[cfg(test)]
mod testing;

pub use config::{
    DEFAULT_IRQ_LINES, DEFAULT_KERNEL_STACK_SIZE, DEFAULT_MAX_FDS, DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_TIMER_LINE, KernelConfig,
};
pub use error::{
    AllocError, BootError, FdError, ForkError, ForkResource, IpcError, IrqError, WaitError,
};
pub use fd::Fd;
pub use ipc::Message;
pub use irq::Device;
pub use kernel::{InitProcess, Kernel};
pub use machine::{AddressSpaces, Cpu, Files, InterruptController, Machine};
pub use process::{DeferredRelease, KernelStack, Pid, ProcessState};
pub use semaphore::{Parking, Semaphore};
pub use syscall::Syscall;
