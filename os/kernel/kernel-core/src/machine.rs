//! Collaborator seams: everything the process core needs from the
//! architecture, the memory manager and the VFS.
//!
//! A bare-metal port implements these on top of real page tables, context
//! switch assembly and the file layer; `kernel-hosted` implements them with
//! OS threads so the same core can run inside `cargo test`.

use crate::error::AllocError;
use crate::process::{KernelStack, Pid};
use kernel_sync::InterruptControl;

/// The processor: interrupt flag, idling and context handoff.
pub trait Cpu: InterruptControl {
    /// Saved execution state of a suspended process.
    type Context: Send;

    /// Halts until the next interrupt has been delivered (`hlt`).
    ///
    /// Called with interrupts enabled while the current process is blocked
    /// and nothing else is ready.
    fn wait_for_interrupt(&self);

    /// Saves the running state into `from` and resumes `to`.
    ///
    /// Returns when some later switch resumes `from`.
    ///
    /// # Safety
    /// Both pointers must stay valid until the switch has read or written
    /// them. `from` belongs to the running process; `to` to a process that
    /// was suspended by a previous `switch_context`. Called with interrupts
    /// disabled and no kernel lock held.
    unsafe fn switch_context(&self, from: *mut Self::Context, to: *const Self::Context);

    /// Like [`switch_context`](Cpu::switch_context), but `to` was built by
    /// [`fork_context`](Cpu::fork_context) and has never run: it resumes as
    /// if returning from `fork` with a zero result.
    ///
    /// # Safety
    /// Same contract as `switch_context`.
    unsafe fn enter_forked(&self, from: *mut Self::Context, to: *const Self::Context);

    /// Final switch away from a terminated process: resumes `to` (built by
    /// `fork_context` if `fresh`) and never comes back. The outgoing
    /// kernel stack stays allocated until the zombie is reaped.
    ///
    /// # Safety
    /// Same contract as `switch_context`.
    unsafe fn retire_context(
        &self,
        from: *mut Self::Context,
        to: *const Self::Context,
        fresh: bool,
    ) -> !;

    /// Captures the running process' live state at the `fork` call (the
    /// trap frame it entered the kernel with) into a context on the
    /// child's fresh kernel stack.
    ///
    /// Called on the parent's own thread of execution, with interrupts
    /// enabled and no kernel lock held.
    fn fork_context(&self, child: Pid, stack: &mut KernelStack) -> Self::Context;

    /// Resets the machine.
    fn reboot(&self) -> !;
}

/// Address-space management of the memory collaborator.
pub trait AddressSpaces {
    type AddressSpace: Send;

    /// Eager, page-by-page copy of `parent`.
    ///
    /// # Errors
    /// [`AllocError`] if any frame or table cannot be allocated. Partial
    /// copies are freed by the implementation.
    fn copy_address_space(&self, parent: &Self::AddressSpace)
    -> Result<Self::AddressSpace, AllocError>;

    /// Makes `space` the active translation (CR3 load).
    fn activate_address_space(&self, space: &Self::AddressSpace);

    fn release_address_space(&self, space: Self::AddressSpace);
}

/// Reference-counted file handles of the VFS.
pub trait Files {
    type File: Send;

    /// Shares `file`, incrementing its reference count. No data is copied.
    fn dup_file(&self, file: &Self::File) -> Self::File;

    /// Drops one reference.
    fn close_file(&self, file: Self::File);
}

/// The complete set of collaborators a [`Kernel`](crate::Kernel) runs on.
pub trait Machine: Cpu + AddressSpaces + Files + Send + Sync + 'static {}

impl<T> Machine for T where T: Cpu + AddressSpaces + Files + Send + Sync + 'static {}

/// Signals end-of-interrupt for the lines a controller owns (PIC, IO-APIC).
pub trait InterruptController: Send + Sync {
    fn end_of_interrupt(&self, line: usize);
}
