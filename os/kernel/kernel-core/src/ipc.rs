//! Per-process mailboxes.

use crate::error::{AllocError, IpcError};
use crate::kernel::Kernel;
use crate::machine::Machine;
use crate::process::Pid;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_sync::{BusyLock, IrqGuard};
use log::trace;

/// A message as it sits in an inbox: a kernel-owned copy of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    sender: Pid,
    payload: Vec<u8>,
}

impl Message {
    pub const fn sender(&self) -> Pid {
        self.sender
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// FIFO of pending messages.
///
/// Guarded by a plain busy-wait flag rather than the semaphore: senders
/// may be interrupt handlers, which must never park.
pub(crate) struct Inbox {
    messages: BusyLock<VecDeque<Message>>,
    /// Set by a receiver that parked on an empty inbox; the next sender
    /// clears it and unblocks the owner.
    waiting: AtomicBool,
}

impl Inbox {
    pub(crate) const fn new() -> Self {
        Self {
            messages: BusyLock::new(VecDeque::new()),
            waiting: AtomicBool::new(false),
        }
    }

    /// Throws away every pending message. Returns how many there were.
    pub(crate) fn drain(&self) -> usize {
        let dropped = self.messages.with(core::mem::take);
        dropped.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.with(|q| q.len())
    }
}

impl<M: Machine> Kernel<M> {
    /// Sends `payload` to `target` on behalf of the running process.
    ///
    /// # Errors
    /// See [`send_from`](Self::send_from).
    pub fn send(&self, target: Pid, payload: &[u8]) -> Result<(), IpcError> {
        let sender = self.current_pid().unwrap_or(Pid::KERNEL);
        self.send_from(sender, target, payload)
    }

    /// Copies `payload` into `target`'s inbox, stamped with `sender`.
    /// Interrupt handlers use [`Pid::KERNEL`] as sender.
    ///
    /// Never blocks. Wakes the target if it is parked waiting for mail.
    ///
    /// # Errors
    /// - [`IpcError::InvalidTarget`] if `target` does not exist or has exited.
    /// - [`IpcError::TooLarge`] above the configured message size.
    /// - [`IpcError::OutOfMemory`] if the kernel copy cannot be allocated.
    pub fn send_from(&self, sender: Pid, target: Pid, payload: &[u8]) -> Result<(), IpcError> {
        let inbox = self
            .lock_tables()
            .processes
            .get(&target)
            .filter(|p| !p.is_terminated())
            .map(|p| Arc::clone(&p.inbox))
            .ok_or(IpcError::InvalidTarget)?;

        let limit = self.config.max_message_size;
        if payload.len() > limit {
            return Err(IpcError::TooLarge {
                size: payload.len(),
                limit,
            });
        }

        let mut copy = Vec::new();
        copy.try_reserve_exact(payload.len()).map_err(|_| AllocError)?;
        copy.extend_from_slice(payload);

        let _irq = IrqGuard::new(self.interrupt_control());
        let mut queue = inbox.messages.lock();
        queue.try_reserve(1).map_err(|_| AllocError)?;
        queue.push_back(Message {
            sender,
            payload: copy,
        });
        if inbox.waiting.swap(false, Ordering::AcqRel) {
            self.unblock(target);
        }
        drop(queue);

        trace!("Message {sender} -> {target} ({} bytes)", payload.len());
        Ok(())
    }

    /// Takes the oldest message from the running process' inbox.
    ///
    /// With `wait` the caller parks until a message arrives.
    ///
    /// # Errors
    /// [`IpcError::EmptyInbox`] if the inbox is empty and `wait` is false.
    pub fn receive(&self, wait: bool) -> Result<Message, IpcError> {
        let inbox = self
            .lock_tables()
            .current_mut()
            .map(|p| Arc::clone(&p.inbox))
            .ok_or(IpcError::InvalidTarget)?;

        loop {
            let _irq = IrqGuard::new(self.interrupt_control());
            let mut queue = inbox.messages.lock();
            if let Some(message) = queue.pop_front() {
                return Ok(message);
            }
            if !wait {
                return Err(IpcError::EmptyInbox);
            }

            // Flag and park under the inbox lock so a sender either sees
            // the flag or we see its message.
            inbox.waiting.store(true, Ordering::Release);
            let parked = self.lock_tables().park_current(None);
            drop(queue);
            match parked {
                Ok(me) => self.wait_while_blocked(me),
                Err(_) => return Err(IpcError::InvalidTarget),
            }
        }
    }

    /// [`receive`](Self::receive) into a caller buffer. Copies at most
    /// `buf.len()` bytes and returns the sender and the full message size.
    ///
    /// # Errors
    /// As `receive`.
    pub fn receive_into(&self, buf: &mut [u8], wait: bool) -> Result<(Pid, usize), IpcError> {
        let message = self.receive(wait)?;
        let n = buf.len().min(message.size());
        buf[..n].copy_from_slice(&message.payload[..n]);
        Ok((message.sender, message.size()))
    }

    /// Messages queued for `pid`, or `None` if there is no such process.
    pub fn pending_messages(&self, pid: Pid) -> Option<usize> {
        let inbox = self
            .lock_tables()
            .processes
            .get(&pid)
            .map(|p| Arc::clone(&p.inbox))?;
        Some(inbox.len())
    }
}
