//! Per-process file-descriptor tables.

use crate::error::{AllocError, FdError};
use alloc::vec::Vec;
use core::fmt;

/// Index into a process' descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fd(pub usize);

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Slots of refcounted file handles, lowest free slot first.
pub(crate) struct FdTable<F> {
    slots: Vec<Option<F>>,
    limit: usize,
}

impl<F> FdTable<F> {
    pub(crate) const fn new(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            limit,
        }
    }

    /// Lowest free slot, growing the table if needed. Nothing is stored
    /// until [`place`](Self::place).
    pub(crate) fn free_slot(&mut self) -> Result<Fd, FdError> {
        if let Some(free) = self.slots.iter().position(Option::is_none) {
            return Ok(Fd(free));
        }
        if self.slots.len() >= self.limit {
            return Err(FdError::TableFull);
        }
        self.slots.try_reserve(1).map_err(|_| AllocError)?;
        self.slots.push(None);
        Ok(Fd(self.slots.len() - 1))
    }

    pub(crate) fn place(&mut self, fd: Fd, file: F) {
        debug_assert!(self.get(fd).is_none(), "fd {fd} already open");
        self.slots[fd.0] = Some(file);
    }

    pub(crate) fn take(&mut self, fd: Fd) -> Result<F, FdError> {
        self.slots
            .get_mut(fd.0)
            .and_then(Option::take)
            .ok_or(FdError::BadDescriptor)
    }

    pub(crate) fn get(&self, fd: Fd) -> Option<&F> {
        self.slots.get(fd.0).and_then(Option::as_ref)
    }

    pub(crate) fn open_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// A table with the same layout whose handles come from `dup`.
    ///
    /// The slot vector is allocated before any handle is duplicated, so a
    /// failure leaves every reference count untouched.
    pub(crate) fn duplicate(&self, mut dup: impl FnMut(&F) -> F) -> Result<Self, AllocError> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(self.slots.len()).map_err(|_| AllocError)?;
        slots.extend(self.slots.iter().map(|slot| slot.as_ref().map(&mut dup)));
        Ok(Self {
            slots,
            limit: self.limit,
        })
    }

    /// Removes every open handle.
    pub(crate) fn drain(&mut self) -> Vec<F> {
        core::mem::take(&mut self.slots).into_iter().flatten().collect()
    }
}
