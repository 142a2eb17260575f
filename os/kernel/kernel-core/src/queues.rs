//! Scheduler queues. Both hold PIDs into the process table rather than
//! the records themselves.

use crate::process::Pid;
use alloc::collections::{BTreeSet, VecDeque};

/// FIFO of processes eligible to run.
#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
    queue: VecDeque<Pid>,
}

impl ReadyQueue {
    pub(crate) const fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// Appends `pid` at the back.
    pub(crate) fn push(&mut self, pid: Pid) {
        debug_assert!(!self.contains(pid), "{pid} queued twice");
        self.queue.push_back(pid);
    }

    pub(crate) fn pop(&mut self) -> Option<Pid> {
        self.queue.pop_front()
    }

    pub(crate) fn remove(&mut self, pid: Pid) -> bool {
        let before = self.queue.len();
        self.queue.retain(|p| *p != pid);
        before != self.queue.len()
    }

    pub(crate) fn contains(&self, pid: Pid) -> bool {
        self.queue.contains(&pid)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = Pid> + '_ {
        self.queue.iter().copied()
    }
}

/// Registry of parked processes.
#[derive(Debug, Default)]
pub(crate) struct BlockedSet {
    pids: BTreeSet<Pid>,
}

impl BlockedSet {
    pub(crate) const fn new() -> Self {
        Self {
            pids: BTreeSet::new(),
        }
    }

    pub(crate) fn insert(&mut self, pid: Pid) {
        self.pids.insert(pid);
    }

    pub(crate) fn remove(&mut self, pid: Pid) -> bool {
        self.pids.remove(&pid)
    }

    pub(crate) fn contains(&self, pid: Pid) -> bool {
        self.pids.contains(&pid)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = Pid> + '_ {
        self.pids.iter().copied()
    }
}
