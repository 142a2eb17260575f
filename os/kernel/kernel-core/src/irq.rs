//! IRQ dispatch table: one first-come-first-served reservation queue per
//! interrupt line.
//!
//! Only the head of a line's queue is served. A one-shot head is dequeued
//! after it ran; a persistent head stays and keeps every later reservation
//! on that line from ever running.

use crate::error::{AllocError, IrqError};
use crate::kernel::Kernel;
use crate::machine::{InterruptController, Machine};
use crate::process::Pid;
use crate::semaphore::Semaphore;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::Ordering;
use kernel_sync::IrqGuard;
use log::{debug, trace, warn};

/// A driver's interrupt handler.
pub trait Device<M: Machine>: Send + Sync {
    /// Called for an interrupt on `line` with the reservation's `data`.
    /// Runs with interrupts disabled and must not block.
    fn on_interrupt(&self, kernel: &Kernel<M>, line: usize, data: usize);
}

impl<M, F> Device<M> for F
where
    M: Machine,
    F: Fn(&Kernel<M>, usize, usize) + Send + Sync,
{
    fn on_interrupt(&self, kernel: &Kernel<M>, line: usize, data: usize) {
        self(kernel, line, data);
    }
}

struct Reservation<M: Machine> {
    device: Arc<dyn Device<M>>,
    one_shot: bool,
    data: usize,
    /// Process that made the reservation; dropped when it exits.
    owner: Option<Pid>,
}

struct IrqLine<M: Machine> {
    /// Set by `irq_setup`; a line without a controller is unusable.
    controller: Option<Arc<dyn InterruptController>>,
    queue: VecDeque<Reservation<M>>,
}

pub(crate) struct IrqTable<M: Machine> {
    access: Semaphore,
    lines: UnsafeCell<Vec<IrqLine<M>>>,
}

// Safety: `lines` is only reached through `Kernel::with_irq_table`, which
// holds `access` with interrupts disabled.
unsafe impl<M: Machine> Sync for IrqTable<M> {}
unsafe impl<M: Machine> Send for IrqTable<M> {}

impl<M: Machine> IrqTable<M> {
    pub(crate) fn new(lines: usize) -> Self {
        Self {
            access: Semaphore::new(1),
            lines: UnsafeCell::new(
                (0..lines)
                    .map(|_| IrqLine {
                        controller: None,
                        queue: VecDeque::new(),
                    })
                    .collect(),
            ),
        }
    }
}

/// What a single interrupt resolved to.
struct Service<M: Machine> {
    controller: Arc<dyn InterruptController>,
    head: Option<(Arc<dyn Device<M>>, usize)>,
}

impl<M: Machine> Kernel<M> {
    fn with_irq_table<R>(&self, f: impl FnOnce(&mut [IrqLine<M>]) -> R) -> R {
        let _irq = IrqGuard::new(self.interrupt_control());
        self.irqs.access.down(self);
        // Safety: the access semaphore admits one holder at a time.
        let r = f(unsafe { (*self.irqs.lines.get()).as_mut_slice() });
        self.irqs.access.up(self);
        r
    }

    /// Marks `line` usable and records the controller that acknowledges it.
    ///
    /// # Errors
    /// [`IrqError::NoSuchLine`] if `line` is out of range.
    pub fn irq_setup(
        &self,
        line: usize,
        controller: Arc<dyn InterruptController>,
    ) -> Result<(), IrqError> {
        self.with_irq_table(|lines| {
            let entry = lines.get_mut(line).ok_or(IrqError::NoSuchLine(line))?;
            entry.controller = Some(controller);
            Ok::<_, IrqError>(())
        })?;
        debug!("IRQ line {line} set up");
        Ok(())
    }

    /// Queues a reservation for `line` behind all earlier ones.
    ///
    /// A `one_shot` reservation is removed after it has been served once.
    /// `data` is passed back to the device on every dispatch.
    ///
    /// # Errors
    /// - [`IrqError::NoSuchLine`] if the line is out of range or not set up.
    /// - [`IrqError::OutOfMemory`] if the queue cannot grow.
    pub fn irq_reserve(
        &self,
        line: usize,
        device: Arc<dyn Device<M>>,
        one_shot: bool,
        data: usize,
    ) -> Result<(), IrqError> {
        let owner = self.current_pid();
        let position = self.with_irq_table(|lines| {
            let entry = lines
                .get_mut(line)
                .filter(|l| l.controller.is_some())
                .ok_or(IrqError::NoSuchLine(line))?;
            entry.queue.try_reserve(1).map_err(|_| AllocError)?;
            entry.queue.push_back(Reservation {
                device,
                one_shot,
                data,
                owner,
            });
            Ok::<_, IrqError>(entry.queue.len())
        })?;
        debug!(
            "IRQ line {line}: {} reservation #{position}",
            if one_shot { "one-shot" } else { "persistent" }
        );
        Ok(())
    }

    /// Reservations queued on `line`.
    pub fn irq_reservations(&self, line: usize) -> usize {
        self.with_irq_table(|lines| lines.get(line).map_or(0, |l| l.queue.len()))
    }

    /// Drops every reservation made by `pid`. Returns how many there were.
    pub fn irq_release_owner(&self, pid: Pid) -> usize {
        let removed: usize = self.with_irq_table(|lines| {
            lines
                .iter_mut()
                .map(|l| {
                    let before = l.queue.len();
                    l.queue.retain(|r| r.owner != Some(pid));
                    before - l.queue.len()
                })
                .sum()
        });
        if removed > 0 {
            debug!("Dropped {removed} IRQ reservation(s) of pid {pid}");
        }
        removed
    }

    /// Entry point for a hardware interrupt on `line`.
    ///
    /// Serves the head reservation, acknowledges the interrupt and, on the
    /// timer line, advances the tick counter and runs the scheduler. The
    /// device runs after the table is unlocked so it may reserve again.
    pub fn handle_interrupt(&self, line: usize) {
        let _irq = IrqGuard::new(self.interrupt_control());

        let service = self.with_irq_table(|lines| {
            let entry = lines.get_mut(line)?;
            let controller = Arc::clone(entry.controller.as_ref()?);
            let head = match entry.queue.front().map(|r| r.one_shot) {
                Some(true) => entry.queue.pop_front().map(|r| (r.device, r.data)),
                Some(false) => entry.queue.front().map(|r| (Arc::clone(&r.device), r.data)),
                None => None,
            };
            Some(Service { controller, head })
        });

        let Some(Service { controller, head }) = service else {
            warn!("Spurious interrupt on line {line}");
            return;
        };

        match head {
            Some((device, data)) => device.on_interrupt(self, line, data),
            None => trace!("No reservation on line {line}"),
        }
        controller.end_of_interrupt(line);

        if line == self.config.timer_line {
            self.ticks.fetch_add(1, Ordering::Relaxed);
            self.schedule();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{Eoi, TestMachine, booted};
    use crate::{IrqError, Kernel, Pid};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Arc<dyn crate::Device<TestMachine>>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let device = Arc::new(move |_: &Kernel<TestMachine>, _: usize, _: usize| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (hits, device)
    }

    #[test]
    fn unknown_lines_are_rejected() {
        let kernel = booted();
        let eoi = Arc::new(Eoi::default());
        assert_eq!(kernel.irq_setup(16, eoi), Err(IrqError::NoSuchLine(16)));

        let (_, device) = counter();
        assert_eq!(
            kernel.irq_reserve(3, device, true, 0),
            Err(IrqError::NoSuchLine(3)),
            "line exists but was never set up"
        );
    }

    #[test]
    fn persistent_head_starves_later_reservations() {
        let kernel = booted();
        let eoi = Arc::new(Eoi::default());
        kernel.irq_setup(1, eoi.clone()).unwrap();

        let (x_hits, x) = counter();
        let (y_hits, y) = counter();
        kernel.irq_reserve(1, x, false, 0).unwrap();
        kernel.irq_reserve(1, y, true, 0).unwrap();

        kernel.handle_interrupt(1);
        kernel.handle_interrupt(1);

        assert_eq!(x_hits.load(Ordering::SeqCst), 2);
        assert_eq!(y_hits.load(Ordering::SeqCst), 0);
        assert_eq!(kernel.irq_reservations(1), 2);
        assert_eq!(eoi.count(1), 2);
    }

    #[test]
    fn one_shot_heads_are_served_in_order() {
        let kernel = booted();
        kernel.irq_setup(5, Arc::new(Eoi::default())).unwrap();

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for tag in 0..3_usize {
            let order = Arc::clone(&order);
            let device = Arc::new(move |_: &Kernel<TestMachine>, line: usize, data: usize| {
                order.lock().unwrap().push((line, data, tag));
            });
            kernel.irq_reserve(5, device, true, tag * 10).unwrap();
        }

        for _ in 0..4 {
            kernel.handle_interrupt(5);
        }
        assert_eq!(*order.lock().unwrap(), [(5, 0, 0), (5, 10, 1), (5, 20, 2)]);
        assert_eq!(kernel.irq_reservations(5), 0);
    }

    #[test]
    fn spurious_interrupts_are_not_acknowledged() {
        let kernel = booted();
        let eoi = Arc::new(Eoi::default());
        kernel.irq_setup(2, eoi.clone()).unwrap();
        kernel.handle_interrupt(3);
        kernel.handle_interrupt(99);
        kernel.handle_interrupt(2);
        assert_eq!(eoi.count(2), 1);
        assert_eq!(eoi.count(3), 0);
    }

    #[test]
    fn timer_line_ticks() {
        let kernel = booted();
        let eoi = Arc::new(Eoi::default());
        kernel.irq_setup(0, eoi.clone()).unwrap();
        for _ in 0..3 {
            kernel.handle_interrupt(0);
        }
        assert_eq!(kernel.ticks(), 3);
        assert_eq!(eoi.count(0), 3);
        assert_eq!(kernel.current_pid(), Some(Pid::INIT));
    }

    #[test]
    fn handler_may_rearm_its_line() {
        let kernel = booted();
        kernel.irq_setup(4, Arc::new(Eoi::default())).unwrap();
        let device = Arc::new(|k: &Kernel<TestMachine>, line: usize, data: usize| {
            if data < 2 {
                let again = Arc::new(|_: &Kernel<TestMachine>, _: usize, _: usize| {});
                k.irq_reserve(line, again, true, data + 1).unwrap();
            }
        });
        kernel.irq_reserve(4, device, true, 0).unwrap();
        kernel.handle_interrupt(4);
        assert_eq!(kernel.irq_reservations(4), 1);
    }

    #[test]
    fn owner_release_drops_only_its_reservations() {
        let kernel = booted();
        kernel.irq_setup(1, Arc::new(Eoi::default())).unwrap();
        let (_, a) = counter();
        let (_, b) = counter();
        kernel.irq_reserve(1, a, false, 0).unwrap();
        kernel.irq_reserve(1, b, false, 0).unwrap();

        assert_eq!(kernel.irq_release_owner(Pid::new(7)), 0);
        assert_eq!(kernel.irq_release_owner(Pid::INIT), 2);
        assert_eq!(kernel.irq_reservations(1), 0);
    }
}
