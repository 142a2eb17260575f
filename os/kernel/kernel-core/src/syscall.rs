//! Syscall dispatch: trapped registers are decoded into a [`Syscall`],
//! run against the kernel, and the result folded back into `rax`.

use crate::kernel::Kernel;
use crate::machine::Machine;
use crate::process::Pid;
use core::{ptr, slice};
use kernel_syscall::{Errno, SyscallFrame, Sysno, encode_result};
use log::trace;

/// A system call as decoded by the architecture's entry path.
///
/// Out-parameters borrow the caller's memory; the entry code is
/// responsible for validating user pointers before building these.
#[derive(Debug)]
pub enum Syscall<'a> {
    Fork,
    Exit(i32),
    Waitpid {
        pid: Pid,
        status: &'a mut i32,
    },
    Send {
        target: Pid,
        payload: &'a [u8],
    },
    /// Copies at most `buf.len()` bytes; returns the full message size.
    Receive {
        buf: &'a mut [u8],
        sender: &'a mut Pid,
        wait: bool,
    },
    Getpid,
    WaitAny,
}

impl<'a> Syscall<'a> {
    /// Decodes the registers of a trapped call.
    ///
    /// Exit statuses are sign-extended 32-bit values; pointer arguments
    /// come with their byte length where they describe a buffer.
    ///
    /// # Errors
    /// - [`Errno::ENOSYS`] for unknown call numbers.
    /// - [`Errno::EFAULT`] for null or misaligned pointers.
    /// - [`Errno::EINVAL`] for statuses or lengths out of range.
    ///
    /// # Safety
    /// Every pointer argument must be valid for the access its call makes
    /// (reads for payloads, writes for out-parameters) for `'a`, and must
    /// not alias any other live reference.
    pub unsafe fn decode(frame: &SyscallFrame) -> Result<Self, Errno> {
        Ok(match frame.sysno()? {
            Sysno::Fork => Self::Fork,
            Sysno::Exit => Self::Exit(
                i32::try_from(frame.rdi.cast_signed()).map_err(|_| Errno::EINVAL)?,
            ),
            Sysno::Waitpid => Self::Waitpid {
                pid: Pid::new(frame.rdi),
                status: unsafe { user_mut(frame.rsi)? },
            },
            Sysno::Send => Self::Send {
                target: Pid::new(frame.rdi),
                payload: unsafe { user_bytes(frame.rsi, frame.rdx)? },
            },
            Sysno::Receive => Self::Receive {
                buf: unsafe { user_bytes_mut(frame.rdi, frame.rsi)? },
                sender: unsafe { user_mut(frame.rdx)? },
                wait: frame.r10 != 0,
            },
            Sysno::Getpid => Self::Getpid,
            Sysno::WaitAny => Self::WaitAny,
        })
    }

    #[must_use]
    pub const fn sysno(&self) -> Sysno {
        match self {
            Self::Fork => Sysno::Fork,
            Self::Exit(_) => Sysno::Exit,
            Self::Waitpid { .. } => Sysno::Waitpid,
            Self::Send { .. } => Sysno::Send,
            Self::Receive { .. } => Sysno::Receive,
            Self::Getpid => Sysno::Getpid,
            Self::WaitAny => Sysno::WaitAny,
        }
    }
}

impl<M: Machine> Kernel<M> {
    /// Runs `call` on behalf of the current process.
    ///
    /// # Errors
    /// The [`Errno`] of the failed operation. `WaitAny` is not supported
    /// and fails with [`Errno::ENOSYS`].
    pub fn dispatch(&self, call: Syscall<'_>) -> Result<u64, Errno> {
        trace!("syscall {}", call.sysno().name());
        match call {
            Syscall::Fork => Ok(self.fork()?.as_u64()),
            Syscall::Exit(status) => self.exit(status),
            Syscall::Waitpid { pid, status } => {
                let (reaped, code) = self.waitpid(pid)?;
                *status = code;
                Ok(reaped.as_u64())
            }
            Syscall::Send { target, payload } => {
                self.send(target, payload)?;
                Ok(0)
            }
            Syscall::Receive { buf, sender, wait } => {
                let (from, size) = self.receive_into(buf, wait)?;
                *sender = from;
                Ok(size as u64)
            }
            Syscall::Getpid => self
                .current_pid()
                .map(Pid::as_u64)
                .ok_or(Errno::ESRCH),
            Syscall::WaitAny => Err(Errno::ENOSYS),
        }
    }

    /// [`dispatch`](Self::dispatch) folded into a single return register.
    pub fn syscall(&self, call: Syscall<'_>) -> u64 {
        encode_result(self.dispatch(call))
    }

    /// Body of the syscall trap: decodes `frame`, runs the call and puts
    /// the result into `frame.rax`.
    ///
    /// # Safety
    /// The pointer arguments in `frame` must satisfy [`Syscall::decode`].
    pub unsafe fn handle_syscall(&self, frame: &mut SyscallFrame) {
        // Safety: forwarded to the caller.
        let result = unsafe { Syscall::decode(frame) }.and_then(|call| self.dispatch(call));
        if let Err(errno) = result {
            trace!("syscall {:#x} failed: {errno}", frame.rax);
        }
        frame.set_result(result);
    }
}

fn user_ptr<T>(addr: u64) -> Result<*mut T, Errno> {
    let addr = usize::try_from(addr).map_err(|_| Errno::EFAULT)?;
    let ptr = ptr::with_exposed_provenance_mut::<T>(addr);
    if ptr.is_null() || !ptr.is_aligned() {
        return Err(Errno::EFAULT);
    }
    Ok(ptr)
}

fn user_len(len: u64) -> Result<usize, Errno> {
    usize::try_from(len)
        .ok()
        .filter(|len| isize::try_from(*len).is_ok())
        .ok_or(Errno::EINVAL)
}

unsafe fn user_mut<'a, T>(addr: u64) -> Result<&'a mut T, Errno> {
    // Safety: non-null and aligned; validity is the caller's contract.
    user_ptr(addr).map(|ptr| unsafe { &mut *ptr })
}

unsafe fn user_bytes<'a>(addr: u64, len: u64) -> Result<&'a [u8], Errno> {
    match user_len(len)? {
        0 => Ok(&[]),
        len => user_ptr::<u8>(addr).map(|ptr| unsafe { slice::from_raw_parts(ptr, len) }),
    }
}

unsafe fn user_bytes_mut<'a>(addr: u64, len: u64) -> Result<&'a mut [u8], Errno> {
    match user_len(len)? {
        0 => Ok(&mut []),
        len => user_ptr::<u8>(addr).map(|ptr| unsafe { slice::from_raw_parts_mut(ptr, len) }),
    }
}

#[cfg(test)]
mod tests {
    use super::Syscall;
    use crate::Pid;
    use crate::testing::{booted, child_of_init};
    use kernel_syscall::{Errno, SyscallFrame, Sysno, decode_result};

    fn addr<T>(ptr: *mut T) -> u64 {
        u64::try_from(ptr.expose_provenance()).unwrap()
    }

    #[test]
    fn getpid_reports_the_running_process() {
        let kernel = booted();
        assert_eq!(kernel.dispatch(Syscall::Getpid), Ok(1));
    }

    #[test]
    fn fork_returns_the_child_pid_to_the_parent() {
        let kernel = booted();
        assert_eq!(kernel.dispatch(Syscall::Fork), Ok(2));
        assert_eq!(kernel.ready_pids(), [Pid::new(2)]);
    }

    #[test]
    fn errors_map_to_errno() {
        let kernel = booted();
        let mut status = 0;
        assert_eq!(
            kernel.dispatch(Syscall::Waitpid {
                pid: Pid::new(9),
                status: &mut status
            }),
            Err(Errno::ECHILD)
        );
        assert_eq!(
            kernel.dispatch(Syscall::Send {
                target: Pid::new(9),
                payload: b"x"
            }),
            Err(Errno::ESRCH)
        );

        let mut buf = [0; 8];
        let mut sender = Pid::KERNEL;
        assert_eq!(
            kernel.dispatch(Syscall::Receive {
                buf: &mut buf,
                sender: &mut sender,
                wait: false
            }),
            Err(Errno::EAGAIN)
        );
        assert_eq!(kernel.dispatch(Syscall::WaitAny), Err(Errno::ENOSYS));
    }

    #[test]
    fn receive_fills_out_parameters() {
        let kernel = booted();
        let child = child_of_init(&kernel);
        kernel.send_from(child, Pid::INIT, b"ping").unwrap();

        let mut buf = [0; 8];
        let mut sender = Pid::KERNEL;
        let size = kernel.dispatch(Syscall::Receive {
            buf: &mut buf,
            sender: &mut sender,
            wait: false,
        });
        assert_eq!(size, Ok(4));
        assert_eq!(sender, child);
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn raw_results_carry_negated_errno() {
        let kernel = booted();
        let raw = kernel.syscall(Syscall::WaitAny);
        assert_eq!(decode_result(raw), Err(Errno::ENOSYS));
        assert_eq!(decode_result(kernel.syscall(Syscall::Getpid)), Ok(1));
    }

    #[test]
    fn sysno_matches_the_call() {
        assert_eq!(Syscall::Exit(3).sysno(), Sysno::Exit);
        assert_eq!(Syscall::WaitAny.sysno(), Sysno::WaitAny);
    }

    #[test]
    fn unknown_numbers_are_enosys() {
        let kernel = booted();
        for rax in [0, 8, 0x8000_0000] {
            let mut frame = SyscallFrame {
                rax,
                ..SyscallFrame::default()
            };
            // Safety: no pointer arguments.
            unsafe { kernel.handle_syscall(&mut frame) };
            assert_eq!(decode_result(frame.rax), Err(Errno::ENOSYS));
        }
    }

    #[test]
    fn bad_pointers_are_efault() {
        let kernel = booted();
        let mut frame = SyscallFrame::new(Sysno::Waitpid, [2, 0, 0, 0]);
        // Safety: null is rejected before any access.
        unsafe { kernel.handle_syscall(&mut frame) };
        assert_eq!(decode_result(frame.rax), Err(Errno::EFAULT));

        let mut frame = SyscallFrame::new(Sysno::Receive, [0, 4, 0, 0]);
        // Safety: as above.
        unsafe { kernel.handle_syscall(&mut frame) };
        assert_eq!(decode_result(frame.rax), Err(Errno::EFAULT));
    }

    #[test]
    fn exit_status_must_fit_an_int() {
        let frame = SyscallFrame::new(Sysno::Exit, [1 << 40, 0, 0, 0]);
        // Safety: no pointer arguments.
        assert_eq!(unsafe { Syscall::decode(&frame) }.err(), Some(Errno::EINVAL));

        let frame = SyscallFrame::new(Sysno::Exit, [(-3_i64).cast_unsigned(), 0, 0, 0]);
        // Safety: as above.
        assert!(matches!(
            unsafe { Syscall::decode(&frame) },
            Ok(Syscall::Exit(-3))
        ));
    }

    #[test]
    fn mailbox_through_registers() {
        let kernel = booted();
        let mut payload = *b"hey";
        let mut frame = SyscallFrame::new(Sysno::Send, [1, addr(payload.as_mut_ptr()), 3, 0]);
        // Safety: the payload outlives the call.
        unsafe { kernel.handle_syscall(&mut frame) };
        assert_eq!(decode_result(frame.rax), Ok(0));

        let mut buf = [0_u8; 8];
        let mut sender = Pid::KERNEL;
        let mut frame = SyscallFrame::new(
            Sysno::Receive,
            [addr(buf.as_mut_ptr()), 8, addr(&raw mut sender), 0],
        );
        // Safety: both out-parameters outlive the call.
        unsafe { kernel.handle_syscall(&mut frame) };
        assert_eq!(decode_result(frame.rax), Ok(3));
        assert_eq!(sender, Pid::INIT);
        assert_eq!(&buf[..3], b"hey");
    }

    #[test]
    fn waitpid_through_registers() {
        let kernel = booted();
        let child = child_of_init(&kernel);
        {
            let mut tables = kernel.lock_tables();
            tables.ready.remove(child);
            let p = tables.processes.get_mut(&child).unwrap();
            p.status = -2;
            p.state = crate::process::RunState::Terminated;
        }

        let mut status = 0_i32;
        let mut frame =
            SyscallFrame::new(Sysno::Waitpid, [child.as_u64(), addr(&raw mut status), 0, 0]);
        // Safety: `status` outlives the call.
        unsafe { kernel.handle_syscall(&mut frame) };
        assert_eq!(decode_result(frame.rax), Ok(child.as_u64()));
        assert_eq!(status, -2);
    }
}
