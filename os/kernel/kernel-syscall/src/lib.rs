//! # System call ABI
//!
//! Numbers and error codes shared by the kernel's syscall dispatcher and
//! user-space wrappers. A syscall returns a single `u64`: values in the
//! top 4095 of the range are negated error numbers, everything else is a
//! successful result.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod errno;

pub use errno::Errno;

/// Syscall numbers, passed in the first argument register.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sysno {
    /// Duplicate the calling process; `0` in the child, the child PID in the parent.
    Fork = 1,
    /// Terminate the calling process with a status. Never returns.
    Exit = 2,
    /// Wait for a specific child to terminate and reap it.
    Waitpid = 3,
    /// Post a message into another process' inbox.
    Send = 4,
    /// Take the oldest message from the caller's inbox.
    Receive = 5,
    /// PID of the calling process.
    Getpid = 6,
    /// Wait for any child. Reserved; always fails with [`Errno::ENOSYS`].
    WaitAny = 7,
}

impl Sysno {
    pub const ALL: [Self; 7] = [
        Self::Fork,
        Self::Exit,
        Self::Waitpid,
        Self::Send,
        Self::Receive,
        Self::Getpid,
        Self::WaitAny,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Fork => "fork",
            Self::Exit => "exit",
            Self::Waitpid => "waitpid",
            Self::Send => "send",
            Self::Receive => "receive",
            Self::Getpid => "getpid",
            Self::WaitAny => "wait_any",
        }
    }
}

impl TryFrom<u64> for Sysno {
    type Error = Errno;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|s| *s as u64 == value)
            .ok_or(Errno::ENOSYS)
    }
}

/// Argument registers of a trapped syscall, as the entry stub saved them.
///
/// The number arrives in `rax` and the result goes back there; arguments
/// follow the System V order with `r10` standing in for `rcx`, which the
/// `syscall` instruction clobbers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallFrame {
    pub rax: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub r10: u64,
}

impl SyscallFrame {
    /// A frame as user space would set it up for `sysno`.
    #[must_use]
    pub const fn new(sysno: Sysno, args: [u64; 4]) -> Self {
        Self {
            rax: sysno as u64,
            rdi: args[0],
            rsi: args[1],
            rdx: args[2],
            r10: args[3],
        }
    }

    /// The requested call.
    ///
    /// # Errors
    /// [`Errno::ENOSYS`] for numbers the kernel does not know.
    pub fn sysno(&self) -> Result<Sysno, Errno> {
        Sysno::try_from(self.rax)
    }

    /// Stores the outcome in `rax`, where user space expects it.
    pub const fn set_result(&mut self, result: Result<u64, Errno>) {
        self.rax = encode_result(result);
    }
}

/// Largest error number representable in a return value.
pub const MAX_ERRNO: u64 = 4095;

/// Folds a syscall outcome into the single return register.
#[must_use]
pub const fn encode_result(result: Result<u64, Errno>) -> u64 {
    match result {
        Ok(value) => value,
        Err(errno) => errno.as_raw().wrapping_neg(),
    }
}

/// Inverse of [`encode_result`], as a user-space wrapper would use it.
///
/// # Errors
/// Returns the [`Errno`] if `raw` lies in the error range.
pub const fn decode_result(raw: u64) -> Result<u64, Errno> {
    if raw > u64::MAX - MAX_ERRNO {
        Err(Errno::from_raw(raw.wrapping_neg()))
    } else {
        Ok(raw)
    }
}
