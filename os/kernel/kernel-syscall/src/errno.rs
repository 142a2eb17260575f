use core::fmt;

/// A POSIX-style error number as seen by user space.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(u64);

impl Errno {
    pub const ENOENT: Self = Self(2);
    pub const ESRCH: Self = Self(3);
    pub const E2BIG: Self = Self(7);
    pub const EBADF: Self = Self(9);
    pub const ECHILD: Self = Self(10);
    pub const EAGAIN: Self = Self(11);
    pub const ENOMEM: Self = Self(12);
    pub const EFAULT: Self = Self(14);
    pub const EINVAL: Self = Self(22);
    pub const EMFILE: Self = Self(24);
    pub const ENOSYS: Self = Self(38);
    pub const EMSGSIZE: Self = Self(90);

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Symbolic name, if this is one of the codes the kernel produces.
    #[must_use]
    pub const fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            2 => "ENOENT",
            3 => "ESRCH",
            7 => "E2BIG",
            9 => "EBADF",
            10 => "ECHILD",
            11 => "EAGAIN",
            12 => "ENOMEM",
            14 => "EFAULT",
            22 => "EINVAL",
            24 => "EMFILE",
            38 => "ENOSYS",
            90 => "EMSGSIZE",
            _ => return None,
        })
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Errno({})", self.0),
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
