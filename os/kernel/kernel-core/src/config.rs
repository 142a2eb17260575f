//! Boot-time tunables of the process core.

/// Default number of interrupt lines in the dispatch table.
pub const DEFAULT_IRQ_LINES: usize = 16;

/// Line of the periodic scheduler tick (the PIT on a PC).
pub const DEFAULT_TIMER_LINE: usize = 0;

/// Kernel stack of every forked process (16 KiB).
pub const DEFAULT_KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Open file descriptors per process.
pub const DEFAULT_MAX_FDS: usize = 32;

/// Largest payload accepted by `send`.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4096;

/// Configuration handed to [`Kernel::new`](crate::Kernel::new).
///
/// ```
/// use kernel_core::KernelConfig;
///
/// const CONFIG: KernelConfig = KernelConfig::new()
///     .with_irq_lines(24)
///     .with_timer_line(2);
///
/// assert_eq!(CONFIG.irq_lines, 24);
/// assert_eq!(CONFIG.max_fds, 32);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of IRQ lines `irq_setup` accepts.
    pub irq_lines: usize,
    /// Line whose interrupts drive the scheduler.
    pub timer_line: usize,
    /// Bytes of zeroed kernel stack allocated per `fork`.
    pub kernel_stack_size: usize,
    /// Capacity of each file-descriptor table.
    pub max_fds: usize,
    /// Upper bound for message payloads, in bytes.
    pub max_message_size: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            irq_lines: DEFAULT_IRQ_LINES,
            timer_line: DEFAULT_TIMER_LINE,
            kernel_stack_size: DEFAULT_KERNEL_STACK_SIZE,
            max_fds: DEFAULT_MAX_FDS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    #[must_use]
    pub const fn with_irq_lines(mut self, lines: usize) -> Self {
        self.irq_lines = lines;
        self
    }

    #[must_use]
    pub const fn with_timer_line(mut self, line: usize) -> Self {
        self.timer_line = line;
        self
    }

    #[must_use]
    pub const fn with_kernel_stack_size(mut self, bytes: usize) -> Self {
        self.kernel_stack_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_max_fds(mut self, fds: usize) -> Self {
        self.max_fds = fds;
        self
    }

    #[must_use]
    pub const fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }
}
