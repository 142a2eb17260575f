//! # Hosted machine
//!
//! Runs the process core inside an ordinary host process so scheduling,
//! blocking and IPC can be exercised with `cargo test`.
//!
//! [`Host::boot`] turns the calling thread into init (PID 1). Each fork
//! starts a new thread that waits until the scheduler dispatches it and
//! then runs the [`ProcessBody`] registered for that fork; its return
//! value becomes the exit status.
//!
//! ```no_run
//! use kernel_hosted::{Host, HostConfig};
//!
//! let host = Host::boot(HostConfig::default()).expect("boot");
//! let child = host.spawn(|kernel| {
//!     kernel.send(kernel_core::Pid::INIT, b"hello").expect("send");
//!     3
//! }).expect("fork");
//!
//! assert_eq!(host.waitpid(child), Ok((child, 3)));
//! assert_eq!(host.receive(false).map(|m| m.into_payload()), Ok(b"hello".to_vec()));
//! ```

mod logging;
mod machine;

pub use machine::{
    HostContext, HostFile, HostKernel, HostMachine, HostPic, HostSpace, IrqRaiser, PANIC_STATUS,
    ProcessBody,
};

use kernel_core::{BootError, ForkError, InitProcess, IrqError, Kernel, KernelConfig, Pid};
use log::LevelFilter;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

/// Size of init's address space; every fork copies it.
pub const INIT_SPACE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct HostConfig {
    pub kernel: KernelConfig,
    pub log_level: LevelFilter,
    /// How long the CPU may idle with nothing pending before it is
    /// considered deadlocked.
    pub idle_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            kernel: KernelConfig::new(),
            log_level: LevelFilter::Warn,
            idle_timeout: Duration::from_secs(5),
        }
    }
}

impl HostConfig {
    #[must_use]
    pub const fn with_kernel(mut self, kernel: KernelConfig) -> Self {
        self.kernel = kernel;
        self
    }

    #[must_use]
    pub const fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    #[must_use]
    pub const fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Boot(#[from] BootError),
    #[error("cannot set up the timer line: {0}")]
    Timer(#[from] IrqError),
}

/// A booted kernel whose init process is the thread that booted it.
pub struct Host {
    kernel: Arc<HostKernel>,
    pic: Arc<HostPic>,
}

impl Host {
    /// Boots a kernel on the calling thread and wires the timer line to a
    /// [`HostPic`].
    ///
    /// # Errors
    /// [`HostError::Timer`] if the configured timer line does not exist.
    pub fn boot(config: HostConfig) -> Result<Self, HostError> {
        logging::install(config.log_level);

        let kernel = Arc::new(Kernel::new(
            HostMachine::new(config.idle_timeout),
            config.kernel,
        ));
        kernel.machine().attach(&kernel);

        let address_space = kernel.machine().new_address_space(INIT_SPACE_BYTES);
        kernel.bootstrap(InitProcess {
            context: HostContext::boot(),
            address_space,
            cwd: Some(HostFile::open("/")),
        })?;

        let pic = Arc::new(HostPic::default());
        kernel.irq_setup(config.kernel.timer_line, pic.clone())?;
        Ok(Self { kernel, pic })
    }

    #[must_use]
    pub fn kernel(&self) -> &HostKernel {
        &self.kernel
    }

    /// A handle that keeps the kernel alive, e.g. for a device thread.
    #[must_use]
    pub fn shared(&self) -> Arc<HostKernel> {
        Arc::clone(&self.kernel)
    }

    /// The controller of the timer line. Tests may set up further lines
    /// with it.
    #[must_use]
    pub fn pic(&self) -> Arc<HostPic> {
        Arc::clone(&self.pic)
    }

    /// Forks the running process; the child runs `body`.
    ///
    /// # Errors
    /// As [`Kernel::fork`].
    pub fn spawn(
        &self,
        body: impl FnOnce(&HostKernel) -> i32 + Send + 'static,
    ) -> Result<Pid, ForkError> {
        spawn(&self.kernel, body)
    }

    /// Fires the timer on the running process.
    pub fn tick(&self) {
        tick(&self.kernel);
    }
}

impl Deref for Host {
    type Target = HostKernel;

    fn deref(&self) -> &HostKernel {
        &self.kernel
    }
}

/// [`Host::spawn`] for code running inside a process body.
///
/// # Errors
/// As [`Kernel::fork`].
pub fn spawn(
    kernel: &HostKernel,
    body: impl FnOnce(&HostKernel) -> i32 + Send + 'static,
) -> Result<Pid, ForkError> {
    kernel.machine().on_next_fork(Box::new(body));
    kernel
        .fork()
        .inspect_err(|_| kernel.machine().forget_next_fork())
}

/// Raises the timer line and services it right away: a preemption point.
pub fn tick(kernel: &HostKernel) {
    kernel.machine().raise(kernel.config().timer_line);
    kernel.machine().service_interrupts();
}
