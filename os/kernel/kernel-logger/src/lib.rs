//! # Kernel logging backend
//!
//! A [`log::Log`] implementation for `no_std` kernels. Records are filtered by
//! level, formatted as `"[LEVEL] target: message\n"` without allocating,
//! and handed to a [`LogSink`].
//!
//! ## Sinks
//!
//! * [`QemuSink`] (feature `qemu`, `x86_64` only): writes every byte to
//!   QEMU's debug console on I/O port `0x402`. Run the guest with
//!   `-debugcon stdio` to see the output.
//! * Anything implementing [`LogSink`]; the hosted machine uses one that
//!   forwards to the test harness' standard error.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use core::fmt;
//! use kernel_logger::{KernelLogger, LogSink};
//! use log::{LevelFilter, info};
//!
//! struct Discard;
//!
//! impl LogSink for Discard {
//!     fn write_line(&self, _line: fmt::Arguments<'_>) {}
//! }
//!
//! static LOGGER: KernelLogger<Discard> = KernelLogger::new(LevelFilter::Debug, Discard);
//!
//! LOGGER.init().expect("logger initialization");
//! info!("scheduler enabled");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::{KernelLogger, LogSink};

#[cfg(all(feature = "qemu", target_arch = "x86_64"))]
pub use qemu::QemuSink;

#[cfg(all(feature = "qemu", target_arch = "x86_64"))]
mod qemu {
    use crate::LogSink;
    use core::fmt::{self, Write};

    /// The port number for QEMU's debug port.
    const QEMU_DEBUG_PORT: u16 = 0x402;

    /// Writes to QEMU's debug console.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct QemuSink;

    /// Write to QEMU's port.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    unsafe fn outb(port: u16, val: u8) {
        unsafe {
            core::arch::asm!(
            "out dx, al",
            in("dx") port,
            in("al") val,
            options(nomem, preserves_flags)
            );
        }
    }

    struct Port;

    impl Write for Port {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                unsafe { outb(QEMU_DEBUG_PORT, b) }
            }
            Ok(())
        }
    }

    impl LogSink for QemuSink {
        fn write_line(&self, line: fmt::Arguments<'_>) {
            // Best-effort; a failing debug port has nowhere to report to.
            let _ = fmt::write(&mut Port, line);
        }
    }
}
