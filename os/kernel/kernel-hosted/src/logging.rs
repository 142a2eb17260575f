use core::fmt;
use kernel_logger::{KernelLogger, LogSink};
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

/// Forwards log lines to the process' standard error.
struct Stderr;

impl LogSink for Stderr {
    fn write_line(&self, line: fmt::Arguments<'_>) {
        // Nowhere to report a failing stderr to.
        let _ = std::io::stderr().lock().write_fmt(line);
    }
}

static LOGGER: KernelLogger<Stderr> = KernelLogger::new(LevelFilter::Trace, Stderr);

/// Installs the logger on first use and applies `level` to every boot.
pub fn install(level: LevelFilter) {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if LOGGER.init().is_err() {
            log::warn!("Another logger is already installed");
        }
    });
    log::set_max_level(level);
}
