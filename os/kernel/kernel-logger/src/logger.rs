use core::fmt;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Destination for formatted log lines.
pub trait LogSink: Send + Sync {
    /// Emits one complete line, including the trailing newline.
    fn write_line(&self, line: fmt::Arguments<'_>);
}

/// Level-filtering logger writing `"[LEVEL] target: message\n"` lines.
pub struct KernelLogger<S> {
    max_level: LevelFilter,
    sink: S,
}

impl<S: LogSink> KernelLogger<S> {
    #[must_use]
    pub const fn new(max_level: LevelFilter, sink: S) -> Self {
        Self { max_level, sink }
    }

    #[must_use]
    pub const fn max_level(&self) -> LevelFilter {
        self.max_level
    }

    pub const fn sink(&self) -> &S {
        &self.sink
    }

    /// Installs this logger as the global `log` backend. Call once during early init.
    ///
    /// # Errors
    /// Fails if a logger was already installed.
    pub fn init(&'static self) -> Result<(), SetLoggerError>
    where
        S: 'static,
    {
        log::set_logger(self)?;
        log::set_max_level(self.max_level);
        Ok(())
    }
}

impl<S: LogSink> Log for KernelLogger<S> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // One call per record so a locking sink keeps lines intact.
        self.sink.write_line(format_args!(
            "[{}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;
    use std::fmt::Write;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture(Mutex<String>);

    impl LogSink for Capture {
        fn write_line(&self, line: fmt::Arguments<'_>) {
            self.0.lock().unwrap().write_fmt(line).unwrap();
        }
    }

    fn emit(logger: &KernelLogger<Capture>, level: Level, msg: &str) {
        logger.log(
            &Record::builder()
                .level(level)
                .target("kernel_core::scheduler")
                .args(format_args!("{msg}"))
                .build(),
        );
    }

    #[test]
    fn formats_level_target_and_message() {
        let logger = KernelLogger::new(LevelFilter::Trace, Capture::default());
        emit(&logger, Level::Info, "switch 1 -> 2");
        assert_eq!(
            *logger.sink().0.lock().unwrap(),
            "[INFO] kernel_core::scheduler: switch 1 -> 2\n"
        );
    }

    #[test]
    fn filters_below_max_level() {
        let logger = KernelLogger::new(LevelFilter::Warn, Capture::default());
        emit(&logger, Level::Debug, "dropped");
        emit(&logger, Level::Error, "kept");
        let out = logger.sink().0.lock().unwrap();
        assert!(!out.contains("dropped"));
        assert!(out.contains("[ERROR]"));
        assert_eq!(logger.max_level(), LevelFilter::Warn);
    }

    #[test]
    fn enabled_honours_metadata_level() {
        let logger = KernelLogger::new(LevelFilter::Info, Capture::default());
        let debug = Metadata::builder().level(Level::Debug).build();
        let info = Metadata::builder().level(Level::Info).build();
        assert!(!logger.enabled(&debug));
        assert!(logger.enabled(&info));
    }
}
