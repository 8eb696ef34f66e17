//! `log` backend for the kernel console.
//!
//! Records are formatted as `[LEVEL] target: message` into any
//! [`core::fmt::Write`] sink (a UART, the CGA buffer, a host string). The
//! sink sits behind a spin lock so lines from different CPUs don't
//! interleave.

use core::fmt::Write;
use kernel_sync::SpinLock;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

pub struct KernelLogger<W> {
    max_level: LevelFilter,
    sink: SpinLock<W>,
}

impl<W: Write + Send> KernelLogger<W> {
    #[must_use]
    pub const fn new(max_level: LevelFilter, sink: W) -> Self {
        Self {
            max_level,
            sink: SpinLock::named("cons", sink),
        }
    }

    /// Install as the global logger. Call this once during early init.
    ///
    /// # Errors
    /// Fails if another logger is already installed.
    pub fn init(&'static self) -> Result<(), SetLoggerError>
    where
        W: 'static,
    {
        log::set_logger(self)?;
        log::set_max_level(self.max_level);
        Ok(())
    }

    /// Run `f` on the sink, e.g. to drain a buffered console.
    pub fn with_sink<R>(&self, f: impl FnOnce(&mut W) -> R) -> R {
        self.sink.with_lock(f)
    }
}

impl<W: Write + Send> Log for KernelLogger<W> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Format: "[LEVEL] target: message\n"
        let mut sink = self.sink.lock();
        let _ = writeln!(sink, "[{}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {
        // the console is unbuffered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;
    use log::Level;

    fn emit(logger: &KernelLogger<String>, level: Level, msg: core::fmt::Arguments<'_>) {
        logger.log(
            &Record::builder()
                .level(level)
                .target("kernel::trap")
                .args(msg)
                .build(),
        );
    }

    #[test]
    fn formats_level_and_target() {
        let logger = KernelLogger::new(LevelFilter::Info, String::new());
        emit(&logger, Level::Error, format_args!("pid {} {}: boom", 3, "sh"));
        logger.with_sink(|s| assert_eq!(s.as_str(), "[ERROR] kernel::trap: pid 3 sh: boom\n"));
    }

    #[test]
    fn drops_records_above_max_level() {
        let logger = KernelLogger::new(LevelFilter::Warn, String::new());
        emit(&logger, Level::Debug, format_args!("noise"));
        emit(&logger, Level::Warn, format_args!("kept"));
        logger.with_sink(|s| assert_eq!(s.as_str(), "[WARN] kernel::trap: kept\n"));
    }
}
