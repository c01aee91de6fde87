//! Kernel logging facility
//!
//! Provides thread-safe logging for the kernel through the `log` crate.
//! Records are formatted as "[LEVEL] message" and handed to a sink the
//! embedding kernel registers once at boot (serial, VGA, anything that
//! can take a line). Before a sink exists, records are dropped.

use log::{LevelFilter, Log, Metadata, Record};
use spin::{Mutex, Once};

/// Global logger instance available throughout the kernel
pub static LOGGER: Logger = Logger::new();

static SINK: Once<&'static dyn LogSink> = Once::new();

/// Destination for formatted log lines.
pub trait LogSink: Sync {
    fn write_line(&self, level: log::Level, args: core::fmt::Arguments<'_>);
}

/// Registers the output device. Only the first call takes effect.
pub fn set_sink(sink: &'static dyn LogSink) {
    SINK.call_once(|| sink);
}

/// Thread-safe logger implementation
pub struct Logger {
    inner: Mutex<()>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub const fn new() -> Logger {
        Logger {
            inner: Mutex::new(()),
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _guard = self.inner.lock();
            if let Some(sink) = SINK.get() {
                sink.write_line(record.level(), *record.args());
            }
        }
    }

    /// Flush buffered logs (no-op in this implementation)
    fn flush(&self) {}
}

/// Initializes the logging system
///
/// Sets different log levels for debug/release builds:
/// - Debug builds: `LevelFilter::Debug`
/// - Release builds: `LevelFilter::Info`
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| {
            log::set_max_level(
                #[cfg(debug_assertions)]
                LevelFilter::Debug,
                #[cfg(not(debug_assertions))]
                LevelFilter::Info,
            )
        })
        .expect("Logger initialization failed");
}
