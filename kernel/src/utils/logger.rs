/*
 * Scheduler Logging
 *
 * A minimal `log` backend: every record at or above the configured level is
 * written to standard error as "[LEVEL] message".
 *
 * Why this is important:
 * - The scheduler reports lifecycle events (CPU bring-up, load balancer
 *   start) at info level, migrations at debug level and every switch and
 *   wakeup at trace level
 * - A kernel thread that panics on the hosted machine is reported at error
 *   level before the panic is handed to `run_main`
 */

use std::io::Write;

use log::{LevelFilter, Metadata, Record, SetLoggerError};

/// Logger writing to standard error
struct SchedLogger;

impl log::Log for SchedLogger {
    /// Checks the record against the global maximum level.
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(std::io::stderr().lock(), "[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: SchedLogger = SchedLogger;

/// Installs the logger with the given maximum level.
///
/// # Errors
///
/// Fails if a logger was already installed; the maximum level is updated
/// anyway, so tests may call this repeatedly.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_max_level(level);
    log::set_logger(&LOGGER)
}
