// TGD - STDERR LOGGER
// log facade backend for the daemon. One line per record:
//   [+secs.millis] LEVEL message
// Time is monotonic since the logger was installed.

use std::fmt;
use std::io::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::engine::clock::clock_ns;
use crate::error::{Result, TgdError};

pub struct StderrLogger {
    level: LevelFilter,
    start_ns: u64,
}

impl StderrLogger {
    pub fn new(level: LevelFilter) -> Self { StderrLogger { level, start_ns: clock_ns() } }
}

pub fn format_line(elapsed_ns: u64, level: Level, args: &fmt::Arguments<'_>) -> String {
    let ms = elapsed_ns / 1_000_000;
    format!("[+{}.{:03}] {:<5} {}", ms / 1000, ms % 1000, level, args)
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool { metadata.level() <= self.level }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(clock_ns().saturating_sub(self.start_ns), record.level(), record.args());
        let _ = writeln!(std::io::stderr().lock(), "{}", line);
    }

    fn flush(&self) { let _ = std::io::stderr().flush(); }
}

/// Install the process-wide logger. Fails if one is already set.
pub fn init(level: LevelFilter) -> Result<()> {
    log::set_boxed_logger(Box::new(StderrLogger::new(level))).map_err(|_| TgdError::AlreadyRegistered)?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_layout() {
        let line = format_line(3_042_000_000, Level::Warn, &format_args!("[TGD-LINK] {} up", "terra0"));
        assert_eq!(line, "[+3.042] WARN  [TGD-LINK] terra0 up");
        let line = format_line(999_999, Level::Error, &format_args!("x"));
        assert_eq!(line, "[+0.000] ERROR x");
    }

    #[test]
    fn level_filter_applies() {
        let l = StderrLogger::new(LevelFilter::Info);
        assert!(l.enabled(&Metadata::builder().level(Level::Warn).build()));
        assert!(!l.enabled(&Metadata::builder().level(Level::Debug).build()));
    }
}
