//! Logging for blelink
//!
//! A `log::Log` implementation writing timestamped records to stderr and,
//! optionally, to a file. The library itself only uses the `log` macros; the
//! binary installs this logger once at startup.

use chrono::Local;
use log::{Level, LevelFilter, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Mutex, Once};

use crate::config::LogLevel;

/// Timestamp format for log entries
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Global initialization guard
static INIT_LOGGER: Once = Once::new();

/// Logger writing to stderr and an optional file
pub struct LinkLogger {
    file: Option<Mutex<File>>,
    level: LevelFilter,
    console_output: bool,
}

impl log::Log for LinkLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = Local::now().format(TIMESTAMP_FORMAT);
        let module = record.module_path().unwrap_or("<unknown>");

        if self.console_output {
            let level = match record.level() {
                Level::Error => "\x1B[31mERROR\x1B[0m",
                Level::Warn => "\x1B[33mWARN \x1B[0m",
                Level::Info => "\x1B[32mINFO \x1B[0m",
                Level::Debug => "\x1B[36mDEBUG\x1B[0m",
                Level::Trace => "\x1B[90mTRACE\x1B[0m",
            };
            let entry = format!("[{}] {} [{}] {}\n", timestamp, level, module, record.args());
            let _ = io::stderr().write_all(entry.as_bytes());
        }

        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let entry = format!(
                    "[{}] {:<5} [{}] {}\n",
                    timestamp,
                    record.level(),
                    module,
                    record.args()
                );
                let _ = file.write_all(entry.as_bytes());
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

/// Convert a configured level into a `log` filter
pub fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Error => LevelFilter::Error,
        LogLevel::Warn => LevelFilter::Warn,
        LogLevel::Info => LevelFilter::Info,
        LogLevel::Debug => LevelFilter::Debug,
        LogLevel::Trace => LevelFilter::Trace,
    }
}

/// Install the logger. Only the first call has an effect.
pub fn configure_logging(
    level: LogLevel,
    log_file: Option<PathBuf>,
    console_output: bool,
) -> Result<(), String> {
    let mut result = Ok(());

    INIT_LOGGER.call_once(|| {
        let filter = level_filter(level);

        let file = match &log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        if let Err(e) = std::fs::create_dir_all(parent) {
                            result = Err(format!("Failed to create log directory: {}", e));
                            return;
                        }
                    }
                }
                match OpenOptions::new().create(true).append(true).open(path) {
                    Ok(file) => Some(Mutex::new(file)),
                    Err(e) => {
                        result = Err(format!("Failed to open log file: {}", e));
                        return;
                    }
                }
            }
            None => None,
        };

        let logger = Box::new(LinkLogger {
            file,
            level: filter,
            console_output,
        });
        if let Err(e) = log::set_boxed_logger(logger) {
            result = Err(format!("Failed to set logger: {}", e));
            return;
        }
        log::set_max_level(filter);

        log::info!("Logging initialized at level: {}", level);
        if let Some(path) = &log_file {
            log::info!("Log file: {}", path.display());
        }
    });

    result
}

/// Console-only logging at info level
pub fn init_logger() -> Result<(), String> {
    configure_logging(LogLevel::Info, None, true)
}
