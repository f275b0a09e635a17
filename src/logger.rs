//! Default Sarus logger

use std::env;
use std::io::{stderr, Write};
use std::path::PathBuf;
use std::{
    fs::{File, OpenOptions},
    str::FromStr,
};

use anyhow::Result;
use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

/// Public global variables to access logger and logfile
pub static SARUS_LOGGER: OnceCell<SarusLogger> = OnceCell::new();
pub static LOG_FILE: OnceCell<Option<File>> = OnceCell::new();

/// Environment variable consulted when no level is requested on the command line
pub const LOG_LEVEL_ENV: &str = "SARUS_LOG_LEVEL";

/// Only warnings and errors are printed unless more is asked for
const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Warn;

/// Picks the level filter: command line first, then the environment, then the default.
pub fn level_filter(requested: Option<LevelFilter>) -> LevelFilter {
    if let Some(level) = requested {
        return level;
    }
    env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|s| LevelFilter::from_str(&s).ok())
        .unwrap_or(DEFAULT_LOG_LEVEL)
}

/// Initialize the logger, must be called before accessing the logger
/// Multiple parts might call this at once, but the actual initialization
/// is done only once due to use of OnceCell
pub fn init(requested: Option<LevelFilter>, log_file: Option<PathBuf>) -> Result<()> {
    let level_filter = level_filter(requested);

    let _log_file = LOG_FILE.get_or_init(|| -> Option<File> {
        let logger = SARUS_LOGGER.get_or_init(|| SarusLogger::new(level_filter.to_level()));
        log::set_logger(logger)
            .map(|()| log::set_max_level(level_filter))
            .expect("set logger failed");

        log_file.as_ref().map(|log_file_path| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(log_file_path)
                .expect("failed opening log file")
        })
    });

    Ok(())
}

/// Numeric level handed to hooks through the `com.hooks.logging.level` annotation,
/// so that their own `[hook] [LEVEL]` lines follow the verbosity of Sarus.
pub fn hook_log_level() -> u8 {
    match log::max_level() {
        LevelFilter::Off | LevelFilter::Error => 0,
        LevelFilter::Warn => 1,
        LevelFilter::Info => 2,
        LevelFilter::Debug => 3,
        LevelFilter::Trace => 4,
    }
}

/// Sarus' custom Logger
pub struct SarusLogger {
    /// Indicates level up to which logs are to be printed
    level: Option<log::Level>,
}

impl SarusLogger {
    pub fn new(level: Option<log::Level>) -> Self {
        Self { level }
    }
}

impl Log for SarusLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if let Some(level) = self.level {
            metadata.level() <= level
        } else {
            false
        }
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let log_msg = match (record.level(), record.file(), record.line()) {
                (log::Level::Debug | log::Level::Trace, Some(file), Some(line)) => format!(
                    "[{}] [sarus] [{}] [{}:{}] {}",
                    chrono::Local::now().to_rfc3339(),
                    record.level(),
                    file,
                    line,
                    record.args()
                ),
                (_, _, _) => format!(
                    "[{}] [sarus] [{}] {}",
                    chrono::Local::now().to_rfc3339(),
                    record.level(),
                    record.args()
                ),
            };

            // if log file is set, write to it, else write to stderr
            if let Some(Some(mut log_file)) = LOG_FILE.get().map(Option::as_ref) {
                let _ = writeln!(log_file, "{}", log_msg);
            } else {
                let _ = writeln!(stderr(), "{}", log_msg);
            }
        }
    }

    fn flush(&self) {
        if let Some(Some(mut log_file)) = LOG_FILE.get().map(Option::as_ref) {
            let _ = log_file.flush();
        } else {
            let _ = stderr().flush();
        }
    }
}
