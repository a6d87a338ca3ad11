// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! File-backed logging for detached supervisors.
//!
//! The core logs through the `log` facade; supervisor-internal trace goes
//! to the `daemon` target. This sink maps the facade onto the daemon's
//! ten-level scheme and supports reopening its file, so a HUP-driven
//! `load_config` can cooperate with logrotate.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Severity levels, syslog-style plus two extensions: `Debug2` for very
/// chatty application trace and `Daemon` for supervisor-internal trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Emerg,
    Alert,
    Crit,
    Error,
    Warn,
    Notice,
    Info,
    Debug,
    Debug2,
    Daemon,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Emerg => "EMERG",
            Level::Alert => "ALERT",
            Level::Crit => "CRIT",
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Notice => "NOTICE",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Debug2 => "DEBUG2",
            Level::Daemon => "DAEMON",
        }
    }

    /// Placement of a facade record in the daemon scheme. Records on the
    /// `daemon` target are supervisor trace regardless of their facade
    /// level.
    fn from_metadata(metadata: &log::Metadata<'_>) -> Level {
        if metadata.target() == "daemon" {
            return Level::Daemon;
        }
        match metadata.level() {
            log::Level::Error => Level::Error,
            log::Level::Warn => Level::Warn,
            log::Level::Info => Level::Info,
            log::Level::Debug => Level::Debug,
            log::Level::Trace => Level::Debug2,
        }
    }
}

/// Append-only file sink with a level filter and a reopen operation.
///
/// Install with [`FileLogger::install`]; reopen from a `load_config` hook
/// to pick up a rotated file.
pub struct FileLogger {
    path: PathBuf,
    max_level: Level,
    file: Mutex<Option<File>>,
}

impl FileLogger {
    pub fn new(path: impl Into<PathBuf>, max_level: Level) -> io::Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        Ok(Self {
            path,
            max_level,
            file: Mutex::new(Some(file)),
        })
    }

    /// Close and reopen the backing file. Safe to call at any time; a
    /// failed reopen drops records until the next attempt succeeds.
    pub fn reopen(&self) {
        let reopened = open_append(&self.path).ok();
        if let Ok(mut file) = self.file.lock() {
            *file = reopened;
        }
    }

    /// Register as the global `log` sink.
    pub fn install(self) -> Result<&'static FileLogger, log::SetLoggerError> {
        let logger: &'static FileLogger = Box::leak(Box::new(self));
        log::set_logger(logger)?;
        log::set_max_level(log::LevelFilter::Trace);
        Ok(logger)
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl log::Log for FileLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        Level::from_metadata(metadata) <= self.max_level
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = Level::from_metadata(record.metadata());
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        if let Ok(mut guard) = self.file.lock() {
            if let Some(file) = guard.as_mut() {
                let _ = writeln!(
                    file,
                    "[{:.3}] [{}] [{}] {}",
                    stamp,
                    std::process::id(),
                    level.as_str(),
                    record.args()
                );
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut guard) = self.file.lock() {
            if let Some(file) = guard.as_mut() {
                let _ = file.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    #[test]
    fn level_ordering_matches_severity() {
        assert!(Level::Emerg < Level::Error);
        assert!(Level::Error < Level::Info);
        assert!(Level::Info < Level::Debug2);
        assert!(Level::Debug2 < Level::Daemon);
    }

    #[test]
    fn writes_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.log");
        let logger = FileLogger::new(&path, Level::Daemon).unwrap();

        logger.log(
            &log::Record::builder()
                .args(format_args!("hello from the supervisor"))
                .level(log::Level::Info)
                .target("test")
                .build(),
        );
        logger.flush();
        let first = std::fs::read_to_string(&path).unwrap();
        assert!(first.contains("[INFO] hello from the supervisor"));

        // Simulate logrotate: move the file away, reopen, write again.
        let rotated = dir.path().join("daemon.log.1");
        std::fs::rename(&path, &rotated).unwrap();
        logger.reopen();
        logger.log(
            &log::Record::builder()
                .args(format_args!("after rotation"))
                .level(log::Level::Warn)
                .target("test")
                .build(),
        );
        logger.flush();
        assert!(std::fs::read_to_string(&path).unwrap().contains("[WARN] after rotation"));
        assert!(!std::fs::read_to_string(&rotated).unwrap().contains("after rotation"));
    }

    #[test]
    fn daemon_target_is_filtered_separately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filtered.log");
        // Debug2 passes everything except supervisor trace.
        let logger = FileLogger::new(&path, Level::Debug2).unwrap();

        let daemon_meta = log::Metadata::builder()
            .level(log::Level::Debug)
            .target("daemon")
            .build();
        assert!(!logger.enabled(&daemon_meta));

        let app_meta = log::Metadata::builder()
            .level(log::Level::Trace)
            .target("app")
            .build();
        assert!(logger.enabled(&app_meta));
    }
}
