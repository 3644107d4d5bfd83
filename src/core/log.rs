// SPDX-License-Identifier: GPL-2.0
//! Diagnostics log for the race detector
//!
//! Soft warnings that do not abort the analysis (budget overruns, unmatched
//! join sites, recursive SCCs) are written into a bounded in-memory buffer so
//! the final report can carry them. Library tracing goes through the `log`
//! facade in addition.

use std::fmt::Write;

/// Log level for diagnostics output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    /// No logging
    #[default]
    Off = 0,
    /// Only errors
    Error = 1,
    /// Errors and soft warnings
    Warn = 2,
    /// Phase progress and partition summaries
    Info = 3,
    /// Per-query details
    Debug = 4,
    /// Everything
    Trace = 5,
}

impl LogLevel {
    /// Short tag printed in front of each line
    pub fn tag(self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Diagnostics log buffer
#[derive(Debug, Clone, Default)]
pub struct AnalysisLog {
    /// Log level threshold
    pub level: LogLevel,
    /// Log buffer
    pub buffer: String,
    /// Maximum buffer size
    pub max_size: usize,
    /// Whether buffer has been truncated
    pub truncated: bool,
    /// Number of warnings recorded, including dropped ones
    pub warnings: usize,
}

impl AnalysisLog {
    /// Create a new log with specified level
    pub fn new(level: LogLevel) -> Self {
        Self::with_max_size(level, 1024 * 1024)
    }

    /// Create a log with custom max size
    pub fn with_max_size(level: LogLevel, max_size: usize) -> Self {
        Self {
            level,
            buffer: String::new(),
            max_size,
            truncated: false,
            warnings: 0,
        }
    }

    /// Check if logging is enabled at the given level
    pub fn enabled(&self, level: LogLevel) -> bool {
        level <= self.level && level != LogLevel::Off
    }

    /// Log a message at the given level
    pub fn log(&mut self, level: LogLevel, msg: &str) {
        if level == LogLevel::Warn {
            self.warnings += 1;
        }
        if !self.enabled(level) || self.truncated {
            return;
        }

        let tag = level.tag();
        if self.buffer.len() + tag.len() + msg.len() + 3 > self.max_size {
            self.truncated = true;
            self.buffer.push_str("... log truncated ...\n");
            return;
        }

        let _ = writeln!(self.buffer, "{}: {}", tag, msg);
    }

    /// Log an error
    pub fn error(&mut self, msg: &str) {
        self.log(LogLevel::Error, msg);
    }

    /// Log a soft warning
    pub fn warn(&mut self, msg: &str) {
        self.log(LogLevel::Warn, msg);
    }

    /// Log info
    pub fn info(&mut self, msg: &str) {
        self.log(LogLevel::Info, msg);
    }

    /// Log debug
    pub fn debug(&mut self, msg: &str) {
        self.log(LogLevel::Debug, msg);
    }

    /// Get the log contents
    pub fn contents(&self) -> &str {
        &self.buffer
    }

    /// Iterate over recorded lines
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.buffer.lines()
    }

    /// Clear the log
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.truncated = false;
        self.warnings = 0;
    }

    /// Get the current length of the log buffer
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the log buffer is empty
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Record a soft warning, formatting the message only when it is kept.
pub fn log_warn(log: &mut AnalysisLog, msg: impl FnOnce() -> String) {
    if log.enabled(LogLevel::Warn) {
        let msg = msg();
        log::warn!("{}", msg);
        log.warn(&msg);
    } else {
        log.warnings += 1;
    }
}

/// Record an informational line.
pub fn log_info(log: &mut AnalysisLog, msg: impl FnOnce() -> String) {
    if log.enabled(LogLevel::Info) {
        let msg = msg();
        log::info!("{}", msg);
        log.info(&msg);
    }
}

/// Record a debug line.
pub fn log_debug(log: &mut AnalysisLog, msg: impl FnOnce() -> String) {
    if log.enabled(LogLevel::Debug) {
        let msg = msg();
        log::debug!("{}", msg);
        log.debug(&msg);
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_level_filter() {
        let mut log = AnalysisLog::new(LogLevel::Warn);
        log.info("dropped");
        log.warn("kept");
        assert_eq!(log.contents(), "warn: kept\n");
        assert_eq!(log.warnings, 1);
    }

    #[test]
    fn test_truncation() {
        let mut log = AnalysisLog::with_max_size(LogLevel::Trace, 16);
        log.info("0123456789");
        log.info("0123456789");
        assert!(log.truncated);
        log.info("more");
        assert!(log.contents().ends_with("... log truncated ...\n"));
    }

    #[test]
    fn test_warnings_counted_when_off() {
        let mut log = AnalysisLog::default();
        log_warn(&mut log, || "budget".to_string());
        assert!(log.is_empty());
        assert_eq!(log.warnings, 1);
    }
}
