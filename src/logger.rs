// src/logger.rs

use std::{
    fmt,
    io::{IsTerminal, Write},
    str::FromStr,
    sync::Arc,
};

use chrono::Local;
use colored::Colorize;
use serde::{Deserialize, Serialize};

/// Log through an injected [`Logger`]. The message is only formatted when
/// the level is enabled.
#[macro_export]
macro_rules! log {
    ($logger:expr, $level:expr, $($arg:tt)*) => {
        {
            let logger: &$crate::logger::Logger = &$logger;
            if logger.enabled($level) {
                logger.log($level, &format!($($arg)*));
            }
        }
    };
}

#[derive(Debug, PartialEq, PartialOrd, Clone, Copy, Eq, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "Error",
            LogLevel::Warn => "Warn",
            LogLevel::Info => "Info",
            LogLevel::Debug => "Debug",
            LogLevel::Trace => "Trace",
        }
    }

    fn colored(&self) -> colored::ColoredString {
        match self {
            LogLevel::Error => self.as_str().bold().red(),
            LogLevel::Warn => self.as_str().bold().yellow(),
            LogLevel::Info => self.as_str().bold().green(),
            LogLevel::Debug => self.as_str().bold().blue(),
            LogLevel::Trace => self.as_str().bold().magenta(),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.colored())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// Destination for formatted log records.
pub trait LogSink: Send + Sync {
    fn write(&self, level: LogLevel, message: &str);
}

/// Writes to stderr. The master's stderr is the context log file, so colors
/// are only used when attached to a terminal.
pub struct ConsoleSink {
    colored: bool,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self {
            colored: std::io::stderr().is_terminal(),
        }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for ConsoleSink {
    fn write(&self, level: LogLevel, message: &str) {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let mut stderr = std::io::stderr().lock();
        let _ = if self.colored {
            writeln!(stderr, "[{}] [{}]: {}", stamp, level, message)
        } else {
            writeln!(stderr, "[{}] [{}]: {}", stamp, level.as_str(), message)
        };
    }
}

#[derive(Clone)]
pub struct Logger {
    level: LogLevel,
    sink: Arc<dyn LogSink>,
    prefix: Option<Arc<str>>,
}

impl Logger {
    pub fn new(level: LogLevel, sink: Arc<dyn LogSink>) -> Self {
        Self {
            level,
            sink,
            prefix: None,
        }
    }

    pub fn console(level: LogLevel) -> Self {
        Self::new(level, Arc::new(ConsoleSink::new()))
    }

    /// Same sink and level, every record prefixed with `[prefix]`.
    pub fn with_prefix(&self, prefix: impl Into<String>) -> Self {
        Self {
            level: self.level,
            sink: self.sink.clone(),
            prefix: Some(Arc::from(prefix.into())),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level <= self.level
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if !self.enabled(level) {
            return;
        }
        match &self.prefix {
            Some(prefix) => self.sink.write(level, &format!("[{}] {}", prefix, message)),
            None => self.sink.write(level, message),
        }
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("level", &self.level)
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// Keeps records in memory, used by the unit tests to assert on output.
#[cfg(test)]
#[derive(Default)]
pub struct MemorySink {
    pub records: std::sync::Mutex<Vec<(LogLevel, String)>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.records
            .lock()
            .unwrap()
            .iter()
            .any(|(l, m)| *l == level && m.contains(needle))
    }
}

#[cfg(test)]
impl LogSink for MemorySink {
    fn write(&self, level: LogLevel, message: &str) {
        self.records
            .lock()
            .unwrap()
            .push((level, message.to_owned()));
    }
}
