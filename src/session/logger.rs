//! Plain-text log written next to each recording

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::fmt::Write as _;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Off,
}

impl LogLevel {
    fn label(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Off => "OFF",
        }
    }
}

struct OpenLog {
    path: PathBuf,
    file: File,
}

/// Shared by the controller and the session's workers. Closing is final:
/// writes after `close` are dropped.
pub struct SessionLogger {
    level: LogLevel,
    pattern: String,
    /// Mirror recorder output into the main log
    echo: bool,
    log: Mutex<Option<OpenLog>>,
}

impl SessionLogger {
    pub fn create(path: &Path, level: LogLevel, pattern: &str, echo: bool) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create session log directory: {:?}", parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open session log: {:?}", path))?;

        Ok(Arc::new(Self {
            level,
            pattern: pattern.to_string(),
            echo,
            log: Mutex::new(Some(OpenLog {
                path: path.to_path_buf(),
                file,
            })),
        }))
    }

    /// A logger that writes nowhere. Echo still applies.
    pub fn disabled(echo: bool) -> Arc<Self> {
        Arc::new(Self {
            level: LogLevel::Off,
            pattern: String::new(),
            echo,
            log: Mutex::new(None),
        })
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if self.level == LogLevel::Off || level < self.level {
            return;
        }
        let mut guard = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(log) = guard.as_mut() else {
            return;
        };
        let line = format_line(&self.pattern, level, message);
        if let Err(e) = log.file.write_all(line.as_bytes()) {
            warn!("Failed to write session log {:?}: {}", log.path, e);
        }
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    /// One line of recorder output.
    pub fn output(&self, line: &str) {
        if self.echo {
            info!("> {}", line);
        }
        self.log(LogLevel::Info, line);
    }

    /// Close the file and move it to `target`.
    pub fn close_and_rename(&self, target: &Path) -> Result<()> {
        let Some(mut log) = self.log.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return Ok(());
        };
        let _ = log.file.flush();
        drop(log.file);
        std::fs::rename(&log.path, target)
            .with_context(|| format!("Failed to rename session log {:?} to {:?}", log.path, target))
    }
}

/// A pattern chrono cannot render falls back to RFC 3339.
fn format_line(pattern: &str, level: LogLevel, message: &str) -> String {
    let now = Local::now();
    let mut stamp = String::new();
    if write!(stamp, "{}", now.format(pattern)).is_err() {
        stamp = now.to_rfc3339();
    }
    format!("{} [{}] {}\n", stamp, level.label(), message)
}
