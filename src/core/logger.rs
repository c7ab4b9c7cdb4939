//! Event log shared by every acquisition component
//!
//! Components receive an [`EventLog`] handle in their constructor instead of
//! reaching for a process-wide instance. Each entry is mirrored to `tracing`
//! and kept in a bounded in-memory buffer, so a front end can show the
//! operator exactly which devices were unknown or colliding.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LogFormat {
    /// Plain text
    #[default]
    Text,
    /// JSON lines
    JsonLines,
}

impl LogFormat {
    /// Get file extension for format
    pub fn extension(&self) -> &'static str {
        match self {
            LogFormat::Text => "log",
            LogFormat::JsonLines => "jsonl",
        }
    }
}

/// Severity of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Level {
    /// Verbose protocol traffic
    Debug,
    /// Normal progress
    Info,
    /// Something the operator should look at
    Warn,
    /// A device or run failed
    Error,
}

/// A single log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Time the entry was recorded
    pub timestamp: DateTime<Local>,
    /// Severity
    pub level: Level,
    /// Component that produced the entry
    pub source: String,
    /// Message text
    pub message: String,
}

impl LogEntry {
    /// Format as text
    pub fn to_text(&self) -> String {
        format!(
            "[{}] {:?} [{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.level,
            self.source,
            self.message
        )
    }

    /// Format as JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn render(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Text => self.to_text(),
            LogFormat::JsonLines => self.to_json(),
        }
    }
}

struct LogBuffer {
    entries: VecDeque<LogEntry>,
    max_entries: usize,
    file: Option<(BufWriter<File>, LogFormat)>,
}

/// Cloneable handle to the shared event log
#[derive(Clone)]
pub struct EventLog {
    source: Arc<str>,
    inner: Arc<Mutex<LogBuffer>>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").field("source", &self.source).finish()
    }
}

impl EventLog {
    /// Create a log keeping at most `max_entries` in memory
    pub fn new(max_entries: usize) -> Self {
        Self {
            source: Arc::from("pvstab"),
            inner: Arc::new(Mutex::new(LogBuffer {
                entries: VecDeque::new(),
                max_entries: max_entries.max(1),
                file: None,
            })),
        }
    }

    /// Handle writing to the same log under another source name
    #[must_use]
    pub fn scoped(&self, source: impl AsRef<str>) -> Self {
        Self {
            source: Arc::from(source.as_ref()),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Source name of this handle
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Mirror every new entry to a file
    pub fn start_file(&self, path: PathBuf, format: LogFormat) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.inner.lock().file = Some((BufWriter::new(file), format));
        Ok(())
    }

    /// Stop mirroring to file
    pub fn stop_file(&self) {
        if let Some((mut file, _)) = self.inner.lock().file.take() {
            let _ = file.flush();
        }
    }

    /// Record an entry
    pub fn log(&self, level: Level, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Local::now(),
            level,
            source: self.source.to_string(),
            message: message.into(),
        };

        match level {
            Level::Debug => tracing::debug!(source = %entry.source, "{}", entry.message),
            Level::Info => tracing::info!(source = %entry.source, "{}", entry.message),
            Level::Warn => tracing::warn!(source = %entry.source, "{}", entry.message),
            Level::Error => tracing::error!(source = %entry.source, "{}", entry.message),
        }

        let mut buffer = self.inner.lock();
        if let Some((ref mut file, format)) = buffer.file {
            let _ = writeln!(file, "{}", entry.render(format));
            if level >= Level::Warn {
                let _ = file.flush();
            }
        }
        buffer.entries.push_back(entry);
        while buffer.entries.len() > buffer.max_entries {
            buffer.entries.pop_front();
        }
    }

    /// Record a debug entry
    pub fn debug(&self, message: impl Into<String>) {
        self.log(Level::Debug, message);
    }

    /// Record an info entry
    pub fn info(&self, message: impl Into<String>) {
        self.log(Level::Info, message);
    }

    /// Record a warning
    pub fn warn(&self, message: impl Into<String>) {
        self.log(Level::Warn, message);
    }

    /// Record an error
    pub fn error(&self, message: impl Into<String>) {
        self.log(Level::Error, message);
    }

    /// Snapshot of the buffered entries
    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.lock().entries.iter().cloned().collect()
    }

    /// Buffered entries at or above `level`
    pub fn entries_at_least(&self, level: Level) -> Vec<LogEntry> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.level >= level)
            .cloned()
            .collect()
    }

    /// Export buffer to string
    pub fn export(&self, format: LogFormat) -> String {
        let buffer = self.inner.lock();
        let mut result = String::new();
        for entry in &buffer.entries {
            result.push_str(&entry.render(format));
            result.push('\n');
        }
        result
    }
}

/// Generate log filename with timestamp
pub fn generate_log_filename(prefix: &str, format: LogFormat) -> String {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    format!("{}_{}.{}", prefix, timestamp, format.extension())
}
