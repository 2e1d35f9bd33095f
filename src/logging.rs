//! Diagnostics: the `tracing` subscriber and the in-memory activity log.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use time::macros::format_description;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

/// Install the stderr subscriber. `RUST_LOG` wins over `verbosity`.
pub fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "certgen=info",
        1 => "certgen=debug",
        _ => "certgen=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Success,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Success => "SUCCESS",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Local wall-clock time, `HH:MM:SS`.
    pub time: String,
    pub level: LogLevel,
    pub title: String,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} {}: {}", self.time, self.level, self.title, self.message)
    }
}

/// Timestamped activity entries kept for the session and mirrored to `tracing`.
#[derive(Debug, Default)]
pub struct ActivityLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self, title: &str, message: &str, level: LogLevel) -> LogEntry {
        let entry = LogEntry {
            time: timestamp(),
            level,
            title: title.to_string(),
            message: message.to_string(),
        };
        match level {
            LogLevel::Debug => tracing::debug!("{title}: {message}"),
            LogLevel::Info | LogLevel::Success => tracing::info!("{title}: {message}"),
            LogLevel::Warning => tracing::warn!("{title}: {message}"),
            LogLevel::Error => tracing::error!("{title}: {message}"),
        }
        self.lock().push(entry.clone());
        entry
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LogEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_timestamped_and_kept_in_order() {
        let log = ActivityLog::new();
        log.log("Created Certificate", "1. name: A | email: a@x.com", LogLevel::Warning);
        log.log("Emailing", "done", LogLevel::Success);

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title, "Created Certificate");
        assert_eq!(entries[1].level, LogLevel::Success);

        let time = &entries[0].time;
        assert_eq!(time.len(), 8);
        assert_eq!(time.as_bytes()[2], b':');
        assert_eq!(time.as_bytes()[5], b':');
    }

    #[test]
    fn entry_display() {
        let entry = LogEntry {
            time: "09:05:01".into(),
            level: LogLevel::Error,
            title: "Send".into(),
            message: "failed".into(),
        };
        assert_eq!(entry.to_string(), "[09:05:01] ERROR Send: failed");
    }

    #[test]
    fn clear_empties_the_log() {
        let log = ActivityLog::new();
        log.log("t", "m", LogLevel::Debug);
        assert!(!log.is_empty());
        log.clear();
        assert!(log.is_empty());
    }
}
