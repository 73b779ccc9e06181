/// Durable event log: human-readable, locally timestamped lines appended to a
/// file under the state directory.
///
/// This is the operational history of the supervisor. Every decision that
/// produces a notification is written here first, so the history survives a
/// failed notification transport.
use chrono::{DateTime, Local};
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `message` stamped with the current local time.
    ///
    /// Write failures are reported through tracing and otherwise ignored; a
    /// full disk must not stop the supervisor from restarting the worker.
    pub fn append(&self, message: &str) {
        self.append_at(Local::now(), message);
    }

    fn append_at(&self, at: DateTime<Local>, message: &str) {
        if let Err(e) = self.try_append(at, message) {
            tracing::warn!(
                error = %e,
                path = %self.path.display(),
                "failed to write event log"
            );
        }
    }

    fn try_append(&self, at: DateTime<Local>, message: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", format_line(at, message))
    }
}

fn format_line(at: DateTime<Local>, message: &str) -> String {
    format!("[{}] {}", at.format("%Y-%m-%d %H:%M:%S"), message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_line() {
        let at = Local.with_ymd_and_hms(2026, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            format_line(at, "worker restarted"),
            "[2026-03-09 07:05:01] worker restarted"
        );
    }

    #[test]
    fn test_append_creates_file_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("logs/events.log"));

        log.append("first");
        log.append("second");

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] first"));
        assert!(lines[1].ends_with("] second"));
    }

    #[test]
    fn test_append_preserves_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        std::fs::write(&path, "older line\n").unwrap();

        EventLog::new(path.clone()).append("newer");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("older line\n"));
        assert!(contents.trim_end().ends_with("newer"));
    }

    #[test]
    fn test_append_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // the log path is a directory, so opening it for append fails
        let log = EventLog::new(dir.path().to_path_buf());
        log.append("dropped");
    }
}
