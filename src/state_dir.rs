use std::path::{Path, PathBuf};

/// Manages the `.warden/` directory layout.
///
/// Everything that must survive between ticks lives under a single state
/// directory (default `.warden/`). This struct provides accessors for each
/// well-known path and handles initialization.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
    event_log: Option<PathBuf>,
    worker_log: Option<PathBuf>,
}

impl StateDir {
    /// Create a new StateDir referencing the given root path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            event_log: None,
            worker_log: None,
        }
    }

    /// Use a custom event log path instead of `<root>/events.log`.
    pub fn with_event_log(mut self, path: Option<PathBuf>) -> Self {
        self.event_log = path;
        self
    }

    /// Use a custom worker log path instead of `<root>/worker.log`.
    pub fn with_worker_log(mut self, path: Option<PathBuf>) -> Self {
        self.worker_log = path;
        self
    }

    /// The root directory (e.g. `.warden/`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the restart ledger: one epoch timestamp per line.
    pub fn ledger(&self) -> PathBuf {
        self.root.join("restarts")
    }

    /// Path to the human-readable event log.
    pub fn event_log(&self) -> PathBuf {
        self.event_log
            .clone()
            .unwrap_or_else(|| self.root.join("events.log"))
    }

    /// Path to the worker's captured stdout/stderr.
    pub fn worker_log(&self) -> PathBuf {
        self.worker_log
            .clone()
            .unwrap_or_else(|| self.root.join("worker.log"))
    }

    /// Path to the per-tick lock file.
    pub fn lock(&self) -> PathBuf {
        self.root.join("lock")
    }

    /// Create the root directory if missing.
    /// Returns Ok(true) if it was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_dir_paths() {
        let sd = StateDir::new(".warden");
        assert_eq!(sd.root(), Path::new(".warden"));
        assert_eq!(sd.ledger(), PathBuf::from(".warden/restarts"));
        assert_eq!(sd.event_log(), PathBuf::from(".warden/events.log"));
        assert_eq!(sd.worker_log(), PathBuf::from(".warden/worker.log"));
        assert_eq!(sd.lock(), PathBuf::from(".warden/lock"));
    }

    #[test]
    fn test_log_overrides() {
        let sd = StateDir::new(".warden")
            .with_event_log(Some(PathBuf::from("/var/log/warden.log")))
            .with_worker_log(Some(PathBuf::from("/var/log/gateway.log")));
        assert_eq!(sd.event_log(), PathBuf::from("/var/log/warden.log"));
        assert_eq!(sd.worker_log(), PathBuf::from("/var/log/gateway.log"));
        // ledger stays under root
        assert_eq!(sd.ledger(), PathBuf::from(".warden/restarts"));
    }

    #[test]
    fn test_init_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let sd = StateDir::new(tmp.path().join("nested/.warden"));

        assert!(sd.init().unwrap());
        assert!(sd.root().exists());
        assert!(!sd.init().unwrap());
    }
}
