/// Restart ledger: the persisted record of recent restarts that drives the
/// rate limit.
///
/// On disk it is one epoch-seconds timestamp per line, normally in append
/// order. The file is only ever replaced atomically (temp file + rename), so a
/// concurrent reader sees either the old or the new ledger, never a torn one.
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Errors from persisting the ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("failed to write ledger {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to replace ledger {path}: {source}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Ordered restart timestamps, oldest first in the usual case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartLedger {
    records: Vec<i64>,
}

impl RestartLedger {
    #[cfg(test)]
    pub fn from_records(records: Vec<i64>) -> Self {
        Self { records }
    }

    /// Load the ledger from `path`.
    ///
    /// A missing or unreadable file is treated as an empty ledger so a broken
    /// state file can never block restarts forever. Lines that are not
    /// integers are skipped.
    pub fn load(path: &Path) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %path.display(),
                    "failed to read restart ledger, treating as empty"
                );
                return Self::default();
            }
        };

        let mut records = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.parse::<i64>() {
                Ok(ts) => records.push(ts),
                Err(_) => {
                    tracing::warn!(line, path = %path.display(), "skipping malformed ledger line");
                }
            }
        }
        Self { records }
    }

    /// Atomically replace the ledger file with the current records.
    pub fn save(&self, path: &Path) -> Result<(), LedgerError> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let write_err = |e: std::io::Error| LedgerError::Write {
            path: path.to_path_buf(),
            source: e,
        };

        let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
        for ts in &self.records {
            writeln!(tmp, "{ts}").map_err(write_err)?;
        }
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(path).map_err(|e| LedgerError::Persist {
            path: path.to_path_buf(),
            source: e.error,
        })?;
        Ok(())
    }

    /// Drop every record older than `now - window_secs`.
    ///
    /// A record exactly at the cutoff is kept. Returns how many were dropped.
    pub fn prune(&mut self, now: i64, window_secs: u64) -> usize {
        let cutoff = now.saturating_sub(i64::try_from(window_secs).unwrap_or(i64::MAX));
        let before = self.records.len();
        self.records.retain(|&ts| ts >= cutoff);
        before - self.records.len()
    }

    /// Number of restarts inside the window, after pruning.
    pub fn count_in_window(&mut self, now: i64, window_secs: u64) -> usize {
        self.prune(now, window_secs);
        self.records.len()
    }

    /// Admission control: true iff another restart fits in the window.
    pub fn can_restart(&mut self, now: i64, window_secs: u64, max_restarts: u32) -> bool {
        self.count_in_window(now, window_secs) < max_restarts as usize
    }

    /// Append one restart. Never removes or deduplicates.
    pub fn record(&mut self, now: i64) {
        self.records.push(now);
    }

    pub fn records(&self) -> &[i64] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Most recent restart, regardless of append order.
    pub fn last(&self) -> Option<i64> {
        self.records.iter().copied().max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_prune_keeps_boundary_record() {
        let mut ledger = RestartLedger::from_records(vec![399, 400, 401]);
        let dropped = ledger.prune(1000, 600);
        assert_eq!(dropped, 1);
        assert_eq!(ledger.records(), &[400, 401]);
    }

    #[test]
    fn test_prune_is_idempotent() {
        let mut once = RestartLedger::from_records(vec![10, 500, 900, 950]);
        once.prune(1000, 600);

        let mut twice = RestartLedger::from_records(vec![10, 500, 900, 950]);
        twice.prune(1000, 600);
        twice.prune(1000, 600);

        assert_eq!(once, twice);
        assert_eq!(once.records(), &[500, 900, 950]);
    }

    #[test]
    fn test_rate_limit_window() {
        let mut ledger = RestartLedger::from_records(vec![0, 100, 200]);
        assert!(!ledger.can_restart(300, 600, 3));
        // t=0 is exactly on the cutoff at t=600, still counted
        assert!(!ledger.can_restart(600, 600, 3));
        // t=0 expires at t=601
        assert!(ledger.can_restart(601, 600, 3));
        assert_eq!(ledger.records(), &[100, 200]);
    }

    #[test]
    fn test_count_in_window_prunes() {
        let mut ledger = RestartLedger::from_records(vec![1, 2, 3, 700]);
        assert_eq!(ledger.count_in_window(1000, 600), 1);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_record_appends_duplicates() {
        let mut ledger = RestartLedger::default();
        ledger.record(42);
        ledger.record(42);
        assert_eq!(ledger.records(), &[42, 42]);
    }

    #[test]
    fn test_out_of_order_records() {
        let mut ledger = RestartLedger::from_records(vec![900, 100, 950]);
        assert_eq!(ledger.count_in_window(1000, 600), 2);
        assert_eq!(ledger.last(), Some(950));
    }

    #[test]
    fn test_huge_window_does_not_overflow() {
        let mut ledger = RestartLedger::from_records(vec![i64::MIN + 1, 0]);
        assert_eq!(ledger.count_in_window(0, u64::MAX), 2);
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempdir().unwrap();
        let ledger = RestartLedger::load(&dir.path().join("restarts"));
        assert_eq!(ledger.len(), 0);
    }

    #[test]
    fn test_load_unreadable_is_empty() {
        let dir = tempdir().unwrap();
        // a directory where the file should be
        let path = dir.path().join("restarts");
        std::fs::create_dir(&path).unwrap();
        assert_eq!(RestartLedger::load(&path).len(), 0);
    }

    #[test]
    fn test_load_skips_malformed_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("restarts");
        std::fs::write(&path, "100\n\ngarbage\n  200  \n300").unwrap();
        let ledger = RestartLedger::load(&path);
        assert_eq!(ledger.records(), &[100, 200, 300]);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("restarts");
        let ledger = RestartLedger::from_records(vec![5, 6, 7]);
        ledger.save(&path).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "5\n6\n7\n");
        assert_eq!(RestartLedger::load(&path), ledger);
    }

    #[test]
    fn test_save_replaces_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("restarts");
        std::fs::write(&path, "1\n2\n3\n4\n").unwrap();

        RestartLedger::from_records(vec![9]).save(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "9\n");
        // no temp files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_save_into_missing_dir_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope/restarts");
        let err = RestartLedger::default().save(&path).unwrap_err();
        assert!(matches!(err, LedgerError::Write { .. }));
    }
}
