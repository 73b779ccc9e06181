/// Exclusive tick lock on the state directory.
///
/// Held for the whole tick so two overlapping invocations can never both
/// pass the rate check and double-launch the worker. The lock is advisory
/// (`flock`) and released when the file handle drops, including when the
/// process is killed.
use fs2::FileExt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("failed to open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("another tick holds {path}")]
    Contended { path: PathBuf },
}

/// Guard for the tick lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct TickLock {
    file: File,
    path: PathBuf,
}

impl TickLock {
    /// Try to take the lock without blocking.
    ///
    /// The file is opened without truncation so the holder's PID stays
    /// readable until we actually own the lock.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| LockError::Open {
                path: path.to_path_buf(),
                source: e,
            })?;

        if file.try_lock_exclusive().is_err() {
            return Err(LockError::Contended {
                path: path.to_path_buf(),
            });
        }

        // Best effort: the PID is informational only
        if file.set_len(0).is_ok() {
            let _ = writeln!(file, "{}", std::process::id());
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TickLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");

        let lock = TickLock::acquire(&path).unwrap();
        assert_eq!(lock.path(), path);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_second_acquire_is_contended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");

        let _held = TickLock::acquire(&path).unwrap();
        let err = TickLock::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::Contended { .. }));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");

        {
            let _held = TickLock::acquire(&path).unwrap();
        }
        TickLock::acquire(&path).unwrap();
    }

    #[test]
    fn test_acquire_in_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = TickLock::acquire(&dir.path().join("missing/lock")).unwrap_err();
        assert!(matches!(err, LockError::Open { .. }));
    }
}
