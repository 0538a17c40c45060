use anyhow::{Context, Result};
use fs2::FileExt;
use log::{debug, info, warn};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Default location of the host-wide benchmark lock
pub const DEFAULT_LOCK_PATH: &str = "/tmp/bitcoin_bench.lock";

/// Host-wide exclusive lock held for the duration of a benchmark run.
///
/// Only one run may use the host at a time; the lock is released and the file
/// removed when this value is dropped.
#[derive(Debug)]
pub struct HostLock {
    file: File,
    path: PathBuf,
}

impl HostLock {
    /// Take the lock or fail immediately if another run holds it
    pub fn acquire(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file {path:?}"))?;

        if let Err(e) = file.try_lock_exclusive() {
            let mut holder = String::new();
            let _ = file.read_to_string(&mut holder);
            anyhow::bail!(
                "Couldn't acquire lockfile {path:?} ({e}); held by: {}",
                holder.trim()
            );
        }

        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
        let content = format!(
            "{},{},{}\n",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            user,
            std::process::id()
        );
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(content.as_bytes())
            .with_context(|| format!("Failed to write lock file {path:?}"))?;
        file.sync_all()?;

        info!("Acquired host lock {path:?}");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HostLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove lock file {:?}: {e}", self.path);
        }
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to unlock {:?}: {e}", self.path);
        }
        debug!("Released host lock {:?}", self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lock_records_pid_and_is_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bench.lock");

        let lock = HostLock::acquire(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.trim_end().ends_with(&std::process::id().to_string()));

        // flock is per open file description, so a second open conflicts
        let err = HostLock::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("Couldn't acquire lockfile"));

        drop(lock);
        assert!(!path.exists());

        let again = HostLock::acquire(&path).unwrap();
        assert_eq!(again.path(), path.as_path());
    }
}
