//! Per-database advisory file lock (base spec §5: "A per-database
//! advisory file lock (`<logpath>/<dbname>_lgla__lock`) ensures a single
//! replicator instance per (node, database).").
//!
//! Also used by the master/supervisor itself to guarantee a single
//! instance per node (base spec §4.3: "Single-instance process per
//! node").

use crate::error::{Result, RyeError};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// An exclusive, non-blocking `flock` held for the lifetime of this value.
/// The lock file contains our pid for diagnostic `lsof`/`cat`-ability; the
/// lock itself is the `flock`, not the file content, so a stale pid left
/// behind by a crash never blocks a later instance.
pub struct AdvisoryLock {
    path: PathBuf,
    file: File,
}

impl AdvisoryLock {
    /// Acquires the lock at `path`, creating the file if needed. Returns
    /// [`RyeError::AlreadyExists`] if another live process holds it.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().create(true).write(true).truncate(false).open(&path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(RyeError::AlreadyExists(format!(
                    "{} is held by another process",
                    path.display()
                )));
            }
            return Err(RyeError::Io(errno));
        }

        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(AdvisoryLock { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_on_same_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_lgla__lock");
        let first = AdvisoryLock::acquire(&path).unwrap();
        let second = AdvisoryLock::acquire(&path);
        assert!(matches!(second, Err(RyeError::AlreadyExists(_))));
        drop(first);
        let third = AdvisoryLock::acquire(&path);
        assert!(third.is_ok(), "lock is released once the first holder drops");
    }
}
