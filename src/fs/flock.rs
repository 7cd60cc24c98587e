//! Process-exclusive advisory lock on a table directory.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Holds an exclusive lock on a file for as long as it lives.
///
/// The lock file contains the owning process id for debugging.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates `path` if needed and locks it without blocking.
    ///
    /// Fails with `WouldBlock` if another process (or another table in this
    /// process) holds the lock.
    pub fn lock(path: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        Self::try_lock(&file)?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path: path.to_path_buf() })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        // Advisory locking is only enforced on unix.
        Ok(())
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_writes_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flock.lock");
        let lock = FileLock::lock(&path).unwrap();
        assert_eq!(lock.path(), path.as_path());
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[cfg(unix)]
    #[test]
    fn test_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flock.lock");
        let lock = FileLock::lock(&path).unwrap();
        assert!(FileLock::lock(&path).is_err());
        drop(lock);
        assert!(FileLock::lock(&path).is_ok());
    }
}
