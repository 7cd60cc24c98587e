//! Filesystem helpers used by parts and tables.
//!
//! Everything that must survive a crash goes through [`write_atomic`] or a
//! rename followed by [`sync_path`] on the parent directory.

pub mod flock;
pub mod stream;

pub use flock::FileLock;
pub use stream::{FileReader, FileWriter, ReadAt, ReadAtFile};

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

/// Marker inside the name of a directory scheduled for removal.
pub const MUST_REMOVE_MARKER: &str = ".must-remove.";

/// Marker inside the name of a file being written atomically.
const TEMP_FILE_MARKER: &str = ".tmp.";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_tmp_suffix() -> u64 {
    TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Creates `path` and its parents if missing.
pub fn mkdir_if_not_exist(path: &Path) -> io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    fs::create_dir_all(path)?;
    if let Some(parent) = path.parent() {
        sync_path(parent)?;
    }
    Ok(())
}

/// Creates `path`, failing if it already exists.
pub fn mkdir_fail_if_exist(path: &Path) -> io::Result<()> {
    fs::create_dir(path)?;
    if let Some(parent) = path.parent() {
        sync_path(parent)?;
    }
    Ok(())
}

/// Flushes the metadata of `path` (file or directory) to storage.
#[cfg(unix)]
pub fn sync_path(path: &Path) -> io::Result<()> {
    fs::File::open(path)?.sync_all()
}

/// Flushes the metadata of `path` (file or directory) to storage.
#[cfg(not(unix))]
pub fn sync_path(_path: &Path) -> io::Result<()> {
    // Directories cannot be opened for syncing here.
    Ok(())
}

/// Writes `data` to `path` so that readers see either the old or the new
/// contents, never a torn file.
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!("{}{}", TEMP_FILE_MARKER, next_tmp_suffix()));
    let tmp = PathBuf::from(tmp);

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    match path.parent() {
        Some(parent) => sync_path(parent),
        None => Ok(()),
    }
}

/// Returns true for files left behind by an interrupted [`write_atomic`].
pub fn is_temporary_file_name(name: &str) -> bool {
    name.contains(TEMP_FILE_MARKER)
}

/// Returns true for directories left behind by an interrupted removal.
pub fn is_scheduled_for_removal(name: &str) -> bool {
    name.contains(MUST_REMOVE_MARKER)
}

/// Returns true if `path` is a directory without entries.
pub fn is_empty_dir(path: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

/// Errors that NFS reports while files in a directory are still held open.
#[cfg(unix)]
fn is_retryable_remove_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ESTALE) | Some(libc::EBUSY) | Some(libc::ENOTEMPTY) | Some(libc::EEXIST)
    )
}

#[cfg(not(unix))]
fn is_retryable_remove_error(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::PermissionDenied
}

/// Removes the directory tree at `path` once.
///
/// Returns `Ok(false)` if the removal hit an NFS-style transient error and
/// should be retried later; missing paths count as removed.
pub fn try_remove_dir_all(path: &Path) -> io::Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) if is_retryable_remove_error(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Removes the directory tree at `path`, retrying transient NFS errors with
/// exponential backoff until it succeeds.
pub fn remove_dir_all_with_retry(path: &Path) -> io::Result<()> {
    let mut sleep = Duration::from_millis(10);
    let max_sleep = Duration::from_secs(1);
    let mut attempts = 0u64;
    while !try_remove_dir_all(path)? {
        attempts += 1;
        if attempts % 100 == 1 {
            log::warn!(
                "cannot remove {} yet; retrying (attempt {}); this is expected on NFS while files are open",
                path.display(),
                attempts
            );
        }
        thread::sleep(sleep);
        sleep = (sleep * 2).min(max_sleep);
    }
    if let Some(parent) = path.parent() {
        sync_path(parent)?;
    }
    Ok(())
}

/// Renames `path` to a name marked for removal, then removes it.
///
/// The rename makes the removal atomic from the point of view of a reopen or
/// snapshot: a directory is either intact or carries the marker. Returns the
/// renamed path and whether the removal finished; unfinished removals must be
/// completed with [`remove_dir_all_with_retry`].
pub fn remove_dir_atomic(path: &Path) -> io::Result<(PathBuf, bool)> {
    let mut renamed = path.as_os_str().to_owned();
    renamed.push(format!("{}{}", MUST_REMOVE_MARKER, next_tmp_suffix()));
    let renamed = PathBuf::from(renamed);
    match fs::rename(path, &renamed) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((renamed, true)),
        Err(e) => return Err(e),
    }
    if let Some(parent) = path.parent() {
        sync_path(parent)?;
    }
    let done = try_remove_dir_all(&renamed)?;
    Ok((renamed, done))
}

/// Removes directories in `dir` left over from interrupted removals and
/// files left over from interrupted atomic writes.
pub fn remove_temporary_entries(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let path = entry.path();
        if is_scheduled_for_removal(&name) {
            log::info!("removing leftover directory {}", path.display());
            remove_dir_all_with_retry(&path)?;
        } else if is_temporary_file_name(&name) && entry.file_type()?.is_file() {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Hard-links every file in `src_dir` into a new directory `dst_dir`.
pub fn hard_link_files(src_dir: &Path, dst_dir: &Path) -> io::Result<()> {
    mkdir_fail_if_exist(dst_dir)?;
    for entry in fs::read_dir(src_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        fs::hard_link(entry.path(), dst_dir.join(entry.file_name()))?;
    }
    sync_path(dst_dir)
}

/// Returns the number of bytes available to unprivileged users on the
/// filesystem holding `path`.
#[cfg(unix)]
pub fn free_space(path: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
}

/// Returns the number of bytes available on the filesystem holding `path`.
#[cfg(not(unix))]
pub fn free_space(_path: &Path) -> io::Result<u64> {
    Ok(u64::MAX)
}
