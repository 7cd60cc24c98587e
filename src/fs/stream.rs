//! Buffered file streams with OS page cache hints.
//!
//! Streams opened with `nocache` drop their pages from the OS cache once
//! they are done, so big one-shot reads and writes during merges don't evict
//! hot data.

use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const BUFFER_SIZE: usize = 64 * 1024;

#[cfg(target_os = "linux")]
fn fadvise(file: &File, offset: u64, len: u64, advice: libc::c_int) {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe {
        libc::posix_fadvise(file.as_raw_fd(), offset as libc::off_t, len as libc::off_t, advice)
    };
    if rc != 0 {
        log::debug!("posix_fadvise({}) failed: {}", advice, io::Error::from_raw_os_error(rc));
    }
}

#[cfg(target_os = "linux")]
fn advise_sequential(file: &File) {
    fadvise(file, 0, 0, libc::POSIX_FADV_SEQUENTIAL);
}

#[cfg(target_os = "linux")]
fn advise_random(file: &File) {
    fadvise(file, 0, 0, libc::POSIX_FADV_RANDOM);
}

#[cfg(target_os = "linux")]
fn advise_dontneed(file: &File) {
    fadvise(file, 0, 0, libc::POSIX_FADV_DONTNEED);
}

#[cfg(target_os = "linux")]
fn advise_dontneed_range(file: &File, offset: u64, len: u64) {
    fadvise(file, offset, len, libc::POSIX_FADV_DONTNEED);
}

#[cfg(not(target_os = "linux"))]
fn advise_sequential(_file: &File) {}

#[cfg(not(target_os = "linux"))]
fn advise_random(_file: &File) {}

#[cfg(not(target_os = "linux"))]
fn advise_dontneed(_file: &File) {}

#[cfg(not(target_os = "linux"))]
fn advise_dontneed_range(_file: &File, _offset: u64, _len: u64) {}

/// Sequential buffered reader over a file.
#[derive(Debug)]
pub struct FileReader {
    inner: BufReader<File>,
    nocache: bool,
}

impl FileReader {
    /// Opens `path` for sequential reading.
    pub fn open(path: &Path, nocache: bool) -> io::Result<Self> {
        let file = File::open(path)?;
        advise_sequential(&file);
        Ok(Self { inner: BufReader::with_capacity(BUFFER_SIZE, file), nocache })
    }
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Drop for FileReader {
    fn drop(&mut self) {
        if self.nocache {
            advise_dontneed(self.inner.get_ref());
        }
    }
}

/// Buffered writer to a new file.
///
/// Call [`finish`](Self::finish) to flush and fsync; dropping an unfinished
/// writer leaves a partially written file behind.
#[derive(Debug)]
pub struct FileWriter {
    inner: BufWriter<File>,
    path: PathBuf,
    nocache: bool,
}

impl FileWriter {
    /// Creates `path`, failing if it already exists.
    pub fn create(path: &Path, nocache: bool) -> io::Result<Self> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        Ok(Self {
            inner: BufWriter::with_capacity(BUFFER_SIZE, file),
            path: path.to_path_buf(),
            nocache,
        })
    }

    /// Path of the file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes buffered data and fsyncs the file.
    pub fn finish(self) -> io::Result<()> {
        let file = self.inner.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        if self.nocache {
            advise_dontneed(&file);
        }
        Ok(())
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Random access reads of whole regions.
pub trait ReadAt: Send + Sync {
    /// Fills `buf` with bytes starting at `offset`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Total size in bytes.
    fn size(&self) -> u64;
}

/// A file opened for positional reads from many threads.
///
/// With `nocache` set, read-ahead is disabled and every read range is
/// dropped from the OS page cache once copied out; decoded blocks live in
/// the block caches instead.
#[derive(Debug)]
pub struct ReadAtFile {
    file: File,
    size: u64,
    nocache: bool,
    #[cfg(not(unix))]
    lock: parking_lot::Mutex<()>,
}

impl ReadAtFile {
    /// Opens `path` for positional reads.
    pub fn open(path: &Path, nocache: bool) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        if nocache {
            advise_random(&file);
        }
        Ok(Self {
            file,
            size,
            nocache,
            #[cfg(not(unix))]
            lock: parking_lot::Mutex::new(()),
        })
    }
}

impl ReadAt for ReadAtFile {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)?;
        if self.nocache {
            advise_dontneed_range(&self.file, offset, buf.len() as u64);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use std::io::{Seek, SeekFrom};
        let _guard = self.lock.lock();
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

impl ReadAt for Bytes {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let start = offset as usize;
        let end = start.checked_add(buf.len()).filter(|&end| end <= self.len()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("cannot read {} bytes at offset {} from {} bytes", buf.len(), offset, self.len()),
            )
        })?;
        buf.copy_from_slice(&self[start..end]);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writer_reader() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("items.bin");

        let mut w = FileWriter::create(&path, true).unwrap();
        w.write_all(b"hello ").unwrap();
        w.write_all(b"world").unwrap();
        assert_eq!(w.path(), path.as_path());
        w.finish().unwrap();

        let mut r = FileReader::open(&path, true).unwrap();
        let mut s = String::new();
        r.read_to_string(&mut s).unwrap();
        assert_eq!(s, "hello world");

        // create_new semantics.
        assert!(FileWriter::create(&path, false).is_err());
    }

    #[test]
    fn test_read_at_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        for nocache in [false, true] {
            let f = ReadAtFile::open(&path, nocache).unwrap();
            assert_eq!(f.size(), 10);
            let mut buf = [0u8; 3];
            f.read_at(&mut buf, 4).unwrap();
            assert_eq!(&buf, b"456");
            // Dropping pages doesn't affect later reads.
            f.read_at(&mut buf, 4).unwrap();
            assert_eq!(&buf, b"456");
            assert!(f.read_at(&mut buf, 8).is_err());
        }
    }

    #[test]
    fn test_read_at_bytes() {
        let b = Bytes::from_static(b"abcdef");
        let mut buf = [0u8; 2];
        b.read_at(&mut buf, 1).unwrap();
        assert_eq!(&buf, b"bc");
        assert!(b.read_at(&mut buf, 5).is_err());
        assert!(b.read_at(&mut buf, u64::MAX).is_err());
        assert_eq!(ReadAt::size(&b), 6);
    }
}
