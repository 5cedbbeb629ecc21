#![forbid(unsafe_code)]

use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::types::{Result, StoreError};

/// Positioned I/O over one physical file.
///
/// Data files and log files are both driven through this trait so tests can
/// substitute [`MemFileIo`] for real files.
pub trait FileIo: Send + Sync + 'static {
    /// Reads exactly `dst.len()` bytes at `off`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`, extending the file when needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Flushes file data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Returns the physical length of the file.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file holds no bytes.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
mod positional {
    use std::{fs::File, io, os::unix::fs::FileExt};

    pub fn read(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        file.read_at(dst, off)
    }

    pub fn write(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        file.write_at(src, off)
    }
}

#[cfg(windows)]
mod positional {
    use std::{fs::File, io, os::windows::fs::FileExt};

    pub fn read(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        file.seek_read(dst, off)
    }

    pub fn write(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        file.seek_write(src, off)
    }
}

/// [`FileIo`] over a `std::fs::File` using pread/pwrite style calls.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an already opened file.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens `path` for read/write, creating it when missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(StoreError::from)?;
        Ok(Self::new(file))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, mut off: u64, mut dst: &mut [u8]) -> Result<()> {
        while !dst.is_empty() {
            let read = positional::read(&self.inner, dst, off)?;
            if read == 0 {
                return Err(StoreError::Io(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                )));
            }
            let rest = dst;
            dst = &mut rest[read..];
            off += read as u64;
        }
        Ok(())
    }

    fn write_at(&self, mut off: u64, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let written = positional::write(&self.inner, src, off)?;
            if written == 0 {
                return Err(StoreError::Io(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                )));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all().map_err(StoreError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.set_len(len).map_err(StoreError::from)
    }
}

/// Volatile [`FileIo`] kept in memory.
///
/// Clones share the same buffer, so a clone kept by a test observes what the
/// store wrote. Writes can be made to fail to exercise error paths.
#[derive(Clone, Default)]
pub struct MemFileIo {
    bytes: Arc<Mutex<Vec<u8>>>,
    fail_writes: Arc<AtomicBool>,
    writes_left: Arc<Mutex<Option<u64>>>,
}

impl MemFileIo {
    /// Creates an empty in-memory file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with an I/O error. Clearing it also
    /// clears a budget set by [`fail_writes_after`](Self::fail_writes_after).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
        if !fail {
            *self.writes_left.lock() = None;
        }
    }

    /// Lets `count` more writes through, then fails every write after them.
    pub fn fail_writes_after(&self, count: u64) {
        *self.writes_left.lock() = Some(count);
    }

    /// Returns a copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl FileIo for MemFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let start = off as usize;
        let end = start
            .checked_add(dst.len())
            .ok_or(StoreError::Invalid("read offset overflow"))?;
        if end > bytes.len() {
            return Err(StoreError::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                "read_at reached EOF",
            )));
        }
        dst.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let exhausted = match self.writes_left.lock().as_mut() {
            Some(0) => true,
            Some(left) => {
                *left -= 1;
                false
            }
            None => false,
        };
        if exhausted || self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(io::Error::new(
                ErrorKind::Other,
                "injected write failure",
            )));
        }
        let mut bytes = self.bytes.lock();
        let start = off as usize;
        let end = start + src.len();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.bytes.lock().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.bytes.lock().resize(len as usize, 0);
        Ok(())
    }
}
