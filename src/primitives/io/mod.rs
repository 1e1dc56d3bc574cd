#![forbid(unsafe_code)]
//! Positioned file access for the transaction log.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind, IoSlice},
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::trace;

use crate::types::{Result, SombraError};

/// Positioned reads and writes against a single file.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` from `off`; running past the end is `UnexpectedEof`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Writes consecutive slices starting at `off`.
    fn writev_at(&self, mut off: u64, bufs: &[IoSlice<'_>]) -> Result<()> {
        for slice in bufs.iter().filter(|s| !s.is_empty()) {
            self.write_at(off, slice)?;
            off = off
                .checked_add(slice.len() as u64)
                .ok_or(SombraError::Invalid("writev offset overflow"))?;
        }
        Ok(())
    }
    /// Flushes data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current file length.
    fn len(&self) -> Result<u64>;
    /// True when the file holds no bytes.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Cuts or extends the file to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
}

/// [`FileIo`] over a shared `std::fs::File`.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
    path: Arc<PathBuf>,
}

impl StdFileIo {
    /// Opens `path` read-write, creating it when missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        trace!(path = %path.display(), "io.open");
        Ok(Self {
            inner: Arc::new(file),
            path: Arc::new(path.to_path_buf()),
        })
    }

    /// Opens `name` inside `dir`, creating the directory first.
    pub fn open_in(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        Self::open(dir.join(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self) -> &File {
        &self.inner
    }
}

#[cfg(unix)]
fn positioned_read(file: &File, buf: &mut [u8], off: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, off)
}

#[cfg(unix)]
fn positioned_write(file: &File, buf: &[u8], off: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, off)
}

#[cfg(windows)]
fn positioned_read(file: &File, buf: &mut [u8], off: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, off)
}

#[cfg(windows)]
fn positioned_write(file: &File, buf: &[u8], off: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, off)
}

impl FileIo for StdFileIo {
    fn read_at(&self, mut off: u64, mut dst: &mut [u8]) -> Result<()> {
        while !dst.is_empty() {
            let read = positioned_read(self.file(), dst, off)?;
            if read == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "read reached EOF").into());
            }
            dst = &mut dst[read..];
            off += read as u64;
        }
        Ok(())
    }

    fn write_at(&self, mut off: u64, mut src: &[u8]) -> Result<()> {
        trace!(off, len = src.len(), "io.write_at");
        while !src.is_empty() {
            let written = positioned_write(self.file(), src, off)?;
            if written == 0 {
                return Err(io::Error::new(ErrorKind::WriteZero, "write stalled").into());
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        self.file().sync_all()?;
        trace!(path = %self.path.display(), "io.sync_all");
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file().metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file().set_len(len)?;
        Ok(())
    }
}
