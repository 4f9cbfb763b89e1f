//! Positioned file I/O used by the pager.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use crate::error::Result;

/// A file handle supporting offset reads and writes without seeking shared
/// cursor state, so concurrent readers never interfere.
#[derive(Debug)]
pub struct FileHandle {
    file: File,
}

impl FileHandle {
    /// Opens (creating if absent) a file in read-write mode.
    pub fn open_rw(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file })
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        imp::read_exact_at(&self.file, offset, buf)?;
        Ok(())
    }

    pub fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        imp::write_all_at(&self.file, offset, buf)?;
        Ok(())
    }

    pub(crate) fn raw(&self) -> &File {
        &self.file
    }
}

#[cfg(unix)]
mod imp {
    use super::*;
    use std::os::unix::fs::FileExt;

    pub fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        file.read_exact_at(buf, offset)
    }

    pub fn write_all_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<()> {
        file.write_all_at(buf, offset)
    }
}

#[cfg(windows)]
mod imp {
    use super::*;
    use std::io::ErrorKind;
    use std::os::windows::fs::FileExt;

    pub fn read_exact_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let read = file.seek_read(buf, offset)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            offset += read as u64;
            buf = &mut buf[read..];
        }
        Ok(())
    }

    pub fn write_all_at(file: &File, mut offset: u64, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let written = file.seek_write(buf, offset)?;
            offset += written as u64;
            buf = &buf[written..];
        }
        Ok(())
    }
}
