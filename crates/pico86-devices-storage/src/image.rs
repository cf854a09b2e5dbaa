//! Disk image backends: in-memory and file-backed.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("no drive at index {0}")]
    NoSuchDrive(usize),
    #[error("access beyond end of image: offset {offset} len {len} size {size}")]
    OutOfRange { offset: u64, len: usize, size: u64 },
    #[error("image size {0} is not usable for this drive kind")]
    BadImageSize(u64),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A random-access drive backing store. Assumed non-blocking at the
/// millisecond scale; INT 13h transfers run synchronously against it.
pub trait DiskImage {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DiskError>;
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), DiskError>;
}

fn check_range(offset: u64, len: usize, size: u64) -> Result<(), DiskError> {
    if offset.checked_add(len as u64).map_or(true, |end| end > size) {
        return Err(DiskError::OutOfRange { offset, len, size });
    }
    Ok(())
}

/// RAM-backed image, used by tests and for small boot floppies.
pub struct MemDisk {
    data: Vec<u8>,
}

impl MemDisk {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn zeroed(len: usize) -> Self {
        Self {
            data: vec![0; len],
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl DiskImage for MemDisk {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DiskError> {
        check_range(offset, buf.len(), self.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), DiskError> {
        check_range(offset, data.len(), self.len())?;
        let start = offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// File-backed image for the native front end.
pub struct FileDisk {
    file: File,
    len: u64,
}

impl FileDisk {
    pub fn open(path: &Path, writable: bool) -> Result<Self, DiskError> {
        let file = File::options()
            .read(true)
            .write(writable)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl DiskImage for FileDisk {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DiskError> {
        check_range(offset, buf.len(), self.len)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), DiskError> {
        check_range(offset, data.len(), self.len)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }
}
