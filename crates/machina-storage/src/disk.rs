use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const SECTOR_SIZE: usize = 512;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DiskError {
    #[error("access at {offset:#x}+{len} exceeds capacity {capacity:#x}")]
    OutOfBounds { offset: u64, len: usize, capacity: u64 },
    #[error("offset arithmetic overflowed")]
    OffsetOverflow,
    #[error("medium is read-only")]
    ReadOnly,
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, DiskError>;

/// Byte-addressed random-access storage behind the boot medium and the BIOS
/// disk services.
pub trait VirtualDisk: Send {
    fn capacity_bytes(&self) -> u64;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        if end > self.capacity_bytes() {
            return Err(DiskError::OutOfBounds {
                offset,
                len,
                capacity: self.capacity_bytes(),
            });
        }
        Ok(())
    }
}

impl VirtualDisk for Box<dyn VirtualDisk> {
    fn capacity_bytes(&self) -> u64 {
        (**self).capacity_bytes()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// A disk image held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemDisk {
    bytes: Vec<u8>,
    read_only: bool,
}

impl MemDisk {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, read_only: false }
    }

    pub fn read_only(bytes: Vec<u8>) -> Self {
        Self { bytes, read_only: true }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl VirtualDisk for MemDisk {
    fn capacity_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(DiskError::ReadOnly);
        }
        self.check_bounds(offset, buf.len())?;
        let start = offset as usize;
        self.bytes[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

/// A read-only disk backed by a host file.
#[derive(Debug)]
pub struct FileDisk {
    file: File,
    len: u64,
    writable: bool,
}

impl FileDisk {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len, writable: false })
    }

    pub fn open_rw(path: &Path) -> std::io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len, writable: true })
    }
}

impl VirtualDisk for FileDisk {
    fn capacity_bytes(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.check_bounds(offset, buf.len())?;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| DiskError::Io(e.to_string()))?;
        self.file
            .read_exact(buf)
            .map_err(|e| DiskError::Io(e.to_string()))?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(DiskError::ReadOnly);
        }
        self.check_bounds(offset, buf.len())?;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| DiskError::Io(e.to_string()))?;
        self.file
            .write_all(buf)
            .map_err(|e| DiskError::Io(e.to_string()))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush().map_err(|e| DiskError::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_disk_roundtrips_and_respects_read_only() {
        let mut disk = MemDisk::new(vec![0; 1024]);
        disk.write_at(512, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        disk.read_at(512, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        let mut ro = MemDisk::read_only(vec![0; 512]);
        assert_eq!(ro.write_at(0, &[1]), Err(DiskError::ReadOnly));
    }

    #[test]
    fn out_of_bounds_is_reported_not_truncated() {
        let mut disk = MemDisk::new(vec![0; 512]);
        let mut buf = [0u8; 16];
        let err = disk.read_at(504, &mut buf).unwrap_err();
        assert!(matches!(err, DiskError::OutOfBounds { .. }));
    }
}
