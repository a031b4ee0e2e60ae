//! Storage backends the agent performs real I/O against

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::info;

/// Byte-addressed storage behind the agent
pub trait Backend: Send {
    /// Size in bytes
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill all of `buf` from `offset`
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Persist all of `buf` at `offset`
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn check_bounds(len: u64, offset: u64, count: usize) -> io::Result<()> {
    match offset.checked_add(count as u64) {
        Some(end) if end <= len => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} bytes at offset {} exceed backend size {}", count, offset, len),
        )),
    }
}

/// Regular file (or block device node) on the host
pub struct FileBackend {
    file: File,
    path: PathBuf,
    len: u64,
}

impl FileBackend {
    /// Open `path`, creating it and growing it to `len` bytes if needed
    pub fn open(path: impl AsRef<Path>, len: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let current = file.metadata()?.len();
        if current < len {
            file.set_len(len)?;
            info!(path = %path.display(), from = current, to = len, "Grew backing file");
        }

        Ok(Self { file, path, len })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Backend for FileBackend {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_bounds(self.len, offset, buf.len())?;
        self.file.read_exact_at(buf, offset)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        check_bounds(self.len, offset, buf.len())?;
        self.file.write_all_at(buf, offset)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// Volatile in-memory storage
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    data: Vec<u8>,
}

impl MemoryBackend {
    pub fn new(len: usize) -> Self {
        Self { data: vec![0u8; len] }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Backend for MemoryBackend {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_bounds(self.len(), offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        check_bounds(self.len(), offset, buf.len())?;
        let start = offset as usize;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_backend_bounds() {
        let mut backend = MemoryBackend::new(1024);
        backend.write_at(1000, &[1u8; 24]).unwrap();
        assert!(backend.write_at(1001, &[1u8; 24]).is_err());

        let mut out = [0u8; 24];
        backend.read_at(1000, &mut out).unwrap();
        assert_eq!(out, [1u8; 24]);
    }

    #[test]
    fn test_file_backend_grows_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");

        {
            let mut backend = FileBackend::open(&path, 8192).unwrap();
            assert_eq!(backend.len(), 8192);
            backend.write_at(4096, b"relay").unwrap();
            backend.flush().unwrap();
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8192);

        let mut backend = FileBackend::open(&path, 8192).unwrap();
        let mut out = [0u8; 5];
        backend.read_at(4096, &mut out).unwrap();
        assert_eq!(&out, b"relay");
        assert!(backend.read_at(8190, &mut out).is_err());
    }
}
