//! In-memory storage. Primarily a test vehicle: it survives "crashes"
//! (dropping the database without closing it), allows byte-level corruption,
//! and never touches a disk.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Error, Result};

use super::{file_name, FileDesc, RandomAccessFile, Storage, WritableFile};

type FileBuf = Arc<RwLock<Vec<u8>>>;

/// A storage namespace held entirely in memory. Cloneable via `Arc`; all
/// clones observe the same files, so a test can reopen a "crashed" database.
#[derive(Default)]
pub struct MemStorage {
    files: Mutex<HashMap<String, FileBuf>>,
    lock: Mutex<bool>,
}

impl MemStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn get(&self, fd: FileDesc) -> Result<FileBuf> {
        self.files
            .lock()?
            .get(&file_name(fd))
            .cloned()
            .ok_or_else(|| Error::Io(format!("no such file: {}", file_name(fd))))
    }

    /// Snapshot of a file's bytes. Test hook.
    pub fn content(&self, fd: FileDesc) -> Result<Vec<u8>> {
        Ok(self.get(fd)?.read()?.clone())
    }

    /// Flips the given bits of a file in place. Test hook for corruption
    /// scenarios.
    pub fn flip_bit(&self, fd: FileDesc, offset: usize) -> Result<()> {
        let buf = self.get(fd)?;
        let mut bytes = buf.write()?;
        if offset >= bytes.len() {
            return Err(Error::InvalidArgument(format!(
                "offset {offset} beyond file of {} bytes",
                bytes.len()
            )));
        }
        bytes[offset] ^= 0x80;
        Ok(())
    }

    /// Truncates a file to `len` bytes. Test hook.
    pub fn truncate(&self, fd: FileDesc, len: usize) -> Result<()> {
        let buf = self.get(fd)?;
        buf.write()?.truncate(len);
        Ok(())
    }
}

impl Storage for MemStorage {
    fn list(&self) -> Result<Vec<FileDesc>> {
        Ok(self
            .files
            .lock()?
            .keys()
            .filter_map(|name| super::parse_file_name(name))
            .collect())
    }

    fn create(&self, fd: FileDesc) -> Result<Box<dyn WritableFile>> {
        let buf: FileBuf = Arc::new(RwLock::new(Vec::new()));
        self.files.lock()?.insert(file_name(fd), buf.clone());
        Ok(Box::new(MemWritableFile { buf }))
    }

    fn open_sequential(&self, fd: FileDesc) -> Result<Box<dyn super::SequentialFile>> {
        let buf = self.get(fd)?;
        Ok(Box::new(MemSequentialFile { buf, pos: 0 }))
    }

    fn open_random(&self, fd: FileDesc) -> Result<Box<dyn RandomAccessFile>> {
        let buf = self.get(fd)?;
        Ok(Box::new(MemRandomAccessFile { buf }))
    }

    fn remove(&self, fd: FileDesc) -> Result<()> {
        self.files
            .lock()?
            .remove(&file_name(fd))
            .map(|_| ())
            .ok_or_else(|| Error::Io(format!("no such file: {}", file_name(fd))))
    }

    fn rename(&self, from: FileDesc, to: FileDesc) -> Result<()> {
        let mut files = self.files.lock()?;
        let buf = files
            .remove(&file_name(from))
            .ok_or_else(|| Error::Io(format!("no such file: {}", file_name(from))))?;
        files.insert(file_name(to), buf);
        Ok(())
    }

    fn size(&self, fd: FileDesc) -> Result<u64> {
        Ok(self.get(fd)?.read()?.len() as u64)
    }

    fn exists(&self, fd: FileDesc) -> bool {
        self.files
            .lock()
            .map(|files| files.contains_key(&file_name(fd)))
            .unwrap_or(false)
    }

    fn lock(&self) -> Result<()> {
        let mut locked = self.lock.lock()?;
        if *locked {
            return Err(Error::Io("storage already locked".into()));
        }
        *locked = true;
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        *self.lock.lock()? = false;
        Ok(())
    }
}

struct MemWritableFile {
    buf: FileBuf,
}

impl Write for MemWritableFile {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf
            .write()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WritableFile for MemWritableFile {
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

struct MemSequentialFile {
    buf: FileBuf,
    pos: usize,
}

impl io::Read for MemSequentialFile {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let buf = self
            .buf
            .read()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let remaining = buf.len().saturating_sub(self.pos);
        let n = remaining.min(out.len());
        out[..n].copy_from_slice(&buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

struct MemRandomAccessFile {
    buf: FileBuf,
}

impl RandomAccessFile for MemRandomAccessFile {
    fn read_at(&self, offset: u64, out: &mut [u8]) -> Result<usize> {
        let buf = self.buf.read()?;
        let offset = offset as usize;
        let remaining = buf.len().saturating_sub(offset);
        let n = remaining.min(out.len());
        out[..n].copy_from_slice(&buf[offset..offset + n]);
        Ok(n)
    }
}
