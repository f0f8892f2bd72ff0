//! Pluggable storage: a flat namespace of typed, numbered files.
//!
//! The engine never touches paths directly. It asks a [`Storage`] for typed
//! files — tables, journals, manifests, the CURRENT pointer, temp files and
//! the advisory LOCK — identified by a [`FileDesc`]. The filesystem
//! implementation lives in [`fs`]; [`mem`] keeps everything in memory for
//! tests and diskless embeddings.

pub mod fs;
pub mod mem;

use std::io::{Read, Write};

use crate::error::{Error, Result};

/// The role of a file within the database directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// Sorted string table, `<num>.ldb`
    Table,
    /// Write-ahead journal, `<num>.log`
    Journal,
    /// Version-edit log, `MANIFEST-<num>`
    Manifest,
    /// Pointer to the live manifest, `CURRENT`
    Current,
    /// Scratch file that gets renamed or removed, `<num>.tmp`
    Temp,
    /// Advisory exclusive lock, `LOCK`
    Lock,
}

/// A typed file identifier. `CURRENT` and `LOCK` are singletons; their
/// number is zero by convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileDesc {
    pub kind: FileKind,
    pub num: u64,
}

impl FileDesc {
    pub fn new(kind: FileKind, num: u64) -> Self {
        Self { kind, num }
    }

    pub const CURRENT: FileDesc = FileDesc {
        kind: FileKind::Current,
        num: 0,
    };

    pub const LOCK: FileDesc = FileDesc {
        kind: FileKind::Lock,
        num: 0,
    };
}

/// Canonical file name for a descriptor.
pub fn file_name(fd: FileDesc) -> String {
    match fd.kind {
        FileKind::Table => format!("{:06}.ldb", fd.num),
        FileKind::Journal => format!("{:06}.log", fd.num),
        FileKind::Manifest => format!("MANIFEST-{:06}", fd.num),
        FileKind::Current => "CURRENT".to_string(),
        FileKind::Temp => format!("{:06}.tmp", fd.num),
        FileKind::Lock => "LOCK".to_string(),
    }
}

/// Parses a canonical file name. Unknown names yield `None` so foreign files
/// in the directory are ignored rather than treated as corruption.
pub fn parse_file_name(name: &str) -> Option<FileDesc> {
    match name {
        "CURRENT" => return Some(FileDesc::CURRENT),
        "LOCK" => return Some(FileDesc::LOCK),
        _ => {}
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        let num = rest.parse().ok()?;
        return Some(FileDesc::new(FileKind::Manifest, num));
    }
    let (stem, ext) = name.split_once('.')?;
    let num = stem.parse().ok()?;
    let kind = match ext {
        "ldb" => FileKind::Table,
        "log" => FileKind::Journal,
        "tmp" => FileKind::Temp,
        _ => return None,
    };
    Some(FileDesc::new(kind, num))
}

/// An append-only output file.
pub trait WritableFile: Write + Send {
    /// Flushes buffered bytes and makes everything written so far durable.
    fn sync(&mut self) -> Result<()>;
}

impl WritableFile for Box<dyn WritableFile> {
    fn sync(&mut self) -> Result<()> {
        (**self).sync()
    }
}

/// A forward-only input file.
pub trait SequentialFile: Read + Send {}

impl<T: Read + Send> SequentialFile for T {}

/// A positionally readable file, shared across threads.
pub trait RandomAccessFile: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`, returning the count read.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Reads exactly `buf.len()` bytes at `offset`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read_at(offset + done as u64, &mut buf[done..])?;
            if n == 0 {
                return Err(Error::Io("unexpected end of file".into()));
            }
            done += n;
        }
        Ok(())
    }
}

/// A namespace of typed files. Implementations are exchangeable; the engine
/// holds exactly one and acquires its advisory lock for its whole lifetime.
pub trait Storage: Send + Sync + 'static {
    /// Every recognized file currently in the namespace.
    fn list(&self) -> Result<Vec<FileDesc>>;

    /// Files of one kind, in ascending number order.
    fn list_kind(&self, kind: FileKind) -> Result<Vec<FileDesc>> {
        let mut files: Vec<_> = self.list()?.into_iter().filter(|f| f.kind == kind).collect();
        files.sort_by_key(|f| f.num);
        Ok(files)
    }

    /// Creates (or truncates) a file and returns its writer.
    fn create(&self, fd: FileDesc) -> Result<Box<dyn WritableFile>>;

    /// Opens a file for streaming reads from the start.
    fn open_sequential(&self, fd: FileDesc) -> Result<Box<dyn SequentialFile>>;

    /// Opens a file for positioned reads.
    fn open_random(&self, fd: FileDesc) -> Result<Box<dyn RandomAccessFile>>;

    fn remove(&self, fd: FileDesc) -> Result<()>;

    fn rename(&self, from: FileDesc, to: FileDesc) -> Result<()>;

    fn size(&self, fd: FileDesc) -> Result<u64>;

    fn exists(&self, fd: FileDesc) -> bool;

    /// Takes the namespace's exclusive advisory lock.
    fn lock(&self) -> Result<()>;

    /// Releases the advisory lock.
    fn unlock(&self) -> Result<()>;
}

/// Reads a small file fully into memory, e.g. `CURRENT`.
pub fn read_file_to_vec(storage: &dyn Storage, fd: FileDesc) -> Result<Vec<u8>> {
    let mut reader = storage.open_sequential(fd)?;
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Writes `data` to a temp file, syncs it, and renames it over `target`.
/// A crash mid-way leaves at worst a stray temp file, never a torn target.
pub fn write_file_atomic(
    storage: &dyn Storage,
    temp_num: u64,
    target: FileDesc,
    data: &[u8],
) -> Result<()> {
    let temp = FileDesc::new(FileKind::Temp, temp_num);
    let result = (|| {
        let mut writer = storage.create(temp)?;
        writer.write_all(data)?;
        writer.sync()?;
        Ok(())
    })();
    match result {
        Ok(()) => storage.rename(temp, target),
        Err(err) => {
            let _ = storage.remove(temp);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_roundtrip() {
        let descs = [
            FileDesc::new(FileKind::Table, 7),
            FileDesc::new(FileKind::Journal, 123456),
            FileDesc::new(FileKind::Manifest, 2),
            FileDesc::new(FileKind::Temp, 9),
            FileDesc::CURRENT,
            FileDesc::LOCK,
        ];
        for fd in descs {
            assert_eq!(parse_file_name(&file_name(fd)), Some(fd), "{fd:?}");
        }
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert_eq!(parse_file_name("LOG.old"), None);
        assert_eq!(parse_file_name("000001.sst"), None);
        assert_eq!(parse_file_name("MANIFEST-abc"), None);
        assert_eq!(parse_file_name("readme.txt"), None);
        assert_eq!(parse_file_name(""), None);
    }

    #[test]
    fn test_names_are_zero_padded() {
        assert_eq!(file_name(FileDesc::new(FileKind::Table, 42)), "000042.ldb");
        assert_eq!(
            file_name(FileDesc::new(FileKind::Manifest, 1)),
            "MANIFEST-000001"
        );
    }
}
