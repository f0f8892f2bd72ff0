//! Filesystem-backed storage: one database directory, canonical file names,
//! and an advisory `LOCK` file guarding against a second process.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

use crate::error::{Error, Result};

use super::{file_name, parse_file_name, FileDesc, RandomAccessFile, Storage, WritableFile};

/// Storage rooted at a directory on the local filesystem.
pub struct FsStorage {
    dir: PathBuf,
    lock: Mutex<Option<FileLock>>,
}

impl FsStorage {
    /// Opens (creating if needed) the database directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: Mutex::new(None),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, fd: FileDesc) -> PathBuf {
        self.dir.join(file_name(fd))
    }
}

impl Storage for FsStorage {
    fn list(&self) -> Result<Vec<FileDesc>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(fd) = parse_file_name(name) {
                    files.push(fd);
                }
            }
        }
        Ok(files)
    }

    fn create(&self, fd: FileDesc) -> Result<Box<dyn WritableFile>> {
        let file = File::create(self.path(fd))?;
        Ok(Box::new(FsWritableFile { file }))
    }

    fn open_sequential(&self, fd: FileDesc) -> Result<Box<dyn super::SequentialFile>> {
        let file = File::open(self.path(fd))?;
        Ok(Box::new(io::BufReader::new(file)))
    }

    fn open_random(&self, fd: FileDesc) -> Result<Box<dyn RandomAccessFile>> {
        let file = File::open(self.path(fd))?;
        Ok(Box::new(FsRandomAccessFile::new(file)))
    }

    fn remove(&self, fd: FileDesc) -> Result<()> {
        fs::remove_file(self.path(fd))?;
        Ok(())
    }

    fn rename(&self, from: FileDesc, to: FileDesc) -> Result<()> {
        fs::rename(self.path(from), self.path(to))?;
        Ok(())
    }

    fn size(&self, fd: FileDesc) -> Result<u64> {
        Ok(fs::metadata(self.path(fd))?.len())
    }

    fn exists(&self, fd: FileDesc) -> bool {
        self.path(fd).exists()
    }

    fn lock(&self) -> Result<()> {
        let mut guard = self.lock.lock()?;
        if guard.is_some() {
            return Err(Error::Io("database already locked by this process".into()));
        }
        *guard = Some(FileLock::acquire(self.path(FileDesc::LOCK))?);
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        self.lock.lock()?.take();
        Ok(())
    }
}

struct FsWritableFile {
    file: File,
}

impl Write for FsWritableFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl WritableFile for FsWritableFile {
    fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(unix)]
struct FsRandomAccessFile {
    file: File,
}

#[cfg(unix)]
impl FsRandomAccessFile {
    fn new(file: File) -> Self {
        Self { file }
    }
}

#[cfg(unix)]
impl RandomAccessFile for FsRandomAccessFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read_at(buf, offset)?)
    }
}

// Without pread the file cursor is shared, so positioned reads serialize.
#[cfg(not(unix))]
struct FsRandomAccessFile {
    file: Mutex<File>,
}

#[cfg(not(unix))]
impl FsRandomAccessFile {
    fn new(file: File) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }
}

#[cfg(not(unix))]
impl RandomAccessFile for FsRandomAccessFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = self.file.lock()?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(file.read(buf)?)
    }
}

/// Advisory exclusive lock on the database directory. The lock file holds
/// the owning process id for debugging.
struct FileLock {
    _file: File,
}

impl FileLock {
    fn acquire(path: PathBuf) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Self::try_lock(&file)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(Self { _file: file })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(Error::Io(format!(
                "failed to lock database directory: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> Result<()> {
        // No advisory locking on this platform; the in-process mutex in
        // FsStorage still prevents double-open from the same process.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileKind;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_create_write_read_roundtrip() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let storage = FsStorage::open(dir.path())?;
        let fd = FileDesc::new(FileKind::Table, 1);

        let mut writer = storage.create(fd)?;
        writer.write_all(b"hello table")?;
        writer.sync()?;
        drop(writer);

        assert_eq!(storage.size(fd)?, 11);

        let mut buf = [0u8; 5];
        let reader = storage.open_random(fd)?;
        reader.read_exact_at(6, &mut buf)?;
        assert_eq!(&buf, b"table");

        let mut all = Vec::new();
        storage.open_sequential(fd)?.read_to_end(&mut all)?;
        assert_eq!(all, b"hello table");
        Ok(())
    }

    #[test]
    fn test_list_ignores_foreign_files() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let storage = FsStorage::open(dir.path())?;
        storage
            .create(FileDesc::new(FileKind::Journal, 3))?
            .sync()?;
        fs::write(dir.path().join("notes.txt"), b"not ours").unwrap();

        let files = storage.list()?;
        assert_eq!(files, vec![FileDesc::new(FileKind::Journal, 3)]);
        Ok(())
    }

    #[test]
    fn test_rename_installs_target() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let storage = FsStorage::open(dir.path())?;
        let temp = FileDesc::new(FileKind::Temp, 5);
        let target = FileDesc::CURRENT;

        let mut writer = storage.create(temp)?;
        writer.write_all(b"MANIFEST-000005\n")?;
        writer.sync()?;
        drop(writer);

        storage.rename(temp, target)?;
        assert!(!storage.exists(temp));
        let content = super::super::read_file_to_vec(&storage, target)?;
        assert_eq!(content, b"MANIFEST-000005\n");
        Ok(())
    }

    #[test]
    fn test_lock_is_exclusive_within_process() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let storage = FsStorage::open(dir.path())?;
        storage.lock()?;
        assert!(storage.lock().is_err());
        storage.unlock()?;
        storage.lock()?;
        storage.unlock()?;
        Ok(())
    }

    #[test]
    fn test_remove_missing_file_errors() {
        let dir = TempDir::new().expect("temp dir");
        let storage = FsStorage::open(dir.path()).unwrap();
        assert!(storage.remove(FileDesc::new(FileKind::Table, 404)).is_err());
    }
}
