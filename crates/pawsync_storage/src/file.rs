//! File-based backend for the on-device replica.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A byte store persisted in a single file.
///
/// `sync()` calls `File::sync_all()`; callers decide how often to pay for it
/// (the local store syncs after every committed write by default).
///
/// `replace()` writes the new contents to a sibling `.compact` file, syncs
/// it and renames it over the original. A leftover `.compact` file from an
/// interrupted replace is removed on open.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    inner: Mutex<FileState>,
}

#[derive(Debug)]
struct FileState {
    file: File,
    size: u64,
}

impl FileBackend {
    /// Opens or creates the file at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories or the file cannot be created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        match std::fs::remove_file(compaction_path(path)) {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(FileState { file, size }),
        })
    }

    /// Returns the path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn compaction_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".compact");
    path.with_file_name(name)
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> StorageResult<()> {
    Ok(())
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut state = self.inner.lock();
        let size = state.size;
        let end = offset.saturating_add(len as u64);
        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        state.file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        state.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let state = self.inner.get_mut();
        let offset = state.size;
        if data.is_empty() {
            return Ok(offset);
        }

        state.file.seek(SeekFrom::End(0))?;
        state.file.write_all(data)?;
        state.size += data.len() as u64;
        Ok(offset)
    }

    fn sync(&mut self) -> StorageResult<()> {
        let state = self.inner.get_mut();
        state.file.flush()?;
        state.file.sync_all()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.inner.lock().size)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let state = self.inner.get_mut();
        if new_size > state.size {
            return Err(StorageError::TruncatePastEnd {
                requested: new_size,
                size: state.size,
            });
        }
        state.file.set_len(new_size)?;
        state.file.sync_all()?;
        state.size = new_size;
        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        let temp_path = compaction_path(&self.path);
        {
            let mut temp = File::create(&temp_path)?;
            temp.write_all(data)?;
            temp.sync_all()?;
        }
        std::fs::rename(&temp_path, &self.path)?;
        sync_parent(&self.path)?;

        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let state = self.inner.get_mut();
        state.file = file;
        state.size = data.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_nested_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replica").join("pawsync.log");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
        assert_eq!(backend.path(), path);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pawsync.log");

        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.append(b"medication").unwrap();
            backend.sync().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 10);
        assert_eq!(backend.read_all().unwrap(), b"medication");
    }

    #[test]
    fn truncate_then_append() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("log")).unwrap();
        backend.append(b"old-bytes").unwrap();
        backend.truncate(0).unwrap();
        assert_eq!(backend.append(b"new").unwrap(), 0);
        assert_eq!(backend.read_at(0, 3).unwrap(), b"new");
        assert!(matches!(
            backend.read_at(2, 5),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn replace_swaps_contents_durably() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pawsync.log");
        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.append(b"feeding-feeding-feeding").unwrap();
            backend.replace(b"feeding").unwrap();
            assert_eq!(backend.append(b"+walk").unwrap(), 7);
            backend.sync().unwrap();
        }
        assert!(!dir.path().join("pawsync.log.compact").exists());

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.read_all().unwrap(), b"feeding+walk");
    }

    #[test]
    fn interrupted_replace_keeps_the_original() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pawsync.log");
        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.append(b"vaccination").unwrap();
            backend.sync().unwrap();
        }
        let leftover = dir.path().join("pawsync.log.compact");
        std::fs::write(&leftover, b"half").unwrap();

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.read_all().unwrap(), b"vaccination");
        assert!(!leftover.exists());
    }
}
