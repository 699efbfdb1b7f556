use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::{ReadFile, Storage, StorageError, WriteFile};

/// Local-filesystem backend rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        if path.trim().is_empty()
            || path.starts_with('/')
            || path.split('/').any(|c| c.is_empty() || c == "..")
        {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(path))
    }
}

impl Storage for FsStorage {
    fn open_read(&self, path: &str) -> Result<Box<dyn ReadFile>, StorageError> {
        let full = self.resolve(path)?;
        match File::open(&full) {
            Ok(file) => Ok(Box::new(FsReadFile { file })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(err) => Err(classify_io(err)),
        }
    }

    fn open_write(&self, path: &str) -> Result<Box<dyn WriteFile>, StorageError> {
        let full = self.resolve(path)?;
        let parent = full
            .parent()
            .ok_or_else(|| StorageError::InvalidPath(path.to_string()))?;
        std::fs::create_dir_all(parent).map_err(classify_io)?;

        let mut tmp = full.clone();
        let file_name = full
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| StorageError::InvalidPath(path.to_string()))?;
        tmp.set_file_name(format!("{file_name}.tmp.{}", std::process::id()));

        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .map_err(classify_io)?;

        Ok(Box::new(FsWriteFile {
            file: Some(file),
            tmp,
            dest: full,
            saved: false,
        }))
    }
}

struct FsReadFile {
    file: File,
}

impl ReadFile for FsReadFile {
    fn size(&mut self) -> Result<u64, StorageError> {
        Ok(self.file.metadata().map_err(classify_io)?.len())
    }

    fn read_at(&mut self, dst: &mut [u8], pos: u64) -> Result<(), StorageError> {
        self.file
            .seek(SeekFrom::Start(pos))
            .map_err(classify_io)?;
        self.file.read_exact(dst).map_err(classify_io)?;
        Ok(())
    }
}

/// Writes to a temp sibling; `save` syncs and renames into place, so a saved
/// file is either fully present or absent, and re-runs overwrite cleanly.
struct FsWriteFile {
    file: Option<File>,
    tmp: PathBuf,
    dest: PathBuf,
    saved: bool,
}

impl WriteFile for FsWriteFile {
    fn write(&mut self, src: &[u8]) -> Result<(), StorageError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StorageError::InvalidPath("write after save".to_string()))?;
        file.write_all(src).map_err(classify_io)?;
        Ok(())
    }

    fn save(&mut self) -> Result<(), StorageError> {
        let file = self
            .file
            .take()
            .ok_or_else(|| StorageError::InvalidPath("save called twice".to_string()))?;
        file.sync_all().map_err(classify_io)?;
        drop(file);
        std::fs::rename(&self.tmp, &self.dest).map_err(classify_io)?;
        self.saved = true;
        Ok(())
    }
}

impl Drop for FsWriteFile {
    fn drop(&mut self) {
        if !self.saved {
            let _ = std::fs::remove_file(&self.tmp);
        }
    }
}

fn classify_io(err: std::io::Error) -> StorageError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            StorageError::Transient(err.to_string())
        }
        _ => StorageError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(test_name: &str) -> anyhow::Result<PathBuf> {
        let mut root = std::env::temp_dir();
        root.push(format!(
            "kino-store-{test_name}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ));
        std::fs::create_dir_all(&root)?;
        Ok(root)
    }

    #[test]
    fn write_then_read_round_trips() -> anyhow::Result<()> {
        let store = FsStorage::new(temp_root("round-trip")?);
        store.write_all("jobs/j/v/c/0", b"hello")?;

        let mut file = store.open_read("jobs/j/v/c/0")?;
        assert_eq!(file.size()?, 5);
        let mut buf = [0u8; 3];
        file.read_at(&mut buf, 2)?;
        assert_eq!(&buf, b"llo");
        Ok(())
    }

    #[test]
    fn unsaved_write_is_invisible() -> anyhow::Result<()> {
        let store = FsStorage::new(temp_root("unsaved")?);
        {
            let mut file = store.open_write("partial")?;
            file.write(b"half")?;
            // dropped without save
        }
        assert!(matches!(
            store.open_read("partial"),
            Err(StorageError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn saved_write_overwrites_existing() -> anyhow::Result<()> {
        let store = FsStorage::new(temp_root("overwrite")?);
        store.write_all("out", b"first")?;
        store.write_all("out", b"second")?;
        assert_eq!(store.read_all("out")?, b"second");
        Ok(())
    }

    #[test]
    fn missing_file_is_not_found() -> anyhow::Result<()> {
        let store = FsStorage::new(temp_root("missing")?);
        assert!(matches!(
            store.open_read("nope"),
            Err(StorageError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn path_escape_is_rejected() -> anyhow::Result<()> {
        let store = FsStorage::new(temp_root("escape")?);
        assert!(matches!(
            store.open_read("../outside"),
            Err(StorageError::InvalidPath(_))
        ));
        assert!(matches!(
            store.open_write("/absolute"),
            Err(StorageError::InvalidPath(_))
        ));
        Ok(())
    }
}
