//! Ciphertext backends.

use crate::error::{StorageError, StorageResult};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Raw byte storage underneath the secure store. Backends only ever see
/// ciphertext.
pub trait BlobBackend: Send + Sync {
    fn read(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Replaces the value for `key`. Implementations must not leave a
    /// half-written value behind if they fail part-way.
    fn write(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Removes `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> StorageResult<()>;

    fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.read(key)?.is_some())
    }
}

/// One file per key, named by the SHA-256 of the key so that key names
/// (which include entity types) do not leak onto the filesystem.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Opens (and creates if needed) a backend rooted at `dir`.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name = hex::encode(Sha256::digest(key.as_bytes()));
        self.dir.join(format!("{name}.bin"))
    }
}

impl BlobBackend for FileBackend {
    fn read(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");

        // Write-then-rename: the old value stays readable until the new one
        // is fully on disk.
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(value)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp, &path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            StorageError::Io(format!("failed to replace {}: {e}", path.display()))
        })
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.path_for(key).exists())
    }
}

/// In-memory backend (for testing).
#[derive(Default)]
pub struct MemoryBackend {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the stored ciphertext for `key` directly, bypassing
    /// encryption.
    pub fn put_raw(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        self.lock()?.insert(key.to_string(), value);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.values
            .lock()
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }
}

impl BlobBackend for MemoryBackend {
    fn read(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn write(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.lock()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}
