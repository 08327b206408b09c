//! Durable key-value storage for engine state.

use dashmap::DashMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum KvStoreError {
    #[error("no such key: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// A byte-oriented key-value store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>, KvStoreError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), KvStoreError>;
}

/// Volatile store, mostly useful in tests.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryKeyValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, KvStoreError> {
        self.entries
            .get(key)
            .map(|v| v.value().clone())
            .ok_or_else(|| KvStoreError::NotFound(key.to_string()))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), KvStoreError> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// Stores one file per key below a directory.
#[derive(Debug, Clone)]
pub struct FileSystemKeyValueStore {
    base_dir: PathBuf,
}

impl FileSystemKeyValueStore {
    /// Open (creating if needed) a store rooted at `base_dir`.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, KvStoreError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.base_dir.join(name)
    }
}

impl KeyValueStore for FileSystemKeyValueStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, KvStoreError> {
        match std::fs::read(self.path_for(key)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(KvStoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), KvStoreError> {
        let path = self.path_for(key);
        // Write then rename so readers never observe a torn file.
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        debug!(key, bytes = value.len(), "kvstore set");
        Ok(())
    }
}
