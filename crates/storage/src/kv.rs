use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use snafu::{ResultExt, ensure};

use super::KeyValueStore;
use super::error::{
    CreateDirectorySnafu, InvalidKeySnafu, ReadKeySnafu, RenameTempFileSnafu, StorageResult,
    WriteKeySnafu,
};

/// One file per key under a data directory.
///
/// Writes land in a temporary sibling first and are then renamed over the
/// target, so a crash mid-write leaves the previous value intact.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    root: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str, stage: &'static str) -> StorageResult<PathBuf> {
        ensure!(
            is_valid_key(key),
            InvalidKeySnafu {
                stage,
                key: key.to_string(),
            }
        );
        Ok(self.root.join(key))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn read(&self, key: &str) -> StorageResult<Option<String>> {
        let path = self.key_path(key, "file-kv-read-key")?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(source).context(ReadKeySnafu {
                stage: "file-kv-read",
                key: key.to_string(),
                path,
            }),
        }
    }

    fn write(&self, key: &str, value: &str) -> StorageResult<()> {
        let path = self.key_path(key, "file-kv-write-key")?;
        std::fs::create_dir_all(&self.root).context(CreateDirectorySnafu {
            stage: "file-kv-create-directory",
            path: self.root.clone(),
        })?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, value).context(WriteKeySnafu {
            stage: "file-kv-write-temporary",
            key: key.to_string(),
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &path).context(RenameTempFileSnafu {
            stage: "file-kv-rename-temporary",
            from: temp_path,
            to: path,
        })
    }
}

/// Process-local store, handy for tests and throwaway runs.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn read(&self, key: &str) -> StorageResult<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

// Keys double as file names, so keep them to a portable character set.
fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|character| character.is_ascii_alphanumeric() || matches!(character, '_' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageError;

    #[test]
    fn missing_file_reads_as_none() {
        let directory = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::new(directory.path());
        assert_eq!(store.read("chat_sessions").unwrap(), None);
    }

    #[test]
    fn write_creates_directory_and_replaces_value() {
        let directory = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::new(directory.path().join("nested").join("data"));

        store.write("current_model", "llama2").unwrap();
        store.write("current_model", "mistral").unwrap();

        assert_eq!(
            store.read("current_model").unwrap().as_deref(),
            Some("mistral")
        );
        assert!(!store.root().join("current_model.tmp").exists());
    }

    #[test]
    fn path_like_keys_are_rejected() {
        let directory = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::new(directory.path());
        let error = store.write("../escape", "x").unwrap_err();
        assert!(matches!(error, StorageError::InvalidKey { .. }));
    }

    #[test]
    fn memory_store_keeps_last_write() {
        let store = MemoryKeyValueStore::new();
        store.write("k", "1").unwrap();
        store.write("k", "2").unwrap();
        assert_eq!(store.read("k").unwrap().as_deref(), Some("2"));
        assert_eq!(store.read("other").unwrap(), None);
    }
}
