//! File-backed JSON state store.
//!
//! One JSON document per file inside a per-project state directory. A
//! disabled store accepts every write and answers every read with `None`,
//! which is how persistence is switched off without touching the managers.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::error::StoreError;

pub const LOCK_FILE: &str = "execution-lock.json";
pub const QUEUE_FILE: &str = "execution-queue.json";
pub const HISTORY_FILE: &str = "execution-history.json";

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: Option<PathBuf>,
}

impl StateStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        info!(path = %dir.display(), "state store initialized");
        Ok(Self {
            dir: Some(dir.to_path_buf()),
        })
    }

    /// A store that persists nothing.
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn path(&self, name: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(name))
    }

    /// Read and decode a document. A missing file is `Ok(None)`.
    pub fn read<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StoreError> {
        let Some(path) = self.path(name) else {
            return Ok(None);
        };
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&data)?))
    }

    /// Encode and write a document, replacing any previous version.
    pub fn write<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        let Some(path) = self.path(name) else {
            return Ok(());
        };
        let data = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Delete a document. Deleting a missing document succeeds.
    pub fn remove(&self, name: &str) -> Result<(), StoreError> {
        let Some(path) = self.path(name) else {
            return Ok(());
        };
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        count: u32,
    }

    #[test]
    fn read_missing_file_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        let doc: Option<Doc> = store.read("absent.json").unwrap();
        assert!(doc.is_none());
    }

    #[test]
    fn write_then_read() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        let doc = Doc {
            name: "a".to_string(),
            count: 3,
        };
        store.write("doc.json", &doc).unwrap();
        assert_eq!(store.read::<Doc>("doc.json").unwrap(), Some(doc));
        assert!(!tmp.path().join("doc.json.tmp").exists());
    }

    #[test]
    fn open_creates_nested_dir() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join(".baton").join("state");
        let store = StateStore::open(&dir).unwrap();
        assert!(dir.is_dir());
        assert_eq!(store.dir(), Some(dir.as_path()));
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("doc.json"), "{not json").unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        assert!(matches!(
            store.read::<Doc>("doc.json"),
            Err(StoreError::Json(_))
        ));
    }

    #[test]
    fn remove_missing_is_ok() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        store.remove("nothing.json").unwrap();
    }

    #[test]
    fn disabled_store_is_inert() {
        let store = StateStore::disabled();
        assert!(!store.is_enabled());
        store
            .write(
                "doc.json",
                &Doc {
                    name: "x".into(),
                    count: 1,
                },
            )
            .unwrap();
        assert!(store.read::<Doc>("doc.json").unwrap().is_none());
        store.remove("doc.json").unwrap();
    }
}
