//! Snapshot storage for bucket definitions and usage state.
//!
//! Both snapshots are whole-document JSON files, rewritten in full on every
//! save. There is no append log; a crash loses whatever changed since the
//! last write.

use crate::error::RateLimitError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Abstract storage for one snapshot document.
pub trait SnapshotStore<T>: Send + Sync + fmt::Debug {
    /// Read the stored document. `Ok(None)` means nothing has been written yet.
    fn load(&self) -> Result<Option<T>, RateLimitError>;

    /// Replace the stored document.
    fn save(&self, value: &T) -> Result<(), RateLimitError>;
}

/// Pretty-printed JSON file.
pub struct JsonFileStore<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T> {
    /// Store backed by `path`. Parent directories are created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), _marker: PhantomData }
    }

    /// Location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> RateLimitError {
        RateLimitError::Persistence { path: self.path.clone(), source }
    }
}

impl<T> fmt::Debug for JsonFileStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonFileStore").field("path", &self.path).finish()
    }
}

impl<T> SnapshotStore<T> for JsonFileStore<T>
where
    T: Serialize + DeserializeOwned,
{
    fn load(&self) -> Result<Option<T>, RateLimitError> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        Ok(Some(serde_json::from_str(&data)?))
    }

    fn save(&self, value: &T) -> Result<(), RateLimitError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let json = serde_json::to_string_pretty(value)?;
        // Write-then-rename so a reader never sees a half-written document.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))
    }
}

/// In-memory store, mostly for tests.
#[derive(Debug, Clone)]
pub struct MemoryStore<T> {
    value: Arc<Mutex<Option<T>>>,
    saves: Arc<AtomicUsize>,
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self { value: Arc::new(Mutex::new(None)), saves: Arc::new(AtomicUsize::new(0)) }
    }
}

impl<T: Clone> MemoryStore<T> {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a document, as if written by a previous run.
    pub fn with_value(value: T) -> Self {
        let store = Self::default();
        *store.value.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
        store
    }

    /// Current document.
    pub fn get(&self) -> Option<T> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl<T> SnapshotStore<T> for MemoryStore<T>
where
    T: Clone + Send + fmt::Debug,
{
    fn load(&self) -> Result<Option<T>, RateLimitError> {
        Ok(self.value.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, value: &T) -> Result<(), RateLimitError> {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = Some(value.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn file_store_round_trips_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonFileStore<HashMap<String, u32>> =
            JsonFileStore::new(dir.path().join("nested").join("data.json"));
        assert!(store.load().unwrap().is_none());

        let mut value = HashMap::new();
        value.insert("a".to_string(), 1);
        store.save(&value).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\n  \"a\": 1"), "expected pretty output, got {raw}");
        assert_eq!(store.load().unwrap(), Some(value));
    }

    #[test]
    fn file_store_reports_corrupt_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        let store: JsonFileStore<HashMap<String, u32>> = JsonFileStore::new(path);
        let err = store.load().unwrap_err();
        assert!(matches!(err, RateLimitError::Serialization(_)));
    }

    #[test]
    fn memory_store_counts_saves() {
        let store = MemoryStore::new();
        store.save(&1u8).unwrap();
        store.save(&2u8).unwrap();
        assert_eq!(store.get(), Some(2));
        assert_eq!(store.save_count(), 2);
    }
}
