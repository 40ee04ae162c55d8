//! Bounded, rewrite-on-write flat-file persistence.
//!
//! Generalizes the ring-buffer-plus-full-rewrite idiom (read the whole file
//! in, mutate an in-memory buffer, rewrite the whole file out) to an
//! arbitrary JSON-serializable record type. Both the chat history store's
//! file backend and the task scheduler's per-session task files are backed
//! by this primitive: neither needs anything fancier than "whole-file
//! read-modify-write behind a mutex," and crash safety was never a goal for
//! either (no fsync, no journaling, no cross-process lock).

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A JSON array of `T` persisted at `path`, capped at `max_entries` (oldest
/// dropped first) when a cap is set.
pub struct FlatFileStore<T> {
    path: PathBuf,
    max_entries: Option<usize>,
    lock: Mutex<()>,
    _marker: PhantomData<T>,
}

impl<T> FlatFileStore<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    pub fn new(path: impl Into<PathBuf>, max_entries: Option<usize>) -> Self {
        Self {
            path: path.into(),
            max_entries,
            lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record currently on disk. Missing file reads as empty.
    pub fn read_all(&self) -> io::Result<Vec<T>> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        self.read_locked()
    }

    /// Replace the entire file contents with `items`, applying the cap.
    pub fn write_all(&self, items: Vec<T>) -> io::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        self.write_locked(items)
    }

    /// Read, apply `f` to the in-memory vector, write back. `f` may append,
    /// filter, or mutate in place; the cap is re-applied after `f` runs.
    pub fn update<F>(&self, f: F) -> io::Result<()>
    where
        F: FnOnce(&mut Vec<T>),
    {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut items = self.read_locked()?;
        f(&mut items);
        self.write_locked(items)
    }

    fn read_locked(&self) -> io::Result<Vec<T>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                if contents.trim().is_empty() {
                    return Ok(Vec::new());
                }
                serde_json::from_str(&contents)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn write_locked(&self, mut items: Vec<T>) -> io::Result<()> {
        if let Some(max) = self.max_entries {
            if items.len() > max {
                let drop = items.len() - max;
                items.drain(0..drop);
            }
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let serialized = serde_json::to_string_pretty(&items)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        // Write to a sibling temp file and rename over the target so a
        // reader never observes a half-written file, even though we make no
        // durability claim beyond that (no fsync).
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, serialized)?;
        fs::rename(&tmp_path, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Rec {
        id: u32,
        text: String,
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        let store: FlatFileStore<Rec> = FlatFileStore::new(dir.path().join("x.json"), None);
        assert!(store.read_all().unwrap().is_empty());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let store: FlatFileStore<Rec> = FlatFileStore::new(dir.path().join("x.json"), None);
        store
            .write_all(vec![Rec { id: 1, text: "a".into() }])
            .unwrap();
        let read = store.read_all().unwrap();
        assert_eq!(read, vec![Rec { id: 1, text: "a".into() }]);
    }

    #[test]
    fn cap_drops_oldest_first() {
        let dir = tempdir().unwrap();
        let store: FlatFileStore<Rec> = FlatFileStore::new(dir.path().join("x.json"), Some(2));
        store
            .write_all(vec![
                Rec { id: 1, text: "a".into() },
                Rec { id: 2, text: "b".into() },
                Rec { id: 3, text: "c".into() },
            ])
            .unwrap();
        let read = store.read_all().unwrap();
        assert_eq!(read, vec![Rec { id: 2, text: "b".into() }, Rec { id: 3, text: "c".into() }]);
    }

    #[test]
    fn update_appends_and_reapplies_cap() {
        let dir = tempdir().unwrap();
        let store: FlatFileStore<Rec> = FlatFileStore::new(dir.path().join("x.json"), Some(1));
        store.update(|items| items.push(Rec { id: 1, text: "a".into() })).unwrap();
        store.update(|items| items.push(Rec { id: 2, text: "b".into() })).unwrap();
        let read = store.read_all().unwrap();
        assert_eq!(read, vec![Rec { id: 2, text: "b".into() }]);
    }
}
