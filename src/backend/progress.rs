use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::info;
use serde::{Deserialize, Serialize};

use super::lock;
use super::store::{load_json, save_json};
use crate::config::app_dir;
use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ProgressFile {
    #[serde(default)]
    chapters: BTreeMap<String, usize>,
}

/// Last-read page per chapter, persisted as JSON.
///
/// Chapter keys are opaque: local chapters use their directory path,
/// remote ones `<source>:<chapter id>`.
pub struct ProgressStore {
    path: PathBuf,
    data: ProgressFile,
    revision: u64,
    /// Revision of the last snapshot written to disk.
    written: Arc<Mutex<u64>>,
}

/// Store contents captured by [`ProgressStore::record`], written later,
/// typically from the blocking pool.
pub struct ProgressSnapshot {
    path: PathBuf,
    data: ProgressFile,
    revision: u64,
    written: Arc<Mutex<u64>>,
}

impl ProgressSnapshot {
    /// Writes the snapshot unless a newer one already reached the disk.
    pub fn write(self) -> Result<()> {
        let mut written = lock(&self.written);
        if *written >= self.revision {
            return Ok(());
        }
        save_json(&self.path, &self.data)?;
        *written = self.revision;
        Ok(())
    }
}

impl ProgressStore {
    pub fn default_path() -> PathBuf {
        app_dir().join("progress.json")
    }

    pub fn open(path: &Path) -> Self {
        let data: ProgressFile = load_json(path);
        info!(
            "Loaded reading progress for {} chapters from {}",
            data.chapters.len(),
            path.display()
        );
        Self {
            path: path.to_path_buf(),
            data,
            revision: 0,
            written: Arc::new(Mutex::new(0)),
        }
    }

    /// Saved page index, 0 for a chapter never opened.
    pub fn load(&self, chapter_key: &str) -> usize {
        self.data.chapters.get(chapter_key).copied().unwrap_or(0)
    }

    /// Saved page index clamped to a chapter of `page_count` pages, which may
    /// have shrunk since the index was saved.
    pub fn load_clamped(&self, chapter_key: &str, page_count: usize) -> usize {
        self.load(chapter_key).min(page_count.saturating_sub(1))
    }

    /// Updates the index in memory. Returns a snapshot to write when it changed.
    pub fn record(&mut self, chapter_key: &str, index: usize) -> Option<ProgressSnapshot> {
        if self.data.chapters.get(chapter_key) == Some(&index) {
            return None;
        }
        self.data.chapters.insert(chapter_key.to_string(), index);
        self.revision += 1;
        Some(ProgressSnapshot {
            path: self.path.clone(),
            data: self.data.clone(),
            revision: self.revision,
            written: self.written.clone(),
        })
    }

    pub fn save(&mut self, chapter_key: &str, index: usize) -> Result<()> {
        match self.record(chapter_key, index) {
            Some(snapshot) => snapshot.write(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_unknown_chapter_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::open(&dir.path().join("progress.json"));
        assert_eq!(store.load("chapter"), 0);
    }

    #[test]
    fn test_saved_progress_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("progress.json");

        let mut store = ProgressStore::open(&path);
        store.save("/manga/ch1", 12).unwrap();
        store.save("mangadex:abc", 3).unwrap();
        store.save("/manga/ch1", 14).unwrap();

        let reopened = ProgressStore::open(&path);
        assert_eq!(reopened.load("/manga/ch1"), 14);
        assert_eq!(reopened.load("mangadex:abc"), 3);
    }

    #[test]
    fn test_load_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProgressStore::open(&dir.path().join("progress.json"));
        store.save("ch", 30).unwrap();

        assert_eq!(store.load_clamped("ch", 20), 19);
        assert_eq!(store.load_clamped("ch", 40), 30);
        assert_eq!(store.load_clamped("ch", 0), 0);
    }

    #[test]
    fn test_older_snapshot_does_not_overwrite_newer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let mut store = ProgressStore::open(&path);

        let older = store.record("ch", 4).unwrap();
        let newer = store.record("ch", 5).unwrap();
        assert!(store.record("ch", 5).is_none());

        newer.write().unwrap();
        older.write().unwrap();
        assert_eq!(ProgressStore::open(&path).load("ch"), 5);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        fs::write(&path, "{ nope").unwrap();

        let mut store = ProgressStore::open(&path);
        assert_eq!(store.load("ch"), 0);
        store.save("ch", 2).unwrap();
        assert_eq!(ProgressStore::open(&path).load("ch"), 2);
    }
}
